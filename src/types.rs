//! Core types for marge-bot
//!
//! Every remote resource is held as an immutable snapshot. Code that needs
//! current state refetches through the platform service instead of mutating
//! a shared handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// The identity the bot acts as
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User id
    pub id: u64,
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Public email, if any
    pub email: Option<String>,
}

/// Project settings the engine cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    /// Project id
    pub id: u64,
    /// `group/project` path
    pub path_with_namespace: String,
    /// Whether the project refuses merges without a green pipeline
    pub only_allow_merge_if_pipeline_succeeds: bool,
}

/// Merge request lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MrState {
    /// Open and mergeable in principle
    Opened,
    /// Already merged
    Merged,
    /// Closed without merging
    Closed,
    /// Locked by the platform while merging
    Locked,
}

impl MrState {
    /// Parse GitLab's state string
    pub fn from_api(state: &str) -> Self {
        match state {
            "opened" | "reopened" => Self::Opened,
            "merged" => Self::Merged,
            "locked" => Self::Locked,
            _ => Self::Closed,
        }
    }

    /// GitLab's name for the state
    pub const fn as_api(self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Merged => "merged",
            Self::Closed => "closed",
            Self::Locked => "locked",
        }
    }
}

impl std::fmt::Display for MrState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_api())
    }
}

/// Snapshot of a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequest {
    /// Global id
    pub id: u64,
    /// Project-scoped id
    pub iid: u64,
    /// Target project id
    pub project_id: u64,
    /// Source project id (differs from `project_id` for forks)
    pub source_project_id: u64,
    /// Title
    pub title: String,
    /// Branch holding the changes
    pub source_branch: String,
    /// Branch the changes go into
    pub target_branch: String,
    /// Head commit of the source branch
    pub sha: String,
    /// Lifecycle state
    pub state: MrState,
    /// Draft / work-in-progress flag
    pub work_in_progress: bool,
    /// Assignees
    pub assignee_ids: Vec<u64>,
    /// Author
    pub author_id: u64,
    /// Squash-on-merge flag
    pub squash: bool,
    /// Web URL
    pub web_url: String,
    /// Creation time
    pub created_at: Option<DateTime<Utc>>,
}

impl MergeRequest {
    /// Whether the bot is among the assignees
    pub fn is_assigned_to(&self, user_id: u64) -> bool {
        self.assignee_ids.contains(&user_id)
    }
}

/// A user who approved a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approver {
    /// Login name
    pub username: String,
    /// Display name
    pub name: String,
    /// Public email, if any
    pub email: Option<String>,
}

/// Approval summary of a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Approvals {
    /// Merge request iid these approvals belong to
    pub iid: u64,
    /// Approvals required by the project rules
    pub approvals_required: u32,
    /// Approvals still missing
    pub approvals_left: u32,
    /// Who approved
    pub approved_by: Vec<Approver>,
}

impl Approvals {
    /// Enough people approved
    pub const fn sufficient(&self) -> bool {
        self.approvals_left == 0
    }

    /// `Name <email>` for every approver, falling back to the username
    pub fn reviewer_identities(&self) -> Vec<String> {
        self.approved_by
            .iter()
            .map(|a| {
                let email = a
                    .email
                    .clone()
                    .unwrap_or_else(|| format!("{}@users.noreply", a.username));
                format!("{} <{email}>", a.name)
            })
            .collect()
    }
}

/// CI pipeline status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineStatus {
    /// Created, not yet queued
    Created,
    /// Waiting for a runner
    Pending,
    /// Running
    Running,
    /// Passed
    Success,
    /// Failed
    Failed,
    /// Canceled
    Canceled,
    /// Skipped
    Skipped,
    /// Waiting for a manual action
    Manual,
}

impl PipelineStatus {
    /// Parse GitLab's status string
    pub fn from_api(status: &str) -> Self {
        match status {
            "created" | "waiting_for_resource" | "preparing" | "scheduled" => Self::Created,
            "pending" => Self::Pending,
            "running" => Self::Running,
            "success" => Self::Success,
            "canceled" => Self::Canceled,
            "skipped" => Self::Skipped,
            "manual" => Self::Manual,
            _ => Self::Failed,
        }
    }

    /// Counts as green
    pub const fn is_green(self) -> bool {
        matches!(self, Self::Success | Self::Skipped)
    }

    /// Still going somewhere; poll again later
    pub const fn is_in_progress(self) -> bool {
        matches!(self, Self::Created | Self::Pending | Self::Running)
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Canceled => "canceled",
            Self::Skipped => "skipped",
            Self::Manual => "manual",
        };
        f.write_str(s)
    }
}

/// Snapshot of a CI pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pipeline {
    /// Pipeline id
    pub id: u64,
    /// Owning project
    pub project_id: u64,
    /// Ref the pipeline ran for
    pub ref_name: String,
    /// Commit the pipeline tested
    pub sha: String,
    /// Status at fetch time
    pub status: PipelineStatus,
}

/// Sort direction for searches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    /// Oldest first
    Asc,
    /// Newest first
    Desc,
}

impl SortOrder {
    /// GitLab's parameter value
    pub const fn as_api(self) -> &'static str {
        match self {
            Self::Asc => "asc",
            Self::Desc => "desc",
        }
    }
}

/// Search filter for merge requests
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeRequestQuery {
    /// Required state
    pub state: MrState,
    /// Labels the request must carry
    pub labels: Vec<String>,
    /// Author filter
    pub author_id: Option<u64>,
    /// Assignee filter
    pub assignee_id: Option<u64>,
    /// Sort direction on `created_at`
    pub sort: SortOrder,
}

impl MergeRequestQuery {
    /// Open requests, oldest first
    pub const fn opened() -> Self {
        Self {
            state: MrState::Opened,
            labels: Vec::new(),
            author_id: None,
            assignee_id: None,
            sort: SortOrder::Asc,
        }
    }
}

/// Payload for creating a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMergeRequest {
    /// Source branch
    pub source_branch: String,
    /// Target branch
    pub target_branch: String,
    /// Title
    pub title: String,
    /// Labels
    pub labels: Vec<String>,
}

/// Search filter for pipelines
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineQuery {
    /// Ref the pipelines ran for
    pub ref_name: String,
    /// Only pipelines for this commit
    pub sha: Option<String>,
}

/// Parameters for accepting a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptOptions {
    /// Refuse to merge unless the head is exactly this commit
    pub sha: String,
    /// Delete the source branch after merging
    pub should_remove_source_branch: bool,
    /// Squash on merge
    pub squash: bool,
}

/// Result of accepting a merge request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeResult {
    /// Whether the merge happened
    pub merged: bool,
    /// New tip of the target branch, if the platform reports it
    pub sha: Option<String>,
    /// Message from the platform (especially on failure)
    pub message: Option<String>,
}

/// How to combine a source branch with its target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fusion {
    /// Rebase the source onto the target, then fast-forward
    #[default]
    Rebase,
    /// Merge the target into the source with a merge commit
    Merge,
}

impl std::fmt::Display for Fusion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rebase => write!(f, "rebase"),
            Self::Merge => write!(f, "merge"),
        }
    }
}

/// Default name of the ephemeral batch branch
pub const DEFAULT_BATCH_BRANCH_NAME: &str = "marge_bot_batch_merge_job";

/// Default title of the batch merge request
pub const DEFAULT_BATCH_MR_TITLE: &str = "Marge Bot Batch MR - DO NOT TOUCH";

/// Knobs for merge jobs
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::struct_excessive_bools)]
pub struct JobOptions {
    /// Rebase or merge
    pub fusion: Fusion,
    /// Add `Reviewed-by` trailers for approvers
    pub add_reviewers: bool,
    /// Add a `Tested-by` trailer pointing at the bot
    pub add_tested: bool,
    /// Add a `Part-of` trailer pointing at the merge request
    pub add_part_of: bool,
    /// Delete the source branch on accept
    pub remove_source_branch: bool,
    /// Interval between CI status polls
    pub ci_poll_interval: Duration,
    /// Overall wait for a single CI run
    pub ci_timeout: Duration,
    /// Attempts per request before giving up
    pub max_attempts: u32,
    /// Base delay between attempts (multiplied by the attempt number)
    pub retry_backoff: Duration,
    /// Combine requests with a common target into one CI run
    pub batch: bool,
    /// Name of the ephemeral batch branch
    pub batch_branch_name: String,
    /// Title of the batch merge request
    pub batch_mr_title: String,
    /// Git remote the bot pushes to
    pub remote: String,
}

impl Default for JobOptions {
    fn default() -> Self {
        Self {
            fusion: Fusion::Rebase,
            add_reviewers: false,
            add_tested: false,
            add_part_of: false,
            remove_source_branch: false,
            ci_poll_interval: Duration::from_secs(10),
            ci_timeout: Duration::from_secs(15 * 60),
            max_attempts: 3,
            retry_backoff: Duration::from_secs(5),
            batch: false,
            batch_branch_name: DEFAULT_BATCH_BRANCH_NAME.to_string(),
            batch_mr_title: DEFAULT_BATCH_MR_TITLE.to_string(),
            remote: "origin".to_string(),
        }
    }
}

impl JobOptions {
    /// Any trailer is configured, so commits get rewritten
    pub const fn rewrites_commits(&self) -> bool {
        self.add_reviewers || self.add_tested || self.add_part_of
    }

    /// `<remote>/<branch>`
    pub fn remote_ref(&self, branch: &str) -> String {
        format!("{}/{branch}", self.remote)
    }
}
