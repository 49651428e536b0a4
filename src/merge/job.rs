//! Single merge request orchestration
//!
//! [`SingleRequestOrchestrator`] is the per-request capability shared by the
//! solo [`MergeJob`] and the batch fan-out. [`RequestOrchestrator`] is the
//! real implementation on top of the platform and git bindings.

use crate::error::{BYPASS_MESSAGE, Error, Result};
use crate::git::GitRepo;
use crate::merge::fuse::Fuser;
use crate::merge::gate::{GateMode, MergeRequestGate, Readiness};
use crate::merge::pipeline::PipelineTracker;
use crate::platform::PlatformService;
use crate::types::{AcceptOptions, JobOptions, MergeRequest, MrState, Project, User};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Source branch after fusing, before it is pushed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fused {
    /// Target tip the source was fused onto
    pub base: String,
    /// New head of the source branch
    pub head: String,
}

/// Per-request steps shared by solo and batch jobs
#[async_trait]
pub trait SingleRequestOrchestrator: Send + Sync {
    /// Policy gate
    async fn ensure_mergeable(&self, request: &MergeRequest, mode: GateMode) -> Result<Readiness>;

    /// Refetch `recorded` and fail if it moved since the snapshot was taken
    async fn ensure_unchanged(&self, recorded: &MergeRequest) -> Result<MergeRequest>;

    /// Fail with the bypass error unless the remote target tip is `expected`
    async fn ensure_target_at(&self, target_branch: &str, expected: &str) -> Result<()>;

    /// Fuse the source onto the remote target tip and add trailers
    async fn fuse(&self, request: &MergeRequest, expected_base: Option<&str>) -> Result<Fused>;

    /// Force-push the fused source branch and wait for the platform to see it
    async fn push(&self, request: &MergeRequest, head: &str) -> Result<()>;

    /// Wait for a green pipeline on exactly `sha`
    async fn await_ci(&self, branch: &str, sha: &str) -> Result<()>;

    /// Verify nothing raced us, then merge through the platform.
    /// Returns the new target tip.
    async fn accept(&self, request: &MergeRequest, head: &str, expected_target: &str)
    -> Result<String>;

    /// Cancel pipelines on `branch` for `sha` that nobody needs any more
    async fn cancel_superseded(&self, branch: &str, sha: &str) -> Result<()>;
}

/// Orchestrator backed by a platform service and a git working copy
pub struct RequestOrchestrator<'a> {
    platform: &'a dyn PlatformService,
    git: &'a dyn GitRepo,
    user: &'a User,
    project: &'a Project,
    options: &'a JobOptions,
}

/// Attempts at seeing our own push reflected in the merge request
const PUSH_SYNC_ATTEMPTS: u32 = 10;
/// Delay between those attempts
const PUSH_SYNC_DELAY: Duration = Duration::from_secs(1);

impl<'a> RequestOrchestrator<'a> {
    /// Create an orchestrator for the bot `user` on `project`
    pub const fn new(
        platform: &'a dyn PlatformService,
        git: &'a dyn GitRepo,
        user: &'a User,
        project: &'a Project,
        options: &'a JobOptions,
    ) -> Self {
        Self {
            platform,
            git,
            user,
            project,
            options,
        }
    }

    const fn gate(&self) -> MergeRequestGate<'a> {
        MergeRequestGate::new(self.platform, self.user, self.project, self.options)
    }

    const fn fuser(&self) -> Fuser<'a> {
        Fuser::new(self.git, self.options)
    }

    const fn pipelines(&self) -> PipelineTracker<'a> {
        PipelineTracker::new(self.platform)
    }
}

fn changed(what: &str) -> Error {
    Error::CannotMerge(format!("The {what} changed whilst merging!"))
}

#[async_trait]
impl SingleRequestOrchestrator for RequestOrchestrator<'_> {
    async fn ensure_mergeable(&self, request: &MergeRequest, mode: GateMode) -> Result<Readiness> {
        self.gate().ensure_mergeable(request, mode).await
    }

    async fn ensure_unchanged(&self, recorded: &MergeRequest) -> Result<MergeRequest> {
        debug!(mr_iid = recorded.iid, "ensuring MR did not change");
        let fresh = self.platform.get_merge_request(recorded.iid).await?;
        if fresh.source_branch != recorded.source_branch {
            return Err(changed("source branch"));
        }
        if fresh.source_project_id != recorded.source_project_id {
            return Err(changed("source project"));
        }
        if fresh.target_branch != recorded.target_branch {
            return Err(changed("target branch"));
        }
        if fresh.sha != recorded.sha {
            warn!(
                mr_iid = recorded.iid,
                recorded = %recorded.sha,
                actual = %fresh.sha,
                "source branch rewritten behind our back"
            );
            return Err(Error::CannotMerge(BYPASS_MESSAGE.to_string()));
        }
        Ok(fresh)
    }

    async fn ensure_target_at(&self, target_branch: &str, expected: &str) -> Result<()> {
        self.git.fetch(&self.options.remote)?;
        self.fuser()
            .ensure_base(&self.options.remote_ref(target_branch), expected)
    }

    async fn fuse(&self, request: &MergeRequest, expected_base: Option<&str>) -> Result<Fused> {
        let remote_target = self.options.remote_ref(&request.target_branch);
        let remote_source = self.options.remote_ref(&request.source_branch);

        self.git.fetch(&self.options.remote)?;
        let base = self.git.get_commit_hash(&remote_target)?;
        self.git
            .checkout_branch(&request.source_branch, &remote_source)?;

        // The remote source must still be the commit the gate looked at
        let source_head = self.git.get_commit_hash(&request.source_branch)?;
        if source_head != request.sha {
            return Err(Error::CannotMerge(BYPASS_MESSAGE.to_string()));
        }

        let fuser = self.fuser();
        fuser.fuse(&request.source_branch, &remote_target, expected_base)?;

        let head = if self.options.rewrites_commits() {
            let approvals = self.platform.get_approvals(request.iid).await?;
            fuser.add_trailers(request, &approvals, self.user, &base)?
        } else {
            self.git.get_commit_hash(&request.source_branch)?
        };
        debug!(mr_iid = request.iid, %base, %head, "fused");
        Ok(Fused { base, head })
    }

    async fn push(&self, request: &MergeRequest, head: &str) -> Result<()> {
        info!(mr_iid = request.iid, branch = %request.source_branch, "pushing");
        self.git.push(&request.source_branch, None, true)?;

        for _ in 0..PUSH_SYNC_ATTEMPTS {
            let fresh = self.platform.get_merge_request(request.iid).await?;
            if fresh.sha == head {
                return Ok(());
            }
            sleep(PUSH_SYNC_DELAY).await;
        }
        Err(Error::CannotBatch(
            "GitLab did not pick up the pushed commit in time".to_string(),
        ))
    }

    async fn await_ci(&self, branch: &str, sha: &str) -> Result<()> {
        if !self.project.only_allow_merge_if_pipeline_succeeds {
            debug!(branch, "project does not require CI, not waiting");
            return Ok(());
        }
        self.pipelines()
            .wait_for_success(
                branch,
                sha,
                self.options.ci_poll_interval,
                self.options.ci_timeout,
            )
            .await
            .map(|_| ())
    }

    async fn accept(
        &self,
        request: &MergeRequest,
        head: &str,
        expected_target: &str,
    ) -> Result<String> {
        let current = self.platform.get_branch_head(&request.target_branch).await?;
        if current != expected_target {
            warn!(
                mr_iid = request.iid,
                expected = expected_target,
                actual = %current,
                "target branch moved before accept"
            );
            return Err(Error::bypassed());
        }

        let fresh = self.platform.get_merge_request(request.iid).await?;
        match fresh.state {
            MrState::Opened => {}
            MrState::Merged => {
                return Err(Error::CannotMerge(
                    "The merge request was merged by someone else!".to_string(),
                ));
            }
            MrState::Closed | MrState::Locked => {
                return Err(Error::CannotMerge(
                    "Someone closed the merge request while I was attempting to merge it."
                        .to_string(),
                ));
            }
        }
        if fresh.target_branch != request.target_branch {
            return Err(changed("target branch"));
        }
        if fresh.sha != head {
            warn!(mr_iid = request.iid, head, actual = %fresh.sha, "source moved after push");
            return Err(Error::CannotMerge(BYPASS_MESSAGE.to_string()));
        }
        if !fresh.is_assigned_to(self.user.id) {
            return Err(Error::CannotMerge(
                "It is not assigned to me anymore!".to_string(),
            ));
        }

        let result = self
            .platform
            .accept_merge_request(
                request.iid,
                &AcceptOptions {
                    sha: head.to_string(),
                    should_remove_source_branch: self.options.remove_source_branch,
                    squash: fresh.squash,
                },
            )
            .await?;
        if !result.merged {
            let reason = result
                .message
                .unwrap_or_else(|| "GitLab refused to merge".to_string());
            return Err(Error::CannotBatch(reason));
        }

        let tip = result.sha.unwrap_or_else(|| head.to_string());
        info!(mr_iid = request.iid, %tip, "merged");
        Ok(tip)
    }

    async fn cancel_superseded(&self, branch: &str, sha: &str) -> Result<()> {
        let cancelled = self.pipelines().cancel_unfinished(branch, sha).await?;
        if cancelled > 0 {
            debug!(branch, sha, cancelled, "cancelled superseded pipelines");
        }
        Ok(())
    }
}

/// Where a [`MergeJob`] is in its life
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Fresh snapshot taken
    Init,
    /// Policy satisfied
    Gated,
    /// Source fused onto target
    Fused,
    /// Source pushed
    Pushed,
    /// Waiting for CI on the pushed commit
    AwaitingCi,
    /// Merged; carries the new target tip
    Accepted(String),
    /// Going round again after a transient failure
    Retry(String),
    /// Gave up
    Failed(String),
}

impl JobState {
    /// No more transitions will happen
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Accepted(_) | Self::Failed(_))
    }
}

/// Merges one request: gate, fuse, push, wait for CI, accept
///
/// Transient failures restart from a fresh snapshot up to
/// [`JobOptions::max_attempts`] times.
pub struct MergeJob<'a> {
    orchestrator: &'a dyn SingleRequestOrchestrator,
    platform: &'a dyn PlatformService,
    options: &'a JobOptions,
    history: Vec<JobState>,
}

impl<'a> MergeJob<'a> {
    /// Create a job driving `orchestrator`
    pub const fn new(
        orchestrator: &'a dyn SingleRequestOrchestrator,
        platform: &'a dyn PlatformService,
        options: &'a JobOptions,
    ) -> Self {
        Self {
            orchestrator,
            platform,
            options,
            history: Vec::new(),
        }
    }

    /// Current state
    pub fn state(&self) -> &JobState {
        self.history.last().unwrap_or(&JobState::Init)
    }

    /// Every state the job passed through, in order
    pub fn history(&self) -> &[JobState] {
        &self.history
    }

    fn enter(&mut self, state: JobState) {
        debug!(?state, "job state");
        self.history.push(state);
    }

    /// Run the job for merge request `iid` to a terminal state
    ///
    /// Returns the new target tip on success.
    pub async fn run(&mut self, iid: u64) -> Result<String> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut pushed: Option<(String, String)> = None;
        let mut attempt = 1;

        loop {
            let err = match self.attempt(iid, &mut pushed).await {
                Ok(tip) => {
                    self.enter(JobState::Accepted(tip.clone()));
                    return Ok(tip);
                }
                Err(err) => err,
            };

            if !err.is_retryable() || attempt >= max_attempts {
                let err = escalate(err);
                warn!(mr_iid = iid, attempt, error = %err, "giving up");
                self.enter(JobState::Failed(err.to_string()));
                return Err(err);
            }

            info!(mr_iid = iid, attempt, error = %err, "retrying");
            self.enter(JobState::Retry(err.to_string()));
            sleep(self.options.retry_backoff * attempt).await;
            attempt += 1;
        }
    }

    async fn attempt(&mut self, iid: u64, pushed: &mut Option<(String, String)>) -> Result<String> {
        self.enter(JobState::Init);
        let request = self.platform.get_merge_request(iid).await?;

        let readiness = self
            .orchestrator
            .ensure_mergeable(&request, GateMode::Solo)
            .await?;
        match readiness {
            Readiness::Ready => self.enter(JobState::Gated),
            Readiness::NotYet => {
                return Err(Error::CannotBatch("CI is still running".to_string()));
            }
        }

        let fused = self.orchestrator.fuse(&request, None).await?;
        self.enter(JobState::Fused);

        self.orchestrator.push(&request, &fused.head).await?;
        let previous = pushed.replace((request.source_branch.clone(), fused.head.clone()));
        if let Some((branch, sha)) = previous.filter(|(_, sha)| *sha != fused.head) {
            // CI for an earlier attempt's commit is no use any more
            if let Err(e) = self.orchestrator.cancel_superseded(&branch, &sha).await {
                warn!(mr_iid = iid, error = %e, "failed to cancel superseded pipelines");
            }
        }
        self.enter(JobState::Pushed);

        self.enter(JobState::AwaitingCi);
        self.orchestrator
            .await_ci(&request.source_branch, &fused.head)
            .await?;

        self.orchestrator
            .accept(&request, &fused.head, &fused.base)
            .await
    }
}

/// Turn an exhausted transient failure into the terminal one reported to users
fn escalate(err: Error) -> Error {
    match err {
        Error::CiTimeout(_) => Error::CannotMerge("CI is taking too long.".to_string()),
        Error::CannotBatch(reason) => Error::CannotMerge(reason),
        other => other,
    }
}
