//! Hosting-service binding
//!
//! The merge engine only talks to the hosting service through
//! [`PlatformService`], so tests can substitute an in-memory double.

mod gitlab;

pub use gitlab::GitLabService;

use crate::error::Result;
use crate::types::{
    AcceptOptions, Approvals, MergeRequest, MergeRequestQuery, MergeResult, NewMergeRequest,
    Pipeline, PipelineQuery, Project, User,
};
use async_trait::async_trait;

/// Platform service trait for merge request, pipeline and branch operations
///
/// An implementation is bound to a single project; every call is scoped to it.
#[async_trait]
pub trait PlatformService: Send + Sync {
    /// The user the bot authenticates as
    async fn current_user(&self) -> Result<User>;

    /// Settings of the bound project
    async fn get_project(&self) -> Result<Project>;

    // =========================================================================
    // Merge requests
    // =========================================================================

    /// Fetch a merge request by iid
    async fn get_merge_request(&self, iid: u64) -> Result<MergeRequest>;

    /// Search merge requests. Results are sorted by creation time in the
    /// order the query asks for.
    async fn search_merge_requests(&self, query: &MergeRequestQuery) -> Result<Vec<MergeRequest>>;

    /// Open a new merge request
    async fn create_merge_request(&self, request: &NewMergeRequest) -> Result<MergeRequest>;

    /// Close a merge request without merging
    async fn close_merge_request(&self, iid: u64) -> Result<()>;

    /// Merge a request through the platform
    async fn accept_merge_request(&self, iid: u64, options: &AcceptOptions) -> Result<MergeResult>;

    /// Approval state of a merge request
    async fn get_approvals(&self, iid: u64) -> Result<Approvals>;

    /// Leave a note on a merge request
    async fn create_note(&self, iid: u64, body: &str) -> Result<()>;

    /// Replace the assignees of a merge request
    async fn assign_merge_request(&self, iid: u64, assignee_ids: &[u64]) -> Result<()>;

    // =========================================================================
    // Branches and pipelines
    // =========================================================================

    /// Current head commit of a branch
    async fn get_branch_head(&self, branch: &str) -> Result<String>;

    /// Fetch a pipeline by id
    async fn get_pipeline(&self, pipeline_id: u64) -> Result<Pipeline>;

    /// Pipelines for a ref, newest first
    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<Vec<Pipeline>>;

    /// Cancel a running pipeline
    async fn cancel_pipeline(&self, pipeline_id: u64) -> Result<()>;
}
