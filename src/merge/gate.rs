//! Merge policy checks for a single request

use crate::error::{CI_NOT_PASSED_MESSAGE, Error, Result};
use crate::merge::pipeline::PipelineTracker;
use crate::platform::PlatformService;
use crate::types::{JobOptions, MergeRequest, MrState, PipelineStatus, Project, User};
use tracing::debug;

/// Where the request is being processed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    /// On its own; CI runs again on the fused commit anyway
    Solo,
    /// Inside a batch; its own pipeline must already be green
    Batch,
}

/// Non-error outcome of the gate
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// Policy satisfied
    Ready,
    /// CI for the head commit is still running; ask again later
    NotYet,
}

/// Evaluates merge policy for one request
pub struct MergeRequestGate<'a> {
    platform: &'a dyn PlatformService,
    user: &'a User,
    project: &'a Project,
    options: &'a JobOptions,
}

impl<'a> MergeRequestGate<'a> {
    /// Create a gate for the bot `user` on `project`
    pub const fn new(
        platform: &'a dyn PlatformService,
        user: &'a User,
        project: &'a Project,
        options: &'a JobOptions,
    ) -> Self {
        Self {
            platform,
            user,
            project,
            options,
        }
    }

    /// Check whether `request` may be merged right now
    ///
    /// Policy violations are [`Error::CannotMerge`]. A red or missing
    /// pipeline in batch mode is [`Error::CannotBatch`]; one still running is
    /// [`Readiness::NotYet`].
    pub async fn ensure_mergeable(
        &self,
        request: &MergeRequest,
        mode: GateMode,
    ) -> Result<Readiness> {
        debug!(mr_iid = request.iid, ?mode, "checking merge policy");

        match request.state {
            MrState::Opened => {}
            MrState::Merged => {
                return Err(Error::CannotMerge(
                    "The merge request is already merged!".to_string(),
                ));
            }
            MrState::Closed | MrState::Locked => {
                return Err(Error::CannotMerge(
                    "The merge request is already closed!".to_string(),
                ));
            }
        }

        if request.work_in_progress {
            return Err(Error::CannotMerge(
                "Sorry, I can't merge requests marked as Work-In-Progress!".to_string(),
            ));
        }

        if request.squash && self.options.rewrites_commits() {
            return Err(Error::CannotMerge(
                "Sorry, merging requests marked as auto-squash would ruin my commit tagging!"
                    .to_string(),
            ));
        }

        if !request.is_assigned_to(self.user.id) {
            return Err(Error::CannotMerge(
                "It is not assigned to me anymore!".to_string(),
            ));
        }

        let approvals = self.platform.get_approvals(request.iid).await?;
        if !approvals.sufficient() {
            let approvers: Vec<&str> = approvals
                .approved_by
                .iter()
                .map(|a| a.username.as_str())
                .collect();
            return Err(Error::CannotMerge(format!(
                "Insufficient approvals (have: {approvers:?} missing: {})",
                approvals.approvals_left
            )));
        }

        if mode == GateMode::Batch && self.project.only_allow_merge_if_pipeline_succeeds {
            let status = PipelineTracker::new(self.platform)
                .latest_status(&request.source_branch, &request.sha)
                .await?;
            debug!(mr_iid = request.iid, ?status, "CI status of head commit");
            match status {
                Some(status) if status.is_green() => {}
                Some(PipelineStatus::Created | PipelineStatus::Pending | PipelineStatus::Running) => {
                    return Ok(Readiness::NotYet);
                }
                _ => return Err(Error::CannotBatch(CI_NOT_PASSED_MESSAGE.to_string())),
            }
        }

        Ok(Readiness::Ready)
    }
}
