//! CI pipeline tracking

use crate::error::{Error, Result};
use crate::platform::PlatformService;
use crate::types::{Pipeline, PipelineQuery, PipelineStatus};
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// Reads and cancels pipelines through the platform
#[derive(Clone, Copy)]
pub struct PipelineTracker<'a> {
    platform: &'a dyn PlatformService,
}

impl<'a> PipelineTracker<'a> {
    /// Wrap a platform service
    pub const fn new(platform: &'a dyn PlatformService) -> Self {
        Self { platform }
    }

    /// Refetch a pipeline
    pub async fn fetch(&self, pipeline_id: u64) -> Result<Pipeline> {
        self.platform.get_pipeline(pipeline_id).await
    }

    /// All pipelines for a branch, optionally limited to one commit, newest first
    pub async fn pipelines_for(&self, branch: &str, sha: Option<&str>) -> Result<Vec<Pipeline>> {
        self.platform
            .list_pipelines(&PipelineQuery {
                ref_name: branch.to_string(),
                sha: sha.map(ToString::to_string),
            })
            .await
    }

    /// Newest pipeline that tested exactly `sha` on `branch`
    ///
    /// Pipelines for any other commit are stale and ignored, even if the
    /// platform returned them.
    pub async fn latest_for(&self, branch: &str, sha: &str) -> Result<Option<Pipeline>> {
        let pipelines = self.pipelines_for(branch, Some(sha)).await?;
        Ok(pipelines.into_iter().find(|p| p.sha == sha))
    }

    /// Status of the newest pipeline for `sha`, if there is one
    pub async fn latest_status(&self, branch: &str, sha: &str) -> Result<Option<PipelineStatus>> {
        Ok(self.latest_for(branch, sha).await?.map(|p| p.status))
    }

    /// Cancel a pipeline
    pub async fn cancel(&self, pipeline: &Pipeline) -> Result<()> {
        debug!(pipeline_id = pipeline.id, sha = %pipeline.sha, "cancelling pipeline");
        self.platform.cancel_pipeline(pipeline.id).await
    }

    /// Cancel every unfinished pipeline on `branch` for `sha`
    ///
    /// Returns how many were cancelled.
    pub async fn cancel_unfinished(&self, branch: &str, sha: &str) -> Result<usize> {
        let mut cancelled = 0;
        for pipeline in self.pipelines_for(branch, Some(sha)).await? {
            if pipeline.sha == sha && pipeline.status.is_in_progress() {
                self.cancel(&pipeline).await?;
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Poll until the pipeline for `sha` succeeds, fails, or `timeout` passes
    ///
    /// A pipeline that is missing, pending or running is a wait state. Failure
    /// and cancellation are permanent for this commit; timing out is
    /// [`Error::CiTimeout`] so the caller can decide whether to retry.
    pub async fn wait_for_success(
        &self,
        branch: &str,
        sha: &str,
        poll_interval: Duration,
        timeout: Duration,
    ) -> Result<Pipeline> {
        info!(branch, sha, "waiting for CI");
        let deadline = Instant::now() + timeout;
        let mut last_status = None;

        loop {
            if let Some(pipeline) = self.latest_for(branch, sha).await? {
                if last_status != Some(pipeline.status) {
                    debug!(pipeline_id = pipeline.id, status = %pipeline.status, "CI status");
                    last_status = Some(pipeline.status);
                }
                match pipeline.status {
                    status if status.is_green() => {
                        info!(pipeline_id = pipeline.id, "CI passed");
                        return Ok(pipeline);
                    }
                    PipelineStatus::Failed => {
                        return Err(Error::CannotMerge("CI failed!".to_string()));
                    }
                    PipelineStatus::Canceled => {
                        return Err(Error::CannotMerge("Someone canceled the CI.".to_string()));
                    }
                    _ => {}
                }
            }

            if Instant::now() >= deadline {
                warn!(branch, sha, ?timeout, "CI is taking too long");
                return Err(Error::CiTimeout(timeout));
            }
            sleep(poll_interval).await;
        }
    }
}
