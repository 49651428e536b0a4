//! Cycle execution - effectful operations
//!
//! One cycle takes the candidate list fetched by the caller, picks a target
//! group with the pure planning functions, and merges it either as a batch
//! or one request at a time.

use crate::error::Result;
use crate::git::GitRepo;
use crate::merge::batch::BatchMergeJob;
use crate::merge::job::{MergeJob, RequestOrchestrator, SingleRequestOrchestrator};
use crate::merge::plan::select_group;
use crate::platform::PlatformService;
use crate::types::{JobOptions, MergeRequest, Project, User};
use std::fmt;
use tracing::{info, warn};

/// What happened to one request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// Merged; the target is now at `sha`
    Merged {
        /// New target tip
        sha: String,
    },
    /// Permanently refused; the author has been told
    Failed {
        /// Message posted on the request
        reason: String,
    },
    /// Dropped from a batch; eligible again next cycle
    Evicted {
        /// Why it was dropped
        reason: String,
    },
    /// Not processed this cycle
    Deferred,
    /// Gave up after repeated infrastructure failures; eligible again next cycle
    Errored {
        /// Last error seen
        reason: String,
    },
}

impl fmt::Display for RequestOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Merged { sha } => write!(f, "merged ({sha})"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
            Self::Evicted { reason } => write!(f, "evicted: {reason}"),
            Self::Deferred => write!(f, "deferred"),
            Self::Errored { reason } => write!(f, "errored: {reason}"),
        }
    }
}

/// Result of one cycle
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Target branch of the group that was processed
    pub target_branch: Option<String>,
    /// Whether the group went through a batch round
    pub batched: bool,
    /// Per-request outcomes, in processing order
    pub outcomes: Vec<(MergeRequest, RequestOutcome)>,
}

impl CycleReport {
    fn iids_where(&self, pred: impl Fn(&RequestOutcome) -> bool) -> Vec<u64> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(mr, _)| mr.iid)
            .collect()
    }

    /// Requests merged this cycle
    #[must_use]
    pub fn merged(&self) -> Vec<u64> {
        self.iids_where(|o| matches!(o, RequestOutcome::Merged { .. }))
    }

    /// Requests refused for good
    #[must_use]
    pub fn failed(&self) -> Vec<u64> {
        self.iids_where(|o| matches!(o, RequestOutcome::Failed { .. }))
    }

    /// Requests dropped from a batch
    #[must_use]
    pub fn evicted(&self) -> Vec<u64> {
        self.iids_where(|o| matches!(o, RequestOutcome::Evicted { .. }))
    }

    /// Requests left for a later cycle
    #[must_use]
    pub fn deferred(&self) -> Vec<u64> {
        self.iids_where(|o| matches!(o, RequestOutcome::Deferred))
    }

    /// Requests abandoned after infrastructure failures
    #[must_use]
    pub fn errored(&self) -> Vec<u64> {
        self.iids_where(|o| matches!(o, RequestOutcome::Errored { .. }))
    }

    /// Outcome recorded for `iid`
    #[must_use]
    pub fn outcome_of(&self, iid: u64) -> Option<&RequestOutcome> {
        self.outcomes
            .iter()
            .find(|(mr, _)| mr.iid == iid)
            .map(|(_, outcome)| outcome)
    }
}

/// Run a solo [`MergeJob`] and classify its result
///
/// Only permanent refusals become an outcome; anything else is returned as an
/// error for the caller to deal with.
pub async fn merge_solo(
    orchestrator: &dyn SingleRequestOrchestrator,
    platform: &dyn PlatformService,
    options: &JobOptions,
    request: &MergeRequest,
) -> Result<RequestOutcome> {
    let mut job = MergeJob::new(orchestrator, platform, options);
    match job.run(request.iid).await {
        Ok(sha) => Ok(RequestOutcome::Merged { sha }),
        Err(e) if e.is_permanent() => Ok(RequestOutcome::Failed {
            reason: e.to_string(),
        }),
        Err(e) => Err(e),
    }
}

/// [`merge_solo`] with a failed job recorded as [`RequestOutcome::Errored`]
pub(crate) async fn solo_outcome(
    orchestrator: &dyn SingleRequestOrchestrator,
    platform: &dyn PlatformService,
    options: &JobOptions,
    request: &MergeRequest,
) -> RequestOutcome {
    match merge_solo(orchestrator, platform, options, request).await {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!(mr_iid = request.iid, error = %e, "merge job errored");
            RequestOutcome::Errored {
                reason: e.to_string(),
            }
        }
    }
}

/// Tell the author why their request was refused and hand it back to them
async fn report_failure(platform: &dyn PlatformService, request: &MergeRequest, reason: &str) {
    let note = format!("I couldn't merge this branch: {reason}");
    if let Err(e) = platform.create_note(request.iid, &note).await {
        warn!(mr_iid = request.iid, error = %e, "failed to leave note");
    }
    if let Err(e) = platform
        .assign_merge_request(request.iid, &[request.author_id])
        .await
    {
        warn!(mr_iid = request.iid, error = %e, "failed to reassign to author");
    }
}

/// Run one merge cycle over `candidates` (EFFECTFUL)
///
/// Candidates should be ordered oldest first. Only the group sharing the
/// target of the first candidate is processed; everything else is left for
/// later cycles and does not appear in the report.
///
/// A request whose job errors is recorded and the cycle moves on. Only a
/// batch round that cannot start at all fails the cycle.
pub async fn run_cycle(
    platform: &dyn PlatformService,
    git: &dyn GitRepo,
    user: &User,
    project: &Project,
    options: &JobOptions,
    candidates: &[MergeRequest],
) -> Result<CycleReport> {
    let mut report = CycleReport::default();
    let Some(group) = select_group(candidates) else {
        info!("nothing to merge");
        return Ok(report);
    };
    info!(
        target_branch = %group.target_branch,
        requests = group.requests.len(),
        batch = options.batch,
        "starting cycle"
    );
    report.target_branch = Some(group.target_branch.clone());

    let orchestrator = RequestOrchestrator::new(platform, git, user, project, options);

    if options.batch && group.requests.len() > 1 {
        report.batched = true;
        let batch = BatchMergeJob::new(
            platform,
            git,
            &orchestrator,
            user,
            options,
            group.requests.clone(),
        );
        let batch_report = batch.execute().await?;

        for (request, outcome) in batch_report.outcomes {
            let outcome = match outcome {
                RequestOutcome::Evicted { reason } if batch_report.ci_failure.is_some() => {
                    info!(mr_iid = request.iid, %reason, "batch CI failed, merging on its own");
                    solo_outcome(&orchestrator, platform, options, &request).await
                }
                other => other,
            };
            report.outcomes.push((request, outcome));
        }
    } else {
        for request in &group.requests {
            let outcome = solo_outcome(&orchestrator, platform, options, request).await;
            report.outcomes.push((request.clone(), outcome));
        }
    }

    for (request, outcome) in &report.outcomes {
        if let RequestOutcome::Failed { reason } = outcome {
            report_failure(platform, request, reason).await;
        }
    }

    info!(
        merged = report.merged().len(),
        failed = report.failed().len(),
        evicted = report.evicted().len(),
        deferred = report.deferred().len(),
        errored = report.errored().len(),
        "cycle finished"
    );
    Ok(report)
}
