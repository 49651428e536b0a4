//! Batch merging
//!
//! Several requests with a common target are fused one after another onto an
//! ephemeral batch branch, tested by a single CI run, and then merged one by
//! one through the same per-request steps a solo job uses.

use crate::error::{CI_NOT_PASSED_MESSAGE, Error, Result};
use crate::git::GitRepo;
use crate::merge::execute::{RequestOutcome, solo_outcome};
use crate::merge::fuse::Fuser;
use crate::merge::gate::{GateMode, Readiness};
use crate::merge::job::SingleRequestOrchestrator;
use crate::merge::plan::requests_with_common_target_branch;
use crate::platform::PlatformService;
use crate::types::{
    JobOptions, MergeRequest, MergeRequestQuery, MrState, NewMergeRequest, SortOrder, User,
};
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// One request assembled on the batch branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchEntry {
    /// Snapshot taken when the request was assembled
    pub request: MergeRequest,
    /// Batch head the request was fused onto
    ///
    /// Only meaningful on the batch branch. Fan-out checks the real target
    /// against the tip left by the previous member's accept instead.
    pub expected_base: String,
    /// Batch head after fusing the request
    pub fused_sha: String,
}

/// State of one batch round
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchContext {
    /// Name of the batch branch
    pub branch: String,
    /// Common target branch
    pub target_branch: String,
    /// Target tip the batch was built on
    pub target_tip: String,
    /// The open batch merge request, once created
    pub batch_request: Option<MergeRequest>,
    /// Assembled requests, in assembly order
    pub entries: Vec<BatchEntry>,
}

impl BatchContext {
    /// Empty batch on top of `target_tip`
    pub fn new(branch: &str, target_branch: &str, target_tip: &str) -> Self {
        Self {
            branch: branch.to_string(),
            target_branch: target_branch.to_string(),
            target_tip: target_tip.to_string(),
            batch_request: None,
            entries: Vec::new(),
        }
    }

    /// Head the batch branch should be at
    pub fn head(&self) -> &str {
        self.entries
            .last()
            .map_or(self.target_tip.as_str(), |e| e.fused_sha.as_str())
    }
}

/// What a batch round did to each request
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// Per-request outcomes, in processing order
    pub outcomes: Vec<(MergeRequest, RequestOutcome)>,
    /// Set when the batch pipeline failed; constituents should go solo
    pub ci_failure: Option<String>,
}

impl BatchReport {
    fn record(&mut self, request: &MergeRequest, outcome: RequestOutcome) {
        debug!(mr_iid = request.iid, ?outcome, "batch outcome");
        self.outcomes.push((request.clone(), outcome));
    }
}

/// Merges a group of requests with one CI run
pub struct BatchMergeJob<'a> {
    platform: &'a dyn PlatformService,
    git: &'a dyn GitRepo,
    orchestrator: &'a dyn SingleRequestOrchestrator,
    user: &'a User,
    options: &'a JobOptions,
    requests: Vec<MergeRequest>,
}

impl<'a> BatchMergeJob<'a> {
    /// Create a batch job over candidate `requests`
    pub const fn new(
        platform: &'a dyn PlatformService,
        git: &'a dyn GitRepo,
        orchestrator: &'a dyn SingleRequestOrchestrator,
        user: &'a User,
        options: &'a JobOptions,
        requests: Vec<MergeRequest>,
    ) -> Self {
        Self {
            platform,
            git,
            orchestrator,
            user,
            options,
            requests,
        }
    }

    fn branch(&self) -> &str {
        &self.options.batch_branch_name
    }

    /// Candidates targeting `target_branch`, in input order
    pub fn requests_with_common_target_branch(&self, target_branch: &str) -> Vec<&MergeRequest> {
        requests_with_common_target_branch(&self.requests, target_branch)
    }

    /// Open the batch merge request from the batch branch into `target_branch`
    pub async fn create_batch_request(&self, target_branch: &str) -> Result<MergeRequest> {
        info!(target_branch, "creating batch MR");
        self.platform
            .create_merge_request(&NewMergeRequest {
                source_branch: self.branch().to_string(),
                target_branch: target_branch.to_string(),
                title: self.options.batch_mr_title.clone(),
                labels: vec![self.branch().to_string()],
            })
            .await
    }

    /// Close the newest open batch merge request left by this bot, if any
    ///
    /// Returns the iid of the closed request.
    pub async fn close_batch_request(&self) -> Result<Option<u64>> {
        let query = MergeRequestQuery {
            state: MrState::Opened,
            labels: vec![self.branch().to_string()],
            author_id: Some(self.user.id),
            assignee_id: None,
            sort: SortOrder::Desc,
        };
        let found = self.platform.search_merge_requests(&query).await?;
        let Some(batch_request) = found.first() else {
            debug!("no batch MR to close");
            return Ok(None);
        };
        info!(mr_iid = batch_request.iid, "closing batch MR");
        self.platform.close_merge_request(batch_request.iid).await?;
        Ok(Some(batch_request.iid))
    }

    /// Delete the batch branch; a missing branch is fine
    pub fn remove_batch_branch(&self) -> Result<()> {
        debug!(branch = self.branch(), "removing batch branch");
        self.git.remove_branch(self.branch())
    }

    /// Force-push the batch branch over whatever is on the remote
    pub fn push_batch(&self) -> Result<()> {
        info!(branch = self.branch(), "pushing batch branch");
        self.git.push(self.branch(), None, true)
    }

    async fn cleanup(&self) -> Result<()> {
        self.close_batch_request().await?;
        self.remove_batch_branch()
    }

    /// Run one batch round for the target of the first candidate
    ///
    /// Stale batch state is removed before the round and again afterwards,
    /// whatever the outcome.
    pub async fn execute(&self) -> Result<BatchReport> {
        let Some(first) = self.requests.first() else {
            return Ok(BatchReport::default());
        };
        let target_branch = first.target_branch.clone();

        self.cleanup().await?;
        let result = self.run_round(&target_branch).await;
        if let Err(e) = self.cleanup().await {
            warn!(error = %e, "failed to clean up batch state");
        }
        result
    }

    async fn run_round(&self, target_branch: &str) -> Result<BatchReport> {
        let group: Vec<MergeRequest> = self
            .requests_with_common_target_branch(target_branch)
            .into_iter()
            .cloned()
            .collect();
        let mut report = BatchReport::default();

        if group.len() == 1 {
            self.run_solo(&group[0], &mut report).await;
            return Ok(report);
        }

        let ctx = self.assemble(target_branch, &group, &mut report).await?;
        match ctx.entries.len() {
            0 => return Ok(report),
            1 => {
                self.run_solo(&ctx.entries[0].request, &mut report).await;
                return Ok(report);
            }
            _ => {}
        }

        let ctx = match self.run_batch_ci(ctx).await {
            Ok(ctx) => ctx,
            Err((ctx, e)) if e.is_permanent() || e.is_batch_local() => {
                warn!(error = %e, "batch CI did not pass");
                for entry in &ctx.entries {
                    report.record(
                        &entry.request,
                        RequestOutcome::Evicted {
                            reason: format!("batch CI did not pass: {e}"),
                        },
                    );
                }
                report.ci_failure = Some(e.to_string());
                return Ok(report);
            }
            Err((ctx, e)) => {
                warn!(error = %e, "batch CI round errored");
                for entry in &ctx.entries {
                    report.record(
                        &entry.request,
                        RequestOutcome::Errored {
                            reason: e.to_string(),
                        },
                    );
                }
                return Ok(report);
            }
        };

        self.fan_out(&ctx, &mut report).await;
        Ok(report)
    }

    async fn run_solo(&self, request: &MergeRequest, report: &mut BatchReport) {
        debug!(mr_iid = request.iid, "batch of one, merging on its own");
        let outcome = solo_outcome(self.orchestrator, self.platform, self.options, request).await;
        report.record(request, outcome);
    }

    /// Fuse gate-passing candidates onto a fresh batch branch
    ///
    /// Assembly stops at the first request that cannot be batched; requests
    /// already on the branch stay, the failing one is evicted and the rest
    /// wait for the next round. An infrastructure failure stops assembly the
    /// same way, with the request marked errored.
    pub async fn assemble(
        &self,
        target_branch: &str,
        candidates: &[MergeRequest],
        report: &mut BatchReport,
    ) -> Result<BatchContext> {
        let remote_target = self.options.remote_ref(target_branch);
        self.git.fetch(&self.options.remote)?;
        self.git.checkout_branch(self.branch(), &remote_target)?;
        let target_tip = self.git.get_commit_hash(&remote_target)?;
        let mut ctx = BatchContext::new(self.branch(), target_branch, &target_tip);
        let fuser = Fuser::new(self.git, self.options);

        let mut remaining = candidates.iter();
        for candidate in remaining.by_ref() {
            let request = match self.platform.get_merge_request(candidate.iid).await {
                Ok(request) => request,
                Err(e) => {
                    report.record(candidate, RequestOutcome::Errored { reason: e.to_string() });
                    break;
                }
            };

            match self
                .orchestrator
                .ensure_mergeable(&request, GateMode::Batch)
                .await
            {
                Ok(Readiness::Ready) => {}
                Ok(Readiness::NotYet) => {
                    report.record(&request, RequestOutcome::Deferred);
                    continue;
                }
                Err(e) if e.is_permanent() => {
                    report.record(&request, RequestOutcome::Failed { reason: e.to_string() });
                    continue;
                }
                Err(e) if e.is_batch_local() => {
                    report.record(&request, RequestOutcome::Evicted { reason: e.to_string() });
                    break;
                }
                Err(e) => {
                    report.record(&request, RequestOutcome::Errored { reason: e.to_string() });
                    break;
                }
            }

            match self.fuse_into_batch(&fuser, &request, &ctx) {
                Ok(entry) => {
                    info!(mr_iid = request.iid, sha = %entry.fused_sha, "added to batch");
                    ctx.entries.push(entry);
                }
                Err(e @ (Error::CannotMerge(_) | Error::CannotBatch(_))) => {
                    // A conflict may only exist because of earlier batch members
                    report.record(&request, RequestOutcome::Evicted { reason: e.to_string() });
                    break;
                }
                Err(e) => {
                    report.record(&request, RequestOutcome::Errored { reason: e.to_string() });
                    break;
                }
            }
        }
        for skipped in remaining {
            report.record(skipped, RequestOutcome::Deferred);
        }
        Ok(ctx)
    }

    fn fuse_into_batch(
        &self,
        fuser: &Fuser<'_>,
        request: &MergeRequest,
        ctx: &BatchContext,
    ) -> Result<BatchEntry> {
        let expected_base = ctx.head().to_string();
        let remote_source = self.options.remote_ref(&request.source_branch);

        self.git
            .checkout_branch(&request.source_branch, &remote_source)?;
        if self.git.get_commit_hash(&request.source_branch)? != request.sha {
            return Err(Error::bypassed());
        }
        fuser.fuse(&request.source_branch, self.branch(), Some(&expected_base))?;
        let fused_sha = self
            .git
            .fast_forward(self.branch(), &request.source_branch)?;

        Ok(BatchEntry {
            request: request.clone(),
            expected_base,
            fused_sha,
        })
    }

    async fn run_batch_ci(
        &self,
        mut ctx: BatchContext,
    ) -> std::result::Result<BatchContext, (BatchContext, Error)> {
        let head = match self.git.get_commit_hash(self.branch()) {
            Ok(head) if head == ctx.head() => head,
            Ok(head) => {
                let err = Error::Internal(format!(
                    "batch branch at {head}, expected {}",
                    ctx.head()
                ));
                return Err((ctx, err));
            }
            Err(e) => return Err((ctx, e)),
        };

        if let Err(e) = self.push_batch() {
            return Err((ctx, e));
        }
        match self.create_batch_request(&ctx.target_branch).await {
            Ok(batch_request) => ctx.batch_request = Some(batch_request),
            Err(e) => return Err((ctx, e)),
        }

        // Only a pipeline for the current head counts; older ones are stale
        match self.orchestrator.await_ci(self.branch(), &head).await {
            Ok(()) => Ok(ctx),
            Err(e) => Err((ctx, e)),
        }
    }

    async fn fan_out(&self, ctx: &BatchContext, report: &mut BatchReport) {
        let mut expected_target = ctx.target_tip.clone();

        for entry in &ctx.entries {
            debug!(
                mr_iid = entry.request.iid,
                expected_target = %expected_target,
                recorded_base = %entry.expected_base,
                "accepting batch member"
            );
            let result = self.accept_request(entry, &expected_target).await;
            match result {
                Ok(tip) => {
                    report.record(&entry.request, RequestOutcome::Merged { sha: tip.clone() });
                    expected_target = tip;
                }
                Err(e) if e.is_batch_local() => {
                    warn!(mr_iid = entry.request.iid, error = %e, "evicted from batch");
                    report.record(&entry.request, RequestOutcome::Evicted { reason: e.to_string() });
                }
                Err(e) if e.is_permanent() => {
                    warn!(mr_iid = entry.request.iid, error = %e, "cannot merge");
                    report.record(&entry.request, RequestOutcome::Failed { reason: e.to_string() });
                }
                Err(e) => {
                    warn!(mr_iid = entry.request.iid, error = %e, "giving up on batch member");
                    report.record(&entry.request, RequestOutcome::Errored { reason: e.to_string() });
                }
            }
        }
    }

    /// Merge one batch member whose target should be at `expected_target`
    ///
    /// A moved target is checked before a moved source, so when both moved
    /// the request is evicted rather than failed. Infrastructure failures
    /// start the member over, up to [`JobOptions::max_attempts`] attempts.
    pub async fn accept_request(&self, entry: &BatchEntry, expected_target: &str) -> Result<String> {
        let max_attempts = self.options.max_attempts.max(1);
        let mut own_push = None;
        let mut attempt = 1;

        loop {
            match self.try_accept(entry, expected_target, &mut own_push).await {
                Err(e) if e.is_infrastructure() && attempt < max_attempts => {
                    info!(mr_iid = entry.request.iid, attempt, error = %e, "retrying batch member");
                    sleep(self.options.retry_backoff * attempt).await;
                    attempt += 1;
                }
                result => return result,
            }
        }
    }

    async fn try_accept(
        &self,
        entry: &BatchEntry,
        expected_target: &str,
        own_push: &mut Option<String>,
    ) -> Result<String> {
        let request = &entry.request;
        self.orchestrator
            .ensure_target_at(&request.target_branch, expected_target)
            .await?;
        let fresh = self.refetch_unchanged(request, own_push.as_deref()).await?;

        // Our own pushed head gets its CI awaited below
        let mode = if own_push.as_deref() == Some(fresh.sha.as_str()) {
            GateMode::Solo
        } else {
            GateMode::Batch
        };
        if self.orchestrator.ensure_mergeable(&fresh, mode).await? == Readiness::NotYet {
            return Err(Error::CannotBatch(CI_NOT_PASSED_MESSAGE.to_string()));
        }

        let fused = self.orchestrator.fuse(&fresh, Some(expected_target)).await?;
        *own_push = Some(fused.head.clone());
        self.orchestrator.push(&fresh, &fused.head).await?;

        // GitLab refuses to merge until the pushed head has a green pipeline
        self.orchestrator
            .await_ci(&fresh.source_branch, &fused.head)
            .await?;
        let tip = self
            .orchestrator
            .accept(&fresh, &fused.head, expected_target)
            .await?;

        if let Err(e) = self
            .orchestrator
            .cancel_superseded(&fresh.source_branch, &fused.head)
            .await
        {
            warn!(mr_iid = fresh.iid, error = %e, "failed to cancel redundant pipelines");
        }
        Ok(tip)
    }

    /// Refetch `request`, also accepting `own_push` as its head
    async fn refetch_unchanged(
        &self,
        request: &MergeRequest,
        own_push: Option<&str>,
    ) -> Result<MergeRequest> {
        match (self.orchestrator.ensure_unchanged(request).await, own_push) {
            (Err(e), Some(head)) if e.is_permanent() => {
                let pushed = MergeRequest {
                    sha: head.to_string(),
                    ..request.clone()
                };
                self.orchestrator
                    .ensure_unchanged(&pushed)
                    .await
                    .map_err(|_| e)
            }
            (result, _) => result,
        }
    }
}
