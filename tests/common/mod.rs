//! Shared test fixtures

#![allow(dead_code)]

mod mock_platform;
mod remote;

pub use mock_git::{MockGitRepo, PushCall};
pub use mock_platform::{
    AUTHOR_ID, AcceptCall, BOT_USER_ID, MockPlatformService, NoteCall, Trigger,
};
pub use remote::{FakeRemote, PROJECT_ID, RemoteState};

use marge_bot::merge::RequestOrchestrator;
use marge_bot::types::{JobOptions, MergeRequest, PipelineStatus, Project, User};
use std::time::Duration;

/// Hash of the target branch every scenario starts from
pub const INITIAL_TARGET: &str = "505e";

/// Fake server, API and working copy wired together
pub struct Harness {
    pub remote: FakeRemote,
    pub platform: MockPlatformService,
    pub git: MockGitRepo,
    pub user: User,
    pub project: Project,
    pub options: JobOptions,
}

impl Harness {
    /// `master` at [`INITIAL_TARGET`], no merge requests yet
    pub fn new() -> Self {
        let remote = FakeRemote::new();
        remote.seed_branch("master", INITIAL_TARGET);
        let platform = MockPlatformService::new(remote.clone());
        let git = MockGitRepo::new(remote.clone());
        let user = platform.user();
        let project = platform.project();
        Self {
            remote,
            platform,
            git,
            user,
            project,
            options: test_options(),
        }
    }

    /// Same as [`Harness::new`] with batching turned on
    pub fn batched() -> Self {
        let mut harness = Self::new();
        harness.options.batch = true;
        harness
    }

    /// Open request `iid` from `feature-<iid>` into master, with its own
    /// pipeline in state `ci`
    pub fn add_feature(&self, iid: u64, ci: PipelineStatus) -> MergeRequest {
        let branch = format!("feature-{iid}");
        self.remote.feature_branch(&branch, "master", ci);
        self.platform.add_request(iid, &branch, "master")
    }

    /// Re-read project settings after changing them on the mock
    pub fn refresh_project(&mut self) {
        self.project = self.platform.project();
    }

    pub fn orchestrator(&self) -> RequestOrchestrator<'_> {
        RequestOrchestrator::new(
            &self.platform,
            &self.git,
            &self.user,
            &self.project,
            &self.options,
        )
    }

    pub fn target_head(&self) -> String {
        self.remote.head("master").unwrap_or_default()
    }
}

/// Job options with short waits; tests run on paused time anyway
pub fn test_options() -> JobOptions {
    JobOptions {
        ci_poll_interval: Duration::from_secs(5),
        ci_timeout: Duration::from_secs(60),
        retry_backoff: Duration::from_secs(1),
        max_attempts: 3,
        ..JobOptions::default()
    }
}
