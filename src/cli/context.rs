//! Shared setup for CLI commands
//!
//! Turns a loaded config into the platform service, working copy and
//! identities every cycle needs.

use marge_bot::config::BotConfig;
use marge_bot::error::Result;
use marge_bot::git::GitCli;
use marge_bot::platform::{GitLabService, PlatformService};
use marge_bot::types::{JobOptions, MergeRequestQuery, Project, User};
use tracing::info;

/// Everything a merge cycle runs against
pub struct BotContext {
    /// GitLab API client
    pub platform: GitLabService,
    /// Local working copy
    pub git: GitCli,
    /// The bot's own account
    pub user: User,
    /// The project being merged into
    pub project: Project,
    /// Per-job options from the config
    pub options: JobOptions,
}

impl BotContext {
    /// Connect to GitLab and open (or clone) the working copy
    ///
    /// Fails early on a bad token or an unknown project.
    pub async fn new(config: &BotConfig) -> Result<Self> {
        let token = config.auth_token()?;
        let platform = GitLabService::new(
            token.secret().to_string(),
            config.gitlab_url.clone(),
            config.project.clone(),
        )?;

        let user = platform.current_user().await?;
        let project = platform.get_project().await?;
        info!(
            user = %user.username,
            project = %project.path_with_namespace,
            requires_ci = project.only_allow_merge_if_pipeline_succeeds,
            "connected"
        );

        let git = GitCli::clone_or_open(&config.clone_url(), &config.repo_path, &config.remote)?;

        Ok(Self {
            platform,
            git,
            user,
            project,
            options: config.job_options(),
        })
    }

    /// Open requests assigned to the bot, oldest first
    pub fn candidates_query(&self) -> MergeRequestQuery {
        MergeRequestQuery {
            assignee_id: Some(self.user.id),
            ..MergeRequestQuery::opened()
        }
    }
}
