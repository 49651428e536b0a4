//! Bot configuration
//!
//! Read from a TOML file, by default `<config dir>/marge/config.toml`. The
//! API token is kept out of the file: it comes from `MARGE_AUTH_TOKEN` or a
//! separate token file.

use crate::error::{Error, Result};
use crate::types::{DEFAULT_BATCH_BRANCH_NAME, DEFAULT_BATCH_MR_TITLE, Fusion, JobOptions};
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;
use url::Url;

/// Environment variable holding the API token
pub const TOKEN_ENV_VAR: &str = "MARGE_AUTH_TOKEN";

const CONFIG_DIR: &str = "marge";
const CONFIG_FILE: &str = "config.toml";

/// Top-level configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BotConfig {
    /// Base URL of the GitLab instance
    pub gitlab_url: Url,
    /// Project path, e.g. `group/project`
    pub project: String,
    /// Local working copy the bot fuses branches in
    pub repo_path: PathBuf,
    /// URL to clone from when `repo_path` is not a clone yet
    #[serde(default)]
    pub clone_url: Option<String>,
    /// Git remote name
    #[serde(default = "default_remote")]
    pub remote: String,
    /// Merge requests with a common target in batches
    #[serde(default)]
    pub batch: bool,
    /// Pause between cycles
    #[serde(default = "default_cycle_interval")]
    pub cycle_interval_secs: u64,
    /// File holding the API token, used when the environment has none
    #[serde(default)]
    pub auth_token_file: Option<PathBuf>,
    /// Per-job behaviour
    #[serde(default)]
    pub job: JobConfig,
}

/// `[job]` table
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    /// `rebase` or `merge`
    pub fusion: Fusion,
    /// Add `Reviewed-by` trailers
    pub add_reviewers: bool,
    /// Add a `Tested-by` trailer
    pub add_tested: bool,
    /// Add a `Part-of` trailer
    pub add_part_of: bool,
    /// Delete source branches once merged
    pub remove_source_branch: bool,
    /// Seconds between CI polls
    pub ci_poll_interval_secs: u64,
    /// Seconds to wait for one CI run
    pub ci_timeout_secs: u64,
    /// Attempts per request
    pub max_attempts: u32,
    /// Base delay between attempts, in seconds
    pub retry_backoff_secs: u64,
    /// Batch branch name
    pub batch_branch_name: String,
    /// Batch merge request title
    pub batch_mr_title: String,
}

impl Default for JobConfig {
    fn default() -> Self {
        let defaults = JobOptions::default();
        Self {
            fusion: defaults.fusion,
            add_reviewers: defaults.add_reviewers,
            add_tested: defaults.add_tested,
            add_part_of: defaults.add_part_of,
            remove_source_branch: defaults.remove_source_branch,
            ci_poll_interval_secs: defaults.ci_poll_interval.as_secs(),
            ci_timeout_secs: defaults.ci_timeout.as_secs(),
            max_attempts: defaults.max_attempts,
            retry_backoff_secs: defaults.retry_backoff.as_secs(),
            batch_branch_name: DEFAULT_BATCH_BRANCH_NAME.to_string(),
            batch_mr_title: DEFAULT_BATCH_MR_TITLE.to_string(),
        }
    }
}

fn default_remote() -> String {
    "origin".to_string()
}

const fn default_cycle_interval() -> u64 {
    30
}

/// API token; never printed
#[derive(Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// Wrap a raw token
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// The raw token, for request headers
    pub fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AuthToken(***)")
    }
}

/// Default config location
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(CONFIG_DIR).join(CONFIG_FILE))
}

impl BotConfig {
    /// Parse a config from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or from [`default_config_path`] when `None`
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => default_config_path()
                .ok_or_else(|| Error::Config("cannot determine config directory".to_string()))?,
        };
        debug!(path = %path.display(), "loading config");
        let content = fs::read_to_string(&path)
            .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
        Self::from_toml_str(&content)
    }

    fn validate(&self) -> Result<()> {
        if self.project.trim().is_empty() || !self.project.contains('/') {
            return Err(Error::Config(format!(
                "project must look like 'group/project', got '{}'",
                self.project
            )));
        }
        if self.job.max_attempts == 0 {
            return Err(Error::Config("job.max_attempts must be at least 1".to_string()));
        }
        if self.job.ci_poll_interval_secs == 0 {
            return Err(Error::Config(
                "job.ci_poll_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.job.batch_branch_name.trim().is_empty() {
            return Err(Error::Config("job.batch_branch_name is empty".to_string()));
        }
        Ok(())
    }

    /// Options handed to merge jobs
    pub fn job_options(&self) -> JobOptions {
        JobOptions {
            fusion: self.job.fusion,
            add_reviewers: self.job.add_reviewers,
            add_tested: self.job.add_tested,
            add_part_of: self.job.add_part_of,
            remove_source_branch: self.job.remove_source_branch,
            ci_poll_interval: Duration::from_secs(self.job.ci_poll_interval_secs),
            ci_timeout: Duration::from_secs(self.job.ci_timeout_secs),
            max_attempts: self.job.max_attempts,
            retry_backoff: Duration::from_secs(self.job.retry_backoff_secs),
            batch: self.batch,
            batch_branch_name: self.job.batch_branch_name.clone(),
            batch_mr_title: self.job.batch_mr_title.clone(),
            remote: self.remote.clone(),
        }
    }

    /// Pause between cycles
    pub const fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }

    /// Where to clone the working copy from
    pub fn clone_url(&self) -> String {
        self.clone_url.clone().unwrap_or_else(|| {
            format!(
                "{}/{}.git",
                self.gitlab_url.as_str().trim_end_matches('/'),
                self.project
            )
        })
    }

    /// Resolve the API token
    ///
    /// `MARGE_AUTH_TOKEN` wins over `auth_token_file`.
    pub fn auth_token(&self) -> Result<AuthToken> {
        if let Ok(token) = std::env::var(TOKEN_ENV_VAR) {
            if !token.trim().is_empty() {
                debug!("using token from environment");
                return Ok(AuthToken::new(token.trim()));
            }
        }
        let Some(path) = &self.auth_token_file else {
            return Err(Error::Auth(format!(
                "no token: set {TOKEN_ENV_VAR} or auth_token_file"
            )));
        };
        let token = fs::read_to_string(path)
            .map_err(|e| Error::Auth(format!("failed to read {}: {e}", path.display())))?;
        let token = token.trim();
        if token.is_empty() {
            return Err(Error::Auth(format!("{} is empty", path.display())));
        }
        debug!(path = %path.display(), "using token from file");
        Ok(AuthToken::new(token))
    }
}
