//! Error types for marge-bot

use std::time::Duration;
use thiserror::Error;

/// Message used whenever a branch moved underneath a running job.
pub const BYPASS_MESSAGE: &str = "Someone was naughty and by-passed marge";

/// Message used when a request's own pipeline is not green inside a batch.
pub const CI_NOT_PASSED_MESSAGE: &str = "This MR has not passed CI.";

/// Errors that can occur in marge-bot
#[derive(Error, Debug)]
pub enum Error {
    /// Policy violation that retrying will not fix without an external change
    #[error("{0}")]
    CannotMerge(String),

    /// Condition that is fine for a solo retry but not inside a shared batch
    #[error("{0}")]
    CannotBatch(String),

    /// CI did not reach a final state in time
    #[error("CI did not finish within {0:?}")]
    CiTimeout(Duration),

    /// GitLab API error
    #[error("GitLab API error: {0}")]
    GitLabApi(String),

    /// Generic platform error
    #[error("platform error: {0}")]
    Platform(String),

    /// Git command failed
    #[error("git error: {0}")]
    Git(String),

    /// Configuration error
    #[error("config error: {0}")]
    Config(String),

    /// Authentication error
    #[error("auth error: {0}")]
    Auth(String),

    /// HTTP request error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build a `CannotBatch` for a branch that moved behind our back
    pub fn bypassed() -> Self {
        Self::CannotBatch(BYPASS_MESSAGE.to_string())
    }

    /// Terminal for the request in the current run
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::CannotMerge(_))
    }

    /// Evicts the request from the current batch
    pub const fn is_batch_local(&self) -> bool {
        matches!(self, Self::CannotBatch(_) | Self::CiTimeout(_))
    }

    /// Transport or working-copy failure rather than a decision about the request
    pub const fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            Self::GitLabApi(_) | Self::Platform(_) | Self::Git(_) | Self::Http(_) | Self::Io(_)
        )
    }

    /// Whether a solo job should start another attempt after this error
    pub const fn is_retryable(&self) -> bool {
        !matches!(
            self,
            Self::CannotMerge(_) | Self::Config(_) | Self::Auth(_) | Self::Internal(_)
        )
    }
}

/// Result type alias for marge-bot operations
pub type Result<T> = std::result::Result<T, Error>;
