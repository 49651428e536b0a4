//! Local version-control binding
//!
//! [`GitRepo`] is the narrow set of git operations the merge engine needs.
//! [`GitCli`] implements it by running the `git` binary against a clone.

mod cli;
pub mod trailers;

pub use cli::GitCli;

use crate::error::Result;

/// Git operations against the bot's working copy
///
/// All calls are synchronous; the engine owns the working copy exclusively
/// while a job runs.
pub trait GitRepo: Send + Sync {
    /// Fetch all refs from a remote
    fn fetch(&self, remote: &str) -> Result<()>;

    /// Create or reset a local branch to `start_point` and check it out
    fn checkout_branch(&self, branch: &str, start_point: &str) -> Result<()>;

    /// Resolve any revision to a full commit hash
    fn get_commit_hash(&self, rev: &str) -> Result<String>;

    /// Push a local branch. `remote_branch` defaults to the same name.
    fn push(&self, branch: &str, remote_branch: Option<&str>, force: bool) -> Result<()>;

    /// Delete a branch locally and on the remote. A missing branch is not an error.
    fn remove_branch(&self, branch: &str) -> Result<()>;

    /// Rebase `branch` onto `onto`, returning the new head
    fn rebase(&self, branch: &str, onto: &str) -> Result<String>;

    /// Merge `other` into `branch` with a merge commit, returning the new head
    fn merge(&self, branch: &str, other: &str) -> Result<String>;

    /// Fast-forward `branch` to `other`, returning the new head
    fn fast_forward(&self, branch: &str, other: &str) -> Result<String>;

    /// Rewrite every commit in `start_commit..branch` so its message carries
    /// `trailer_name: value` for each value, replacing earlier occurrences.
    fn add_trailer(
        &self,
        branch: &str,
        start_commit: &str,
        trailer_name: &str,
        values: &[String],
    ) -> Result<String>;

    /// `ancestor` is reachable from `descendant` (or equal to it)
    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool>;
}
