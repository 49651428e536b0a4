//! Combining a source branch with its target and tagging the result

use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::git::trailers::{PART_OF, REVIEWED_BY, TESTED_BY};
use crate::types::{Approvals, Fusion, JobOptions, MergeRequest, User};
use tracing::{debug, warn};

/// Rebases or merges branches in the local working copy
///
/// Nothing here touches the remote; pushing is the caller's job.
pub struct Fuser<'a> {
    git: &'a dyn GitRepo,
    options: &'a JobOptions,
}

impl<'a> Fuser<'a> {
    /// Create a fuser with the configured strategy
    pub const fn new(git: &'a dyn GitRepo, options: &'a JobOptions) -> Self {
        Self { git, options }
    }

    /// Fail with the bypass error unless `target_ref` resolves to `expected`
    pub fn ensure_base(&self, target_ref: &str, expected: &str) -> Result<()> {
        let actual = self.git.get_commit_hash(target_ref)?;
        if actual == expected {
            return Ok(());
        }
        warn!(target_ref, expected, actual = %actual, "target moved behind our back");
        Err(Error::bypassed())
    }

    /// Put `branch` on top of `onto` and return its new head
    ///
    /// With `expected_base` set, the tip of `onto` must still be that commit.
    /// Conflicts abort the operation and surface as [`Error::CannotMerge`].
    /// The new head must contain `onto`.
    pub fn fuse(&self, branch: &str, onto: &str, expected_base: Option<&str>) -> Result<String> {
        if let Some(expected) = expected_base {
            self.ensure_base(onto, expected)?;
        }
        debug!(branch, onto, fusion = %self.options.fusion, "fusing");
        let result = match self.options.fusion {
            Fusion::Rebase => self.git.rebase(branch, onto),
            Fusion::Merge => self.git.merge(branch, onto),
        };
        let head = result.map_err(|e| match e {
            Error::Git(detail) => {
                debug!(branch, onto, %detail, "fuse failed");
                Error::CannotMerge(format!(
                    "Got conflicts while {} '{branch}' onto '{onto}', your problem now...",
                    match self.options.fusion {
                        Fusion::Rebase => "rebasing",
                        Fusion::Merge => "merging",
                    }
                ))
            }
            other => other,
        })?;

        if !self.git.is_ancestor(onto, &head)? {
            return Err(Error::Internal(format!(
                "'{branch}' at {head} does not contain '{onto}' after fusing"
            )));
        }
        Ok(head)
    }

    /// Rewrite the request's commits (everything after `start_commit`) with
    /// the configured trailers, returning the new head
    pub fn add_trailers(
        &self,
        request: &MergeRequest,
        approvals: &Approvals,
        tester: &User,
        start_commit: &str,
    ) -> Result<String> {
        let branch = request.source_branch.as_str();
        let mut head = self.git.get_commit_hash(branch)?;

        if self.options.add_reviewers {
            let reviewers = approvals.reviewer_identities();
            head = self
                .git
                .add_trailer(branch, start_commit, REVIEWED_BY, &reviewers)?;
        }
        if self.options.add_tested {
            let tested_by = format!("{} <{}>", tester.name, request.web_url);
            head = self
                .git
                .add_trailer(branch, start_commit, TESTED_BY, &[tested_by])?;
        }
        if self.options.add_part_of {
            let part_of = format!("<{}>", request.web_url);
            head = self
                .git
                .add_trailer(branch, start_commit, PART_OF, &[part_of])?;
        }
        Ok(head)
    }
}
