//! `git` command wrapper

use super::GitRepo;
use super::trailers::rewrite_trailers;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::{debug, warn};

/// Runs `git` inside a local clone
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
    remote: String,
}

impl GitCli {
    /// Wrap an existing clone at `root` that pushes to `remote`
    pub fn new(root: impl Into<PathBuf>, remote: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            remote: remote.into(),
        }
    }

    /// Clone `url` into `root` unless a clone is already there
    pub fn clone_or_open(url: &str, root: &Path, remote: &str) -> Result<Self> {
        if !root.join(".git").exists() {
            debug!(path = %root.display(), "cloning repository");
            let output = Command::new("git")
                .args(["clone", "--origin", remote, url])
                .arg(root)
                .output()
                .map_err(|e| Error::Git(format!("failed to run git clone: {e}")))?;
            check(&output, "git clone")?;
        }
        let git = Self::new(root, remote);
        git.config_identity()?;
        Ok(git)
    }

    /// Path of the working copy
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn config_identity(&self) -> Result<()> {
        // Rebases need a committer even on a bare CI box
        if self.run(&["config", "user.email"]).is_err() {
            self.run(&["config", "user.email", "marge-bot@localhost"])?;
            self.run(&["config", "user.name", "Marge Bot"])?;
        }
        Ok(())
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new("git");
        cmd.arg("-C").arg(&self.root);
        cmd
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        self.run_with_env(args, &[])
    }

    fn run_with_env(&self, args: &[&str], env: &[(&str, &str)]) -> Result<String> {
        debug!(?args, "git");
        let output = self
            .command()
            .args(args)
            .envs(env.iter().copied())
            .output()
            .map_err(|e| Error::Git(format!("failed to run git {}: {e}", args.join(" "))))?;
        check(&output, &format!("git {}", args.join(" ")))?;
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    fn abort(&self, what: &str) {
        if let Err(e) = self.run(&[what, "--abort"]) {
            warn!(error = %e, "git {what} --abort failed");
        }
    }
}

fn check(output: &Output, what: &str) -> Result<()> {
    if output.status.success() {
        return Ok(());
    }
    let stderr = String::from_utf8_lossy(&output.stderr);
    Err(Error::Git(format!("{what} failed: {}", stderr.trim())))
}

impl GitRepo for GitCli {
    fn fetch(&self, remote: &str) -> Result<()> {
        self.run(&["fetch", "--prune", remote])?;
        Ok(())
    }

    fn checkout_branch(&self, branch: &str, start_point: &str) -> Result<()> {
        self.run(&["checkout", "-B", branch, start_point, "--"])?;
        Ok(())
    }

    fn get_commit_hash(&self, rev: &str) -> Result<String> {
        self.run(&["rev-parse", "--verify", &format!("{rev}^{{commit}}")])
    }

    fn push(&self, branch: &str, remote_branch: Option<&str>, force: bool) -> Result<()> {
        let refspec = format!("{branch}:refs/heads/{}", remote_branch.unwrap_or(branch));
        let mut args = vec!["push"];
        if force {
            args.push("--force");
        }
        args.push(&self.remote);
        args.push(&refspec);
        self.run(&args)?;
        Ok(())
    }

    fn remove_branch(&self, branch: &str) -> Result<()> {
        // Never delete the branch we are standing on
        if self.run(&["symbolic-ref", "--short", "HEAD"]).ok().as_deref() == Some(branch) {
            self.run(&["checkout", "--detach"])?;
        }
        if let Err(e) = self.run(&["branch", "-D", branch]) {
            debug!(branch, error = %e, "no local branch to delete");
        }
        let refspec = format!(":refs/heads/{branch}");
        if let Err(e) = self.run(&["push", &self.remote, &refspec]) {
            debug!(branch, error = %e, "no remote branch to delete");
        }
        Ok(())
    }

    fn rebase(&self, branch: &str, onto: &str) -> Result<String> {
        self.run(&["checkout", branch, "--"])?;
        if let Err(e) = self.run(&["rebase", onto]) {
            self.abort("rebase");
            return Err(e);
        }
        self.get_commit_hash("HEAD")
    }

    fn merge(&self, branch: &str, other: &str) -> Result<String> {
        self.run(&["checkout", branch, "--"])?;
        if let Err(e) = self.run(&["merge", "--no-ff", "--no-edit", other]) {
            self.abort("merge");
            return Err(e);
        }
        self.get_commit_hash("HEAD")
    }

    fn fast_forward(&self, branch: &str, other: &str) -> Result<String> {
        self.run(&["checkout", branch, "--"])?;
        self.run(&["merge", "--ff-only", other])?;
        self.get_commit_hash("HEAD")
    }

    fn add_trailer(
        &self,
        branch: &str,
        start_commit: &str,
        trailer_name: &str,
        values: &[String],
    ) -> Result<String> {
        let range = format!("{start_commit}..{branch}");
        let listing = self.run(&["rev-list", "--reverse", "--topo-order", &range])?;
        let commits: Vec<&str> = listing.lines().filter(|l| !l.is_empty()).collect();
        if commits.is_empty() {
            return self.get_commit_hash(branch);
        }

        // Old commit -> rewritten commit, so parents inside the range follow along
        let mut rewritten: Vec<(String, String)> = Vec::with_capacity(commits.len());
        for commit in commits {
            let tree = self.run(&["rev-parse", &format!("{commit}^{{tree}}")])?;
            let parents_line = self.run(&["rev-list", "--parents", "-n", "1", commit])?;
            let message = self.run(&["log", "-1", "--format=%B", commit])?;
            let meta = self.run(&[
                "log",
                "-1",
                "--format=%an%n%ae%n%aI%n%cn%n%ce%n%cI",
                commit,
            ])?;
            let meta: Vec<&str> = meta.lines().collect();
            let [author_name, author_email, author_date, committer_name, committer_email, committer_date] =
                meta[..]
            else {
                return Err(Error::Git(format!("unexpected log output for {commit}")));
            };

            let new_message = rewrite_trailers(&message, trailer_name, values);

            let mut args: Vec<String> = vec!["commit-tree".to_string(), tree];
            for parent in parents_line.split_whitespace().skip(1) {
                let mapped = rewritten
                    .iter()
                    .find(|(old, _)| old == parent)
                    .map_or(parent, |(_, new)| new.as_str());
                args.push("-p".to_string());
                args.push(mapped.to_string());
            }
            args.push("-m".to_string());
            args.push(new_message);
            let args: Vec<&str> = args.iter().map(String::as_str).collect();

            let new_commit = self.run_with_env(
                &args,
                &[
                    ("GIT_AUTHOR_NAME", author_name),
                    ("GIT_AUTHOR_EMAIL", author_email),
                    ("GIT_AUTHOR_DATE", author_date),
                    ("GIT_COMMITTER_NAME", committer_name),
                    ("GIT_COMMITTER_EMAIL", committer_email),
                    ("GIT_COMMITTER_DATE", committer_date),
                ],
            )?;
            rewritten.push((commit.to_string(), new_commit));
        }

        let head = rewritten
            .last()
            .map(|(_, new)| new.clone())
            .ok_or_else(|| Error::Internal("no commits rewritten".to_string()))?;
        self.run(&["checkout", "-B", branch, &head, "--"])?;
        debug!(branch, trailer_name, %head, "rewrote trailers");
        Ok(head)
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> Result<bool> {
        let output = self
            .command()
            .args(["merge-base", "--is-ancestor", ancestor, descendant])
            .output()
            .map_err(|e| Error::Git(format!("failed to run git merge-base: {e}")))?;
        match output.status.code() {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => {
                check(&output, "git merge-base --is-ancestor")?;
                Ok(false)
            }
        }
    }
}
