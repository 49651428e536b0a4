//! In-memory stand-in for the hosted repository
//!
//! The mock platform and the mock working copy share one `FakeRemote`, so a
//! push made through git is immediately what the API reports: merge request
//! heads are read from branch heads, pipelines appear when a branch is pushed,
//! and accepting fast-forwards the target branch.

#![allow(dead_code)]

use marge_bot::types::{Pipeline, PipelineStatus};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// Project id used throughout the mocks
pub const PROJECT_ID: u64 = 1234;

/// A commit in the fake object store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub parents: Vec<String>,
    pub message: String,
}

/// Everything that lives on the server
#[derive(Debug, Default)]
pub struct RemoteState {
    pub commits: HashMap<String, Commit>,
    pub branches: HashMap<String, String>,
    pub pipelines: Vec<Pipeline>,
    /// Status given to pipelines created by pushes, per branch
    pub ci_results: HashMap<String, PipelineStatus>,
    /// Branches whose pushed pipelines run until they are listed once
    pub slow_ci: HashSet<String>,
    next_commit: u64,
    next_pipeline: u64,
}

impl RemoteState {
    /// Store a commit and return its id
    pub fn new_commit(&mut self, parents: Vec<String>, message: &str) -> String {
        self.next_commit += 1;
        let id = format!("c{:04}", self.next_commit);
        self.insert_commit(&id, parents, message);
        id
    }

    /// Store a commit under a chosen id
    pub fn insert_commit(&mut self, id: &str, parents: Vec<String>, message: &str) {
        self.commits.insert(
            id.to_string(),
            Commit {
                parents,
                message: message.to_string(),
            },
        );
    }

    /// Head of a branch on the server
    pub fn head(&self, branch: &str) -> Option<String> {
        self.branches.get(branch).cloned()
    }

    /// Someone else commits on top of `branch` (no pipeline, no bot involved)
    pub fn commit_on(&mut self, branch: &str, message: &str) -> String {
        let parents = self.head(branch).into_iter().collect();
        let id = self.new_commit(parents, message);
        self.branches.insert(branch.to_string(), id.clone());
        id
    }

    /// Someone force-pushes a replacement head for `branch`
    pub fn rewrite(&mut self, branch: &str, message: &str) -> String {
        let head = self.head(branch).unwrap_or_default();
        let parents = self
            .commits
            .get(&head)
            .map(|c| c.parents.clone())
            .unwrap_or_default();
        let id = self.new_commit(parents, message);
        self.branches.insert(branch.to_string(), id.clone());
        id
    }

    /// All commits reachable from `id`, including itself
    pub fn ancestors(&self, id: &str) -> HashSet<String> {
        let mut seen = HashSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(current) = stack.pop() {
            if !seen.insert(current.clone()) {
                continue;
            }
            if let Some(commit) = self.commits.get(&current) {
                stack.extend(commit.parents.iter().cloned());
            }
        }
        seen
    }

    /// Whether `ancestor` is reachable from `descendant`
    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.ancestors(descendant).contains(ancestor)
    }

    /// Commits reachable from `head` but not from `base`, oldest first
    pub fn commits_between(&self, base: &str, head: &str) -> Vec<String> {
        let excluded = self.ancestors(base);
        let mut chain = Vec::new();
        let mut current = Some(head.to_string());
        while let Some(id) = current {
            if excluded.contains(&id) {
                break;
            }
            let parent = self.commits.get(&id).and_then(|c| c.parents.first().cloned());
            chain.push(id);
            current = parent;
        }
        chain.reverse();
        chain
    }

    /// Record a pipeline
    pub fn add_pipeline(&mut self, branch: &str, sha: &str, status: PipelineStatus) -> u64 {
        self.next_pipeline += 1;
        let id = self.next_pipeline;
        self.pipelines.push(Pipeline {
            id,
            project_id: PROJECT_ID,
            ref_name: branch.to_string(),
            sha: sha.to_string(),
            status,
        });
        id
    }

    /// Update a branch on behalf of a push, starting CI for a new head
    pub fn push_branch(&mut self, branch: &str, sha: &str) {
        self.branches.insert(branch.to_string(), sha.to_string());
        let has_pipeline = self
            .pipelines
            .iter()
            .any(|p| p.ref_name == branch && p.sha == sha);
        if !has_pipeline {
            let status = if self.slow_ci.contains(branch) {
                PipelineStatus::Running
            } else {
                self.ci_results
                    .get(branch)
                    .copied()
                    .unwrap_or(PipelineStatus::Success)
            };
            self.add_pipeline(branch, sha, status);
        }
    }

    /// Newest pipeline for the current head of `branch` passed
    pub fn head_pipeline_green(&self, branch: &str) -> bool {
        let Some(head) = self.head(branch) else {
            return false;
        };
        self.pipelines
            .iter()
            .filter(|p| p.ref_name == branch && p.sha == head)
            .max_by_key(|p| p.id)
            .is_some_and(|p| p.status.is_green())
    }

    /// Running pipelines on a slow branch pass once somebody has looked
    pub fn finish_slow_pipelines(&mut self, branch: &str) {
        if !self.slow_ci.contains(branch) {
            return;
        }
        for pipeline in &mut self.pipelines {
            if pipeline.ref_name == branch && pipeline.status == PipelineStatus::Running {
                pipeline.status = PipelineStatus::Success;
            }
        }
    }
}

/// Shared handle to the fake server
#[derive(Debug, Clone, Default)]
pub struct FakeRemote {
    state: Arc<Mutex<RemoteState>>,
}

impl FakeRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self) -> MutexGuard<'_, RemoteState> {
        self.state.lock().unwrap()
    }

    /// Create `branch` with a single root commit named `id`
    pub fn seed_branch(&self, branch: &str, id: &str) {
        let mut state = self.lock();
        state.insert_commit(id, Vec::new(), "Initial commit");
        state.branches.insert(branch.to_string(), id.to_string());
    }

    /// Create `branch` with one commit on top of `base`'s head and a
    /// pipeline of the given status for it
    pub fn feature_branch(&self, branch: &str, base: &str, ci: PipelineStatus) -> String {
        let mut state = self.lock();
        let parent = state.head(base).into_iter().collect();
        let id = state.new_commit(parent, &format!("Implement {branch}"));
        state.branches.insert(branch.to_string(), id.clone());
        state.add_pipeline(branch, &id, ci);
        id
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.lock().head(branch)
    }

    /// Status for pipelines that pushes to `branch` will create
    pub fn set_ci_result(&self, branch: &str, status: PipelineStatus) {
        self.lock().ci_results.insert(branch.to_string(), status);
    }

    /// Pipelines that pushes to `branch` will create start out running
    pub fn set_slow_ci(&self, branch: &str) {
        self.lock().slow_ci.insert(branch.to_string());
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        self.lock().is_ancestor(ancestor, descendant)
    }

    pub fn message(&self, id: &str) -> Option<String> {
        self.lock().commits.get(id).map(|c| c.message.clone())
    }

    pub fn pipelines(&self) -> Vec<Pipeline> {
        self.lock().pipelines.clone()
    }
}
