//! Mock platform service for testing
//!
//! These are test utilities - not all may be used in every test binary.

#![allow(dead_code)]

use super::remote::{FakeRemote, PROJECT_ID, RemoteState};
use async_trait::async_trait;
use marge_bot::error::{Error, Result};
use marge_bot::platform::PlatformService;
use marge_bot::types::{
    AcceptOptions, Approvals, Approver, MergeRequest, MergeRequestQuery, MergeResult, MrState,
    NewMergeRequest, Pipeline, PipelineQuery, PipelineStatus, Project, SortOrder,
    User,
};
use std::collections::HashMap;
use std::sync::Mutex;

/// Id of the bot account
pub const BOT_USER_ID: u64 = 1;
/// Id of the author of every seeded merge request
pub const AUTHOR_ID: u64 = 2;

/// Call record for `accept_merge_request`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AcceptCall {
    pub iid: u64,
    pub options: AcceptOptions,
}

/// Call record for `create_note`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoteCall {
    pub iid: u64,
    pub body: String,
}

/// When a scripted side effect fires
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Trigger {
    /// Right after the given request was accepted
    AfterAccept(u64),
    /// On the first pipeline listing for the given ref
    PipelinePoll(String),
}

type Hook = Box<dyn FnOnce(&mut RemoteState) + Send>;

#[derive(Debug, Clone)]
struct MrRecord {
    request: MergeRequest,
    labels: Vec<String>,
}

/// Simple mock platform service for testing
///
/// Features:
/// - Merge request heads follow the shared remote's branches
/// - Call tracking for verification
/// - Scripted side effects (someone else pushing) at chosen points
/// - Error injection for failure path testing
pub struct MockPlatformService {
    remote: FakeRemote,
    user: User,
    project: Mutex<Project>,
    requests: Mutex<HashMap<u64, MrRecord>>,
    approvals: Mutex<HashMap<u64, Approvals>>,
    hooks: Mutex<Vec<(Trigger, Hook)>>,
    // Call tracking
    accept_calls: Mutex<Vec<AcceptCall>>,
    create_mr_calls: Mutex<Vec<NewMergeRequest>>,
    close_calls: Mutex<Vec<u64>>,
    note_calls: Mutex<Vec<NoteCall>>,
    assign_calls: Mutex<Vec<(u64, Vec<u64>)>>,
    cancel_calls: Mutex<Vec<u64>>,
    search_calls: Mutex<Vec<MergeRequestQuery>>,
    // Error injection
    accept_errors: Mutex<HashMap<u64, (String, u32)>>,
    accept_responses: Mutex<HashMap<u64, MergeResult>>,
}

impl MockPlatformService {
    /// Create a mock over `remote` for a project that requires green CI
    pub fn new(remote: FakeRemote) -> Self {
        Self {
            remote,
            user: User {
                id: BOT_USER_ID,
                username: "marge-bot".to_string(),
                name: "Marge Bot".to_string(),
                email: Some("marge-bot@example.com".to_string()),
            },
            project: Mutex::new(Project {
                id: PROJECT_ID,
                path_with_namespace: "group/project".to_string(),
                only_allow_merge_if_pipeline_succeeds: true,
            }),
            requests: Mutex::new(HashMap::new()),
            approvals: Mutex::new(HashMap::new()),
            hooks: Mutex::new(Vec::new()),
            accept_calls: Mutex::new(Vec::new()),
            create_mr_calls: Mutex::new(Vec::new()),
            close_calls: Mutex::new(Vec::new()),
            note_calls: Mutex::new(Vec::new()),
            assign_calls: Mutex::new(Vec::new()),
            cancel_calls: Mutex::new(Vec::new()),
            search_calls: Mutex::new(Vec::new()),
            accept_errors: Mutex::new(HashMap::new()),
            accept_responses: Mutex::new(HashMap::new()),
        }
    }

    pub fn user(&self) -> User {
        self.user.clone()
    }

    pub fn project(&self) -> Project {
        self.project.lock().unwrap().clone()
    }

    pub fn set_requires_ci(&self, required: bool) {
        self.project
            .lock()
            .unwrap()
            .only_allow_merge_if_pipeline_succeeds = required;
    }

    // === Setup ===

    /// Register an open request from `source` into `target`, assigned to the bot
    pub fn add_request(&self, iid: u64, source: &str, target: &str) -> MergeRequest {
        let sha = self.remote.head(source).unwrap_or_default();
        let request = MergeRequest {
            id: iid + 1000,
            iid,
            project_id: PROJECT_ID,
            source_project_id: PROJECT_ID,
            title: format!("Change {iid}"),
            source_branch: source.to_string(),
            target_branch: target.to_string(),
            sha,
            state: MrState::Opened,
            work_in_progress: false,
            assignee_ids: vec![BOT_USER_ID],
            author_id: AUTHOR_ID,
            squash: false,
            web_url: format!("http://git.example.com/group/project/merge_requests/{iid}"),
            created_at: None,
        };
        self.insert(request.clone(), Vec::new());
        request
    }

    /// Register an arbitrary request record
    pub fn insert(&self, request: MergeRequest, labels: Vec<String>) {
        self.requests
            .lock()
            .unwrap()
            .insert(request.iid, MrRecord { request, labels });
    }

    /// Change a stored request in place
    pub fn update_request(&self, iid: u64, f: impl FnOnce(&mut MergeRequest)) {
        let mut requests = self.requests.lock().unwrap();
        let record = requests.get_mut(&iid).expect("unknown merge request");
        f(&mut record.request);
    }

    pub fn set_approvals(&self, approvals: Approvals) {
        self.approvals
            .lock()
            .unwrap()
            .insert(approvals.iid, approvals);
    }

    /// Run `hook` against the remote when `trigger` happens
    pub fn on(&self, trigger: Trigger, hook: impl FnOnce(&mut RemoteState) + Send + 'static) {
        self.hooks.lock().unwrap().push((trigger, Box::new(hook)));
    }

    fn fire(&self, trigger: &Trigger) {
        let due: Vec<Hook> = {
            let mut hooks = self.hooks.lock().unwrap();
            let (due, rest): (Vec<_>, Vec<_>) =
                hooks.drain(..).partition(|(t, _)| t == trigger);
            *hooks = rest;
            due.into_iter().map(|(_, hook)| hook).collect()
        };
        if due.is_empty() {
            return;
        }
        let mut state = self.remote.lock();
        for hook in due {
            hook(&mut state);
        }
    }

    // === Error injection ===

    /// Make the next `times` accepts of `iid` fail with an API error
    pub fn fail_accept_for(&self, iid: u64, msg: &str, times: u32) {
        self.accept_errors
            .lock()
            .unwrap()
            .insert(iid, (msg.to_string(), times));
    }

    /// Make `accept_merge_request` return `result` for `iid` without merging
    pub fn set_accept_response(&self, iid: u64, result: MergeResult) {
        self.accept_responses.lock().unwrap().insert(iid, result);
    }

    // === Call inspection ===

    pub fn accept_calls(&self) -> Vec<AcceptCall> {
        self.accept_calls.lock().unwrap().clone()
    }

    pub fn create_mr_calls(&self) -> Vec<NewMergeRequest> {
        self.create_mr_calls.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> Vec<u64> {
        self.close_calls.lock().unwrap().clone()
    }

    pub fn note_calls(&self) -> Vec<NoteCall> {
        self.note_calls.lock().unwrap().clone()
    }

    pub fn assign_calls(&self) -> Vec<(u64, Vec<u64>)> {
        self.assign_calls.lock().unwrap().clone()
    }

    pub fn cancel_calls(&self) -> Vec<u64> {
        self.cancel_calls.lock().unwrap().clone()
    }

    pub fn search_calls(&self) -> Vec<MergeRequestQuery> {
        self.search_calls.lock().unwrap().clone()
    }

    pub fn state_of(&self, iid: u64) -> MrState {
        self.requests.lock().unwrap()[&iid].request.state
    }

    // === Assertions ===

    pub fn assert_accepted(&self, iids: &[u64]) {
        let accepted: Vec<u64> = self.accept_calls().iter().map(|c| c.iid).collect();
        assert_eq!(accepted, iids, "unexpected accept calls");
    }

    pub fn assert_no_accepts(&self) {
        let calls = self.accept_calls();
        assert!(calls.is_empty(), "expected no accepts, got {calls:?}");
    }

    /// The live view of a record: open requests report their branch head
    fn view(&self, record: &MrRecord) -> MergeRequest {
        let mut request = record.request.clone();
        if request.state == MrState::Opened {
            if let Some(head) = self.remote.head(&request.source_branch) {
                request.sha = head;
            }
        }
        request
    }
}

#[async_trait]
impl PlatformService for MockPlatformService {
    async fn current_user(&self) -> Result<User> {
        Ok(self.user.clone())
    }

    async fn get_project(&self) -> Result<Project> {
        Ok(self.project())
    }

    async fn get_merge_request(&self, iid: u64) -> Result<MergeRequest> {
        let requests = self.requests.lock().unwrap();
        let record = requests
            .get(&iid)
            .ok_or_else(|| Error::GitLabApi(format!("404 merge request !{iid} not found")))?;
        Ok(self.view(record))
    }

    async fn search_merge_requests(&self, query: &MergeRequestQuery) -> Result<Vec<MergeRequest>> {
        self.search_calls.lock().unwrap().push(query.clone());
        let requests = self.requests.lock().unwrap();
        let mut found: Vec<&MrRecord> = requests
            .values()
            .filter(|r| r.request.state == query.state)
            .filter(|r| query.labels.iter().all(|l| r.labels.contains(l)))
            .filter(|r| query.author_id.is_none_or(|id| r.request.author_id == id))
            .filter(|r| {
                query
                    .assignee_id
                    .is_none_or(|id| r.request.assignee_ids.contains(&id))
            })
            .collect();
        found.sort_by_key(|r| r.request.iid);
        if query.sort == SortOrder::Desc {
            found.reverse();
        }
        Ok(found.into_iter().map(|r| self.view(r)).collect())
    }

    async fn create_merge_request(&self, request: &NewMergeRequest) -> Result<MergeRequest> {
        self.create_mr_calls.lock().unwrap().push(request.clone());
        let mut requests = self.requests.lock().unwrap();
        let iid = requests.keys().max().copied().unwrap_or(0).max(100) + 1;
        let created = MergeRequest {
            id: iid + 1000,
            iid,
            project_id: PROJECT_ID,
            source_project_id: PROJECT_ID,
            title: request.title.clone(),
            source_branch: request.source_branch.clone(),
            target_branch: request.target_branch.clone(),
            sha: self.remote.head(&request.source_branch).unwrap_or_default(),
            state: MrState::Opened,
            work_in_progress: false,
            assignee_ids: Vec::new(),
            author_id: self.user.id,
            squash: false,
            web_url: format!("http://git.example.com/group/project/merge_requests/{iid}"),
            created_at: None,
        };
        requests.insert(
            iid,
            MrRecord {
                request: created.clone(),
                labels: request.labels.clone(),
            },
        );
        Ok(created)
    }

    async fn close_merge_request(&self, iid: u64) -> Result<()> {
        self.close_calls.lock().unwrap().push(iid);
        if let Some(record) = self.requests.lock().unwrap().get_mut(&iid) {
            record.request.state = MrState::Closed;
        }
        Ok(())
    }

    async fn accept_merge_request(&self, iid: u64, options: &AcceptOptions) -> Result<MergeResult> {
        self.accept_calls.lock().unwrap().push(AcceptCall {
            iid,
            options: options.clone(),
        });
        if let Some((msg, times)) = self.accept_errors.lock().unwrap().get_mut(&iid) {
            if *times > 0 {
                *times -= 1;
                return Err(Error::GitLabApi(msg.clone()));
            }
        }
        let requires_ci = self.project().only_allow_merge_if_pipeline_succeeds;
        if let Some(result) = self.accept_responses.lock().unwrap().get(&iid) {
            return Ok(result.clone());
        }

        let result = {
            let mut requests = self.requests.lock().unwrap();
            let record = requests
                .get_mut(&iid)
                .ok_or_else(|| Error::GitLabApi(format!("404 merge request !{iid} not found")))?;
            let request = &mut record.request;
            let refused = |message: &str| MergeResult {
                merged: false,
                sha: None,
                message: Some(message.to_string()),
            };

            let mut remote = self.remote.lock();
            let source_head = remote.head(&request.source_branch).unwrap_or_default();
            let target_head = remote.head(&request.target_branch).unwrap_or_default();
            if request.state != MrState::Opened {
                refused("405 Method Not Allowed")
            } else if source_head != options.sha {
                refused("SHA does not match HEAD of source branch")
            } else if requires_ci && !remote.head_pipeline_green(&request.source_branch) {
                refused("405 Method Not Allowed: pipeline has not succeeded")
            } else if !remote.is_ancestor(&target_head, &source_head) {
                refused("Branch cannot be merged")
            } else {
                remote
                    .branches
                    .insert(request.target_branch.clone(), source_head.clone());
                if options.should_remove_source_branch {
                    remote.branches.remove(&request.source_branch);
                }
                request.state = MrState::Merged;
                request.sha = source_head.clone();
                MergeResult {
                    merged: true,
                    sha: Some(source_head),
                    message: None,
                }
            }
        };

        if result.merged {
            self.fire(&Trigger::AfterAccept(iid));
        }
        Ok(result)
    }

    async fn get_approvals(&self, iid: u64) -> Result<Approvals> {
        if let Some(approvals) = self.approvals.lock().unwrap().get(&iid) {
            return Ok(approvals.clone());
        }
        Ok(Approvals {
            iid,
            approvals_required: 1,
            approvals_left: 0,
            approved_by: vec![Approver {
                username: "rita".to_string(),
                name: "Rita Reviewer".to_string(),
                email: Some("rita@example.com".to_string()),
            }],
        })
    }

    async fn create_note(&self, iid: u64, body: &str) -> Result<()> {
        self.note_calls.lock().unwrap().push(NoteCall {
            iid,
            body: body.to_string(),
        });
        Ok(())
    }

    async fn assign_merge_request(&self, iid: u64, assignee_ids: &[u64]) -> Result<()> {
        self.assign_calls
            .lock()
            .unwrap()
            .push((iid, assignee_ids.to_vec()));
        if let Some(record) = self.requests.lock().unwrap().get_mut(&iid) {
            record.request.assignee_ids = assignee_ids.to_vec();
        }
        Ok(())
    }

    async fn get_branch_head(&self, branch: &str) -> Result<String> {
        self.remote
            .head(branch)
            .ok_or_else(|| Error::GitLabApi(format!("404 branch '{branch}' not found")))
    }

    async fn get_pipeline(&self, pipeline_id: u64) -> Result<Pipeline> {
        self.remote
            .pipelines()
            .into_iter()
            .find(|p| p.id == pipeline_id)
            .ok_or_else(|| Error::GitLabApi(format!("404 pipeline {pipeline_id} not found")))
    }

    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<Vec<Pipeline>> {
        self.fire(&Trigger::PipelinePoll(query.ref_name.clone()));
        let mut pipelines: Vec<Pipeline> = self
            .remote
            .pipelines()
            .into_iter()
            .filter(|p| p.ref_name == query.ref_name)
            .filter(|p| query.sha.as_ref().is_none_or(|sha| &p.sha == sha))
            .collect();
        pipelines.sort_by(|a, b| b.id.cmp(&a.id));
        self.remote.lock().finish_slow_pipelines(&query.ref_name);
        Ok(pipelines)
    }

    async fn cancel_pipeline(&self, pipeline_id: u64) -> Result<()> {
        self.cancel_calls.lock().unwrap().push(pipeline_id);
        let mut state = self.remote.lock();
        if let Some(pipeline) = state.pipelines.iter_mut().find(|p| p.id == pipeline_id) {
            if pipeline.status.is_in_progress() {
                pipeline.status = PipelineStatus::Canceled;
            }
        }
        Ok(())
    }
}
