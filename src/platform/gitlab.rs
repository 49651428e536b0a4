//! GitLab platform service implementation

use crate::error::{Error, Result};
use crate::platform::PlatformService;
use crate::types::{
    AcceptOptions, Approvals, Approver, MergeRequest, MergeRequestQuery, MergeResult, MrState,
    NewMergeRequest, Pipeline, PipelineQuery, PipelineStatus, Project, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

/// GitLab service using reqwest
pub struct GitLabService {
    client: Client,
    token: String,
    base_url: Url,
    project_path: String,
    project_id: OnceCell<u64>,
}

#[derive(Deserialize)]
struct ApiUser {
    id: u64,
    username: String,
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    public_email: Option<String>,
}

#[derive(Deserialize)]
struct ApiProject {
    id: u64,
    path_with_namespace: String,
    #[serde(default)]
    only_allow_merge_if_pipeline_succeeds: bool,
}

#[derive(Deserialize)]
struct IdOnly {
    id: u64,
}

#[derive(Deserialize)]
struct ApiMergeRequest {
    id: u64,
    iid: u64,
    project_id: u64,
    source_project_id: u64,
    title: String,
    source_branch: String,
    target_branch: String,
    #[serde(default)]
    sha: Option<String>,
    state: String, // "opened", "closed", "merged", "locked"
    #[serde(default)]
    work_in_progress: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assignees: Vec<IdOnly>,
    #[serde(default)]
    assignee: Option<IdOnly>,
    author: IdOnly,
    #[serde(default)]
    squash: bool,
    web_url: String,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
}

impl From<ApiMergeRequest> for MergeRequest {
    fn from(mr: ApiMergeRequest) -> Self {
        // Older GitLab versions only send the single `assignee`
        let mut assignee_ids: Vec<u64> = mr.assignees.iter().map(|a| a.id).collect();
        if let Some(assignee) = mr.assignee {
            if !assignee_ids.contains(&assignee.id) {
                assignee_ids.push(assignee.id);
            }
        }
        Self {
            id: mr.id,
            iid: mr.iid,
            project_id: mr.project_id,
            source_project_id: mr.source_project_id,
            title: mr.title,
            source_branch: mr.source_branch,
            target_branch: mr.target_branch,
            sha: mr.sha.unwrap_or_default(),
            state: MrState::from_api(&mr.state),
            work_in_progress: mr.work_in_progress || mr.draft,
            assignee_ids,
            author_id: mr.author.id,
            squash: mr.squash,
            web_url: mr.web_url,
            created_at: mr.created_at,
        }
    }
}

#[derive(Deserialize)]
struct ApiApprover {
    user: ApiUser,
}

#[derive(Deserialize)]
struct ApiApprovals {
    iid: u64,
    #[serde(default)]
    approvals_required: u32,
    #[serde(default)]
    approvals_left: u32,
    #[serde(default)]
    approved_by: Vec<ApiApprover>,
}

#[derive(Deserialize)]
struct ApiPipeline {
    id: u64,
    #[serde(default)]
    project_id: Option<u64>,
    #[serde(rename = "ref")]
    ref_name: String,
    sha: String,
    status: String,
}

#[derive(Deserialize)]
struct ApiBranch {
    commit: IdOnlyString,
}

#[derive(Deserialize)]
struct IdOnlyString {
    id: String,
}

/// Merge response
#[derive(Deserialize)]
struct MergeResponse {
    state: String,
    #[serde(default)]
    merge_commit_sha: Option<String>,
    #[serde(default)]
    squash_commit_sha: Option<String>,
    #[serde(default)]
    sha: Option<String>,
}

#[derive(Serialize)]
struct CreateMrPayload<'a> {
    source_branch: &'a str,
    target_branch: &'a str,
    title: &'a str,
    labels: String,
}

#[derive(Serialize)]
struct AcceptPayload<'a> {
    sha: &'a str,
    should_remove_source_branch: bool,
    squash: bool,
}

/// Default request timeout in seconds
const DEFAULT_TIMEOUT_SECS: u64 = 30;

impl GitLabService {
    /// Create a new GitLab service bound to `project_path` (`group/project`)
    pub fn new(token: String, base_url: Url, project_path: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| Error::GitLabApi(format!("failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            token,
            base_url,
            project_path,
            project_id: OnceCell::new(),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!(
            "{}/api/v4{}",
            self.base_url.as_str().trim_end_matches('/'),
            path
        )
    }

    fn project_url(&self, path: &str) -> String {
        let project = urlencoding::encode(&self.project_path);
        self.api_url(&format!("/projects/{project}{path}"))
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request.header("PRIVATE-TOKEN", &self.token)
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let value = self
            .authed(request)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::GitLabApi(e.to_string()))?
            .json()
            .await?;
        Ok(value)
    }

    async fn send_empty(&self, request: RequestBuilder) -> Result<()> {
        self.authed(request)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::GitLabApi(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl PlatformService for GitLabService {
    async fn current_user(&self) -> Result<User> {
        let user: ApiUser = self
            .send_json(self.client.get(self.api_url("/user")))
            .await?;
        debug!(user_id = user.id, username = %user.username, "fetched current user");
        Ok(User {
            id: user.id,
            username: user.username,
            name: user.name,
            email: user.email.or(user.public_email),
        })
    }

    async fn get_project(&self) -> Result<Project> {
        let project: ApiProject = self.send_json(self.client.get(self.project_url(""))).await?;
        debug!(project_id = project.id, "fetched project");
        Ok(Project {
            id: project.id,
            path_with_namespace: project.path_with_namespace,
            only_allow_merge_if_pipeline_succeeds: project.only_allow_merge_if_pipeline_succeeds,
        })
    }

    async fn get_merge_request(&self, iid: u64) -> Result<MergeRequest> {
        debug!(mr_iid = iid, "fetching MR");
        let mr: ApiMergeRequest = self
            .send_json(
                self.client
                    .get(self.project_url(&format!("/merge_requests/{iid}"))),
            )
            .await?;
        Ok(mr.into())
    }

    async fn search_merge_requests(&self, query: &MergeRequestQuery) -> Result<Vec<MergeRequest>> {
        debug!(state = %query.state, labels = ?query.labels, "searching MRs");
        let mut params: Vec<(&str, String)> = vec![
            ("state", query.state.as_api().to_string()),
            ("order_by", "created_at".to_string()),
            ("sort", query.sort.as_api().to_string()),
            ("per_page", "100".to_string()),
        ];
        if !query.labels.is_empty() {
            params.push(("labels", query.labels.join(",")));
        }
        if let Some(author_id) = query.author_id {
            params.push(("author_id", author_id.to_string()));
        }
        if let Some(assignee_id) = query.assignee_id {
            params.push(("assignee_id", assignee_id.to_string()));
        }

        let mrs: Vec<ApiMergeRequest> = self
            .send_json(
                self.client
                    .get(self.project_url("/merge_requests"))
                    .query(&params),
            )
            .await?;
        debug!(count = mrs.len(), "found MRs");
        Ok(mrs.into_iter().map(Into::into).collect())
    }

    async fn create_merge_request(&self, request: &NewMergeRequest) -> Result<MergeRequest> {
        debug!(
            source = %request.source_branch,
            target = %request.target_branch,
            "creating MR"
        );
        let payload = CreateMrPayload {
            source_branch: &request.source_branch,
            target_branch: &request.target_branch,
            title: &request.title,
            labels: request.labels.join(","),
        };
        let mr: ApiMergeRequest = self
            .send_json(
                self.client
                    .post(self.project_url("/merge_requests"))
                    .json(&payload),
            )
            .await?;
        debug!(mr_iid = mr.iid, "created MR");
        Ok(mr.into())
    }

    async fn close_merge_request(&self, iid: u64) -> Result<()> {
        debug!(mr_iid = iid, "closing MR");
        self.send_empty(
            self.client
                .put(self.project_url(&format!("/merge_requests/{iid}")))
                .json(&serde_json::json!({ "state_event": "close" })),
        )
        .await
    }

    async fn accept_merge_request(&self, iid: u64, options: &AcceptOptions) -> Result<MergeResult> {
        debug!(mr_iid = iid, sha = %options.sha, "accepting MR");
        let payload = AcceptPayload {
            sha: &options.sha,
            should_remove_source_branch: options.should_remove_source_branch,
            squash: options.squash,
        };
        let response = self
            .authed(
                self.client
                    .put(self.project_url(&format!("/merge_requests/{iid}/merge")))
                    .json(&payload),
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 405/406/409 mean GitLab refused the merge itself, not a transport failure
            let message = match status.as_u16() {
                405 | 406 => "GitLab refused to merge this request".to_string(),
                409 => "SHA does not match HEAD of source branch".to_string(),
                _ => return Err(Error::GitLabApi(format!("Merge failed: {status} {body}"))),
            };
            debug!(mr_iid = iid, %status, "merge refused");
            return Ok(MergeResult {
                merged: false,
                sha: None,
                message: Some(message),
            });
        }

        let response: MergeResponse = response.json().await?;
        let merge_result = MergeResult {
            merged: response.state == "merged",
            sha: response
                .merge_commit_sha
                .or(response.squash_commit_sha)
                .or(response.sha),
            message: None,
        };
        debug!(
            mr_iid = iid,
            merged = merge_result.merged,
            sha = ?merge_result.sha,
            "merge complete"
        );
        Ok(merge_result)
    }

    async fn get_approvals(&self, iid: u64) -> Result<Approvals> {
        let approvals: ApiApprovals = self
            .send_json(
                self.client
                    .get(self.project_url(&format!("/merge_requests/{iid}/approvals"))),
            )
            .await?;
        Ok(Approvals {
            iid: approvals.iid,
            approvals_required: approvals.approvals_required,
            approvals_left: approvals.approvals_left,
            approved_by: approvals
                .approved_by
                .into_iter()
                .map(|a| Approver {
                    username: a.user.username,
                    name: a.user.name,
                    email: a.user.email.or(a.user.public_email),
                })
                .collect(),
        })
    }

    async fn create_note(&self, iid: u64, body: &str) -> Result<()> {
        debug!(mr_iid = iid, "creating MR note");
        self.send_empty(
            self.client
                .post(self.project_url(&format!("/merge_requests/{iid}/notes")))
                .json(&serde_json::json!({ "body": body })),
        )
        .await
    }

    async fn assign_merge_request(&self, iid: u64, assignee_ids: &[u64]) -> Result<()> {
        debug!(mr_iid = iid, ?assignee_ids, "reassigning MR");
        self.send_empty(
            self.client
                .put(self.project_url(&format!("/merge_requests/{iid}")))
                .json(&serde_json::json!({ "assignee_ids": assignee_ids })),
        )
        .await
    }

    async fn get_branch_head(&self, branch: &str) -> Result<String> {
        let encoded = urlencoding::encode(branch);
        let branch: ApiBranch = self
            .send_json(
                self.client
                    .get(self.project_url(&format!("/repository/branches/{encoded}"))),
            )
            .await?;
        Ok(branch.commit.id)
    }

    async fn get_pipeline(&self, pipeline_id: u64) -> Result<Pipeline> {
        let pipeline: ApiPipeline = self
            .send_json(
                self.client
                    .get(self.project_url(&format!("/pipelines/{pipeline_id}"))),
            )
            .await?;
        self.pipeline_from_api(pipeline).await
    }

    async fn list_pipelines(&self, query: &PipelineQuery) -> Result<Vec<Pipeline>> {
        let mut params: Vec<(&str, &str)> = vec![
            ("ref", query.ref_name.as_str()),
            ("order_by", "id"),
            ("sort", "desc"),
        ];
        if let Some(sha) = &query.sha {
            params.push(("sha", sha.as_str()));
        }
        let pipelines: Vec<ApiPipeline> = self
            .send_json(
                self.client
                    .get(self.project_url("/pipelines"))
                    .query(&params),
            )
            .await?;
        let mut result = Vec::with_capacity(pipelines.len());
        for pipeline in pipelines {
            result.push(self.pipeline_from_api(pipeline).await?);
        }
        Ok(result)
    }

    async fn cancel_pipeline(&self, pipeline_id: u64) -> Result<()> {
        debug!(pipeline_id, "cancelling pipeline");
        self.send_empty(
            self.client
                .post(self.project_url(&format!("/pipelines/{pipeline_id}/cancel"))),
        )
        .await
    }
}

impl GitLabService {
    /// Pipelines listed under a project don't always carry `project_id`;
    /// fill it in from the project itself in that case.
    async fn pipeline_from_api(&self, pipeline: ApiPipeline) -> Result<Pipeline> {
        let project_id = match pipeline.project_id {
            Some(id) => id,
            None => {
                *self
                    .project_id
                    .get_or_try_init(|| async { self.get_project().await.map(|p| p.id) })
                    .await?
            }
        };
        Ok(Pipeline {
            id: pipeline.id,
            project_id,
            ref_name: pipeline.ref_name,
            sha: pipeline.sha,
            status: PipelineStatus::from_api(&pipeline.status),
        })
    }
}
