//! Orchestration API client surface.
//!
//! The engine only talks to the control plane through the [`Orchestration`]
//! trait; [`HttpOrchestration`] is the production implementation.

use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use poolhand_core::schemas::{Deployment, Flow, State, WorkPool, WorkerFlowRunResponse};
use poolhand_core::template::BlockDocumentResolver;

/// Errors surfaced by orchestration API calls.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The requested object does not exist server-side.
    #[error("object not found")]
    NotFound,
    /// The server explicitly aborted a state transition.
    #[error("abort signal from server: {0}")]
    Abort(String),
    /// Any other non-success HTTP response.
    #[error("http {status}: {body}")]
    Status {
        /// Response status code.
        status: StatusCode,
        /// Response body, as returned.
        body: String,
    },
    /// Transport-level failure.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    /// Anything else, including errors from test doubles.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Client surface the worker engine consumes.
#[async_trait::async_trait]
pub trait Orchestration: Send + Sync {
    /// Reads a work pool by name.
    async fn read_work_pool(&self, name: &str) -> Result<WorkPool, ApiError>;

    /// Creates a work pool with the given name and worker type.
    async fn create_work_pool(&self, name: &str, kind: &str) -> Result<WorkPool, ApiError>;

    /// Replaces a pool's base job template.
    async fn update_work_pool_template(
        &self,
        name: &str,
        base_job_template: &Value,
    ) -> Result<(), ApiError>;

    /// Sends a worker liveness heartbeat.
    async fn send_worker_heartbeat(
        &self,
        work_pool_name: &str,
        worker_name: &str,
    ) -> Result<(), ApiError>;

    /// Queries runs scheduled before the given instant on the given queues.
    /// An empty queue list means every queue in the pool.
    async fn get_scheduled_flow_runs(
        &self,
        work_pool_name: &str,
        scheduled_before: DateTime<Utc>,
        work_queue_names: &[String],
    ) -> Result<Vec<WorkerFlowRunResponse>, ApiError>;

    /// Reads a deployment by id.
    async fn read_deployment(&self, id: Uuid) -> Result<Deployment, ApiError>;

    /// Reads a flow by id.
    async fn read_flow(&self, id: Uuid) -> Result<Flow, ApiError>;

    /// Records the infrastructure identifier of a launched run.
    async fn update_flow_run_infrastructure_pid(
        &self,
        id: Uuid,
        infrastructure_pid: &str,
    ) -> Result<(), ApiError>;

    /// Proposes a state transition. Returns the state the server settled
    /// on, which may differ from the proposed one; an explicit abort comes
    /// back as [`ApiError::Abort`].
    async fn propose_state(&self, flow_run_id: Uuid, state: State) -> Result<State, ApiError>;
}

#[derive(Debug, Serialize)]
struct WorkPoolCreate<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    kind: &'a str,
}

#[derive(Debug, Serialize)]
struct WorkPoolUpdate<'a> {
    base_job_template: &'a Value,
}

#[derive(Debug, Serialize)]
struct HeartbeatRequest<'a> {
    name: &'a str,
}

#[derive(Debug, Serialize)]
struct ScheduledRunsRequest<'a> {
    scheduled_before: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    work_queue_names: Option<&'a [String]>,
}

#[derive(Debug, Serialize)]
struct FlowRunUpdate<'a> {
    infrastructure_pid: &'a str,
}

#[derive(Debug, Serialize)]
struct SetStateRequest {
    state: State,
    force: bool,
}

#[derive(Debug, Deserialize)]
struct OrchestrationResult {
    status: String,
    #[serde(default)]
    state: Option<State>,
    #[serde(default)]
    details: Option<OrchestrationDetails>,
}

#[derive(Debug, Deserialize)]
struct OrchestrationDetails {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlockDocument {
    #[serde(default)]
    data: Value,
}

/// HTTP client for the orchestration API.
pub struct HttpOrchestration {
    http: reqwest::Client,
    base: Url,
    api_key: Option<String>,
}

impl HttpOrchestration {
    /// Builds a client against the given API base URL.
    pub fn new(mut base: Url, api_key: Option<String>) -> anyhow::Result<Self> {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;
        Ok(Self {
            http,
            base,
            api_key,
        })
    }

    fn url(&self, path: &str) -> Result<Url, ApiError> {
        self.base
            .join(path)
            .map_err(|err| ApiError::Other(err.into()))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Status { status, body });
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl Orchestration for HttpOrchestration {
    async fn read_work_pool(&self, name: &str) -> Result<WorkPool, ApiError> {
        let url = self.url(&format!("work_pools/{name}"))?;
        let response = Self::check(self.authorize(self.http.get(url)).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn create_work_pool(&self, name: &str, kind: &str) -> Result<WorkPool, ApiError> {
        let url = self.url("work_pools/")?;
        let response = Self::check(
            self.authorize(self.http.post(url))
                .json(&WorkPoolCreate { name, kind })
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    async fn update_work_pool_template(
        &self,
        name: &str,
        base_job_template: &Value,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("work_pools/{name}"))?;
        Self::check(
            self.authorize(self.http.patch(url))
                .json(&WorkPoolUpdate { base_job_template })
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn send_worker_heartbeat(
        &self,
        work_pool_name: &str,
        worker_name: &str,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("work_pools/{work_pool_name}/workers/heartbeat"))?;
        Self::check(
            self.authorize(self.http.post(url))
                .json(&HeartbeatRequest { name: worker_name })
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn get_scheduled_flow_runs(
        &self,
        work_pool_name: &str,
        scheduled_before: DateTime<Utc>,
        work_queue_names: &[String],
    ) -> Result<Vec<WorkerFlowRunResponse>, ApiError> {
        let url = self.url(&format!("work_pools/{work_pool_name}/get_scheduled_flow_runs"))?;
        let request = ScheduledRunsRequest {
            scheduled_before,
            work_queue_names: if work_queue_names.is_empty() {
                None
            } else {
                Some(work_queue_names)
            },
        };
        let response = Self::check(
            self.authorize(self.http.post(url))
                .json(&request)
                .send()
                .await?,
        )
        .await?;
        Ok(response.json().await?)
    }

    async fn read_deployment(&self, id: Uuid) -> Result<Deployment, ApiError> {
        let url = self.url(&format!("deployments/{id}"))?;
        let response = Self::check(self.authorize(self.http.get(url)).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn read_flow(&self, id: Uuid) -> Result<Flow, ApiError> {
        let url = self.url(&format!("flows/{id}"))?;
        let response = Self::check(self.authorize(self.http.get(url)).send().await?).await?;
        Ok(response.json().await?)
    }

    async fn update_flow_run_infrastructure_pid(
        &self,
        id: Uuid,
        infrastructure_pid: &str,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("flow_runs/{id}"))?;
        Self::check(
            self.authorize(self.http.patch(url))
                .json(&FlowRunUpdate { infrastructure_pid })
                .send()
                .await?,
        )
        .await?;
        Ok(())
    }

    async fn propose_state(&self, flow_run_id: Uuid, state: State) -> Result<State, ApiError> {
        let url = self.url(&format!("flow_runs/{flow_run_id}/set_state"))?;
        let proposed = state.clone();
        let response = Self::check(
            self.authorize(self.http.post(url))
                .json(&SetStateRequest {
                    state,
                    force: false,
                })
                .send()
                .await?,
        )
        .await?;
        let result: OrchestrationResult = response.json().await?;

        match result.status.as_str() {
            "ABORT" => {
                let reason = result
                    .details
                    .and_then(|details| details.reason)
                    .unwrap_or_else(|| "no reason given".to_string());
                Err(ApiError::Abort(reason))
            }
            "ACCEPT" | "REJECT" => Ok(result.state.unwrap_or(proposed)),
            other => Err(ApiError::Other(anyhow::anyhow!(
                "unexpected orchestration status {other:?}"
            ))),
        }
    }
}

#[async_trait::async_trait]
impl BlockDocumentResolver for HttpOrchestration {
    async fn resolve_block_document(&self, block_document_id: Uuid) -> anyhow::Result<Value> {
        let url = self.url(&format!("block_documents/{block_document_id}"))?;
        let response = Self::check(self.authorize(self.http.get(url)).send().await?).await?;
        let document: BlockDocument = response.json().await.map_err(ApiError::from)?;
        Ok(document.data)
    }
}
