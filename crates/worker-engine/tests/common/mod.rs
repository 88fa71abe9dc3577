//! Shared fakes for the engine scenario tests.
//!
//! `MockOrchestration` emulates the control plane's state machine closely
//! enough for the worker: a Pending proposal that is accepted claims the
//! run and removes it from the scheduled list, the way the real server
//! stops serving claimed runs. Both fakes append to a shared journal so
//! tests can assert cross-component ordering.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::broadcast;
use uuid::Uuid;

use poolhand_core::job::{self, JobConfiguration};
use poolhand_core::schemas::{
    Deployment, Flow, FlowRun, State, StateKind, WorkPool, WorkerFlowRunResponse, WorkerResult,
};
use poolhand_core::template::BlockDocumentResolver;
use poolhand_engine::{
    ApiError, Infrastructure, Orchestration, StartedToken, Worker, WorkerConfig, WorkerEvent,
};

pub type Journal = Arc<Mutex<Vec<String>>>;

/// How the fake server answers a Pending proposal.
pub enum PendingResponse {
    Accept,
    Abort(String),
    Reject(StateKind),
}

struct ApiState {
    pool: Option<WorkPool>,
    scheduled: Vec<WorkerFlowRunResponse>,
    deployments: HashMap<Uuid, Deployment>,
    flows: HashMap<Uuid, Flow>,
    pending_response: PendingResponse,
    proposals: Vec<(Uuid, StateKind, Option<String>)>,
    pid_updates: Vec<(Uuid, String)>,
    heartbeats: usize,
    created_pools: Vec<(String, String)>,
    template_updates: Vec<Value>,
}

pub struct MockOrchestration {
    pub journal: Journal,
    state: Mutex<ApiState>,
}

impl MockOrchestration {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            state: Mutex::new(ApiState {
                pool: None,
                scheduled: Vec::new(),
                deployments: HashMap::new(),
                flows: HashMap::new(),
                pending_response: PendingResponse::Accept,
                proposals: Vec::new(),
                pid_updates: Vec::new(),
                heartbeats: 0,
                created_pools: Vec::new(),
                template_updates: Vec::new(),
            }),
        }
    }

    fn log(&self, entry: String) {
        self.journal.lock().unwrap().push(entry);
    }

    pub fn set_pool(&self, pool: WorkPool) {
        self.state.lock().unwrap().pool = Some(pool);
    }

    pub fn set_scheduled(&self, runs: Vec<FlowRun>) {
        self.state.lock().unwrap().scheduled = runs
            .into_iter()
            .map(|flow_run| WorkerFlowRunResponse {
                work_queue_id: None,
                flow_run,
            })
            .collect();
    }

    pub fn insert_deployment(&self, deployment: Deployment) {
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(deployment.id, deployment);
    }

    pub fn insert_flow(&self, flow: Flow) {
        self.state.lock().unwrap().flows.insert(flow.id, flow);
    }

    pub fn set_pending_response(&self, response: PendingResponse) {
        self.state.lock().unwrap().pending_response = response;
    }

    pub fn proposals(&self) -> Vec<(Uuid, StateKind, Option<String>)> {
        self.state.lock().unwrap().proposals.clone()
    }

    pub fn pid_updates(&self) -> Vec<(Uuid, String)> {
        self.state.lock().unwrap().pid_updates.clone()
    }

    pub fn heartbeats(&self) -> usize {
        self.state.lock().unwrap().heartbeats
    }

    pub fn created_pools(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().created_pools.clone()
    }

    pub fn template_updates(&self) -> Vec<Value> {
        self.state.lock().unwrap().template_updates.clone()
    }
}

#[async_trait::async_trait]
impl Orchestration for MockOrchestration {
    async fn read_work_pool(&self, _name: &str) -> Result<WorkPool, ApiError> {
        self.state
            .lock()
            .unwrap()
            .pool
            .clone()
            .ok_or(ApiError::NotFound)
    }

    async fn create_work_pool(&self, name: &str, kind: &str) -> Result<WorkPool, ApiError> {
        let pool = WorkPool {
            id: Some(Uuid::new_v4()),
            name: name.to_string(),
            kind: kind.to_string(),
            base_job_template: Value::Null,
        };
        let mut state = self.state.lock().unwrap();
        state.created_pools.push((name.to_string(), kind.to_string()));
        state.pool = Some(pool.clone());
        Ok(pool)
    }

    async fn update_work_pool_template(
        &self,
        _name: &str,
        base_job_template: &Value,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        state.template_updates.push(base_job_template.clone());
        if let Some(pool) = state.pool.as_mut() {
            pool.base_job_template = base_job_template.clone();
        }
        Ok(())
    }

    async fn send_worker_heartbeat(
        &self,
        _work_pool_name: &str,
        _worker_name: &str,
    ) -> Result<(), ApiError> {
        self.state.lock().unwrap().heartbeats += 1;
        Ok(())
    }

    async fn get_scheduled_flow_runs(
        &self,
        _work_pool_name: &str,
        _scheduled_before: DateTime<Utc>,
        _work_queue_names: &[String],
    ) -> Result<Vec<WorkerFlowRunResponse>, ApiError> {
        Ok(self.state.lock().unwrap().scheduled.clone())
    }

    async fn read_deployment(&self, id: Uuid) -> Result<Deployment, ApiError> {
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn read_flow(&self, id: Uuid) -> Result<Flow, ApiError> {
        self.state
            .lock()
            .unwrap()
            .flows
            .get(&id)
            .cloned()
            .ok_or(ApiError::NotFound)
    }

    async fn update_flow_run_infrastructure_pid(
        &self,
        id: Uuid,
        infrastructure_pid: &str,
    ) -> Result<(), ApiError> {
        self.log(format!("update_pid:{id}:{infrastructure_pid}"));
        self.state
            .lock()
            .unwrap()
            .pid_updates
            .push((id, infrastructure_pid.to_string()));
        Ok(())
    }

    async fn propose_state(&self, flow_run_id: Uuid, state: State) -> Result<State, ApiError> {
        self.log(format!(
            "propose:{}:{flow_run_id}",
            state.kind.display_name()
        ));
        let mut api = self.state.lock().unwrap();
        api.proposals
            .push((flow_run_id, state.kind, state.message.clone()));

        if state.kind != StateKind::Pending {
            return Ok(state);
        }
        let refusal = match &api.pending_response {
            PendingResponse::Accept => None,
            PendingResponse::Abort(reason) => Some(Err(ApiError::Abort(reason.clone()))),
            PendingResponse::Reject(kind) => Some(Ok(State {
                kind: *kind,
                name: Some(kind.display_name().to_string()),
                message: None,
            })),
        };
        match refusal {
            Some(result) => result,
            None => {
                // The claim is server-authoritative: a pending run stops
                // showing up in scheduled queries.
                api.scheduled
                    .retain(|entry| entry.flow_run.id != flow_run_id);
                Ok(state)
            }
        }
    }
}

#[async_trait::async_trait]
impl BlockDocumentResolver for MockOrchestration {
    async fn resolve_block_document(&self, block_document_id: Uuid) -> anyhow::Result<Value> {
        anyhow::bail!("unexpected block document lookup: {block_document_id}")
    }
}

/// What the fake backend does with a run.
pub enum InfraBehavior {
    Succeed {
        identifier: String,
        status_code: i32,
    },
    FailBeforeStart {
        message: String,
    },
    ReturnWithoutStart {
        status_code: i32,
    },
    /// Signal startup, then block until the test adds a permit to `gate`.
    HoldUntilReleased {
        identifier: String,
        status_code: i32,
    },
}

pub struct MockInfrastructure {
    pub journal: Journal,
    behavior: Mutex<InfraBehavior>,
    runs: Mutex<Vec<(Uuid, JobConfiguration)>>,
    pub gate: tokio::sync::Semaphore,
}

impl MockInfrastructure {
    pub fn new(journal: Journal, behavior: InfraBehavior) -> Self {
        Self {
            journal,
            behavior: Mutex::new(behavior),
            runs: Mutex::new(Vec::new()),
            gate: tokio::sync::Semaphore::new(0),
        }
    }

    pub fn set_behavior(&self, behavior: InfraBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn runs(&self) -> Vec<(Uuid, JobConfiguration)> {
        self.runs.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Infrastructure for MockInfrastructure {
    fn kind(&self) -> &str {
        "mock"
    }

    async fn run(
        &self,
        flow_run: &FlowRun,
        configuration: JobConfiguration,
        started: &StartedToken,
    ) -> anyhow::Result<WorkerResult> {
        self.journal
            .lock()
            .unwrap()
            .push(format!("run:{}", flow_run.id));
        self.runs
            .lock()
            .unwrap()
            .push((flow_run.id, configuration));

        enum Plan {
            Start(String, i32, bool),
            Fail(String),
            Silent(i32),
        }
        let plan = match &*self.behavior.lock().unwrap() {
            InfraBehavior::Succeed {
                identifier,
                status_code,
            } => Plan::Start(identifier.clone(), *status_code, false),
            InfraBehavior::FailBeforeStart { message } => Plan::Fail(message.clone()),
            InfraBehavior::ReturnWithoutStart { status_code } => Plan::Silent(*status_code),
            InfraBehavior::HoldUntilReleased {
                identifier,
                status_code,
            } => Plan::Start(identifier.clone(), *status_code, true),
        };

        match plan {
            Plan::Start(identifier, status_code, hold) => {
                self.journal
                    .lock()
                    .unwrap()
                    .push(format!("started:{}", flow_run.id));
                started.started(identifier.clone());
                if hold {
                    let permit = self.gate.acquire().await.expect("gate closed");
                    permit.forget();
                }
                Ok(WorkerResult {
                    identifier,
                    status_code,
                })
            }
            Plan::Fail(message) => anyhow::bail!("{message}"),
            Plan::Silent(status_code) => Ok(WorkerResult {
                identifier: String::new(),
                status_code,
            }),
        }
    }
}

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn journal_position(journal: &Journal, entry: &str) -> usize {
    let entries = journal.lock().unwrap();
    entries
        .iter()
        .position(|candidate| candidate == entry)
        .unwrap_or_else(|| panic!("journal is missing {entry:?}; got {entries:?}"))
}

pub const POOL_NAME: &str = "default-pool";

pub fn default_pool() -> WorkPool {
    WorkPool {
        id: Some(Uuid::new_v4()),
        name: POOL_NAME.to_string(),
        kind: "mock".to_string(),
        base_job_template: job::default_base_job_template(),
    }
}

pub fn sample_deployment() -> Deployment {
    Deployment {
        id: Uuid::new_v4(),
        name: "nightly-etl".to_string(),
        updated: Some(Utc::now()),
        storage_document_id: None,
        infra_overrides: serde_json::Map::new(),
        tags: vec!["prod".to_string()],
    }
}

pub fn sample_flow() -> Flow {
    Flow {
        id: Uuid::new_v4(),
        name: "ingest".to_string(),
        tags: Vec::new(),
    }
}

pub fn scheduled_run(
    name: &str,
    deployment: &Deployment,
    flow: &Flow,
    start_offset: chrono::Duration,
) -> FlowRun {
    FlowRun {
        id: Uuid::new_v4(),
        name: name.to_string(),
        deployment_id: Some(deployment.id),
        flow_id: flow.id,
        state: None,
        next_scheduled_start_time: Utc::now() + start_offset,
        tags: Vec::new(),
    }
}

pub fn build_worker(
    api: &Arc<MockOrchestration>,
    infrastructure: &Arc<MockInfrastructure>,
    limit: Option<usize>,
) -> Worker {
    let mut config = WorkerConfig::new(POOL_NAME);
    config.prefetch_seconds = 30.0;
    config.limit = limit;
    Worker::new(
        config,
        api.clone() as Arc<dyn Orchestration>,
        infrastructure.clone() as Arc<dyn Infrastructure>,
        api.clone() as Arc<dyn BlockDocumentResolver>,
    )
    .expect("worker construction failed")
}

/// Polls until the predicate holds; panics after a couple of seconds.
pub async fn wait_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..200 {
        if predicate() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

pub fn drain_events(events: &mut broadcast::Receiver<WorkerEvent>) -> Vec<WorkerEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn error_messages(events: &[WorkerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::Error { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}

pub fn warning_messages(events: &[WorkerEvent]) -> Vec<String> {
    events
        .iter()
        .filter_map(|event| match event {
            WorkerEvent::Warning { message } => Some(message.clone()),
            _ => None,
        })
        .collect()
}
