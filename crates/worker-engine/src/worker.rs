//! Worker lifecycle, poll cycle, and the per-run submission pipeline.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};

use anyhow::Context as _;
use chrono::Utc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use uuid::Uuid;

use poolhand_core::job::{slugify, JobConfiguration, RelatedResource};
use poolhand_core::schemas::{FlowRun, State, WorkPool, WorkerFlowRunResponse};
use poolhand_core::template::BlockDocumentResolver;

use crate::api::{
    Event, Infrastructure, StartSignal, StartedToken, WorkerConfig, WorkerEvent, WorkerStatus,
};
use crate::backend::{ApiError, Orchestration};
use crate::limiter::RunLimiter;

/// Worker lifecycle. There is no way back out of `TearingDown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Running,
    Polling,
    TearingDown,
    Closed,
}

struct Shared {
    name: String,
    name_slug: String,
    kind: String,
    config: WorkerConfig,
    api: Arc<dyn Orchestration>,
    infrastructure: Arc<dyn Infrastructure>,
    resolver: Arc<dyn BlockDocumentResolver>,
    events: broadcast::Sender<WorkerEvent>,
    limiter: Option<RunLimiter>,
    in_flight: Mutex<HashSet<Uuid>>,
    work_pool: RwLock<Option<WorkPool>>,
}

impl Shared {
    fn warn(&self, message: String) {
        let _ = self.events.send(WorkerEvent::Warning { message });
    }

    fn error(&self, message: String) {
        let _ = self.events.send(WorkerEvent::Error { message });
    }

    fn release_limiter(&self, flow_run_id: Uuid) {
        if let Some(limiter) = &self.limiter {
            limiter.release(flow_run_id);
        }
    }

    fn remove_in_flight(&self, flow_run_id: Uuid) {
        self.in_flight
            .lock()
            .expect("in-flight set lock poisoned")
            .remove(&flow_run_id);
    }

    fn base_job_template(&self) -> Option<serde_json::Value> {
        self.work_pool
            .read()
            .expect("work pool lock poisoned")
            .as_ref()
            .map(|pool| pool.base_job_template.clone())
    }
}

/// A work-pool worker: polls the orchestration API for scheduled flow runs,
/// claims each exactly once, and dispatches them onto an infrastructure
/// backend within a local concurrency budget.
pub struct Worker {
    shared: Arc<Shared>,
    runs: Option<TaskTracker>,
    lifecycle: Lifecycle,
}

impl Worker {
    /// Builds a worker from its configuration and injected capabilities.
    ///
    /// Fails when the configured name contains `/` or `%`; a name is
    /// generated when none is given.
    pub fn new(
        config: WorkerConfig,
        api: Arc<dyn Orchestration>,
        infrastructure: Arc<dyn Infrastructure>,
        resolver: Arc<dyn BlockDocumentResolver>,
    ) -> anyhow::Result<Self> {
        if let Some(name) = &config.name {
            if name.contains('/') || name.contains('%') {
                anyhow::bail!("worker name cannot contain '/' or '%'");
            }
        }
        let kind = infrastructure.kind().to_string();
        let name = config
            .name
            .clone()
            .unwrap_or_else(|| format!("{kind}-worker {}", Uuid::new_v4()));
        let (events, _) = broadcast::channel(256);

        Ok(Self {
            shared: Arc::new(Shared {
                name_slug: slugify(&name),
                name,
                kind,
                limiter: config.limit.map(RunLimiter::new),
                config,
                api,
                infrastructure,
                resolver,
                events,
                in_flight: Mutex::new(HashSet::new()),
                work_pool: RwLock::new(None),
            }),
            runs: None,
            lifecycle: Lifecycle::New,
        })
    }

    /// The worker's name.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Subscribes to the worker's event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.shared.events.subscribe()
    }

    /// Snapshot of the worker's name, pool, settings, and in-flight count.
    pub fn status(&self) -> WorkerStatus {
        WorkerStatus {
            name: self.shared.name.clone(),
            work_pool: self
                .shared
                .work_pool
                .read()
                .expect("work pool lock poisoned")
                .clone(),
            prefetch_seconds: self.shared.config.prefetch_seconds,
            in_flight: self
                .shared
                .in_flight
                .lock()
                .expect("in-flight set lock poisoned")
                .len(),
        }
    }

    /// Prepares the worker to run. Calling this twice is a programming
    /// error and asserts.
    pub async fn setup(&mut self) {
        assert!(
            self.lifecycle == Lifecycle::New,
            "worker setup called twice"
        );
        tracing::debug!(worker = %self.shared.name, "setting up worker");
        self.runs = Some(TaskTracker::new());
        self.lifecycle = Lifecycle::Running;
    }

    /// Waits for all outstanding submissions, then closes the worker.
    ///
    /// The wait does not cancel user infrastructure; in-flight runs drain.
    /// Safe to call more than once.
    pub async fn teardown(&mut self) {
        if self.lifecycle == Lifecycle::Closed {
            return;
        }
        tracing::debug!(worker = %self.shared.name, "tearing down worker");
        self.lifecycle = Lifecycle::TearingDown;
        if let Some(runs) = self.runs.take() {
            runs.close();
            runs.wait().await;
        }
        self.lifecycle = Lifecycle::Closed;
    }

    /// Refreshes the local work-pool record and sends a heartbeat.
    pub async fn sync_with_backend(&self) -> anyhow::Result<()> {
        update_local_work_pool_info(&self.shared).await?;
        send_worker_heartbeat(&self.shared).await?;
        tracing::debug!(worker = %self.shared.name, "worker synchronized with the orchestration API");
        Ok(())
    }

    /// Runs one poll cycle: sync with the backend, fetch scheduled runs,
    /// and submit the eligible ones. Returns the runs admitted this cycle.
    ///
    /// Errors propagate to the caller, which typically retries the cycle on
    /// its polling schedule.
    pub async fn get_and_submit_flow_runs(&mut self) -> anyhow::Result<Vec<FlowRun>> {
        let runs = match (self.lifecycle, &self.runs) {
            (Lifecycle::Running, Some(runs)) => runs.clone(),
            _ => anyhow::bail!("worker is not running; call setup() first"),
        };

        self.lifecycle = Lifecycle::Polling;
        let result = async {
            self.sync_with_backend().await?;
            let scheduled = get_scheduled_flow_runs(&self.shared).await?;
            Ok(submit_scheduled_flow_runs(&self.shared, &runs, scheduled))
        }
        .await;
        self.lifecycle = Lifecycle::Running;
        result
    }
}

async fn update_local_work_pool_info(shared: &Arc<Shared>) -> anyhow::Result<()> {
    let mut pool = match shared.api.read_work_pool(&shared.config.work_pool_name).await {
        Ok(pool) => pool,
        Err(ApiError::NotFound) => {
            if shared.config.create_pool_if_not_found {
                let pool = shared
                    .api
                    .create_work_pool(&shared.config.work_pool_name, &shared.kind)
                    .await?;
                tracing::info!("work pool {:?} created", shared.config.work_pool_name);
                pool
            } else {
                shared.warn(format!(
                    "work pool {:?} not found",
                    shared.config.work_pool_name
                ));
                return Ok(());
            }
        }
        Err(err) => return Err(err.into()),
    };

    // Warn when the remote type is first loaded or changes out from under
    // us; the worker keeps going either way.
    let previous_kind = shared
        .work_pool
        .read()
        .expect("work pool lock poisoned")
        .as_ref()
        .map(|known| known.kind.clone());
    if previous_kind.as_deref() != Some(pool.kind.as_str()) && pool.kind != shared.kind {
        shared.warn(format!(
            "worker type mismatch: this worker process expects type {:?} but received {:?} \
             from the server; unexpected behavior may occur",
            shared.kind, pool.kind
        ));
    }

    if !pool.has_base_job_template() {
        let template = shared.infrastructure.default_base_job_template();
        shared
            .api
            .update_work_pool_template(&pool.name, &template)
            .await?;
        pool.base_job_template = template;
    }

    *shared.work_pool.write().expect("work pool lock poisoned") = Some(pool);
    Ok(())
}

async fn send_worker_heartbeat(shared: &Arc<Shared>) -> anyhow::Result<()> {
    let pool_known = shared
        .work_pool
        .read()
        .expect("work pool lock poisoned")
        .is_some();
    if pool_known {
        shared
            .api
            .send_worker_heartbeat(&shared.config.work_pool_name, &shared.name)
            .await?;
    }
    Ok(())
}

async fn get_scheduled_flow_runs(
    shared: &Arc<Shared>,
) -> anyhow::Result<Vec<WorkerFlowRunResponse>> {
    let scheduled_before = Utc::now()
        + chrono::Duration::milliseconds((shared.config.prefetch_seconds * 1000.0) as i64);
    tracing::debug!(%scheduled_before, "querying for scheduled flow runs");
    match shared
        .api
        .get_scheduled_flow_runs(
            &shared.config.work_pool_name,
            scheduled_before,
            &shared.config.work_queues,
        )
        .await
    {
        Ok(scheduled) => {
            tracing::debug!(count = scheduled.len(), "discovered scheduled flow runs");
            Ok(scheduled)
        }
        // The pool is gone; the next cycle will recreate it (or warn).
        Err(ApiError::NotFound) => Ok(Vec::new()),
        Err(err) => Err(err.into()),
    }
}

/// Admits runs in scheduled order, stopping at the first one the limiter
/// refuses. Returns the runs admitted this cycle.
fn submit_scheduled_flow_runs(
    shared: &Arc<Shared>,
    runs: &TaskTracker,
    scheduled: Vec<WorkerFlowRunResponse>,
) -> Vec<FlowRun> {
    let mut candidates: Vec<FlowRun> = scheduled
        .into_iter()
        .map(|entry| entry.flow_run)
        .collect();
    candidates.sort_by(|a, b| {
        a.next_scheduled_start_time
            .cmp(&b.next_scheduled_start_time)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut admitted = Vec::new();
    for flow_run in candidates {
        {
            let mut in_flight = shared
                .in_flight
                .lock()
                .expect("in-flight set lock poisoned");
            if in_flight.contains(&flow_run.id) {
                continue;
            }
            if let Some(limiter) = &shared.limiter {
                if !limiter.try_acquire(flow_run.id) {
                    // Earliest-deadline-first is strict: no skipping ahead
                    // to later runs once the budget is exhausted.
                    tracing::info!(
                        "flow run limit reached; {} flow runs in progress",
                        limiter.in_use()
                    );
                    break;
                }
            }
            in_flight.insert(flow_run.id);
        }

        tracing::info!(flow_run = %flow_run.id, "submitting flow run");
        runs.spawn(submit_run(shared.clone(), runs.clone(), flow_run.clone()));
        admitted.push(flow_run);
    }

    admitted
}

/// Per-run submission pipeline. Every exit path leaves the run outside the
/// in-flight set with its limiter token released.
async fn submit_run(shared: Arc<Shared>, runs: TaskTracker, flow_run: FlowRun) {
    if let Err(err) = check_flow_run(&shared, &flow_run).await {
        shared.error(format!(
            "flow run {} did not pass checks and will not be submitted for execution: {err:#}",
            flow_run.id
        ));
        shared.release_limiter(flow_run.id);
        shared.remove_in_flight(flow_run.id);
        return;
    }

    if !propose_pending_state(&shared, &flow_run).await {
        shared.release_limiter(flow_run.id);
        shared.remove_in_flight(flow_run.id);
        return;
    }

    let configuration = match get_configuration(&shared, &flow_run).await {
        Ok(configuration) => configuration,
        Err(err) => {
            shared.error(format!(
                "failed to submit flow run '{}' to infrastructure: {err:#}",
                flow_run.id
            ));
            propose_failed_state(&shared, &flow_run, &err).await;
            shared.release_limiter(flow_run.id);
            shared.remove_in_flight(flow_run.id);
            return;
        }
    };

    emit_submitted_event(&shared, &configuration);

    let (started, signal) = StartedToken::pair();
    runs.spawn(run_and_capture(
        shared.clone(),
        flow_run.clone(),
        configuration,
        started,
    ));

    // Block until the run reports startup (or failure). This keeps the
    // concurrency budget counting launched work, not half-submitted work.
    let signal = signal.await.unwrap_or_else(|_| {
        StartSignal::Failed("infrastructure task ended without signalling startup".to_string())
    });
    if let StartSignal::Started(identifier) = signal {
        if let Err(err) = shared
            .api
            .update_flow_run_infrastructure_pid(flow_run.id, &identifier)
            .await
        {
            shared.error(format!(
                "an error occurred while setting the infrastructure pid on flow run '{}'; \
                 the flow run will not be cancellable: {err:#}",
                flow_run.id
            ));
        }
    }

    tracing::info!(flow_run = %flow_run.id, "completed submission of flow run");
    shared.remove_in_flight(flow_run.id);
}

/// Refuses runs created from deployments that reference a storage block.
async fn check_flow_run(shared: &Arc<Shared>, flow_run: &FlowRun) -> anyhow::Result<()> {
    if let Some(deployment_id) = flow_run.deployment_id {
        let deployment = shared.api.read_deployment(deployment_id).await?;
        if deployment.storage_document_id.is_some() {
            anyhow::bail!(
                "flow run {} was created from deployment {:?} which is configured with a \
                 storage block; workers currently only support local storage",
                flow_run.id,
                deployment.name
            );
        }
    }
    Ok(())
}

async fn get_configuration(
    shared: &Arc<Shared>,
    flow_run: &FlowRun,
) -> anyhow::Result<JobConfiguration> {
    let deployment_id = flow_run
        .deployment_id
        .context("flow run was not created from a deployment")?;
    let deployment = shared.api.read_deployment(deployment_id).await?;
    let flow = shared.api.read_flow(flow_run.flow_id).await?;
    let base_job_template = shared
        .base_job_template()
        .context("no work pool information available")?;

    let mut configuration = JobConfiguration::from_template_and_values(
        &base_job_template,
        &deployment.infra_overrides,
        shared.resolver.as_ref(),
    )
    .await?;
    configuration.prepare_for_flow_run(
        flow_run,
        Some(&deployment),
        Some(&flow),
        &shared.config.base_env,
    );
    Ok(configuration)
}

/// Runs the infrastructure call and captures every failure mode; nothing
/// escapes to the task group.
async fn run_and_capture(
    shared: Arc<Shared>,
    flow_run: FlowRun,
    configuration: JobConfiguration,
    started: Arc<StartedToken>,
) {
    let result = shared
        .infrastructure
        .run(&flow_run, configuration, &started)
        .await;

    match result {
        Err(err) => {
            if !started.has_fired() {
                shared.error(format!(
                    "failed to submit flow run '{}' to infrastructure: {err:#}",
                    flow_run.id
                ));
                started.failed(format!("{err:#}"));
                propose_failed_state(&shared, &flow_run, &err).await;
            } else {
                // The process did start; the server reconciles via its own
                // timeouts, so no state proposal here.
                shared.error(format!(
                    "an error occurred while monitoring flow run '{}'; the flow run will not \
                     be marked as failed, but an issue may have occurred: {err:#}",
                    flow_run.id
                ));
            }
        }
        Ok(result) => {
            if !started.has_fired() {
                shared.error(format!(
                    "infrastructure returned without reporting flow run '{}' as started or \
                     raising an error; the flow run will not be marked as failed, but an \
                     issue may have occurred",
                    flow_run.id
                ));
                started.force();
            }
            if !result.is_success() {
                propose_crashed_state(
                    &shared,
                    &flow_run,
                    format!(
                        "Flow run infrastructure exited with non-zero status code {}.",
                        result.status_code
                    ),
                )
                .await;
            }
        }
    }

    shared.release_limiter(flow_run.id);
}

enum Proposal {
    Accepted(State),
    Aborted(String),
    Rejected(State),
}

/// Proposes a state and classifies the server's answer against the target
/// kind. The proposer does not interpret substituted states beyond that.
async fn propose_state(
    api: &dyn Orchestration,
    flow_run_id: Uuid,
    state: State,
) -> anyhow::Result<Proposal> {
    let target = state.kind;
    match api.propose_state(flow_run_id, state).await {
        Ok(state) if state.kind == target => Ok(Proposal::Accepted(state)),
        Ok(state) => Ok(Proposal::Rejected(state)),
        Err(ApiError::Abort(reason)) => Ok(Proposal::Aborted(reason)),
        Err(err) => Err(err.into()),
    }
}

async fn propose_pending_state(shared: &Arc<Shared>, flow_run: &FlowRun) -> bool {
    match propose_state(shared.api.as_ref(), flow_run.id, State::pending()).await {
        Ok(Proposal::Accepted(_)) => true,
        Ok(Proposal::Aborted(reason)) => {
            tracing::info!(
                "aborted submission of flow run '{}': server sent an abort signal: {reason}",
                flow_run.id
            );
            false
        }
        Ok(Proposal::Rejected(state)) => {
            tracing::info!(
                "aborted submission of flow run '{}': server returned a non-pending state {:?}",
                flow_run.id,
                state.kind.display_name()
            );
            false
        }
        Err(err) => {
            shared.error(format!(
                "failed to update state of flow run '{}': {err:#}",
                flow_run.id
            ));
            false
        }
    }
}

async fn propose_failed_state(shared: &Arc<Shared>, flow_run: &FlowRun, error: &anyhow::Error) {
    let state = State::failed(format!("Submission failed: {error:#}"));
    match propose_state(shared.api.as_ref(), flow_run.id, state).await {
        // An abort means the run is already terminal; a substituted state
        // needs no further handling either.
        Ok(_) => {}
        Err(err) => shared.error(format!(
            "failed to update state of flow run '{}': {err:#}",
            flow_run.id
        )),
    }
}

async fn propose_crashed_state(shared: &Arc<Shared>, flow_run: &FlowRun, message: String) {
    match propose_state(shared.api.as_ref(), flow_run.id, State::crashed(message.clone())).await {
        Ok(Proposal::Accepted(state)) if state.is_crashed() => {
            tracing::info!("reported flow run '{}' as crashed: {message}", flow_run.id);
        }
        Ok(_) => {}
        Err(err) => shared.error(format!(
            "failed to update state of flow run '{}': {err:#}",
            flow_run.id
        )),
    }
}

fn emit_submitted_event(shared: &Arc<Shared>, configuration: &JobConfiguration) {
    let mut related: Vec<RelatedResource> = configuration.related_resources().to_vec();
    {
        let pool = shared.work_pool.read().expect("work pool lock poisoned");
        if let Some(pool) = pool.as_ref() {
            if let Some(id) = pool.id {
                related.push(RelatedResource {
                    id: format!("prefect.work-pool.{id}"),
                    role: "work-pool".to_string(),
                    name: Some(pool.name.clone()),
                });
            }
        }
    }

    let resource = BTreeMap::from([
        (
            "prefect.resource.id".to_string(),
            format!("prefect.worker.{}.{}", shared.kind, shared.name_slug),
        ),
        ("prefect.resource.name".to_string(), shared.name.clone()),
        (
            "prefect.version".to_string(),
            env!("CARGO_PKG_VERSION").to_string(),
        ),
        ("prefect.worker-type".to_string(), shared.kind.clone()),
    ]);

    let _ = shared.events.send(WorkerEvent::Emitted(Event {
        event: "prefect.worker.submitted-flow-run".to_string(),
        resource,
        related,
    }));
}
