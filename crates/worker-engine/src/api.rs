//! Public API types for the `poolhand` worker engine.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::oneshot;

use poolhand_core::job::{self, JobConfiguration, RelatedResource};
use poolhand_core::schemas::{FlowRun, WorkPool, WorkerResult};

pub use crate::backend::{ApiError, HttpOrchestration, Orchestration};
pub use crate::registry::WorkerTypeRegistry;
pub use crate::worker::Worker;

/// Configuration for one worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name of the work pool to poll.
    pub work_pool_name: String,

    /// Work queues to poll. Empty means every queue in the pool.
    pub work_queues: Vec<String>,

    /// Worker name. Generated when absent; may not contain `/` or `%`.
    /// Two processes sharing a name are treated as the same worker.
    pub name: Option<String>,

    /// Look-ahead window added to "now" when querying scheduled runs.
    pub prefetch_seconds: f64,

    /// Whether a missing work pool is created on sync. Set to `false` to
    /// make sure pools are never created by accident.
    pub create_pool_if_not_found: bool,

    /// Maximum number of flow runs this worker keeps in flight at once.
    /// Unset means unbounded.
    pub limit: Option<usize>,

    /// Settings snapshot exported into every job environment
    /// (e.g. `PREFECT_API_URL`). Taken once at construction; the engine
    /// never reads process-global state.
    pub base_env: BTreeMap<String, String>,
}

impl WorkerConfig {
    /// Default prefetch window used when none is configured.
    pub const DEFAULT_PREFETCH_SECONDS: f64 = 10.0;

    /// A configuration for the given pool with every knob at its default.
    pub fn new(work_pool_name: impl Into<String>) -> Self {
        Self {
            work_pool_name: work_pool_name.into(),
            work_queues: Vec::new(),
            name: None,
            prefetch_seconds: Self::DEFAULT_PREFETCH_SECONDS,
            create_pool_if_not_found: true,
            limit: None,
            base_env: BTreeMap::new(),
        }
    }
}

/// An infrastructure backend contributed by a worker subtype.
#[async_trait::async_trait]
pub trait Infrastructure: Send + Sync {
    /// Worker type tag (e.g. `process`).
    fn kind(&self) -> &str;

    /// Base job template installed on work pools that do not carry one.
    fn default_base_job_template(&self) -> Value {
        job::default_base_job_template()
    }

    /// Runs a flow run to completion on this backend.
    ///
    /// Implementations must report startup exactly once through `started`,
    /// passing the infrastructure identifier (process id, container id, ...).
    /// A launch failure is reported by returning an error *before*
    /// signalling; the engine then marks the run as failed. Errors returned
    /// after signalling are treated as monitoring failures and do not change
    /// the run's state.
    async fn run(
        &self,
        flow_run: &FlowRun,
        configuration: JobConfiguration,
        started: &StartedToken,
    ) -> anyhow::Result<WorkerResult>;
}

#[derive(Debug)]
pub(crate) enum StartSignal {
    Started(String),
    Failed(String),
    Forced,
}

/// One-shot startup handshake between an infrastructure run and the engine.
///
/// The submitter blocks until the token fires, so a submission has either
/// been launched or explicitly marked failed before it completes.
pub struct StartedToken {
    tx: Mutex<Option<oneshot::Sender<StartSignal>>>,
}

impl StartedToken {
    pub(crate) fn pair() -> (Arc<Self>, oneshot::Receiver<StartSignal>) {
        let (tx, rx) = oneshot::channel();
        (
            Arc::new(Self {
                tx: Mutex::new(Some(tx)),
            }),
            rx,
        )
    }

    /// Reports the run as started with its infrastructure identifier.
    pub fn started(&self, identifier: impl Into<String>) {
        self.fire(StartSignal::Started(identifier.into()));
    }

    pub(crate) fn failed(&self, message: String) {
        self.fire(StartSignal::Failed(message));
    }

    pub(crate) fn force(&self) {
        self.fire(StartSignal::Forced);
    }

    pub(crate) fn has_fired(&self) -> bool {
        self.tx.lock().expect("started token lock poisoned").is_none()
    }

    fn fire(&self, signal: StartSignal) {
        let sender = self.tx.lock().expect("started token lock poisoned").take();
        match sender {
            // The receiver is gone once the submitter has moved on; the
            // signal only matters for the handshake itself.
            Some(tx) => {
                let _ = tx.send(signal);
            }
            None => tracing::error!("started callback invoked more than once; ignoring"),
        }
    }
}

/// An event emitted toward the orchestration event system.
#[derive(Debug, Clone)]
pub struct Event {
    /// Event name, e.g. `prefect.worker.submitted-flow-run`.
    pub event: String,
    /// The emitting resource's fields.
    pub resource: BTreeMap<String, String>,
    /// Resources related to the event.
    pub related: Vec<RelatedResource>,
}

/// Worker event stream payload.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    /// An event destined for the orchestration event system.
    Emitted(Event),
    /// An operator-visible warning.
    Warning {
        /// Warning message.
        message: String,
    },
    /// An operator-visible, non-fatal error.
    Error {
        /// Error message.
        message: String,
    },
}

/// Point-in-time snapshot of a worker.
#[derive(Debug, Clone)]
pub struct WorkerStatus {
    /// Worker name.
    pub name: String,
    /// Work pool as last read from the server.
    pub work_pool: Option<WorkPool>,
    /// Configured prefetch window.
    pub prefetch_seconds: f64,
    /// Number of flow runs currently being submitted.
    pub in_flight: usize,
}
