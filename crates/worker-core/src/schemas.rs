//! Remote-owned records as the orchestration API serves them.
//!
//! The worker never mutates these directly; flow runs change only through
//! state proposals and the `infrastructure_pid` update.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The kind of a flow-run state, as the server enumerates them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StateKind {
    /// Waiting for its scheduled start time.
    Scheduled,
    /// Claimed by a worker, not yet running.
    Pending,
    /// Infrastructure reported the run as started.
    Running,
    /// Finished successfully.
    Completed,
    /// Finished with an error raised by the flow itself.
    Failed,
    /// Infrastructure died or exited non-zero.
    Crashed,
    /// Cancellation finished.
    Cancelled,
    /// Cancellation requested, still winding down.
    Cancelling,
    /// Suspended by the server.
    Paused,
}

impl StateKind {
    /// Human-readable default state name for this kind.
    pub fn display_name(self) -> &'static str {
        match self {
            StateKind::Scheduled => "Scheduled",
            StateKind::Pending => "Pending",
            StateKind::Running => "Running",
            StateKind::Completed => "Completed",
            StateKind::Failed => "Failed",
            StateKind::Crashed => "Crashed",
            StateKind::Cancelled => "Cancelled",
            StateKind::Cancelling => "Cancelling",
            StateKind::Paused => "Paused",
        }
    }
}

/// A flow-run state as proposed to or returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    /// State kind.
    #[serde(rename = "type")]
    pub kind: StateKind,
    /// State name; defaults to the capitalized kind server-side.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Free-form message attached to the transition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl State {
    fn new(kind: StateKind, message: Option<String>) -> Self {
        Self {
            kind,
            name: Some(kind.display_name().to_string()),
            message,
        }
    }

    /// A `Pending` state, proposed when the worker claims a run.
    pub fn pending() -> Self {
        Self::new(StateKind::Pending, None)
    }

    /// A `Failed` state carrying a submission failure message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(StateKind::Failed, Some(message.into()))
    }

    /// A `Crashed` state carrying an infrastructure failure message.
    pub fn crashed(message: impl Into<String>) -> Self {
        Self::new(StateKind::Crashed, Some(message.into()))
    }

    /// Whether this state is `Pending`.
    pub fn is_pending(&self) -> bool {
        self.kind == StateKind::Pending
    }

    /// Whether this state is `Crashed`.
    pub fn is_crashed(&self) -> bool {
        self.kind == StateKind::Crashed
    }
}

/// A work pool: a server-side grouping of deployments sharing a worker type
/// and a base job template.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkPool {
    /// Server-assigned id, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<Uuid>,
    /// Pool name.
    pub name: String,
    /// Worker type tag the pool was created for.
    #[serde(rename = "type")]
    pub kind: String,
    /// Structured template + variables schema used to render job
    /// configurations. May be absent or empty on freshly created pools.
    #[serde(default)]
    pub base_job_template: serde_json::Value,
}

impl WorkPool {
    /// Whether the pool carries a usable base job template.
    pub fn has_base_job_template(&self) -> bool {
        match &self.base_job_template {
            serde_json::Value::Object(map) => !map.is_empty(),
            serde_json::Value::Null => false,
            _ => true,
        }
    }
}

/// A scheduled or in-progress execution of a deployment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRun {
    /// Run id.
    pub id: Uuid,
    /// Generated run name.
    pub name: String,
    /// Deployment the run was created from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment_id: Option<Uuid>,
    /// Flow the run belongs to.
    pub flow_id: Uuid,
    /// Current state as last seen from the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    /// When the run is due to start.
    pub next_scheduled_start_time: DateTime<Utc>,
    /// Run tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// One entry of a scheduled-runs query response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerFlowRunResponse {
    /// Queue the run was drawn from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_queue_id: Option<Uuid>,
    /// The run itself.
    pub flow_run: FlowRun,
}

/// A deployment: binds a flow to a schedule and parameters server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    /// Deployment id.
    pub id: Uuid,
    /// Deployment name.
    pub name: String,
    /// Last-updated timestamp.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    /// Storage block reference. Workers refuse runs that carry one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_document_id: Option<Uuid>,
    /// Per-deployment overrides applied over the template variable defaults.
    #[serde(default)]
    pub infra_overrides: serde_json::Map<String, serde_json::Value>,
    /// Deployment tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A flow record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Flow id.
    pub id: Uuid,
    /// Flow name.
    pub name: String,
    /// Flow tags.
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Outcome of an infrastructure run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerResult {
    /// Opaque identifier of the launched backend instance (pid, container
    /// id, ...).
    pub identifier: String,
    /// Exit status; zero means success.
    pub status_code: i32,
}

impl WorkerResult {
    /// Whether the run finished with a zero status code.
    pub fn is_success(&self) -> bool {
        self.status_code == 0
    }
}
