#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Polling / admission / submission engine for `poolhand` work-pool workers.

/// Public API for the engine crate.
pub mod api;

mod backend;
mod limiter;
mod registry;
mod worker;

pub use api::{
    ApiError, Event, HttpOrchestration, Infrastructure, Orchestration, StartedToken, Worker,
    WorkerConfig, WorkerEvent, WorkerStatus, WorkerTypeRegistry,
};
