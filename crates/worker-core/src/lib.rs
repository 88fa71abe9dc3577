#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared value objects for `poolhand`: remote record schemas, the job
//! configuration value object, and base-job-template rendering.

pub mod job;
pub mod schemas;
pub mod template;
