//! # cloudagent-wire
//!
//! Types shared by the control plane (prober, scheduler, status worker) and
//! the machine agent that serves them.
//!
//! ## Contents
//!
//! - [`api`]: request and response bodies of the machine HTTP boundary
//! - [`events`]: NDJSON progress events streamed by `POST /tasks/run`
//! - [`options`]: execution options and their bounds
//! - [`status`]: the on-disk task and machine status records
//!
//! All bodies use camelCase field names; the status records are also the
//! literal file format written under the machine's working directory.

pub mod api;
pub mod error;
pub mod events;
pub mod options;
pub mod status;

pub use api::*;
pub use error::{WireError, WireResult};
pub use events::{NdjsonDecoder, ProgressEvent};
pub use options::{AllowedTool, RunOptions};
pub use status::{MachineStatusRecord, TaskState, TaskStatusRecord};

/// Header carrying the shared machine key.
pub const API_KEY_HEADER: &str = "x-api-key";

/// Port the machine agent listens on.
pub const DEFAULT_MACHINE_PORT: u16 = 7000;

/// Content type of the run stream.
pub const NDJSON_CONTENT_TYPE: &str = "application/x-ndjson";

/// Paths served by the machine agent.
pub mod paths {
    pub const HEALTH: &str = "/health";
    pub const AVAILABILITY: &str = "/machine/availability";
    pub const CLEAR: &str = "/machine/clear";
    pub const RUN: &str = "/tasks/run";
    pub const TASKS: &str = "/tasks";

    pub fn task_status(task_id: &str) -> String {
        format!("/tasks/{task_id}/status")
    }

    pub fn task_cancel(task_id: &str) -> String {
        format!("/tasks/{task_id}/cancel")
    }
}
