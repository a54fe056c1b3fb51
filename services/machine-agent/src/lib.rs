//! Machine agent.
//!
//! Runs on every provisioned machine and owns two things: the Busy Record
//! that makes the machine accept at most one task at a time, and the per-task
//! status files that callers poll. Tasks are handed to an [`engine::Engine`]
//! and streamed back over HTTP as NDJSON.

pub mod api;
pub mod config;
pub mod engine;
pub mod executor;
pub mod state;
pub mod status_store;
