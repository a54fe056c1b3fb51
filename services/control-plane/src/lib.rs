//! cloudagent control plane library.
//!
//! This crate primarily ships a `control-plane` binary, but exposes its
//! modules so the CLI and integration tests can reuse them.

pub mod api;
pub mod config;
pub mod fleet;
pub mod machine;
pub mod prober;
pub mod provider;
pub mod scheduler;
pub mod state;
pub mod store;
