//! Configuration for the machine agent.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

/// Machine agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP boundary binds to.
    pub listen_addr: SocketAddr,

    /// Shared key every caller must present.
    pub api_key: String,

    /// Root for `machine-status.json` and the `task_<id>/` directories.
    pub working_directory: PathBuf,

    /// Execution engine executable.
    pub engine_command: String,

    /// Extra arguments passed before the per-task ones.
    pub engine_args: Vec<String>,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let listen_addr = std::env::var("CA_LISTEN_ADDR")
            .unwrap_or_else(|_| format!("0.0.0.0:{}", cloudagent_wire::DEFAULT_MACHINE_PORT))
            .parse()
            .context("CA_LISTEN_ADDR is not a socket address")?;

        let api_key = std::env::var("CA_API_KEY").context("CA_API_KEY must be set")?;
        if api_key.trim().is_empty() {
            anyhow::bail!("CA_API_KEY must not be empty");
        }

        let working_directory = std::env::var("CA_WORKING_DIRECTORY")
            .unwrap_or_else(|_| "/tmp/tasks".to_string())
            .into();

        let engine_command =
            std::env::var("CA_ENGINE_COMMAND").unwrap_or_else(|_| "claude".to_string());

        let engine_args = std::env::var("CA_ENGINE_ARGS")
            .map(|v| v.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default();

        let log_level = std::env::var("CA_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        Ok(Self {
            listen_addr,
            api_key,
            working_directory,
            engine_command,
            engine_args,
            log_level,
        })
    }
}
