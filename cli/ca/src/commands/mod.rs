//! CLI commands.

mod init;
mod tasks;
mod vm;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cloudagent_control_plane::{config::FleetConfig, fleet::FleetReconciler, prober::HttpMachineApi};

use crate::client::{ApiClient, DEFAULT_API_URL};
use crate::output::OutputFormat;

/// cloudagent CLI - manage the machine fleet and run tasks on it.
#[derive(Debug, Parser)]
#[command(name = "ca")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Output format (table or json).
    #[arg(long, global = true, default_value = "table")]
    format: String,

    /// Control-plane API URL.
    #[arg(long, global = true, env = "CA_API_URL", default_value = DEFAULT_API_URL)]
    api_url: String,

    /// Fleet config file. Defaults to ~/.cloudagent/config.json.
    #[arg(long, global = true, env = "CA_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Write a fresh fleet config with a generated machine key.
    Init(init::InitCommand),

    /// Inspect and reconcile the machine fleet.
    Vm(vm::VmCommand),

    /// Submit and track tasks.
    Task(tasks::TaskCommand),

    /// Show CLI version.
    Version,
}

impl Cli {
    pub async fn run(self) -> Result<()> {
        let ctx = CommandContext {
            format: OutputFormat::parse(&self.format),
            api_url: self.api_url,
            config_path: self.config,
        };

        match self.command {
            Commands::Init(cmd) => cmd.run(ctx),
            Commands::Vm(cmd) => cmd.run(ctx).await,
            Commands::Task(cmd) => cmd.run(ctx).await,
            Commands::Version => {
                println!("ca {}", env!("CARGO_PKG_VERSION"));
                Ok(())
            }
        }
    }
}

/// Shared command context.
pub struct CommandContext {
    pub format: OutputFormat,
    pub api_url: String,
    pub config_path: Option<PathBuf>,
}

impl CommandContext {
    pub fn client(&self) -> Result<ApiClient> {
        ApiClient::new(&self.api_url)
    }

    /// The `--config` flag, or the default location.
    pub fn fleet_config_path(&self) -> Result<PathBuf> {
        match &self.config_path {
            Some(path) => Ok(path.clone()),
            None => FleetConfig::default_path(),
        }
    }

    pub fn load_fleet_config(&self) -> Result<FleetConfig> {
        FleetConfig::load(&self.fleet_config_path()?)
    }

    /// A reconciler over the configured providers, probing with the fleet key.
    pub fn reconciler(&self) -> Result<FleetReconciler> {
        let config = self.load_fleet_config()?;
        let machines = Arc::new(HttpMachineApi::new(config.vm.api_key.clone()));
        FleetReconciler::from_config(&config, machines).context("Failed to set up providers")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_task_submit() {
        let cli = Cli::try_parse_from([
            "ca",
            "--format",
            "json",
            "task",
            "submit",
            "list the files",
            "--max-turns",
            "3",
            "--tool",
            "Bash",
            "--tool",
            "Edit",
            "--priority",
            "high",
        ])
        .unwrap();
        assert_eq!(cli.format, "json");
        assert_eq!(cli.api_url, DEFAULT_API_URL);
        assert!(matches!(cli.command, Commands::Task(_)));
    }

    #[test]
    fn test_rejects_unknown_tool() {
        let result = Cli::try_parse_from(["ca", "task", "submit", "x", "--tool", "Hammer"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_explicit_config_path_wins() {
        let ctx = CommandContext {
            format: OutputFormat::Table,
            api_url: DEFAULT_API_URL.to_string(),
            config_path: Some(PathBuf::from("/tmp/fleet.json")),
        };
        assert_eq!(
            ctx.fleet_config_path().unwrap(),
            PathBuf::from("/tmp/fleet.json")
        );
    }
}
