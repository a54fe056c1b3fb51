//! `ca init`.

use anyhow::{bail, Result};
use clap::Args;
use cloudagent_control_plane::config::FleetConfig;
use serde_json::json;

use crate::output::{print_info, print_single, print_success, OutputFormat};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct InitCommand {
    /// Overwrite an existing config.
    #[arg(long)]
    force: bool,
}

impl InitCommand {
    pub fn run(self, ctx: CommandContext) -> Result<()> {
        let path = ctx.fleet_config_path()?;
        if path.exists() && !self.force {
            bail!(
                "Config already exists at {} (use --force to overwrite)",
                path.display()
            );
        }

        let config = FleetConfig::generate();
        config.save(&path)?;

        match ctx.format {
            OutputFormat::Table => {
                print_success(&format!("Wrote fleet config to {}", path.display()));
                print_info("Add a provider token and instances under \"vm\" before `ca vm sync`");
            }
            OutputFormat::Json => print_single(&json!({ "path": path })),
        }
        Ok(())
    }
}
