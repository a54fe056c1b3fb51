//! Fleet commands. These call the providers directly; no control plane needed.

use anyhow::{bail, Result};
use clap::{Args, Subcommand};
use cloudagent_control_plane::{fleet::FleetSource, machine::Machine};
use serde::Serialize;
use tabled::Tabled;

use crate::output::{
    display_option, print_info, print_output, print_single, print_success, print_warning,
    OutputFormat,
};

use super::CommandContext;

#[derive(Debug, Args)]
pub struct VmCommand {
    #[command(subcommand)]
    command: VmSubcommand,
}

#[derive(Debug, Subcommand)]
enum VmSubcommand {
    /// List managed machines with their health.
    Status,

    /// Create and destroy machines until the fleet matches the config.
    Sync,

    /// Destroy every managed machine.
    Destroy(DestroyArgs),
}

#[derive(Debug, Args)]
struct DestroyArgs {
    /// Confirm destroying all machines.
    #[arg(long)]
    yes: bool,
}

impl VmCommand {
    pub async fn run(self, ctx: CommandContext) -> Result<()> {
        match self.command {
            VmSubcommand::Status => status(ctx).await,
            VmSubcommand::Sync => sync(ctx).await,
            VmSubcommand::Destroy(args) => destroy(ctx, args).await,
        }
    }
}

#[derive(Debug, Clone, Serialize, Tabled)]
struct MachineRow {
    #[tabled(rename = "Name")]
    name: String,

    #[tabled(rename = "Provider")]
    provider: String,

    #[tabled(rename = "Region")]
    region: String,

    #[tabled(rename = "Type")]
    instance_type: String,

    #[tabled(rename = "Address", display = "display_option")]
    address: Option<String>,

    #[tabled(rename = "Status")]
    status: String,

    #[tabled(rename = "Health")]
    health: String,
}

impl From<&Machine> for MachineRow {
    fn from(m: &Machine) -> Self {
        Self {
            name: m.name.clone(),
            provider: m.provider.to_string(),
            region: m.region.clone(),
            instance_type: m.instance_type.clone(),
            address: m.address.clone(),
            status: m.status.to_string(),
            health: m.health.to_string(),
        }
    }
}

fn print_fleet(machines: &[Machine], format: OutputFormat) {
    match format {
        OutputFormat::Table => {
            let rows: Vec<MachineRow> = machines.iter().map(MachineRow::from).collect();
            print_output(&rows, format);
        }
        OutputFormat::Json => print_single(machines),
    }
}

async fn status(ctx: CommandContext) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    let machines = reconciler.list().await?;

    print_fleet(&machines, ctx.format);
    if ctx.format == OutputFormat::Table {
        let desired = reconciler.desired().len();
        if machines.len() != desired {
            print_info(&format!(
                "{} machines observed, {} configured. Run `ca vm sync` to converge.",
                machines.len(),
                desired
            ));
        }
    }
    Ok(())
}

async fn sync(ctx: CommandContext) -> Result<()> {
    let reconciler = ctx.reconciler()?;
    let report = reconciler.sync().await?;

    match ctx.format {
        OutputFormat::Table => {
            for name in &report.destroyed {
                print_warning(&format!("Destroyed {name}"));
            }
            for name in &report.created {
                print_success(&format!("Created {name}"));
            }
            if report.destroyed.is_empty() && report.created.is_empty() {
                print_info("Fleet already matches the config");
            }
            print_fleet(&report.fleet, ctx.format);
        }
        OutputFormat::Json => print_single(&report),
    }
    Ok(())
}

async fn destroy(ctx: CommandContext, args: DestroyArgs) -> Result<()> {
    if !args.yes {
        bail!("Refusing to destroy all machines without --yes");
    }

    let destroyed = ctx.reconciler()?.destroy_all().await?;
    match ctx.format {
        OutputFormat::Table => {
            for machine in &destroyed {
                print_warning(&format!("Destroyed {} ({})", machine.name, machine.id));
            }
            print_success(&format!("{} machines destroyed", destroyed.len()));
        }
        OutputFormat::Json => print_single(&destroyed),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use cloudagent_control_plane::machine::{MachineHealth, MachineStatus, ProviderKind};

    #[test]
    fn test_machine_row() {
        let machine = Machine {
            id: "9".to_string(),
            name: "worker-1".to_string(),
            provider: ProviderKind::Hetzner,
            region: "nbg1".to_string(),
            instance_type: "cpx21".to_string(),
            address: None,
            status: MachineStatus::Creating,
            health: MachineHealth::NoAddress,
            created_at: None,
            tags: Default::default(),
        };
        let row = MachineRow::from(&machine);
        assert_eq!(row.provider, "hetzner");
        assert_eq!(row.status, "creating");
        assert_eq!(row.health, "no-address");
    }

    #[tokio::test]
    async fn test_destroy_requires_confirmation() {
        let ctx = CommandContext {
            format: OutputFormat::Table,
            api_url: crate::client::DEFAULT_API_URL.to_string(),
            config_path: Some("/nonexistent/config.json".into()),
        };
        let err = destroy(ctx, DestroyArgs { yes: false }).await.unwrap_err();
        assert!(err.to_string().contains("--yes"));
    }
}
