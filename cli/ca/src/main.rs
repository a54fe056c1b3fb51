//! ca - operator CLI for cloudagent.
//!
//! Fleet commands talk to the cloud providers directly using the local fleet
//! config. Task commands go through the control-plane API.

use anyhow::Result;
use clap::Parser;

mod client;
mod commands;
mod error;
mod output;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Err(e) = cli.run().await {
        error::print_error(&e);
        std::process::exit(1);
    }

    Ok(())
}
