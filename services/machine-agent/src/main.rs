//! Machine agent binary.
//!
//! Serves the machine HTTP boundary on port 7000 by default.

use std::sync::Arc;

use anyhow::{Context, Result};
use cloudagent_machine_agent::{
    api, config::Config, engine::CommandEngine, executor::Executor, state::AppState,
    status_store::StatusStore,
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;

    // Prefer RUST_LOG, fall back to CA_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        working_directory = %config.working_directory.display(),
        engine = %config.engine_command,
        "Starting machine agent"
    );

    let store = Arc::new(
        StatusStore::open(&config.working_directory).context("Failed to open status store")?,
    );
    match store.recover_interrupted() {
        Ok(0) => {}
        Ok(n) => warn!(recovered = n, "Marked interrupted tasks as failed"),
        Err(e) => error!(error = %e, "Failed to recover interrupted tasks"),
    }

    let engine = Arc::new(CommandEngine::new(
        config.engine_command.clone(),
        config.engine_args.clone(),
    ));
    let executor = Arc::new(Executor::new(store, engine));
    let app = api::create_router(AppState::new(executor, config.api_key.clone()));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        })
        .await?;

    info!("Machine agent shutdown complete");
    Ok(())
}
