//! cloudagent control plane.
//!
//! Serves the task API, dispatches queued tasks onto the fleet and tracks
//! running tasks until their machines report an outcome.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cloudagent_control_plane::{
    api,
    config::{FleetConfig, ServiceConfig},
    fleet::FleetReconciler,
    prober::HttpMachineApi,
    scheduler::{DispatchWorker, StatusWorker, TaskScheduler},
    state::AppState,
    store::RecordStore,
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const WORKER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    let config = ServiceConfig::from_env()?;

    // Prefer RUST_LOG, fall back to CA_LOG_LEVEL
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!(
        listen_addr = %config.listen_addr,
        fleet_config = %config.fleet_config_path.display(),
        store = %config.store_path.display(),
        "Starting control plane"
    );

    let fleet_config = FleetConfig::load(&config.fleet_config_path)
        .context("Run `ca init` to create a fleet config")?;
    let machines = Arc::new(HttpMachineApi::new(fleet_config.vm.api_key.clone()));
    let fleet = Arc::new(FleetReconciler::from_config(&fleet_config, machines.clone())?);
    info!(
        desired_machines = fleet.desired().len(),
        "Loaded fleet configuration"
    );

    let store = Arc::new(RecordStore::open(&config.store_path)?);
    info!(
        queued = store.queued_count().await,
        running = store.running_count().await,
        "Opened record store"
    );

    let scheduler = Arc::new(TaskScheduler::new(
        store,
        fleet,
        machines,
        config.budget,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let dispatch = DispatchWorker::new(scheduler.clone(), config.dispatch_interval);
    let dispatch_shutdown = shutdown_rx.clone();
    let dispatch_handle = tokio::spawn(async move {
        dispatch.run(dispatch_shutdown).await;
    });

    let status = StatusWorker::new(scheduler.clone(), config.status_interval);
    let status_shutdown = shutdown_rx.clone();
    let status_handle = tokio::spawn(async move {
        status.run(status_shutdown).await;
    });

    let app = api::create_router(AppState::new(scheduler));
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let mut server_shutdown = shutdown_rx.clone();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = server_shutdown.changed().await;
            })
            .await
    });

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    for (name, handle) in [("dispatch", dispatch_handle), ("status", status_handle)] {
        if tokio::time::timeout(WORKER_SHUTDOWN_TIMEOUT, handle)
            .await
            .is_err()
        {
            warn!(worker = name, "Worker did not stop in time");
        }
    }

    info!("Control plane shutdown complete");
    Ok(())
}
