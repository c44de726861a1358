use std::sync::Arc;

use anyhow::Context;

// Import from the main crate
use fleet_scheduler::config::Config;
use fleet_scheduler::dispatch::{JobWorker, LoggingMetrics};
use fleet_scheduler::services::register_builtin_handlers;
use fleet_scheduler::state::AppState;
use fleet_scheduler::{init_tracing, shutdown_signal};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    tracing::info!("Starting fleet scheduler worker...");

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let shutdown_timeout = config.shutdown_timeout();

    // Initialize application state
    let state = AppState::new(config)
        .await
        .context("Failed to initialize application state")?;
    if state.is_in_memory() {
        tracing::warn!("Standalone worker on the in-memory store only sees its own jobs");
    }

    let worker = JobWorker::with_metrics(
        state.queue.clone(),
        state.config.worker_config(),
        Arc::new(LoggingMetrics),
    );
    register_builtin_handlers(&worker, &state.config)
        .await
        .context("Failed to register job handlers")?;

    worker.start().await;
    tracing::info!(worker_id = %worker.worker_id(), "Worker started, waiting for jobs...");

    shutdown_signal().await;
    tracing::info!("Stopping worker...");

    if !worker.shutdown(shutdown_timeout).await {
        tracing::warn!("Exiting with handlers still in flight; their jobs will be recovered");
    }

    tracing::info!("Worker shutdown complete");
    Ok(())
}
