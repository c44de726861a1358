use std::sync::Arc;

use anyhow::Context;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use fleet_scheduler::config::Config;
use fleet_scheduler::dispatch::{JobWorker, LoggingMetrics};
use fleet_scheduler::handlers::{
    CreateJobRequest, HealthResponse, JobCreatedResponse, JobStatusResponse,
};
use fleet_scheduler::queue::{JobPriority, JobStatus, JobType, QueueStats};
use fleet_scheduler::services::register_builtin_handlers;
use fleet_scheduler::state::AppState;
use fleet_scheduler::{build_router, handlers, init_tracing, shutdown_signal};

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::health::health,
        handlers::job::create_job,
        handlers::job::get_job_status,
        handlers::job::get_queue_stats,
    ),
    components(schemas(
        HealthResponse,
        CreateJobRequest,
        JobCreatedResponse,
        JobStatusResponse,
        QueueStats,
        JobType,
        JobStatus,
        JobPriority,
    )),
    tags(
        (name = "Health", description = "Health check endpoints"),
        (name = "Jobs", description = "Job submission and status endpoints")
    )
)]
struct ApiDoc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    // Load configuration
    let config = Config::from_env().context("Failed to load configuration")?;
    let addr = config.server_addr();
    let shutdown_timeout = config.shutdown_timeout();

    // Initialize application state (connects to Redis when configured)
    let state = AppState::new(config)
        .await
        .context("Failed to initialize application state")?;

    // Without a shared store no separate worker can see our jobs, so run one here
    let embedded_worker = if state.is_in_memory() {
        let worker = JobWorker::with_metrics(
            state.queue.clone(),
            state.config.worker_config(),
            Arc::new(LoggingMetrics),
        );
        register_builtin_handlers(&worker, &state.config)
            .await
            .context("Failed to register job handlers")?;
        worker.start().await;
        Some(worker)
    } else {
        None
    };

    // Build the main application router
    let app = build_router(state)
        // Add Swagger UI
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!("Server started on http://{}", addr);
    tracing::info!("Swagger UI: http://{}/swagger-ui/", addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(worker) = embedded_worker {
        worker.shutdown(shutdown_timeout).await;
    }

    tracing::info!("Server shutdown complete");
    Ok(())
}
