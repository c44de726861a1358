use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::error::AppResult;
use crate::state::AppState;

/// Health check response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    /// "redis" or "memory"
    pub store: String,
    pub queue_size: u64,
}

/// Liveness plus a store round trip
#[utoipa::path(
    get,
    path = "/health",
    responses(
        (status = 200, description = "Service healthy", body = HealthResponse),
        (status = 503, description = "Store unavailable")
    ),
    tag = "Health"
)]
pub async fn health(State(state): State<AppState>) -> AppResult<Json<HealthResponse>> {
    let queue_size = state.queue.queue_depth().await?;
    let store = if state.is_in_memory() { "memory" } else { "redis" };

    Ok(Json(HealthResponse {
        status: "ok".to_string(),
        store: store.to_string(),
        queue_size,
    }))
}
