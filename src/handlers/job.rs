use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{Job, JobPriority, JobStatus, JobType, NewJob, QueueStats};
use crate::state::AppState;

// ============ Request DTOs ============

/// Submit job request
#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateJobRequest {
    pub job_type: JobType,
    #[serde(default)]
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub priority: Option<JobPriority>,
    /// Defaults to the queue's configured ceiling
    pub max_attempts: Option<u32>,
}

// ============ Response DTOs ============

/// Job accepted response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobCreatedResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

/// Job status response
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JobStatusResponse {
    pub job_id: Uuid,
    pub job_type: JobType,
    #[schema(value_type = Object)]
    pub payload: serde_json::Value,
    pub status: JobStatus,
    pub priority: JobPriority,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(with = "time::serde::rfc3339")]
    #[schema(value_type = String)]
    pub created_at: time::OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>)]
    pub processed_at: Option<time::OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    #[schema(value_type = Option<String>)]
    pub next_retry_at: Option<time::OffsetDateTime>,
    pub error: Option<String>,
}

impl From<Job> for JobStatusResponse {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            payload: job.payload,
            status: job.status,
            priority: job.priority,
            attempts: job.attempts,
            max_attempts: job.max_attempts,
            created_at: job.created_at,
            processed_at: job.processed_at,
            next_retry_at: job.next_retry_at,
            error: job.error,
        }
    }
}

// ============ Handlers ============

/// Submit a job
#[utoipa::path(
    post,
    path = "/api/jobs",
    request_body = CreateJobRequest,
    responses(
        (status = 202, description = "Job accepted", body = JobCreatedResponse),
        (status = 400, description = "Validation error"),
        (status = 503, description = "Store unavailable")
    ),
    tag = "Jobs"
)]
pub async fn create_job(
    State(state): State<AppState>,
    Json(payload): Json<CreateJobRequest>,
) -> AppResult<(StatusCode, Json<JobCreatedResponse>)> {
    let mut new_job = NewJob::new(payload.job_type, payload.payload)
        .priority(payload.priority.unwrap_or_default());

    if let Some(max_attempts) = payload.max_attempts {
        if max_attempts == 0 {
            return Err(AppError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        new_job = new_job.max_attempts(max_attempts);
    }

    let job_id = state.queue.add_job(new_job).await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(JobCreatedResponse {
            job_id,
            status: JobStatus::Pending,
        }),
    ))
}

/// Get job status by ID
#[utoipa::path(
    get,
    path = "/api/jobs/{job_id}",
    params(
        ("job_id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job status", body = JobStatusResponse),
        (status = 404, description = "Job not found")
    ),
    tag = "Jobs"
)]
pub async fn get_job_status(
    State(state): State<AppState>,
    Path(job_id): Path<Uuid>,
) -> AppResult<Json<JobStatusResponse>> {
    let job = state
        .queue
        .get_job(job_id)
        .await?
        .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

    Ok(Json(job.into()))
}

/// Get queue statistics
#[utoipa::path(
    get,
    path = "/api/jobs/stats",
    responses(
        (status = 200, description = "Queue statistics", body = QueueStats)
    ),
    tag = "Jobs"
)]
pub async fn get_queue_stats(State(state): State<AppState>) -> AppResult<Json<QueueStats>> {
    let stats = state.queue.get_stats().await?;

    Ok(Json(stats))
}
