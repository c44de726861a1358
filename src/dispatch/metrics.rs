use std::time::Duration;

use crate::queue::JobType;

/// Receives dispatch outcomes from the worker
pub trait MetricsSink: Send + Sync {
    fn record_job_start(&self, job_type: JobType);

    fn record_job_completion(
        &self,
        job_type: JobType,
        duration: Duration,
        success: bool,
        queue_depth: u64,
    );

    fn record_error(&self, job_type: JobType, error: &str);
}

/// Discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn record_job_start(&self, _job_type: JobType) {}

    fn record_job_completion(
        &self,
        _job_type: JobType,
        _duration: Duration,
        _success: bool,
        _queue_depth: u64,
    ) {
    }

    fn record_error(&self, _job_type: JobType, _error: &str) {}
}

/// Emits each measurement as a `tracing` event under the `fleet_scheduler::metrics`
/// target
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMetrics;

impl MetricsSink for LoggingMetrics {
    fn record_job_start(&self, job_type: JobType) {
        tracing::debug!(
            target: "fleet_scheduler::metrics",
            job_type = job_type.as_str(),
            "job_start"
        );
    }

    fn record_job_completion(
        &self,
        job_type: JobType,
        duration: Duration,
        success: bool,
        queue_depth: u64,
    ) {
        tracing::info!(
            target: "fleet_scheduler::metrics",
            job_type = job_type.as_str(),
            duration_ms = duration.as_millis() as u64,
            success,
            queue_depth,
            "job_completion"
        );
    }

    fn record_error(&self, job_type: JobType, error: &str) {
        tracing::info!(
            target: "fleet_scheduler::metrics",
            job_type = job_type.as_str(),
            error,
            "job_error"
        );
    }
}
