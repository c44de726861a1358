use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{
    unix_ms, BackoffPolicy, Job, JobPriority, JobStatus, JobStore, JobType, Trail,
};

/// Width of one priority band in the priority score. Larger than any realistic
/// difference between two admission times in milliseconds (~317 years).
pub const PRIORITY_BAND_WIDTH: f64 = 1.0e13;

/// Priority score: higher priority always sorts first, then earlier admission.
pub fn priority_score(priority: JobPriority, admitted_ms: i64) -> f64 {
    priority.rank() as f64 * PRIORITY_BAND_WIDTH - admitted_ms as f64
}

/// Queue tunables
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Completed trail bound
    pub max_completed: u64,
    /// Failed trail bound
    pub max_failed: u64,
    /// Ceiling used when a job is added without one
    pub default_max_attempts: u32,
    pub backoff: BackoffPolicy,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_completed: 1_000,
            max_failed: 1_000,
            default_max_attempts: 3,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Admission request for [`JobQueue::add_job`]
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub priority: JobPriority,
    pub max_attempts: Option<u32>,
}

impl NewJob {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            job_type,
            payload,
            priority: JobPriority::Normal,
            max_attempts: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }
}

/// What `fail_job` did with the job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Parked in the retry queue until `next_retry_at`
    Retrying { next_retry_at: OffsetDateTime },
    /// No attempts left; recorded in the failed trail
    Exhausted,
    /// The claim was already resolved or reclaimed; nothing was recorded
    ClaimLost,
}

/// Snapshot of queue sizes
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, ToSchema)]
pub struct QueueStats {
    pub queue_size: u64,
    pub processing_count: u64,
    pub retry_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
    /// Stored jobs per type, across every state
    pub jobs_by_type: BTreeMap<String, u64>,
}

/// Priority job queue over a [`JobStore`].
///
/// The queue is the only component that changes a job's status, attempts,
/// timestamps or error. Workers claim jobs with [`get_next_job`](Self::get_next_job)
/// and report back with [`complete_job`](Self::complete_job) or
/// [`fail_job`](Self::fail_job).
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    config: QueueConfig,
    /// Last admission time handed out, in ms; strictly increasing
    last_admission_ms: AtomicI64,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, config: QueueConfig) -> Self {
        Self {
            store,
            config,
            last_admission_ms: AtomicI64::new(0),
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Admission time for scoring. Follows the wall clock but never repeats, so
    /// jobs admitted within the same millisecond keep their FIFO order.
    fn next_admission_ms(&self, at: OffsetDateTime) -> i64 {
        let now_ms = unix_ms(at);
        let previous = self
            .last_admission_ms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(now_ms.max(last + 1))
            })
            .unwrap_or_else(|last| last);
        now_ms.max(previous + 1)
    }

    /// Persist a new job and make it visible to workers
    pub async fn add_job(&self, new_job: NewJob) -> AppResult<Uuid> {
        let max_attempts = new_job
            .max_attempts
            .unwrap_or(self.config.default_max_attempts);
        let job = Job::new(new_job.job_type, new_job.payload)
            .with_priority(new_job.priority)
            .with_max_attempts(max_attempts);

        let score = priority_score(job.priority, self.next_admission_ms(job.created_at));
        self.store.insert_pending(&job, score).await?;

        tracing::info!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            priority = job.priority.as_str(),
            max_attempts = job.max_attempts,
            "Job enqueued"
        );

        Ok(job.id)
    }

    pub async fn get_job(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        self.store.get_job(job_id).await
    }

    /// Read the record behind an index entry. A record that no longer decodes is
    /// reported as missing, so the caller drops the reference like an evicted one.
    async fn load_referenced(&self, job_id: Uuid) -> AppResult<Option<Job>> {
        match self.store.get_job(job_id).await {
            Err(AppError::Serialization(e)) => {
                tracing::error!(job_id = %job_id, error = %e, "Corrupt job record, dropping reference");
                Ok(None)
            }
            other => other,
        }
    }

    /// Claim the highest-priority pending job for `worker_id`.
    ///
    /// The claim is recorded in the processing set and the job's attempt counter
    /// is incremented. The returned job's `processed_at` identifies the claim.
    /// Returns `None` when the queue is empty.
    pub async fn get_next_job(&self, worker_id: &str) -> AppResult<Option<Job>> {
        loop {
            let now = OffsetDateTime::now_utc();
            let Some(job_id) = self.store.claim_next(worker_id, now).await? else {
                return Ok(None);
            };

            let Some(mut job) = self.load_referenced(job_id).await? else {
                tracing::warn!(job_id = %job_id, "Claimed job has no record, dropping claim");
                self.store.release_processing(job_id).await?;
                continue;
            };

            job.status = JobStatus::Processing;
            job.attempts += 1;
            job.processed_at = Some(now);
            self.store.save_job(&job).await?;

            tracing::info!(
                job_id = %job_id,
                job_type = job.job_type.as_str(),
                attempts = job.attempts,
                worker_id = worker_id,
                "Job dequeued"
            );

            return Ok(Some(job));
        }
    }

    /// Load a job together with the claim an outcome is reported against.
    /// `claimed_at` defaults to the job's latest claim.
    async fn load_claimed(
        &self,
        job_id: Uuid,
        claimed_at: Option<OffsetDateTime>,
    ) -> AppResult<Option<(Job, OffsetDateTime)>> {
        let job = self
            .store
            .get_job(job_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Job".to_string()))?;

        Ok(claimed_at.or(job.processed_at).map(|claim| (job, claim)))
    }

    fn log_claim_lost(job: &Job, outcome: &'static str) {
        tracing::warn!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            outcome,
            "Claim no longer held, outcome ignored"
        );
    }

    /// Mark the current claim on `job_id` as succeeded. Returns `false` when the
    /// job is not claimed and nothing was recorded.
    pub async fn complete_job(&self, job_id: Uuid) -> AppResult<bool> {
        self.complete(job_id, None).await
    }

    /// Mark the claim that handed out `claimed` as succeeded. Returns `false` when
    /// that claim was already resolved or reclaimed by the stale sweep.
    pub async fn complete_claimed(&self, claimed: &Job) -> AppResult<bool> {
        self.complete(claimed.id, claimed.processed_at).await
    }

    async fn complete(&self, job_id: Uuid, claimed_at: Option<OffsetDateTime>) -> AppResult<bool> {
        let Some((mut job, claim)) = self.load_claimed(job_id, claimed_at).await? else {
            return Ok(false);
        };

        let now = OffsetDateTime::now_utc();
        job.status = JobStatus::Completed;
        job.next_retry_at = None;
        if !self
            .store
            .finish(&job, claim, Trail::Completed, unix_ms(now))
            .await?
        {
            Self::log_claim_lost(&job, "completed");
            return Ok(false);
        }

        tracing::info!(
            job_id = %job_id,
            job_type = job.job_type.as_str(),
            attempts = job.attempts,
            "Job completed"
        );

        self.cleanup_completed().await?;
        Ok(true)
    }

    /// Record a handler failure against the current claim on `job_id`. Retries
    /// with backoff while attempts remain, otherwise fails the job for good.
    pub async fn fail_job(&self, job_id: Uuid, error: String) -> AppResult<FailureOutcome> {
        self.fail(job_id, None, error).await
    }

    /// [`fail_job`](Self::fail_job) against the claim that handed out `claimed`
    pub async fn fail_claimed(&self, claimed: &Job, error: String) -> AppResult<FailureOutcome> {
        self.fail(claimed.id, claimed.processed_at, error).await
    }

    async fn fail(
        &self,
        job_id: Uuid,
        claimed_at: Option<OffsetDateTime>,
        error: String,
    ) -> AppResult<FailureOutcome> {
        let Some((mut job, claim)) = self.load_claimed(job_id, claimed_at).await? else {
            return Ok(FailureOutcome::ClaimLost);
        };

        let now = OffsetDateTime::now_utc();
        job.error = Some(error);

        if !job.can_retry() {
            return Ok(if self.mark_failed(job, claim, now).await? {
                FailureOutcome::Exhausted
            } else {
                FailureOutcome::ClaimLost
            });
        }

        let delay = self.config.backoff.delay(job.attempts);
        let next_retry_at = now + delay;
        job.status = JobStatus::Pending;
        job.next_retry_at = Some(next_retry_at);
        if !self.store.schedule_retry(&job, claim).await? {
            Self::log_claim_lost(&job, "failed");
            return Ok(FailureOutcome::ClaimLost);
        }

        tracing::warn!(
            job_id = %job_id,
            job_type = job.job_type.as_str(),
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            retry_in_ms = delay.as_millis() as u64,
            error = job.error.as_deref().unwrap_or_default(),
            "Job failed, retry scheduled"
        );

        Ok(FailureOutcome::Retrying { next_retry_at })
    }

    /// Fail the current claim on `job_id` without consuming its remaining
    /// attempts. Returns `false` when the job is not claimed.
    pub async fn fail_job_permanently(&self, job_id: Uuid, error: String) -> AppResult<bool> {
        self.fail_permanently(job_id, None, error).await
    }

    /// [`fail_job_permanently`](Self::fail_job_permanently) against the claim
    /// that handed out `claimed`
    pub async fn fail_claimed_permanently(&self, claimed: &Job, error: String) -> AppResult<bool> {
        self.fail_permanently(claimed.id, claimed.processed_at, error)
            .await
    }

    async fn fail_permanently(
        &self,
        job_id: Uuid,
        claimed_at: Option<OffsetDateTime>,
        error: String,
    ) -> AppResult<bool> {
        let Some((mut job, claim)) = self.load_claimed(job_id, claimed_at).await? else {
            return Ok(false);
        };

        job.error = Some(error);
        self.mark_failed(job, claim, OffsetDateTime::now_utc()).await
    }

    async fn mark_failed(
        &self,
        mut job: Job,
        claim: OffsetDateTime,
        now: OffsetDateTime,
    ) -> AppResult<bool> {
        job.status = JobStatus::Failed;
        job.next_retry_at = None;
        if !self
            .store
            .finish(&job, claim, Trail::Failed, unix_ms(now))
            .await?
        {
            Self::log_claim_lost(&job, "failed");
            return Ok(false);
        }

        tracing::error!(
            job_id = %job.id,
            job_type = job.job_type.as_str(),
            attempts = job.attempts,
            error = job.error.as_deref().unwrap_or_default(),
            "Job failed permanently"
        );

        self.cleanup_failed().await?;
        Ok(true)
    }

    /// Move retry entries due at or before `now` back into the priority queue.
    /// Returns how many were promoted.
    pub async fn promote_ready_retries(&self, now: OffsetDateTime) -> AppResult<usize> {
        let due = self.store.due_retries(unix_ms(now)).await?;
        let mut promoted = 0;

        for job_id in due {
            let Some(mut job) = self.load_referenced(job_id).await? else {
                tracing::debug!(job_id = %job_id, "Retry entry without record, dropping");
                self.store.remove_retry(job_id).await?;
                continue;
            };

            job.status = JobStatus::Pending;
            job.next_retry_at = None;
            let score = priority_score(
                job.priority,
                self.next_admission_ms(OffsetDateTime::now_utc()),
            );

            if self.store.promote_retry(&job, score).await? {
                promoted += 1;
                tracing::info!(
                    job_id = %job_id,
                    job_type = job.job_type.as_str(),
                    attempts = job.attempts,
                    "Retry promoted to queue"
                );
            }
        }

        Ok(promoted)
    }

    /// Reclaim jobs whose claim is older than `processing_timeout`
    pub async fn recover_stale_processing(&self, processing_timeout: Duration) -> AppResult<usize> {
        self.recover_stale_processing_at(OffsetDateTime::now_utc(), processing_timeout)
            .await
    }

    /// [`recover_stale_processing`](Self::recover_stale_processing) against an
    /// explicit clock reading
    pub async fn recover_stale_processing_at(
        &self,
        now: OffsetDateTime,
        processing_timeout: Duration,
    ) -> AppResult<usize> {
        let cutoff = now - processing_timeout;
        let entries = self.store.processing_entries().await?;
        let mut recovered = 0;

        for entry in entries.into_iter().filter(|e| e.started_at < cutoff) {
            let Some(mut job) = self.load_referenced(entry.id).await? else {
                tracing::debug!(job_id = %entry.id, "Processing entry without record, dropping");
                self.store.release_processing(entry.id).await?;
                continue;
            };

            if !job.can_retry() {
                job.error = Some(format!(
                    "Processing timed out after {} ms on worker {}",
                    processing_timeout.as_millis(),
                    entry.worker_id
                ));
                if self.mark_failed(job, entry.started_at, now).await? {
                    recovered += 1;
                }
                continue;
            }

            job.status = JobStatus::Pending;
            let score = priority_score(
                job.priority,
                self.next_admission_ms(OffsetDateTime::now_utc()),
            );

            if self
                .store
                .requeue_processing(&job, entry.started_at, score)
                .await?
            {
                recovered += 1;
                tracing::warn!(
                    job_id = %entry.id,
                    worker_id = %entry.worker_id,
                    attempts = job.attempts,
                    "Stale job returned to queue"
                );
            }
        }

        Ok(recovered)
    }

    /// Evict the oldest completed jobs beyond the configured bound
    pub async fn cleanup_completed(&self) -> AppResult<usize> {
        self.cleanup(Trail::Completed, self.config.max_completed)
            .await
    }

    /// Evict the oldest failed jobs beyond the configured bound
    pub async fn cleanup_failed(&self) -> AppResult<usize> {
        self.cleanup(Trail::Failed, self.config.max_failed).await
    }

    async fn cleanup(&self, trail: Trail, max_len: u64) -> AppResult<usize> {
        let evicted = self.store.trim_trail(trail, max_len).await?;
        if !evicted.is_empty() {
            tracing::debug!(
                trail = trail.as_str(),
                evicted = evicted.len(),
                "Trail trimmed"
            );
        }
        Ok(evicted.len())
    }

    /// Number of jobs waiting in the priority queue
    pub async fn queue_depth(&self) -> AppResult<u64> {
        self.store.pending_count().await
    }

    pub async fn get_stats(&self) -> AppResult<QueueStats> {
        let mut jobs_by_type: BTreeMap<String, u64> = BTreeMap::new();
        for job in self.store.list_jobs().await? {
            *jobs_by_type
                .entry(job.job_type.as_str().to_string())
                .or_default() += 1;
        }

        Ok(QueueStats {
            queue_size: self.store.pending_count().await?,
            processing_count: self.store.processing_count().await?,
            retry_count: self.store.retry_count().await?,
            completed_count: self.store.trail_count(Trail::Completed).await?,
            failed_count: self.store.trail_count(Trail::Failed).await?,
            jobs_by_type,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InMemoryStore;
    use serde_json::json;

    fn queue_with(config: QueueConfig) -> JobQueue {
        JobQueue::new(Arc::new(InMemoryStore::new()), config)
    }

    fn queue() -> JobQueue {
        queue_with(QueueConfig::default())
    }

    #[test]
    fn test_priority_beats_age() {
        let old_low = priority_score(JobPriority::Low, 0);
        let new_normal = priority_score(JobPriority::Normal, 4_102_444_800_000);
        assert!(new_normal > old_low);

        let earlier = priority_score(JobPriority::High, 1_000);
        let later = priority_score(JobPriority::High, 1_001);
        assert!(earlier > later);
    }

    #[test]
    fn test_admission_clock_never_repeats() {
        let queue = queue();
        let now = OffsetDateTime::now_utc();
        let a = queue.next_admission_ms(now);
        let b = queue.next_admission_ms(now);
        let c = queue.next_admission_ms(now - Duration::from_secs(60));
        assert!(a < b && b < c);
        assert!(a >= unix_ms(now));
    }

    #[tokio::test]
    async fn test_add_and_get_job() {
        let queue = queue();

        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorInstance, json!({"instanceId": "i-1"})))
            .await
            .unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_attempts, 3);
        assert_eq!(job.payload, json!({"instanceId": "i-1"}));
        assert_eq!(queue.queue_depth().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dequeue_order_scenario() {
        let queue = queue();

        let create = queue
            .add_job(NewJob::new(JobType::CreateInstance, json!({})).priority(JobPriority::High))
            .await
            .unwrap();
        let webhook = queue
            .add_job(NewJob::new(JobType::SendWebhook, json!({})).priority(JobPriority::Low))
            .await
            .unwrap();
        let monitor = queue
            .add_job(NewJob::new(JobType::MonitorInstance, json!({})))
            .await
            .unwrap();

        let mut order = Vec::new();
        while let Some(job) = queue.get_next_job("w1").await.unwrap() {
            order.push(job.id);
        }
        assert_eq!(order, vec![create, monitor, webhook]);
    }

    #[tokio::test]
    async fn test_fifo_within_band() {
        let queue = queue();

        let mut admitted = Vec::new();
        for i in 0..20 {
            let id = queue
                .add_job(NewJob::new(JobType::SendWebhook, json!({ "n": i })))
                .await
                .unwrap();
            admitted.push(id);
        }

        for expected in admitted {
            let job = queue.get_next_job("w1").await.unwrap().unwrap();
            assert_eq!(job.id, expected);
        }
        assert!(queue.get_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dequeue_claims_job() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::CreateInstance, json!({})))
            .await
            .unwrap();

        let job = queue.get_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);
        assert!(job.processed_at.is_some());

        let entries = queue.store().processing_entries().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].id, job_id);
        assert_eq!(entries[0].worker_id, "w1");
        assert_eq!(queue.queue_depth().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_complete_job() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::CreateInstance, json!({})))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();

        queue.complete_job(job_id).await.unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.processing_count, 0);
        assert_eq!(stats.completed_count, 1);
    }

    #[tokio::test]
    async fn test_fail_job_schedules_retry() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorStartup, json!({})).max_attempts(3))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();

        let before = OffsetDateTime::now_utc();
        let outcome = queue
            .fail_job(job_id, "connection refused".to_string())
            .await
            .unwrap();

        let FailureOutcome::Retrying { next_retry_at } = outcome else {
            panic!("expected a retry, got {:?}", outcome);
        };
        assert!(next_retry_at > before);

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.error.as_deref(), Some("connection refused"));
        assert_eq!(job.next_retry_at, Some(next_retry_at));

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.processing_count, 0);
        assert_eq!(stats.retry_count, 1);
        assert_eq!(stats.queue_size, 0);
    }

    #[tokio::test]
    async fn test_retry_readiness() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorStartup, json!({})))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();
        queue.fail_job(job_id, "boom".to_string()).await.unwrap();

        let now = OffsetDateTime::now_utc();
        assert_eq!(queue.promote_ready_retries(now).await.unwrap(), 0);
        assert_eq!(queue.get_stats().await.unwrap().retry_count, 1);

        let later = now + Duration::from_secs(3_600);
        assert_eq!(queue.promote_ready_retries(later).await.unwrap(), 1);

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.next_retry_at.is_none());
        assert_eq!(job.error.as_deref(), Some("boom"));

        let again = queue.get_next_job("w1").await.unwrap().unwrap();
        assert_eq!(again.id, job_id);
        assert_eq!(again.attempts, 2);
    }

    #[tokio::test]
    async fn test_exhaustion_after_max_attempts() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::CreateInstance, json!({})).max_attempts(2))
            .await
            .unwrap();
        let far_future = OffsetDateTime::now_utc() + Duration::from_secs(86_400);

        queue.get_next_job("w1").await.unwrap().unwrap();
        let first = queue.fail_job(job_id, "e1".to_string()).await.unwrap();
        assert!(matches!(first, FailureOutcome::Retrying { .. }));
        queue.promote_ready_retries(far_future).await.unwrap();

        let job = queue.get_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.attempts, 2);
        let second = queue.fail_job(job_id, "e2".to_string()).await.unwrap();
        assert_eq!(second, FailureOutcome::Exhausted);

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.error.as_deref(), Some("e2"));
        assert!(job.next_retry_at.is_none());

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.failed_count, 1);
        assert_eq!(stats.retry_count, 0);
        assert_eq!(stats.queue_size, 0);
        assert!(queue.get_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_fail_permanently_skips_retry() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MigrateInstance, json!({})).max_attempts(5))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();

        queue
            .fail_job_permanently(job_id, "no handler".to_string())
            .await
            .unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert_eq!(queue.get_stats().await.unwrap().retry_count, 0);
    }

    #[tokio::test]
    async fn test_unknown_job_is_not_found() {
        let queue = queue();
        let err = queue.complete_job(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
        let err = queue
            .fail_job(Uuid::new_v4(), "x".to_string())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_stale_recovery() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorInstance, json!({})))
            .await
            .unwrap();
        queue.get_next_job("crashed-worker").await.unwrap();

        let now = OffsetDateTime::now_utc();
        let timeout = Duration::from_secs(60);

        // Claim is younger than the timeout
        assert_eq!(
            queue.recover_stale_processing_at(now, timeout).await.unwrap(),
            0
        );
        assert_eq!(queue.get_stats().await.unwrap().processing_count, 1);

        let later = now + Duration::from_secs(120);
        assert_eq!(
            queue.recover_stale_processing_at(later, timeout).await.unwrap(),
            1
        );

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.processing_count, 0);
        assert_eq!(stats.queue_size, 1);

        let job = queue.get_next_job("w2").await.unwrap().unwrap();
        assert_eq!(job.id, job_id);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_stale_recovery_on_last_attempt_fails_job() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorInstance, json!({})).max_attempts(1))
            .await
            .unwrap();
        queue.get_next_job("crashed-worker").await.unwrap();

        let later = OffsetDateTime::now_utc() + Duration::from_secs(600);
        queue
            .recover_stale_processing_at(later, Duration::from_secs(60))
            .await
            .unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(job.error.unwrap().contains("crashed-worker"));
    }

    #[tokio::test]
    async fn test_late_outcome_after_reclaim_is_ignored() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::CreateInstance, json!({})))
            .await
            .unwrap();
        let first = queue.get_next_job("slow-worker").await.unwrap().unwrap();

        let later = OffsetDateTime::now_utc() + Duration::from_secs(600);
        assert_eq!(
            queue
                .recover_stale_processing_at(later, Duration::from_secs(60))
                .await
                .unwrap(),
            1
        );
        let second = queue.get_next_job("w2").await.unwrap().unwrap();
        assert_eq!(second.id, job_id);
        assert_ne!(second.processed_at, first.processed_at);

        // The original worker reports after its claim was handed to w2
        assert_eq!(
            queue
                .fail_claimed(&first, "node lost".to_string())
                .await
                .unwrap(),
            FailureOutcome::ClaimLost
        );
        assert!(!queue.complete_claimed(&first).await.unwrap());
        assert!(!queue
            .fail_claimed_permanently(&first, "node lost".to_string())
            .await
            .unwrap());

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.error.is_none());
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.processing_count, 1);
        assert_eq!(stats.retry_count, 0);
        assert_eq!(stats.failed_count, 0);

        assert!(queue.complete_claimed(&second).await.unwrap());
        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempts, 2);
    }

    #[tokio::test]
    async fn test_outcome_is_recorded_once() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::SendWebhook, json!({})))
            .await
            .unwrap();
        let claimed = queue.get_next_job("w1").await.unwrap().unwrap();

        assert!(queue.complete_claimed(&claimed).await.unwrap());
        assert!(!queue.complete_job(job_id).await.unwrap());
        assert_eq!(
            queue.fail_job(job_id, "late".to_string()).await.unwrap(),
            FailureOutcome::ClaimLost
        );

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.completed_count, 1);
        assert_eq!(stats.failed_count, 0);
        assert_eq!(stats.retry_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_claim_resolved_meanwhile() {
        let queue = queue();
        let job_id = queue
            .add_job(NewJob::new(JobType::MonitorInstance, json!({})).max_attempts(1))
            .await
            .unwrap();
        let claimed = queue.get_next_job("w1").await.unwrap().unwrap();
        let stale = queue.store().processing_entries().await.unwrap();
        assert_eq!(stale.len(), 1);

        assert!(queue.complete_claimed(&claimed).await.unwrap());

        // The sweep read the claim before completion and acts on it afterwards
        let mut job = queue.get_job(job_id).await.unwrap().unwrap();
        job.error = Some("timed out".to_string());
        let now = OffsetDateTime::now_utc();
        assert!(!queue
            .mark_failed(job, stale[0].started_at, now)
            .await
            .unwrap());

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.error.is_none());
        assert_eq!(queue.get_stats().await.unwrap().failed_count, 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dequeue_claims_each_job_once() {
        let queue = Arc::new(queue());
        let mut added = std::collections::HashSet::new();
        for _ in 0..8 {
            added.insert(
                queue
                    .add_job(NewJob::new(JobType::MonitorInstance, json!({})))
                    .await
                    .unwrap(),
            );
        }

        let claims = (0..16).map(|n| {
            let queue = queue.clone();
            tokio::spawn(async move { queue.get_next_job(&format!("w{}", n)).await.unwrap() })
        });
        let claimed: Vec<Uuid> = futures::future::join_all(claims)
            .await
            .into_iter()
            .filter_map(|joined| joined.unwrap().map(|job| job.id))
            .collect();

        assert_eq!(claimed.len(), 8);
        assert_eq!(claimed.into_iter().collect::<std::collections::HashSet<_>>(), added);
        assert_eq!(queue.get_stats().await.unwrap().processing_count, 8);
    }

    #[tokio::test]
    async fn test_missing_records_are_skipped() {
        let queue = queue();

        // Retry entry whose record disappeared
        let retried = queue
            .add_job(NewJob::new(JobType::SendWebhook, json!({})))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();
        queue.fail_job(retried, "boom".to_string()).await.unwrap();
        assert!(queue.store().delete_job(retried).await.unwrap());

        let later = OffsetDateTime::now_utc() + Duration::from_secs(3_600);
        assert_eq!(queue.promote_ready_retries(later).await.unwrap(), 0);
        assert_eq!(queue.get_stats().await.unwrap().retry_count, 0);

        // Queue entry whose record disappeared
        let queued = queue
            .add_job(NewJob::new(JobType::SendWebhook, json!({})))
            .await
            .unwrap();
        queue.store().delete_job(queued).await.unwrap();
        assert!(queue.get_next_job("w1").await.unwrap().is_none());
        assert_eq!(queue.get_stats().await.unwrap().processing_count, 0);

        // Claim whose record disappeared
        let claimed = queue
            .add_job(NewJob::new(JobType::SendWebhook, json!({})))
            .await
            .unwrap();
        queue.get_next_job("w1").await.unwrap();
        queue.store().delete_job(claimed).await.unwrap();
        assert_eq!(
            queue
                .recover_stale_processing_at(later, Duration::from_secs(1))
                .await
                .unwrap(),
            0
        );
        assert_eq!(queue.get_stats().await.unwrap().processing_count, 0);
    }

    #[tokio::test]
    async fn test_bounded_completed_trail() {
        let queue = queue_with(QueueConfig {
            max_completed: 3,
            ..QueueConfig::default()
        });

        let mut completed = Vec::new();
        for _ in 0..5 {
            let job_id = queue
                .add_job(NewJob::new(JobType::SendWebhook, json!({})))
                .await
                .unwrap();
            queue.get_next_job("w1").await.unwrap();
            queue.complete_job(job_id).await.unwrap();
            completed.push(job_id);
            // Completion scores are millisecond timestamps
            tokio::time::sleep(Duration::from_millis(2)).await;
        }

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.completed_count, 3);
        for evicted in &completed[..2] {
            assert!(queue.get_job(*evicted).await.unwrap().is_none());
        }
        for kept in &completed[2..] {
            assert!(queue.get_job(*kept).await.unwrap().is_some());
        }
    }

    #[tokio::test]
    async fn test_stats_by_type() {
        let queue = queue();
        for job_type in [
            JobType::CreateInstance,
            JobType::CreateInstance,
            JobType::SendWebhook,
        ] {
            queue.add_job(NewJob::new(job_type, json!({}))).await.unwrap();
        }

        let stats = queue.get_stats().await.unwrap();
        assert_eq!(stats.queue_size, 3);
        assert_eq!(stats.jobs_by_type.get("CREATE_INSTANCE"), Some(&2));
        assert_eq!(stats.jobs_by_type.get("SEND_WEBHOOK"), Some(&1));
        assert_eq!(stats.jobs_by_type.get("MONITOR_INSTANCE"), None);
    }
}
