use std::collections::HashSet;
use std::sync::Mutex;

use async_trait::async_trait;
use time::OffsetDateTime;
use uuid::Uuid;

use fleet_scheduler::error::{AppError, AppResult};
use fleet_scheduler::queue::{InMemoryStore, Job, JobStore, ProcessingEntry, Trail};

/// In-memory store whose records for selected ids no longer decode
#[derive(Default)]
pub struct CorruptStore {
    inner: InMemoryStore,
    corrupt: Mutex<HashSet<Uuid>>,
}

impl CorruptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every later read of `id` fail to decode
    pub fn corrupt(&self, id: Uuid) {
        self.corrupt.lock().unwrap().insert(id);
    }

    fn is_corrupt(&self, id: Uuid) -> bool {
        self.corrupt.lock().unwrap().contains(&id)
    }
}

#[async_trait]
impl JobStore for CorruptStore {
    async fn insert_pending(&self, job: &Job, score: f64) -> AppResult<()> {
        self.inner.insert_pending(job, score).await
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        self.inner.save_job(job).await
    }

    async fn get_job(&self, id: Uuid) -> AppResult<Option<Job>> {
        if self.is_corrupt(id) {
            return Err(AppError::Serialization(
                "expected value at line 1 column 1".to_string(),
            ));
        }
        self.inner.get_job(id).await
    }

    async fn delete_job(&self, id: Uuid) -> AppResult<bool> {
        self.inner.delete_job(id).await
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        let jobs = self.inner.list_jobs().await?;
        Ok(jobs.into_iter().filter(|j| !self.is_corrupt(j.id)).collect())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        started_at: OffsetDateTime,
    ) -> AppResult<Option<Uuid>> {
        self.inner.claim_next(worker_id, started_at).await
    }

    async fn processing_entries(&self) -> AppResult<Vec<ProcessingEntry>> {
        self.inner.processing_entries().await
    }

    async fn release_processing(&self, id: Uuid) -> AppResult<bool> {
        self.inner.release_processing(id).await
    }

    async fn requeue_processing(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        score: f64,
    ) -> AppResult<bool> {
        self.inner.requeue_processing(job, claimed_at, score).await
    }

    async fn schedule_retry(&self, job: &Job, claimed_at: OffsetDateTime) -> AppResult<bool> {
        self.inner.schedule_retry(job, claimed_at).await
    }

    async fn due_retries(&self, now_ms: i64) -> AppResult<Vec<Uuid>> {
        self.inner.due_retries(now_ms).await
    }

    async fn promote_retry(&self, job: &Job, score: f64) -> AppResult<bool> {
        self.inner.promote_retry(job, score).await
    }

    async fn remove_retry(&self, id: Uuid) -> AppResult<bool> {
        self.inner.remove_retry(id).await
    }

    async fn finish(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        trail: Trail,
        finished_ms: i64,
    ) -> AppResult<bool> {
        self.inner.finish(job, claimed_at, trail, finished_ms).await
    }

    async fn trim_trail(&self, trail: Trail, max_len: u64) -> AppResult<Vec<Uuid>> {
        self.inner.trim_trail(trail, max_len).await
    }

    async fn pending_count(&self) -> AppResult<u64> {
        self.inner.pending_count().await
    }

    async fn processing_count(&self) -> AppResult<u64> {
        self.inner.processing_count().await
    }

    async fn retry_count(&self) -> AppResult<u64> {
        self.inner.retry_count().await
    }

    async fn trail_count(&self, trail: Trail) -> AppResult<u64> {
        self.inner.trail_count(trail).await
    }
}
