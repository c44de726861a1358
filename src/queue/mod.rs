pub mod backoff;
pub mod job;
pub mod job_queue;
pub mod memory_store;
pub mod record;
pub mod redis_store;

pub use backoff::BackoffPolicy;
pub use job::{Job, JobPriority, JobStatus, JobType};
pub use job_queue::{priority_score, FailureOutcome, JobQueue, NewJob, QueueConfig, QueueStats};
pub use memory_store::InMemoryStore;
pub use record::JobRecord;
pub use redis_store::RedisStore;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppResult;

/// Milliseconds since the Unix epoch
pub fn unix_ms(ts: OffsetDateTime) -> i64 {
    (ts.unix_timestamp_nanos() / 1_000_000) as i64
}

/// Bounded history of terminal jobs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Trail {
    Completed,
    Failed,
}

impl Trail {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

/// A claim on a job held by a worker, kept until the job is resolved
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingEntry {
    pub id: Uuid,
    pub worker_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
}

/// Storage contract for job records and their indexes.
///
/// Every job id lives in at most one index at a time: the priority queue, the
/// processing set, the retry queue or one of the trails. Methods that move a job
/// between indexes do so atomically and also rewrite the job record.
///
/// Transitions out of the processing set (`requeue_processing`, `schedule_retry`,
/// `finish`) take the `started_at` of the claim they resolve. They apply only
/// while that exact claim is still held and return `false`, changing nothing,
/// once it was released or replaced by a newer claim.
///
/// Sorted-set semantics are shared by all implementations: pop-max returns the
/// highest score and, on equal scores, the greatest id; range reads and pop-min
/// return ascending score, then ascending id.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Write a new record and add it to the priority queue
    async fn insert_pending(&self, job: &Job, score: f64) -> AppResult<()>;

    /// Overwrite a record without touching any index
    async fn save_job(&self, job: &Job) -> AppResult<()>;

    async fn get_job(&self, id: Uuid) -> AppResult<Option<Job>>;

    /// Delete a record without touching any index; returns whether it existed
    async fn delete_job(&self, id: Uuid) -> AppResult<bool>;

    /// All stored records, in no particular order
    async fn list_jobs(&self) -> AppResult<Vec<Job>>;

    /// Pop the highest-scored queue entry and record the claim in the processing
    /// set, as one atomic step
    async fn claim_next(
        &self,
        worker_id: &str,
        started_at: OffsetDateTime,
    ) -> AppResult<Option<Uuid>>;

    async fn processing_entries(&self) -> AppResult<Vec<ProcessingEntry>>;

    /// Drop a claim; returns whether one existed
    async fn release_processing(&self, id: Uuid) -> AppResult<bool>;

    /// Move a claimed job back to the priority queue
    async fn requeue_processing(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        score: f64,
    ) -> AppResult<bool>;

    /// Move a claimed job into the retry queue scored by its `next_retry_at`.
    /// Fails with a validation error when `next_retry_at` is not set.
    async fn schedule_retry(&self, job: &Job, claimed_at: OffsetDateTime) -> AppResult<bool>;

    /// Retry entries with a due time at or before `now_ms`, earliest first
    async fn due_retries(&self, now_ms: i64) -> AppResult<Vec<Uuid>>;

    /// Move a job from the retry queue to the priority queue. No-op returning
    /// `false` when another caller already promoted it.
    async fn promote_retry(&self, job: &Job, score: f64) -> AppResult<bool>;

    async fn remove_retry(&self, id: Uuid) -> AppResult<bool>;

    /// Record a claimed job in a trail, removing it from every other index
    async fn finish(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        trail: Trail,
        finished_ms: i64,
    ) -> AppResult<bool>;

    /// Evict the oldest trail entries beyond `max_len`, deleting their records.
    /// Returns the evicted ids.
    async fn trim_trail(&self, trail: Trail, max_len: u64) -> AppResult<Vec<Uuid>>;

    async fn pending_count(&self) -> AppResult<u64>;

    async fn processing_count(&self) -> AppResult<u64>;

    async fn retry_count(&self) -> AppResult<u64>;

    async fn trail_count(&self, trail: Trail) -> AppResult<u64>;
}
