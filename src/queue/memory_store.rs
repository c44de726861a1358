use async_trait::async_trait;
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{unix_ms, Job, JobStore, ProcessingEntry, Trail};

/// Sorted-set score with a total order so it can key a `BTreeSet`
#[derive(Debug, Clone, Copy)]
struct Score(f64);

impl PartialEq for Score {
    fn eq(&self, other: &Self) -> bool {
        self.0.total_cmp(&other.0) == Ordering::Equal
    }
}

impl Eq for Score {}

impl PartialOrd for Score {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Score {
    fn cmp(&self, other: &Self) -> Ordering {
        self.0.total_cmp(&other.0)
    }
}

/// In-process equivalent of a Redis sorted set: ordered by score, then member
#[derive(Debug, Default)]
struct SortedSet {
    scores: HashMap<Uuid, f64>,
    order: BTreeSet<(Score, Uuid)>,
}

impl SortedSet {
    fn insert(&mut self, id: Uuid, score: f64) {
        if let Some(old) = self.scores.insert(id, score) {
            self.order.remove(&(Score(old), id));
        }
        self.order.insert((Score(score), id));
    }

    fn remove(&mut self, id: Uuid) -> bool {
        match self.scores.remove(&id) {
            Some(score) => {
                self.order.remove(&(Score(score), id));
                true
            }
            None => false,
        }
    }

    fn pop_max(&mut self) -> Option<Uuid> {
        let (_, id) = self.order.pop_last()?;
        self.scores.remove(&id);
        Some(id)
    }

    fn pop_min(&mut self, count: usize) -> Vec<Uuid> {
        let mut popped = Vec::with_capacity(count);
        while popped.len() < count {
            match self.order.pop_first() {
                Some((_, id)) => {
                    self.scores.remove(&id);
                    popped.push(id);
                }
                None => break,
            }
        }
        popped
    }

    fn range_to(&self, max: f64) -> Vec<Uuid> {
        self.order
            .iter()
            .take_while(|(score, _)| score.0 <= max)
            .map(|(_, id)| *id)
            .collect()
    }

    fn len(&self) -> u64 {
        self.scores.len() as u64
    }
}

/// Job store held entirely in process memory.
///
/// Used for tests and single-process deployments; state is lost on restart.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<Mutex<InMemoryStoreInner>>,
}

#[derive(Default)]
struct InMemoryStoreInner {
    jobs: HashMap<Uuid, Job>,
    queue: SortedSet,
    processing: HashMap<Uuid, ProcessingEntry>,
    retry: SortedSet,
    completed: SortedSet,
    failed: SortedSet,
}

impl InMemoryStoreInner {
    /// Drop the claim on `id` if it is the one taken at `claimed_at`
    fn take_claim(&mut self, id: Uuid, claimed_at: OffsetDateTime) -> bool {
        match self.processing.get(&id) {
            Some(entry) if entry.started_at == claimed_at => {
                self.processing.remove(&id);
                true
            }
            _ => false,
        }
    }

    fn trail_mut(&mut self, trail: Trail) -> &mut SortedSet {
        match trail {
            Trail::Completed => &mut self.completed,
            Trail::Failed => &mut self.failed,
        }
    }

    fn trail(&self, trail: Trail) -> &SortedSet {
        match trail {
            Trail::Completed => &self.completed,
            Trail::Failed => &self.failed,
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_pending(&self, job: &Job, score: f64) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        inner.queue.insert(job.id, score);
        Ok(())
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        let mut inner = self.inner.lock().await;
        inner.jobs.insert(job.id, job.clone());
        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> AppResult<Option<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.get(&id).cloned())
    }

    async fn delete_job(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.jobs.remove(&id).is_some())
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        let inner = self.inner.lock().await;
        Ok(inner.jobs.values().cloned().collect())
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        started_at: OffsetDateTime,
    ) -> AppResult<Option<Uuid>> {
        let mut inner = self.inner.lock().await;
        let Some(id) = inner.queue.pop_max() else {
            return Ok(None);
        };
        inner.processing.insert(
            id,
            ProcessingEntry {
                id,
                worker_id: worker_id.to_string(),
                started_at,
            },
        );
        Ok(Some(id))
    }

    async fn processing_entries(&self) -> AppResult<Vec<ProcessingEntry>> {
        let inner = self.inner.lock().await;
        Ok(inner.processing.values().cloned().collect())
    }

    async fn release_processing(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.processing.remove(&id).is_some())
    }

    async fn requeue_processing(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        score: f64,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.take_claim(job.id, claimed_at) {
            return Ok(false);
        }
        inner.jobs.insert(job.id, job.clone());
        inner.queue.insert(job.id, score);
        Ok(true)
    }

    async fn schedule_retry(&self, job: &Job, claimed_at: OffsetDateTime) -> AppResult<bool> {
        let due = job
            .next_retry_at
            .ok_or_else(|| AppError::Validation("Retry requires next_retry_at".to_string()))?;

        let mut inner = self.inner.lock().await;
        if !inner.take_claim(job.id, claimed_at) {
            return Ok(false);
        }
        inner.queue.remove(job.id);
        inner.jobs.insert(job.id, job.clone());
        inner.retry.insert(job.id, unix_ms(due) as f64);
        Ok(true)
    }

    async fn due_retries(&self, now_ms: i64) -> AppResult<Vec<Uuid>> {
        let inner = self.inner.lock().await;
        Ok(inner.retry.range_to(now_ms as f64))
    }

    async fn promote_retry(&self, job: &Job, score: f64) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.retry.remove(job.id) {
            return Ok(false);
        }
        inner.jobs.insert(job.id, job.clone());
        inner.queue.insert(job.id, score);
        Ok(true)
    }

    async fn remove_retry(&self, id: Uuid) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        Ok(inner.retry.remove(id))
    }

    async fn finish(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        trail: Trail,
        finished_ms: i64,
    ) -> AppResult<bool> {
        let mut inner = self.inner.lock().await;
        if !inner.take_claim(job.id, claimed_at) {
            return Ok(false);
        }
        inner.queue.remove(job.id);
        inner.retry.remove(job.id);
        inner.completed.remove(job.id);
        inner.failed.remove(job.id);
        inner.jobs.insert(job.id, job.clone());
        inner.trail_mut(trail).insert(job.id, finished_ms as f64);
        Ok(true)
    }

    async fn trim_trail(&self, trail: Trail, max_len: u64) -> AppResult<Vec<Uuid>> {
        let mut inner = self.inner.lock().await;
        let len = inner.trail(trail).len();
        if len <= max_len {
            return Ok(Vec::new());
        }
        let evicted = inner.trail_mut(trail).pop_min((len - max_len) as usize);
        for id in &evicted {
            inner.jobs.remove(id);
        }
        Ok(evicted)
    }

    async fn pending_count(&self) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.queue.len())
    }

    async fn processing_count(&self) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.processing.len() as u64)
    }

    async fn retry_count(&self) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.retry.len())
    }

    async fn trail_count(&self, trail: Trail) -> AppResult<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.trail(trail).len())
    }
}
