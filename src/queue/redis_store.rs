use async_trait::async_trait;
use redis::aio::ConnectionManager as RedisConnectionManager;
use redis::{AsyncCommands, Script};
use std::collections::HashMap;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{unix_ms, Job, JobStore, ProcessingEntry, Trail};

const CLAIM_NEXT_LUA: &str = include_str!("lua/claim_next.lua");
const REQUEUE_PROCESSING_LUA: &str = include_str!("lua/requeue_processing.lua");
const PROMOTE_RETRY_LUA: &str = include_str!("lua/promote_retry.lua");
const TRIM_TRAIL_LUA: &str = include_str!("lua/trim_trail.lua");
const SCHEDULE_RETRY_LUA: &str = include_str!("lua/schedule_retry.lua");
const FINISH_LUA: &str = include_str!("lua/finish.lua");

/// Hash field holding the serialized record
const RECORD_FIELD: &str = "data";

/// Number of keys requested per SCAN round trip
const SCAN_BATCH: usize = 200;

/// Redis keys structure (namespace `N`):
/// - N:data:{id}    - Hash, field `data` = serialized job record
/// - N:queue        - Sorted set, member = id, score = priority score
/// - N:processing   - Hash, field = id, value = {id, workerId, startedAt}
/// - N:retry        - Sorted set, member = id, score = retry due time (ms)
/// - N:completed    - Sorted set, member = id, score = completion time (ms)
/// - N:failed       - Sorted set, member = id, score = failure time (ms)
#[derive(Clone)]
pub struct RedisStore {
    conn: RedisConnectionManager,
    namespace: String,
    claim_next_script: Script,
    requeue_processing_script: Script,
    promote_retry_script: Script,
    trim_trail_script: Script,
    schedule_retry_script: Script,
    finish_script: Script,
}

impl RedisStore {
    pub fn new(conn: RedisConnectionManager, namespace: impl Into<String>) -> Self {
        Self {
            conn,
            namespace: namespace.into(),
            claim_next_script: Script::new(CLAIM_NEXT_LUA),
            requeue_processing_script: Script::new(REQUEUE_PROCESSING_LUA),
            promote_retry_script: Script::new(PROMOTE_RETRY_LUA),
            trim_trail_script: Script::new(TRIM_TRAIL_LUA),
            schedule_retry_script: Script::new(SCHEDULE_RETRY_LUA),
            finish_script: Script::new(FINISH_LUA),
        }
    }

    /// Open a managed connection to `redis_url`
    pub async fn connect(redis_url: &str, namespace: impl Into<String>) -> AppResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = RedisConnectionManager::new(client).await?;
        Ok(Self::new(conn, namespace))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn data_prefix(&self) -> String {
        format!("{}:data:", self.namespace)
    }

    fn job_key(&self, id: Uuid) -> String {
        format!("{}{}", self.data_prefix(), id)
    }

    fn queue_key(&self) -> String {
        format!("{}:queue", self.namespace)
    }

    fn processing_key(&self) -> String {
        format!("{}:processing", self.namespace)
    }

    fn retry_key(&self) -> String {
        format!("{}:retry", self.namespace)
    }

    fn trail_key(&self, trail: Trail) -> String {
        format!("{}:{}", self.namespace, trail.as_str())
    }

    fn parse_id(raw: &str) -> AppResult<Uuid> {
        Uuid::parse_str(raw)
            .map_err(|e| AppError::Serialization(format!("Invalid job id {:?}: {}", raw, e)))
    }

    fn parse_ids(raw: Vec<String>) -> AppResult<Vec<Uuid>> {
        raw.iter().map(|s| Self::parse_id(s)).collect()
    }

    fn claim_arg(claimed_at: OffsetDateTime) -> AppResult<String> {
        Ok(claimed_at.format(&Rfc3339)?)
    }

    async fn scan_job_keys(&self) -> AppResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let pattern = format!("{}*", self.data_prefix());
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        Ok(keys)
    }
}

#[async_trait]
impl JobStore for RedisStore {
    async fn insert_pending(&self, job: &Job, score: f64) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let record = job.encode()?;
        let id = job.id.to_string();

        let _: () = redis::pipe()
            .atomic()
            .hset(self.job_key(job.id), RECORD_FIELD, record)
            .ignore()
            .zadd(self.queue_key(), &id, score)
            .ignore()
            .query_async(&mut conn)
            .await?;

        Ok(())
    }

    async fn save_job(&self, job: &Job) -> AppResult<()> {
        let mut conn = self.conn.clone();
        let record = job.encode()?;

        let _: () = conn.hset(self.job_key(job.id), RECORD_FIELD, record).await?;

        Ok(())
    }

    async fn get_job(&self, id: Uuid) -> AppResult<Option<Job>> {
        let mut conn = self.conn.clone();

        let raw: Option<String> = conn.hget(self.job_key(id), RECORD_FIELD).await?;

        raw.map(|raw| Job::decode(&raw)).transpose()
    }

    async fn delete_job(&self, id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let removed: u64 = conn.del(self.job_key(id)).await?;

        Ok(removed > 0)
    }

    async fn list_jobs(&self) -> AppResult<Vec<Job>> {
        let keys = self.scan_job_keys().await?;
        if keys.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.conn.clone();
        let mut jobs = Vec::with_capacity(keys.len());
        for chunk in keys.chunks(SCAN_BATCH) {
            let mut pipe = redis::pipe();
            for key in chunk {
                pipe.hget(key, RECORD_FIELD);
            }
            let raws: Vec<Option<String>> = pipe.query_async(&mut conn).await?;
            // Records deleted between SCAN and HGET come back as nil
            for (key, raw) in chunk.iter().zip(raws) {
                let Some(raw) = raw else { continue };
                match Job::decode(&raw) {
                    Ok(job) => jobs.push(job),
                    Err(e) => {
                        tracing::error!(key = %key, error = %e, "Skipping corrupt job record");
                    }
                }
            }
        }

        Ok(jobs)
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        started_at: OffsetDateTime,
    ) -> AppResult<Option<Uuid>> {
        let mut conn = self.conn.clone();
        let started_at = Self::claim_arg(started_at)?;

        let claimed: Option<String> = self
            .claim_next_script
            .key(self.queue_key())
            .key(self.processing_key())
            .arg(worker_id)
            .arg(started_at)
            .invoke_async(&mut conn)
            .await?;

        claimed.as_deref().map(Self::parse_id).transpose()
    }

    async fn processing_entries(&self) -> AppResult<Vec<ProcessingEntry>> {
        let mut conn = self.conn.clone();

        let raw: HashMap<String, String> = conn.hgetall(self.processing_key()).await?;

        raw.values()
            .map(|value| serde_json::from_str(value).map_err(AppError::from))
            .collect()
    }

    async fn release_processing(&self, id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let removed: u64 = conn.hdel(self.processing_key(), id.to_string()).await?;

        Ok(removed > 0)
    }

    async fn requeue_processing(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        score: f64,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let record = job.encode()?;

        let moved: i64 = self
            .requeue_processing_script
            .key(self.processing_key())
            .key(self.job_key(job.id))
            .key(self.queue_key())
            .arg(job.id.to_string())
            .arg(Self::claim_arg(claimed_at)?)
            .arg(record)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn schedule_retry(&self, job: &Job, claimed_at: OffsetDateTime) -> AppResult<bool> {
        let due = job
            .next_retry_at
            .ok_or_else(|| AppError::Validation("Retry requires next_retry_at".to_string()))?;

        let mut conn = self.conn.clone();
        let record = job.encode()?;

        let moved: i64 = self
            .schedule_retry_script
            .key(self.processing_key())
            .key(self.job_key(job.id))
            .key(self.retry_key())
            .key(self.queue_key())
            .arg(job.id.to_string())
            .arg(Self::claim_arg(claimed_at)?)
            .arg(record)
            .arg(unix_ms(due))
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn due_retries(&self, now_ms: i64) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();

        let ids: Vec<String> = conn.zrangebyscore(self.retry_key(), "-inf", now_ms).await?;

        Self::parse_ids(ids)
    }

    async fn promote_retry(&self, job: &Job, score: f64) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let record = job.encode()?;

        let moved: i64 = self
            .promote_retry_script
            .key(self.retry_key())
            .key(self.job_key(job.id))
            .key(self.queue_key())
            .arg(job.id.to_string())
            .arg(record)
            .arg(score)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn remove_retry(&self, id: Uuid) -> AppResult<bool> {
        let mut conn = self.conn.clone();

        let removed: u64 = conn.zrem(self.retry_key(), id.to_string()).await?;

        Ok(removed > 0)
    }

    async fn finish(
        &self,
        job: &Job,
        claimed_at: OffsetDateTime,
        trail: Trail,
        finished_ms: i64,
    ) -> AppResult<bool> {
        let mut conn = self.conn.clone();
        let record = job.encode()?;
        let other = match trail {
            Trail::Completed => Trail::Failed,
            Trail::Failed => Trail::Completed,
        };

        let moved: i64 = self
            .finish_script
            .key(self.processing_key())
            .key(self.job_key(job.id))
            .key(self.trail_key(trail))
            .key(self.queue_key())
            .key(self.retry_key())
            .key(self.trail_key(other))
            .arg(job.id.to_string())
            .arg(Self::claim_arg(claimed_at)?)
            .arg(record)
            .arg(finished_ms)
            .invoke_async(&mut conn)
            .await?;

        Ok(moved == 1)
    }

    async fn trim_trail(&self, trail: Trail, max_len: u64) -> AppResult<Vec<Uuid>> {
        let mut conn = self.conn.clone();

        let evicted: Vec<String> = self
            .trim_trail_script
            .key(self.trail_key(trail))
            .arg(max_len)
            .arg(self.data_prefix())
            .invoke_async(&mut conn)
            .await?;

        Self::parse_ids(evicted)
    }

    async fn pending_count(&self) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.zcard(self.queue_key()).await?;
        Ok(len)
    }

    async fn processing_count(&self) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.hlen(self.processing_key()).await?;
        Ok(len)
    }

    async fn retry_count(&self) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.zcard(self.retry_key()).await?;
        Ok(len)
    }

    async fn trail_count(&self, trail: Trail) -> AppResult<u64> {
        let mut conn = self.conn.clone();
        let len: u64 = conn.zcard(self.trail_key(trail)).await?;
        Ok(len)
    }
}
