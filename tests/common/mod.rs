#![allow(dead_code)]

mod app;
mod corrupt_store;

pub use app::{test_config, TestApp};
pub use corrupt_store::CorruptStore;

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleet_scheduler::dispatch::{JobWorker, WorkerConfig};
use fleet_scheduler::queue::{BackoffPolicy, InMemoryStore, JobQueue, QueueConfig};

/// Queue config with millisecond backoff so retries are due almost immediately
pub fn fast_queue_config() -> QueueConfig {
    QueueConfig {
        backoff: BackoffPolicy {
            base: Duration::from_millis(1),
            multiplier: 1.0,
            max: Duration::from_millis(1),
        },
        ..QueueConfig::default()
    }
}

pub fn memory_queue() -> Arc<JobQueue> {
    Arc::new(JobQueue::new(
        Arc::new(InMemoryStore::new()),
        fast_queue_config(),
    ))
}

pub fn fast_worker_config() -> WorkerConfig {
    WorkerConfig {
        worker_id: "test-worker".to_string(),
        poll_interval: Duration::from_millis(5),
        processing_timeout: Duration::from_secs(300),
        stale_sweep_interval: Duration::from_secs(60),
        concurrency: 1,
    }
}

pub fn worker_with(queue: Arc<JobQueue>, config: WorkerConfig) -> JobWorker {
    JobWorker::new(queue, config)
}

/// Poll `check` every few milliseconds until it returns true or `timeout` elapses
pub async fn wait_for<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
