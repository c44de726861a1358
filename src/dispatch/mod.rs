pub mod handler;
pub mod metrics;

pub use handler::{FnHandler, JobHandler};
pub use metrics::{LoggingMetrics, MetricsSink, NoopMetrics};

use futures::FutureExt;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::error::AppResult;
use crate::queue::{FailureOutcome, Job, JobQueue, JobType};

/// Worker tunables
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Identifier recorded on every claim this worker makes
    pub worker_id: String,
    pub poll_interval: Duration,
    /// Claims older than this are considered abandoned by the stale sweep
    pub processing_timeout: Duration,
    pub stale_sweep_interval: Duration,
    /// Handlers allowed in flight at once
    pub concurrency: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", Uuid::new_v4()),
            poll_interval: Duration::from_millis(1_000),
            processing_timeout: Duration::from_secs(300),
            stale_sweep_interval: Duration::from_secs(60),
            concurrency: 1,
        }
    }
}

/// Polls a [`JobQueue`] and runs claimed jobs through registered handlers.
///
/// Cloning is cheap; clones drive the same worker.
#[derive(Clone)]
pub struct JobWorker {
    inner: Arc<WorkerInner>,
}

struct WorkerInner {
    queue: Arc<JobQueue>,
    config: WorkerConfig,
    handlers: RwLock<HashMap<JobType, Arc<dyn JobHandler>>>,
    metrics: Arc<dyn MetricsSink>,
    permits: Arc<Semaphore>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl JobWorker {
    pub fn new(queue: Arc<JobQueue>, config: WorkerConfig) -> Self {
        Self::with_metrics(queue, config, Arc::new(NoopMetrics))
    }

    /// Build a worker reporting to `metrics`
    pub fn with_metrics(
        queue: Arc<JobQueue>,
        mut config: WorkerConfig,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        config.concurrency = config.concurrency.max(1);
        let (shutdown, _) = watch::channel(false);

        Self {
            inner: Arc::new(WorkerInner {
                queue,
                permits: Arc::new(Semaphore::new(config.concurrency)),
                config,
                handlers: RwLock::new(HashMap::new()),
                metrics,
                shutdown,
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.inner.config.worker_id
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    /// Register the handler for `job_type`, replacing any previous one
    pub async fn register_handler(&self, job_type: JobType, handler: Arc<dyn JobHandler>) {
        let replaced = self
            .inner
            .handlers
            .write()
            .await
            .insert(job_type, handler)
            .is_some();

        tracing::debug!(job_type = job_type.as_str(), replaced, "Handler registered");
    }

    /// Register an async closure as the handler for `job_type`
    pub async fn register_fn<F, Fut>(&self, job_type: JobType, f: F)
    where
        F: Fn(Job) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.register_handler(job_type, Arc::new(FnHandler(f))).await;
    }

    /// Handlers currently running
    pub fn in_flight(&self) -> usize {
        self.inner.config.concurrency - self.inner.permits.available_permits()
    }

    pub async fn is_running(&self) -> bool {
        !self.inner.tasks.lock().await.is_empty()
    }

    /// Spawn the polling loop and the stale sweep
    pub async fn start(&self) {
        let mut tasks = self.inner.tasks.lock().await;
        if !tasks.is_empty() {
            tracing::warn!(worker_id = %self.worker_id(), "Worker already running");
            return;
        }

        self.inner.shutdown.send_replace(false);
        tasks.push(tokio::spawn(
            self.inner.clone().poll_loop(self.inner.shutdown.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.inner.clone().sweep_loop(self.inner.shutdown.subscribe()),
        ));

        tracing::info!(
            worker_id = %self.worker_id(),
            poll_interval_ms = self.inner.config.poll_interval.as_millis() as u64,
            concurrency = self.inner.config.concurrency,
            "Worker started"
        );
    }

    /// Stop polling and sweeping. Handlers already running are left to finish.
    pub async fn stop(&self) {
        self.inner.shutdown.send_replace(true);

        let tasks = std::mem::take(&mut *self.inner.tasks.lock().await);
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Worker loop ended abnormally");
            }
        }

        tracing::info!(worker_id = %self.worker_id(), "Worker stopped");
    }

    /// Stop, then wait up to `timeout` for in-flight handlers. Returns `true` when
    /// every handler finished in time. Running handlers are never cancelled.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.inner.shutdown.send_replace(true);

        let concurrency = self.inner.config.concurrency as u32;
        let drained = tokio::time::timeout(timeout, async {
            self.stop().await;
            self.inner.permits.acquire_many(concurrency).await.is_ok()
        })
        .await
        .unwrap_or(false);

        if drained {
            tracing::info!(worker_id = %self.worker_id(), "Worker shut down cleanly");
        } else {
            tracing::warn!(
                worker_id = %self.worker_id(),
                in_flight = self.in_flight(),
                "Shutdown timed out with handlers still running"
            );
        }

        drained
    }

    /// Run one polling step: promote due retries, then claim and dispatch a job
    /// if a concurrency slot is free. Returns the id of the dispatched job.
    pub async fn tick(&self) -> AppResult<Option<Uuid>> {
        self.inner.tick().await
    }
}

impl WorkerInner {
    async fn poll_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            if let Err(e) = self.tick().await {
                tracing::error!(worker_id = %self.config.worker_id, error = %e, "Poll tick failed");
            }
        }
    }

    async fn sweep_loop(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.stale_sweep_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => {}
            }
            if *shutdown.borrow() {
                break;
            }

            match self
                .queue
                .recover_stale_processing(self.config.processing_timeout)
                .await
            {
                Ok(0) => {}
                Ok(recovered) => {
                    tracing::warn!(recovered, "Recovered stale processing jobs");
                }
                Err(e) => {
                    tracing::error!(error = %e, "Stale processing sweep failed");
                }
            }
        }
    }

    async fn tick(self: &Arc<Self>) -> AppResult<Option<Uuid>> {
        self.queue
            .promote_ready_retries(OffsetDateTime::now_utc())
            .await?;

        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            tracing::trace!("All dispatch slots busy");
            return Ok(None);
        };

        let Some(job) = self.queue.get_next_job(&self.config.worker_id).await? else {
            return Ok(None);
        };

        let job_id = job.id;
        let inner = self.clone();
        tokio::spawn(async move {
            inner.dispatch(job).await;
            drop(permit);
        });

        Ok(Some(job_id))
    }

    async fn dispatch(&self, job: Job) {
        let job_id = job.id;
        let job_type = job.job_type;

        let handler = self.handlers.read().await.get(&job_type).cloned();
        let Some(handler) = handler else {
            let message = format!("No handler registered for job type {}", job_type.as_str());
            tracing::error!(
                job_id = %job_id,
                job_type = job_type.as_str(),
                "Configuration error: no handler registered"
            );
            self.metrics.record_error(job_type, &message);
            match self.queue.fail_claimed_permanently(&job, message).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::debug!(job_id = %job_id, "Claim lost before the failure was recorded");
                }
                Err(e) => {
                    tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
                }
            }
            return;
        };

        self.metrics.record_job_start(job_type);
        let started = Instant::now();

        let outcome = match AssertUnwindSafe(handler.handle(job.clone())).catch_unwind().await {
            Ok(result) => result.map_err(|e| e.to_string()),
            Err(panic) => Err(panic_message(panic)),
        };
        let duration = started.elapsed();

        match outcome {
            Ok(()) => {
                match self.queue.complete_claimed(&job).await {
                    Ok(true) => {}
                    Ok(false) => {
                        tracing::debug!(job_id = %job_id, "Claim lost before completion was recorded");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as complete");
                    }
                }
                self.report_completion(job_type, duration, true).await;
            }
            Err(message) => {
                tracing::warn!(
                    job_id = %job_id,
                    job_type = job_type.as_str(),
                    error = %message,
                    "Handler failed"
                );
                self.metrics.record_error(job_type, &message);
                match self.queue.fail_claimed(&job, message).await {
                    Ok(FailureOutcome::Retrying { next_retry_at }) => {
                        tracing::debug!(job_id = %job_id, %next_retry_at, "Retry pending");
                    }
                    Ok(FailureOutcome::Exhausted) => {}
                    Ok(FailureOutcome::ClaimLost) => {
                        tracing::debug!(job_id = %job_id, "Claim lost before the failure was recorded");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Failed to mark job as failed");
                    }
                }
                self.report_completion(job_type, duration, false).await;
            }
        }
    }

    async fn report_completion(&self, job_type: JobType, duration: Duration, success: bool) {
        let queue_depth = match self.queue.queue_depth().await {
            Ok(depth) => depth,
            Err(e) => {
                tracing::debug!(error = %e, "Queue depth unavailable for metrics");
                0
            }
        };
        self.metrics
            .record_job_completion(job_type, duration, success, queue_depth);
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    let detail = if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    };
    format!("Handler panicked: {}", detail)
}
