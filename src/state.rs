use std::sync::Arc;

use crate::config::Config;
use crate::queue::{InMemoryStore, JobQueue, JobStore, RedisStore};

/// Application state shared across all handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    /// Job queue backed by Redis or the in-memory store
    pub queue: Arc<JobQueue>,
}

impl AppState {
    /// Create a new AppState, connecting to Redis when `REDIS_URL` is set
    pub async fn new(config: Config) -> Result<Self, AppStateError> {
        let store: Arc<dyn JobStore> = match config.redis_url.as_deref() {
            Some(url) => {
                let store = RedisStore::connect(url, config.queue_namespace.clone())
                    .await
                    .map_err(|e| AppStateError::Redis(e.to_string()))?;
                tracing::info!(namespace = %store.namespace(), "Using Redis job store");
                Arc::new(store)
            }
            None => {
                tracing::warn!("REDIS_URL not set, jobs are kept in memory only");
                Arc::new(InMemoryStore::new())
            }
        };

        Ok(Self::with_store(config, store))
    }

    /// Create AppState with a custom store (for testing)
    pub fn with_store(config: Config, store: Arc<dyn JobStore>) -> Self {
        let queue = Arc::new(JobQueue::new(store, config.queue_config()));
        Self { config, queue }
    }

    /// Whether jobs only live in this process
    pub fn is_in_memory(&self) -> bool {
        self.config.redis_url.is_none()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AppStateError {
    #[error("Redis connection error: {0}")]
    Redis(String),
}
