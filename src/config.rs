use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::dispatch::WorkerConfig;
use crate::queue::{BackoffPolicy, QueueConfig};

#[derive(Debug, Clone)]
pub struct Config {
    // Store
    /// Redis connection string; the in-memory store is used when absent
    pub redis_url: Option<String>,
    pub queue_namespace: String,

    // Server
    pub host: String,
    pub port: u16,

    // Queue
    pub max_completed_jobs: u64,
    pub max_failed_jobs: u64,
    pub default_max_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_max_ms: u64,

    // Worker
    pub worker_id: Option<String>,
    pub poll_interval_ms: u64,
    pub processing_timeout_ms: u64,
    pub stale_sweep_interval_ms: u64,
    pub worker_concurrency: usize,
    pub shutdown_timeout_ms: u64,

    // Handlers
    pub webhook_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: None,
            queue_namespace: "fleet:jobs".to_string(),
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_completed_jobs: 1_000,
            max_failed_jobs: 1_000,
            default_max_attempts: 3,
            backoff_base_ms: 1_000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 300_000,
            worker_id: None,
            poll_interval_ms: 1_000,
            processing_timeout_ms: 300_000,
            stale_sweep_interval_ms: 60_000,
            worker_concurrency: 1,
            shutdown_timeout_ms: 30_000,
            webhook_timeout_secs: 10,
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.trim().parse().map_err(|_| ConfigError::Invalid(name)),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if exists

        let defaults = Self::default();
        let config = Self {
            // Store
            redis_url: env::var("REDIS_URL").ok().filter(|s| !s.trim().is_empty()),
            queue_namespace: env::var("QUEUE_NAMESPACE").unwrap_or(defaults.queue_namespace),

            // Server
            host: env::var("HOST").unwrap_or(defaults.host),
            port: parse_var("PORT", defaults.port)?,

            // Queue
            max_completed_jobs: parse_var("MAX_COMPLETED_JOBS", defaults.max_completed_jobs)?,
            max_failed_jobs: parse_var("MAX_FAILED_JOBS", defaults.max_failed_jobs)?,
            default_max_attempts: parse_var(
                "DEFAULT_MAX_ATTEMPTS",
                defaults.default_max_attempts,
            )?,
            backoff_base_ms: parse_var("BACKOFF_BASE_MS", defaults.backoff_base_ms)?,
            backoff_multiplier: parse_var("BACKOFF_MULTIPLIER", defaults.backoff_multiplier)?,
            backoff_max_ms: parse_var("BACKOFF_MAX_MS", defaults.backoff_max_ms)?,

            // Worker
            worker_id: env::var("WORKER_ID").ok(),
            poll_interval_ms: parse_var("POLL_INTERVAL_MS", defaults.poll_interval_ms)?,
            processing_timeout_ms: parse_var(
                "PROCESSING_TIMEOUT_MS",
                defaults.processing_timeout_ms,
            )?,
            stale_sweep_interval_ms: parse_var(
                "STALE_SWEEP_INTERVAL_MS",
                defaults.stale_sweep_interval_ms,
            )?,
            worker_concurrency: parse_var("WORKER_CONCURRENCY", defaults.worker_concurrency)?,
            shutdown_timeout_ms: parse_var("SHUTDOWN_TIMEOUT_MS", defaults.shutdown_timeout_ms)?,

            // Handlers
            webhook_timeout_secs: parse_var(
                "WEBHOOK_TIMEOUT_SECS",
                defaults.webhook_timeout_secs,
            )?,
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.default_max_attempts == 0 {
            return Err(ConfigError::Invalid("DEFAULT_MAX_ATTEMPTS"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("POLL_INTERVAL_MS"));
        }
        if self.stale_sweep_interval_ms == 0 {
            return Err(ConfigError::Invalid("STALE_SWEEP_INTERVAL_MS"));
        }
        if self.worker_concurrency == 0 {
            return Err(ConfigError::Invalid("WORKER_CONCURRENCY"));
        }
        if !(self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0) {
            return Err(ConfigError::Invalid("BACKOFF_MULTIPLIER"));
        }
        Ok(())
    }

    /// Get server address as "host:port"
    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn queue_config(&self) -> QueueConfig {
        QueueConfig {
            max_completed: self.max_completed_jobs,
            max_failed: self.max_failed_jobs,
            default_max_attempts: self.default_max_attempts,
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.backoff_base_ms),
                multiplier: self.backoff_multiplier,
                max: Duration::from_millis(self.backoff_max_ms),
            },
        }
    }

    pub fn worker_config(&self) -> WorkerConfig {
        let defaults = WorkerConfig::default();
        WorkerConfig {
            worker_id: self.worker_id.clone().unwrap_or(defaults.worker_id),
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            processing_timeout: Duration::from_millis(self.processing_timeout_ms),
            stale_sweep_interval: Duration::from_millis(self.stale_sweep_interval_ms),
            concurrency: self.worker_concurrency,
        }
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid environment variable: {0}")]
    Invalid(&'static str),
}
