use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

/// Job status enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Waiting in the priority queue or the retry queue
    Pending,
    /// Claimed by a worker
    Processing,
    /// Handler succeeded
    Completed,
    /// Attempts exhausted or job could not be dispatched
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Processing => "PROCESSING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "PROCESSING" => Some(Self::Processing),
            "COMPLETED" => Some(Self::Completed),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Kind of work a job represents; selects the handler that runs it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    CreateInstance,
    MonitorInstance,
    MonitorStartup,
    SendWebhook,
    MigrateInstance,
}

impl JobType {
    pub const ALL: [JobType; 5] = [
        Self::CreateInstance,
        Self::MonitorInstance,
        Self::MonitorStartup,
        Self::SendWebhook,
        Self::MigrateInstance,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CreateInstance => "CREATE_INSTANCE",
            Self::MonitorInstance => "MONITOR_INSTANCE",
            Self::MonitorStartup => "MONITOR_STARTUP",
            Self::SendWebhook => "SEND_WEBHOOK",
            Self::MigrateInstance => "MIGRATE_INSTANCE",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// Dispatch priority. Variant order is the total order `Low < Normal < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
    ToSchema,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobPriority {
    Low,
    #[default]
    Normal,
    High,
}

impl JobPriority {
    /// Band multiplier used by the priority score
    pub fn rank(&self) -> i64 {
        match self {
            Self::Low => 1,
            Self::Normal => 2,
            Self::High => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "LOW",
            Self::Normal => "NORMAL",
            Self::High => "HIGH",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "LOW" => Some(Self::Low),
            "NORMAL" => Some(Self::Normal),
            "HIGH" => Some(Self::High),
            _ => None,
        }
    }
}

/// One unit of deferred work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique job identifier, also the storage key
    pub id: Uuid,

    pub job_type: JobType,

    /// Handler-specific input, stored and returned verbatim
    pub payload: serde_json::Value,

    pub status: JobStatus,
    pub priority: JobPriority,

    /// Number of times the job has been claimed for a handler run
    pub attempts: u32,
    pub max_attempts: u32,

    /// Timestamps
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub processed_at: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_retry_at: Option<OffsetDateTime>,

    /// Last handler failure message
    pub error: Option<String>,
}

impl Job {
    pub fn new(job_type: JobType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_type,
            payload,
            status: JobStatus::Pending,
            priority: JobPriority::Normal,
            attempts: 0,
            max_attempts: 3,
            created_at: OffsetDateTime::now_utc(),
            processed_at: None,
            next_retry_at: None,
            error: None,
        }
    }

    pub fn with_priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Whether another failure would still leave an attempt to retry with
    pub fn can_retry(&self) -> bool {
        self.attempts < self.max_attempts
    }
}
