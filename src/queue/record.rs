use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::queue::{Job, JobPriority, JobStatus, JobType};

/// Text form of a [`Job`] as written to the store.
///
/// Every field is a string or an integer: timestamps are RFC 3339, enums use their
/// literal names and the payload is carried as encoded JSON text so nested values,
/// escapes and date strings come back exactly as they went in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: String,
    pub payload: String,
    pub status: String,
    pub priority: String,
    pub attempts: u32,
    pub max_attempts: u32,
    pub created_at: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_retry_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl JobRecord {
    /// Encode into the single string stored under `N:data:<id>`
    pub fn encode(&self) -> AppResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> AppResult<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

fn format_ts(ts: OffsetDateTime) -> AppResult<String> {
    Ok(ts.format(&Rfc3339)?)
}

fn parse_ts(raw: &str) -> AppResult<OffsetDateTime> {
    Ok(OffsetDateTime::parse(raw, &Rfc3339)?)
}

impl Job {
    pub fn to_record(&self) -> AppResult<JobRecord> {
        Ok(JobRecord {
            id: self.id.to_string(),
            job_type: self.job_type.as_str().to_string(),
            payload: serde_json::to_string(&self.payload)?,
            status: self.status.as_str().to_string(),
            priority: self.priority.as_str().to_string(),
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            created_at: format_ts(self.created_at)?,
            processed_at: self.processed_at.map(format_ts).transpose()?,
            next_retry_at: self.next_retry_at.map(format_ts).transpose()?,
            error: self.error.clone(),
        })
    }

    pub fn from_record(record: JobRecord) -> AppResult<Self> {
        let id = Uuid::parse_str(&record.id)
            .map_err(|e| AppError::Serialization(format!("Invalid job id: {}", e)))?;
        let job_type = JobType::parse(&record.job_type).ok_or_else(|| {
            AppError::Serialization(format!("Unknown job type: {}", record.job_type))
        })?;
        let status = JobStatus::parse(&record.status).ok_or_else(|| {
            AppError::Serialization(format!("Unknown job status: {}", record.status))
        })?;
        let priority = JobPriority::parse(&record.priority).ok_or_else(|| {
            AppError::Serialization(format!("Unknown job priority: {}", record.priority))
        })?;

        Ok(Self {
            id,
            job_type,
            payload: serde_json::from_str(&record.payload)?,
            status,
            priority,
            attempts: record.attempts,
            max_attempts: record.max_attempts,
            created_at: parse_ts(&record.created_at)?,
            processed_at: record.processed_at.as_deref().map(parse_ts).transpose()?,
            next_retry_at: record.next_retry_at.as_deref().map(parse_ts).transpose()?,
            error: record.error,
        })
    }

    /// Shorthand for `to_record()?.encode()`
    pub fn encode(&self) -> AppResult<String> {
        self.to_record()?.encode()
    }

    pub fn decode(raw: &str) -> AppResult<Self> {
        Self::from_record(JobRecord::decode(raw)?)
    }
}
