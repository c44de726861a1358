use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::dispatch::JobHandler;
use crate::error::{AppError, AppResult};
use crate::queue::Job;

/// Payload of a `SEND_WEBHOOK` job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookPayload {
    /// Callback URL
    pub url: String,
    /// JSON body posted to the callback
    #[serde(default)]
    pub body: serde_json::Value,
    /// Extra request headers
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Delivers webhook notifications. Any non-2xx response is an error, so the
/// queue retries delivery with backoff.
pub struct SendWebhookHandler {
    client: Client,
}

impl SendWebhookHandler {
    pub fn new(timeout: Duration) -> AppResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Internal(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client })
    }
}

#[async_trait]
impl JobHandler for SendWebhookHandler {
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        let payload: WebhookPayload = serde_json::from_value(job.payload)
            .map_err(|e| anyhow::anyhow!("Invalid webhook payload: {}", e))?;

        let mut request = self
            .client
            .post(&payload.url)
            .header("X-Job-Id", job.id.to_string())
            .header("X-Job-Attempt", job.attempts)
            .json(&payload.body);
        for (name, value) in &payload.headers {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Webhook delivery to {} failed: {}", payload.url, e))?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Webhook {} responded with {}", payload.url, status);
        }

        tracing::info!(job_id = %job.id, url = %payload.url, status = status.as_u16(), "Webhook delivered");
        Ok(())
    }
}
