pub mod webhook;

pub use webhook::{SendWebhookHandler, WebhookPayload};

use std::sync::Arc;

use crate::config::Config;
use crate::dispatch::JobWorker;
use crate::error::AppResult;
use crate::queue::JobType;

/// Register the handlers this crate ships with. Instance lifecycle handlers
/// are registered by the deploying system.
pub async fn register_builtin_handlers(worker: &JobWorker, config: &Config) -> AppResult<()> {
    let webhook = SendWebhookHandler::new(config.webhook_timeout())?;
    worker
        .register_handler(JobType::SendWebhook, Arc::new(webhook))
        .await;

    Ok(())
}
