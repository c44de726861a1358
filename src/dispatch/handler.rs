use async_trait::async_trait;
use std::future::Future;

use crate::queue::Job;

/// Business logic for one job type.
///
/// Handlers may run more than once for the same job (after a crash or a timeout),
/// so their effects must tolerate repetition. Returning an error schedules a retry
/// while attempts remain; the error's message is stored on the job verbatim.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> anyhow::Result<()>;
}

/// Adapts an async closure into a [`JobHandler`]
pub struct FnHandler<F>(pub F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(Job) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, job: Job) -> anyhow::Result<()> {
        (self.0)(job).await
    }
}
