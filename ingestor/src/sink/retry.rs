use anyhow::Result;
use async_trait::async_trait;
use feed_core::Sink;
use std::path::Path;
use tokio::time::{sleep, Duration};
use tracing::warn;

/// Retries failed appends with exponential backoff before giving up.
/// Relocation is not retried.
pub struct RetryingSink<S: Sink> {
    inner: S,
    max_retries: usize,
}

impl<S: Sink> RetryingSink<S> {
    pub fn new(inner: S, max_retries: usize) -> Self {
        Self { inner, max_retries }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S: Sink> Sink for RetryingSink<S> {
    async fn append(&self, entity_id: &str, record: &str) -> Result<()> {
        let mut attempts = 0usize;
        let mut delay = Duration::from_millis(10);
        let max_delay = Duration::from_millis(200);
        loop {
            match self.inner.append(entity_id, record).await {
                Ok(()) => return Ok(()),
                Err(e) if attempts < self.max_retries => {
                    attempts += 1;
                    warn!(entity = entity_id, attempt = attempts, error = %e, "append failed, retrying");
                    sleep(delay).await;
                    delay = std::cmp::min(delay.saturating_mul(2), max_delay);
                }
                Err(e) => {
                    if feed_core::config::metrics_enabled() {
                        metrics::counter!("stream_append_failures_total").increment(1);
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn relocate(&self, entity_id: &str, source: &Path, archive: &Path) -> Result<()> {
        self.inner.relocate(entity_id, source, archive).await
    }
}
