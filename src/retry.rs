//! Bounded retry with exponential backoff and per-call timeouts.
//!
//! Only errors for which [`SyncError::is_transient`] holds are retried.
//! Delays double from `base` on each attempt and are capped at `max`.

use std::future::Future;
use std::time::Duration;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base: Duration,
    pub max: Duration,
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
            max: Duration::from_millis(config.backoff_max_ms),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// Run `op`, retrying transient failures according to `policy`.
pub async fn retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0u32;
    loop {
        let result = match tokio::time::timeout(policy.call_timeout, op()).await {
            Ok(r) => r,
            Err(_) => Err(SyncError::Timeout {
                operation: operation.to_string(),
                secs: policy.call_timeout.as_secs(),
            }),
        };

        match result {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                attempt += 1;
                let delay = policy.delay(attempt);
                tracing::warn!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}
