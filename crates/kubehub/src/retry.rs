//! Retry for transient (connection-class) cluster errors.

use std::future::Future;
use std::time::Duration;

use kubelab_core::ClusterError;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Exponential backoff: `base`, `2*base`, `4*base`, ... for up to `max_retries`
/// retries. Only [`ClusterError::Connection`] is retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self { Self { max_retries: 3, base: Duration::from_secs(1) } }
}

/// Why [`RetryPolicy::run`] gave up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryError {
    Cluster(ClusterError),
    Cancelled,
}

impl RetryPolicy {
    pub fn from_env() -> Self {
        Self {
            max_retries: kubelab_core::env_or("LAB_RETRY_MAX", 3u32),
            base: kubelab_core::env_millis("LAB_RETRY_BASE_MS", 1000),
        }
    }

    /// Delay before retry number `retry` (0-based).
    pub fn delay(&self, retry: u32) -> Duration { self.base.saturating_mul(1u32 << retry.min(16)) }

    /// Run `op` until it succeeds, fails with a non-retryable error, runs out
    /// of retries, or `cancel` fires during a backoff sleep.
    pub async fn run<T, F, Fut>(&self, what: &str, cancel: &CancellationToken, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ClusterError>>,
    {
        let mut retry = 0u32;
        loop {
            let res = tokio::select! {
                _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                r = op() => r,
            };
            match res {
                Ok(v) => return Ok(v),
                Err(e) if e.is_retryable() && retry < self.max_retries => {
                    let delay = self.delay(retry);
                    warn!(op = %what, attempt = retry + 1, delay_ms = delay.as_millis() as u64, error = %e, "retrying after connection error");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RetryError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    retry += 1;
                }
                Err(e) => return Err(RetryError::Cluster(e)),
            }
        }
    }
}
