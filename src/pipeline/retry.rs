use std::future::Future;
use std::time::Duration;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use tracing::warn;

use crate::common::error::{PipelineError, Result};
use crate::config::RetryConfig;
use crate::observability::metrics;

/// Bounded timeout and exponential backoff around one I/O operation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub timeout: Duration,
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            attempts: config.attempts.max(1),
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: config.max_delay(),
            timeout: config.timeout(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl RetryPolicy {
    /// Delays between attempts: base, 2·base, 4·base ... capped at `max_delay`.
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        let factor = (self.base_delay.as_millis() as u64 / 2).max(1);
        ExponentialBackoff::from_millis(2)
            .factor(factor)
            .max_delay(self.max_delay)
            .map(jitter)
            .take(self.attempts.saturating_sub(1) as usize)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// attempts run out. Each attempt is cut off after `policy.timeout`.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let timeout = policy.timeout;
    let action = || {
        let attempt = op();
        async move {
            match tokio::time::timeout(timeout, attempt).await {
                Ok(result) => result,
                Err(_) => Err(PipelineError::Timeout {
                    operation: operation.to_string(),
                    timeout,
                }),
            }
        }
    };
    let condition = |e: &PipelineError| {
        let retry = e.is_retryable();
        if retry {
            warn!(operation, error = %e, "Transient failure, retrying");
            metrics::pipeline::retry_attempted(operation);
        }
        retry
    };
    RetryIf::spawn(policy.strategy(), action, condition).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            timeout: Duration::from_millis(200),
        }
    }

    fn transient() -> PipelineError {
        PipelineError::Write {
            object_key: "k".to_string(),
            reason: "connection reset".to_string(),
            retryable: true,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried_until_success() {
        let calls = AtomicU32::new(0);
        let result = with_retry(&fast(3), "put", || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err(transient())
                } else {
                    Ok(n)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(3), "put", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(transient()) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permanent_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> = with_retry(&fast(3), "read", || {
            calls.fetch_add(1, Ordering::SeqCst);
            async {
                Err(PipelineError::Read {
                    locator: "raw/x.json".to_string(),
                    reason: "corrupt".to_string(),
                    retryable: false,
                })
            }
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Read { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_slow_attempts_time_out() {
        let policy = RetryPolicy {
            timeout: Duration::from_millis(10),
            ..fast(2)
        };
        let result: Result<()> = with_retry(&policy, "notify", || async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(PipelineError::Timeout { .. })));
    }
}
