//! Exponential backoff for retryable operations

use crate::config::RetryConfig;
use crate::error::{ReplicationError, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// A policy for retrying operations with exponential backoff
#[derive(Debug, Clone, PartialEq)]
pub struct Backoff {
    /// The initial delay for the backoff
    pub delay: Duration,
    /// Factor applied to the delay after every failed attempt
    pub multiplier: u32,
    /// Upper bound for a single delay
    pub max_delay: Duration,
    /// Total attempts, including the first one
    pub max_attempts: u32,
}

impl Backoff {
    pub fn new(delay: Duration, multiplier: u32, max_delay: Duration, max_attempts: u32) -> Self {
        Self {
            delay,
            multiplier,
            max_delay,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Delay to wait after the given (1-based) failed attempt
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self
            .multiplier
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl From<&RetryConfig> for Backoff {
    fn from(config: &RetryConfig) -> Self {
        Backoff::new(
            config.base_delay(),
            config.multiplier,
            config.max_delay(),
            config.max_attempts,
        )
    }
}

/// Run `operation` until it succeeds, fails with a non-retryable error, or
/// exhausts the attempts. The closure receives the 1-based attempt number.
pub async fn retry_with_backoff<F, Fut, T>(
    backoff: &Backoff,
    cancel: &CancellationToken,
    context: &str,
    mut operation: F,
) -> Result<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        if cancel.is_cancelled() {
            return Err(ReplicationError::Cancelled);
        }

        let err = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_retryable() || attempt >= backoff.max_attempts {
            if err.is_retryable() {
                tracing::warn!(context, attempts = attempt, error = %err, "retries exhausted");
            }
            return Err(err);
        }

        let delay = backoff.delay_for(attempt);
        tracing::debug!(
            context,
            attempt,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "retrying after transient failure"
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = cancel.cancelled() => return Err(ReplicationError::Cancelled),
        }
        attempt += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(max_attempts: u32) -> Backoff {
        Backoff::new(Duration::from_millis(1), 2, Duration::from_millis(5), max_attempts)
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let backoff = Backoff::new(Duration::from_millis(100), 2, Duration::from_millis(350), 5);
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(3), Duration::from_millis(350));
        assert_eq!(backoff.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retries_transient_then_succeeds() {
        let calls = AtomicU32::new(0);
        let result = retry_with_backoff(&fast(4), &CancellationToken::new(), "test", |_| async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(ReplicationError::Network("reset".into()))
            } else {
                Ok(7)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_error_is_not_retried() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_with_backoff(&fast(4), &CancellationToken::new(), "test", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReplicationError::NotFound("gone".into()))
            })
            .await;
        assert!(matches!(result, Err(ReplicationError::NotFound(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_attempts_are_bounded() {
        let calls = AtomicU32::new(0);
        let result: Result<()> =
            retry_with_backoff(&fast(3), &CancellationToken::new(), "test", |_| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ReplicationError::Network("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<()> = retry_with_backoff(&fast(3), &cancel, "test", |_| async { Ok(()) }).await;
        assert!(matches!(result, Err(ReplicationError::Cancelled)));
    }
}
