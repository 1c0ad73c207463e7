// Retry-with-backoff shared by segment fetching.
//
// Delays grow linearly with the attempt number (base * (attempt + 1)), capped by max_delay,
// with optional jitter. Every wait is raced against the task's cancellation token.

use crate::error::DownloadError;
use rand::RngExt;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the initial attempt).
    pub max_retries: u32,
    /// Delay unit. Retry `n` (0-indexed) waits `base_delay * (n + 1)`.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// When true, adds random jitter of [0, base_delay/2) to prevent thundering herd.
    pub jitter: bool,
}

impl RetryPolicy {
    /// Compute the delay before the retry that follows `attempt` (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = attempt.saturating_add(1);
        let linear = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay);
        let capped = linear.min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        // Jitter is limited so the final delay never exceeds `max_delay`.
        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let jitter_limit_ms = jitter_range_ms.min(remaining_ms);
        if jitter_limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..jitter_limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Result of a single attempt, used by the caller to signal retryability.
pub enum RetryAction<T> {
    /// Operation succeeded.
    Success(T),
    /// Operation failed with a retryable error (network, 5xx, timeout).
    Retry(DownloadError),
    /// Operation failed with a non-retryable error (4xx, missing work dir).
    Fail(DownloadError),
}

/// Outcome of [`retry_with_backoff`] when it gives up.
#[derive(Debug)]
pub struct RetryFailure {
    /// Attempts made, including the first.
    pub attempts: u32,
    pub error: DownloadError,
}

/// Execute an async operation with retry-and-backoff.
///
/// The `operation` closure receives the current attempt number (0-indexed). A cancelled
/// token stops the loop before the next attempt and interrupts a pending backoff sleep.
pub async fn retry_with_backoff<F, Fut, T>(
    policy: &RetryPolicy,
    token: &CancellationToken,
    operation: F,
) -> Result<T, RetryFailure>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let mut attempt = 0;
    loop {
        if token.is_cancelled() {
            return Err(RetryFailure {
                attempts: attempt,
                error: DownloadError::Cancelled,
            });
        }

        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(error) => {
                return Err(RetryFailure {
                    attempts: attempt + 1,
                    error,
                });
            }
            RetryAction::Retry(error) => {
                if attempt >= policy.max_retries {
                    return Err(RetryFailure {
                        attempts: attempt + 1,
                        error,
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after transient error"
                );
                tokio::select! {
                    _ = token.cancelled() => {
                        return Err(RetryFailure {
                            attempts: attempt + 1,
                            error: DownloadError::Cancelled,
                        });
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn policy(max_retries: u32, base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    fn transient() -> DownloadError {
        DownloadError::http_status(
            reqwest::StatusCode::INTERNAL_SERVER_ERROR,
            "http://h.test/seg.ts",
            "segment",
        )
    }

    #[test]
    fn delay_grows_linearly() {
        let policy = policy(3, 1000);
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(3000));
    }

    #[test]
    fn delay_respects_max_cap() {
        let policy = RetryPolicy {
            max_retries: 100,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
            jitter: false,
        };
        assert_eq!(policy.delay_for_attempt(50), Duration::from_secs(5));
        assert_eq!(policy.delay_for_attempt(u32::MAX), Duration::from_secs(5));
    }

    #[test]
    fn delay_with_jitter_stays_in_range() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            jitter: true,
        };
        for _ in 0..32 {
            let delay = policy.delay_for_attempt(0);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay < Duration::from_millis(150));
        }
    }

    #[tokio::test]
    async fn succeeds_on_first_attempt() {
        let token = CancellationToken::new();
        let result =
            retry_with_backoff(&policy(3, 1), &token, |_| async { RetryAction::Success(42u32) })
                .await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn fails_immediately_on_non_retryable() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy(3, 1), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async {
                RetryAction::Fail(DownloadError::http_status(
                    reqwest::StatusCode::NOT_FOUND,
                    "http://h.test/seg.ts",
                    "segment",
                ))
            }
        })
        .await;
        let failure = result.unwrap_err();
        assert_eq!(failure.attempts, 1);
        assert_eq!(attempts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn exhausts_budget_then_fails() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result: Result<u32, _> = retry_with_backoff(&policy(2, 1), &token, |_| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async { RetryAction::Retry(transient()) }
        })
        .await;
        let failure = result.unwrap_err();
        // Initial attempt + 2 retries = 3 total
        assert_eq!(failure.attempts, 3);
        assert_eq!(attempts.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn succeeds_on_second_attempt() {
        let token = CancellationToken::new();
        let attempts = AtomicU32::new(0);
        let result = retry_with_backoff(&policy(3, 1), &token, |attempt| {
            attempts.fetch_add(1, Ordering::Relaxed);
            async move {
                if attempt == 0 {
                    RetryAction::Retry(transient())
                } else {
                    RetryAction::Success(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 1);
        assert_eq!(attempts.load(Ordering::Relaxed), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_backoff() {
        let token = CancellationToken::new();
        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cancel.cancel();
        });

        let result: Result<u32, _> = retry_with_backoff(&policy(5, 60_000), &token, |_| async {
            RetryAction::Retry(transient())
        })
        .await;
        assert!(result.unwrap_err().error.is_cancelled());
    }
}
