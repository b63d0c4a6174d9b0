//! Bounded exponential-backoff retry for idempotent fetches.
//!
//! [`RetryPolicy::run`] invokes an operation, and on failure waits
//! `initial_delay`, then `2 * initial_delay`, `4 * initial_delay`, ... before
//! invoking it again. There is no delay ceiling and no jitter. After
//! `max_retries` failed retries the last error is returned wrapped in
//! [`FetchError::RetryExhausted`].
//!
//! Operations must be safe to re-invoke. Wrapping a whole pagination loop
//! means a failure on page N restarts from the first page.
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::fetch::{ApiClient, RetryPolicy};
//!
//! # async fn example(client: ApiClient) -> Result<(), harvester_core::fetch::FetchError> {
//! let policy = RetryPolicy::default();
//! let body = policy
//!     .run("spaces", || client.get_text("/wiki/api/v2/spaces"))
//!     .await?;
//! println!("{body}");
//! # Ok(())
//! # }
//! ```

use std::future::Future;
use std::time::Duration;

use tracing::{debug, error, warn};

use super::FetchError;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 5;

/// Default wait before the first retry (500ms).
pub const DEFAULT_INITIAL_DELAY: Duration = Duration::from_millis(500);

/// Retry configuration for one call site.
///
/// # Default Values
///
/// - `max_retries`: 5 (so at most 6 attempts)
/// - `initial_delay`: 500ms
///
/// # Delay Calculation
///
/// ```text
/// delay(retry) = initial_delay * 2^retry     (retry = 0, 1, 2, ...)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_DELAY,
        }
    }
}

impl RetryPolicy {
    /// Creates a retry policy with custom settings.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
        }
    }

    /// Creates a policy with a custom retry count and the default initial delay.
    #[must_use]
    pub fn with_max_retries(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Returns the configured retry count.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the wait before the first retry.
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// Delay before retry number `retry` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.initial_delay
            .saturating_mul(2u32.saturating_pow(retry))
    }

    /// Runs `operation`, retrying every failure until the retry budget is spent.
    ///
    /// `label` is only used for logging.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError::RetryExhausted`] wrapping the final error once
    /// `max_retries + 1` attempts have failed.
    pub async fn run<T, F, Fut>(&self, label: &str, mut operation: F) -> Result<T, FetchError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FetchError>>,
    {
        let mut retry = 0;
        loop {
            match operation().await {
                Ok(value) => {
                    if retry > 0 {
                        debug!(label, attempts = retry + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let remaining = self.max_retries - retry;
                    if remaining == 0 {
                        error!(label, attempts = retry + 1, error = %err, "retries exhausted");
                        return Err(FetchError::RetryExhausted {
                            attempts: retry + 1,
                            last: Box::new(err),
                        });
                    }
                    let delay = self.delay_for(retry);
                    warn!(
                        label,
                        error = %err,
                        remaining,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        "attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    retry += 1;
                }
            }
        }
    }
}

/// Runs `operation` under the default policy (5 retries, 500ms initial delay).
///
/// # Errors
///
/// See [`RetryPolicy::run`].
pub async fn with_retry<T, F, Fut>(label: &str, operation: F) -> Result<T, FetchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchError>>,
{
    RetryPolicy::default().run(label, operation).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    use tokio::time::Instant;

    use super::*;

    fn failing(url: &str) -> FetchError {
        FetchError::http_status(url, 503)
    }

    // ==================== RetryPolicy Tests ====================

    #[test]
    fn test_retry_policy_default_values() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_retries(), 5);
        assert_eq!(policy.initial_delay(), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_with_max_retries_keeps_default_delay() {
        let policy = RetryPolicy::with_max_retries(2);
        assert_eq!(policy.max_retries(), 2);
        assert_eq!(policy.initial_delay(), DEFAULT_INITIAL_DELAY);
    }

    // ==================== Delay Calculation Tests ====================

    #[test]
    fn test_delay_doubles_without_ceiling() {
        let policy = RetryPolicy::new(10, Duration::from_millis(500));
        assert_eq!(policy.delay_for(0), Duration::from_millis(500));
        assert_eq!(policy.delay_for(1), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(2), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(9), Duration::from_millis(500 * 512));
    }

    #[test]
    fn test_delay_saturates_instead_of_overflowing() {
        let policy = RetryPolicy::new(100, Duration::from_secs(1));
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }

    // ==================== Execution Tests ====================

    #[tokio::test(start_paused = true)]
    async fn test_run_succeeds_after_k_failures_with_k_plus_one_calls() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(500));

        let counter = Arc::clone(&calls);
        let result = policy
            .run("flaky", || {
                let counter = Arc::clone(&counter);
                async move {
                    let n = counter.fetch_add(1, Ordering::SeqCst);
                    if n < 3 { Err(failing("u")) } else { Ok(n) }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_always_failing_makes_max_plus_one_attempts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::new(5, Duration::from_millis(500));
        let start = Instant::now();

        let counter = Arc::clone(&calls);
        let result: Result<(), _> = policy
            .run("dead", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(failing("u"))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 6);
        match result {
            Err(FetchError::RetryExhausted { attempts, last }) => {
                assert_eq!(attempts, 6);
                assert_eq!(last.status(), Some(503));
            }
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
        // 500 * (2^5 - 1) = 15500ms
        assert!(start.elapsed() >= Duration::from_millis(15_500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_zero_retries_fails_after_single_attempt() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let result: Result<(), _> = RetryPolicy::new(0, Duration::from_millis(500))
            .run("once", || {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err(failing("u"))
                }
            })
            .await;

        assert!(matches!(
            result,
            Err(FetchError::RetryExhausted { attempts: 1, .. })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_retry_uses_default_policy() {
        let result = with_retry("ok", || async { Ok::<_, FetchError>(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
