//! Token-bucket rate limiting for requests to one external source.
//!
//! # Overview
//!
//! A [`RateLimiter`] holds `rate_per_minute` tokens and starts full. One token
//! comes back every `60s / rate_per_minute`, refilled lazily on the next
//! [`acquire`](RateLimiter::acquire). When the bucket is empty the caller
//! sleeps until the next token is due.
//!
//! Refill, the wait and the decrement all happen under one async mutex, so
//! concurrent callers sharing an `Arc<RateLimiter>` never take the same token.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//! use harvester_core::fetch::RateLimiter;
//!
//! # async fn example() {
//! let limiter = Arc::new(RateLimiter::new(60));
//!
//! let shared = Arc::clone(&limiter);
//! tokio::spawn(async move {
//!     shared.acquire().await;
//!     // ... upload
//! });
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Warning threshold for cumulative wait across all callers (5 minutes).
const CUMULATIVE_WAIT_WARNING_THRESHOLD: Duration = Duration::from_secs(300);

/// Token bucket shared by every caller of one external source.
#[derive(Debug)]
pub struct RateLimiter {
    capacity: u32,
    refill_interval: Duration,
    disabled: bool,
    bucket: Mutex<Bucket>,
    cumulative_wait_ms: AtomicU64,
}

#[derive(Debug)]
struct Bucket {
    tokens: u32,
    last_refill: Instant,
}

impl Bucket {
    /// Adds `floor(elapsed / interval)` tokens, capped at `capacity`.
    fn refill(&mut self, now: Instant, capacity: u32, interval: Duration) {
        let elapsed = now.saturating_duration_since(self.last_refill);
        let earned = elapsed.as_nanos() / interval.as_nanos().max(1);
        if earned == 0 {
            return;
        }
        let earned = u32::try_from(earned).unwrap_or(u32::MAX);
        self.tokens = self.tokens.saturating_add(earned).min(capacity);
        if self.tokens == capacity {
            self.last_refill = now;
        } else {
            // Keep the partial interval so the next token is not delayed.
            self.last_refill += interval.saturating_mul(earned);
        }
    }

    fn time_until_next_token(&self, now: Instant, interval: Duration) -> Duration {
        (self.last_refill + interval).saturating_duration_since(now)
    }
}

impl RateLimiter {
    /// Creates a limiter allowing `rate_per_minute` requests per minute.
    ///
    /// A rate of 0 is treated as 1.
    #[must_use]
    #[instrument]
    pub fn new(rate_per_minute: u32) -> Self {
        let capacity = rate_per_minute.max(1);
        let refill_interval = Duration::from_secs(60) / capacity;
        debug!(
            capacity,
            refill_ms = refill_interval.as_millis(),
            "creating rate limiter"
        );
        Self {
            capacity,
            refill_interval,
            disabled: false,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            cumulative_wait_ms: AtomicU64::new(0),
        }
    }

    /// Creates a limiter that never waits.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            disabled: true,
            ..Self::new(1)
        }
    }

    /// Returns whether rate limiting is disabled.
    #[must_use]
    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    /// Bucket capacity, equal to the configured requests per minute.
    #[must_use]
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Time between two refilled tokens.
    #[must_use]
    pub fn refill_interval(&self) -> Duration {
        self.refill_interval
    }

    /// Waits until a token is available and consumes it.
    ///
    /// The wait is never longer than one refill interval per queued caller.
    #[instrument(skip(self), fields(capacity = self.capacity))]
    pub async fn acquire(&self) {
        if self.disabled {
            return;
        }

        // Held across the sleep so refill and decrement stay one step.
        let mut bucket = self.bucket.lock().await;
        bucket.refill(Instant::now(), self.capacity, self.refill_interval);

        if bucket.tokens == 0 {
            let wait = bucket.time_until_next_token(Instant::now(), self.refill_interval);
            let cumulative = self.add_cumulative_wait(wait);
            debug!(
                wait_ms = wait.as_millis(),
                cumulative_ms = cumulative.as_millis(),
                "bucket empty, waiting for next token"
            );
            if cumulative >= CUMULATIVE_WAIT_WARNING_THRESHOLD {
                warn!(
                    cumulative_wait_secs = cumulative.as_secs(),
                    "excessive rate limiting - consider raising rate_per_minute"
                );
            }
            tokio::time::sleep(wait).await;
            bucket.refill(Instant::now(), self.capacity, self.refill_interval);
        }

        bucket.tokens = bucket.tokens.saturating_sub(1);
    }

    fn add_cumulative_wait(&self, wait: Duration) -> Duration {
        let wait_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX);
        let total = self
            .cumulative_wait_ms
            .fetch_add(wait_ms, Ordering::SeqCst)
            .saturating_add(wait_ms);
        Duration::from_millis(total)
    }
}
