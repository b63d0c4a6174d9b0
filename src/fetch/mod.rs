//! Outbound HTTP plumbing shared by every connector.
//!
//! # Features
//!
//! - [`ApiClient`]: per-source client with base URL and credentials
//! - [`RetryPolicy`]: bounded exponential backoff, no jitter
//! - [`RateLimiter`]: token bucket shared by all callers of one source
//! - Pagination helpers for offset, next-link and page-number endpoints
//!
//! # Example
//!
//! ```no_run
//! use harvester_core::fetch::{ApiClient, Auth, RetryPolicy};
//!
//! # async fn example() -> Result<(), harvester_core::fetch::FetchError> {
//! let client = ApiClient::new("https://wiki.example.com", Auth::None)?;
//! let policy = RetryPolicy::default();
//! let page: serde_json::Value = policy
//!     .run("page", || client.get_json("/wiki/api/v2/pages/42"))
//!     .await?;
//! println!("{page}");
//! # Ok(())
//! # }
//! ```

mod client;
mod error;
pub mod paginate;
pub mod rate_limiter;
mod retry;

pub use client::{ApiClient, Auth, CONNECT_TIMEOUT_SECS, READ_TIMEOUT_SECS};
pub use error::FetchError;
pub use paginate::{
    LinkPage, NumberedPage, OffsetCursor, OffsetPage, fetch_link_pages, fetch_numbered_pages,
    fetch_offset_pages,
};
pub use rate_limiter::RateLimiter;
pub use retry::{DEFAULT_INITIAL_DELAY, DEFAULT_MAX_RETRIES, RetryPolicy, with_retry};
