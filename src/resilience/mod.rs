//! Resilience primitives used by every dispatched request.
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`rate_limiter`] | Sliding-window limiter on dispatch starts |
//! | [`retry`] | Retry executor with exponential backoff and jitter |
//!
//! Both wait in short increments and observe a
//! [`CancellationController`](crate::cancel::CancellationController) between
//! them, so cancellation latency does not depend on how long a wait was.
//!
//! ## Rate Limiter
//!
//! ```rust
//! use ai_batch_dispatch::resilience::rate_limiter::{RateLimiter, RateLimiterConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let limiter = RateLimiter::new(RateLimiterConfig::per_minute(2));
//! assert!(limiter.try_acquire());
//! assert!(limiter.try_acquire());
//! assert!(!limiter.try_acquire());
//! # }
//! ```
//!
//! ## Retry
//!
//! ```rust
//! use ai_batch_dispatch::resilience::retry::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::default();
//! assert_eq!(policy.base_delay(0), Duration::from_secs(1));
//! assert_eq!(policy.base_delay(1), Duration::from_secs(2));
//! ```

pub mod rate_limiter;
pub mod retry;
