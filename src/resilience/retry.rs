//! Retry executor
//!
//! Wraps one request's send operation with bounded attempts, exponential
//! backoff with positive jitter, and message-based retryability. Backoff waits
//! are cancellation-aware.

use crate::cancel::{sleep_cancellable, CancellationController};
use crate::Result;
use rand::Rng;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry logic
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. Zero behaves as one.
    pub max_retries: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_factor: f64,
    /// Upper bound of the positive jitter, as a fraction of the delay.
    pub jitter_ratio: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_millis(30_000),
            backoff_factor: 2.0,
            jitter_ratio: 0.2,
        }
    }
}

impl RetryPolicy {
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.max(1)
    }

    /// Backoff before the retry that follows the 0-based `attempt`, without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let factor = self.backoff_factor.max(1.0).powi(attempt.min(63) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        let cap = self.max_delay.as_millis() as f64;
        Duration::from_millis(millis.min(cap) as u64)
    }

    /// Base delay plus up to `jitter_ratio` extra.
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let ratio = self.jitter_ratio.clamp(0.0, 1.0);
        if ratio == 0.0 || base.is_zero() {
            return base;
        }
        let extra = rand::thread_rng().gen_range(0.0..=ratio);
        base.mul_f64(1.0 + extra)
    }
}

/// Transient per-request retry bookkeeping.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetryState {
    /// Attempts started so far.
    pub attempt: u32,
    /// Backoff chosen before the next attempt.
    pub backoff: Duration,
}

pub struct RetryExecutor {
    policy: RetryPolicy,
    poll_interval: Duration,
    states: Mutex<HashMap<String, RetryState>>,
}

impl RetryExecutor {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            poll_interval: Duration::from_millis(100),
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    fn lock_states(&self) -> std::sync::MutexGuard<'_, HashMap<String, RetryState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current bookkeeping for `id`, if a run was interrupted or is in progress.
    pub fn state(&self, id: &str) -> Option<RetryState> {
        self.lock_states().get(id).cloned()
    }

    /// Number of ids with live bookkeeping.
    pub fn tracked(&self) -> usize {
        self.lock_states().len()
    }

    /// Drop bookkeeping for `id` so its next run starts at attempt 0.
    pub fn reset(&self, id: &str) {
        self.lock_states().remove(id);
    }

    pub fn reset_many<I, S>(&self, ids: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut states = self.lock_states();
        for id in ids {
            states.remove(id.as_ref());
        }
    }

    fn begin_attempt(&self, id: &str) -> u32 {
        let mut states = self.lock_states();
        let st = states.entry(id.to_string()).or_default();
        let attempt = st.attempt;
        st.attempt = st.attempt.saturating_add(1);
        attempt
    }

    fn record_backoff(&self, id: &str, attempt: u32) -> Duration {
        let delay = self.policy.delay_with_jitter(attempt);
        if let Some(st) = self.lock_states().get_mut(id) {
            st.backoff = delay;
        }
        delay
    }

    /// Run `operation` until it succeeds, fails terminally, or attempts run out.
    ///
    /// - Cancellation (from the controller or raised by the operation) propagates
    ///   immediately and keeps the bookkeeping, so an interrupted request resumes
    ///   its attempt count unless [`RetryExecutor::reset`] is called.
    /// - Non-retryable failures are returned on first occurrence.
    /// - When attempts are exhausted the last error is returned.
    pub async fn run<T, F, Fut>(
        &self,
        id: &str,
        cancel: &CancellationController,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.policy.max_attempts();
        loop {
            cancel.checkpoint()?;
            let attempt = self.begin_attempt(id);

            let err = match operation().await {
                Ok(value) => {
                    self.reset(id);
                    return Ok(value);
                }
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => e,
            };

            if !err.is_retryable() {
                debug!(request_id = id, attempt, error = %err, "non-retryable failure");
                self.reset(id);
                return Err(err);
            }

            if attempt + 1 >= max_attempts {
                warn!(
                    request_id = id,
                    attempts = attempt + 1,
                    error = %err,
                    "retries exhausted"
                );
                self.reset(id);
                return Err(err);
            }

            let delay = self.record_backoff(id, attempt);
            debug!(
                request_id = id,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after backoff"
            );
            sleep_cancellable(delay, cancel, self.poll_interval).await?;
        }
    }
}
