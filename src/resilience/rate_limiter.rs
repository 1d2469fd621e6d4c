use crate::cancel::{sleep_cancellable, CancellationController};
use crate::Result;
use std::collections::VecDeque;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

#[derive(Debug, Clone)]
pub struct RateLimiterSnapshot {
    pub max_per_window: u32,
    pub window_ms: u64,
    /// Dispatch starts currently inside the window.
    pub in_window: usize,
    /// Estimated wait until a slot frees up (ms), if currently full.
    pub estimated_wait_ms: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Dispatch starts admitted per window. Zero never admits.
    pub max_per_window: u32,
    pub window: Duration,
    /// Upper bound of each sleep between cancellation checks.
    pub poll_interval: Duration,
}

impl RateLimiterConfig {
    pub fn per_minute(max: u32) -> Self {
        Self {
            max_per_window: max,
            window: Duration::from_secs(60),
            poll_interval: Duration::from_millis(100),
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_poll_interval(mut self, poll: Duration) -> Self {
        self.poll_interval = poll;
        self
    }
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self::per_minute(60)
    }
}

/// Sliding-window limiter on dispatch starts.
///
/// - Window mutation (prune + append) happens under one lock
/// - The lock is never held across a sleep; waiters sleep in short increments
///   and observe cancellation between them
pub struct RateLimiter {
    cfg: RateLimiterConfig,
    window: Mutex<VecDeque<Instant>>,
}

enum Admission {
    Admitted,
    Wait(Duration),
}

impl RateLimiter {
    pub fn new(cfg: RateLimiterConfig) -> Self {
        Self {
            cfg,
            window: Mutex::new(VecDeque::new()),
        }
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.cfg
    }

    fn prune_locked(window: &mut VecDeque<Instant>, span: Duration, now: Instant) {
        while let Some(front) = window.front() {
            if now.duration_since(*front) >= span {
                window.pop_front();
            } else {
                break;
            }
        }
    }

    fn try_admit(&self, now: Instant) -> Admission {
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_locked(&mut window, self.cfg.window, now);

        let max = self.cfg.max_per_window as usize;
        if max > 0 && window.len() < max {
            window.push_back(now);
            return Admission::Admitted;
        }

        let wait = match window.front() {
            Some(oldest) if max > 0 => self
                .cfg
                .window
                .saturating_sub(now.duration_since(*oldest)),
            _ => self.cfg.window,
        };
        Admission::Wait(wait)
    }

    /// Wait until one dispatch start is allowed, then record it.
    ///
    /// Returns [`crate::Error::Cancelled`] without recording a timestamp if the
    /// controller is cancelled before admission.
    pub async fn acquire_slot(&self, cancel: &CancellationController) -> Result<()> {
        loop {
            cancel.checkpoint()?;
            match self.try_admit(Instant::now()) {
                Admission::Admitted => return Ok(()),
                Admission::Wait(wait) => {
                    trace!(wait_ms = wait.as_millis() as u64, "rate window full");
                    sleep_cancellable(wait, cancel, self.cfg.poll_interval).await?;
                }
            }
        }
    }

    /// Try to record a dispatch start without waiting.
    pub fn try_acquire(&self) -> bool {
        matches!(self.try_admit(Instant::now()), Admission::Admitted)
    }

    pub fn snapshot(&self) -> RateLimiterSnapshot {
        let now = Instant::now();
        let mut window = self.window.lock().unwrap_or_else(PoisonError::into_inner);
        Self::prune_locked(&mut window, self.cfg.window, now);

        let max = self.cfg.max_per_window as usize;
        let estimated_wait_ms = if max == 0 {
            Some(self.cfg.window.as_millis() as u64)
        } else if window.len() >= max {
            window.front().map(|oldest| {
                self.cfg
                    .window
                    .saturating_sub(now.duration_since(*oldest))
                    .as_millis() as u64
            })
        } else {
            None
        };

        RateLimiterSnapshot {
            max_per_window: self.cfg.max_per_window,
            window_ms: self.cfg.window.as_millis() as u64,
            in_window: window.len(),
            estimated_wait_ms,
        }
    }
}
