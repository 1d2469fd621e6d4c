//! Dispatch configuration.
//!
//! One explicit value passed into the dispatcher's constructor. It can be
//! built in code, loaded from YAML/JSON, and adjusted from the environment.

use crate::resilience::retry::RetryPolicy;
use crate::{Error, ErrorContext, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::time::Duration;

/// Upper bound for any cancellation-aware wait increment.
pub const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Hard ceiling on concurrently executing provider calls.
    pub max_concurrent_requests: usize,
    /// Dispatch starts allowed per rolling window. Zero never admits.
    pub requests_per_minute: u32,
    /// Total attempts per request, including the first one.
    pub max_retries: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_factor: f64,
    /// Upper bound of the positive jitter added to each backoff, as a fraction.
    pub jitter_ratio: f64,
    /// Hard deadline for one request, covering all of its attempts.
    pub per_request_timeout_ms: u64,
    /// Deadline for a whole batch; expiry cancels it.
    pub batch_timeout_ms: u64,
    /// Cap on the number of requests a template expansion may produce.
    pub max_combinations: usize,
    /// Length of the rolling window `requests_per_minute` applies to.
    pub rate_window_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 5,
            requests_per_minute: 60,
            max_retries: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_factor: 2.0,
            jitter_ratio: 0.2,
            per_request_timeout_ms: 300_000,
            batch_timeout_ms: 3_600_000,
            max_combinations: 1_000,
            rate_window_ms: 60_000,
            poll_interval_ms: 100,
        }
    }
}

impl DispatchConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_concurrent_requests(mut self, n: usize) -> Self {
        self.max_concurrent_requests = n;
        self
    }

    pub fn with_requests_per_minute(mut self, rpm: u32) -> Self {
        self.requests_per_minute = rpm;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_initial_delay(mut self, d: Duration) -> Self {
        self.initial_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn with_max_delay(mut self, d: Duration) -> Self {
        self.max_delay_ms = d.as_millis() as u64;
        self
    }

    pub fn with_backoff_factor(mut self, f: f64) -> Self {
        self.backoff_factor = f;
        self
    }

    pub fn with_jitter_ratio(mut self, r: f64) -> Self {
        self.jitter_ratio = r;
        self
    }

    pub fn with_per_request_timeout(mut self, d: Duration) -> Self {
        self.per_request_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn with_batch_timeout(mut self, d: Duration) -> Self {
        self.batch_timeout_ms = d.as_millis() as u64;
        self
    }

    pub fn with_max_combinations(mut self, n: usize) -> Self {
        self.max_combinations = n;
        self
    }

    pub fn with_rate_window(mut self, d: Duration) -> Self {
        self.rate_window_ms = d.as_millis() as u64;
        self
    }

    pub fn with_poll_interval(mut self, d: Duration) -> Self {
        self.poll_interval_ms = d.as_millis() as u64;
        self
    }

    pub fn per_request_timeout(&self) -> Duration {
        Duration::from_millis(self.per_request_timeout_ms)
    }

    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn rate_window(&self) -> Duration {
        Duration::from_millis(self.rate_window_ms)
    }

    /// Wait increment between cancellation checks, never above 100ms.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1)).min(MAX_POLL_INTERVAL)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            backoff_factor: self.backoff_factor,
            jitter_ratio: self.jitter_ratio,
        }
    }

    pub fn from_yaml_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_yaml::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_json_str(s: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load from a `.json`, `.yaml` or `.yml` file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::from_json_str(&raw),
            Some("yaml") | Some("yml") => Self::from_yaml_str(&raw),
            other => Err(Error::configuration_with_context(
                "unsupported config file extension",
                ErrorContext::new()
                    .with_field_path(path.display().to_string())
                    .with_details(format!("got {:?}, expected json/yaml/yml", other))
                    .with_source("config_loader"),
            )),
        }
    }

    /// Apply `AI_BATCH_*` environment overrides. Unparseable values are ignored.
    pub fn apply_env_overrides(mut self) -> Self {
        fn parsed<T: std::str::FromStr>(key: &str) -> Option<T> {
            env::var(key).ok().and_then(|s| s.trim().parse::<T>().ok())
        }

        if let Some(v) = parsed("AI_BATCH_MAX_CONCURRENCY") {
            self.max_concurrent_requests = v;
        }
        if let Some(v) = parsed("AI_BATCH_RPM") {
            self.requests_per_minute = v;
        }
        if let Some(v) = parsed("AI_BATCH_MAX_RETRIES") {
            self.max_retries = v;
        }
        if let Some(secs) = parsed::<u64>("AI_BATCH_REQUEST_TIMEOUT_SECS") {
            self.per_request_timeout_ms = secs.saturating_mul(1_000);
        }
        if let Some(secs) = parsed::<u64>("AI_BATCH_TIMEOUT_SECS") {
            self.batch_timeout_ms = secs.saturating_mul(1_000);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        let invalid = |field: &str, details: String| {
            Err(Error::configuration_with_context(
                "invalid dispatch configuration",
                ErrorContext::new()
                    .with_field_path(field)
                    .with_details(details)
                    .with_source("config_validator"),
            ))
        };

        if self.max_concurrent_requests == 0 {
            return invalid("max_concurrent_requests", "must be at least 1".into());
        }
        if !self.backoff_factor.is_finite() || self.backoff_factor < 1.0 {
            return invalid(
                "backoff_factor",
                format!("must be >= 1.0, got {}", self.backoff_factor),
            );
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return invalid(
                "jitter_ratio",
                format!("must be within [0, 1], got {}", self.jitter_ratio),
            );
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return invalid(
                "initial_delay_ms",
                format!(
                    "{} exceeds max_delay_ms {}",
                    self.initial_delay_ms, self.max_delay_ms
                ),
            );
        }
        if self.per_request_timeout_ms == 0 {
            return invalid("per_request_timeout_ms", "must be positive".into());
        }
        if self.batch_timeout_ms == 0 {
            return invalid("batch_timeout_ms", "must be positive".into());
        }
        if self.rate_window_ms == 0 {
            return invalid("rate_window_ms", "must be positive".into());
        }
        Ok(())
    }
}
