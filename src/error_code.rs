//! Failure classification for recorded responses.
//!
//! Providers are not assumed to share an error hierarchy; the only contract is
//! a human-readable message. This module derives two things from it:
//!
//! | Function | Used by |
//! |----------|---------|
//! | [`is_retryable_message`] | the retry executor, to decide whether to try again |
//! | [`FailureKind::classify`] | the dispatcher, to label `Response::error` |
//!
//! ## Example
//!
//! ```rust
//! use ai_batch_dispatch::error_code::{is_retryable_message, FailureKind};
//!
//! assert!(is_retryable_message("HTTP 429 Too Many Requests"));
//! assert_eq!(FailureKind::classify("Invalid API key"), FailureKind::Authorization);
//! assert_eq!(FailureKind::Authorization.label(), "AUTHORIZATION");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

const RETRYABLE_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "capacity",
    "overloaded",
    "throttl",
    "timeout",
    "timed out",
    "connection reset",
    "connection closed",
    "unavailable",
    "try again",
];

const TIMEOUT_MARKERS: &[&str] = &["timeout", "timed out", "deadline"];

const RATE_LIMIT_MARKERS: &[&str] = &[
    "429",
    "rate limit",
    "rate_limit",
    "too many requests",
    "quota",
    "capacity",
    "overloaded",
    "throttl",
];

const AUTHORIZATION_MARKERS: &[&str] = &[
    "401",
    "403",
    "unauthorized",
    "forbidden",
    "invalid api key",
    "api key",
    "authentication",
    "permission",
];

const CONNECTION_MARKERS: &[&str] = &[
    "connection",
    "network",
    "dns",
    "unavailable",
    "refused",
    "502",
    "503",
];

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|n| haystack.contains(n))
}

/// Returns true when a failure message describes a transient provider condition.
///
/// Matching is case-insensitive and substring based.
pub fn is_retryable_message(message: &str) -> bool {
    contains_any(&message.to_lowercase(), RETRYABLE_MARKERS)
}

/// Category of a terminal request failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Per-request deadline exceeded or the provider reported a timeout.
    Timeout,
    /// Provider rejected the request for rate, quota or capacity reasons.
    RateLimit,
    /// Credentials missing, invalid or lacking permission.
    Authorization,
    /// Network-level failure reaching the provider.
    Connection,
    /// Anything else.
    Unknown,
}

impl FailureKind {
    /// Classify a failure message; the first matching category wins.
    pub fn classify(message: &str) -> Self {
        let m = message.to_lowercase();
        if contains_any(&m, TIMEOUT_MARKERS) {
            Self::Timeout
        } else if contains_any(&m, RATE_LIMIT_MARKERS) {
            Self::RateLimit
        } else if contains_any(&m, AUTHORIZATION_MARKERS) {
            Self::Authorization
        } else if contains_any(&m, CONNECTION_MARKERS) {
            Self::Connection
        } else {
            Self::Unknown
        }
    }

    /// Upper-case tag used as the prefix of `Response::error`.
    #[inline]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::RateLimit => "RATE_LIMIT",
            Self::Authorization => "AUTHORIZATION",
            Self::Connection => "CONNECTION",
            Self::Unknown => "UNKNOWN",
        }
    }

    /// Recover the kind from a recorded `Response::error` string.
    pub fn from_recorded(error: &str) -> Option<Self> {
        let tag = error.split(':').next()?.trim();
        match tag {
            "TIMEOUT" => Some(Self::Timeout),
            "RATE_LIMIT" => Some(Self::RateLimit),
            "AUTHORIZATION" => Some(Self::Authorization),
            "CONNECTION" => Some(Self::Connection),
            "UNKNOWN" => Some(Self::Unknown),
            _ => None,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_markers() {
        for msg in [
            "HTTP 429",
            "Rate limit reached for requests",
            "rate_limit_exceeded",
            "Too Many Requests",
            "model at capacity",
            "Overloaded",
            "request throttled",
            "read timeout",
            "operation timed out",
            "connection reset by peer",
            "Connection closed before message completed",
            "503 Service Unavailable",
            "please try again later",
        ] {
            assert!(is_retryable_message(msg), "{msg} should be retryable");
        }
    }

    #[test]
    fn test_non_retryable_messages() {
        for msg in ["invalid api key", "400 Bad Request", "model not found", ""] {
            assert!(!is_retryable_message(msg), "{msg} should not be retryable");
        }
    }

    #[test]
    fn test_classify_order() {
        assert_eq!(FailureKind::classify("gateway timeout"), FailureKind::Timeout);
        assert_eq!(
            FailureKind::classify("429 too many requests"),
            FailureKind::RateLimit
        );
        assert_eq!(
            FailureKind::classify("HTTP 401 Unauthorized: invalid api key"),
            FailureKind::Authorization
        );
        assert_eq!(
            FailureKind::classify("error trying to connect: connection refused"),
            FailureKind::Connection
        );
        assert_eq!(FailureKind::classify("something odd"), FailureKind::Unknown);
    }

    #[test]
    fn test_from_recorded() {
        assert_eq!(
            FailureKind::from_recorded("RATE_LIMIT: 429 (gave up after 3 attempts)"),
            Some(FailureKind::RateLimit)
        );
        assert_eq!(FailureKind::from_recorded("CANCELLED: batch cancelled"), None);
    }
}
