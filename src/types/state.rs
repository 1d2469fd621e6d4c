//! Batch-level state published to observers.

use super::request::Response;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Lifecycle of one batch.
///
/// `Preparing -> ProcessingTemplate -> SendingRequests -> [ProcessingResults] -> {Completed | Cancelled | Error}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BatchStatus {
    Preparing,
    ProcessingTemplate,
    SendingRequests,
    ProcessingResults,
    Completed,
    Cancelled,
    Error,
}

impl BatchStatus {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Error)
    }
}

/// Immutable snapshot of a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchState {
    pub id: String,
    pub status: BatchStatus,
    pub responses: HashMap<String, Response>,
    pub completed_count: usize,
    pub total_count: usize,
    pub is_complete: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl BatchState {
    pub fn new(id: impl Into<String>, status: BatchStatus, total_count: usize) -> Self {
        Self {
            id: id.into(),
            status,
            responses: HashMap::new(),
            completed_count: 0,
            total_count,
            is_complete: status.is_terminal(),
            error: None,
        }
    }

    pub(crate) fn with_responses(
        mut self,
        responses: HashMap<String, Response>,
        completed_count: usize,
    ) -> Self {
        self.responses = responses;
        self.completed_count = completed_count;
        self
    }

    pub(crate) fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Fraction of requests that reached a terminal outcome, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        if self.total_count == 0 {
            if self.is_complete {
                1.0
            } else {
                0.0
            }
        } else {
            self.completed_count as f64 / self.total_count as f64
        }
    }

    /// Ids whose recorded response carries an error, sorted for stable output.
    pub fn failed_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .responses
            .values()
            .filter(|r| r.error.is_some())
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn succeeded_count(&self) -> usize {
        self.responses.values().filter(|r| r.is_success()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.responses.len() - self.succeeded_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(BatchStatus::Completed.is_terminal());
        assert!(BatchStatus::Cancelled.is_terminal());
        assert!(BatchStatus::Error.is_terminal());
        assert!(!BatchStatus::SendingRequests.is_terminal());
        assert!(!BatchStatus::ProcessingResults.is_terminal());
    }

    #[test]
    fn test_is_complete_follows_status() {
        assert!(!BatchState::new("b", BatchStatus::Preparing, 3).is_complete);
        assert!(BatchState::new("b", BatchStatus::Cancelled, 3).is_complete);
    }

    #[test]
    fn test_progress_and_failures() {
        let mut responses = HashMap::new();
        responses.insert("a".to_string(), Response::success("a", "ok"));
        responses.insert("b".to_string(), Response::failure("b", "UNKNOWN: x"));
        let state =
            BatchState::new("b1", BatchStatus::SendingRequests, 4).with_responses(responses, 2);
        assert_eq!(state.progress(), 0.5);
        assert_eq!(state.failed_ids(), vec!["b".to_string()]);
        assert_eq!(state.succeeded_count(), 1);
        assert_eq!(state.failed_count(), 1);
    }

    #[test]
    fn test_empty_terminal_progress() {
        let state = BatchState::new("b", BatchStatus::Completed, 0);
        assert_eq!(state.progress(), 1.0);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&BatchStatus::SendingRequests).unwrap();
        assert_eq!(json, "\"SENDING_REQUESTS\"");
    }
}
