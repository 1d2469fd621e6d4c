//! Per-request progress reporting.
//!
//! The dispatcher reports every request outcome to a [`ProgressSink`] after it
//! has been recorded. A sink that returns an error or panics is logged and
//! otherwise ignored: callbacks never abort a batch.

use crate::Result;
use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::warn;

/// One request's observable outcome.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub request_id: String,
    pub content: String,
    pub error: Option<String>,
    /// Completed count of the batch after this outcome was recorded.
    pub completed: usize,
    pub total: usize,
}

impl ProgressEvent {
    pub fn new(
        request_id: impl Into<String>,
        content: impl Into<String>,
        error: Option<String>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            content: content.into(),
            error,
            completed: 0,
            total: 0,
        }
    }

    pub fn with_counts(mut self, completed: usize, total: usize) -> Self {
        self.completed = completed;
        self.total = total;
        self
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[async_trait]
pub trait ProgressSink: Send + Sync {
    async fn report(&self, event: ProgressEvent) -> Result<()>;
}

/// No-op sink.
pub struct NoopProgressSink;

#[async_trait]
impl ProgressSink for NoopProgressSink {
    async fn report(&self, _: ProgressEvent) -> Result<()> {
        Ok(())
    }
}

/// Returns a no-op progress sink.
pub fn noop_sink() -> Arc<dyn ProgressSink> {
    Arc::new(NoopProgressSink)
}

/// Adapts a plain `(id, content, error)` callback.
pub struct FnProgressSink<F> {
    callback: F,
}

impl<F> FnProgressSink<F>
where
    F: Fn(&str, &str, Option<&str>) + Send + Sync,
{
    pub fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F> ProgressSink for FnProgressSink<F>
where
    F: Fn(&str, &str, Option<&str>) + Send + Sync,
{
    async fn report(&self, event: ProgressEvent) -> Result<()> {
        (self.callback)(&event.request_id, &event.content, event.error.as_deref());
        Ok(())
    }
}

/// Bounded in-memory sink, oldest events evicted first.
pub struct InMemoryProgressSink {
    events: Mutex<VecDeque<ProgressEvent>>,
    max_events: usize,
}

impl InMemoryProgressSink {
    pub fn new(max: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::new()),
            max_events: max.max(1),
        }
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.lock().iter().cloned().collect()
    }

    pub fn events_for(&self, request_id: &str) -> Vec<ProgressEvent> {
        self.lock()
            .iter()
            .filter(|e| e.request_id == request_id)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, VecDeque<ProgressEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for InMemoryProgressSink {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl ProgressSink for InMemoryProgressSink {
    async fn report(&self, event: ProgressEvent) -> Result<()> {
        let mut events = self.lock();
        events.push_back(event);
        while events.len() > self.max_events {
            events.pop_front();
        }
        Ok(())
    }
}

/// Deliver `event`, swallowing sink errors and panics.
///
/// Returns `false` when the sink failed.
pub(crate) async fn report_isolated(sink: &dyn ProgressSink, event: ProgressEvent) -> bool {
    let request_id = event.request_id.clone();
    match AssertUnwindSafe(sink.report(event)).catch_unwind().await {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            warn!(request_id = request_id.as_str(), error = %e, "progress sink returned an error");
            false
        }
        Err(_) => {
            warn!(request_id = request_id.as_str(), "progress sink panicked");
            false
        }
    }
}
