//! Response aggregation for one batch.

use crate::types::Response;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct Inner {
    responses: HashMap<String, Response>,
    completed: HashSet<String>,
}

/// Accumulates per-request outcomes under a single lock.
///
/// Recording the same id twice overwrites the stored response but counts the
/// id once, so `completed_count` never exceeds the number of distinct ids.
/// Observers are notified from inside the critical section (see
/// [`ResponseAggregator::record_with`]), which makes the notification order
/// identical to the mutation order.
#[derive(Debug, Default)]
pub struct ResponseAggregator {
    inner: Mutex<Inner>,
}

impl ResponseAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from an earlier batch's responses.
    ///
    /// Every seeded id counts as completed except those in `pending`, which
    /// are about to be re-run and only count once recorded again.
    pub fn seeded<'a, I>(previous: &HashMap<String, Response>, pending: I) -> Self
    where
        I: IntoIterator<Item = &'a str>,
    {
        let pending: HashSet<&str> = pending.into_iter().collect();
        let completed = previous
            .keys()
            .filter(|id| !pending.contains(id.as_str()))
            .cloned()
            .collect();
        Self {
            inner: Mutex::new(Inner {
                responses: previous.clone(),
                completed,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn record(&self, response: Response) -> usize {
        self.record_with(response, |_, completed| completed)
    }

    /// Store `response`, then call `publish` with the updated map and
    /// completed count while the lock is still held.
    pub fn record_with<R>(
        &self,
        response: Response,
        publish: impl FnOnce(&HashMap<String, Response>, usize) -> R,
    ) -> R {
        let mut inner = self.lock();
        inner.completed.insert(response.id.clone());
        inner.responses.insert(response.id.clone(), response);
        let completed = inner.completed.len();
        publish(&inner.responses, completed)
    }

    /// Run `f` against the current map and count under the lock.
    pub fn with_snapshot<R>(&self, f: impl FnOnce(&HashMap<String, Response>, usize) -> R) -> R {
        let inner = self.lock();
        f(&inner.responses, inner.completed.len())
    }

    /// Immutable copy of the current map.
    pub fn snapshot(&self) -> HashMap<String, Response> {
        self.lock().responses.clone()
    }

    pub fn completed_count(&self) -> usize {
        self.lock().completed.len()
    }

    pub fn len(&self) -> usize {
        self.lock().responses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.responses.clear();
        inner.completed.clear();
    }
}
