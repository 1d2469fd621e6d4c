//! Per-request-id admission shared by every batch of one dispatcher.
//!
//! A provider call detached from a cancelled batch keeps running until the
//! provider returns. A later batch that re-runs the same id waits here until
//! that call ends, so attempts for one id never overlap.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slot = Arc<AsyncMutex<()>>;

#[derive(Default)]
pub(crate) struct RequestTurns {
    slots: Mutex<HashMap<String, Slot>>,
}

impl RequestTurns {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Wait until no other unit of work holds `id`, then hold it.
    pub(crate) async fn acquire(self: &Arc<Self>, id: &str) -> RequestTurn {
        let slot = Arc::clone(self.lock_slots().entry(id.to_string()).or_default());
        let guard = Arc::clone(&slot).lock_owned().await;
        RequestTurn {
            turns: Arc::clone(self),
            id: id.to_string(),
            slot,
            guard: Some(guard),
        }
    }

    /// Ids currently held or awaited.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lock_slots().len()
    }

    fn lock_slots(&self) -> MutexGuard<'_, HashMap<String, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self, id: &str, slot: &Slot) {
        let mut slots = self.lock_slots();
        // Only the map and the releasing turn still reference an unwaited slot.
        let idle = slots
            .get(id)
            .is_some_and(|s| Arc::ptr_eq(s, slot) && Arc::strong_count(s) == 2);
        if idle {
            slots.remove(id);
        }
    }
}

/// Exclusive hold on one request id, released on drop.
pub(crate) struct RequestTurn {
    turns: Arc<RequestTurns>,
    id: String,
    slot: Slot,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for RequestTurn {
    fn drop(&mut self) {
        self.guard.take();
        self.turns.release(&self.id, &self.slot);
    }
}
