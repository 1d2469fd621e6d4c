//! Cooperative cancellation for one batch.
//!
//! A [`CancellationController`] is a shared flag plus a registry of
//! [`CancelHandle`]s, one per unit of work currently running. Nothing is
//! preempted: work observes the flag at its checkpoints and in every wait
//! increment (see [`sleep_cancellable`]).

use crate::{Error, Result};
use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancel-capable handle for one registered unit of work.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once this handle (or its controller) is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await
    }
}

#[derive(Debug, Default)]
pub struct CancellationController {
    flag: CancellationToken,
    handles: Mutex<HashMap<String, CancelHandle>>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raise the shared flag without touching registered handles.
    pub fn set(&self) {
        self.flag.cancel();
    }

    pub fn is_set(&self) -> bool {
        self.flag.is_cancelled()
    }

    /// Fail fast with [`Error::Cancelled`] when the flag is raised.
    pub fn checkpoint(&self) -> Result<()> {
        if self.is_set() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Resolves once the flag is raised.
    pub async fn cancelled(&self) {
        self.flag.cancelled().await
    }

    /// Register a unit of work. Registering after cancellation yields an
    /// already-cancelled handle.
    pub fn register(&self, id: &str) -> CancelHandle {
        let handle = CancelHandle {
            token: self.flag.child_token(),
        };
        self.lock_handles().insert(id.to_string(), handle.clone());
        handle
    }

    pub fn unregister(&self, id: &str) {
        self.lock_handles().remove(id);
    }

    /// Number of currently registered units.
    pub fn registered(&self) -> usize {
        self.lock_handles().len()
    }

    /// Raise the flag, cancel every registered handle and clear the registry.
    pub fn cancel_all(&self) {
        self.set();
        let drained: Vec<CancelHandle> = self.lock_handles().drain().map(|(_, h)| h).collect();
        for handle in drained {
            handle.cancel();
        }
    }

    fn lock_handles(&self) -> std::sync::MutexGuard<'_, HashMap<String, CancelHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Sleep for `duration` in increments of at most `poll`, re-checking the
/// controller's flag before every increment.
pub async fn sleep_cancellable(
    duration: Duration,
    controller: &CancellationController,
    poll: Duration,
) -> Result<()> {
    let deadline = Instant::now() + duration;
    loop {
        controller.checkpoint()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        tokio::time::sleep((deadline - now).min(poll)).await;
    }
}
