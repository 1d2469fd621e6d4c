//! Caller-side view of a running batch.

use crate::cancel::CancellationController;
use crate::types::BatchState;
use crate::StateStream;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::UnboundedReceiverStream;

/// Snapshot channel of one batch.
///
/// Every published state goes to both the ordered event stream and the
/// "latest" slot. Publishing a terminal state seals the publisher: the event
/// stream ends and later publishes are dropped.
pub(crate) struct StatePublisher {
    inner: Mutex<PublisherInner>,
}

struct PublisherInner {
    latest: watch::Sender<BatchState>,
    events: Option<mpsc::UnboundedSender<BatchState>>,
}

impl StatePublisher {
    pub(crate) fn channel(
        initial: BatchState,
    ) -> (
        Self,
        watch::Receiver<BatchState>,
        mpsc::UnboundedReceiver<BatchState>,
    ) {
        let (latest, latest_rx) = watch::channel(initial.clone());
        let (events, events_rx) = mpsc::unbounded_channel();
        let publisher = Self {
            inner: Mutex::new(PublisherInner {
                latest,
                events: None,
            }),
        };
        publisher.install(events, initial);
        (publisher, latest_rx, events_rx)
    }

    fn install(&self, events: mpsc::UnboundedSender<BatchState>, initial: BatchState) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let sealed = initial.is_complete;
        let _ = events.send(initial);
        if !sealed {
            inner.events = Some(events);
        }
    }

    /// Publish `state`. Returns `false` once the publisher is sealed.
    pub(crate) fn publish(&self, state: BatchState) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        let terminal = state.is_complete;
        let events = if terminal {
            inner.events.take()
        } else {
            inner.events.clone()
        };
        let Some(events) = events else {
            return false;
        };
        // The receiver may have been dropped; the watch slot is still updated.
        let _ = events.send(state.clone());
        inner.latest.send_replace(state);
        true
    }

    pub(crate) fn is_sealed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .events
            .is_none()
    }
}

/// Handle returned by every dispatch entry point.
///
/// The batch runs in the background whether or not the handle is polled.
/// Snapshots are buffered for [`BatchHandle::states`] until read.
pub struct BatchHandle {
    id: String,
    latest: watch::Receiver<BatchState>,
    events: Option<mpsc::UnboundedReceiver<BatchState>>,
    cancel: Arc<CancellationController>,
}

impl BatchHandle {
    pub(crate) fn new(
        id: String,
        latest: watch::Receiver<BatchState>,
        events: mpsc::UnboundedReceiver<BatchState>,
        cancel: Arc<CancellationController>,
    ) -> Self {
        Self {
            id,
            latest,
            events: Some(events),
            cancel,
        }
    }

    /// Handle for a batch that is terminal before any work starts.
    pub(crate) fn finished(state: BatchState) -> Self {
        let id = state.id.clone();
        let (_publisher, latest, events) = StatePublisher::channel(state);
        Self::new(id, latest, events, Arc::new(CancellationController::new()))
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Most recently published snapshot.
    pub fn latest(&self) -> BatchState {
        self.latest.borrow().clone()
    }

    /// Ordered snapshot stream ending with exactly one terminal state.
    ///
    /// The stream can be taken once; later calls return an empty stream.
    pub fn states(&mut self) -> StateStream {
        match self.events.take() {
            Some(rx) => Box::pin(UnboundedReceiverStream::new(rx)),
            None => Box::pin(futures::stream::empty()),
        }
    }

    pub fn into_stream(mut self) -> StateStream {
        self.states()
    }

    /// Request cooperative cancellation of this batch.
    pub fn cancel(&self) {
        self.cancel.cancel_all();
    }

    pub fn is_cancel_requested(&self) -> bool {
        self.cancel.is_set()
    }

    /// Wait for the terminal snapshot.
    pub async fn wait(self) -> BatchState {
        let Self {
            mut latest, events, ..
        } = self;
        drop(events);
        let done = latest
            .wait_for(|s| s.is_complete)
            .await
            .map(|s| (*s).clone())
            .ok();
        done.unwrap_or_else(|| latest.borrow().clone())
    }
}

impl std::fmt::Debug for BatchHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchHandle")
            .field("id", &self.id)
            .field("status", &self.latest.borrow().status)
            .finish()
    }
}
