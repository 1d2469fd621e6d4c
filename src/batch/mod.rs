//! Batch orchestration.
//!
//! | Item | Description |
//! |------|-------------|
//! | [`BatchDispatcher`] | Runs batches with bounded concurrency, rate limiting, retries and cancellation |
//! | [`BatchHandle`] | Snapshot stream, latest state and cancellation of one batch |
//! | [`ResponseAggregator`] | Lock-protected response map with in-order publication |
//!
//! Every unit of work in a batch goes through the same stages: its request
//! id's turn, concurrency permit, cancellation checkpoint, rate-limit slot, checkpoint, retried
//! provider call under a hard per-request timeout. Its outcome is recorded in
//! the aggregator and a fresh snapshot is published before the progress sink
//! is told.

pub mod aggregator;
pub mod dispatcher;
mod handle;
mod turns;

pub use aggregator::ResponseAggregator;
pub use dispatcher::{BatchDispatcher, DispatchSignals, InflightSnapshot};
pub use handle::BatchHandle;
