//! # ai-batch-dispatch
//!
//! Batch orchestration runtime for LLM completion requests.
//!
//! ## Overview
//!
//! A batch is a list of independent [`Request`]s sent to one provider under
//! three simultaneous constraints: a hard concurrency ceiling, a
//! requests-per-window budget, and bounded retries of transient failures. The
//! whole batch can be cancelled mid-flight without losing results that were
//! already produced, and callers observe it as a stream of immutable
//! [`BatchState`] snapshots.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use ai_batch_dispatch::progress::noop_sink;
//! use ai_batch_dispatch::transport::{HttpChatProvider, HttpProviderConfig};
//! use ai_batch_dispatch::{BatchDispatcher, DispatchConfig, Request};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> ai_batch_dispatch::Result<()> {
//!     let provider = HttpChatProvider::new(HttpProviderConfig::default())?;
//!     let dispatcher = BatchDispatcher::new(DispatchConfig::default(), Arc::new(provider))?;
//!
//!     let requests = vec![
//!         Request::new("q1", "Name a prime number."),
//!         Request::new("q2", "Name a colour."),
//!     ];
//!     let state = dispatcher.dispatch(requests, noop_sink()).wait().await;
//!     println!("{:?}: {}/{}", state.status, state.completed_count, state.total_count);
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! | Module | Description |
//! |--------|-------------|
//! | [`batch`] | Dispatcher, batch handle and response aggregation |
//! | [`cancel`] | Cooperative cancellation flag and handle registry |
//! | [`config`] | Dispatch configuration (code, YAML/JSON, environment) |
//! | [`error_code`] | Failure classification and retryability markers |
//! | [`progress`] | Per-request progress sinks |
//! | [`provider`] | Provider port and registry |
//! | [`resilience`] | Sliding-window rate limiter and retry executor |
//! | [`template`] | Template expansion seam |
//! | [`transport`] | OpenAI-compatible HTTP provider |
//! | [`types`] | Requests, responses and batch state |

pub mod batch;
pub mod cancel;
pub mod config;
pub mod error_code;
pub mod progress;
pub mod provider;
pub mod resilience;
pub mod template;
pub mod transport;
pub mod types;

pub use batch::{BatchDispatcher, BatchHandle};
pub use config::DispatchConfig;
pub use error_code::FailureKind;
pub use progress::{ProgressEvent, ProgressSink};
pub use provider::ProviderPort;
pub use template::TemplateExpander;
pub use types::{BatchState, BatchStatus, Request, Response};

use futures::Stream;
use std::pin::Pin;

/// Result type alias for the library
pub type Result<T> = std::result::Result<T, Error>;

/// A pinned, boxed stream of batch snapshots.
pub type StateStream = Pin<Box<dyn Stream<Item = BatchState> + Send>>;

/// Error type for the library
pub mod error;
pub use error::{Error, ErrorContext};
