//! Core data types shared by every stage of the dispatcher.
//!
//! | Type | Description |
//! |------|-------------|
//! | [`Request`] | One completion request produced by template expansion |
//! | [`Response`] | Terminal outcome of a request (`error == None` means success) |
//! | [`BatchStatus`] | Batch lifecycle status |
//! | [`BatchState`] | Immutable snapshot published after every state change |
//!
//! ## Example
//!
//! ```rust
//! use ai_batch_dispatch::types::{Request, Response};
//!
//! let req = Request::new("q-1", "Summarise this paragraph").with_system_instruction("Be terse");
//! let ok = Response::success(&req.id, "Done.");
//! assert!(ok.is_success());
//! ```

pub mod request;
pub mod state;

pub use request::{Request, Response};
pub use state::{BatchState, BatchStatus};
