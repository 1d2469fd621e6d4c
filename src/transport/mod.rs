//! Concrete provider bindings.

pub mod http;

pub use http::{HttpChatProvider, HttpProviderConfig};
