//! Provider port: the single seam between the dispatcher and a concrete LLM API.
//!
//! A provider's whole job is "send this text, return completion text or fail".
//! Failures only need a human-readable message; the dispatcher classifies them
//! by substring (see [`crate::error_code`]).
//!
//! | Item | Description |
//! |------|-------------|
//! | [`ProviderPort`] | Trait implemented by every provider binding |
//! | [`ProviderRegistry`] | Explicit keyed cache of provider instances with `close_all` |
//! | [`crate::transport::HttpChatProvider`] | OpenAI-compatible HTTP binding |

mod registry;

pub use registry::ProviderRegistry;

use crate::types::Request;
use crate::Result;
use async_trait::async_trait;

#[async_trait]
pub trait ProviderPort: Send + Sync {
    /// Stable identifier used in logs.
    fn name(&self) -> &str;

    /// Send one request and return the completion text.
    async fn send(&self, request: &Request) -> Result<String>;

    /// Best-effort interruption of any call currently in progress.
    fn cancel(&self) {}

    /// Release provider-held resources. Later sends may fail.
    async fn close(&self) {}
}
