//! Upstream language-model access: the `ModelApi` seam, the Anthropic HTTP
//! implementation, and the retrying/metering `ModelClient` wrapper.

pub mod api;
pub mod client;

pub use api::{AnthropicApi, ChatMessage, ModelApi, ModelRequest, ModelResponse, Role,
    is_transient_message};
pub use client::{CallMeta, ModelClient};
