//! Shared primitives for provider-agnostic LLM transports.
//!
//! The engine never talks to a vendor API directly. It speaks through the
//! [`ChatTransport`] trait and the lightweight data types defined in this
//! module: chat messages with multi-modal parts, native tool calls, tool
//! schemas, streaming chunks, and token/cost accounting. A concrete provider
//! client implements `ChatTransport` and is handed to the engine at startup.
//!
//! # Basic request/response
//!
//! ```rust,no_run
//! use lars::lars::transport::{ChatMessage, ChatRequest, ChatTransport, Role};
//! use std::sync::Arc;
//!
//! # async fn demo(transport: Arc<dyn ChatTransport>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//! let request = ChatRequest {
//!     model: "provider/some-model".to_string(),
//!     messages: vec![ChatMessage::text(Role::User, "Who are you?")],
//!     tools: Vec::new(),
//!     params: Default::default(),
//! };
//! let response = transport.chat(request).await?;
//! println!("Assistant: {}", response.content);
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use futures_util::stream::Stream;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::pin::Pin;

/// The possible roles for a chat message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// A system authored message that primes or constrains assistant behaviour.
    System,
    /// A user authored message.
    User,
    /// An assistant authored message (model responses).
    Assistant,
    /// A tool-result message correlating with a prior assistant [`ToolCall`].
    Tool {
        /// Provider-assigned id of the call this result answers.
        call_id: String,
    },
}

/// One part of a multi-modal message body.
///
/// Tool results that carry images are injected into the next turn's history
/// as `ImagePath` parts; transports translate these to whatever their
/// provider's multi-modal wire format requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentPart {
    Text(String),
    ImagePath(String),
    ImageBase64(String),
}

/// A single tool call returned by the LLM in a native function-calling
/// response.
///
/// Providers assign an opaque [`id`](ToolCall::id) to each call so that the
/// tool result can be correlated back in a follow-up `Role::Tool` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Provider-assigned call id, e.g. `"call_abc123"`.
    pub id: String,
    /// Tool name matching one of the [`ToolSpec`]s sent in the request.
    pub name: String,
    /// Parsed JSON arguments supplied by the LLM for this call.
    pub arguments: serde_json::Value,
}

/// Provider-agnostic tool schema passed to the LLM along with a chat request.
///
/// Derived from trait metadata via
/// [`TraitMetadata::to_tool_spec`](crate::lars::trait_registry::TraitMetadata::to_tool_spec).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Tool name as it will appear in the request's `tools` array.
    pub name: String,
    /// Human-readable description surfaced to the LLM to aid tool selection.
    pub description: String,
    /// JSON Schema object describing the accepted arguments.
    pub parameters_schema: serde_json::Value,
}

/// How many tokens were spent, and what the provider billed for them.
///
/// Cost is authoritative when the provider reports it; transports that have
/// no billing data leave it at zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cost_usd: f64,
}

impl Usage {
    /// Fold another usage record into this one.
    pub fn absorb(&mut self, other: &Usage) {
        self.prompt_tokens += other.prompt_tokens;
        self.completion_tokens += other.completion_tokens;
        self.cost_usd += other.cost_usd;
    }
}

/// A generic chat message.
///
/// `tool_calls` is non-empty only on assistant messages returned by
/// [`ChatTransport::chat`] when the provider responds with function-calling
/// results; it is carried in history so that replays see the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub parts: Vec<ContentPart>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

impl ChatMessage {
    /// Build a plain text message.
    pub fn text(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            parts: vec![ContentPart::Text(content.into())],
            tool_calls: Vec::new(),
        }
    }

    /// Concatenate the text parts of the message body.
    pub fn content_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            if let ContentPart::Text(text) = part {
                out.push_str(text);
            }
        }
        out
    }
}

/// Sampling and limit parameters forwarded to the provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChatParams {
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
}

/// A full chat-completion request.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    /// Opaque, provider-prefixed model identifier.
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolSpec>,
    pub params: ChatParams,
}

/// The provider's answer to a [`ChatRequest`].
#[derive(Debug, Clone)]
pub struct ChatResponse {
    /// Assistant text. May be empty when the response is only tool calls.
    pub content: String,
    /// Native tool calls requested by the assistant, in emission order.
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
}

/// A chunk of content in a streaming response.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    /// The incremental content delta in this chunk. May be empty for chunks
    /// that only carry a finish reason.
    pub content: String,
    /// Provider specific completion status (e.g. `"stop"`), if present.
    pub finish_reason: Option<String>,
}

/// Type alias for a stream of chat chunks compatible with `Send` executors.
pub type ChatChunkStream =
    Pin<Box<dyn Stream<Item = Result<ChatChunk, Box<dyn Error + Send + Sync>>> + Send>>;

/// Trait-driven abstraction over a concrete LLM provider.
///
/// A [`ChatTransport`] translates engine requests into the provider specific
/// wire format and returns responses in a uniform shape. The abstraction
/// deliberately excludes conversation bookkeeping — the engine's
/// [`Echo`](crate::lars::echo::Echo) owns history.
///
/// All implementations must be thread-safe (`Send + Sync`) so they can be
/// shared between candidate branches running in parallel.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    /// Send a full request/response style chat completion.
    ///
    /// On success the returned [`ChatResponse`] may carry tool calls when the
    /// provider selected one or more of the supplied [`ToolSpec`]s.
    async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, Box<dyn Error + Send + Sync>>;

    /// Request a streaming response from the provider.
    ///
    /// Transports without streaming support inherit this default which simply
    /// resolves to `Ok(None)`; the engine then falls back to [`chat`](ChatTransport::chat)
    /// and coalesces whole turns.
    async fn chat_stream(
        &self,
        _request: ChatRequest,
    ) -> Result<Option<ChatChunkStream>, Box<dyn Error + Send + Sync>> {
        Ok(None)
    }

    /// The model used when neither the cell nor the cascade names one.
    fn default_model(&self) -> &str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_text_concatenates_only_text_parts() {
        let msg = ChatMessage {
            role: Role::User,
            parts: vec![
                ContentPart::Text("hello ".to_string()),
                ContentPart::ImagePath("/tmp/a.png".to_string()),
                ContentPart::Text("world".to_string()),
            ],
            tool_calls: Vec::new(),
        };
        assert_eq!(msg.content_text(), "hello world");
    }

    #[test]
    fn usage_absorb_accumulates() {
        let mut total = Usage::default();
        total.absorb(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            cost_usd: 0.01,
        });
        total.absorb(&Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            cost_usd: 0.002,
        });
        assert_eq!(total.prompt_tokens, 13);
        assert_eq!(total.completion_tokens, 7);
        assert!((total.cost_usd - 0.012).abs() < 1e-9);
    }

    #[test]
    fn tool_role_round_trips_through_serde() {
        let role = Role::Tool {
            call_id: "call_1".to_string(),
        };
        let json = serde_json::to_string(&role).unwrap();
        let back: Role = serde_json::from_str(&json).unwrap();
        assert_eq!(role, back);
    }
}
