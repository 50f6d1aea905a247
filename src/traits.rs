//! Core message model and the capability-typed provider interface.
//!
//! Three wire protocols hide behind one trait:
//! - chat-completions (system prompt prepended as a message),
//! - responses (same back-end, richer endpoint with server-side prefix
//!   caching via `previous_response_id`),
//! - messages-with-cache-control (system is a separate field, caching is
//!   opt-in per message).
//!
//! The engines never branch on a concrete provider type; they consult
//! [`ProviderCapabilities`] and call the matching trait method. Multimodal
//! content parts are opaque to the engines except for cache-key
//! normalisation (see [`crate::fingerprint`]).

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::meter::UsageStats;

// ============================================================================
// Messages
// ============================================================================

/// Role of a chat message sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// System message for setting context.
    System,
    /// User input message.
    User,
    /// Assistant response message.
    Assistant,
}

impl ChatRole {
    /// String form used on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::System => "system",
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
        }
    }
}

/// A typed content part of a multimodal message.
///
/// Parts are carried through to the provider unchanged; the engines only
/// ever read `Text` parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    /// Plain text part.
    Text {
        /// The text content.
        text: String,
    },
    /// Image reference, either a URL or a `data:image/...` URI.
    ImageUrl {
        /// The image payload.
        image_url: ImageUrl,
    },
    /// Tool invocation emitted by a model (opaque to the engines).
    ToolUse {
        /// Provider-specific fields, passed through verbatim.
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
    /// Tool output fed back to a model (opaque to the engines).
    ToolResult {
        /// Provider-specific fields, passed through verbatim.
        #[serde(flatten)]
        data: serde_json::Map<String, Value>,
    },
}

/// Image payload for an `image_url` part.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    /// URL or data URI of the image.
    pub url: String,
    /// Optional detail hint ("auto", "low", "high").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Message content: a bare string or a list of typed parts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text content (serializes as a string).
    Text(String),
    /// Multimodal content (serializes as an array of parts).
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Extract the plain text view of this content.
    ///
    /// Non-text parts contribute nothing; text parts are joined with
    /// newlines, matching how history is rendered for compression.
    pub fn text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|p| match p {
                    ContentPart::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Cache hint for providers with opt-in per-message caching.
///
/// The messages-with-cache-control variant establishes a cache breakpoint
/// at the marked message; other variants ignore the field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheControl {
    /// Cache type; currently only `"ephemeral"`.
    #[serde(rename = "type")]
    pub cache_type: String,
}

impl CacheControl {
    /// The ephemeral cache marker.
    pub fn ephemeral() -> Self {
        Self {
            cache_type: "ephemeral".to_string(),
        }
    }
}

/// A message in a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    /// Role of the sender.
    pub role: ChatRole,

    /// Content of the message.
    pub content: MessageContent,

    /// Cache breakpoint hint for caching-capable providers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_control: Option<CacheControl>,
}

impl ChatMessage {
    /// Create a system message.
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: MessageContent::Text(content.into()),
            cache_control: None,
        }
    }

    /// Create a user message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Text(content.into()),
            cache_control: None,
        }
    }

    /// Create an assistant message.
    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: MessageContent::Text(content.into()),
            cache_control: None,
        }
    }

    /// Create a user message from typed parts.
    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self {
            role: ChatRole::User,
            content: MessageContent::Parts(parts),
            cache_control: None,
        }
    }

    /// Plain text view of the content.
    pub fn text(&self) -> String {
        self.content.text()
    }
}

// ============================================================================
// Capabilities and Parameters
// ============================================================================

/// Capability flags driving engine dispatch.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProviderCapabilities {
    /// Provider exposes a responses endpoint with `previous_response_id`.
    #[serde(default)]
    pub supports_responses: bool,
    /// Provider can stream chat completions.
    #[serde(default = "default_true")]
    pub supports_streaming: bool,
    /// Provider accepts image parts.
    #[serde(default)]
    pub supports_vision: bool,
    /// Provider reports reasoning/thinking tokens.
    #[serde(default)]
    pub supports_thinking: bool,
    /// Provider supports prefix caching (server-side or cache_control).
    #[serde(default)]
    pub supports_caching: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ProviderCapabilities {
    fn default() -> Self {
        Self {
            supports_responses: false,
            supports_streaming: true,
            supports_vision: false,
            supports_thinking: false,
            supports_caching: false,
        }
    }
}

/// Sampling and output parameters for a completion request.
///
/// Participates in the request fingerprint, so two calls that differ only in
/// parameters cache separately.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct CompletionParams {
    /// Sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,

    /// Maximum tokens to generate.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<usize>,

    /// Top-p (nucleus) sampling.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,

    /// Stop sequences.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stop: Option<Vec<String>>,

    /// Sampling seed, where the provider honours it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,

    /// Response format constraint (e.g. a json_schema object).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
}

impl CompletionParams {
    /// Params with only a temperature set.
    pub fn with_temperature(temperature: f32) -> Self {
        Self {
            temperature: Some(temperature),
            ..Default::default()
        }
    }
}

// ============================================================================
// Call Outcomes
// ============================================================================

/// Result of a chat-completion call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatOutcome {
    /// Aggregated assistant text.
    pub text: String,
    /// Normalised token usage.
    pub usage: UsageStats,
    /// Raw provider response, depth-bounded for safe logging.
    pub raw: Value,
}

/// Result of a responses-endpoint call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseOutcome {
    /// Aggregated output text.
    pub text: String,
    /// Provider response id, chainable as `previous_response_id`.
    pub response_id: Option<String>,
    /// Normalised token usage.
    pub usage: UsageStats,
    /// Raw provider response, depth-bounded for safe logging.
    pub raw: Value,
}

/// A chunk of a streaming chat completion.
#[derive(Debug, Clone)]
pub struct ChatChunk {
    /// Incremental text.
    pub delta: String,
    /// Finish reason, present on the terminal chunk.
    pub finish_reason: Option<String>,
    /// Usage, when the provider reports it on the final chunk.
    pub usage: Option<UsageStats>,
}

// ============================================================================
// Provider Trait
// ============================================================================

impl std::fmt::Debug for dyn LLMProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LLMProvider").field("name", &self.name()).finish()
    }
}

/// Uniform interface over the three provider wire protocols.
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Provider instance id (the config key, e.g. `"openai"`).
    fn name(&self) -> &str;

    /// Capability flags for dispatch decisions.
    fn capabilities(&self) -> ProviderCapabilities;

    /// Retry budget for transient failures, from provider config.
    fn max_retries(&self) -> u32 {
        3
    }

    /// Send a single-turn chat completion request.
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatOutcome>;

    /// Stream a chat completion as incremental chunks.
    async fn chat_stream(
        &self,
        _model: &str,
        _messages: &[ChatMessage],
        _params: &CompletionParams,
    ) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        Err(crate::error::LlmError::InvalidRequest(
            "provider does not support streaming".to_string(),
        ))
    }

    /// Send a responses-endpoint request with optional prefix chaining.
    ///
    /// Only meaningful when `capabilities().supports_responses`; the default
    /// rejects the call.
    async fn response(
        &self,
        _model: &str,
        _input_messages: &[ChatMessage],
        _params: &CompletionParams,
        _store: bool,
        _previous_response_id: Option<&str>,
    ) -> Result<ResponseOutcome> {
        Err(crate::error::LlmError::InvalidRequest(
            "provider does not support the responses endpoint".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_value(ChatRole::User).unwrap(), "user");
        assert_eq!(serde_json::to_value(ChatRole::System).unwrap(), "system");
        assert_eq!(ChatRole::Assistant.as_str(), "assistant");
    }

    #[test]
    fn test_text_content_roundtrip() {
        let msg = ChatMessage::user("hello");
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["role"], "user");
        assert_eq!(json["content"], "hello");

        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_parts_content_roundtrip() {
        let msg = ChatMessage::user_parts(vec![
            ContentPart::Text {
                text: "what is this?".into(),
            },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "data:image/png;base64,AAAA".into(),
                    detail: None,
                },
            },
        ]);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["content"][0]["type"], "text");
        assert_eq!(json["content"][1]["type"], "image_url");
        assert_eq!(
            json["content"][1]["image_url"]["url"],
            "data:image/png;base64,AAAA"
        );

        let back: ChatMessage = serde_json::from_value(json).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_text_extraction_skips_non_text_parts() {
        let msg = ChatMessage::user_parts(vec![
            ContentPart::Text { text: "a".into() },
            ContentPart::ImageUrl {
                image_url: ImageUrl {
                    url: "https://example.com/x.png".into(),
                    detail: Some("low".into()),
                },
            },
            ContentPart::Text { text: "b".into() },
        ]);
        assert_eq!(msg.text(), "a\nb");
    }

    #[test]
    fn test_tool_parts_are_opaque_passthrough() {
        let raw = serde_json::json!({
            "role": "assistant",
            "content": [
                {"type": "tool_use", "id": "t1", "name": "calc", "input": {"x": 1}}
            ]
        });
        let msg: ChatMessage = serde_json::from_value(raw.clone()).unwrap();
        let back = serde_json::to_value(&msg).unwrap();
        assert_eq!(back, raw);
        assert_eq!(msg.text(), "");
    }

    #[test]
    fn test_cache_control_serialization() {
        let mut msg = ChatMessage::user("cached");
        msg.cache_control = Some(CacheControl::ephemeral());
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["cache_control"]["type"], "ephemeral");

        let plain = serde_json::to_value(ChatMessage::user("plain")).unwrap();
        assert!(plain.get("cache_control").is_none());
    }

    #[test]
    fn test_capabilities_defaults() {
        let caps = ProviderCapabilities::default();
        assert!(!caps.supports_responses);
        assert!(caps.supports_streaming);
        assert!(!caps.supports_caching);

        // Deserializing an empty object applies the same defaults.
        let parsed: ProviderCapabilities = serde_json::from_str("{}").unwrap();
        assert_eq!(parsed, caps);
    }

    #[test]
    fn test_completion_params_skip_none() {
        let params = CompletionParams::with_temperature(0.3);
        let json = serde_json::to_value(&params).unwrap();
        assert_eq!(json["temperature"], 0.3);
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("seed").is_none());
    }
}
