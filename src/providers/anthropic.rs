//! Messages-with-cache-control adapter (Anthropic-style back-ends).
//!
//! The messages protocol differs from chat completions in two ways the
//! engines care about: the system prompt is a separate request field rather
//! than a message, and cache participation is opt-in per message via a
//! `cache_control` marker on a content block. Usage reports cached prompt
//! tokens as `cache_read_input_tokens`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use crate::config::ProviderConfig;
use crate::error::{LlmError, Result};
use crate::meter::UsageStats;
use crate::providers::{safe_dump, MAX_DUMP_DEPTH};
use crate::traits::{
    CacheControl, ChatChunk, ChatMessage, ChatOutcome, ChatRole, CompletionParams, LLMProvider,
    MessageContent, ProviderCapabilities,
};

/// Protocol version header required by the messages endpoint.
const API_VERSION: &str = "2023-06-01";

/// Default output cap; the messages endpoint requires max_tokens.
const DEFAULT_MAX_TOKENS: usize = 4096;

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Value,
}

#[derive(Debug, Serialize)]
struct MessagesRequest<'a> {
    model: &'a str,
    max_tokens: usize,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop_sequences: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct ContentBlock {
    #[serde(rename = "type")]
    block_type: String,
    #[serde(default)]
    text: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct MessagesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    cache_read_input_tokens: Option<u64>,
}

impl MessagesUsage {
    fn normalise(self) -> UsageStats {
        UsageStats {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cached_tokens: self.cache_read_input_tokens.unwrap_or(0),
            reasoning_tokens: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    content: Vec<ContentBlock>,
    #[serde(default)]
    usage: MessagesUsage,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum StreamEvent {
    #[serde(rename = "content_block_delta")]
    ContentBlockDelta { delta: DeltaBlock },
    #[serde(rename = "message_delta")]
    MessageDelta {
        #[serde(default)]
        usage: Option<MessagesUsage>,
    },
    #[serde(rename = "message_stop")]
    MessageStop,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct DeltaBlock {
    #[serde(default)]
    text: Option<String>,
}

// ============================================================================
// Message conversion
// ============================================================================

/// Convert engine messages to the messages-protocol shape.
///
/// System messages are pulled out into the separate `system` field; a
/// message carrying a cache marker is rendered as a content-block array
/// with `cache_control` attached to its final block.
fn convert_messages(messages: &[ChatMessage]) -> Result<(Option<String>, Vec<WireMessage>)> {
    let mut system: Option<String> = None;
    let mut converted = Vec::new();

    for msg in messages {
        if msg.role == ChatRole::System {
            let text = msg.text();
            system = Some(match system.take() {
                Some(existing) => format!("{}\n\n{}", existing, text),
                None => text,
            });
            continue;
        }

        let content = render_content(&msg.content, msg.cache_control.as_ref())?;
        converted.push(WireMessage {
            role: msg.role.as_str(),
            content,
        });
    }

    Ok((system, converted))
}

fn render_content(content: &MessageContent, cache: Option<&CacheControl>) -> Result<Value> {
    let Some(cache) = cache else {
        return Ok(serde_json::to_value(content)?);
    };

    // Cache marker requires block form.
    let mut blocks: Vec<Value> = match content {
        MessageContent::Text(text) => vec![serde_json::json!({"type": "text", "text": text})],
        MessageContent::Parts(parts) => parts
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<_, _>>()?,
    };
    if let Some(last) = blocks.last_mut() {
        last["cache_control"] = serde_json::to_value(cache)?;
    }
    Ok(Value::Array(blocks))
}

// ============================================================================
// Provider
// ============================================================================

/// Adapter for messages-protocol back-ends.
pub struct AnthropicProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    capabilities: ProviderCapabilities,
    max_retries: u32,
}

impl AnthropicProvider {
    /// Build an adapter from provider configuration.
    pub fn from_config(config: &ProviderConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs_f64(config.timeout))
            .build()
            .map_err(|e| LlmError::Generic(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            name: config.id.clone(),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            capabilities: config.capabilities(),
            max_retries: config.max_retries,
        })
    }

    fn endpoint(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key)
                .map_err(|_| LlmError::Auth("api key contains invalid header characters".into()))?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    fn classify_status(&self, status: u16, body: &str) -> LlmError {
        let message = serde_json::from_str::<ApiErrorBody>(body)
            .map(|b| b.error.message)
            .unwrap_or_else(|_| body.chars().take(500).collect());
        match status {
            401 | 403 => LlmError::Auth(message),
            400 | 422 => LlmError::InvalidRequest(message),
            404 => LlmError::NotFound(message),
            408 => LlmError::Timeout(message),
            429 => LlmError::RateLimited(message),
            s if s >= 500 => LlmError::Server { status: s, message },
            _ => LlmError::Generic(format!("HTTP {}: {}", status, message)),
        }
    }

    fn build_request<'a>(
        model: &'a str,
        messages: &[ChatMessage],
        params: &'a CompletionParams,
        stream: bool,
    ) -> Result<MessagesRequest<'a>> {
        let (system, converted) = convert_messages(messages)?;
        Ok(MessagesRequest {
            model,
            max_tokens: params.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            messages: converted,
            system,
            temperature: params.temperature,
            top_p: params.top_p,
            stop_sequences: params.stop.as_ref(),
            stream: stream.then_some(true),
        })
    }
}

#[async_trait]
impl LLMProvider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn max_retries(&self) -> u32 {
        self.max_retries
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatOutcome> {
        let request = Self::build_request(model, messages, params, false)?;

        let response = self
            .client
            .post(self.endpoint())
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(self.classify_status(status.as_u16(), &body));
        }

        let raw: Value = serde_json::from_str(&body)?;
        let parsed: MessagesResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Generic(format!("malformed messages response: {}", e)))?;

        let text = parsed
            .content
            .iter()
            .filter(|b| b.block_type == "text")
            .filter_map(|b| b.text.as_deref())
            .collect::<String>();
        let usage = parsed.usage.normalise();
        debug!(
            provider = %self.name,
            model,
            input = usage.input_tokens,
            cached = usage.cached_tokens,
            "messages call finished"
        );

        Ok(ChatOutcome {
            text,
            usage,
            raw: safe_dump(&raw, MAX_DUMP_DEPTH),
        })
    }

    async fn chat_stream(
        &self,
        model: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<BoxStream<'static, Result<ChatChunk>>> {
        let request = Self::build_request(model, messages, params, true)?;

        let response = self
            .client
            .post(self.endpoint())
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status.as_u16(), &body));
        }

        let mut buffer = String::new();
        let stream = response
            .bytes_stream()
            .map(move |chunk| -> Vec<Result<ChatChunk>> {
                let bytes = match chunk {
                    Ok(bytes) => bytes,
                    Err(e) => return vec![Err(LlmError::from(e))],
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));
                let mut out = Vec::new();
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let Ok(event) = serde_json::from_str::<StreamEvent>(data.trim()) else {
                        continue;
                    };
                    match event {
                        StreamEvent::ContentBlockDelta { delta } => out.push(Ok(ChatChunk {
                            delta: delta.text.unwrap_or_default(),
                            finish_reason: None,
                            usage: None,
                        })),
                        StreamEvent::MessageDelta { usage } => {
                            if let Some(usage) = usage {
                                out.push(Ok(ChatChunk {
                                    delta: String::new(),
                                    finish_reason: None,
                                    usage: Some(usage.normalise()),
                                }));
                            }
                        }
                        StreamEvent::MessageStop => out.push(Ok(ChatChunk {
                            delta: String::new(),
                            finish_reason: Some("stop".to_string()),
                            usage: None,
                        })),
                        StreamEvent::Other => {}
                    }
                }
                out
            });

        Ok(stream.flat_map(futures::stream::iter).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn config() -> ProviderConfig {
        ProviderConfig {
            id: "anthropic".into(),
            kind: ProviderKind::Messages,
            base_url: "https://api.anthropic.com".into(),
            api_key: "sk-ant".into(),
            timeout: 30.0,
            max_retries: 1,
            capabilities: None,
        }
    }

    #[test]
    fn test_from_config() {
        let provider = AnthropicProvider::from_config(&config()).unwrap();
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.endpoint(), "https://api.anthropic.com/v1/messages");
        assert!(provider.capabilities().supports_caching);
        assert!(!provider.capabilities().supports_responses);
    }

    #[test]
    fn test_system_extracted_to_separate_field() {
        let messages = vec![
            ChatMessage::system("be rigorous"),
            ChatMessage::user("prove it"),
            ChatMessage::assistant("done"),
        ];
        let (system, wire) = convert_messages(&messages).unwrap();
        assert_eq!(system.as_deref(), Some("be rigorous"));
        assert_eq!(wire.len(), 2);
        assert_eq!(wire[0].role, "user");
        assert_eq!(wire[1].role, "assistant");
    }

    #[test]
    fn test_multiple_system_messages_joined() {
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::user("q"),
            ChatMessage::system("second"),
        ];
        let (system, _) = convert_messages(&messages).unwrap();
        assert_eq!(system.as_deref(), Some("first\n\nsecond"));
    }

    #[test]
    fn test_cache_control_renders_block_form() {
        let mut msg = ChatMessage::user("stable prefix tail");
        msg.cache_control = Some(CacheControl::ephemeral());
        let (_, wire) = convert_messages(&[msg]).unwrap();

        let content = &wire[0].content;
        assert!(content.is_array());
        assert_eq!(content[0]["type"], "text");
        assert_eq!(content[0]["text"], "stable prefix tail");
        assert_eq!(content[0]["cache_control"]["type"], "ephemeral");
    }

    #[test]
    fn test_plain_message_stays_string() {
        let (_, wire) = convert_messages(&[ChatMessage::user("plain")]).unwrap();
        assert_eq!(wire[0].content, Value::String("plain".into()));
    }

    #[test]
    fn test_usage_normalisation() {
        let usage: MessagesUsage = serde_json::from_str(
            r#"{"input_tokens": 50, "output_tokens": 10, "cache_read_input_tokens": 30}"#,
        )
        .unwrap();
        let stats = usage.normalise();
        assert_eq!(stats.input_tokens, 50);
        assert_eq!(stats.cached_tokens, 30);
        assert_eq!(stats.reasoning_tokens, 0);
    }

    #[test]
    fn test_status_classification() {
        let provider = AnthropicProvider::from_config(&config()).unwrap();
        let body = r#"{"type": "error", "error": {"type": "rate_limit_error", "message": "slow"}}"#;
        assert!(matches!(
            provider.classify_status(429, body),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            provider.classify_status(529, body),
            LlmError::Server { status: 529, .. }
        ));
    }

    #[test]
    fn test_request_requires_max_tokens() {
        let default_params = CompletionParams::default();
        let request = AnthropicProvider::build_request(
            "claude-test",
            &[ChatMessage::user("x")],
            &default_params,
            false,
        )
        .unwrap();
        assert_eq!(request.max_tokens, DEFAULT_MAX_TOKENS);

        let params = CompletionParams {
            max_tokens: Some(512),
            ..Default::default()
        };
        let request =
            AnthropicProvider::build_request("claude-test", &[ChatMessage::user("x")], &params, false)
                .unwrap();
        assert_eq!(request.max_tokens, 512);
    }

    #[test]
    fn test_stream_event_parsing() {
        let delta: StreamEvent = serde_json::from_str(
            r#"{"type": "content_block_delta", "index": 0,
                "delta": {"type": "text_delta", "text": "hi"}}"#,
        )
        .unwrap();
        assert!(matches!(
            delta,
            StreamEvent::ContentBlockDelta { delta: DeltaBlock { text: Some(t) } } if t == "hi"
        ));

        let ping: StreamEvent = serde_json::from_str(r#"{"type": "ping"}"#).unwrap();
        assert!(matches!(ping, StreamEvent::Other));
    }
}
