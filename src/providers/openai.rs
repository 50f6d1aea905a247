//! Chat-completions and responses adapters for OpenAI-style back-ends.
//!
//! Both endpoints live on the same base URL; the richer responses endpoint
//! is only used when the provider is configured with `kind: responses`. It
//! accepts a `previous_response_id` to chain requests for server-side prefix
//! caching and reports reasoning tokens in `output_tokens_details`.
//!
//! Usage extraction:
//! - chat: `input_tokens` / `output_tokens` (classic `prompt_tokens` /
//!   `completion_tokens` accepted as aliases) plus an optional nested
//!   `prompt_tokens_details.cached_tokens`;
//! - responses: `input_tokens_details.cached_tokens` and
//!   `output_tokens_details.reasoning_tokens`.

use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
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
    ChatChunk, ChatMessage, ChatOutcome, CompletionParams, LLMProvider, ProviderCapabilities,
    ResponseOutcome,
};

// ============================================================================
// Wire types — chat completions
// ============================================================================

#[derive(Debug, Serialize)]
struct WireMessage {
    role: &'static str,
    content: Value,
}

fn to_wire(messages: &[ChatMessage]) -> Result<Vec<WireMessage>> {
    messages
        .iter()
        .map(|m| {
            Ok(WireMessage {
                role: m.role.as_str(),
                content: serde_json::to_value(&m.content)?,
            })
        })
        .collect()
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    seed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

impl<'a> ChatRequest<'a> {
    fn new(model: &'a str, messages: Vec<WireMessage>, params: &'a CompletionParams) -> Self {
        Self {
            model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            top_p: params.top_p,
            stop: params.stop.as_ref(),
            seed: params.seed,
            response_format: params.response_format.as_ref(),
            stream: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize, Default)]
struct ChatUsage {
    #[serde(default, alias = "prompt_tokens")]
    input_tokens: u64,
    #[serde(default, alias = "completion_tokens")]
    output_tokens: u64,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

impl ChatUsage {
    fn normalise(self) -> UsageStats {
        UsageStats {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cached_tokens: self
                .prompt_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            reasoning_tokens: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    #[allow(dead_code)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: Option<StreamDelta>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamResponse {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

// ============================================================================
// Wire types — responses endpoint
// ============================================================================

#[derive(Debug, Serialize)]
struct ResponsesRequest<'a> {
    model: &'a str,
    input: Vec<WireMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_output_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    previous_response_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    store: Option<bool>,
}

#[derive(Debug, Deserialize)]
struct InputTokensDetails {
    #[serde(default)]
    cached_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct OutputTokensDetails {
    #[serde(default)]
    reasoning_tokens: u64,
}

#[derive(Debug, Deserialize, Default)]
struct ResponsesUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
    #[serde(default)]
    input_tokens_details: Option<InputTokensDetails>,
    #[serde(default)]
    output_tokens_details: Option<OutputTokensDetails>,
}

impl ResponsesUsage {
    fn normalise(self) -> UsageStats {
        UsageStats {
            input_tokens: self.input_tokens,
            output_tokens: self.output_tokens,
            cached_tokens: self
                .input_tokens_details
                .map(|d| d.cached_tokens)
                .unwrap_or(0),
            reasoning_tokens: self
                .output_tokens_details
                .map(|d| d.reasoning_tokens)
                .unwrap_or(0),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponsesResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    output_text: Option<String>,
    #[serde(default)]
    output: Option<Vec<Value>>,
    #[serde(default)]
    usage: Option<ResponsesUsage>,
}

impl ResponsesResponse {
    /// Aggregate output text: prefer `output_text`, else collect text parts
    /// from the structured output list.
    fn text(&self) -> String {
        if let Some(text) = &self.output_text {
            if !text.is_empty() {
                return text.clone();
            }
        }
        let mut collected = String::new();
        if let Some(output) = &self.output {
            for item in output {
                if let Some(parts) = item.get("content").and_then(Value::as_array) {
                    for part in parts {
                        if let Some(text) = part.get("text").and_then(Value::as_str) {
                            collected.push_str(text);
                        }
                    }
                }
            }
        }
        collected
    }
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

// ============================================================================
// Provider
// ============================================================================

/// Adapter for OpenAI-style back-ends (chat completions, optionally the
/// responses endpoint).
pub struct OpenAIProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    capabilities: ProviderCapabilities,
    max_retries: u32,
}

impl OpenAIProvider {
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

    fn headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        let auth = HeaderValue::from_str(&format!("Bearer {}", self.api_key))
            .map_err(|_| LlmError::Auth("api key contains invalid header characters".into()))?;
        headers.insert(AUTHORIZATION, auth);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        Ok(headers)
    }

    /// Map a non-success HTTP status onto the error taxonomy.
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

    async fn post_json(&self, url: &str, body: &impl Serialize) -> Result<String> {
        let response = self
            .client
            .post(url)
            .headers(self.headers()?)
            .json(body)
            .send()
            .await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(self.classify_status(status.as_u16(), &text));
        }
        Ok(text)
    }
}

#[async_trait]
impl LLMProvider for OpenAIProvider {
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
        let request = ChatRequest::new(model, to_wire(messages)?, params);
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.post_json(&url, &request).await?;

        let raw: Value = serde_json::from_str(&body)?;
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Generic(format!("malformed chat response: {}", e)))?;

        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();
        let usage = parsed.usage.unwrap_or_default().normalise();
        debug!(
            provider = %self.name,
            model,
            input = usage.input_tokens,
            output = usage.output_tokens,
            cached = usage.cached_tokens,
            "chat completion finished"
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
        let mut request = ChatRequest::new(model, to_wire(messages)?, params);
        request.stream = Some(true);

        let url = format!("{}/chat/completions", self.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.classify_status(status.as_u16(), &text));
        }

        // SSE: split the byte stream into `data: ...` lines, stopping at
        // the `[DONE]` sentinel.
        let mut buffer = String::new();
        let stream = response.bytes_stream().map(move |chunk| -> Vec<Result<ChatChunk>> {
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
                let data = data.trim();
                if data.is_empty() || data == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<StreamResponse>(data) {
                    Ok(parsed) => {
                        let choice = parsed.choices.into_iter().next();
                        out.push(Ok(ChatChunk {
                            delta: choice
                                .as_ref()
                                .and_then(|c| c.delta.as_ref())
                                .and_then(|d| d.content.clone())
                                .unwrap_or_default(),
                            finish_reason: choice.and_then(|c| c.finish_reason),
                            usage: parsed.usage.map(ChatUsage::normalise),
                        }));
                    }
                    Err(e) => out.push(Err(LlmError::Generic(format!(
                        "malformed stream chunk: {}",
                        e
                    )))),
                }
            }
            out
        });

        Ok(stream.flat_map(futures::stream::iter).boxed())
    }

    async fn response(
        &self,
        model: &str,
        input_messages: &[ChatMessage],
        params: &CompletionParams,
        store: bool,
        previous_response_id: Option<&str>,
    ) -> Result<ResponseOutcome> {
        if !self.capabilities.supports_responses {
            return Err(LlmError::InvalidRequest(format!(
                "provider '{}' does not support the responses endpoint",
                self.name
            )));
        }

        let request = ResponsesRequest {
            model,
            input: to_wire(input_messages)?,
            temperature: params.temperature,
            max_output_tokens: params.max_tokens,
            previous_response_id,
            store: store.then_some(true),
        };
        let url = format!("{}/responses", self.base_url);
        let body = self.post_json(&url, &request).await?;

        let raw: Value = serde_json::from_str(&body)?;
        let parsed: ResponsesResponse = serde_json::from_str(&body)
            .map_err(|e| LlmError::Generic(format!("malformed responses payload: {}", e)))?;

        let text = parsed.text();
        let usage = match parsed.usage {
            Some(u) => u.normalise(),
            None => UsageStats::default(),
        };
        debug!(
            provider = %self.name,
            model,
            chained = previous_response_id.is_some(),
            cached = usage.cached_tokens,
            reasoning = usage.reasoning_tokens,
            "responses call finished"
        );

        Ok(ResponseOutcome {
            text,
            response_id: parsed.id,
            usage,
            raw: safe_dump(&raw, MAX_DUMP_DEPTH),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProviderKind;

    fn config(kind: ProviderKind) -> ProviderConfig {
        ProviderConfig {
            id: "openai".into(),
            kind,
            base_url: "https://api.example.com/v1/".into(),
            api_key: "sk-test".into(),
            timeout: 30.0,
            max_retries: 2,
            capabilities: None,
        }
    }

    #[test]
    fn test_from_config_trims_base_url() {
        let provider = OpenAIProvider::from_config(&config(ProviderKind::ChatCompletions)).unwrap();
        assert_eq!(provider.base_url, "https://api.example.com/v1");
        assert_eq!(provider.name(), "openai");
        assert_eq!(provider.max_retries(), 2);
        assert!(!provider.capabilities().supports_responses);
    }

    #[test]
    fn test_responses_kind_enables_capability() {
        let provider = OpenAIProvider::from_config(&config(ProviderKind::Responses)).unwrap();
        assert!(provider.capabilities().supports_responses);
        assert!(provider.capabilities().supports_caching);
    }

    #[test]
    fn test_status_classification() {
        let provider = OpenAIProvider::from_config(&config(ProviderKind::ChatCompletions)).unwrap();
        let body = r#"{"error": {"message": "boom"}}"#;

        assert!(matches!(provider.classify_status(401, body), LlmError::Auth(_)));
        assert!(matches!(
            provider.classify_status(400, body),
            LlmError::InvalidRequest(_)
        ));
        assert!(matches!(
            provider.classify_status(404, body),
            LlmError::NotFound(_)
        ));
        assert!(matches!(
            provider.classify_status(429, body),
            LlmError::RateLimited(_)
        ));
        assert!(matches!(
            provider.classify_status(503, body),
            LlmError::Server { status: 503, .. }
        ));
        assert!(matches!(
            provider.classify_status(302, body),
            LlmError::Generic(_)
        ));
    }

    #[test]
    fn test_status_classification_unparseable_body() {
        let provider = OpenAIProvider::from_config(&config(ProviderKind::ChatCompletions)).unwrap();
        let err = provider.classify_status(429, "plain text overload");
        assert!(err.to_string().contains("plain text overload"));
    }

    #[test]
    fn test_chat_usage_aliases() {
        // Classic field names map onto the normalised shape.
        let usage: ChatUsage = serde_json::from_str(
            r#"{"prompt_tokens": 12, "completion_tokens": 5,
                "prompt_tokens_details": {"cached_tokens": 4}}"#,
        )
        .unwrap();
        let stats = usage.normalise();
        assert_eq!(stats.input_tokens, 12);
        assert_eq!(stats.output_tokens, 5);
        assert_eq!(stats.cached_tokens, 4);
        assert_eq!(stats.reasoning_tokens, 0);
    }

    #[test]
    fn test_responses_usage_details() {
        let usage: ResponsesUsage = serde_json::from_str(
            r#"{"input_tokens": 100, "output_tokens": 60,
                "input_tokens_details": {"cached_tokens": 80},
                "output_tokens_details": {"reasoning_tokens": 25}}"#,
        )
        .unwrap();
        let stats = usage.normalise();
        assert_eq!(stats.cached_tokens, 80);
        assert_eq!(stats.reasoning_tokens, 25);
    }

    #[test]
    fn test_responses_text_aggregation() {
        let parsed: ResponsesResponse = serde_json::from_str(
            r#"{"id": "resp_1", "output": [
                {"type": "message", "content": [
                    {"type": "output_text", "text": "part one, "},
                    {"type": "output_text", "text": "part two"}
                ]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(parsed.text(), "part one, part two");
        assert_eq!(parsed.id.as_deref(), Some("resp_1"));
    }

    #[test]
    fn test_responses_prefers_output_text() {
        let parsed: ResponsesResponse = serde_json::from_str(
            r#"{"output_text": "direct", "output": [
                {"content": [{"text": "ignored"}]}
            ]}"#,
        )
        .unwrap();
        assert_eq!(parsed.text(), "direct");
    }

    #[test]
    fn test_wire_message_serialization() {
        let messages = vec![ChatMessage::system("sys"), ChatMessage::user("hi")];
        let wire = to_wire(&messages).unwrap();
        let json = serde_json::to_value(&wire).unwrap();
        assert_eq!(json[0]["role"], "system");
        assert_eq!(json[0]["content"], "sys");
        assert_eq!(json[1]["role"], "user");
    }

    #[test]
    fn test_chat_request_skips_unset_params() {
        let messages = to_wire(&[ChatMessage::user("x")]).unwrap();
        let params = CompletionParams::with_temperature(0.5);
        let request = ChatRequest::new("m", messages, &params);
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["temperature"], 0.5);
        assert!(json.get("max_tokens").is_none());
        assert!(json.get("stream").is_none());
        assert!(json.get("previous_response_id").is_none());
    }
}
