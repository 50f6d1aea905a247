//! Scripted provider for tests.
//!
//! The mock pops queued scripts in order (texts or errors), falls back to a
//! default response when the queue is empty, and records every call it
//! receives. A high-water mark of concurrent in-flight calls supports
//! fan-out concurrency assertions, and the fake responses endpoint reports
//! cached tokens whenever a `previous_response_id` is chained, mirroring
//! server-side prefix caching.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::error::{LlmError, Result};
use crate::meter::UsageStats;
use crate::traits::{
    ChatMessage, ChatOutcome, CompletionParams, LLMProvider, ProviderCapabilities, ResponseOutcome,
};

/// One recorded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockCall {
    /// Endpoint used: `"chat"` or `"response"`.
    pub endpoint: &'static str,
    /// Model the call targeted.
    pub model: String,
    /// Chained response id, when the responses endpoint was used.
    pub previous_response_id: Option<String>,
    /// Whether any message carried a cache-control marker.
    pub cache_marked: bool,
}

#[derive(Debug)]
enum Script {
    Text(String),
    Error(LlmError),
}

/// Scripted LLM provider.
pub struct MockProvider {
    name: String,
    capabilities: ProviderCapabilities,
    latency: Option<Duration>,
    queue: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<MockCall>>,
    response_counter: AtomicU64,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProvider {
    /// A chat-only mock named `"mock"`.
    pub fn new() -> Self {
        Self {
            name: "mock".to_string(),
            capabilities: ProviderCapabilities::default(),
            latency: None,
            queue: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            response_counter: AtomicU64::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Rename the provider instance.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable the fake responses endpoint (and caching capability).
    pub fn with_responses_api(mut self) -> Self {
        self.capabilities.supports_responses = true;
        self.capabilities.supports_caching = true;
        self
    }

    /// Mark the provider as caching-capable (messages-style).
    pub fn with_caching(mut self) -> Self {
        self.capabilities.supports_caching = true;
        self
    }

    /// Add artificial latency to every call.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queue a scripted response text.
    pub async fn add_response(&self, text: impl Into<String>) {
        self.queue.lock().await.push_back(Script::Text(text.into()));
    }

    /// Queue `count` scripted failures.
    pub async fn fail_next(&self, count: u32, error: LlmError) {
        let mut queue = self.queue.lock().await;
        for _ in 0..count {
            queue.push_back(Script::Error(error.clone()));
        }
    }

    /// Every call recorded so far.
    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    /// Total number of calls received.
    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    /// Highest number of calls that were in flight simultaneously.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    fn usage_for(messages: &[ChatMessage], reply: &str, cached: u64) -> UsageStats {
        let input: usize = messages.iter().map(|m| m.text().len()).sum();
        UsageStats {
            input_tokens: (input / 4).max(1) as u64,
            output_tokens: (reply.len() / 4).max(1) as u64,
            cached_tokens: cached,
            reasoning_tokens: 0,
        }
    }

    async fn next_script(&self) -> Result<String> {
        match self.queue.lock().await.pop_front() {
            Some(Script::Text(text)) => Ok(text),
            Some(Script::Error(err)) => Err(err),
            None => Ok("Mock response".to_string()),
        }
    }

    async fn enter(&self) {
        let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(current, Ordering::SeqCst);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn leave(&self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities
    }

    fn max_retries(&self) -> u32 {
        0
    }

    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        _params: &CompletionParams,
    ) -> Result<ChatOutcome> {
        self.enter().await;
        self.calls.lock().await.push(MockCall {
            endpoint: "chat",
            model: model.to_string(),
            previous_response_id: None,
            cache_marked: messages.iter().any(|m| m.cache_control.is_some()),
        });
        let script = self.next_script().await;
        self.leave();
        let text = script?;
        let usage = Self::usage_for(messages, &text, 0);
        Ok(ChatOutcome {
            raw: serde_json::json!({"mock": true, "model": model}),
            text,
            usage,
        })
    }

    async fn response(
        &self,
        model: &str,
        input_messages: &[ChatMessage],
        _params: &CompletionParams,
        _store: bool,
        previous_response_id: Option<&str>,
    ) -> Result<ResponseOutcome> {
        if !self.capabilities.supports_responses {
            return Err(LlmError::InvalidRequest(
                "mock provider configured without responses endpoint".to_string(),
            ));
        }
        self.enter().await;
        self.calls.lock().await.push(MockCall {
            endpoint: "response",
            model: model.to_string(),
            previous_response_id: previous_response_id.map(str::to_string),
            cache_marked: input_messages.iter().any(|m| m.cache_control.is_some()),
        });
        let script = self.next_script().await;
        self.leave();
        let text = script?;

        // Chained requests behave as if the shared prefix was served from
        // the provider-side cache.
        let mut usage = Self::usage_for(input_messages, &text, 0);
        if previous_response_id.is_some() {
            usage.cached_tokens = (usage.input_tokens / 2).max(1);
        }

        let id = self.response_counter.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ResponseOutcome {
            raw: serde_json::json!({"mock": true, "model": model}),
            text,
            response_id: Some(format!("resp-{}", id)),
            usage,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_responses_in_order() {
        let mock = MockProvider::new();
        mock.add_response("first").await;
        mock.add_response("second").await;

        let params = CompletionParams::default();
        let messages = [ChatMessage::user("hi")];
        assert_eq!(mock.chat("m", &messages, &params).await.unwrap().text, "first");
        assert_eq!(mock.chat("m", &messages, &params).await.unwrap().text, "second");
        // Queue exhausted: default response.
        assert_eq!(
            mock.chat("m", &messages, &params).await.unwrap().text,
            "Mock response"
        );
    }

    #[tokio::test]
    async fn test_scripted_errors() {
        let mock = MockProvider::new();
        mock.fail_next(2, LlmError::RateLimited("scripted".into())).await;
        mock.add_response("after errors").await;

        let params = CompletionParams::default();
        let messages = [ChatMessage::user("hi")];
        assert!(mock.chat("m", &messages, &params).await.is_err());
        assert!(mock.chat("m", &messages, &params).await.is_err());
        assert_eq!(
            mock.chat("m", &messages, &params).await.unwrap().text,
            "after errors"
        );
    }

    #[tokio::test]
    async fn test_call_recording() {
        let mock = MockProvider::new().with_responses_api();
        let params = CompletionParams::default();
        let messages = [ChatMessage::user("hi")];

        mock.chat("chat-model", &messages, &params).await.unwrap();
        mock.response("resp-model", &messages, &params, true, Some("resp-1"))
            .await
            .unwrap();

        let calls = mock.calls().await;
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].endpoint, "chat");
        assert_eq!(calls[1].endpoint, "response");
        assert_eq!(calls[1].previous_response_id.as_deref(), Some("resp-1"));
    }

    #[tokio::test]
    async fn test_response_ids_increment() {
        let mock = MockProvider::new().with_responses_api();
        let params = CompletionParams::default();
        let messages = [ChatMessage::user("hi")];

        let r1 = mock.response("m", &messages, &params, true, None).await.unwrap();
        let r2 = mock.response("m", &messages, &params, true, None).await.unwrap();
        assert_eq!(r1.response_id.as_deref(), Some("resp-1"));
        assert_eq!(r2.response_id.as_deref(), Some("resp-2"));
        // Unchained requests report no cached tokens.
        assert_eq!(r1.usage.cached_tokens, 0);
    }

    #[tokio::test]
    async fn test_chained_response_reports_cached_tokens() {
        let mock = MockProvider::new().with_responses_api();
        let params = CompletionParams::default();
        let messages = [ChatMessage::user("a reasonably sized prompt body")];

        let chained = mock
            .response("m", &messages, &params, true, Some("resp-1"))
            .await
            .unwrap();
        assert!(chained.usage.cached_tokens >= 1);
        assert!(chained.usage.cached_tokens <= chained.usage.input_tokens);
    }

    #[tokio::test]
    async fn test_response_endpoint_requires_capability() {
        let mock = MockProvider::new();
        let params = CompletionParams::default();
        let err = mock
            .response("m", &[ChatMessage::user("x")], &params, false, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_in_flight_high_water_mark() {
        use std::sync::Arc;
        let mock = Arc::new(MockProvider::new().with_latency(Duration::from_millis(30)));
        let params = CompletionParams::default();

        let mut handles = Vec::new();
        for _ in 0..4 {
            let mock = mock.clone();
            let params = params.clone();
            handles.push(tokio::spawn(async move {
                mock.chat("m", &[ChatMessage::user("x")], &params).await
            }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(mock.max_in_flight() >= 2);
        assert!(mock.max_in_flight() <= 4);
    }

    #[tokio::test]
    async fn test_usage_scales_with_text() {
        let mock = MockProvider::new();
        mock.add_response("a".repeat(400)).await;
        let outcome = mock
            .chat(
                "m",
                &[ChatMessage::user("b".repeat(100))],
                &CompletionParams::default(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.usage.input_tokens, 25);
        assert_eq!(outcome.usage.output_tokens, 100);
    }
}
