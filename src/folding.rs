//! Layered history compression for long conversations.
//!
//! Conversation history is split into three layers:
//!
//! - **hot**: the last `hot_layer_size` turns, kept verbatim;
//! - **warm**: the next `warm_layer_size` turns, compressed with the warm
//!   strategy (rule-based consolidation);
//! - **cold**: everything older, compressed with the cold strategy
//!   (LLM-backed distillation or summarisation).
//!
//! Because hot is volatile while cold and warm change rarely, the resulting
//! `[cold summary, warm, hot]` prefix stays stable across turns, which is
//! what keeps provider-side prefix caches warm. For providers with opt-in
//! caching the last warm message gets the cache-control marker.
//!
//! Distillation failures retry up to `max_distill_retries` and then fall
//! back to consolidation; the fallback is recorded in the stats rather than
//! silently absorbed.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::PrefixCache;
use crate::error::{LlmError, Result};
use crate::fingerprint::sha256_hex;
use crate::traits::{CacheControl, ChatMessage, ChatRole, CompletionParams, LLMProvider};

// ============================================================================
// Configuration
// ============================================================================

/// Compression strategy for the warm layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarmStrategy {
    /// Merge consecutive same-role messages, preserving all text. O(n).
    #[default]
    Consolidate,
    /// Leave the warm layer untouched.
    None,
}

/// Compression strategy for the cold layer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColdStrategy {
    /// LLM call extracting concepts, decisions, and reasoning steps.
    #[default]
    Distill,
    /// LLM call producing a narrative summary.
    Summarize,
    /// Drop the cold layer instead of compressing it.
    None,
}

impl ColdStrategy {
    fn cache_tag(&self) -> &'static str {
        match self {
            ColdStrategy::Distill => "distill",
            ColdStrategy::Summarize => "summarize",
            ColdStrategy::None => "none",
        }
    }
}

fn default_hot() -> usize {
    5
}

fn default_warm() -> usize {
    10
}

fn default_distill_temperature() -> f32 {
    0.3
}

fn default_distill_retries() -> u32 {
    2
}

fn default_cache_ttl() -> u64 {
    3600
}

fn default_true() -> bool {
    true
}

/// Memory-folding configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FoldingConfig {
    /// Master switch; disabled folding passes history through untouched.
    #[serde(default)]
    pub enabled: bool,

    /// Recent turns kept verbatim.
    #[serde(default = "default_hot")]
    pub hot_layer_size: usize,

    /// Mid-term turns compressed with the warm strategy.
    #[serde(default = "default_warm")]
    pub warm_layer_size: usize,

    /// Warm-layer strategy.
    #[serde(default)]
    pub warm_strategy: WarmStrategy,

    /// Cold-layer strategy.
    #[serde(default)]
    pub cold_strategy: ColdStrategy,

    /// Model used for distillation/summarisation; falls back to the
    /// engine's default model when unset.
    #[serde(default)]
    pub distill_model: Option<String>,

    /// Temperature for distillation calls.
    #[serde(default = "default_distill_temperature")]
    pub distill_temperature: f32,

    /// Distillation attempts before the consolidate fallback.
    #[serde(default = "default_distill_retries")]
    pub max_distill_retries: u32,

    /// TTL for cached compression artefacts.
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_seconds: u64,

    /// Merge consecutive same-role messages during consolidation.
    #[serde(default = "default_true")]
    pub merge_consecutive_roles: bool,
}

impl Default for FoldingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            hot_layer_size: default_hot(),
            warm_layer_size: default_warm(),
            warm_strategy: WarmStrategy::default(),
            cold_strategy: ColdStrategy::default(),
            distill_model: None,
            distill_temperature: default_distill_temperature(),
            max_distill_retries: default_distill_retries(),
            cache_ttl_seconds: default_cache_ttl(),
            merge_consecutive_roles: true,
        }
    }
}

impl FoldingConfig {
    /// Validate parameter ranges.
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=2.0).contains(&self.distill_temperature) {
            return Err(LlmError::InvalidRequest(format!(
                "distill_temperature must be in [0.0, 2.0] (got {})",
                self.distill_temperature
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Stats
// ============================================================================

/// Statistics from one folding pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldingStats {
    /// Estimated tokens before compression.
    pub original_tokens: u64,
    /// Estimated tokens after compression.
    pub compressed_tokens: u64,
    /// Tokens spent on distillation/summarisation calls.
    pub distillation_tokens: u64,
    /// Distillation attempts that fell back to consolidation.
    pub distill_fallbacks: u32,
}

impl FoldingStats {
    /// Tokens saved by compression (never negative).
    pub fn saved_tokens(&self) -> u64 {
        self.original_tokens.saturating_sub(self.compressed_tokens)
    }

    /// Savings net of distillation cost. May be negative.
    pub fn net_saved_tokens(&self) -> i64 {
        self.saved_tokens() as i64 - self.distillation_tokens as i64
    }
}

// ============================================================================
// Pure helpers
// ============================================================================

/// Rough token estimate: chars / 4 plus per-message structural overhead.
pub fn estimate_tokens(messages: &[ChatMessage]) -> u64 {
    let chars: usize = messages.iter().map(|m| m.text().len()).sum();
    (chars / 4 + messages.len() * 10) as u64
}

/// Merge consecutive same-role messages, preserving all text.
pub fn consolidate(messages: &[ChatMessage], merge_consecutive_roles: bool) -> Vec<ChatMessage> {
    if messages.is_empty() || !merge_consecutive_roles {
        return messages.to_vec();
    }

    let mut out: Vec<ChatMessage> = Vec::new();
    let mut current_role: Option<ChatRole> = None;
    let mut current_texts: Vec<String> = Vec::new();

    let flush = |role: Option<ChatRole>, texts: &mut Vec<String>, out: &mut Vec<ChatMessage>| {
        if let Some(role) = role {
            if !texts.is_empty() {
                let content = texts.join("\n\n");
                out.push(ChatMessage {
                    role,
                    content: crate::traits::MessageContent::Text(content),
                    cache_control: None,
                });
                texts.clear();
            }
        }
    };

    for msg in messages {
        if Some(msg.role) == current_role {
            current_texts.push(msg.text());
        } else {
            flush(current_role, &mut current_texts, &mut out);
            current_role = Some(msg.role);
            current_texts.push(msg.text());
        }
    }
    flush(current_role, &mut current_texts, &mut out);
    out
}

fn format_as_transcript(messages: &[ChatMessage]) -> String {
    messages
        .iter()
        .map(|m| format!("{}: {}", m.role.as_str().to_uppercase(), m.text()))
        .collect::<Vec<_>>()
        .join("\n\n")
}

fn layer_hash(messages: &[ChatMessage], distill_model: &str) -> String {
    let serialized =
        serde_json::to_string(messages).unwrap_or_else(|_| format_as_transcript(messages));
    sha256_hex(&format!("{}|{}", serialized, distill_model))
}

fn distill_prompt(transcript: &str) -> String {
    format!(
        "Extract the core concepts, key decisions, and critical reasoning steps \
         from the following conversation history.\n\n\
         Focus on:\n\
         1. Key decisions and conclusions\n\
         2. Important reasoning steps and logic\n\
         3. Core concepts and definitions\n\
         4. Unresolved questions or issues\n\n\
         Be concise. Only preserve information valuable for future context.\n\n\
         Conversation History:\n{}\n\nDistilled Summary:",
        transcript
    )
}

fn summarize_prompt(transcript: &str) -> String {
    format!(
        "Summarize the following conversation history, preserving key \
         information and context.\n\n\
         Include:\n\
         1. Main topics discussed\n\
         2. Important questions and answers\n\
         3. Key decisions or conclusions\n\
         4. Relevant context for future messages\n\n\
         Conversation History:\n{}\n\nSummary:",
        transcript
    )
}

// ============================================================================
// Manager
// ============================================================================

/// Folds conversation history into the hot/warm/cold layer structure.
pub struct MemoryFolding {
    config: FoldingConfig,
    cache: Arc<PrefixCache>,
    provider: Arc<dyn LLMProvider>,
    /// Model used when the config names no dedicated distillation model.
    default_model: String,
}

impl MemoryFolding {
    /// Create a folding manager.
    pub fn new(
        config: FoldingConfig,
        cache: Arc<PrefixCache>,
        provider: Arc<dyn LLMProvider>,
        default_model: impl Into<String>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            cache,
            provider,
            default_model: default_model.into(),
        })
    }

    /// Folding configuration.
    pub fn config(&self) -> &FoldingConfig {
        &self.config
    }

    fn distill_model(&self) -> &str {
        self.config
            .distill_model
            .as_deref()
            .unwrap_or(&self.default_model)
    }

    /// Split messages into (cold, warm, hot) slices.
    fn layer<'a>(
        &self,
        messages: &'a [ChatMessage],
    ) -> (&'a [ChatMessage], &'a [ChatMessage], &'a [ChatMessage]) {
        let total = messages.len();
        let hot = self.config.hot_layer_size;
        let warm = self.config.warm_layer_size;

        if total <= hot {
            return (&[], &[], messages);
        }
        if total <= hot + warm {
            let split = total - hot;
            return (&[], &messages[..split], &messages[split..]);
        }
        let cold_end = total - hot - warm;
        let warm_end = total - hot;
        (
            &messages[..cold_end],
            &messages[cold_end..warm_end],
            &messages[warm_end..],
        )
    }

    /// Fold a history into `[cold summary?, warm…, hot…]` plus stats.
    pub async fn fold(&self, history: &[ChatMessage]) -> Result<(Vec<ChatMessage>, FoldingStats)> {
        if !self.config.enabled || history.is_empty() {
            return Ok((history.to_vec(), FoldingStats::default()));
        }

        let mut stats = FoldingStats {
            original_tokens: estimate_tokens(history),
            ..FoldingStats::default()
        };

        let (cold, warm, hot) = self.layer(history);

        let mut folded = Vec::with_capacity(warm.len() + hot.len() + 1);
        if let Some(summary) = self.compress_cold(cold, &mut stats).await? {
            folded.push(ChatMessage::system(summary));
        }
        match self.config.warm_strategy {
            WarmStrategy::Consolidate => {
                folded.extend(consolidate(warm, self.config.merge_consecutive_roles))
            }
            WarmStrategy::None => folded.extend_from_slice(warm),
        }
        folded.extend_from_slice(hot);

        stats.compressed_tokens = estimate_tokens(&folded);
        Ok((folded, stats))
    }

    async fn compress_cold(
        &self,
        cold: &[ChatMessage],
        stats: &mut FoldingStats,
    ) -> Result<Option<String>> {
        if cold.is_empty() || self.config.cold_strategy == ColdStrategy::None {
            return Ok(None);
        }

        let hash = layer_hash(cold, self.distill_model());
        let tag = self.config.cold_strategy.cache_tag();
        if let Some(cached) = self.cache.get_fold(&hash, tag).await {
            debug!(hash = &hash[..16], strategy = tag, "cold layer cache hit");
            return Ok(Some(cached));
        }

        let transcript = format_as_transcript(cold);
        let prompt = match self.config.cold_strategy {
            ColdStrategy::Distill => distill_prompt(&transcript),
            ColdStrategy::Summarize => summarize_prompt(&transcript),
            ColdStrategy::None => unreachable!(),
        };

        let fallbacks_before = stats.distill_fallbacks;
        let summary = self.run_compression(cold, &prompt, stats).await;

        // Fallback output is not cached: the next pass should retry
        // distillation once the provider recovers.
        if stats.distill_fallbacks == fallbacks_before {
            self.cache
                .set_fold(
                    &hash,
                    tag,
                    &summary,
                    Duration::from_secs(self.config.cache_ttl_seconds),
                )
                .await;
        }
        Ok(Some(summary))
    }

    /// Call the distillation model, retrying; fall back to consolidation on
    /// exhaustion (the one documented degradation, marked in stats).
    async fn run_compression(
        &self,
        cold: &[ChatMessage],
        prompt: &str,
        stats: &mut FoldingStats,
    ) -> String {
        let messages = [ChatMessage::user(prompt.to_string())];
        let params = CompletionParams::with_temperature(self.config.distill_temperature);
        let attempts = self.config.max_distill_retries.max(1);

        for attempt in 1..=attempts {
            match self
                .provider
                .chat(self.distill_model(), &messages, &params)
                .await
            {
                Ok(outcome) => {
                    stats.distillation_tokens += outcome.usage.total_tokens();
                    return outcome.text;
                }
                Err(e) => {
                    warn!(attempt, attempts, error = %e, "distillation attempt failed");
                }
            }
        }

        stats.distill_fallbacks += 1;
        format_as_transcript(&consolidate(cold, self.config.merge_consecutive_roles))
    }

    /// Insert the cache-control marker on the last message before the hot
    /// layer, so `[system, cold, warm]` participates in provider caching.
    pub fn apply_cache_control(&self, messages: &mut [ChatMessage]) {
        let hot = self.config.hot_layer_size;
        if messages.len() <= hot {
            return;
        }
        let position = messages.len() - hot - 1;
        if messages[position].role != ChatRole::System {
            messages[position].cache_control = Some(CacheControl::ephemeral());
        }
    }
}
