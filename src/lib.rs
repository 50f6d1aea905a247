//! Mindforge - Reasoning Orchestration for Multi-Provider Thinking Servers
//!
//! This crate is the core of a backend that accepts a natural-language
//! problem (typically mathematical or physics reasoning) and returns a
//! verified solution by coordinating many LLM calls across heterogeneous
//! providers under strict budgets.
//!
//! # Engines
//!
//! - **DeepThink** ([`DeepThinkEngine`]): a single-agent iterative
//!   solve/verify/correct loop with stage-routed model selection.
//! - **UltraThink** ([`UltraThinkEngine`]): a planner that fans out N
//!   diverse DeepThink workers in parallel and synthesises their outputs.
//!
//! # Supporting subsystems
//!
//! | Module | Responsibility |
//! |--------|----------------|
//! | [`providers`] | Three wire protocols behind one capability-typed trait |
//! | [`cache`] | Persistent prefix cache (content + response-id chaining) |
//! | [`rate_limiter`] | Per-bucket token-bucket and sliding-window admission |
//! | [`folding`] | Hot/warm/cold history compression |
//! | [`meter`] | Usage accounting and cost estimation |
//! | [`registry`] | Logical model-id resolution |
//! | [`error`] | Provider-neutral error taxonomy |
//!
//! # Example
//!
//! ```ignore
//! use mindforge::{Config, EngineOverrides, Orchestrator, PrefixCache};
//! use std::sync::Arc;
//!
//! let config = Arc::new(Config::from_yaml(&config_path, Some(&pricing_path))?);
//! let cache = Arc::new(PrefixCache::open(cache_root)?);
//! let service = Orchestrator::new(config, cache);
//!
//! let run = service
//!     .run_deepthink("deep-default", "2 + 2 = ?", &EngineOverrides::default())
//!     .await?;
//! println!("{} (${:.4})", run.result.summary, run.estimated_cost);
//! ```
//!
//! The HTTP surface, YAML file discovery, and process bootstrap are thin
//! adapters around [`Orchestrator`] and live outside this crate.

pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod folding;
pub mod meter;
pub mod providers;
pub mod rate_limiter;
pub mod registry;
pub mod retry;
pub mod service;
pub mod traits;

pub use cache::PrefixCache;
pub use config::{
    Config, ConfigError, EngineLevel, ModelConfig, ProviderConfig, ProviderKind,
    RateLimitDefaults, ValidationReport,
};
pub use engine::{
    AgentResult, AgentSpec, DeepThinkEngine, DeepThinkResult, Stage, UltraThinkEngine,
    UltraThinkResult, VerificationRecord,
};
pub use error::{ErrorPayload, LlmError, Result, RetryStrategy};
pub use folding::{ColdStrategy, FoldingConfig, FoldingStats, MemoryFolding, WarmStrategy};
pub use meter::{MeterSummary, PricingEntry, PricingTable, TokenMeter, UsageStats};
pub use providers::{AnthropicProvider, MockProvider, OpenAIProvider};
pub use rate_limiter::{AcquireStrategy, RateLimiterRegistry};
pub use registry::ProviderRegistry;
pub use retry::RetryExecutor;
pub use service::{
    DeepThinkRun, EngineOverrides, Orchestrator, RateLimitOverride, UltraThinkRun,
};
pub use traits::{
    CacheControl, ChatChunk, ChatMessage, ChatOutcome, ChatRole, CompletionParams, ContentPart,
    ImageUrl, LLMProvider, MessageContent, ProviderCapabilities, ResponseOutcome,
};
