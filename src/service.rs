//! Orchestration facade exposed to the HTTP layer.
//!
//! Five operations: `resolve`, `chat_completion`, `responses_call` (emulated
//! through chat when the provider lacks the endpoint), `run_deepthink`, and
//! `run_ultrathink`. Each engine run gets request-scoped metering and a
//! fresh engine; providers, the rate-limiter registry, and the disk cache
//! are shared process-wide.
//!
//! Rate-limit configuration precedence: request override > model `rpm` >
//! system defaults.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::PrefixCache;
use crate::config::{Config, ModelConfig};
use crate::engine::{DeepThinkEngine, DeepThinkResult, UltraThinkEngine, UltraThinkResult};
use crate::error::Result;
use crate::folding::{FoldingConfig, MemoryFolding};
use crate::meter::{MeterSummary, TokenMeter};
use crate::rate_limiter::{render_bucket_key, AcquireStrategy, RateLimiterRegistry};
use crate::registry::ProviderRegistry;
use crate::traits::{ChatMessage, ChatOutcome, CompletionParams, LLMProvider, ResponseOutcome};

/// Per-request rate-limit override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitOverride {
    /// Token-bucket refill rate (tokens/sec).
    #[serde(default)]
    pub qps: Option<f64>,
    /// Token-bucket burst capacity.
    #[serde(default)]
    pub burst: Option<u32>,
    /// Max seconds to wait for admission.
    #[serde(default)]
    pub timeout: Option<f64>,
    /// Admission strategy.
    #[serde(default)]
    pub strategy: Option<AcquireStrategy>,
    /// Bucket-key override (defaults to the rendered template).
    #[serde(default)]
    pub bucket_key: Option<String>,
    /// Sliding-window event cap.
    #[serde(default)]
    pub window_limit: Option<usize>,
    /// Sliding-window length in seconds.
    #[serde(default)]
    pub window_seconds: Option<f64>,
}

fn default_true() -> bool {
    true
}

/// Per-request engine overrides; unset fields fall back to model config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineOverrides {
    /// Prior conversation history.
    #[serde(default)]
    pub history: Vec<ChatMessage>,
    /// Knowledge context for the system prompt.
    #[serde(default)]
    pub knowledge_context: Option<String>,
    /// Iteration cap.
    #[serde(default)]
    pub max_iterations: Option<u32>,
    /// Required consecutive verification passes.
    #[serde(default)]
    pub required_verifications: Option<u32>,
    /// Error budget.
    #[serde(default)]
    pub max_errors: Option<u32>,
    /// UltraThink worker count.
    #[serde(default)]
    pub num_agents: Option<u32>,
    /// UltraThink worker concurrency bound.
    #[serde(default)]
    pub parallel_run_agents: Option<u32>,
    /// Majority-of-3 verification.
    #[serde(default)]
    pub parallel_verification: Option<bool>,
    /// Sampling parameters.
    #[serde(default)]
    pub params: CompletionParams,
    /// Rate-limit override block.
    #[serde(default)]
    pub rate_limit: Option<RateLimitOverride>,
    /// Request deadline in seconds from now.
    #[serde(default)]
    pub timeout_seconds: Option<f64>,
    /// Memory-folding configuration.
    #[serde(default)]
    pub folding: Option<FoldingConfig>,
    /// Serve repeated identical calls from the local content cache.
    #[serde(default = "default_true")]
    pub use_content_cache: bool,
}

impl Default for EngineOverrides {
    fn default() -> Self {
        Self {
            history: Vec::new(),
            knowledge_context: None,
            max_iterations: None,
            required_verifications: None,
            max_errors: None,
            num_agents: None,
            parallel_run_agents: None,
            parallel_verification: None,
            params: CompletionParams::default(),
            rate_limit: None,
            timeout_seconds: None,
            folding: None,
            use_content_cache: true,
        }
    }
}

/// DeepThink run plus its request-scoped accounting.
#[derive(Debug, Clone, Serialize)]
pub struct DeepThinkRun {
    /// Engine result.
    pub result: DeepThinkResult,
    /// Full usage/cost breakdown for the request.
    pub usage: MeterSummary,
    /// Total estimated cost in USD.
    pub estimated_cost: f64,
}

/// UltraThink run plus its request-scoped accounting.
#[derive(Debug, Clone, Serialize)]
pub struct UltraThinkRun {
    /// Engine result.
    pub result: UltraThinkResult,
    /// Full usage/cost breakdown for the request.
    pub usage: MeterSummary,
    /// Total estimated cost in USD.
    pub estimated_cost: f64,
}

struct LimiterSetup {
    limiter: Option<Arc<RateLimiterRegistry>>,
    strategy: AcquireStrategy,
    timeout: Option<Duration>,
    bucket_key: String,
}

/// The reasoning-orchestration core.
pub struct Orchestrator {
    config: Arc<Config>,
    registry: ProviderRegistry,
    cache: Arc<PrefixCache>,
    limiter: Arc<RateLimiterRegistry>,
}

impl Orchestrator {
    /// Create an orchestrator sharing the process-wide limiter registry.
    pub fn new(config: Arc<Config>, cache: Arc<PrefixCache>) -> Self {
        Self::with_limiter(config, cache, RateLimiterRegistry::global())
    }

    /// Create an orchestrator with an explicit limiter registry (tests).
    pub fn with_limiter(
        config: Arc<Config>,
        cache: Arc<PrefixCache>,
        limiter: Arc<RateLimiterRegistry>,
    ) -> Self {
        Self {
            registry: ProviderRegistry::new(config.clone()),
            config,
            cache,
            limiter,
        }
    }

    /// Provider registry (for pre-registering instances).
    pub fn registry(&self) -> &ProviderRegistry {
        &self.registry
    }

    /// Loaded configuration.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    /// Resolve a logical model id to its provider instance and underlying
    /// model name.
    pub fn resolve(&self, model_id: &str) -> Result<(Arc<dyn LLMProvider>, String)> {
        let (provider, model) = self.registry.resolve(model_id)?;
        Ok((provider, model.underlying_model))
    }

    /// Thin pass-through chat completion.
    pub async fn chat_completion(
        &self,
        model_id: &str,
        messages: &[ChatMessage],
        params: &CompletionParams,
    ) -> Result<ChatOutcome> {
        let (provider, model) = self.registry.resolve(model_id)?;
        provider.chat(&model.underlying_model, messages, params).await
    }

    /// Responses call, emulated through chat when the provider lacks the
    /// endpoint (no response id is returned in that case).
    pub async fn responses_call(
        &self,
        model_id: &str,
        input: &[ChatMessage],
        params: &CompletionParams,
        store: bool,
        previous_response_id: Option<&str>,
    ) -> Result<ResponseOutcome> {
        let (provider, model) = self.registry.resolve(model_id)?;
        if provider.capabilities().supports_responses {
            return provider
                .response(&model.underlying_model, input, params, store, previous_response_id)
                .await;
        }
        let outcome = provider.chat(&model.underlying_model, input, params).await?;
        Ok(ResponseOutcome {
            text: outcome.text,
            response_id: None,
            usage: outcome.usage,
            raw: outcome.raw,
        })
    }

    async fn setup_limiter(
        &self,
        overrides: &EngineOverrides,
        model: &ModelConfig,
        provider_name: &str,
    ) -> LimiterSetup {
        let defaults = &self.config.rate_limit;
        let request = overrides.rate_limit.as_ref();

        let bucket_key = request
            .and_then(|r| r.bucket_key.clone())
            .unwrap_or_else(|| {
                render_bucket_key(&defaults.bucket_template, provider_name, &model.underlying_model)
            });
        let strategy = request
            .and_then(|r| r.strategy)
            .unwrap_or(defaults.strategy);
        let timeout = request
            .and_then(|r| r.timeout)
            .or(defaults.timeout)
            .map(Duration::from_secs_f64);

        let mut configured = false;

        // Token bucket: request override beats model rpm beats defaults.
        if let (Some(qps), Some(burst)) =
            (request.and_then(|r| r.qps), request.and_then(|r| r.burst))
        {
            self.limiter.configure_bucket(&bucket_key, qps, burst).await;
            configured = true;
        } else if let Some(rpm) = model.rpm {
            self.limiter.configure_rpm(&bucket_key, rpm).await;
            configured = true;
        } else if let (Some(qps), Some(burst)) = (defaults.qps, defaults.burst) {
            self.limiter.configure_bucket(&bucket_key, qps, burst).await;
            configured = true;
        }

        // Sliding window: request override beats defaults.
        let window_limit = request.and_then(|r| r.window_limit).or(defaults.window_limit);
        let window_seconds = request
            .and_then(|r| r.window_seconds)
            .or(defaults.window_seconds);
        if let (Some(limit), Some(seconds)) = (window_limit, window_seconds) {
            self.limiter
                .configure_window(&bucket_key, limit, seconds)
                .await;
            configured = true;
        }

        LimiterSetup {
            limiter: configured.then(|| self.limiter.clone()),
            strategy,
            timeout,
            bucket_key,
        }
    }

    fn build_folding(
        &self,
        overrides: &EngineOverrides,
        provider: &Arc<dyn LLMProvider>,
        model: &ModelConfig,
    ) -> Result<Option<Arc<MemoryFolding>>> {
        match &overrides.folding {
            Some(config) => Ok(Some(Arc::new(MemoryFolding::new(
                config.clone(),
                self.cache.clone(),
                provider.clone(),
                model.underlying_model.clone(),
            )?))),
            None => Ok(None),
        }
    }

    /// Run the single-agent solve/verify/correct engine.
    pub async fn run_deepthink(
        &self,
        model_id: &str,
        problem: &str,
        overrides: &EngineOverrides,
    ) -> Result<DeepThinkRun> {
        let (provider, model) = self.registry.resolve(model_id)?;
        let meter = Arc::new(TokenMeter::new(self.config.pricing.clone()));
        let setup = self.setup_limiter(overrides, &model, provider.name()).await;

        let mut engine =
            DeepThinkEngine::new(provider.clone(), model.underlying_model.clone(), problem)
                .with_history(overrides.history.clone())
                .with_stage_models(model.stage_models.clone())
                .with_limits(
                    overrides.max_iterations.unwrap_or(model.max_iterations),
                    overrides
                        .required_verifications
                        .unwrap_or(model.required_verifications),
                    overrides.max_errors.unwrap_or(model.max_errors),
                )
                .with_parallel_verification(
                    overrides
                        .parallel_verification
                        .unwrap_or(model.enable_parallel_check),
                )
                .with_params(overrides.params.clone())
                .with_meter(meter.clone())
                .with_cache(self.cache.clone())
                .with_content_cache(overrides.use_content_cache)
                .with_bucket_template(self.config.rate_limit.bucket_template.clone())
                .with_bucket_key(setup.bucket_key.clone());

        if let Some(knowledge) = &overrides.knowledge_context {
            engine = engine.with_knowledge(knowledge.clone());
        }
        if let Some(folding) = self.build_folding(overrides, &provider, &model)? {
            engine = engine.with_folding(folding);
        }
        if let Some(limiter) = setup.limiter {
            engine = engine.with_rate_limiter(limiter, setup.strategy, setup.timeout);
        }
        if let Some(seconds) = overrides.timeout_seconds {
            engine = engine.with_deadline(Instant::now() + Duration::from_secs_f64(seconds));
        }

        let result = engine.run().await?;
        let usage = meter.summary();
        let estimated_cost = usage.total_cost_usd;
        Ok(DeepThinkRun {
            result,
            usage,
            estimated_cost,
        })
    }

    /// Run the multi-agent plan/fan-out/synthesise engine.
    pub async fn run_ultrathink(
        &self,
        model_id: &str,
        problem: &str,
        overrides: &EngineOverrides,
    ) -> Result<UltraThinkRun> {
        let (provider, model) = self.registry.resolve(model_id)?;
        let meter = Arc::new(TokenMeter::new(self.config.pricing.clone()));
        let setup = self.setup_limiter(overrides, &model, provider.name()).await;

        let num_agents = overrides
            .num_agents
            .or(model.num_agents)
            .unwrap_or(3);

        let mut engine =
            UltraThinkEngine::new(provider.clone(), model.underlying_model.clone(), problem)
                .with_history(overrides.history.clone())
                .with_stage_models(model.stage_models.clone())
                .with_agents(
                    num_agents,
                    overrides
                        .parallel_run_agents
                        .unwrap_or(model.parallel_run_agents),
                )
                .with_agent_limits(
                    overrides.max_iterations.unwrap_or(model.max_iterations),
                    overrides
                        .required_verifications
                        .unwrap_or(model.required_verifications),
                    overrides.max_errors.unwrap_or(model.max_errors),
                )
                .with_parallel_verification(
                    overrides
                        .parallel_verification
                        .unwrap_or(model.enable_parallel_check),
                )
                .with_params(overrides.params.clone())
                .with_meter(meter.clone())
                .with_cache(self.cache.clone())
                .with_content_cache(overrides.use_content_cache)
                .with_bucket_template(self.config.rate_limit.bucket_template.clone())
                .with_bucket_key(setup.bucket_key.clone());

        if let Some(knowledge) = &overrides.knowledge_context {
            engine = engine.with_knowledge(knowledge.clone());
        }
        if let Some(folding) = self.build_folding(overrides, &provider, &model)? {
            engine = engine.with_folding(folding);
        }
        if let Some(limiter) = setup.limiter {
            engine = engine.with_rate_limiter(limiter, setup.strategy, setup.timeout);
        }
        if let Some(seconds) = overrides.timeout_seconds {
            engine = engine.with_deadline(Instant::now() + Duration::from_secs_f64(seconds));
        }

        let result = engine.run().await?;
        let usage = meter.summary();
        let estimated_cost = usage.total_cost_usd;
        Ok(UltraThinkRun {
            result,
            usage,
            estimated_cost,
        })
    }
}
