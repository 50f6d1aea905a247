//! UltraThink: multi-agent parallel exploration with synthesis.
//!
//! Pipeline:
//!
//! 1. **plan** — one call producing a free-text high-level plan;
//! 2. **agent_config** — one call whose output must be *strictly* a JSON
//!    array of exactly `num_agents` configurations (any parse failure or
//!    wrong shape fails the run with `InvalidRequest`, no fallback);
//! 3. **fan-out** — `num_agents` DeepThink workers, each seeded with its
//!    configuration and the shared plan as knowledge, bounded by a
//!    `parallel_run_agents` semaphore;
//! 4. **synthesis** — one call over the plan, problem, and every agent
//!    solution;
//! 5. **summary** — one user-facing call.
//!
//! Workers are independent: one failing does not cancel its siblings, and
//! results are reported in `agent_id` order regardless of completion
//! order. Exceeding the request deadline fails the whole run with
//! `Timeout` — partial results are never returned.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::cache::PrefixCache;
use crate::engine::deep_think::DeepThinkEngine;
use crate::engine::prompts::{
    agent_config_prompt, final_summary_prompt, synthesis_user_prompt, PLAN_PROMPT,
    SYNTHESIZE_PROMPT,
};
use crate::engine::Stage;
use crate::error::{LlmError, Result};
use crate::fingerprint::fingerprint;
use crate::folding::MemoryFolding;
use crate::meter::{TokenMeter, UsageStats};
use crate::rate_limiter::{render_bucket_key, AcquireStrategy, RateLimiterRegistry};
use crate::retry::RetryExecutor;
use crate::traits::{ChatMessage, CompletionParams, LLMProvider};

/// One agent configuration produced by the agent_config stage.
///
/// The parse is strict at the array level (it must be a JSON array of
/// exactly `num_agents` objects with a `system_prompt`); unknown extra
/// fields are tolerated since models decorate freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    /// Agent-specific system guidance enforcing approach diversity.
    pub system_prompt: String,
    /// Temperature override for this agent.
    #[serde(default)]
    pub temperature: Option<f32>,
    /// Underlying-model override for this agent.
    #[serde(default)]
    pub model_override: Option<String>,
    /// Sampling seed for this agent.
    #[serde(default)]
    pub seed: Option<u64>,
}

/// Outcome of one DeepThink worker within an UltraThink run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    /// Stable worker id (`agent-1` … `agent-N`).
    pub agent_id: String,
    /// The worker's best candidate solution (empty if the worker failed).
    pub final_solution: String,
    /// The worker's own summary of its reasoning.
    pub reasoning: String,
    /// Iterations the worker consumed.
    pub iterations: u32,
    /// Successful verification passes.
    pub verifications: u32,
    /// Whether the worker reached its required pass streak.
    pub verifications_met: bool,
    /// Usage attributable to this worker.
    pub token_usage: UsageStats,
    /// Worker metadata, including its error payloads.
    pub metadata: serde_json::Value,
}

/// Result of an UltraThink run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UltraThinkResult {
    /// The high-level plan.
    pub plan: String,
    /// Every worker's full result, sorted by `agent_id`.
    pub agent_results: Vec<AgentResult>,
    /// The unified synthesis across workers.
    pub synthesis: String,
    /// User-facing summary.
    pub summary: String,
    /// Usage across framing calls and every worker.
    pub token_usage: UsageStats,
    /// Run metadata.
    pub metadata: serde_json::Value,
}

struct StageOutput {
    text: String,
    usage: UsageStats,
}

/// Multi-agent planner engine.
pub struct UltraThinkEngine {
    provider: Arc<dyn LLMProvider>,
    default_model: String,
    stage_models: HashMap<String, String>,
    problem: String,
    history: Vec<ChatMessage>,
    knowledge: Option<String>,
    num_agents: u32,
    parallel_run_agents: u32,
    max_iterations_per_agent: u32,
    required_verifications_per_agent: u32,
    max_errors: u32,
    parallel_verification: bool,
    params: CompletionParams,
    meter: Arc<TokenMeter>,
    cache: Arc<PrefixCache>,
    folding: Option<Arc<MemoryFolding>>,
    limiter: Option<Arc<RateLimiterRegistry>>,
    limiter_strategy: AcquireStrategy,
    limiter_timeout: Option<Duration>,
    bucket_key: Option<String>,
    bucket_template: String,
    deadline: Option<Instant>,
    use_content_cache: bool,
}

impl UltraThinkEngine {
    /// Create an engine with defaults suited to multi-agent runs.
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        model: impl Into<String>,
        problem: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            default_model: model.into(),
            stage_models: HashMap::new(),
            problem: problem.into(),
            history: Vec::new(),
            knowledge: None,
            num_agents: 3,
            parallel_run_agents: 3,
            max_iterations_per_agent: 10,
            required_verifications_per_agent: 2,
            max_errors: 10,
            parallel_verification: false,
            params: CompletionParams::default(),
            meter: Arc::new(TokenMeter::default()),
            cache: Arc::new(PrefixCache::disabled()),
            folding: None,
            limiter: None,
            limiter_strategy: AcquireStrategy::Wait,
            limiter_timeout: None,
            bucket_key: None,
            bucket_template: "{provider}:{model}".to_string(),
            deadline: None,
            use_content_cache: true,
        }
    }

    /// Seed prior conversation history (forwarded to every worker).
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    /// Attach a knowledge context (combined with the plan for workers).
    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        self.knowledge = Some(knowledge.into());
        self
    }

    /// Stage-name → underlying-model routing table.
    pub fn with_stage_models(mut self, stage_models: HashMap<String, String>) -> Self {
        self.stage_models = stage_models;
        self
    }

    /// Number of workers and the concurrency bound on them.
    pub fn with_agents(mut self, num_agents: u32, parallel_run_agents: u32) -> Self {
        self.num_agents = num_agents;
        self.parallel_run_agents = parallel_run_agents;
        self
    }

    /// Per-worker iteration/verification/error budgets.
    pub fn with_agent_limits(
        mut self,
        max_iterations: u32,
        required_verifications: u32,
        max_errors: u32,
    ) -> Self {
        self.max_iterations_per_agent = max_iterations;
        self.required_verifications_per_agent = required_verifications;
        self.max_errors = max_errors;
        self
    }

    /// Enable majority-of-3 verification inside every worker.
    pub fn with_parallel_verification(mut self, enabled: bool) -> Self {
        self.parallel_verification = enabled;
        self
    }

    /// Sampling parameters applied to framing calls and workers.
    pub fn with_params(mut self, params: CompletionParams) -> Self {
        self.params = params;
        self
    }

    /// Share a token meter.
    pub fn with_meter(mut self, meter: Arc<TokenMeter>) -> Self {
        self.meter = meter;
        self
    }

    /// Attach the prefix cache.
    pub fn with_cache(mut self, cache: Arc<PrefixCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Toggle the local content cache.
    pub fn with_content_cache(mut self, enabled: bool) -> Self {
        self.use_content_cache = enabled;
        self
    }

    /// Attach memory folding (forwarded to workers).
    pub fn with_folding(mut self, folding: Arc<MemoryFolding>) -> Self {
        self.folding = Some(folding);
        self
    }

    /// Gate all calls through a rate-limiter registry.
    pub fn with_rate_limiter(
        mut self,
        limiter: Arc<RateLimiterRegistry>,
        strategy: AcquireStrategy,
        timeout: Option<Duration>,
    ) -> Self {
        self.limiter = Some(limiter);
        self.limiter_strategy = strategy;
        self.limiter_timeout = timeout;
        self
    }

    /// Override the rendered bucket key.
    pub fn with_bucket_key(mut self, key: impl Into<String>) -> Self {
        self.bucket_key = Some(key.into());
        self
    }

    /// Bucket-key template used when no override is set.
    pub fn with_bucket_template(mut self, template: impl Into<String>) -> Self {
        self.bucket_template = template.into();
        self
    }

    /// Absolute deadline for the whole run.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    fn stage_model(&self, stage: Stage) -> &str {
        self.stage_models
            .get(stage.as_str())
            .map(String::as_str)
            .unwrap_or(&self.default_model)
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    async fn bounded<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        match self.deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(LlmError::Timeout("request deadline exceeded".to_string()));
                }
                match tokio::time::timeout(deadline - now, fut).await {
                    Ok(result) => result,
                    Err(_) => Err(LlmError::Timeout("request deadline exceeded".to_string())),
                }
            }
            None => fut.await,
        }
    }

    /// One framing call (plan / agent_config / synthesis / summary).
    async fn call_stage(
        &self,
        stage: Stage,
        system: &str,
        current: Vec<ChatMessage>,
        params: &CompletionParams,
    ) -> Result<StageOutput> {
        if self.deadline_exceeded() {
            return Err(LlmError::Timeout("request deadline exceeded".to_string()));
        }
        let model = self.stage_model(stage);

        let mut messages = Vec::with_capacity(current.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.extend(current);

        let fp = fingerprint(
            self.provider.name(),
            model,
            system,
            self.knowledge.as_deref().unwrap_or(""),
            &messages,
            params,
        )?;
        if self.use_content_cache {
            if let Some(hit) = self.cache.get_content(&fp).await {
                if let Some(text) = hit.get("text").and_then(serde_json::Value::as_str) {
                    debug!(stage = %stage, "content cache hit for framing call");
                    return Ok(StageOutput {
                        text: text.to_string(),
                        usage: UsageStats::default(),
                    });
                }
            }
        }

        if let Some(limiter) = &self.limiter {
            let key = match &self.bucket_key {
                Some(key) => key.clone(),
                None => render_bucket_key(&self.bucket_template, self.provider.name(), model),
            };
            limiter
                .acquire(&key, self.limiter_strategy, self.limiter_timeout)
                .await?;
        }

        let executor = RetryExecutor::new();
        let retries = self.provider.max_retries();
        let caps = self.provider.capabilities();

        let (text, usage) = if caps.supports_responses {
            let outcome = self
                .bounded(executor.execute_auto(retries, || {
                    self.provider.response(model, &messages, params, false, None)
                }))
                .await?;
            (outcome.text, outcome.usage)
        } else {
            let outcome = self
                .bounded(executor.execute_auto(retries, || {
                    self.provider.chat(model, &messages, params)
                }))
                .await?;
            (outcome.text, outcome.usage)
        };

        self.meter.record(self.provider.name(), model, &usage);
        if self.use_content_cache {
            self.cache.set_content(&fp, json!({ "text": text })).await;
        }

        Ok(StageOutput { text, usage })
    }

    /// Strictly parse the agent_config output.
    fn parse_agent_specs(&self, text: &str) -> Result<Vec<AgentSpec>> {
        let specs: Vec<AgentSpec> = serde_json::from_str(text.trim()).map_err(|e| {
            LlmError::InvalidRequest(format!(
                "agent configuration is not a valid JSON array of agent objects: {}",
                e
            ))
        })?;
        if specs.len() != self.num_agents as usize {
            return Err(LlmError::InvalidRequest(format!(
                "agent configuration has {} entries, expected {}",
                specs.len(),
                self.num_agents
            )));
        }
        Ok(specs)
    }

    fn build_worker(&self, spec: AgentSpec, plan: &str) -> DeepThinkEngine {
        let mut params = self.params.clone();
        if let Some(temperature) = spec.temperature {
            params.temperature = Some(temperature);
        }
        if let Some(seed) = spec.seed {
            params.seed = Some(seed);
        }
        let model = spec
            .model_override
            .unwrap_or_else(|| self.default_model.clone());

        // Workers see the shared plan as knowledge, stacked on any caller
        // knowledge context.
        let knowledge = match &self.knowledge {
            Some(knowledge) => format!("{}\n\n### Plan ###\n{}", knowledge, plan),
            None => format!("### Plan ###\n{}", plan),
        };

        let mut engine = DeepThinkEngine::new(self.provider.clone(), model, self.problem.clone())
            .with_history(self.history.clone())
            .with_knowledge(knowledge)
            .with_system_suffix(spec.system_prompt)
            .with_stage_models(self.stage_models.clone())
            .with_limits(
                self.max_iterations_per_agent,
                self.required_verifications_per_agent,
                self.max_errors,
            )
            .with_parallel_verification(self.parallel_verification)
            .with_params(params)
            .with_meter(self.meter.clone())
            .with_cache(self.cache.clone())
            .with_content_cache(self.use_content_cache)
            .with_bucket_template(self.bucket_template.clone());

        if let Some(folding) = &self.folding {
            engine = engine.with_folding(folding.clone());
        }
        if let Some(limiter) = &self.limiter {
            engine = engine.with_rate_limiter(
                limiter.clone(),
                self.limiter_strategy,
                self.limiter_timeout,
            );
        }
        if let Some(key) = &self.bucket_key {
            engine = engine.with_bucket_key(key.clone());
        }
        if let Some(deadline) = self.deadline {
            engine = engine.with_deadline(deadline);
        }
        engine
    }

    /// Execute the full plan → fan-out → synthesise pipeline.
    pub async fn run(&self) -> Result<UltraThinkResult> {
        if self.num_agents == 0 {
            return Err(LlmError::InvalidRequest(
                "num_agents must be at least 1".to_string(),
            ));
        }
        if self.required_verifications_per_agent > self.max_iterations_per_agent {
            return Err(LlmError::InvalidRequest(format!(
                "required_verifications ({}) exceeds max_iterations ({})",
                self.required_verifications_per_agent, self.max_iterations_per_agent
            )));
        }

        let mut run_usage = UsageStats::default();

        // 1. Plan.
        let plan_output = self
            .call_stage(
                Stage::Planning,
                PLAN_PROMPT,
                vec![ChatMessage::user(self.problem.clone())],
                &self.params,
            )
            .await?;
        run_usage.merge(&plan_output.usage);
        let plan = plan_output.text;
        debug!(chars = plan.len(), "plan generated");

        // 2. Agent configurations — strict parse, no fallback.
        let config_output = self
            .call_stage(
                Stage::AgentConfig,
                &agent_config_prompt(self.num_agents),
                vec![ChatMessage::user(format!(
                    "Plan:\n{}\n\nProblem:\n{}",
                    plan, self.problem
                ))],
                &self.params,
            )
            .await?;
        run_usage.merge(&config_output.usage);
        let specs = self.parse_agent_specs(&config_output.text)?;

        // 3. Fan out workers under the concurrency bound.
        let semaphore = Arc::new(Semaphore::new(self.parallel_run_agents.max(1) as usize));
        let workers = specs.into_iter().enumerate().map(|(index, spec)| {
            let semaphore = semaphore.clone();
            let plan = plan.as_str();
            async move {
                let _permit = semaphore.acquire().await.expect("semaphore closed");
                let agent_id = format!("agent-{}", index + 1);
                debug!(agent_id = %agent_id, "worker started");
                let outcome = self.build_worker(spec, plan).run().await;
                (index, agent_id, outcome)
            }
        });
        let mut outcomes = join_all(workers).await;
        // Collected in completion order; report in agent order.
        outcomes.sort_by_key(|(index, _, _)| *index);

        let mut agent_results = Vec::with_capacity(outcomes.len());
        let mut succeeded = 0usize;
        let mut first_error: Option<LlmError> = None;
        for (_, agent_id, outcome) in outcomes {
            match outcome {
                Ok(result) => {
                    succeeded += 1;
                    run_usage.merge(&result.token_usage);
                    agent_results.push(AgentResult {
                        agent_id,
                        final_solution: result.final_solution,
                        reasoning: result.summary,
                        iterations: result.iterations,
                        verifications: result.verifications,
                        verifications_met: result.verifications_met,
                        token_usage: result.token_usage,
                        metadata: json!({ "errors": result.errors }),
                    });
                }
                Err(e) => {
                    if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                        return Err(e);
                    }
                    warn!(agent_id = %agent_id, error = %e, "worker failed");
                    agent_results.push(AgentResult {
                        agent_id,
                        final_solution: String::new(),
                        reasoning: String::new(),
                        iterations: 0,
                        verifications: 0,
                        verifications_met: false,
                        token_usage: UsageStats::default(),
                        metadata: json!({ "error": e.payload(self.provider.name()) }),
                    });
                    first_error = first_error.or(Some(e));
                }
            }
        }
        if succeeded == 0 {
            return Err(first_error
                .unwrap_or_else(|| LlmError::Generic("every worker failed".to_string())));
        }

        // 4. Synthesis over the successful solutions.
        let solutions: Vec<(String, String)> = agent_results
            .iter()
            .filter(|a| !a.final_solution.is_empty())
            .map(|a| (a.agent_id.clone(), a.final_solution.clone()))
            .collect();
        let synthesis_output = self
            .call_stage(
                Stage::Synthesis,
                SYNTHESIZE_PROMPT,
                vec![ChatMessage::user(synthesis_user_prompt(
                    &self.problem,
                    &solutions,
                ))],
                &self.params,
            )
            .await?;
        run_usage.merge(&synthesis_output.usage);
        let synthesis = synthesis_output.text;

        // 5. User-facing summary; a failure here falls back to the
        // synthesis text rather than discarding the run.
        let mut summary_error = None;
        let summary = match self
            .call_stage(
                Stage::Summary,
                "",
                vec![ChatMessage::user(final_summary_prompt(
                    &self.problem,
                    &synthesis,
                ))],
                &self.params,
            )
            .await
        {
            Ok(output) => {
                run_usage.merge(&output.usage);
                output.text
            }
            Err(e) => {
                if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                    return Err(e);
                }
                warn!(error = %e, "summary failed, reusing synthesis");
                summary_error = Some(e.payload(self.provider.name()));
                synthesis.clone()
            }
        };

        info!(
            agents = agent_results.len(),
            succeeded,
            "ultrathink run finished"
        );

        Ok(UltraThinkResult {
            plan,
            agent_results,
            synthesis,
            summary,
            token_usage: run_usage,
            metadata: json!({
                "provider": self.provider.name(),
                "model": self.default_model,
                "num_agents": self.num_agents,
                "succeeded": succeeded,
                "summary_error": summary_error,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    const PASS: &str = r#"{"is_correct": true, "reasoning": "sound"}"#;

    fn specs_json(n: usize) -> String {
        let specs: Vec<serde_json::Value> = (0..n)
            .map(|i| json!({ "system_prompt": format!("approach {}", i + 1), "temperature": 0.5 }))
            .collect();
        serde_json::to_string(&specs).unwrap()
    }

    /// Script a full happy-path run: plan, config, per-agent
    /// (initial, verify, summary), synthesis, final summary.
    async fn script_happy_path(mock: &MockProvider, agents: usize) {
        mock.add_response("the plan").await;
        mock.add_response(specs_json(agents)).await;
        for i in 0..agents {
            mock.add_response(format!("solution {}", i + 1)).await;
            mock.add_response(PASS).await;
            mock.add_response(format!("agent summary {}", i + 1)).await;
        }
        mock.add_response("the synthesis").await;
        mock.add_response("the final summary").await;
    }

    #[tokio::test]
    async fn test_full_pipeline() {
        let mock = Arc::new(MockProvider::new());
        script_happy_path(&mock, 2).await;

        // Serial workers keep the scripted queue order deterministic; the
        // semaphore test below covers concurrency.
        let result = UltraThinkEngine::new(mock.clone(), "m", "hard problem")
            .with_agents(2, 1)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap();

        assert_eq!(result.plan, "the plan");
        assert_eq!(result.agent_results.len(), 2);
        assert_eq!(result.agent_results[0].agent_id, "agent-1");
        assert_eq!(result.agent_results[1].agent_id, "agent-2");
        assert_eq!(result.synthesis, "the synthesis");
        assert_eq!(result.summary, "the final summary");
        assert!(result.token_usage.total_tokens() > 0);
        // plan + config + 2×(initial, verify, summary) + synthesis + summary
        assert_eq!(mock.call_count().await, 10);
    }

    #[tokio::test]
    async fn test_invalid_agent_config_fails_without_spawning() {
        let mock = Arc::new(MockProvider::new());
        mock.add_response("the plan").await;
        mock.add_response("definitely not a JSON array").await;

        let meter = Arc::new(TokenMeter::default());
        let err = UltraThinkEngine::new(mock.clone(), "m", "p")
            .with_agents(3, 2)
            .with_agent_limits(3, 1, 5)
            .with_meter(meter.clone())
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, LlmError::InvalidRequest(_)));
        // Only planning + agent-config were issued (and metered).
        assert_eq!(mock.call_count().await, 2);
        assert!(meter.get_usage(None, None).total_tokens() > 0);
    }

    #[tokio::test]
    async fn test_wrong_agent_count_is_invalid() {
        let mock = Arc::new(MockProvider::new());
        mock.add_response("plan").await;
        mock.add_response(specs_json(2)).await; // engine expects 3

        let err = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(3, 2)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert!(err.to_string().contains("expected 3"));
    }

    #[tokio::test]
    async fn test_wrong_shape_is_invalid() {
        let mock = Arc::new(MockProvider::new());
        mock.add_response("plan").await;
        mock.add_response(r#"{"system_prompt": "an object, not an array"}"#)
            .await;

        let err = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(1, 1)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_fan_out_bounded_by_semaphore() {
        let mock =
            Arc::new(MockProvider::new().with_latency(Duration::from_millis(20)));
        script_happy_path(&mock, 3).await;

        let result = UltraThinkEngine::new(mock.clone(), "m", "p")
            .with_agents(3, 2)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap();

        assert_eq!(result.agent_results.len(), 3);
        assert!(mock.max_in_flight() <= 2, "semaphore bound violated");
    }

    #[tokio::test]
    async fn test_single_agent_reduction() {
        let mock = Arc::new(MockProvider::new());
        script_happy_path(&mock, 1).await;

        let result = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(1, 1)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap();
        assert_eq!(result.agent_results.len(), 1);
        assert!(result.agent_results[0].verifications_met);
        assert_eq!(result.synthesis, "the synthesis");
    }

    #[tokio::test]
    async fn test_worker_failure_does_not_cancel_siblings() {
        let mock = Arc::new(MockProvider::new());
        mock.add_response("plan").await;
        mock.add_response(specs_json(2)).await;
        // agent-1 initial generation fails outright (Auth is non-retryable).
        mock.fail_next(1, LlmError::Auth("bad".into())).await;
        // agent-2 completes.
        mock.add_response("solution 2").await;
        mock.add_response(PASS).await;
        mock.add_response("agent summary 2").await;
        mock.add_response("synthesis").await;
        mock.add_response("summary").await;

        // Serial workers so the scripted order is deterministic.
        let result = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(2, 1)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap();

        assert_eq!(result.agent_results.len(), 2);
        assert!(result.agent_results[0].final_solution.is_empty());
        assert!(result.agent_results[0].metadata.get("error").is_some());
        assert_eq!(result.agent_results[1].final_solution, "solution 2");
        assert_eq!(result.metadata["succeeded"], 1);
    }

    #[tokio::test]
    async fn test_all_workers_failing_fails_run() {
        let mock = Arc::new(MockProvider::new());
        mock.add_response("plan").await;
        mock.add_response(specs_json(2)).await;
        mock.fail_next(2, LlmError::Auth("bad".into())).await;

        let err = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(2, 1)
            .with_agent_limits(3, 1, 5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
    }

    #[tokio::test]
    async fn test_zero_agents_rejected() {
        let mock = Arc::new(MockProvider::new());
        let err = UltraThinkEngine::new(mock, "m", "p")
            .with_agents(0, 1)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_stage_routing_for_framing_calls() {
        let mock = Arc::new(MockProvider::new());
        script_happy_path(&mock, 1).await;

        let mut stages = HashMap::new();
        stages.insert("planning".to_string(), "planner-model".to_string());
        stages.insert("synthesis".to_string(), "synth-model".to_string());

        UltraThinkEngine::new(mock.clone(), "m", "p")
            .with_agents(1, 1)
            .with_agent_limits(3, 1, 5)
            .with_stage_models(stages)
            .run()
            .await
            .unwrap();

        let calls = mock.calls().await;
        assert_eq!(calls[0].model, "planner-model");
        // agent_config has no override, falls back to the default model.
        assert_eq!(calls[1].model, "m");
        // synthesis is the second-to-last call.
        assert_eq!(calls[calls.len() - 2].model, "synth-model");
    }
}
