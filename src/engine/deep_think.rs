//! DeepThink: single-agent iterative solve/verify/correct loop.
//!
//! State machine:
//!
//! ```text
//!   START
//!     → GENERATE_INITIAL     (stage=initial)
//!     → VERIFY               (stage=verification)
//!     → if pass && passes+1 ≥ required_verifications → SUMMARISE
//!     → if pass → passes++, iter++, re-VERIFY with a fresh judge seed
//!     → if fail → CORRECT    (stage=correction), iter++, passes=0 → VERIFY
//!     → if iter ≥ max_iterations OR errors ≥ max_errors → SUMMARISE (failed)
//!   SUMMARISE (stage=summary)
//!     → END
//! ```
//!
//! Every outbound call is gated by the rate limiter, folded through memory
//! compression, fingerprinted, and metered. A content-cache hit short-
//! circuits the provider entirely (and skips the response-id lookup); on a
//! miss, responses-capable providers chain `previous_response_id` from the
//! run's prefix anchor. Exhausting the iteration budget without reaching
//! the required pass streak is not an error: the best candidate is
//! returned with `verifications_met = false`.

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::cache::PrefixCache;
use crate::engine::prompts::{
    correct_user_prompt, final_summary_prompt, verify_user_prompt, CORRECT_PROMPT, INITIAL_PROMPT,
    VERIFY_PROMPT,
};
use crate::engine::verify::{parse_judge_verdict, symbolic_sanity_check, JudgeVerdict};
use crate::engine::Stage;
use crate::error::{ErrorPayload, LlmError, Result};
use crate::fingerprint::fingerprint;
use crate::folding::MemoryFolding;
use crate::meter::{TokenMeter, UsageStats};
use crate::rate_limiter::{render_bucket_key, AcquireStrategy, RateLimiterRegistry};
use crate::retry::RetryExecutor;
use crate::traits::{ChatMessage, CompletionParams, LLMProvider};

/// Judges consulted when parallel verification is enabled.
const PARALLEL_JUDGES: u64 = 3;

/// One verification round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationRecord {
    /// Aggregate outcome (majority of judges when parallel).
    pub passed: bool,
    /// Individual judge verdicts.
    pub verdicts: Vec<JudgeVerdict>,
    /// Advisory numeric sanity-check outcome (never affects `passed`).
    pub symbolic: Option<bool>,
    /// Judge calls that failed outright.
    pub call_errors: Vec<ErrorPayload>,
}

impl VerificationRecord {
    /// Feedback handed to the correction step.
    fn feedback(&self) -> String {
        for verdict in &self.verdicts {
            if !verdict.is_correct {
                let mut feedback = verdict.reasoning.clone();
                if !verdict.errors.is_empty() {
                    feedback.push('\n');
                    feedback.push_str(&verdict.errors.join("\n"));
                }
                if !feedback.trim().is_empty() {
                    return feedback;
                }
            }
        }
        "The verifier rejected the solution without detailed feedback.".to_string()
    }
}

/// Result of a DeepThink run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeepThinkResult {
    /// Best candidate solution.
    pub final_solution: String,
    /// User-facing summary.
    pub summary: String,
    /// Generation/verification rounds consumed (the initial counts as one).
    pub iterations: u32,
    /// Total successful verification passes.
    pub verifications: u32,
    /// Whether the required consecutive pass streak was reached.
    pub verifications_met: bool,
    /// Every verification round, in order.
    pub verification_log: Vec<VerificationRecord>,
    /// Non-retried errors absorbed by the run.
    pub errors: Vec<ErrorPayload>,
    /// Usage accumulated by this run (meter-independent).
    pub token_usage: UsageStats,
    /// Run metadata (provider, model, cache behaviour).
    pub metadata: serde_json::Value,
}

struct CallOutput {
    text: String,
    usage: UsageStats,
    from_cache: bool,
}

/// Single-agent iterative reasoning engine.
pub struct DeepThinkEngine {
    provider: Arc<dyn LLMProvider>,
    default_model: String,
    stage_models: HashMap<String, String>,
    problem: String,
    history: Vec<ChatMessage>,
    knowledge: Option<String>,
    system_suffix: Option<String>,
    max_iterations: u32,
    required_verifications: u32,
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

impl DeepThinkEngine {
    /// Create an engine with defaults matching the model-config defaults.
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
            system_suffix: None,
            max_iterations: 20,
            required_verifications: 3,
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

    /// Seed prior conversation history.
    pub fn with_history(mut self, history: Vec<ChatMessage>) -> Self {
        self.history = history;
        self
    }

    /// Attach a knowledge context appended to the system prompt.
    pub fn with_knowledge(mut self, knowledge: impl Into<String>) -> Self {
        self.knowledge = Some(knowledge.into());
        self
    }

    /// Append agent-specific guidance to the system prompt.
    pub fn with_system_suffix(mut self, suffix: impl Into<String>) -> Self {
        self.system_suffix = Some(suffix.into());
        self
    }

    /// Stage-name → underlying-model routing table.
    pub fn with_stage_models(mut self, stage_models: HashMap<String, String>) -> Self {
        self.stage_models = stage_models;
        self
    }

    /// Iteration, verification-streak, and error budgets.
    pub fn with_limits(
        mut self,
        max_iterations: u32,
        required_verifications: u32,
        max_errors: u32,
    ) -> Self {
        self.max_iterations = max_iterations;
        self.required_verifications = required_verifications;
        self.max_errors = max_errors;
        self
    }

    /// Enable majority-of-3 parallel verification.
    pub fn with_parallel_verification(mut self, enabled: bool) -> Self {
        self.parallel_verification = enabled;
        self
    }

    /// Sampling parameters applied to every stage.
    pub fn with_params(mut self, params: CompletionParams) -> Self {
        self.params = params;
        self
    }

    /// Share a token meter (UltraThink passes its own).
    pub fn with_meter(mut self, meter: Arc<TokenMeter>) -> Self {
        self.meter = meter;
        self
    }

    /// Attach the prefix cache.
    pub fn with_cache(mut self, cache: Arc<PrefixCache>) -> Self {
        self.cache = cache;
        self
    }

    /// Toggle the local content cache (response-id chaining is unaffected).
    pub fn with_content_cache(mut self, enabled: bool) -> Self {
        self.use_content_cache = enabled;
        self
    }

    /// Attach memory folding.
    pub fn with_folding(mut self, folding: Arc<MemoryFolding>) -> Self {
        self.folding = Some(folding);
        self
    }

    /// Gate calls through a rate-limiter registry.
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

    /// Absolute deadline; exceeding it fails the run with `Timeout`.
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

    fn system_prompt(&self) -> String {
        let mut system = INITIAL_PROMPT.to_string();
        if let Some(suffix) = &self.system_suffix {
            system.push_str("\n\n### Approach ###\n");
            system.push_str(suffix);
        }
        if let Some(knowledge) = &self.knowledge {
            system.push_str("\n\n### Knowledge ###\n");
            system.push_str(knowledge);
        }
        system
    }

    fn deadline_exceeded(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    fn check_deadline(&self) -> Result<()> {
        if self.deadline_exceeded() {
            Err(LlmError::Timeout("request deadline exceeded".to_string()))
        } else {
            Ok(())
        }
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

    /// One gated, folded, fingerprinted, metered LLM call.
    ///
    /// `history` is compressed; `current` rides verbatim behind it. When
    /// `anchor` is set and the provider supports the responses endpoint,
    /// the call chains `previous_response_id` stored under the anchor
    /// fingerprint (consulted only on a content-cache miss).
    async fn call_llm(
        &self,
        stage: Stage,
        system: &str,
        history: &[ChatMessage],
        current: &[ChatMessage],
        params: &CompletionParams,
        store: bool,
        anchor: Option<&str>,
    ) -> Result<CallOutput> {
        self.check_deadline()?;
        let model = self.stage_model(stage);
        let caps = self.provider.capabilities();

        // Memory folding over the history portion only.
        let mut folded = match &self.folding {
            Some(folding) => {
                let (folded, stats) = folding.fold(history).await?;
                self.meter.record_folding(&stats);
                folded
            }
            None => history.to_vec(),
        };
        if let Some(folding) = &self.folding {
            if caps.supports_caching && !caps.supports_responses {
                folding.apply_cache_control(&mut folded);
            }
        }

        let mut messages = Vec::with_capacity(folded.len() + current.len() + 1);
        if !system.is_empty() {
            messages.push(ChatMessage::system(system));
        }
        messages.append(&mut folded);
        messages.extend_from_slice(current);

        let fp = fingerprint(
            self.provider.name(),
            model,
            system,
            self.knowledge.as_deref().unwrap_or(""),
            &messages,
            params,
        )?;

        // A content hit wins outright: no provider call, no response-id
        // lookup, no usage recorded.
        if self.use_content_cache {
            if let Some(hit) = self.cache.get_content(&fp).await {
                if let Some(text) = hit.get("text").and_then(serde_json::Value::as_str) {
                    debug!(stage = %stage, fp = &fp[..16], "content cache hit");
                    return Ok(CallOutput {
                        text: text.to_string(),
                        usage: UsageStats::default(),
                        from_cache: true,
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
        self.check_deadline()?;

        let executor = RetryExecutor::new();
        let retries = self.provider.max_retries();

        let (text, usage, response_id) = if caps.supports_responses {
            let previous_id = match anchor {
                Some(anchor) => self.cache.get_response_id(anchor).await,
                None => None,
            };
            let outcome = self
                .bounded(executor.execute_auto(retries, || {
                    self.provider
                        .response(model, &messages, params, store, previous_id.as_deref())
                }))
                .await?;
            (outcome.text, outcome.usage, outcome.response_id)
        } else {
            let outcome = self
                .bounded(executor.execute_auto(retries, || {
                    self.provider.chat(model, &messages, params)
                }))
                .await?;
            (outcome.text, outcome.usage, None)
        };

        if let (Some(anchor), Some(id)) = (anchor, response_id.as_deref()) {
            self.cache.set_response_id(anchor, id).await;
        }

        self.meter.record(self.provider.name(), model, &usage);
        if self.use_content_cache {
            self.cache.set_content(&fp, json!({ "text": text })).await;
        }

        Ok(CallOutput {
            text,
            usage,
            from_cache: false,
        })
    }

    /// Run one verification round (1 judge, or majority-of-3 in parallel).
    ///
    /// Errors from individual judges are folded into the record; only a
    /// round where every judge failed is an `Err`.
    async fn verify_solution(
        &self,
        attempt: u64,
        solution: &str,
    ) -> Result<(VerificationRecord, UsageStats, u32)> {
        let judges = if self.parallel_verification {
            PARALLEL_JUDGES
        } else {
            1
        };
        let base_seed = self.params.seed.unwrap_or(0);

        let mut calls = Vec::new();
        for judge in 0..judges {
            // Fresh seed per (attempt, judge) so repeated rounds fingerprint
            // differently and judges stay independent.
            let params = CompletionParams {
                seed: Some(base_seed + attempt * judges + judge),
                ..self.params.clone()
            };
            let current = vec![ChatMessage::user(verify_user_prompt(
                &self.problem,
                solution,
            ))];
            calls.push(async move {
                self.call_llm(
                    Stage::Verification,
                    VERIFY_PROMPT,
                    &[],
                    &current,
                    &params,
                    false,
                    None,
                )
                .await
            });
        }

        let mut verdicts = Vec::new();
        let mut call_errors = Vec::new();
        let mut usage = UsageStats::default();
        let mut hits = 0u32;
        let mut last_error: Option<LlmError> = None;
        for outcome in join_all(calls).await {
            match outcome {
                Ok(output) => {
                    usage.merge(&output.usage);
                    hits += u32::from(output.from_cache);
                    verdicts.push(parse_judge_verdict(&output.text));
                }
                Err(e) => {
                    if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                        return Err(e);
                    }
                    call_errors.push(e.payload(self.provider.name()));
                    last_error = Some(e);
                }
            }
        }
        if verdicts.is_empty() {
            return Err(last_error.unwrap_or_else(|| {
                LlmError::Generic("verification produced no verdicts".to_string())
            }));
        }

        let pass_votes = verdicts.iter().filter(|v| v.is_correct).count() as u64;
        let record = VerificationRecord {
            passed: pass_votes * 2 > judges,
            verdicts,
            symbolic: symbolic_sanity_check(solution),
            call_errors,
        };
        Ok((record, usage, hits))
    }

    /// Execute the full solve/verify/correct loop.
    pub async fn run(&self) -> Result<DeepThinkResult> {
        if self.required_verifications > self.max_iterations {
            return Err(LlmError::InvalidRequest(format!(
                "required_verifications ({}) exceeds max_iterations ({})",
                self.required_verifications, self.max_iterations
            )));
        }

        let system = self.system_prompt();
        let knowledge = self.knowledge.as_deref().unwrap_or("");

        // Prefix anchor for provider-side chaining: stable across runs that
        // share (system, knowledge, seeded history, params).
        let anchor = fingerprint(
            self.provider.name(),
            self.stage_model(Stage::Initial),
            &system,
            knowledge,
            &self.history,
            &self.params,
        )?;

        let mut working = self.history.clone();
        let current = vec![ChatMessage::user(self.problem.clone())];
        let initial = self
            .call_llm(
                Stage::Initial,
                &system,
                &working,
                &current,
                &self.params,
                true,
                Some(&anchor),
            )
            .await?;
        let mut run_usage = initial.usage;
        let mut cache_hits = u32::from(initial.from_cache);
        working.extend(current);
        working.push(ChatMessage::assistant(initial.text.clone()));
        let mut solution = initial.text;
        debug!(chars = solution.len(), "initial candidate generated");

        let mut errors: Vec<ErrorPayload> = Vec::new();
        let mut verification_log: Vec<VerificationRecord> = Vec::new();
        let mut verifications = 0u32;
        let mut passes = 0u32;
        let mut iterations = 1u32;
        let mut verified = false;
        let mut attempt = 0u64;

        loop {
            if errors.len() as u32 >= self.max_errors {
                warn!(errors = errors.len(), "error budget exhausted");
                break;
            }

            let passed = match self.verify_solution(attempt, &solution).await {
                Ok((record, usage, hits)) => {
                    run_usage.merge(&usage);
                    cache_hits += hits;
                    errors.extend(record.call_errors.iter().cloned());
                    let passed = record.passed;
                    verification_log.push(record);
                    passed
                }
                Err(e) => {
                    if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                        return Err(e);
                    }
                    errors.push(e.payload(self.provider.name()));
                    verification_log.push(VerificationRecord {
                        passed: false,
                        verdicts: Vec::new(),
                        symbolic: None,
                        call_errors: Vec::new(),
                    });
                    false
                }
            };
            attempt += 1;

            if passed {
                verifications += 1;
                passes += 1;
                if passes >= self.required_verifications {
                    verified = true;
                    break;
                }
                // Re-verify the same candidate with a fresh judge seed.
                iterations += 1;
                if iterations > self.max_iterations {
                    break;
                }
            } else {
                passes = 0;
                if iterations >= self.max_iterations {
                    break;
                }

                let feedback = verification_log
                    .last()
                    .map(VerificationRecord::feedback)
                    .unwrap_or_default();
                let current = vec![ChatMessage::user(correct_user_prompt(
                    &self.problem,
                    &solution,
                    &feedback,
                ))];
                match self
                    .call_llm(
                        Stage::Correction,
                        CORRECT_PROMPT,
                        &working,
                        &current,
                        &self.params,
                        false,
                        None,
                    )
                    .await
                {
                    Ok(output) => {
                        run_usage.merge(&output.usage);
                        cache_hits += u32::from(output.from_cache);
                        working.extend(current);
                        working.push(ChatMessage::assistant(output.text.clone()));
                        solution = output.text;
                    }
                    Err(e) => {
                        if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                            return Err(e);
                        }
                        warn!(error = %e, "correction failed, keeping previous candidate");
                        errors.push(e.payload(self.provider.name()));
                    }
                }
                iterations += 1;
            }
        }

        let summary_current = vec![ChatMessage::user(final_summary_prompt(
            &self.problem,
            &solution,
        ))];
        let summary = match self
            .call_llm(
                Stage::Summary,
                "",
                &[],
                &summary_current,
                &self.params,
                false,
                None,
            )
            .await
        {
            Ok(output) => {
                run_usage.merge(&output.usage);
                cache_hits += u32::from(output.from_cache);
                output.text
            }
            Err(e) => {
                if matches!(e, LlmError::Timeout(_)) && self.deadline_exceeded() {
                    return Err(e);
                }
                errors.push(e.payload(self.provider.name()));
                solution.clone()
            }
        };

        info!(
            iterations,
            verifications,
            verified,
            errors = errors.len(),
            "deepthink run finished"
        );

        Ok(DeepThinkResult {
            final_solution: solution,
            summary,
            iterations,
            verifications,
            verifications_met: verified,
            verification_log,
            errors,
            token_usage: run_usage,
            metadata: json!({
                "provider": self.provider.name(),
                "model": self.default_model,
                "content_cache_hits": cache_hits,
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MockProvider;

    const PASS: &str = r#"{"is_correct": true, "reasoning": "sound"}"#;
    const FAIL: &str = r#"{"is_correct": false, "reasoning": "step 2 is wrong", "errors": ["sign"]}"#;

    fn engine(mock: MockProvider) -> DeepThinkEngine {
        DeepThinkEngine::new(Arc::new(mock), "m-test", "2 + 2 = ?")
            .with_limits(3, 1, 5)
    }

    #[tokio::test]
    async fn test_first_pass_accepts() {
        let mock = MockProvider::new();
        mock.add_response("The answer is 4.").await;
        mock.add_response(PASS).await;
        mock.add_response("Final summary: 4").await;

        let result = engine(mock).run().await.unwrap();
        assert!(result.verifications_met);
        assert_eq!(result.verifications, 1);
        assert_eq!(result.iterations, 1);
        assert!(result.final_solution.contains('4'));
        assert_eq!(result.summary, "Final summary: 4");
        assert!(result.errors.is_empty());
        assert!(result.token_usage.total_tokens() > 0);
    }

    #[tokio::test]
    async fn test_correction_loop() {
        let mock = MockProvider::new();
        mock.add_response("The answer is 5.").await; // initial
        mock.add_response(FAIL).await; // verify 1
        mock.add_response("Corrected: the answer is 4.").await; // correction
        mock.add_response(PASS).await; // verify 2
        mock.add_response("Summary").await;

        let result = engine(mock).run().await.unwrap();
        assert!(result.verifications_met);
        assert_eq!(result.iterations, 2);
        assert_eq!(result.verification_log.len(), 2);
        assert!(!result.verification_log[0].passed);
        assert!(result.verification_log[1].passed);
        assert!(result.final_solution.contains("Corrected"));
    }

    #[tokio::test]
    async fn test_required_streak_with_fresh_seeds() {
        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let mock_ref = Arc::new(mock);
        let result = DeepThinkEngine::new(mock_ref.clone(), "m", "p")
            .with_limits(5, 2, 5)
            .run()
            .await
            .unwrap();
        assert!(result.verifications_met);
        assert_eq!(result.verifications, 2);
        assert_eq!(result.iterations, 2);
        // initial + 2 verifications + summary
        assert_eq!(mock_ref.call_count().await, 4);
    }

    #[tokio::test]
    async fn test_budget_exhaustion_returns_first_candidate() {
        // required=1, max_iterations=1: a failing first verification must
        // end the run without a correction.
        let mock = MockProvider::new();
        mock.add_response("first-generation candidate").await;
        mock.add_response(FAIL).await;
        mock.add_response("summary of failed").await;

        let mock_ref = Arc::new(mock);
        let result = DeepThinkEngine::new(mock_ref.clone(), "m", "p")
            .with_limits(1, 1, 5)
            .run()
            .await
            .unwrap();
        assert!(!result.verifications_met);
        assert_eq!(result.final_solution, "first-generation candidate");
        assert_eq!(result.iterations, 1);
        // No correction call happened: initial, verify, summary.
        assert_eq!(mock_ref.call_count().await, 3);
    }

    #[tokio::test]
    async fn test_required_exceeding_iterations_rejected() {
        let mock = MockProvider::new();
        let err = DeepThinkEngine::new(Arc::new(mock), "m", "p")
            .with_limits(2, 3, 5)
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_error_budget_ends_run() {
        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        // Every verification call errors (non-retryable for the mock's
        // max_retries=0) until the budget of 2 is crossed.
        mock.fail_next(5, LlmError::Generic("provider broken".into()))
            .await;

        let mock_ref = Arc::new(mock);
        let result = DeepThinkEngine::new(mock_ref.clone(), "m", "p")
            .with_limits(10, 1, 2)
            .run()
            .await
            .unwrap();
        assert!(!result.verifications_met);
        // Verification and correction errors crossed the budget; the
        // summary fallback may add one more.
        assert!(result.errors.len() >= 2);
        assert_eq!(result.final_solution, "candidate");
    }

    #[tokio::test]
    async fn test_initial_failure_aborts() {
        let mock = MockProvider::new();
        mock.fail_next(1, LlmError::Auth("bad key".into())).await;
        let err = engine(mock).run().await.unwrap_err();
        assert!(matches!(err, LlmError::Auth(_)));
    }

    #[tokio::test]
    async fn test_parallel_verification_majority() {
        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        // Three judges: two pass, one fails → majority passes.
        mock.add_response(PASS).await;
        mock.add_response(FAIL).await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let mock_ref = Arc::new(mock);
        let result = DeepThinkEngine::new(mock_ref.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_parallel_verification(true)
            .run()
            .await
            .unwrap();
        assert!(result.verifications_met);
        assert_eq!(result.verification_log[0].verdicts.len(), 3);
        assert_eq!(mock_ref.call_count().await, 5);
    }

    #[tokio::test]
    async fn test_stage_routing() {
        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let mut stages = HashMap::new();
        stages.insert("verification".to_string(), "judge-model".to_string());
        stages.insert("summary".to_string(), "cheap-model".to_string());

        let mock_ref = Arc::new(mock);
        DeepThinkEngine::new(mock_ref.clone(), "main-model", "p")
            .with_limits(3, 1, 5)
            .with_stage_models(stages)
            .run()
            .await
            .unwrap();

        let calls = mock_ref.calls().await;
        assert_eq!(calls[0].model, "main-model");
        assert_eq!(calls[1].model, "judge-model");
        assert_eq!(calls[2].model, "cheap-model");
    }

    #[tokio::test]
    async fn test_usage_recorded_in_shared_meter() {
        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let meter = Arc::new(TokenMeter::default());
        DeepThinkEngine::new(Arc::new(mock), "m", "p")
            .with_limits(3, 1, 5)
            .with_meter(meter.clone())
            .run()
            .await
            .unwrap();

        let usage = meter.get_usage(Some("mock"), Some("m"));
        assert!(usage.input_tokens > 0);
        assert!(usage.output_tokens > 0);
    }

    #[tokio::test]
    async fn test_deadline_timeout_propagates() {
        let mock = MockProvider::new().with_latency(Duration::from_millis(100));
        mock.add_response("slow").await;

        let err = DeepThinkEngine::new(Arc::new(mock), "m", "p")
            .with_limits(3, 1, 5)
            .with_deadline(Instant::now() + Duration::from_millis(20))
            .run()
            .await
            .unwrap_err();
        assert!(matches!(err, LlmError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_responses_provider_chains_anchor() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PrefixCache::open(dir.path()).unwrap());

        let mock = Arc::new(MockProvider::new().with_responses_api());
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        DeepThinkEngine::new(mock.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_cache(cache.clone())
            .with_content_cache(false)
            .run()
            .await
            .unwrap();

        let calls = mock.calls().await;
        assert!(calls.iter().all(|c| c.endpoint == "response"));
        // First run has no anchor to chain from.
        assert_eq!(calls[0].previous_response_id, None);
        // Exactly one response id was anchored (the initial stage).
        assert_eq!(cache.count_namespace("response_id").await, 1);

        // A second identical run chains the stored id.
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;
        DeepThinkEngine::new(mock.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_cache(cache.clone())
            .with_content_cache(false)
            .run()
            .await
            .unwrap();
        let calls = mock.calls().await;
        assert_eq!(calls[3].previous_response_id.as_deref(), Some("resp-1"));
        assert_eq!(cache.count_namespace("response_id").await, 1);
    }

    #[tokio::test]
    async fn test_content_cache_replays_run_without_calls() {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PrefixCache::open(dir.path()).unwrap());

        let mock = Arc::new(MockProvider::new());
        mock.add_response("deterministic answer").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let first = DeepThinkEngine::new(mock.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_cache(cache.clone())
            .run()
            .await
            .unwrap();
        let calls_after_first = mock.call_count().await;

        let second = DeepThinkEngine::new(mock.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_cache(cache)
            .run()
            .await
            .unwrap();

        assert_eq!(first.final_solution, second.final_solution);
        assert_eq!(first.summary, second.summary);
        // Pure replay: no new provider calls.
        assert_eq!(mock.call_count().await, calls_after_first);
        assert_eq!(second.token_usage, UsageStats::default());
    }

    #[tokio::test]
    async fn test_folding_marks_cache_breakpoint_for_caching_provider() {
        use crate::folding::{ColdStrategy, FoldingConfig, MemoryFolding};

        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(PrefixCache::open(dir.path()).unwrap());
        let mock = Arc::new(MockProvider::new().with_caching());
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        let history: Vec<ChatMessage> = (0..8)
            .map(|i| {
                if i % 2 == 0 {
                    ChatMessage::user(format!("q{}", i))
                } else {
                    ChatMessage::assistant(format!("a{}", i))
                }
            })
            .collect();

        // cold_strategy: None keeps the mock queue free of distill calls.
        let folding = Arc::new(
            MemoryFolding::new(
                FoldingConfig {
                    enabled: true,
                    hot_layer_size: 2,
                    warm_layer_size: 3,
                    cold_strategy: ColdStrategy::None,
                    ..FoldingConfig::default()
                },
                cache,
                mock.clone(),
                "m",
            )
            .unwrap(),
        );

        DeepThinkEngine::new(mock.clone(), "m", "p")
            .with_limits(3, 1, 5)
            .with_history(history)
            .with_folding(folding)
            .run()
            .await
            .unwrap();

        // The initial call carries the folded history with the marker on
        // the last warm message; judge and summary calls have no history.
        let calls = mock.calls().await;
        assert!(calls[0].cache_marked);
        assert!(!calls[1].cache_marked);
        assert!(!calls[2].cache_marked);
    }

    #[tokio::test]
    async fn test_rate_limiter_error_strategy_surfaces() {
        let limiter = Arc::new(RateLimiterRegistry::new());
        limiter.configure_bucket("mock:m", 0.001, 1).await;

        let mock = MockProvider::new();
        mock.add_response("candidate").await;
        mock.add_response(PASS).await;
        mock.add_response("summary").await;

        // Burst of 1 admits the initial call; the verification call is
        // refused and (being non-retryable under max_retries=0 semantics)
        // counts against the error budget until exhaustion.
        let result = DeepThinkEngine::new(Arc::new(mock), "m", "p")
            .with_limits(3, 1, 1)
            .with_rate_limiter(limiter, AcquireStrategy::Error, None)
            .run()
            .await
            .unwrap();
        assert!(!result.verifications_met);
        assert!(!result.errors.is_empty());
        assert_eq!(result.errors[0].kind, "rate_limit_error");
    }
}
