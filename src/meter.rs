//! Token usage metering and cost estimation.
//!
//! Usage is accumulated per (provider, model) with a mirrored grand total.
//! Token counting assumptions (matching provider documentation):
//!
//! - `cached_tokens` is a subset of `input_tokens`;
//! - `reasoning_tokens` is a subset of `output_tokens`.
//!
//! So the billable split is `uncached_input = input - cached` and
//! `regular_output = output - reasoning`. Violations of the subset
//! assumptions are warned about and counted, never fatal; the arithmetic
//! saturates so a bad provider report cannot produce negative cost.
//!
//! Memory-folding savings are absorbed on a separate channel so compression
//! overhead never pollutes the per-model usage map.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::warn;

use crate::folding::FoldingStats;

// ============================================================================
// Usage
// ============================================================================

/// Token usage for one call or an accumulated scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageStats {
    /// Prompt-side tokens, including cached ones.
    #[serde(default)]
    pub input_tokens: u64,
    /// Completion-side tokens, including reasoning ones.
    #[serde(default)]
    pub output_tokens: u64,
    /// Cached prompt tokens (subset of `input_tokens`).
    #[serde(default)]
    pub cached_tokens: u64,
    /// Reasoning tokens (subset of `output_tokens`).
    #[serde(default)]
    pub reasoning_tokens: u64,
}

impl UsageStats {
    /// Total tokens (input + output).
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    /// Input tokens billed at the full prompt rate.
    pub fn uncached_input(&self) -> u64 {
        self.input_tokens.saturating_sub(self.cached_tokens)
    }

    /// Output tokens billed at the completion rate.
    pub fn regular_output(&self) -> u64 {
        self.output_tokens.saturating_sub(self.reasoning_tokens)
    }

    /// Accumulate another usage record into this one.
    pub fn merge(&mut self, other: &UsageStats) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cached_tokens += other.cached_tokens;
        self.reasoning_tokens += other.reasoning_tokens;
    }

    /// Check the subset assumptions, warning on violation.
    ///
    /// Returns `false` when the record is anomalous. The caller decides what
    /// to do with that; the meter only counts it.
    pub fn validate(&self) -> bool {
        let mut ok = true;
        if self.cached_tokens > self.input_tokens {
            warn!(
                cached = self.cached_tokens,
                input = self.input_tokens,
                "cached_tokens exceed input_tokens; provider report is inconsistent"
            );
            ok = false;
        }
        if self.reasoning_tokens > self.output_tokens {
            warn!(
                reasoning = self.reasoning_tokens,
                output = self.output_tokens,
                "reasoning_tokens exceed output_tokens; provider report is inconsistent"
            );
            ok = false;
        }
        ok
    }
}

// ============================================================================
// Pricing
// ============================================================================

/// Per-token USD rates for one (provider, model) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PricingEntry {
    /// USD per uncached input token.
    #[serde(default)]
    pub prompt: f64,
    /// USD per regular output token.
    #[serde(default)]
    pub completion: f64,
    /// USD per cached input token.
    #[serde(default)]
    pub cached_prompt: f64,
    /// USD per reasoning token.
    #[serde(default)]
    pub reasoning: f64,
}

impl PricingEntry {
    /// Cost of one usage record under this entry.
    pub fn cost(&self, usage: &UsageStats) -> f64 {
        usage.uncached_input() as f64 * self.prompt
            + usage.cached_tokens as f64 * self.cached_prompt
            + usage.regular_output() as f64 * self.completion
            + usage.reasoning_tokens as f64 * self.reasoning
    }
}

/// Pricing table: provider name → underlying model → rates.
pub type PricingTable = HashMap<String, HashMap<String, PricingEntry>>;

// ============================================================================
// Folding channel
// ============================================================================

/// Accumulated memory-folding statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FoldingTotals {
    /// Estimated tokens before compression.
    pub original_tokens: u64,
    /// Estimated tokens after compression.
    pub compressed_tokens: u64,
    /// Tokens spent on distillation/summarisation calls.
    pub distillation_tokens: u64,
    /// Distillation attempts that fell back to consolidation.
    pub distill_fallbacks: u64,
}

impl FoldingTotals {
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
// Meter
// ============================================================================

#[derive(Debug, Default)]
struct MeterInner {
    by_provider: HashMap<String, HashMap<String, UsageStats>>,
    total: UsageStats,
    folding: FoldingTotals,
    anomalies: u64,
}

/// Thread-safe usage accumulator with cost estimation.
///
/// Each `record` call is atomic: concurrent workers in an UltraThink run
/// share one meter and never lose an update.
#[derive(Debug, Default)]
pub struct TokenMeter {
    pricing: PricingTable,
    inner: Mutex<MeterInner>,
}

impl TokenMeter {
    /// Create a meter with the given pricing table.
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            inner: Mutex::new(MeterInner::default()),
        }
    }

    /// Record usage from one call against a (provider, model) pair.
    pub fn record(&self, provider: &str, model: &str, usage: &UsageStats) {
        let anomalous = !usage.validate();
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        inner
            .by_provider
            .entry(provider.to_string())
            .or_default()
            .entry(model.to_string())
            .or_default()
            .merge(usage);
        inner.total.merge(usage);
        if anomalous {
            inner.anomalies += 1;
        }
    }

    /// Absorb memory-folding statistics on the separate channel.
    pub fn record_folding(&self, stats: &FoldingStats) {
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        inner.folding.original_tokens += stats.original_tokens;
        inner.folding.compressed_tokens += stats.compressed_tokens;
        inner.folding.distillation_tokens += stats.distillation_tokens;
        inner.folding.distill_fallbacks += stats.distill_fallbacks as u64;
    }

    /// Usage for a scope: everything, one provider, or one model.
    pub fn get_usage(&self, provider: Option<&str>, model: Option<&str>) -> UsageStats {
        let inner = self.inner.lock().expect("meter lock poisoned");
        match provider {
            None => inner.total,
            Some(p) => {
                let Some(models) = inner.by_provider.get(p) else {
                    return UsageStats::default();
                };
                match model {
                    Some(m) => models.get(m).copied().unwrap_or_default(),
                    None => {
                        let mut sum = UsageStats::default();
                        for stats in models.values() {
                            sum.merge(stats);
                        }
                        sum
                    }
                }
            }
        }
    }

    /// Estimated USD cost for a scope.
    ///
    /// Models without a pricing entry contribute zero; the meter never
    /// fabricates rates.
    pub fn estimate_cost(&self, provider: Option<&str>, model: Option<&str>) -> f64 {
        let inner = self.inner.lock().expect("meter lock poisoned");
        let mut cost = 0.0;
        for (p, models) in &inner.by_provider {
            if provider.is_some_and(|want| want != p) {
                continue;
            }
            for (m, usage) in models {
                if model.is_some_and(|want| want != m) {
                    continue;
                }
                if let Some(entry) = self.pricing.get(p).and_then(|t| t.get(m)) {
                    cost += entry.cost(usage);
                }
            }
        }
        cost
    }

    /// Number of anomalous records seen so far.
    pub fn anomaly_count(&self) -> u64 {
        self.inner.lock().expect("meter lock poisoned").anomalies
    }

    /// Accumulated folding totals.
    pub fn folding_totals(&self) -> FoldingTotals {
        self.inner.lock().expect("meter lock poisoned").folding
    }

    /// Full usage/cost breakdown.
    pub fn summary(&self) -> MeterSummary {
        let inner = self.inner.lock().expect("meter lock poisoned");
        let by_provider = inner
            .by_provider
            .iter()
            .map(|(p, models)| {
                let mut provider_usage = UsageStats::default();
                let by_model = models
                    .iter()
                    .map(|(m, usage)| {
                        provider_usage.merge(usage);
                        let cost = self
                            .pricing
                            .get(p)
                            .and_then(|t| t.get(m))
                            .map(|e| e.cost(usage))
                            .unwrap_or(0.0);
                        (
                            m.clone(),
                            ModelSummary {
                                usage: *usage,
                                cost_usd: cost,
                            },
                        )
                    })
                    .collect::<HashMap<_, _>>();
                let provider_cost = by_model.values().map(|m| m.cost_usd).sum();
                (
                    p.clone(),
                    ProviderSummary {
                        usage: provider_usage,
                        cost_usd: provider_cost,
                        by_model,
                    },
                )
            })
            .collect::<HashMap<_, _>>();

        MeterSummary {
            total_usage: inner.total,
            total_cost_usd: by_provider.values().map(|p| p.cost_usd).sum(),
            folding: inner.folding,
            anomaly_count: inner.anomalies,
            by_provider,
        }
    }

    /// Reset all accumulated state.
    pub fn reset(&self) {
        let mut inner = self.inner.lock().expect("meter lock poisoned");
        *inner = MeterInner::default();
    }
}

/// Usage and cost for one model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Accumulated usage.
    pub usage: UsageStats,
    /// Estimated cost in USD.
    pub cost_usd: f64,
}

/// Usage and cost for one provider, with per-model breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderSummary {
    /// Accumulated usage across the provider's models.
    pub usage: UsageStats,
    /// Estimated cost in USD.
    pub cost_usd: f64,
    /// Per-model breakdown.
    pub by_model: HashMap<String, ModelSummary>,
}

/// Complete meter snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeterSummary {
    /// Grand-total usage.
    pub total_usage: UsageStats,
    /// Grand-total estimated cost in USD.
    pub total_cost_usd: f64,
    /// Memory-folding channel totals.
    pub folding: FoldingTotals,
    /// Number of anomalous usage records (warn-and-continue policy).
    pub anomaly_count: u64,
    /// Per-provider breakdown.
    pub by_provider: HashMap<String, ProviderSummary>,
}
