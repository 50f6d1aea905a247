//! Typed configuration for providers, models, and system defaults.
//!
//! Configuration is read-only after load. Validation is a single pass that
//! collects every violation into one [`ValidationReport`] instead of failing
//! on the first bad field, so a misconfigured deployment surfaces all of its
//! problems at once.
//!
//! `${VAR}` and `$VAR` placeholders anywhere in the YAML are replaced from
//! the environment before deserialization; an API key that still contains an
//! unreplaced placeholder after substitution is a validation error, never a
//! silently-broken credential.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use thiserror::Error;

use crate::meter::PricingTable;
use crate::rate_limiter::AcquireStrategy;
use crate::traits::ProviderCapabilities;

// ============================================================================
// Errors
// ============================================================================

/// All validation violations found in one pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationReport(pub Vec<String>);

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "configuration validation failed:")?;
        for err in &self.0 {
            writeln!(f, "  - {}", err)?;
        }
        Ok(())
    }
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a configuration file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse YAML.
    #[error("failed to parse config: {0}")]
    Parse(String),

    /// One or more fields failed validation.
    #[error("{0}")]
    Validation(ValidationReport),
}

// ============================================================================
// Environment substitution
// ============================================================================

fn placeholder_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\$\{([^}]+)\}|\$([A-Z_][A-Z0-9_]*)").expect("valid regex"))
}

/// Whether a string still contains an unreplaced `${VAR}` / `$VAR` marker.
pub fn has_env_placeholder(value: &str) -> bool {
    placeholder_regex().is_match(value)
}

fn substitute_str(value: &str) -> String {
    placeholder_regex()
        .replace_all(value, |caps: &regex::Captures<'_>| {
            let name = caps
                .get(1)
                .or_else(|| caps.get(2))
                .map(|m| m.as_str())
                .unwrap_or_default();
            // Unknown variables keep the original marker so validation can
            // point at them.
            std::env::var(name).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}

fn substitute_env(value: serde_yaml::Value) -> serde_yaml::Value {
    use serde_yaml::Value;
    match value {
        Value::String(s) => Value::String(substitute_str(&s)),
        Value::Sequence(items) => Value::Sequence(items.into_iter().map(substitute_env).collect()),
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, substitute_env(v)))
                .collect(),
        ),
        other => other,
    }
}

// ============================================================================
// Provider configuration
// ============================================================================

/// Wire protocol a provider speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    /// Single-turn chat completions; system role prepended as a message.
    #[default]
    ChatCompletions,
    /// Chat back-end with the richer responses endpoint
    /// (`previous_response_id` chaining, reasoning-token details).
    Responses,
    /// Messages protocol with separate system field and per-message
    /// `cache_control`.
    Messages,
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderKind::ChatCompletions => write!(f, "chat_completions"),
            ProviderKind::Responses => write!(f, "responses"),
            ProviderKind::Messages => write!(f, "messages"),
        }
    }
}

fn default_timeout() -> f64 {
    300.0
}

fn default_max_retries() -> u32 {
    3
}

/// Configuration for one provider instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider id; filled from the map key on load.
    #[serde(default)]
    pub id: String,

    /// Wire protocol variant.
    #[serde(default)]
    pub kind: ProviderKind,

    /// API base URL, `http(s)://`.
    pub base_url: String,

    /// API key; must not retain a `${VAR}` placeholder.
    pub api_key: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout")]
    pub timeout: f64,

    /// Retry budget for transient failures.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Capability flags; defaults derive from `kind`.
    #[serde(default)]
    pub capabilities: Option<ProviderCapabilities>,
}

impl ProviderConfig {
    /// Effective capabilities: explicit flags, or defaults for the kind.
    pub fn capabilities(&self) -> ProviderCapabilities {
        self.capabilities.unwrap_or_else(|| match self.kind {
            ProviderKind::ChatCompletions => ProviderCapabilities::default(),
            ProviderKind::Responses => ProviderCapabilities {
                supports_responses: true,
                supports_caching: true,
                supports_thinking: true,
                ..ProviderCapabilities::default()
            },
            ProviderKind::Messages => ProviderCapabilities {
                supports_caching: true,
                supports_thinking: true,
                ..ProviderCapabilities::default()
            },
        })
    }

    fn collect_errors(&self, errors: &mut Vec<String>) {
        if self.base_url.is_empty() {
            errors.push(format!("provider '{}': base_url is required", self.id));
        } else if !self.base_url.starts_with("http://") && !self.base_url.starts_with("https://") {
            errors.push(format!(
                "provider '{}': base_url must start with http:// or https://",
                self.id
            ));
        }

        if self.api_key.is_empty() {
            errors.push(format!("provider '{}': api_key is required", self.id));
        } else if has_env_placeholder(&self.api_key) {
            errors.push(format!(
                "provider '{}': api_key contains an unreplaced environment variable; \
                 set the variable or provide the key directly",
                self.id
            ));
        }

        if self.timeout <= 0.0 {
            errors.push(format!(
                "provider '{}': timeout must be positive (got {})",
                self.id, self.timeout
            ));
        }

        if self.kind != ProviderKind::Responses && self.capabilities().supports_responses {
            errors.push(format!(
                "provider '{}': supports_responses requires kind 'responses'",
                self.id
            ));
        }
    }
}

// ============================================================================
// Model configuration
// ============================================================================

/// Engine level a model id routes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLevel {
    /// Single-agent iterative solve/verify/correct loop.
    DeepThink,
    /// Multi-agent planner with parallel fan-out and synthesis.
    UltraThink,
}

fn default_max_iterations() -> u32 {
    30
}

fn default_required_verifications() -> u32 {
    3
}

fn default_max_errors() -> u32 {
    10
}

fn default_parallel_run_agents() -> u32 {
    3
}

/// Configuration for one logical model id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Logical model id; filled from the map key on load.
    #[serde(default)]
    pub id: String,

    /// Human-readable name.
    #[serde(default)]
    pub display_name: String,

    /// Provider this model dispatches through.
    pub provider_id: String,

    /// Underlying provider model name.
    pub underlying_model: String,

    /// Engine level.
    pub level: EngineLevel,

    /// Iteration cap for the solve/verify/correct loop.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Consecutive verification passes required to accept a solution.
    #[serde(default = "default_required_verifications")]
    pub required_verifications: u32,

    /// Non-retried errors tolerated before the run gives up.
    #[serde(default = "default_max_errors")]
    pub max_errors: u32,

    /// Majority-of-3 parallel verification.
    #[serde(default)]
    pub enable_parallel_check: bool,

    /// Number of UltraThink workers (UltraThink only).
    #[serde(default)]
    pub num_agents: Option<u32>,

    /// Concurrency bound on UltraThink workers.
    #[serde(default = "default_parallel_run_agents")]
    pub parallel_run_agents: u32,

    /// Stage name → underlying model overrides.
    #[serde(default)]
    pub stage_models: HashMap<String, String>,

    /// Requests-per-minute cap mapped onto a token bucket.
    #[serde(default)]
    pub rpm: Option<u32>,
}

impl ModelConfig {
    /// Underlying model for a stage, falling back to the default.
    pub fn stage_model(&self, stage: &str) -> &str {
        self.stage_models
            .get(stage)
            .map(String::as_str)
            .unwrap_or(&self.underlying_model)
    }

    fn collect_errors(&self, providers: &HashMap<String, ProviderConfig>, errors: &mut Vec<String>) {
        if self.provider_id.is_empty() {
            errors.push(format!("model '{}': provider_id is required", self.id));
        } else if !providers.contains_key(&self.provider_id) {
            let available = if providers.is_empty() {
                "none".to_string()
            } else {
                let mut names: Vec<&str> = providers.keys().map(String::as_str).collect();
                names.sort();
                names.join(", ")
            };
            errors.push(format!(
                "model '{}': provider '{}' not found; available providers: {}",
                self.id, self.provider_id, available
            ));
        }

        if self.underlying_model.is_empty() {
            errors.push(format!("model '{}': underlying_model is required", self.id));
        }

        if self.max_iterations == 0 {
            errors.push(format!("model '{}': max_iterations must be positive", self.id));
        }
        if self.required_verifications == 0 {
            errors.push(format!(
                "model '{}': required_verifications must be positive",
                self.id
            ));
        }
        if self.max_errors == 0 {
            errors.push(format!("model '{}': max_errors must be positive", self.id));
        }
        if self.parallel_run_agents == 0 {
            errors.push(format!(
                "model '{}': parallel_run_agents must be positive",
                self.id
            ));
        }
        if self.level == EngineLevel::UltraThink {
            if let Some(0) = self.num_agents {
                errors.push(format!("model '{}': num_agents must be positive", self.id));
            }
        }
        if let Some(0) = self.rpm {
            errors.push(format!("model '{}': rpm must be positive when set", self.id));
        }
    }
}

// ============================================================================
// System defaults and the top-level config
// ============================================================================

fn default_bucket_template() -> String {
    "{provider}:{model}".to_string()
}

/// System-wide rate limit defaults; lowest precedence in the chain
/// request override > model `rpm` > these defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitDefaults {
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
    pub strategy: AcquireStrategy,
    /// Sliding-window event cap.
    #[serde(default)]
    pub window_limit: Option<usize>,
    /// Sliding-window length in seconds.
    #[serde(default)]
    pub window_seconds: Option<f64>,
    /// Bucket-key template.
    #[serde(default = "default_bucket_template")]
    pub bucket_template: String,
}

impl Default for RateLimitDefaults {
    fn default() -> Self {
        Self {
            qps: None,
            burst: None,
            timeout: None,
            strategy: AcquireStrategy::default(),
            window_limit: None,
            window_seconds: None,
            bucket_template: default_bucket_template(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Top-level configuration; read-only after load.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Bind host for the HTTP layer.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port for the HTTP layer.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Optional inbound API key.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Log level name.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// System-wide rate limit defaults.
    #[serde(default)]
    pub rate_limit: RateLimitDefaults,

    /// Provider configurations keyed by id.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Model configurations keyed by logical id.
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,

    /// Pricing table (USD per token), usually loaded from a separate file.
    #[serde(default)]
    pub pricing: PricingTable,
}

impl Config {
    /// Parse configuration from a YAML string, substituting `${VAR}`
    /// placeholders and validating the result.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let raw: serde_yaml::Value =
            serde_yaml::from_str(yaml).map_err(|e| ConfigError::Parse(e.to_string()))?;
        let substituted = substitute_env(raw);
        let mut config: Config = serde_yaml::from_value(substituted)
            .map_err(|e| ConfigError::Parse(e.to_string()))?;

        for (id, provider) in config.providers.iter_mut() {
            provider.id = id.clone();
        }
        for (id, model) in config.models.iter_mut() {
            model.id = id.clone();
            if model.display_name.is_empty() {
                model.display_name = id.clone();
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration (and optionally pricing) from YAML files.
    pub fn from_yaml(
        config_path: &Path,
        pricing_path: Option<&Path>,
    ) -> Result<Self, ConfigError> {
        let yaml = std::fs::read_to_string(config_path)?;
        let mut config = Self::from_yaml_str(&yaml)?;
        if let Some(pricing_path) = pricing_path {
            if pricing_path.exists() {
                let pricing_yaml = std::fs::read_to_string(pricing_path)?;
                config.pricing = serde_yaml::from_str(&pricing_yaml)
                    .map_err(|e| ConfigError::Parse(format!("pricing file: {}", e)))?;
            }
        }
        Ok(config)
    }

    /// Validate the whole configuration, collecting every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.log_level.to_ascii_lowercase().as_str()) {
            errors.push(format!(
                "system: log_level must be one of {:?} (got '{}')",
                LEVELS, self.log_level
            ));
        }
        if self.port == 0 {
            errors.push("system: port must be non-zero".to_string());
        }
        if self.providers.is_empty() {
            errors.push("configuration must define at least one provider".to_string());
        }
        if self.models.is_empty() {
            errors.push("configuration must define at least one model".to_string());
        }

        for provider in self.providers.values() {
            provider.collect_errors(&mut errors);
        }
        for model in self.models.values() {
            model.collect_errors(&self.providers, &mut errors);
        }

        if errors.is_empty() {
            Ok(())
        } else {
            errors.sort();
            Err(ConfigError::Validation(ValidationReport(errors)))
        }
    }

    /// Provider configuration by id.
    pub fn get_provider(&self, provider_id: &str) -> Option<&ProviderConfig> {
        self.providers.get(provider_id)
    }

    /// Model configuration by logical id.
    pub fn get_model(&self, model_id: &str) -> Option<&ModelConfig> {
        self.models.get(model_id)
    }

    /// All logical model ids, sorted.
    pub fn list_models(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.models.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Pricing entry for a (provider, underlying model) pair.
    pub fn get_pricing(&self, provider: &str, model: &str) -> Option<crate::meter::PricingEntry> {
        self.pricing.get(provider).and_then(|t| t.get(model)).copied()
    }
}
