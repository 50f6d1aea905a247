//! Provider registry and logical-model resolution.
//!
//! Logical model ids map to a (provider instance, model configuration)
//! pair. Provider adapters are process-wide singletons: the first
//! resolution against a provider id constructs the adapter for its
//! configured wire protocol, later resolutions reuse it. Tests (and
//! embedders) can pre-register instances, which is how the mock provider
//! slots in without touching configuration.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::config::{Config, ModelConfig, ProviderKind};
use crate::error::{LlmError, Result};
use crate::providers::{AnthropicProvider, OpenAIProvider};
use crate::traits::LLMProvider;

/// Registry of memoised provider instances plus the model table.
pub struct ProviderRegistry {
    config: Arc<Config>,
    instances: Mutex<HashMap<String, Arc<dyn LLMProvider>>>,
}

impl ProviderRegistry {
    /// Create a registry over a loaded configuration.
    pub fn new(config: Arc<Config>) -> Self {
        Self {
            config,
            instances: Mutex::new(HashMap::new()),
        }
    }

    /// Pre-register a provider instance under an id.
    ///
    /// Replaces any existing instance with the same id.
    pub fn register(&self, provider_id: impl Into<String>, provider: Arc<dyn LLMProvider>) {
        self.instances
            .lock()
            .expect("registry lock poisoned")
            .insert(provider_id.into(), provider);
    }

    /// Resolve a logical model id to its provider instance and model config.
    pub fn resolve(&self, model_id: &str) -> Result<(Arc<dyn LLMProvider>, ModelConfig)> {
        let model = self
            .config
            .get_model(model_id)
            .ok_or_else(|| LlmError::NotFound(format!("unknown model id: {}", model_id)))?
            .clone();
        let provider = self.provider(&model.provider_id)?;
        Ok((provider, model))
    }

    /// Get (or construct) the provider instance for a provider id.
    pub fn provider(&self, provider_id: &str) -> Result<Arc<dyn LLMProvider>> {
        if let Some(existing) = self
            .instances
            .lock()
            .expect("registry lock poisoned")
            .get(provider_id)
        {
            return Ok(existing.clone());
        }

        let config = self.config.get_provider(provider_id).ok_or_else(|| {
            LlmError::NotFound(format!("unknown provider id: {}", provider_id))
        })?;

        let instance: Arc<dyn LLMProvider> = match config.kind {
            ProviderKind::ChatCompletions | ProviderKind::Responses => {
                Arc::new(OpenAIProvider::from_config(config)?)
            }
            ProviderKind::Messages => Arc::new(AnthropicProvider::from_config(config)?),
        };
        debug!(provider_id, kind = %config.kind, "constructed provider adapter");

        let mut instances = self.instances.lock().expect("registry lock poisoned");
        // A concurrent resolve may have raced us here; keep the first one.
        Ok(instances
            .entry(provider_id.to_string())
            .or_insert(instance)
            .clone())
    }

    /// All logical model ids, sorted.
    pub fn list_models(&self) -> Vec<String> {
        self.config.list_models()
    }

    /// The configuration this registry resolves against.
    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }
}
