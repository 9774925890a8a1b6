//! Provider registry: which backends are configured, and the fixed order
//! in which the orchestrator falls back between them.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tandem_config::{FallbackTarget, OrchestratorConfig};
use tandem_core::provider::Provider;

/// Holds configured providers by id plus the fallback preference order.
pub struct ProviderRegistry {
    providers: HashMap<String, Arc<dyn Provider>>,
    preference: Vec<FallbackTarget>,
}

impl ProviderRegistry {
    /// Create an empty registry with the given preference order.
    pub fn new(preference: Vec<FallbackTarget>) -> Self {
        Self {
            providers: HashMap::new(),
            preference,
        }
    }

    /// Create an empty registry using the preference order from config.
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self::new(config.provider_preference.clone())
    }

    /// Register a provider under `id`.
    pub fn register(&mut self, id: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(id.into(), provider);
    }

    /// Builder-style [`register`](Self::register).
    pub fn with(mut self, id: impl Into<String>, provider: Arc<dyn Provider>) -> Self {
        self.register(id, provider);
        self
    }

    /// Get a specific provider by id.
    pub fn get(&self, id: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(id).cloned()
    }

    /// Whether a provider with this id has been registered.
    pub fn is_configured(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    /// The fallback preference order.
    pub fn preference(&self) -> &[FallbackTarget] {
        &self.preference
    }

    /// The first configured provider in preference order that is neither
    /// `current` nor in `failed`.
    pub fn next_fallback(&self, current: &str, failed: &HashSet<String>) -> Option<&FallbackTarget> {
        self.preference.iter().find(|target| {
            target.provider != current
                && !failed.contains(&target.provider)
                && self.is_configured(&target.provider)
        })
    }

    /// List all registered provider ids.
    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(|s| s.as_str()).collect()
    }
}
