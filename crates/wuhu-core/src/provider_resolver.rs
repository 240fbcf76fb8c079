// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Seam between the agentic loop and the concrete inference backends. Wire
//! protocols for specific vendor APIs are an external collaborator's
//! concern (see `wuhu_model::ModelProvider`'s own doc comment); this trait
//! only resolves a `(provider, model)` pair named in `SessionSettings` to a
//! live [`ModelProvider`] instance.

use std::sync::Arc;

use wuhu_model::ModelProvider;

use crate::error::{LoopError, Result};

pub trait ProviderResolver: Send + Sync {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ModelProvider>>;
}

/// Resolver that always returns the same provider instance regardless of the
/// requested name, for tests and single-provider deployments.
pub struct StaticResolver {
    provider: Arc<dyn ModelProvider>,
}

impl StaticResolver {
    pub fn new(provider: Arc<dyn ModelProvider>) -> Self {
        Self { provider }
    }
}

impl ProviderResolver for StaticResolver {
    fn resolve(&self, _provider: &str, _model: &str) -> Result<Arc<dyn ModelProvider>> {
        Ok(self.provider.clone())
    }
}

/// Resolver keyed by an exact `(provider, model)` string pair, for tests that
/// need to exercise `SettingsUpdated`/model-change behavior against distinct
/// scripted providers.
pub struct MapResolver {
    entries: std::collections::HashMap<(String, String), Arc<dyn ModelProvider>>,
}

impl MapResolver {
    pub fn new() -> Self {
        Self { entries: std::collections::HashMap::new() }
    }

    pub fn insert(&mut self, provider: &str, model: &str, instance: Arc<dyn ModelProvider>) {
        self.entries.insert((provider.to_string(), model.to_string()), instance);
    }
}

impl Default for MapResolver {
    fn default() -> Self {
        Self::new()
    }
}

impl ProviderResolver for MapResolver {
    fn resolve(&self, provider: &str, model: &str) -> Result<Arc<dyn ModelProvider>> {
        self.entries
            .get(&(provider.to_string(), model.to_string()))
            .cloned()
            .ok_or_else(|| LoopError::UnknownProvider { provider: provider.to_string(), model: model.to_string() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wuhu_model::MockProvider;

    #[test]
    fn static_resolver_always_returns_same_instance() {
        let resolver = StaticResolver::new(Arc::new(MockProvider));
        assert!(resolver.resolve("anything", "anything").is_ok());
        assert!(resolver.resolve("openai", "gpt-5.1").is_ok());
    }

    #[test]
    fn map_resolver_errors_on_unregistered_pair() {
        let resolver = MapResolver::new();
        let err = resolver.resolve("openai", "gpt-5.1").unwrap_err();
        assert!(matches!(err, LoopError::UnknownProvider { .. }));
    }

    #[test]
    fn map_resolver_finds_registered_pair() {
        let mut resolver = MapResolver::new();
        resolver.insert("openai", "gpt-5.1", Arc::new(MockProvider));
        assert!(resolver.resolve("openai", "gpt-5.1").is_ok());
    }
}
