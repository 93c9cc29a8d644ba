//! Ordered, tiered registry of configured backends.

use std::collections::BTreeMap;

use crate::config::CascadeConfig;
use crate::error::{Error, Result};

use super::types::ModelDescriptor;

/// The full priority-ordered list of backends for one run.
///
/// Built once from configuration and never mutated afterwards; the cascade
/// strategies own all per-run mutable state.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: Vec<ModelDescriptor>,
}

impl ModelRegistry {
    /// Build the registry from configuration.
    ///
    /// Fails fast when zero backends are configured; an empty registry can
    /// never serve a request and indicates a broken deployment.
    pub fn from_config(config: &CascadeConfig) -> Result<Self> {
        if config.models.is_empty() {
            return Err(Error::config("no models configured"));
        }

        let mut models = config.models.clone();
        // Stable sort keeps intra-tier configuration order.
        models.sort_by_key(|m| m.tier);

        Ok(Self { models })
    }

    /// All backends in priority order (tier ascending, then config order).
    pub fn all_models(&self) -> &[ModelDescriptor] {
        &self.models
    }

    /// Backends grouped by tier ordinal, intra-tier order preserved.
    pub fn by_tier(&self) -> BTreeMap<usize, Vec<&ModelDescriptor>> {
        let mut tiers: BTreeMap<usize, Vec<&ModelDescriptor>> = BTreeMap::new();
        for model in &self.models {
            tiers.entry(model.tier).or_default().push(model);
        }
        tiers
    }

    /// Distinct tier ordinals, ascending.
    pub fn tiers(&self) -> Vec<usize> {
        self.by_tier().into_keys().collect()
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::types::Provider;

    fn config_with(models: Vec<ModelDescriptor>) -> CascadeConfig {
        CascadeConfig {
            models,
            ..CascadeConfig::default()
        }
    }

    #[test]
    fn test_empty_config_is_fatal() {
        let err = ModelRegistry::from_config(&config_with(Vec::new())).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_priority_order() {
        let registry = ModelRegistry::from_config(&config_with(vec![
            ModelDescriptor::new(Provider::Ollama, "llama3.1:8b", 4),
            ModelDescriptor::new(Provider::Gemini, "gemini-2.0-flash", 1),
            ModelDescriptor::new(Provider::Vertex, "gemini-2.0-pro", 0),
        ]))
        .unwrap();

        let tiers: Vec<usize> = registry.all_models().iter().map(|m| m.tier).collect();
        assert_eq!(tiers, vec![0, 1, 4]);
    }

    #[test]
    fn test_by_tier_preserves_config_order() {
        let registry = ModelRegistry::from_config(&config_with(vec![
            ModelDescriptor::new(Provider::Groq, "llama-3.3-70b-versatile", 2),
            ModelDescriptor::new(Provider::Groq, "llama-3.1-8b-instant", 2),
        ]))
        .unwrap();

        let tiers = registry.by_tier();
        let tier2 = &tiers[&2];
        assert_eq!(tier2.len(), 2);
        assert_eq!(tier2[0].id, "llama-3.3-70b-versatile");
        assert_eq!(tier2[1].id, "llama-3.1-8b-instant");
    }

    #[test]
    fn test_default_registry_has_all_tiers() {
        let registry = ModelRegistry::from_config(&CascadeConfig::default()).unwrap();
        assert_eq!(registry.tiers(), vec![0, 1, 2, 3, 4]);
    }
}
