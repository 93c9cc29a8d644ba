//! Run configuration: backend list and cascade tuning knobs.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::llm::types::ModelDescriptor;

fn default_window_secs() -> u64 {
    60
}

fn default_window_limit() -> u32 {
    30
}

fn default_cooldown_secs() -> u64 {
    600
}

fn default_cooldown_threshold() -> u64 {
    100
}

fn default_timeout_secs() -> u64 {
    120
}

/// Configuration for one pipeline run, loadable from a JSON file.
///
/// Every knob has a default, so a minimal file only needs a `models` list.
/// The built-in `Default` carries the standard five-provider cascade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CascadeConfig {
    /// Ordered, tiered backend list.
    pub models: Vec<ModelDescriptor>,

    /// Fixed quota window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Calls allowed per window for tiers not listed in `tier_limits`.
    #[serde(default = "default_window_limit")]
    pub window_limit: u32,

    /// Per-tier window limit overrides, keyed by tier ordinal.
    #[serde(default)]
    pub tier_limits: BTreeMap<usize, u32>,

    /// Wall-clock cooldown after a tier exhausts its quota, in seconds.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,

    /// Global attempts a failed backend sits out before being probed again.
    #[serde(default = "default_cooldown_threshold")]
    pub cooldown_threshold: u64,

    /// Per-call HTTP timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for CascadeConfig {
    fn default() -> Self {
        // Window limits are deliberately conservative; confirm against the
        // actual provider quotas before raising them.
        let tier_limits = BTreeMap::from([(0, 60), (1, 15), (2, 30), (3, 20), (4, 240)]);

        Self {
            models: vec![
                ModelDescriptor::vertex_gemini_pro(),
                ModelDescriptor::gemini_flash(),
                ModelDescriptor::groq_llama(),
                ModelDescriptor::openrouter_qwen(),
                ModelDescriptor::ollama_llama(),
            ],
            window_secs: default_window_secs(),
            window_limit: default_window_limit(),
            tier_limits,
            cooldown_secs: default_cooldown_secs(),
            cooldown_threshold: default_cooldown_threshold(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

impl CascadeConfig {
    /// Load configuration from a JSON file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| Error::config(format!("invalid config {}: {}", path.display(), e)))?;
        Ok(config)
    }

    /// Window limit for a tier, falling back to the global default.
    pub fn limit_for_tier(&self, tier: usize) -> u32 {
        self.tier_limits.get(&tier).copied().unwrap_or(self.window_limit)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::llm::types::Provider;

    #[test]
    fn test_minimal_file_gets_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"models": [{{"provider": "groq", "id": "llama-3.3-70b-versatile", "tier": 0}}]}}"#
        )
        .unwrap();

        let config = CascadeConfig::load(file.path()).unwrap();
        assert_eq!(config.models.len(), 1);
        assert_eq!(config.models[0].provider, Provider::Groq);
        assert_eq!(config.window_secs, 60);
        assert_eq!(config.cooldown_threshold, 100);
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let err = CascadeConfig::load(Path::new("/nonexistent/models.json")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_tier_limit_fallback() {
        let config = CascadeConfig::default();
        assert_eq!(config.limit_for_tier(1), 15);
        assert_eq!(config.limit_for_tier(99), config.window_limit);
    }

    #[test]
    fn test_tier_limits_round_trip() {
        let config = CascadeConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let back: CascadeConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.tier_limits, config.tier_limits);
    }
}
