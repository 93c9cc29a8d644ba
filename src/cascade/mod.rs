//! Cascade strategies: deciding which backend serves each request.
//!
//! Two strategies share one trait. [`ErrorDrivenCascade`] is reactive: it
//! keeps calling a backend until it actually errors, then cascades and parks
//! the failed backend in a cooldown queue. [`RateLimitedCascade`] is
//! preemptive: it checks per-tier quota before calling and falls through
//! tiers on exhaustion. Workers share one strategy instance per run.

mod error_driven;
mod rate_limited;

use std::sync::{Arc, Once};
use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::config::CascadeConfig;
use crate::error::{Error, Result};
use crate::llm::{ModelClient, ModelRegistry, Provider};
use crate::stats::UsageStats;

pub use error_driven::ErrorDrivenCascade;
pub use rate_limited::RateLimitedCascade;

/// Result of routing one request through the cascade.
#[derive(Debug, Clone)]
pub struct CascadeResponse {
    /// Raw output of the backend that finally served the request.
    pub content: String,
    /// Model identifier that produced the result.
    pub model: String,
    pub provider: Provider,
    /// Backend attempts spent on this request, including the success.
    pub attempts: u32,
}

/// A backend-selection policy shared by all workers of a run.
///
/// `invoke` performs the full retry loop for one record: select a backend,
/// call it, update cascade state, and either return the first success or a
/// single [`Error::Exhausted`] once every option is spent. Implementations
/// keep their shared state behind a mutex held only for bookkeeping, never
/// across the network call.
#[async_trait]
pub trait CascadeStrategy: Send + Sync {
    async fn invoke(&self, record_id: &str, prompt: &str) -> Result<CascadeResponse>;

    /// Point-in-time view of the cascade state, for the shutdown report.
    fn snapshot(&self) -> CascadeSnapshot;

    fn name(&self) -> &'static str;
}

/// Which strategy a run uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    ErrorDriven,
    RateLimited,
}

/// Legacy strategy names and what they resolve to.
const DEPRECATED_ALIASES: &[(&str, StrategyKind)] = &[
    ("extended", StrategyKind::RateLimited),
    ("simple", StrategyKind::RateLimited),
];

static ALIAS_WARNING: Once = Once::new();

impl StrategyKind {
    /// Parse a strategy name, accepting deprecated aliases.
    ///
    /// The deprecation notice is logged once per process, regardless of how
    /// many call sites hit an alias.
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "error_driven" => Ok(Self::ErrorDriven),
            "rate_limited" => Ok(Self::RateLimited),
            other => match DEPRECATED_ALIASES.iter().find(|(alias, _)| *alias == other) {
                Some((alias, kind)) => {
                    let canonical = kind.as_str();
                    ALIAS_WARNING.call_once(|| {
                        warn!(
                            alias,
                            canonical, "deprecated cascade strategy name, use the canonical name"
                        );
                    });
                    Ok(*kind)
                }
                None => Err(Error::config(format!("unknown cascade strategy: {}", other))),
            },
        }
    }

    pub fn is_deprecated_alias(name: &str) -> bool {
        DEPRECATED_ALIASES.iter().any(|(alias, _)| *alias == name)
    }

    /// Resolve the strategy for a run.
    ///
    /// Precedence: explicit flag, then the `LLM_CASCADE_STRATEGY` environment
    /// value, then the worker-count default. Multi-worker runs default to the
    /// rate-limited strategy for its lower cross-worker coordination cost.
    pub fn resolve(flag: Option<&str>, env: Option<&str>, workers: usize) -> Result<Self> {
        match flag.or(env) {
            Some(name) => Self::parse(name),
            None if workers > 1 => Ok(Self::RateLimited),
            None => Ok(Self::ErrorDriven),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ErrorDriven => "error_driven",
            Self::RateLimited => "rate_limited",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One cooling backend, as seen in the shutdown report.
#[derive(Debug, Clone)]
pub struct CoolingSnapshot {
    pub model: String,
    pub failure_count: u32,
    pub attempts_since_failure: u64,
    pub cooldown_threshold: u64,
}

impl CoolingSnapshot {
    /// Global attempts left before this backend is probed again.
    pub fn remaining_attempts(&self) -> u64 {
        self.cooldown_threshold
            .saturating_sub(self.attempts_since_failure)
    }
}

/// One tier's quota state, as seen in the shutdown report.
#[derive(Debug, Clone)]
pub struct TierSnapshot {
    pub tier: usize,
    pub calls_in_window: u32,
    pub window_limit: u32,
    /// Time until the tier recovers, when it is in fallback.
    pub fallback_remaining: Option<Duration>,
}

/// Point-in-time cascade state, appended to the usage report.
#[derive(Debug, Clone)]
pub enum CascadeSnapshot {
    ErrorDriven {
        /// Active stack, most-recently-successful first.
        active: Vec<String>,
        /// Cooling queue in FIFO order.
        cooling: Vec<CoolingSnapshot>,
    },
    RateLimited { tiers: Vec<TierSnapshot> },
}

impl std::fmt::Display for CascadeSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "cascade state:")?;
        match self {
            Self::ErrorDriven { active, cooling } => {
                writeln!(f, "  active: [{}]", active.join(", "))?;
                if cooling.is_empty() {
                    writeln!(f, "  cooling: (none)")?;
                } else {
                    for c in cooling {
                        writeln!(
                            f,
                            "  cooling: {} failures={} recovery in {} attempts",
                            c.model,
                            c.failure_count,
                            c.remaining_attempts()
                        )?;
                    }
                }
            }
            Self::RateLimited { tiers } => {
                for t in tiers {
                    match t.fallback_remaining {
                        Some(remaining) => writeln!(
                            f,
                            "  tier {} {}/{} calls, fallback for {:.0}s",
                            t.tier,
                            t.calls_in_window,
                            t.window_limit,
                            remaining.as_secs_f64()
                        )?,
                        None => writeln!(
                            f,
                            "  tier {} {}/{} calls",
                            t.tier, t.calls_in_window, t.window_limit
                        )?,
                    }
                }
            }
        }
        Ok(())
    }
}

/// Assemble a strategy from run configuration.
pub fn build_strategy(
    kind: StrategyKind,
    registry: &ModelRegistry,
    client: Arc<dyn ModelClient>,
    stats: Arc<UsageStats>,
    config: &CascadeConfig,
    parallel: bool,
) -> Arc<dyn CascadeStrategy> {
    match kind {
        StrategyKind::ErrorDriven => Arc::new(
            ErrorDrivenCascade::new(registry, client, stats)
                .with_cooldown_threshold(config.cooldown_threshold),
        ),
        StrategyKind::RateLimited => {
            let mut strategy = RateLimitedCascade::new(registry, client, stats)
                .with_window(Duration::from_secs(config.window_secs))
                .with_cooldown(Duration::from_secs(config.cooldown_secs))
                .with_parallel(parallel);
            for tier in registry.tiers() {
                strategy = strategy.with_tier_limit(tier, config.limit_for_tier(tier));
            }
            Arc::new(strategy)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_canonical_names() {
        assert_eq!(
            StrategyKind::parse("error_driven").unwrap(),
            StrategyKind::ErrorDriven
        );
        assert_eq!(
            StrategyKind::parse("rate_limited").unwrap(),
            StrategyKind::RateLimited
        );
    }

    #[test]
    fn test_deprecated_aliases_resolve_to_rate_limited() {
        assert_eq!(
            StrategyKind::parse("simple").unwrap(),
            StrategyKind::RateLimited
        );
        assert_eq!(
            StrategyKind::parse("extended").unwrap(),
            StrategyKind::RateLimited
        );
        assert!(StrategyKind::is_deprecated_alias("simple"));
        assert!(StrategyKind::is_deprecated_alias("extended"));
        assert!(!StrategyKind::is_deprecated_alias("rate_limited"));
    }

    #[test]
    fn test_unknown_name_is_config_error() {
        let err = StrategyKind::parse("adaptive").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_default_rule_follows_worker_count() {
        assert_eq!(
            StrategyKind::resolve(None, None, 1).unwrap(),
            StrategyKind::ErrorDriven
        );
        assert_eq!(
            StrategyKind::resolve(None, None, 4).unwrap(),
            StrategyKind::RateLimited
        );
    }

    #[test]
    fn test_flag_beats_env_beats_default() {
        assert_eq!(
            StrategyKind::resolve(Some("error_driven"), Some("rate_limited"), 4).unwrap(),
            StrategyKind::ErrorDriven
        );
        assert_eq!(
            StrategyKind::resolve(None, Some("error_driven"), 4).unwrap(),
            StrategyKind::ErrorDriven
        );
    }

    #[test]
    fn test_cooling_snapshot_remaining() {
        let snap = CoolingSnapshot {
            model: "m".to_string(),
            failure_count: 2,
            attempts_since_failure: 37,
            cooldown_threshold: 100,
        };
        assert_eq!(snap.remaining_attempts(), 63);

        let done = CoolingSnapshot {
            attempts_since_failure: 250,
            ..snap
        };
        assert_eq!(done.remaining_attempts(), 0);
    }
}
