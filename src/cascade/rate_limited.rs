//! Preemptive cascade: check tier quota before calling, recover on the clock.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use crate::error::{Error, Result};
use crate::llm::{ModelClient, ModelDescriptor, ModelRegistry};
use crate::stats::{CallRecord, UsageStats};

use super::{CascadeResponse, CascadeSnapshot, CascadeStrategy, TierSnapshot};

/// Default fixed quota window.
pub const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default wall-clock fallback after a tier exhausts its quota.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(600);

/// Default calls per window for a tier without an explicit limit.
pub const DEFAULT_WINDOW_LIMIT: u32 = 30;

/// Quota state for one tier.
#[derive(Debug)]
struct TierState {
    tier: usize,
    models: Vec<ModelDescriptor>,
    calls_in_window: u32,
    window_limit: u32,
    window_start: Instant,
    fallback_until: Option<Instant>,
    /// Round-robin cursor, used only when parallel dispatch is on.
    cursor: usize,
}

impl TierState {
    /// A tier in fallback recovers the moment the deadline passes; recovery
    /// resets the window regardless of prior call volume.
    fn try_recover(&mut self, now: Instant) -> bool {
        match self.fallback_until {
            Some(until) if now >= until => {
                self.fallback_until = None;
                self.calls_in_window = 0;
                self.window_start = now;
                debug!(tier = self.tier, "tier recovered from fallback");
                true
            }
            Some(_) => false,
            None => true,
        }
    }
}

/// Preemptive strategy with fixed-window, per-tier quota accounting.
///
/// Tiers are walked in priority order and the first one with window headroom
/// serves the call. An exhausted tier (window full, or the provider returned
/// a quota signal) falls back for a fixed cooldown and recovers purely on the
/// clock; no probing. All quota mutations happen under one mutex so
/// concurrent workers cannot oversubscribe a window.
pub struct RateLimitedCascade {
    client: Arc<dyn ModelClient>,
    stats: Arc<UsageStats>,
    tiers: Mutex<Vec<TierState>>,
    window: Duration,
    cooldown: Duration,
    parallel: bool,
}

impl RateLimitedCascade {
    pub fn new(
        registry: &ModelRegistry,
        client: Arc<dyn ModelClient>,
        stats: Arc<UsageStats>,
    ) -> Self {
        let now = Instant::now();
        let tiers = registry
            .by_tier()
            .into_iter()
            .map(|(tier, models)| TierState {
                tier,
                models: models.into_iter().cloned().collect(),
                calls_in_window: 0,
                window_limit: DEFAULT_WINDOW_LIMIT,
                window_start: now,
                fallback_until: None,
                cursor: 0,
            })
            .collect();

        Self {
            client,
            stats,
            tiers: Mutex::new(tiers),
            window: DEFAULT_WINDOW,
            cooldown: DEFAULT_COOLDOWN,
            parallel: false,
        }
    }

    pub fn with_window(mut self, window: Duration) -> Self {
        self.window = window;
        self
    }

    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    pub fn with_tier_limit(self, tier: usize, limit: u32) -> Self {
        {
            let mut tiers = self.tiers.lock().expect("tier state lock poisoned");
            if let Some(state) = tiers.iter_mut().find(|t| t.tier == tier) {
                state.window_limit = limit.max(1);
            }
        }
        self
    }

    pub fn with_parallel(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    /// Select the highest-priority tier with quota headroom and claim one
    /// call from its window. `skip` holds tiers that already failed
    /// transiently for the current record.
    fn select(&self, skip: &HashSet<usize>) -> Option<(ModelDescriptor, usize)> {
        let now = Instant::now();
        let mut tiers = self.tiers.lock().expect("tier state lock poisoned");

        for state in tiers.iter_mut() {
            if skip.contains(&state.tier) {
                continue;
            }
            if !state.try_recover(now) {
                continue;
            }
            if now.duration_since(state.window_start) >= self.window {
                state.calls_in_window = 0;
                state.window_start = now;
            }
            if state.calls_in_window < state.window_limit {
                state.calls_in_window += 1;
                let model = if self.parallel {
                    let picked = state.models[state.cursor % state.models.len()].clone();
                    state.cursor += 1;
                    picked
                } else {
                    state.models[0].clone()
                };
                return Some((model, state.tier));
            }

            // Window full: the tier goes into wall-clock fallback.
            state.fallback_until = Some(now + self.cooldown);
            warn!(
                tier = state.tier,
                limit = state.window_limit,
                "tier quota exhausted, falling back"
            );
            self.stats.fallback_episode(state.tier);
        }
        None
    }

    /// Push a tier into fallback after the provider itself signalled quota
    /// exhaustion. Counts one episode, but only for a fresh transition.
    fn trip_fallback(&self, tier: usize) {
        let episode = {
            let now = Instant::now();
            let mut tiers = self.tiers.lock().expect("tier state lock poisoned");
            match tiers.iter_mut().find(|t| t.tier == tier) {
                Some(state) if state.fallback_until.is_none() => {
                    state.fallback_until = Some(now + self.cooldown);
                    true
                }
                _ => false,
            }
        };
        if episode {
            warn!(tier, "provider quota signal, tier falling back");
            self.stats.fallback_episode(tier);
        }
    }
}

#[async_trait]
impl CascadeStrategy for RateLimitedCascade {
    #[instrument(skip(self, prompt), fields(record = %record_id))]
    async fn invoke(&self, record_id: &str, prompt: &str) -> Result<CascadeResponse> {
        let mut skip: HashSet<usize> = HashSet::new();
        let mut attempts = 0u32;
        let mut last_error: Option<Error> = None;

        loop {
            let Some((model, tier)) = self.select(&skip) else {
                let last = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "all tiers exhausted or in fallback".to_string());
                return Err(Error::Exhausted { attempts, last });
            };

            attempts += 1;
            let started = std::time::Instant::now();

            match self.client.invoke(&model, prompt).await {
                Ok(response) => {
                    self.stats
                        .record(&CallRecord::success(record_id, &model), started.elapsed());
                    return Ok(CascadeResponse {
                        content: response.content,
                        model: model.id,
                        provider: model.provider,
                        attempts,
                    });
                }
                Err(error) => {
                    self.stats.record(
                        &CallRecord::failure(record_id, &model, error.kind()),
                        started.elapsed(),
                    );
                    if error.is_rate_limited() {
                        self.trip_fallback(tier);
                    } else {
                        warn!(model = %model.label(), %error, "backend failed, trying next tier");
                        skip.insert(tier);
                    }
                    last_error = Some(error);
                }
            }
        }
    }

    fn snapshot(&self) -> CascadeSnapshot {
        let now = Instant::now();
        let tiers = self.tiers.lock().expect("tier state lock poisoned");
        CascadeSnapshot::RateLimited {
            tiers: tiers
                .iter()
                .map(|t| TierSnapshot {
                    tier: t.tier,
                    calls_in_window: t.calls_in_window,
                    window_limit: t.window_limit,
                    fallback_remaining: t
                        .fallback_until
                        .map(|until| until.saturating_duration_since(now)),
                })
                .collect(),
        }
    }

    fn name(&self) -> &'static str {
        "rate_limited"
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::config::CascadeConfig;
    use crate::error::ErrorKind;
    use crate::llm::testing::{ScriptedClient, Step};
    use crate::llm::Provider;

    fn registry(models: Vec<ModelDescriptor>) -> ModelRegistry {
        ModelRegistry::from_config(&CascadeConfig {
            models,
            ..CascadeConfig::default()
        })
        .unwrap()
    }

    fn two_tier_registry() -> ModelRegistry {
        registry(vec![
            ModelDescriptor::new(Provider::Gemini, "fast", 0),
            ModelDescriptor::new(Provider::Groq, "slow", 1),
        ])
    }

    fn tier_snapshot(strategy: &RateLimitedCascade) -> Vec<TierSnapshot> {
        match strategy.snapshot() {
            CascadeSnapshot::RateLimited { tiers } => tiers,
            _ => unreachable!(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_exhaustion_falls_through_tiers() {
        let stats = Arc::new(UsageStats::new());
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(ScriptedClient::new()),
            Arc::clone(&stats),
        )
        .with_tier_limit(0, 2)
        .with_tier_limit(1, 100);

        // The first two calls consume tier 0's window.
        assert_eq!(strategy.invoke("r1", "p").await.unwrap().model, "fast");
        assert_eq!(strategy.invoke("r2", "p").await.unwrap().model, "fast");

        // Window full: this and subsequent calls route to tier 1.
        assert_eq!(strategy.invoke("r3", "p").await.unwrap().model, "slow");
        assert_eq!(strategy.invoke("r4", "p").await.unwrap().model, "slow");

        assert_eq!(stats.tier_counters(0).fallback_episodes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_exactly_at_fallback_deadline() {
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(ScriptedClient::new()),
            Arc::new(UsageStats::new()),
        )
        .with_tier_limit(0, 1)
        .with_cooldown(Duration::from_secs(600));

        strategy.invoke("r1", "p").await.unwrap();
        // Tier 0 trips into fallback on the next selection walk.
        assert_eq!(strategy.invoke("r2", "p").await.unwrap().model, "slow");

        // One second short of the deadline the tier is still out.
        tokio::time::advance(Duration::from_secs(599)).await;
        assert_eq!(strategy.invoke("r3", "p").await.unwrap().model, "slow");

        // Exactly at the deadline it is selectable again, window reset.
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(strategy.invoke("r4", "p").await.unwrap().model, "fast");

        let snapshot = tier_snapshot(&strategy);
        assert_eq!(snapshot[0].fallback_remaining, None);
        assert_eq!(snapshot[0].calls_in_window, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_resets_after_window_elapses() {
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(ScriptedClient::new()),
            Arc::new(UsageStats::new()),
        )
        .with_tier_limit(0, 2)
        .with_window(Duration::from_secs(60));

        strategy.invoke("r1", "p").await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        strategy.invoke("r2", "p").await.unwrap();
        strategy.invoke("r3", "p").await.unwrap();

        // The old window's call does not count against the new window, so
        // tier 0 is still serving and never tripped fallback.
        let snapshot = tier_snapshot(&strategy);
        assert_eq!(snapshot[0].calls_in_window, 2);
        assert_eq!(snapshot[0].fallback_remaining, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_provider_quota_signal_trips_tier() {
        let client = ScriptedClient::new().script("fast", vec![Step::Fail(ErrorKind::RateLimited)]);
        let stats = Arc::new(UsageStats::new());
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(client),
            Arc::clone(&stats),
        );

        // Plenty of window headroom, but the provider says quota.
        let response = strategy.invoke("r1", "p").await.unwrap();
        assert_eq!(response.model, "slow");
        assert_eq!(response.attempts, 2);

        // The tier is in fallback now; later records skip it outright.
        let response = strategy.invoke("r2", "p").await.unwrap();
        assert_eq!(response.model, "slow");

        assert_eq!(stats.tier_counters(0).fallback_episodes, 1);
        assert!(tier_snapshot(&strategy)[0].fallback_remaining.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_failure_skips_tier_for_record_only() {
        let client = ScriptedClient::new().script(
            "fast",
            vec![
                Step::Fail(ErrorKind::Transient),
                Step::Succeed("ok".to_string()),
            ],
        );
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(client),
            Arc::new(UsageStats::new()),
        );

        // Transient failure cascades within the record without tripping
        // fallback for the tier.
        assert_eq!(strategy.invoke("r1", "p").await.unwrap().model, "slow");
        // The next record tries tier 0 again.
        assert_eq!(strategy.invoke("r2", "p").await.unwrap().model, "fast");
    }

    #[tokio::test(start_paused = true)]
    async fn test_total_exhaustion() {
        let client = ScriptedClient::new()
            .script("fast", vec![Step::Fail(ErrorKind::Transient)])
            .script("slow", vec![Step::Fail(ErrorKind::Transient)]);
        let strategy = RateLimitedCascade::new(
            &two_tier_registry(),
            Arc::new(client),
            Arc::new(UsageStats::new()),
        );

        let err = strategy.invoke("r1", "p").await.unwrap_err();
        assert!(matches!(err, Error::Exhausted { attempts: 2, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_parallel_round_robin_within_tier() {
        let models = vec![
            ModelDescriptor::new(Provider::Groq, "m1", 0),
            ModelDescriptor::new(Provider::Groq, "m2", 0),
        ];
        let client = Arc::new(ScriptedClient::new());
        let strategy = RateLimitedCascade::new(
            &registry(models),
            Arc::clone(&client) as Arc<dyn ModelClient>,
            Arc::new(UsageStats::new()),
        )
        .with_parallel(true);

        strategy.invoke("r1", "p").await.unwrap();
        strategy.invoke("r2", "p").await.unwrap();
        strategy.invoke("r3", "p").await.unwrap();

        assert_eq!(client.calls(), vec!["m1", "m2", "m1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_accounting_under_concurrency() {
        let stats = Arc::new(UsageStats::new());
        let strategy = Arc::new(
            RateLimitedCascade::new(
                &two_tier_registry(),
                Arc::new(ScriptedClient::new()),
                Arc::clone(&stats),
            )
            .with_tier_limit(0, 5)
            .with_tier_limit(1, 100),
        );

        let workers: Vec<_> = (0..10)
            .map(|i| {
                let s = Arc::clone(&strategy);
                tokio::spawn(async move { s.invoke(&format!("r{i}"), "p").await })
            })
            .collect();
        for handle in workers {
            handle.await.unwrap().unwrap();
        }

        // Tier 0 served exactly its window, never more.
        assert_eq!(stats.tier_counters(0).total_calls, 5);
        assert_eq!(stats.tier_counters(1).total_calls, 5);
    }
}
