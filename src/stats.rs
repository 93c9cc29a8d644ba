//! Usage accounting for the run: per-model and per-tier counters.
//!
//! Strategies emit one [`CallRecord`] per backend attempt; the aggregator
//! accumulates them for the lifetime of the run and renders a single report
//! at shutdown. Counters sit behind short-lived mutexes, never held across
//! a network call.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::cascade::CascadeSnapshot;
use crate::error::ErrorKind;
use crate::llm::ModelDescriptor;

/// One backend attempt. Write-once, append-only.
#[derive(Debug, Clone, Serialize)]
pub struct CallRecord {
    pub record_id: String,
    pub model: String,
    pub tier: usize,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl CallRecord {
    pub fn success(record_id: impl Into<String>, model: &ModelDescriptor) -> Self {
        Self {
            record_id: record_id.into(),
            model: model.label(),
            tier: model.tier,
            success: true,
            error_kind: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failure(
        record_id: impl Into<String>,
        model: &ModelDescriptor,
        error_kind: Option<ErrorKind>,
    ) -> Self {
        Self {
            record_id: record_id.into(),
            model: model.label(),
            tier: model.tier,
            success: false,
            error_kind,
            timestamp: Utc::now(),
        }
    }
}

/// Per-model call counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ModelCounters {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
}

/// Per-tier aggregates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierCounters {
    pub total_calls: u64,
    pub total_duration: Duration,
    pub fallback_episodes: u64,
}

/// Run-lifetime usage aggregator. Read-only after the final report.
#[derive(Debug, Default)]
pub struct UsageStats {
    models: Mutex<BTreeMap<String, ModelCounters>>,
    tiers: Mutex<BTreeMap<usize, TierCounters>>,
}

impl UsageStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one call record into the counters.
    pub fn record(&self, record: &CallRecord, duration: Duration) {
        {
            let mut models = self.models.lock().expect("stats lock poisoned");
            let entry = models.entry(record.model.clone()).or_default();
            entry.calls += 1;
            if record.success {
                entry.successes += 1;
            } else {
                entry.failures += 1;
            }
        }

        let mut tiers = self.tiers.lock().expect("stats lock poisoned");
        let entry = tiers.entry(record.tier).or_default();
        entry.total_calls += 1;
        entry.total_duration += duration;
    }

    /// Count one tier entering wall-clock fallback.
    pub fn fallback_episode(&self, tier: usize) {
        let mut tiers = self.tiers.lock().expect("stats lock poisoned");
        tiers.entry(tier).or_default().fallback_episodes += 1;
    }

    pub fn model_counters(&self, model: &str) -> ModelCounters {
        self.models
            .lock()
            .expect("stats lock poisoned")
            .get(model)
            .copied()
            .unwrap_or_default()
    }

    pub fn tier_counters(&self, tier: usize) -> TierCounters {
        self.tiers
            .lock()
            .expect("stats lock poisoned")
            .get(&tier)
            .copied()
            .unwrap_or_default()
    }

    /// Render the end-of-run report, including the cascade state snapshot.
    pub fn report(&self, snapshot: &CascadeSnapshot) -> String {
        let models = self.models.lock().expect("stats lock poisoned");
        let tiers = self.tiers.lock().expect("stats lock poisoned");

        let mut out = String::from("=== usage statistics ===\n");

        out.push_str("per model:\n");
        if models.is_empty() {
            out.push_str("  (no calls made)\n");
        }
        for (model, c) in models.iter() {
            let _ = writeln!(
                out,
                "  {:<45} calls={:<5} ok={:<5} err={}",
                model, c.calls, c.successes, c.failures
            );
        }

        out.push_str("per tier:\n");
        for (tier, c) in tiers.iter() {
            let _ = writeln!(
                out,
                "  tier {:<2} calls={:<5} total_duration={:.1}s fallback_episodes={}",
                tier,
                c.total_calls,
                c.total_duration.as_secs_f64(),
                c.fallback_episodes
            );
        }

        let _ = write!(out, "{}", snapshot);
        out
    }
}
