//! Reactive cascade: call until a backend errors, then fail over.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::llm::{ModelClient, ModelDescriptor, ModelRegistry};
use crate::stats::{CallRecord, UsageStats};

use super::{CascadeResponse, CascadeSnapshot, CascadeStrategy, CoolingSnapshot};

/// Default global attempts a failed backend sits out before being probed.
pub const DEFAULT_COOLDOWN_THRESHOLD: u64 = 100;

/// A backend parked in the cooldown queue.
#[derive(Debug, Clone)]
struct CoolingModel {
    model: ModelDescriptor,
    failure_count: u32,
    attempts_since_failure: u64,
}

/// Shared cascade state. Every registry model is in exactly one of the two
/// collections; a model checked out for an in-flight call rejoins on the
/// success or failure path before the next selection can see it missing.
#[derive(Debug)]
struct CascadeState {
    /// Active stack; the top (last element) is tried first.
    active: Vec<ModelDescriptor>,
    /// Failed backends in FIFO order; the front is the most-aged member.
    cooling: VecDeque<CoolingModel>,
}

/// A selected backend plus the bookkeeping needed to re-queue it on failure.
struct Candidate {
    model: ModelDescriptor,
    prior_failures: u32,
    probe: bool,
}

/// Reactive strategy: backends stay in play until they actually error.
///
/// Failed backends queue up in FIFO order and age on a run-global logical
/// clock; after `cooldown_threshold` invocations from any worker they are
/// probed ahead of the active stack. A successful probe promotes the backend
/// to the top of the stack, a failed probe sends it to the back of the queue.
pub struct ErrorDrivenCascade {
    client: Arc<dyn ModelClient>,
    stats: Arc<UsageStats>,
    state: Mutex<CascadeState>,
    cooldown_threshold: u64,
}

impl ErrorDrivenCascade {
    pub fn new(
        registry: &ModelRegistry,
        client: Arc<dyn ModelClient>,
        stats: Arc<UsageStats>,
    ) -> Self {
        // Stored lowest-priority first so the top of the stack (the end)
        // starts as the highest-priority backend.
        let active: Vec<ModelDescriptor> = registry.all_models().iter().rev().cloned().collect();

        Self {
            client,
            stats,
            state: Mutex::new(CascadeState {
                active,
                cooling: VecDeque::new(),
            }),
            cooldown_threshold: DEFAULT_COOLDOWN_THRESHOLD,
        }
    }

    pub fn with_cooldown_threshold(mut self, threshold: u64) -> Self {
        self.cooldown_threshold = threshold.max(1);
        self
    }

    /// Advance the run-global attempt clock by one tick.
    fn tick(&self) {
        let mut state = self.state.lock().expect("cascade state lock poisoned");
        for cooling in state.cooling.iter_mut() {
            cooling.attempts_since_failure += 1;
        }
    }

    /// Pick the next candidate: an aged-out cooling backend is probed first,
    /// otherwise the top of the active stack.
    ///
    /// The queue ages uniformly and re-entries reset to zero, so the front is
    /// always the most-aged member; checking it alone is sufficient.
    fn select(&self) -> Option<Candidate> {
        let mut state = self.state.lock().expect("cascade state lock poisoned");

        let front_eligible = state
            .cooling
            .front()
            .is_some_and(|c| c.attempts_since_failure >= self.cooldown_threshold);
        if front_eligible {
            if let Some(cooling) = state.cooling.pop_front() {
                debug!(model = %cooling.model.label(), "probing cooled backend");
                return Some(Candidate {
                    model: cooling.model,
                    prior_failures: cooling.failure_count,
                    probe: true,
                });
            }
        }

        state.active.pop().map(|model| Candidate {
            model,
            prior_failures: 0,
            probe: false,
        })
    }

    fn on_success(&self, candidate: Candidate) {
        let mut state = self.state.lock().expect("cascade state lock poisoned");
        if candidate.probe {
            info!(model = %candidate.model.label(), "probe succeeded, backend reactivated");
        }
        state.active.push(candidate.model);
    }

    fn on_failure(&self, candidate: Candidate) {
        let mut state = self.state.lock().expect("cascade state lock poisoned");
        state.cooling.push_back(CoolingModel {
            model: candidate.model,
            failure_count: candidate.prior_failures + 1,
            attempts_since_failure: 0,
        });
    }
}

#[async_trait]
impl CascadeStrategy for ErrorDrivenCascade {
    #[instrument(skip(self, prompt), fields(record = %record_id))]
    async fn invoke(&self, record_id: &str, prompt: &str) -> Result<CascadeResponse> {
        self.tick();

        let mut attempts = 0u32;
        let mut last_error: Option<Error> = None;

        loop {
            let Some(candidate) = self.select() else {
                let last = last_error
                    .map(|e| e.to_string())
                    .unwrap_or_else(|| "no backends available".to_string());
                return Err(Error::Exhausted { attempts, last });
            };

            attempts += 1;
            let started = std::time::Instant::now();

            match self.client.invoke(&candidate.model, prompt).await {
                Ok(response) => {
                    self.stats.record(
                        &CallRecord::success(record_id, &candidate.model),
                        started.elapsed(),
                    );
                    let model = candidate.model.clone();
                    self.on_success(candidate);
                    return Ok(CascadeResponse {
                        content: response.content,
                        model: model.id,
                        provider: model.provider,
                        attempts,
                    });
                }
                Err(error) => {
                    warn!(
                        model = %candidate.model.label(),
                        %error,
                        "backend failed, cascading"
                    );
                    self.stats.record(
                        &CallRecord::failure(record_id, &candidate.model, error.kind()),
                        started.elapsed(),
                    );
                    self.on_failure(candidate);
                    last_error = Some(error);
                }
            }
        }
    }

    fn snapshot(&self) -> CascadeSnapshot {
        let state = self.state.lock().expect("cascade state lock poisoned");
        CascadeSnapshot::ErrorDriven {
            active: state.active.iter().rev().map(|m| m.label()).collect(),
            cooling: state
                .cooling
                .iter()
                .map(|c| CoolingSnapshot {
                    model: c.model.label(),
                    failure_count: c.failure_count,
                    attempts_since_failure: c.attempts_since_failure,
                    cooldown_threshold: self.cooldown_threshold,
                })
                .collect(),
        }
    }

    fn name(&self) -> &'static str {
        "error_driven"
    }
}
