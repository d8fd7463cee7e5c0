//! Latency-driven failover across an ordered set of backends.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use tether_core::backend::{Backend, Resolver};
use tether_core::config::FailoverSettings;
use tether_core::errors::BackendError;

/// Backend lookup duration seconds (histogram, labels: backend).
pub const BACKEND_LOOKUP_DURATION_SECONDS: &str = "backend_lookup_duration_seconds";
/// Rotations away from a slow backend (counter, labels: from).
pub const BACKEND_FAILOVERS_TOTAL: &str = "backend_failovers_total";

/// Failover thresholds applied by [`BackendPool`].
#[derive(Clone, Debug, PartialEq)]
pub struct FailoverPolicy {
    /// Lookups slower than this count as slow responses.
    pub latency_threshold: Duration,
    /// Score above which the pool rotates to the next backend.
    pub switch_threshold: f64,
    /// Added to a backend's score per slow response.
    pub error_increment: f64,
}

impl Default for FailoverPolicy {
    fn default() -> Self {
        Self::from(&FailoverSettings::default())
    }
}

impl From<&FailoverSettings> for FailoverPolicy {
    fn from(settings: &FailoverSettings) -> Self {
        Self {
            latency_threshold: settings.latency_threshold(),
            switch_threshold: settings.switch_threshold,
            error_increment: settings.error_increment,
        }
    }
}

struct BackendSlot {
    backend: Arc<dyn Backend>,
    last_latency: Duration,
    error_score: f64,
}

struct PoolState {
    slots: Vec<BackendSlot>,
    active: usize,
}

/// Point-in-time view of one backend, for health reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendStatus {
    /// Backend name.
    pub name: String,
    /// Whether this backend serves the next resolution.
    pub active: bool,
    /// Current error score. Reset by a timely answer.
    pub error_score: f64,
    /// Duration of the most recent lookup.
    pub last_latency_ms: u64,
}

/// Ordered backends plus the index of the one currently serving.
///
/// Every resolution holds the pool lock for its whole failover loop, so
/// `active` and the per-backend scores always move together. Lookups across
/// connections are therefore serialized.
pub struct BackendPool {
    state: Mutex<PoolState>,
    policy: FailoverPolicy,
}

impl BackendPool {
    /// Returns `None` when `backends` is empty.
    pub fn new(backends: Vec<Arc<dyn Backend>>, policy: FailoverPolicy) -> Option<Self> {
        if backends.is_empty() {
            return None;
        }
        let slots = backends
            .into_iter()
            .map(|backend| BackendSlot {
                backend,
                last_latency: Duration::ZERO,
                error_score: 0.0,
            })
            .collect();
        Some(Self {
            state: Mutex::new(PoolState { slots, active: 0 }),
            policy,
        })
    }

    /// Status of every backend in pool order, or `None` while a resolution
    /// holds the lock. Never waits.
    pub fn try_snapshot(&self) -> Option<Vec<BackendStatus>> {
        let state = self.state.try_lock().ok()?;
        Some(Self::statuses(&state))
    }

    fn statuses(state: &PoolState) -> Vec<BackendStatus> {
        state
            .slots
            .iter()
            .enumerate()
            .map(|(i, slot)| BackendStatus {
                name: slot.backend.name().to_string(),
                active: i == state.active,
                error_score: slot.error_score,
                last_latency_ms: u64::try_from(slot.last_latency.as_millis()).unwrap_or(u64::MAX),
            })
            .collect()
    }
}

#[async_trait]
impl Resolver for BackendPool {
    async fn resolve(&self, prompt: &str) -> Result<String, BackendError> {
        let mut state = self.state.lock().await;
        let total = state.slots.len();
        let mut tries = 0;

        while tries < total {
            let active = state.active;
            let backend = Arc::clone(&state.slots[active].backend);

            let started = Instant::now();
            let found = backend.lookup(prompt).await;
            let latency = started.elapsed();

            let slot = &mut state.slots[active];
            slot.last_latency = latency;
            metrics::histogram!(BACKEND_LOOKUP_DURATION_SECONDS, "backend" => backend.name().to_string())
                .record(latency.as_secs_f64());

            let Some(answer) = found else {
                debug!(backend = backend.name(), "prompt not in table, using fallback");
                return Ok(backend.fallback_answer().to_string());
            };

            if latency <= self.policy.latency_threshold {
                slot.error_score = 0.0;
                return Ok(answer);
            }

            slot.error_score += self.policy.error_increment;
            let score = slot.error_score;
            warn!(
                backend = backend.name(),
                latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX),
                error_score = score,
                "slow backend response"
            );

            if score <= self.policy.switch_threshold {
                return Err(BackendError::SlowResponse {
                    backend: backend.name().to_string(),
                    latency,
                });
            }

            state.active = (active + 1) % total;
            tries += 1;
            metrics::counter!(BACKEND_FAILOVERS_TOTAL, "from" => backend.name().to_string())
                .increment(1);
            info!(
                from = backend.name(),
                to = state.slots[state.active].backend.name(),
                "failing over to next backend"
            );
        }

        Err(BackendError::AllBackendsExhausted { tried: tries })
    }
}
