//! Backend registry: per-pipeline state, leases, health.
//!
//! All mutable per-backend state lives behind one `parking_lot::Mutex` per
//! backend, so counter updates and breaker transitions for a pipeline are
//! serialized without any global lock. A [`Lease`] proves an in-flight slot
//! was reserved; dropping it without an explicit outcome releases the slot
//! as a cancellation so the count can never leak.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::breaker::{Admission, Breaker, BreakerState};
use crate::config::{
    BreakerConfig, CategoryRoute, HealthConfig, PipelineEntry, RoutingTable,
};
use crate::error::GatewayError;

/// EWMA smoothing factor. 0.3 = 30% weight on new sample, 70% on history.
const EWMA_ALPHA: f64 = 0.3;

/// Penalty multiplier applied to the EWMA when a request fails, in place of
/// a wall-clock sample (failure latency doesn't reflect backend speed).
const FAILURE_PENALTY: f64 = 2.0;

/// Window length for the success-rate estimate.
const SUCCESS_WINDOW: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
}

/// Result of one leased request, folded into stats on release.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    /// Completed; latency feeds the EWMA, breaker closes.
    Success(Duration),
    /// Backend-fault failure; feeds the EWMA penalty and the breaker.
    Failure,
    /// Caller went away. Releases the slot, touches nothing else.
    Canceled,
    /// The request itself was bad. Not the backend's fault; only the slot
    /// is released.
    ClientFault,
}

#[derive(Debug)]
struct BackendInner {
    status: HealthStatus,
    in_flight: u32,
    ewma_latency: f64,
    samples: u64,
    success_window: std::collections::VecDeque<bool>,
    probe_failures: u32,
    last_probe: Option<Instant>,
    breaker: Breaker,
}

/// Live state for one pipeline entry. Created at table build, destroyed
/// only on table rebuild.
#[derive(Debug)]
pub struct BackendState {
    pub entry: Arc<PipelineEntry>,
    inner: Mutex<BackendInner>,
}

impl BackendState {
    fn new(entry: Arc<PipelineEntry>, breaker_config: BreakerConfig) -> Self {
        Self {
            entry,
            inner: Mutex::new(BackendInner {
                status: HealthStatus::Healthy,
                in_flight: 0,
                ewma_latency: 0.0,
                samples: 0,
                success_window: std::collections::VecDeque::with_capacity(SUCCESS_WINDOW),
                probe_failures: 0,
                last_probe: None,
                breaker: Breaker::new(breaker_config),
            }),
        }
    }

    pub fn pipeline_id(&self) -> &str {
        &self.entry.pipeline_id
    }

    pub fn in_flight(&self) -> u32 {
        self.inner.lock().in_flight
    }

    pub fn ewma_latency_ms(&self) -> f64 {
        self.inner.lock().ewma_latency * 1000.0
    }

    pub fn status(&self) -> HealthStatus {
        self.inner.lock().status
    }

    pub fn breaker_state(&self) -> BreakerState {
        self.inner.lock().breaker.state()
    }

    /// Candidate filter: healthy-enough and breaker not rejecting.
    fn is_selectable(&self, now: Instant) -> bool {
        let inner = self.inner.lock();
        match inner.status {
            HealthStatus::Unhealthy | HealthStatus::Disabled => false,
            HealthStatus::Healthy | HealthStatus::Degraded => inner.breaker.is_available(now),
        }
    }

    fn fold_outcome(&self, outcome: Outcome) {
        let mut inner = self.inner.lock();
        inner.in_flight = inner.in_flight.saturating_sub(1);

        match outcome {
            Outcome::Success(latency) => {
                let secs = latency.as_secs_f64();
                if inner.samples == 0 {
                    inner.ewma_latency = secs;
                } else {
                    inner.ewma_latency = EWMA_ALPHA * secs + (1.0 - EWMA_ALPHA) * inner.ewma_latency;
                }
                inner.samples += 1;
                push_window(&mut inner.success_window, true);
                inner.breaker.record_success();
            }
            Outcome::Failure => {
                if inner.ewma_latency > 0.0 {
                    let penalty = inner.ewma_latency * FAILURE_PENALTY;
                    inner.ewma_latency =
                        EWMA_ALPHA * penalty + (1.0 - EWMA_ALPHA) * inner.ewma_latency;
                }
                inner.samples += 1;
                push_window(&mut inner.success_window, false);
                inner.breaker.record_failure(Instant::now());
                if inner.breaker.state() == BreakerState::Open {
                    warn!(
                        pipeline = %self.entry.pipeline_id,
                        "circuit breaker opened"
                    );
                }
            }
            Outcome::Canceled | Outcome::ClientFault => {}
        }
    }
}

fn push_window(window: &mut std::collections::VecDeque<bool>, ok: bool) {
    if window.len() == SUCCESS_WINDOW {
        window.pop_front();
    }
    window.push_back(ok);
}

/// Proof of a reserved in-flight slot on one pipeline.
///
/// Release exactly once: explicitly via [`Lease::complete`], or implicitly
/// on drop (recorded as a cancellation).
#[derive(Debug)]
pub struct Lease {
    backend: Arc<BackendState>,
    released: bool,
}

impl Lease {
    pub fn backend(&self) -> &Arc<BackendState> {
        &self.backend
    }

    pub fn entry(&self) -> &Arc<PipelineEntry> {
        &self.backend.entry
    }

    pub fn complete(mut self, outcome: Outcome) {
        self.backend.fold_outcome(outcome);
        self.released = true;
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.released {
            debug!(
                pipeline = %self.backend.entry.pipeline_id,
                "lease dropped without outcome, releasing as canceled"
            );
            self.backend.fold_outcome(Outcome::Canceled);
        }
    }
}

/// Serializable view of one backend for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BackendSnapshot {
    pub pipeline_id: String,
    pub provider_id: String,
    pub status: HealthStatus,
    pub breaker: &'static str,
    pub in_flight: u32,
    pub ewma_latency_ms: f64,
    pub success_rate: f64,
}

/// Owns every [`BackendState`] for the current routing table.
pub struct BackendRegistry {
    backends: HashMap<String, Arc<BackendState>>,
    health: HealthConfig,
}

impl BackendRegistry {
    pub fn new(table: &RoutingTable, breaker: BreakerConfig, health: HealthConfig) -> Self {
        let backends = table
            .all_entries()
            .into_iter()
            .map(|entry| {
                (
                    entry.pipeline_id.clone(),
                    Arc::new(BackendState::new(entry, breaker)),
                )
            })
            .collect();
        Self { backends, health }
    }

    pub fn get(&self, pipeline_id: &str) -> Option<&Arc<BackendState>> {
        self.backends.get(pipeline_id)
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<BackendState>> {
        self.backends.values()
    }

    /// Selectable backends for a category route, in table order. Filters
    /// out unhealthy backends and open breakers.
    pub fn candidates(&self, route: &CategoryRoute) -> Vec<Arc<BackendState>> {
        let now = Instant::now();
        route
            .entries
            .iter()
            .filter_map(|entry| self.backends.get(&entry.pipeline_id))
            .filter(|b| b.is_selectable(now))
            .cloned()
            .collect()
    }

    /// Reserve an in-flight slot. Fails with `CapacityExhausted` at the
    /// concurrency cap and `NoBackendAvailable`-style rejection when the
    /// breaker refuses admission.
    pub fn begin(&self, backend: &Arc<BackendState>) -> Result<Lease, GatewayError> {
        let mut inner = backend.inner.lock();

        match inner.breaker.admit(Instant::now()) {
            Admission::Reject => {
                crate::metrics::record_breaker_rejection(&backend.entry.pipeline_id);
                return Err(GatewayError::BackendTransient(format!(
                    "breaker open for {}",
                    backend.entry.pipeline_id
                )));
            }
            Admission::Allow | Admission::AllowProbe => {}
        }

        if inner.in_flight >= backend.entry.max_concurrent {
            return Err(GatewayError::CapacityExhausted);
        }
        inner.in_flight += 1;
        drop(inner);

        Ok(Lease {
            backend: backend.clone(),
            released: false,
        })
    }

    /// Fold a health-probe result in and apply the status transitions:
    /// one failure degrades, `failure_threshold` consecutive failures mark
    /// unhealthy, one success restores healthy.
    pub fn record_probe(&self, pipeline_id: &str, success: bool) {
        let Some(backend) = self.backends.get(pipeline_id) else {
            return;
        };
        let mut inner = backend.inner.lock();
        inner.last_probe = Some(Instant::now());

        if success {
            if inner.status != HealthStatus::Disabled && inner.status != HealthStatus::Healthy {
                info!(pipeline = pipeline_id, "probe succeeded, backend healthy");
            }
            if inner.status != HealthStatus::Disabled {
                inner.status = HealthStatus::Healthy;
            }
            inner.probe_failures = 0;
        } else {
            inner.probe_failures += 1;
            let next = if inner.probe_failures >= self.health.failure_threshold {
                HealthStatus::Unhealthy
            } else {
                HealthStatus::Degraded
            };
            if inner.status != HealthStatus::Disabled && inner.status != next {
                warn!(
                    pipeline = pipeline_id,
                    failures = inner.probe_failures,
                    status = ?next,
                    "probe failed"
                );
                inner.status = next;
            }
        }
    }

    /// Credential resolution failed for this pipeline: it cannot serve
    /// anything, so mark unhealthy and open the breaker immediately.
    pub fn mark_credential_failure(&self, pipeline_id: &str) {
        if let Some(backend) = self.backends.get(pipeline_id) {
            let mut inner = backend.inner.lock();
            inner.status = HealthStatus::Unhealthy;
            inner.breaker.trip_now(Instant::now());
            warn!(pipeline = pipeline_id, "credential failure, backend marked unhealthy");
        }
    }

    pub fn snapshot(&self) -> Vec<BackendSnapshot> {
        let mut out: Vec<BackendSnapshot> = self
            .backends
            .values()
            .map(|b| {
                let inner = b.inner.lock();
                let success_rate = if inner.success_window.is_empty() {
                    1.0
                } else {
                    inner.success_window.iter().filter(|ok| **ok).count() as f64
                        / inner.success_window.len() as f64
                };
                BackendSnapshot {
                    pipeline_id: b.entry.pipeline_id.clone(),
                    provider_id: b.entry.provider_id.clone(),
                    status: inner.status,
                    breaker: inner.breaker.state().as_str(),
                    in_flight: inner.in_flight,
                    ewma_latency_ms: inner.ewma_latency * 1000.0,
                    success_rate,
                }
            })
            .collect();
        out.sort_by(|a, b| a.pipeline_id.cmp(&b.pipeline_id));
        out
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.health.probe_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.health.probe_timeout_ms)
    }
}

/// Periodic health probing. `probe` issues one minimal upstream request and
/// reports whether it succeeded; the loop applies the status transitions.
pub async fn probe_loop<F, Fut>(registry: Arc<BackendRegistry>, probe: F)
where
    F: Fn(Arc<PipelineEntry>) -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let interval = registry.probe_interval();
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let entries: Vec<Arc<PipelineEntry>> =
            registry.all().map(|b| b.entry.clone()).collect();
        for entry in entries {
            let id = entry.pipeline_id.clone();
            let ok = probe(entry).await;
            registry.record_probe(&id, ok);
        }
    }
}
