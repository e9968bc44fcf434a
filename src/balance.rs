//! Load balancing across the pipelines of a category.
//!
//! Selection is one pass: order the live candidates per the configured
//! strategy, then take the first that yields a lease. No waiting and no
//! queueing here; if nothing leases, the request fails with
//! `NoBackendAvailable` and the caller decides what that means.

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

use crate::config::{Category, CategoryRoute, Strategy};
use crate::error::GatewayError;
use crate::registry::{BackendRegistry, BackendState, Lease};

/// Utilization ratio above which the adaptive strategy switches to
/// least-response-time for the current pick.
const ADAPTIVE_PRESSURE: f64 = 0.8;

/// Hard cap on tracked sticky sessions; oldest-expiring entries are evicted
/// past this point.
const STICKY_CAPACITY: usize = 10_000;

#[derive(Debug, Clone)]
struct StickyEntry {
    pipeline_id: String,
    expires_at: Instant,
}

pub struct LoadBalancer {
    rr_counters: DashMap<Category, AtomicU64>,
    sticky: DashMap<String, StickyEntry>,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadBalancer {
    pub fn new() -> Self {
        Self {
            rr_counters: DashMap::new(),
            sticky: DashMap::new(),
        }
    }

    /// Pick one backend for this request and reserve a lease on it.
    ///
    /// `exclude` carries pipeline ids already tried within this request so
    /// cross-pipeline retries never land on the same backend twice.
    pub fn select(
        &self,
        category: Category,
        route: &CategoryRoute,
        registry: &BackendRegistry,
        session_key: Option<&str>,
        exclude: &HashSet<String>,
    ) -> Result<Lease, GatewayError> {
        let candidates: Vec<Arc<BackendState>> = registry
            .candidates(route)
            .into_iter()
            .filter(|b| !exclude.contains(b.pipeline_id()))
            .collect();

        if candidates.is_empty() {
            return Err(GatewayError::NoBackendAvailable(category.to_string()));
        }

        // Sticky hit: force-select the bound pipeline when it is still a
        // live candidate; otherwise fall through and rebind below. Bindings
        // are scoped per category so one session can stick differently in
        // each.
        let sticky_key = session_key.map(|key| format!("{category}/{key}"));
        if let Some(key) = &sticky_key {
            if let Some(bound) = self.sticky_lookup(key) {
                if let Some(backend) = candidates
                    .iter()
                    .find(|b| b.pipeline_id() == bound)
                    .cloned()
                {
                    if let Ok(lease) = registry.begin(&backend) {
                        debug!(session = %key, pipeline = %bound, "sticky session hit");
                        self.bind(key, &backend, route.sticky_session_ttl);
                        return Ok(lease);
                    }
                }
            }
        }

        let ordered = self.order(category, route.strategy, &candidates);
        for backend in ordered {
            match registry.begin(&backend) {
                Ok(lease) => {
                    if let Some(key) = &sticky_key {
                        self.bind(key, &backend, route.sticky_session_ttl);
                    }
                    return Ok(lease);
                }
                Err(_) => continue,
            }
        }

        Err(GatewayError::NoBackendAvailable(category.to_string()))
    }

    /// Produce the try-order for the candidates under a strategy.
    fn order(
        &self,
        category: Category,
        strategy: Strategy,
        candidates: &[Arc<BackendState>],
    ) -> Vec<Arc<BackendState>> {
        match strategy {
            Strategy::RoundRobin => self.order_round_robin(category, candidates),
            Strategy::Weighted => order_weighted(candidates),
            Strategy::LeastConnections => order_least_connections(candidates),
            Strategy::LeastResponseTime => order_least_response_time(candidates),
            Strategy::Adaptive => {
                let pressured = candidates.iter().any(|b| {
                    b.in_flight() as f64 / b.entry.max_concurrent as f64 > ADAPTIVE_PRESSURE
                });
                if pressured {
                    order_least_response_time(candidates)
                } else {
                    self.order_round_robin(category, candidates)
                }
            }
        }
    }

    fn order_round_robin(
        &self,
        category: Category,
        candidates: &[Arc<BackendState>],
    ) -> Vec<Arc<BackendState>> {
        let counter = self
            .rr_counters
            .entry(category)
            .or_insert_with(|| AtomicU64::new(0));
        let start = counter.fetch_add(1, Ordering::Relaxed) as usize % candidates.len();
        let mut ordered = Vec::with_capacity(candidates.len());
        for i in 0..candidates.len() {
            ordered.push(candidates[(start + i) % candidates.len()].clone());
        }
        ordered
    }

    fn sticky_lookup(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        // Clone out of the guard before any removal; dashmap deadlocks if a
        // shard is written while one of its refs is held.
        let hit = self
            .sticky
            .get(key)
            .map(|e| (e.pipeline_id.clone(), e.expires_at));
        match hit {
            Some((id, expires_at)) if expires_at > now => Some(id),
            Some(_) => {
                self.sticky.remove(key);
                None
            }
            None => None,
        }
    }

    fn bind(&self, key: &str, backend: &Arc<BackendState>, ttl: Duration) {
        self.sticky.insert(
            key.to_string(),
            StickyEntry {
                pipeline_id: backend.pipeline_id().to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        if self.sticky.len() > STICKY_CAPACITY {
            self.evict_sticky();
        }
    }

    /// Lazy sweep: drop expired entries, then oldest-expiring until under
    /// capacity.
    fn evict_sticky(&self) {
        let now = Instant::now();
        self.sticky.retain(|_, v| v.expires_at > now);

        let over = self.sticky.len().saturating_sub(STICKY_CAPACITY);
        if over == 0 {
            return;
        }
        let mut by_expiry: Vec<(String, Instant)> = self
            .sticky
            .iter()
            .map(|e| (e.key().clone(), e.value().expires_at))
            .collect();
        by_expiry.sort_by_key(|(_, exp)| *exp);
        for (key, _) in by_expiry.into_iter().take(over) {
            self.sticky.remove(&key);
        }
    }

    #[cfg(test)]
    fn sticky_len(&self) -> usize {
        self.sticky.len()
    }
}

/// Cumulative-weight pick: uniform random in [0, Σw), candidate i selected
/// when the running sum crosses the pick. Remaining candidates follow in
/// entry order as lease fallbacks.
fn order_weighted(candidates: &[Arc<BackendState>]) -> Vec<Arc<BackendState>> {
    let total: u64 = candidates.iter().map(|b| b.entry.weight as u64).sum();
    let pick = fastrand::u64(0..total.max(1));

    let mut running = 0u64;
    let mut chosen = 0usize;
    for (i, backend) in candidates.iter().enumerate() {
        running += backend.entry.weight as u64;
        if pick < running {
            chosen = i;
            break;
        }
    }

    let mut ordered = vec![candidates[chosen].clone()];
    ordered.extend(
        candidates
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != chosen)
            .map(|(_, b)| b.clone()),
    );
    ordered
}

/// Minimum in-flight, ties broken by EWMA latency, then by entry index
/// (the sort is stable so index order survives equal keys).
fn order_least_connections(candidates: &[Arc<BackendState>]) -> Vec<Arc<BackendState>> {
    let mut keyed: Vec<(u32, f64, Arc<BackendState>)> = candidates
        .iter()
        .map(|b| (b.in_flight(), b.ewma_latency_ms(), b.clone()))
        .collect();
    keyed.sort_by(|a, b| {
        a.0.cmp(&b.0)
            .then(a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
    });
    keyed.into_iter().map(|(_, _, b)| b).collect()
}

/// Minimum EWMA latency, ties broken by in-flight count.
fn order_least_response_time(candidates: &[Arc<BackendState>]) -> Vec<Arc<BackendState>> {
    let mut keyed: Vec<(f64, u32, Arc<BackendState>)> = candidates
        .iter()
        .map(|b| (b.ewma_latency_ms(), b.in_flight(), b.clone()))
        .collect();
    keyed.sort_by(|a, b| {
        a.0.partial_cmp(&b.0)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.1.cmp(&b.1))
    });
    keyed.into_iter().map(|(_, _, b)| b).collect()
}
