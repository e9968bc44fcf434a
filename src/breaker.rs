//! Per-pipeline circuit breaker.
//!
//! A plain state machine with no interior locking; the registry guards each
//! instance with its backend's lock, so transitions are serialized per
//! pipeline. The `open -> half_open` check happens inside `admit`, which
//! means exactly one caller observes the expiry and claims the probe slot.

use std::time::{Duration, Instant};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl BreakerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerState::Closed => "closed",
            BreakerState::Open => "open",
            BreakerState::HalfOpen => "half_open",
        }
    }
}

/// Outcome of asking the breaker whether a request may proceed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Breaker closed; request flows normally.
    Allow,
    /// Breaker half-open; this request holds one of the probe permits.
    AllowProbe,
    /// Breaker open; fail fast without touching the upstream.
    Reject,
}

#[derive(Debug)]
pub struct Breaker {
    state: BreakerState,
    consecutive_failures: u32,
    open_until: Option<Instant>,
    /// Recovery timeout currently in effect; doubles on each half-open
    /// failure up to the configured ceiling.
    current_recovery: Duration,
    half_open_in_flight: u32,
    config: BreakerConfig,
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            open_until: None,
            current_recovery: config.recovery_timeout(),
            half_open_in_flight: 0,
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether a candidate list should include this pipeline right now.
    /// Does not claim a probe permit; `admit` does that.
    pub fn is_available(&self, now: Instant) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => self.open_until.map(|t| now >= t).unwrap_or(true),
        }
    }

    /// Gate one request. Performs the timed `open -> half_open` transition
    /// when due, and hands out half-open probe permits.
    pub fn admit(&mut self, now: Instant) -> Admission {
        if self.state == BreakerState::Open {
            match self.open_until {
                Some(until) if now < until => return Admission::Reject,
                _ => {
                    self.state = BreakerState::HalfOpen;
                    self.half_open_in_flight = 0;
                }
            }
        }

        match self.state {
            BreakerState::Closed => Admission::Allow,
            BreakerState::HalfOpen => {
                if self.half_open_in_flight < self.config.half_open_max_probes {
                    self.half_open_in_flight += 1;
                    Admission::AllowProbe
                } else {
                    Admission::Reject
                }
            }
            BreakerState::Open => unreachable!("open handled above"),
        }
    }

    /// Fold a successful outcome in. Any success fully closes the breaker
    /// and resets the recovery timeout to its configured base.
    pub fn record_success(&mut self) {
        self.state = BreakerState::Closed;
        self.consecutive_failures = 0;
        self.open_until = None;
        self.current_recovery = self.config.recovery_timeout();
        self.half_open_in_flight = 0;
    }

    /// Fold a backend failure in. Callers have already filtered out
    /// client faults and cancellations.
    pub fn record_failure(&mut self, now: Instant) {
        match self.state {
            BreakerState::Closed => {
                self.consecutive_failures += 1;
                if self.consecutive_failures >= self.config.failure_threshold {
                    self.trip(now);
                }
            }
            BreakerState::HalfOpen => {
                // Probe failed: re-open with an extended timeout.
                self.current_recovery = (self.current_recovery * 2)
                    .min(self.config.max_recovery_timeout());
                self.trip(now);
            }
            BreakerState::Open => {
                // Late completion of a request admitted before the trip.
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
            }
        }
    }

    /// Immediate trip, bypassing the threshold. Used when a credential
    /// source fails: the backend cannot possibly serve requests.
    pub fn trip_now(&mut self, now: Instant) {
        self.trip(now);
    }

    fn trip(&mut self, now: Instant) {
        self.state = BreakerState::Open;
        self.open_until = Some(now + self.current_recovery);
        self.half_open_in_flight = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(failure_threshold: u32, recovery_ms: u64) -> BreakerConfig {
        BreakerConfig {
            failure_threshold,
            recovery_timeout_ms: recovery_ms,
            max_recovery_timeout_ms: recovery_ms * 8,
            half_open_max_probes: 1,
        }
    }

    #[test]
    fn trips_at_threshold() {
        let now = Instant::now();
        let mut b = Breaker::new(config(3, 100));

        b.record_failure(now);
        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Closed);

        b.record_failure(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.admit(now), Admission::Reject);
    }

    #[test]
    fn transitions_to_half_open_after_timeout() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        b.record_failure(now);
        assert_eq!(b.admit(now), Admission::Reject);

        let later = now + Duration::from_millis(101);
        assert_eq!(b.admit(later), Admission::AllowProbe);
        assert_eq!(b.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_caps_probe_permits() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        b.record_failure(now);

        let later = now + Duration::from_millis(101);
        assert_eq!(b.admit(later), Admission::AllowProbe);
        // second concurrent probe is rejected
        assert_eq!(b.admit(later), Admission::Reject);
    }

    #[test]
    fn probe_success_closes_and_resets() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        b.record_failure(now);

        let later = now + Duration::from_millis(101);
        b.admit(later);
        b.record_success();

        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 0);
        assert_eq!(b.admit(later), Admission::Allow);
    }

    #[test]
    fn probe_failure_reopens_with_doubled_timeout() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        b.record_failure(now);

        let t1 = now + Duration::from_millis(101);
        b.admit(t1);
        b.record_failure(t1);
        assert_eq!(b.state(), BreakerState::Open);

        // First recovery was 100ms; after one half-open failure it is 200ms.
        assert_eq!(b.admit(t1 + Duration::from_millis(150)), Admission::Reject);
        assert_eq!(
            b.admit(t1 + Duration::from_millis(201)),
            Admission::AllowProbe
        );
    }

    #[test]
    fn recovery_timeout_is_bounded() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100)); // ceiling 800ms
        b.record_failure(now);

        let mut t = now;
        // Fail enough probes that unbounded doubling would exceed the ceiling.
        for _ in 0..6 {
            t += Duration::from_secs(2);
            assert_eq!(b.admit(t), Admission::AllowProbe);
            b.record_failure(t);
        }

        // Even after many failures the wait is at most the 800ms ceiling.
        assert_eq!(b.admit(t + Duration::from_millis(801)), Admission::AllowProbe);
    }

    #[test]
    fn success_resets_recovery_to_base() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        b.record_failure(now);

        let t1 = now + Duration::from_millis(101);
        b.admit(t1);
        b.record_failure(t1); // recovery now 200ms

        let t2 = t1 + Duration::from_millis(201);
        b.admit(t2);
        b.record_success();

        b.record_failure(t2);
        // Back at the 100ms base, not 200ms.
        assert_eq!(
            b.admit(t2 + Duration::from_millis(101)),
            Admission::AllowProbe
        );
    }

    #[test]
    fn trip_now_opens_immediately() {
        let now = Instant::now();
        let mut b = Breaker::new(config(5, 100));
        b.trip_now(now);
        assert_eq!(b.state(), BreakerState::Open);
        assert_eq!(b.admit(now), Admission::Reject);
    }

    #[test]
    fn is_available_tracks_state() {
        let now = Instant::now();
        let mut b = Breaker::new(config(1, 100));
        assert!(b.is_available(now));
        b.record_failure(now);
        assert!(!b.is_available(now));
        assert!(b.is_available(now + Duration::from_millis(101)));
    }
}
