//! Circuit breaker: one three-state machine per [`RouteTargetId`].
//!
//! Grounded in the teacher's `api/rate_limit.rs` per-key `DashMap` idiom
//! (one entry per identity, short-lived lock per admission check) — the
//! state-machine rules themselves are new, the teacher has no breaker.

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use crate::config::BreakerConfig;
use crate::router::RouteTargetId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Closed,
    Open,
    HalfOpen,
}

struct Breaker {
    state: State,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
    /// True while a half-open probe is in flight — only one probe is let
    /// through at a time.
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: State::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }
}

/// Whether an upstream outcome counts as a breaker failure.
///
/// 4xx other than 408/429 never opens the breaker; 429 and 5xx/timeouts do.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Success,
    Failure,
    /// A 4xx that isn't 408/429 — doesn't affect breaker state at all.
    ClientError,
}

#[derive(Default)]
pub struct BreakerRegistry {
    breakers: DashMap<RouteTargetId, Mutex<Breaker>>,
}

/// Whether a request may be admitted to this target right now.
pub enum Admission {
    Allowed,
    /// Breaker is open; caller should try the next fallback or queue.
    Refused,
}

impl BreakerRegistry {
    /// Check admission without recording anything — also performs the
    /// `open → half_open` transition when the timeout has elapsed, since
    /// that transition only happens "on the next admission attempt" per
    /// spec.
    pub fn admit(&self, id: &RouteTargetId, cfg: &BreakerConfig) -> Admission {
        let entry = self.breakers.entry(id.clone()).or_insert_with(|| Mutex::new(Breaker::new()));
        let mut b = entry.lock().unwrap();

        match b.state {
            State::Closed => Admission::Allowed,
            State::HalfOpen => {
                if b.probe_in_flight {
                    Admission::Refused
                } else {
                    b.probe_in_flight = true;
                    Admission::Allowed
                }
            }
            State::Open => {
                let elapsed = b.opened_at.map(|t| t.elapsed().as_secs()).unwrap_or(0);
                if elapsed >= cfg.timeout_secs {
                    b.state = State::HalfOpen;
                    b.probe_in_flight = true;
                    b.consecutive_successes = 0;
                    Admission::Allowed
                } else {
                    Admission::Refused
                }
            }
        }
    }

    pub fn record(&self, id: &RouteTargetId, outcome: Outcome, cfg: &BreakerConfig) {
        let Some(entry) = self.breakers.get(id) else { return };
        let mut b = entry.lock().unwrap();

        match outcome {
            Outcome::ClientError => {
                // Doesn't count toward failure or success in any state.
                if b.state == State::HalfOpen {
                    b.probe_in_flight = false;
                }
            }
            Outcome::Success => {
                b.consecutive_failures = 0;
                match b.state {
                    State::Closed => {}
                    State::HalfOpen => {
                        b.probe_in_flight = false;
                        b.consecutive_successes += 1;
                        if b.consecutive_successes >= cfg.recovery_threshold {
                            b.state = State::Closed;
                            b.consecutive_successes = 0;
                            b.opened_at = None;
                        }
                    }
                    State::Open => {}
                }
            }
            Outcome::Failure => match b.state {
                State::Closed => {
                    b.consecutive_failures += 1;
                    if b.consecutive_failures >= cfg.failure_threshold {
                        b.state = State::Open;
                        b.opened_at = Some(Instant::now());
                    }
                }
                State::HalfOpen => {
                    b.probe_in_flight = false;
                    b.state = State::Open;
                    b.opened_at = Some(Instant::now());
                    b.consecutive_successes = 0;
                }
                State::Open => {}
            },
        }
    }

    pub fn state(&self, id: &RouteTargetId) -> State {
        self.breakers.get(id).map(|e| e.lock().unwrap().state).unwrap_or(State::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> BreakerConfig {
        BreakerConfig { failure_threshold: 3, recovery_threshold: 2, timeout_secs: 0 }
    }

    fn id() -> RouteTargetId {
        RouteTargetId { backend: "openai".into(), model: "gpt-4o".into() }
    }

    #[test]
    fn opens_after_failure_threshold_consecutive_failures() {
        let reg = BreakerRegistry::default();
        let c = cfg();
        for _ in 0..3 {
            assert!(matches!(reg.admit(&id(), &c), Admission::Allowed));
            reg.record(&id(), Outcome::Failure, &c);
        }
        assert_eq!(reg.state(&id()), State::Open);
        assert!(matches!(reg.admit(&id(), &c), Admission::Refused));
    }

    #[test]
    fn failure_threshold_one_opens_on_first_failure() {
        let reg = BreakerRegistry::default();
        let c = BreakerConfig { failure_threshold: 1, recovery_threshold: 2, timeout_secs: 0 };
        reg.admit(&id(), &c);
        reg.record(&id(), Outcome::Failure, &c);
        assert_eq!(reg.state(&id()), State::Open);
    }

    #[test]
    fn half_open_recovers_after_recovery_threshold_successes() {
        let reg = BreakerRegistry::default();
        let c = cfg();
        for _ in 0..3 {
            reg.admit(&id(), &c);
            reg.record(&id(), Outcome::Failure, &c);
        }
        assert_eq!(reg.state(&id()), State::Open);

        // timeout_secs = 0, so next admit transitions to half_open immediately.
        assert!(matches!(reg.admit(&id(), &c), Admission::Allowed));
        assert_eq!(reg.state(&id()), State::HalfOpen);
        reg.record(&id(), Outcome::Success, &c);
        assert_eq!(reg.state(&id()), State::HalfOpen);

        assert!(matches!(reg.admit(&id(), &c), Admission::Allowed));
        reg.record(&id(), Outcome::Success, &c);
        assert_eq!(reg.state(&id()), State::Closed);
    }

    #[test]
    fn half_open_failure_reopens() {
        let reg = BreakerRegistry::default();
        let c = cfg();
        for _ in 0..3 {
            reg.admit(&id(), &c);
            reg.record(&id(), Outcome::Failure, &c);
        }
        reg.admit(&id(), &c); // -> half_open
        reg.record(&id(), Outcome::Failure, &c);
        assert_eq!(reg.state(&id()), State::Open);
    }

    #[test]
    fn client_error_does_not_affect_state() {
        let reg = BreakerRegistry::default();
        let c = cfg();
        reg.admit(&id(), &c);
        reg.record(&id(), Outcome::ClientError, &c);
        assert_eq!(reg.state(&id()), State::Closed);
    }

    #[test]
    fn only_one_probe_admitted_in_half_open() {
        let reg = BreakerRegistry::default();
        let c = cfg();
        for _ in 0..3 {
            reg.admit(&id(), &c);
            reg.record(&id(), Outcome::Failure, &c);
        }
        assert!(matches!(reg.admit(&id(), &c), Admission::Allowed)); // -> half_open, probe 1
        assert!(matches!(reg.admit(&id(), &c), Admission::Refused)); // probe already in flight
    }
}
