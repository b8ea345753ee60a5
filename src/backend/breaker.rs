//! Per-backend circuit breaker.
//!
//! Three-state failure gate. CLOSED admits everything and counts consecutive
//! failures; OPEN rejects until `reset_timeout` has elapsed since the last
//! failure; HALF_OPEN admits a bounded number of concurrent probes and closes
//! again once enough of them succeed.

use std::sync::RwLock;
use std::time::{Duration, Instant};

/// Circuit breaker configuration.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED that trip the breaker.
    pub failure_threshold: u32,
    /// How long OPEN rejects before a probe is admitted.
    pub reset_timeout: Duration,
    /// Maximum concurrent probes in HALF_OPEN; also the number of probe
    /// successes required to close the circuit again.
    pub half_open_limit: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            half_open_limit: 3,
        }
    }
}

/// Observable breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Internal state. Counters live inside their own variant so a transition
/// always starts from a clean slate.
#[derive(Debug)]
enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen { admitted: u32, successes: u32 },
}

/// A circuit breaker guarding one backend.
///
/// `allow` reserves an admission; every reservation must be paired with
/// exactly one `record_success` or `record_failure`.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: RwLock<State>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: RwLock::new(State::Closed { failures: 0 }),
        }
    }

    /// Current state, for observability and selection hints.
    pub fn state(&self) -> BreakerState {
        match *self.state.read().unwrap() {
            State::Closed { .. } => BreakerState::Closed,
            State::Open { .. } => BreakerState::Open,
            State::HalfOpen { .. } => BreakerState::HalfOpen,
        }
    }

    /// Non-reserving admission check.
    ///
    /// Selection policies use this to build their candidate set without
    /// consuming HALF_OPEN probe slots; only `allow` on the final pick
    /// actually reserves.
    pub fn can_pass(&self) -> bool {
        match *self.state.read().unwrap() {
            State::Closed { .. } => true,
            State::Open { since } => since.elapsed() > self.config.reset_timeout,
            State::HalfOpen { admitted, .. } => admitted < self.config.half_open_limit,
        }
    }

    /// Admission check with reservation.
    ///
    /// Returns `true` if the request may proceed. In HALF_OPEN a probe slot
    /// is consumed; the caller must later record an outcome to release it.
    /// The OPEN → HALF_OPEN flip happens here, under the write lock, with
    /// the time predicate re-checked so only one caller performs it.
    pub fn allow(&self) -> bool {
        // Fast path: CLOSED admits without mutation.
        if matches!(*self.state.read().unwrap(), State::Closed { .. }) {
            return true;
        }

        let mut state = self.state.write().unwrap();
        match *state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if since.elapsed() > self.config.reset_timeout {
                    *state = State::HalfOpen {
                        admitted: 1,
                        successes: 0,
                    };
                    true
                } else {
                    false
                }
            }
            State::HalfOpen {
                ref mut admitted, ..
            } => {
                if *admitted < self.config.half_open_limit {
                    *admitted += 1;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful request.
    pub fn record_success(&self) {
        let mut state = self.state.write().unwrap();
        match *state {
            State::Closed { ref mut failures } => *failures = 0,
            State::HalfOpen {
                ref mut admitted,
                ref mut successes,
            } => {
                *admitted = admitted.saturating_sub(1);
                *successes += 1;
                if *successes >= self.config.half_open_limit {
                    *state = State::Closed { failures: 0 };
                }
            }
            // A late success after the breaker re-opened carries no signal.
            State::Open { .. } => {}
        }
    }

    /// Record a failed request. A failure in HALF_OPEN re-opens the circuit
    /// regardless of how many probes had succeeded.
    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.write().unwrap();
        match *state {
            State::Closed { ref mut failures } => {
                *failures += 1;
                if *failures >= self.config.failure_threshold {
                    *state = State::Open { since: now };
                }
            }
            State::HalfOpen { .. } => {
                *state = State::Open { since: now };
            }
            State::Open { ref mut since } => {
                // Late failures push the reset window out.
                *since = now;
            }
        }
    }
}
