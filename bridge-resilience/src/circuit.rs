//! Three-state circuit breaker.

use std::num::NonZeroU32;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::Classify;

/// States a circuit moves through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through; failures are counted.
    Closed,
    /// Calls fail fast until the reset timeout elapses.
    Open,
    /// A single probe call is in flight or about to be admitted.
    HalfOpen,
}

/// Thresholds governing a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    failure_threshold: NonZeroU32,
    reset_timeout: Duration,
}

impl CircuitBreakerConfig {
    /// Creates a new configuration.
    #[must_use]
    pub const fn new(failure_threshold: NonZeroU32, reset_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            reset_timeout,
        }
    }

    /// Consecutive failures that trip the circuit.
    #[must_use]
    pub const fn failure_threshold(self) -> NonZeroU32 {
        self.failure_threshold
    }

    /// Time the circuit stays open before admitting a probe.
    #[must_use]
    pub const fn reset_timeout(self) -> Duration {
        self.reset_timeout
    }
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: NonZeroU32::new(5).expect("non-zero"),
            reset_timeout: Duration::from_secs(60),
        }
    }
}

/// Error returned by a circuit-guarded call.
#[derive(Debug, Error)]
pub enum CircuitError<E> {
    /// The circuit rejected the call without invoking the operation.
    #[error("circuit `{key}` is open")]
    Open {
        /// Circuit key supplied by the caller.
        key: String,
    },
    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Returns the inner operation error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open { .. } => None,
            Self::Inner(err) => Some(err),
        }
    }
}

impl<E: Classify> Classify for CircuitError<E> {
    fn kind(&self) -> &str {
        match self {
            Self::Open { .. } => "circuit_open",
            Self::Inner(err) => err.kind(),
        }
    }
}

/// Point-in-time view of a circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted in the current cycle.
    pub failures: u32,
    /// When the circuit last tripped open.
    pub opened_at: Option<Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Admission {
    Pass,
    Probe,
    Reject,
}

#[derive(Debug)]
pub(crate) struct Circuit {
    state: CircuitState,
    failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

impl Circuit {
    pub(crate) fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failures: 0,
            opened_at: None,
            probe_in_flight: false,
        }
    }

    pub(crate) fn snapshot(&self) -> CircuitSnapshot {
        CircuitSnapshot {
            state: self.state,
            failures: self.failures,
            opened_at: self.opened_at,
        }
    }

    pub(crate) fn admit(&mut self, key: &str, config: CircuitBreakerConfig, now: Instant) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Pass,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map_or(Duration::MAX, |opened| now.saturating_duration_since(opened));
                if elapsed >= config.reset_timeout() {
                    debug!(key, "circuit half-open; admitting probe");
                    self.state = CircuitState::HalfOpen;
                    self.probe_in_flight = true;
                    Admission::Probe
                } else {
                    Admission::Reject
                }
            }
            CircuitState::HalfOpen if self.probe_in_flight => Admission::Reject,
            CircuitState::HalfOpen => {
                self.probe_in_flight = true;
                Admission::Probe
            }
        }
    }

    pub(crate) fn on_success(&mut self, key: &str) {
        match self.state {
            CircuitState::Closed => self.failures = 0,
            CircuitState::HalfOpen => {
                debug!(key, "probe succeeded; circuit closed");
                self.state = CircuitState::Closed;
                self.failures = 0;
                self.opened_at = None;
                self.probe_in_flight = false;
            }
            // A call admitted before the trip finished late; the open cycle stands.
            CircuitState::Open => {}
        }
    }

    pub(crate) fn on_failure(&mut self, key: &str, config: CircuitBreakerConfig, now: Instant) {
        match self.state {
            CircuitState::Closed => {
                self.failures = self.failures.saturating_add(1);
                if self.failures >= config.failure_threshold().get() {
                    warn!(key, failures = self.failures, "circuit tripped open");
                    self.trip(now);
                }
            }
            CircuitState::HalfOpen => {
                warn!(key, "probe failed; circuit re-opened");
                self.failures = self.failures.saturating_add(1);
                self.trip(now);
            }
            CircuitState::Open => {}
        }
    }

    pub(crate) fn abandon_probe(&mut self) {
        if self.state == CircuitState::HalfOpen {
            self.probe_in_flight = false;
        }
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.opened_at = Some(now);
        self.probe_in_flight = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CircuitBreakerConfig {
        CircuitBreakerConfig::new(NonZeroU32::new(2).unwrap(), Duration::from_secs(10))
    }

    #[test]
    fn trips_after_threshold() {
        let now = Instant::now();
        let mut circuit = Circuit::new();
        circuit.on_failure("k", config(), now);
        assert_eq!(circuit.snapshot().state, CircuitState::Closed);
        circuit.on_failure("k", config(), now);
        assert_eq!(circuit.snapshot().state, CircuitState::Open);
        assert_eq!(circuit.admit("k", config(), now), Admission::Reject);
    }

    #[test]
    fn success_while_closed_resets_counter() {
        let now = Instant::now();
        let mut circuit = Circuit::new();
        circuit.on_failure("k", config(), now);
        circuit.on_success("k");
        circuit.on_failure("k", config(), now);
        assert_eq!(circuit.snapshot().state, CircuitState::Closed);
        assert_eq!(circuit.snapshot().failures, 1);
    }

    #[test]
    fn only_one_probe_admitted() {
        let now = Instant::now();
        let mut circuit = Circuit::new();
        circuit.on_failure("k", config(), now);
        circuit.on_failure("k", config(), now);

        let later = now + Duration::from_secs(10);
        assert_eq!(circuit.admit("k", config(), later), Admission::Probe);
        assert_eq!(circuit.admit("k", config(), later), Admission::Reject);

        circuit.abandon_probe();
        assert_eq!(circuit.admit("k", config(), later), Admission::Probe);
    }

    #[test]
    fn late_success_does_not_close_open_circuit() {
        let now = Instant::now();
        let mut circuit = Circuit::new();
        circuit.on_failure("k", config(), now);
        circuit.on_failure("k", config(), now);
        circuit.on_success("k");
        assert_eq!(circuit.snapshot().state, CircuitState::Open);
    }
}
