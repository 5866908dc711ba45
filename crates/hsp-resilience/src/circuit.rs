//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Consecutive-failure circuit breaker.
//!
//! The breaker opens after `failure_threshold` consecutive failed calls and
//! rejects everything until `recovery_timeout` has passed since it opened.
//! The first call after that runs as a half-open probe; concurrent callers
//! are rejected until the probe settles.

use std::future::Future;
use std::time::Duration;

use hsp_common::CircuitBreakerConfig;
use parking_lot::Mutex;
use serde::Serialize;
use strum::{AsRefStr, Display};
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics::ResilienceMetrics;
use crate::retry::Recoverable;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Calls flow through.
    Closed,
    /// Calls are rejected without running.
    Open,
    /// A single probe call is in flight.
    HalfOpen,
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Debug, thiserror::Error)]
pub enum CircuitError<E> {
    /// The breaker rejected the call.
    #[error("circuit `{breaker}` is open; retry after {retry_after:?}")]
    Open {
        /// Breaker name.
        breaker: String,
        /// Time until a probe is admitted. Zero while another probe runs.
        retry_after: Duration,
    },
    /// The wrapped operation failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> CircuitError<E> {
    /// Whether the call was rejected by the breaker.
    pub fn is_open(&self) -> bool {
        matches!(self, CircuitError::Open { .. })
    }

    /// The wrapped operation error, if the operation ran.
    pub fn into_inner(self) -> Option<E> {
        match self {
            CircuitError::Inner(err) => Some(err),
            CircuitError::Open { .. } => None,
        }
    }
}

impl<E: Recoverable> Recoverable for CircuitError<E> {
    fn is_recoverable(&self) -> bool {
        match self {
            CircuitError::Open { .. } => false,
            CircuitError::Inner(err) => err.is_recoverable(),
        }
    }
}

/// Point-in-time view of a breaker.
#[derive(Debug, Clone, Serialize)]
pub struct CircuitSnapshot {
    /// Breaker name.
    pub name: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures counted so far.
    pub failure_count: u32,
    /// Failures needed to open.
    pub failure_threshold: u32,
    /// Open period before a probe is admitted.
    pub recovery_timeout: Duration,
    /// Time since the last failure.
    pub since_last_failure: Option<Duration>,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Thread-safe circuit breaker shared by reference across tasks.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    recovery_timeout: Duration,
    state: Mutex<BreakerState>,
    metrics: Option<ResilienceMetrics>,
}

enum Admission {
    Normal,
    Probe,
}

/// Clears the probe flag when a probe future is dropped before settling.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.state.lock().probe_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    pub fn new(name: impl Into<String>, failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            name: name.into(),
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                last_failure: None,
                opened_at: None,
                probe_in_flight: false,
            }),
            metrics: None,
        }
    }

    /// Build a breaker from the `[circuit_breaker]` configuration section.
    pub fn from_config(name: impl Into<String>, config: &CircuitBreakerConfig) -> Self {
        Self::new(name, config.failure_threshold, config.recovery_timeout)
    }

    /// Attach a metrics handle.
    pub fn with_metrics(mut self, metrics: Option<ResilienceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Breaker name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stored state. An open breaker whose timeout has elapsed reports
    /// `Open` until the next call turns it half-open.
    pub fn state(&self) -> CircuitState {
        self.state.lock().state
    }

    /// Snapshot for status reporting.
    pub fn snapshot(&self) -> CircuitSnapshot {
        let state = self.state.lock();
        CircuitSnapshot {
            name: self.name.clone(),
            state: state.state,
            failure_count: state.failure_count,
            failure_threshold: self.failure_threshold,
            recovery_timeout: self.recovery_timeout,
            since_last_failure: state.last_failure.map(|at| at.elapsed()),
        }
    }

    /// Run `op` unless the breaker is open.
    pub async fn call<T, E, F, Fut>(&self, op: F) -> Result<T, CircuitError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let admission = self.admit::<E>()?;
        let mut guard = ProbeGuard {
            breaker: self,
            armed: matches!(admission, Admission::Probe),
        };
        let outcome = op().await;
        guard.armed = false;
        match outcome {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(err) => {
                self.on_failure();
                Err(CircuitError::Inner(err))
            }
        }
    }

    /// Force the breaker closed and clear its counters.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.opened_at = None;
        state.probe_in_flight = false;
        if state.state != CircuitState::Closed {
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn admit<E>(&self) -> Result<Admission, CircuitError<E>> {
        let mut state = self.state.lock();
        match state.state {
            CircuitState::Closed => Ok(Admission::Normal),
            CircuitState::Open => {
                let elapsed = state
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(self.recovery_timeout);
                if elapsed >= self.recovery_timeout {
                    self.transition(&mut state, CircuitState::HalfOpen);
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                } else {
                    Err(CircuitError::Open {
                        breaker: self.name.clone(),
                        retry_after: self.recovery_timeout - elapsed,
                    })
                }
            }
            CircuitState::HalfOpen => {
                if state.probe_in_flight {
                    Err(CircuitError::Open {
                        breaker: self.name.clone(),
                        retry_after: Duration::ZERO,
                    })
                } else {
                    state.probe_in_flight = true;
                    Ok(Admission::Probe)
                }
            }
        }
    }

    fn on_success(&self) {
        let mut state = self.state.lock();
        state.failure_count = 0;
        state.probe_in_flight = false;
        if state.state != CircuitState::Closed {
            state.opened_at = None;
            self.transition(&mut state, CircuitState::Closed);
        }
    }

    fn on_failure(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.failure_count = state.failure_count.saturating_add(1);
        state.last_failure = Some(now);
        state.probe_in_flight = false;
        let should_open = match state.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => state.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open {
            state.opened_at = Some(now);
            self.transition(&mut state, CircuitState::Open);
        }
    }

    fn transition(&self, state: &mut BreakerState, next: CircuitState) {
        let previous = state.state;
        state.state = next;
        match next {
            CircuitState::Open => warn!(
                breaker = %self.name,
                from = %previous,
                failures = state.failure_count,
                recovery_timeout_ms = self.recovery_timeout.as_millis() as u64,
                "circuit opened",
            ),
            _ => info!(breaker = %self.name, from = %previous, to = %next, "circuit transition"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.record_circuit_transition(&self.name, next);
        }
    }
}
