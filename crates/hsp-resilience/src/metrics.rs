//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::time::Duration;

use anyhow::Result;
use hsp_common::SharedRegistry;
use prometheus::{self, HistogramOpts, HistogramVec, IntCounterVec, Opts};

use crate::circuit::CircuitState;
use crate::degradation::DegradationLevel;

/// Metrics published by the resilience subsystem.
#[derive(Clone)]
pub struct ResilienceMetrics {
    retries_total: IntCounterVec,
    circuit_transitions_total: IntCounterVec,
    fallback_sends_total: IntCounterVec,
    fallback_send_seconds: HistogramVec,
    fallback_switches_total: IntCounterVec,
    degradations_total: IntCounterVec,
}

impl ResilienceMetrics {
    /// Register the resilience metric family against the provided registry.
    pub fn new(registry: &SharedRegistry) -> Result<Self> {
        let retries_total = IntCounterVec::new(
            Opts::new(
                "hsp_resilience_retries_total",
                "Retry decisions taken by the retry policy",
            ),
            &["operation", "outcome"],
        )?;
        registry.register(Box::new(retries_total.clone()))?;

        let circuit_transitions_total = IntCounterVec::new(
            Opts::new(
                "hsp_resilience_circuit_transitions_total",
                "Circuit breaker state transitions",
            ),
            &["breaker", "state"],
        )?;
        registry.register(Box::new(circuit_transitions_total.clone()))?;

        let fallback_sends_total = IntCounterVec::new(
            Opts::new(
                "hsp_resilience_fallback_sends_total",
                "Messages handed to a fallback protocol",
            ),
            &["protocol", "outcome"],
        )?;
        registry.register(Box::new(fallback_sends_total.clone()))?;

        let histogram_opts = HistogramOpts::new(
            "hsp_resilience_fallback_send_seconds",
            "Time spent handing a message to a fallback protocol",
        )
        .buckets(prometheus::exponential_buckets(0.0005, 2.0, 14)?);
        let fallback_send_seconds = HistogramVec::new(histogram_opts, &["protocol"])?;
        registry.register(Box::new(fallback_send_seconds.clone()))?;

        let fallback_switches_total = IntCounterVec::new(
            Opts::new(
                "hsp_resilience_fallback_switches_total",
                "Changes of the active fallback protocol",
            ),
            &["from", "to"],
        )?;
        registry.register(Box::new(fallback_switches_total.clone()))?;

        let degradations_total = IntCounterVec::new(
            Opts::new(
                "hsp_resilience_degradations_total",
                "Count of link degradation level transitions",
            ),
            &["level"],
        )?;
        registry.register(Box::new(degradations_total.clone()))?;

        Ok(Self {
            retries_total,
            circuit_transitions_total,
            fallback_sends_total,
            fallback_send_seconds,
            fallback_switches_total,
            degradations_total,
        })
    }

    /// Count a retry decision (`retried` or `exhausted`).
    pub fn record_retry(&self, operation: &str, outcome: &str) {
        self.retries_total
            .with_label_values(&[operation, outcome])
            .inc();
    }

    /// Track a circuit breaker entering `state`.
    pub fn record_circuit_transition(&self, breaker: &str, state: CircuitState) {
        self.circuit_transitions_total
            .with_label_values(&[breaker, state.as_ref()])
            .inc();
    }

    /// Record one fallback hand-off attempt.
    pub fn observe_fallback_send(&self, protocol: &str, success: bool, duration: Duration) {
        let outcome = if success { "success" } else { "failure" };
        self.fallback_sends_total
            .with_label_values(&[protocol, outcome])
            .inc();
        self.fallback_send_seconds
            .with_label_values(&[protocol])
            .observe(duration.as_secs_f64());
    }

    /// Record a change of the active fallback protocol. `none` stands in for
    /// "no protocol".
    pub fn record_fallback_switch(&self, from: Option<&str>, to: Option<&str>) {
        self.fallback_switches_total
            .with_label_values(&[from.unwrap_or("none"), to.unwrap_or("none")])
            .inc();
    }

    /// Track a transition into a new degradation level.
    pub fn record_degradation(&self, level: DegradationLevel) {
        self.degradations_total
            .with_label_values(&[level.as_str()])
            .inc();
    }
}

impl std::fmt::Debug for ResilienceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilienceMetrics").finish_non_exhaustive()
    }
}
