//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use crate::metrics::ResilienceMetrics;
use serde::Serialize;
use std::fmt;

/// Communication health exposed to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DegradationLevel {
    /// The primary broker link is up.
    Healthy,
    /// The broker link is down but a fallback protocol carries traffic.
    Degraded,
    /// Neither the broker nor any fallback protocol is usable.
    Offline,
}

impl DegradationLevel {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            DegradationLevel::Healthy => "healthy",
            DegradationLevel::Degraded => "degraded",
            DegradationLevel::Offline => "offline",
        }
    }

    /// Derive the level from link observations.
    pub fn determine(primary_connected: bool, fallback_protocol: Option<&str>) -> Self {
        match (primary_connected, fallback_protocol) {
            (true, _) => DegradationLevel::Healthy,
            (false, Some(_)) => DegradationLevel::Degraded,
            (false, None) => DegradationLevel::Offline,
        }
    }
}

impl fmt::Display for DegradationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Level together with the observations it was derived from.
#[derive(Debug, Clone, Serialize)]
pub struct DegradationState {
    /// Reported degradation level.
    pub level: DegradationLevel,
    /// Whether the broker link was up.
    pub primary_connected: bool,
    /// Active fallback protocol, if any.
    pub fallback_protocol: Option<String>,
}

/// Remembers the last level and logs and counts every change.
#[derive(Debug, Default)]
pub struct DegradationTracker {
    metrics: Option<ResilienceMetrics>,
    last_level: Option<DegradationLevel>,
}

impl DegradationTracker {
    /// Tracker with no level recorded yet.
    pub fn new(metrics: Option<ResilienceMetrics>) -> Self {
        Self {
            metrics,
            last_level: None,
        }
    }

    /// Fold in the current link observations.
    pub fn evaluate(
        &mut self,
        primary_connected: bool,
        fallback_protocol: Option<&str>,
    ) -> DegradationState {
        let level = DegradationLevel::determine(primary_connected, fallback_protocol);
        let changed = self.last_level.replace(level) != Some(level);
        if changed {
            if let Some(metrics) = &self.metrics {
                metrics.record_degradation(level);
            }
            match level {
                DegradationLevel::Healthy => tracing::info!(
                    target: "hsp::resilience::degradation",
                    level = %level,
                    "communication level transition",
                ),
                _ => tracing::warn!(
                    target: "hsp::resilience::degradation",
                    level = %level,
                    fallback = fallback_protocol.unwrap_or("none"),
                    "communication level transition",
                ),
            }
        }
        DegradationState {
            level,
            primary_connected,
            fallback_protocol: fallback_protocol.map(str::to_string),
        }
    }

    /// `None` until the first evaluation.
    pub fn current_level(&self) -> Option<DegradationLevel> {
        self.last_level
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_follow_link_observations() {
        let mut tracker = DegradationTracker::new(None);
        assert_eq!(tracker.current_level(), None);
        assert_eq!(tracker.evaluate(true, None).level, DegradationLevel::Healthy);
        let degraded = tracker.evaluate(false, Some("file"));
        assert_eq!(degraded.level, DegradationLevel::Degraded);
        assert_eq!(degraded.fallback_protocol.as_deref(), Some("file"));
        assert_eq!(tracker.evaluate(false, None).level, DegradationLevel::Offline);
        assert_eq!(tracker.evaluate(true, Some("memory")).level, DegradationLevel::Healthy);
        assert_eq!(tracker.current_level(), Some(DegradationLevel::Healthy));
    }
}
