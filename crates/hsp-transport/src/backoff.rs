//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::time::Duration;

use hsp_common::ReconnectConfig;
use rand::Rng;

/// Jittered exponential delay used between reconnect attempts.
///
/// `delay(n) = min(max_delay, base * 2^min(n, max_exponent) + jitter)` with the
/// jitter drawn uniformly from `0..=jitter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectBackoff {
    base_delay: Duration,
    max_delay: Duration,
    max_exponent: u32,
    jitter: Duration,
}

impl ReconnectBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration, max_exponent: u32, jitter: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            max_exponent,
            jitter,
        }
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            config.base_delay,
            config.max_delay,
            config.max_exponent,
            config.jitter,
        )
    }

    /// Delay to wait before reconnect attempt number `attempt` (zero based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.max_exponent).min(31);
        let base = self.base_delay.saturating_mul(2u32.pow(exponent));
        let jittered = if self.jitter.is_zero() {
            base
        } else {
            let jitter_ms = rand::thread_rng().gen_range(0..=self.jitter.as_millis().max(1)) as u64;
            base.saturating_add(Duration::from_millis(jitter_ms))
        };
        jittered.min(self.max_delay)
    }
}

impl Default for ReconnectBackoff {
    fn default() -> Self {
        Self::from_config(&ReconnectConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_exponent_cap() {
        let backoff = ReconnectBackoff::new(
            Duration::from_millis(100),
            Duration::from_secs(60),
            3,
            Duration::ZERO,
        );
        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(1), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(800));
        assert_eq!(backoff.delay(10), Duration::from_millis(800));
    }

    #[test]
    fn jitter_stays_within_bounds_and_max_applies() {
        let backoff = ReconnectBackoff::new(
            Duration::from_millis(100),
            Duration::from_millis(450),
            8,
            Duration::from_millis(50),
        );
        for _ in 0..50 {
            let first = backoff.delay(0);
            assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
            assert_eq!(backoff.delay(6), Duration::from_millis(450));
        }
    }
}
