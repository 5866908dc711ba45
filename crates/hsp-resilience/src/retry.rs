//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Bounded retries with exponential backoff.
//!
//! Only errors whose type reports them as [`Recoverable`] are retried; the
//! rest are returned after the first attempt.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use hsp_common::RetryConfig;
use hsp_transport::TransportError;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::metrics::ResilienceMetrics;

/// Designates the error class a [`RetryPolicy`] is allowed to retry.
pub trait Recoverable {
    /// Whether another attempt may succeed.
    fn is_recoverable(&self) -> bool;
}

impl Recoverable for TransportError {
    fn is_recoverable(&self) -> bool {
        TransportError::is_recoverable(self)
    }
}

/// Bounded exponential backoff for fallible async operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub max_attempts: u32,
    /// Delay after the first failed attempt.
    pub initial_delay: Duration,
    /// Growth factor applied per failed attempt.
    pub backoff_factor: f64,
    /// Upper bound for any single delay.
    pub max_delay: Duration,
    metrics: Option<ResilienceMetrics>,
}

impl RetryPolicy {
    /// Construct a policy without metrics.
    pub fn new(max_attempts: u32, initial_delay: Duration, backoff_factor: f64, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay,
            backoff_factor,
            max_delay,
            metrics: None,
        }
    }

    /// Build a policy from the `[retry]` configuration section.
    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            config.initial_delay,
            config.backoff_factor,
            config.max_delay,
        )
    }

    /// Attach a metrics handle.
    pub fn with_metrics(mut self, metrics: Option<ResilienceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Wait after failed attempt number `attempt` (zero based):
    /// `min(max_delay, initial_delay * backoff_factor^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            self.max_delay
        } else {
            Duration::from_secs_f64(secs.max(0.0))
        }
    }

    /// Run `operation` until it succeeds, fails with a non recoverable error
    /// or the attempt budget is spent. The last error is returned unchanged.
    ///
    /// The closure receives the zero based attempt number.
    pub async fn execute<T, E, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Recoverable + Display,
    {
        let mut attempt = 0u32;
        loop {
            match op(attempt).await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(operation, attempt, "operation succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(err) => {
                    let next = attempt + 1;
                    if !err.is_recoverable() {
                        debug!(operation, attempt, error = %err, "non recoverable error; not retrying");
                        return Err(err);
                    }
                    if next >= self.max_attempts {
                        warn!(
                            operation,
                            attempts = next,
                            error = %err,
                            "retry budget exhausted"
                        );
                        if let Some(metrics) = &self.metrics {
                            metrics.record_retry(operation, "exhausted");
                        }
                        return Err(err);
                    }
                    let delay = self.delay_for(attempt);
                    warn!(
                        operation,
                        attempt = next,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "attempt failed; backing off",
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.record_retry(operation, "retried");
                    }
                    sleep(delay).await;
                    attempt = next;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), 2.0, Duration::from_millis(300))
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = policy();
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(300));
        assert_eq!(policy.delay_for(40), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_recoverable_errors_until_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let started = tokio::time::Instant::now();
        let result = policy()
            .execute("publish", move |_| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TransportError::Network("reset".into()))
                    } else {
                        Ok(7)
                    }
                }
            })
            .await;
        assert_eq!(result, Ok(7));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(started.elapsed(), Duration::from_millis(300));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_last_error_after_budget() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), TransportError> = policy()
            .execute("publish", move |attempt| {
                counter.fetch_add(1, Ordering::SeqCst);
                async move { Err(TransportError::Network(format!("attempt {}", attempt))) }
            })
            .await;
        assert_eq!(result, Err(TransportError::Network("attempt 2".into())));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn does_not_retry_final_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = calls.clone();
        let result: Result<(), TransportError> = policy()
            .execute("publish", move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(TransportError::Closed) }
            })
            .await;
        assert_eq!(result, Err(TransportError::Closed));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
