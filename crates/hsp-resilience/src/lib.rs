//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Resilience primitives for the HSP bridge.
//!
//! [`RetryPolicy`] and [`CircuitBreaker`] wrap any fallible async operation;
//! the retry policy is meant to run inside the breaker so one exhausted call
//! counts once against it. [`fallback::FallbackManager`] keeps alternate
//! transports ready for when the primary broker link is unavailable.

pub mod circuit;
pub mod degradation;
pub mod fallback;
pub mod metrics;
pub mod retry;

pub use circuit::{CircuitBreaker, CircuitError, CircuitSnapshot, CircuitState};
pub use degradation::{DegradationLevel, DegradationState, DegradationTracker};
pub use fallback::{
    FallbackError, FallbackManager, FallbackMessage, FallbackProtocol, FallbackSettings,
    FallbackStatus, FileMailboxProtocol, HttpProtocol, InMemoryProtocol, MemoryHub,
    MessagePriority, ProtocolReport, ProtocolStats, ProtocolStatus,
};
pub use metrics::ResilienceMetrics;
pub use retry::{Recoverable, RetryPolicy};

/// Crate prelude collecting the most commonly used builders.
pub mod prelude {
    pub use super::circuit::{CircuitBreaker, CircuitError, CircuitState};
    pub use super::degradation::{DegradationLevel, DegradationTracker};
    pub use super::fallback::{FallbackManager, FallbackMessage, FallbackProtocol};
    pub use super::metrics::ResilienceMetrics;
    pub use super::retry::{Recoverable, RetryPolicy};
}
