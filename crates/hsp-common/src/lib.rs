//! ---
//! hsp_section: "01-core-functionality"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Shared primitives and utilities for the bridge runtime."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Core shared primitives for the HSP bridge workspace.
//! This crate exposes configuration loading, tracing initialisation, and the
//! shared Prometheus registry consumed across the workspace.

pub mod config;
pub mod logging;
pub mod metrics;

pub use config::{
    AckConfig, BridgeConfig, BrokerConfig, CircuitBreakerConfig, FallbackConfig, FileProtocolConfig,
    HttpProtocolConfig, LoadedBridgeConfig, LoggingConfig, MemoryProtocolConfig, MetricsConfig,
    ReconnectConfig, RetryConfig,
};
pub use logging::{init_tracing, LogFormat};
pub use metrics::{new_registry, SharedRegistry};
