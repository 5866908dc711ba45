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

/// Failures reported by a transport adapter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is not connected")]
    NotConnected,
    #[error("network error: {0}")]
    Network(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Transient failures worth retrying; `Closed` is final.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TransportError::Closed)
    }
}
