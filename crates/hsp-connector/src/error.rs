//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Connector orchestration over bridge, resilience and fallback."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::time::Duration;

use hsp_transport::TransportError;
use serde::Serialize;

/// Errors surfaced to connector callers.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    /// Neither the broker nor any fallback protocol took the message.
    #[error("delivery of message {message_id} failed: {reason}")]
    DeliveryFailure {
        /// Id of the undelivered envelope.
        message_id: String,
        /// Last error seen on the way.
        reason: String,
    },
    /// Every broker connection attempt failed. The connector keeps running
    /// in fallback-only mode.
    #[error("broker connection failed after {attempts} attempts: {last_error}")]
    ConnectFailed {
        /// Attempts made.
        attempts: u32,
        /// Error of the last attempt.
        last_error: TransportError,
    },
    /// The connector no longer accepts work.
    #[error("connector is shutting down")]
    ShuttingDown,
    /// The envelope could not be encoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Transport that carried a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "path", content = "protocol")]
pub enum DeliveryPath {
    /// The broker link.
    Primary,
    /// The named fallback protocol.
    Fallback(&'static str),
}

/// What happened to the acknowledgement of a send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    /// The envelope did not ask for one.
    NotRequested,
    /// The peer acknowledged over the broker.
    Acknowledged {
        /// Time from first send to acknowledgement.
        latency: Duration,
    },
    /// The ack timeout elapsed; the message was then handed to a fallback protocol.
    TimedOut,
    /// The broker send failed, so no acknowledgement was awaited.
    NotAwaited,
}

/// Successful result of a publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    /// Id of the delivered envelope.
    pub message_id: String,
    /// Key acknowledgements are matched on.
    pub correlation_id: String,
    /// Transport that carried the message.
    pub path: DeliveryPath,
    /// Acknowledgement result.
    pub ack: AckOutcome,
}

impl DeliveryReceipt {
    /// Whether the peer confirmed receipt.
    pub fn acknowledged(&self) -> bool {
        matches!(self.ack, AckOutcome::Acknowledged { .. })
    }
}
