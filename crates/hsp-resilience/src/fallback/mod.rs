//! ---
//! hsp_section: "07-resilience-fault-tolerance"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Resilience strategies and fallback transports."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Alternate transports used while the broker link is unavailable.
//!
//! Every protocol implements [`FallbackProtocol`]; the [`FallbackManager`]
//! keeps them ordered by priority and pins the healthiest one as active.
//! Inbound traffic from all protocols is funnelled into one channel.

mod file;
mod http;
mod manager;
mod memory;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_with::{serde_as, DurationSeconds};
use strum::{AsRefStr, Display};
use tokio::sync::mpsc;
use tracing::debug;

pub use file::FileMailboxProtocol;
pub use http::HttpProtocol;
pub use manager::{FallbackManager, FallbackSettings, FallbackStatus, ProtocolReport};
pub use memory::{InMemoryProtocol, MemoryHub};

/// Channel every protocol pushes received messages into.
pub type InboundSink = mpsc::UnboundedSender<FallbackMessage>;

/// Recipient id addressing every reachable peer.
pub const BROADCAST: &str = "all";

/// Relative urgency of a fallback message.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Display, AsRefStr, Serialize, Deserialize,
)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MessagePriority {
    /// Background traffic.
    Low = 1,
    /// Default.
    #[default]
    Normal = 2,
    /// Time sensitive traffic.
    High = 3,
    /// Must be delivered ahead of everything else.
    Critical = 4,
}

/// Unit of work carried by a fallback protocol.
#[serde_as]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FallbackMessage {
    /// Unique id, reused as the file name stem by the mailbox protocol.
    pub id: String,
    /// Originating node.
    pub sender_id: String,
    /// Target node, or `all`.
    pub recipient_id: String,
    /// Application level type tag.
    pub message_type: String,
    /// Opaque body.
    pub payload: serde_json::Value,
    /// Wall-clock enqueue time, compared across processes for TTL checks.
    pub enqueued_at: DateTime<Utc>,
    /// Urgency.
    #[serde(default)]
    pub priority: MessagePriority,
    /// Correlation id of the envelope inside, when there is one.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Attempts already spent by the manager.
    #[serde(default)]
    pub retry_count: u32,
    /// Attempt budget for the manager.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Lifetime after `enqueued_at`; unbounded when absent.
    #[serde(default, rename = "ttl_seconds")]
    #[serde_as(as = "Option<DurationSeconds<u64>>")]
    pub ttl: Option<Duration>,
}

fn default_max_retries() -> u32 {
    3
}

impl FallbackMessage {
    /// New message stamped with a random id and the current time.
    pub fn new(
        sender_id: impl Into<String>,
        recipient_id: impl Into<String>,
        message_type: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            recipient_id: recipient_id.into(),
            message_type: message_type.into(),
            payload,
            enqueued_at: Utc::now(),
            priority: MessagePriority::Normal,
            correlation_id: None,
            retry_count: 0,
            max_retries: default_max_retries(),
            ttl: None,
        }
    }

    /// Set the urgency.
    pub fn with_priority(mut self, priority: MessagePriority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the correlation id.
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Set the attempt budget.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the lifetime.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Whether `enqueued_at + ttl < now`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        match self.ttl.and_then(|ttl| chrono::Duration::from_std(ttl).ok()) {
            Some(ttl) => self.enqueued_at + ttl < now,
            None => false,
        }
    }

    /// [`Self::is_expired_at`] against the current time.
    pub fn is_expired(&self) -> bool {
        self.is_expired_at(Utc::now())
    }

    /// Whether the message addresses every peer.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST
    }
}

/// Operational status of one protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, Serialize, Deserialize)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ProtocolStatus {
    /// Initialized and healthy.
    Active,
    /// Usable but the last operation failed.
    Degraded,
    /// Not usable.
    Failed,
    /// Not initialized or shut down.
    Disabled,
}

/// Per-protocol counters.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProtocolStats {
    /// Successful hand-offs.
    pub messages_sent: u64,
    /// Messages pushed into the inbound sink.
    pub messages_received: u64,
    /// Failed operations.
    pub errors: u64,
    /// Last send or receive.
    pub last_activity: Option<DateTime<Utc>>,
}

/// Errors raised by fallback protocols and the manager.
#[derive(Debug, thiserror::Error)]
pub enum FallbackError {
    /// No protocol passed its health check.
    #[error("no healthy fallback protocol available")]
    NoActiveProtocol,
    /// The protocol cannot reach the recipient.
    #[error("recipient `{recipient}` is not reachable via {protocol}")]
    PeerUnreachable {
        /// Protocol name.
        protocol: &'static str,
        /// Requested recipient.
        recipient: String,
    },
    /// Filesystem or socket failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// HTTP client or server failure.
    #[error("http error: {0}")]
    Http(String),
    /// Message could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The message outlived its TTL.
    #[error("fallback message {0} expired before delivery")]
    Expired(String),
    /// The protocol or manager was used before `initialize`.
    #[error("{0} is not initialized")]
    NotInitialized(&'static str),
    /// The manager spent the attempt budget.
    #[error("fallback delivery failed after {attempts} attempts: {last_error}")]
    Exhausted {
        /// Attempts made.
        attempts: u32,
        /// Rendering of the last error.
        last_error: String,
    },
}

/// Interface shared by every fallback transport.
#[async_trait]
pub trait FallbackProtocol: Send + Sync {
    /// Short identifier used in logs, metrics and status reports.
    fn name(&self) -> &'static str;

    /// Prepare resources and remember where received messages go.
    async fn initialize(&self, sink: InboundSink) -> Result<(), FallbackError>;

    /// Hand a message off towards its recipient.
    async fn send(&self, message: &FallbackMessage) -> Result<(), FallbackError>;

    /// Start receiving. Idempotent.
    async fn start_listening(&self) -> Result<(), FallbackError>;

    /// Stop receiving. Idempotent.
    async fn stop_listening(&self);

    /// Whether the protocol can currently carry traffic.
    async fn health_check(&self) -> bool;

    /// Current status.
    fn status(&self) -> ProtocolStatus;

    /// Current counters.
    fn stats(&self) -> ProtocolStats;

    /// Release resources.
    async fn shutdown(&self) {
        self.stop_listening().await;
    }
}

/// Status, counters and inbound sink shared by the protocol implementations.
#[derive(Debug)]
pub(crate) struct ProtocolCore {
    name: &'static str,
    status: Mutex<ProtocolStatus>,
    stats: Mutex<ProtocolStats>,
    sink: Mutex<Option<InboundSink>>,
}

impl ProtocolCore {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            status: Mutex::new(ProtocolStatus::Disabled),
            stats: Mutex::new(ProtocolStats::default()),
            sink: Mutex::new(None),
        }
    }

    pub(crate) fn attach(&self, sink: InboundSink) {
        *self.sink.lock() = Some(sink);
        self.set_status(ProtocolStatus::Active);
    }

    pub(crate) fn is_initialized(&self) -> bool {
        self.sink.lock().is_some()
    }

    pub(crate) fn status(&self) -> ProtocolStatus {
        *self.status.lock()
    }

    pub(crate) fn set_status(&self, status: ProtocolStatus) {
        let mut current = self.status.lock();
        if *current != status {
            debug!(protocol = self.name, from = %*current, to = %status, "fallback protocol status");
            *current = status;
        }
    }

    pub(crate) fn stats(&self) -> ProtocolStats {
        self.stats.lock().clone()
    }

    pub(crate) fn record_sent(&self) {
        let mut stats = self.stats.lock();
        stats.messages_sent += 1;
        stats.last_activity = Some(Utc::now());
        drop(stats);
        if self.status() == ProtocolStatus::Degraded {
            self.set_status(ProtocolStatus::Active);
        }
    }

    pub(crate) fn record_error(&self) {
        self.stats.lock().errors += 1;
        if self.status() == ProtocolStatus::Active {
            self.set_status(ProtocolStatus::Degraded);
        }
    }

    /// Push a received message into the sink unless it expired.
    pub(crate) fn deliver(&self, message: FallbackMessage) -> bool {
        if message.is_expired() {
            debug!(
                protocol = self.name,
                message_id = %message.id,
                "dropping expired fallback message"
            );
            return false;
        }
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) if sink.send(message).is_ok() => {
                let mut stats = self.stats.lock();
                stats.messages_received += 1;
                stats.last_activity = Some(Utc::now());
                true
            }
            _ => {
                self.stats.lock().errors += 1;
                false
            }
        }
    }

    pub(crate) fn detach(&self) {
        *self.sink.lock() = None;
        self.set_status(ProtocolStatus::Disabled);
    }
}
