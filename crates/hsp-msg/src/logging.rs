//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::time::Duration;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry};
use strum::AsRefStr;
use tracing::debug;

use crate::types::Envelope;
use crate::validator::AlignError;

/// Direction of the message movement, used for consistent logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageDirection {
    /// Envelope handed to a transport.
    Outbound,
    /// Envelope received from a transport.
    Inbound,
    /// Envelope delivered through a fallback protocol.
    Fallback,
}

/// Why an inbound message never reached a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum DropReason {
    /// Not parseable as an envelope.
    Malformed,
    /// A required field was absent.
    MissingField,
    /// Message type outside the registry.
    UnknownType,
    /// Payload did not match its schema.
    InvalidPayload,
    /// Envelope version we cannot read.
    UnsupportedVersion,
    /// No internal channel is mapped for the message type.
    Unmapped,
    /// Echo of an envelope this node sent itself.
    SelfOriginated,
}

impl From<&AlignError> for DropReason {
    fn from(err: &AlignError) -> Self {
        match err {
            AlignError::MalformedInput(_) => DropReason::Malformed,
            AlignError::MissingField(_) => DropReason::MissingField,
            AlignError::UnknownMessageType(_) => DropReason::UnknownType,
            AlignError::InvalidPayload { .. } => DropReason::InvalidPayload,
            AlignError::UnsupportedVersion(_) => DropReason::UnsupportedVersion,
        }
    }
}

/// Emit a structured log entry for envelope activity.
pub fn log_envelope(direction: MessageDirection, topic: &str, envelope: &Envelope) {
    debug!(
        message_id = %envelope.message_id,
        correlation_id = %envelope.correlation_id,
        message_type = %envelope.message_type,
        sender_id = %envelope.sender_id,
        recipient_id = %envelope.recipient_id,
        requires_ack = envelope.qos.requires_ack,
        topic = %topic,
        direction = ?direction,
        "messaging activity"
    );
}

/// Prometheus metric handles for messaging activity.
#[derive(Clone)]
pub struct MessagingMetricsExporter {
    sent: IntCounterVec,
    received: IntCounterVec,
    dropped: IntCounterVec,
    acks: IntCounter,
    latency: Histogram,
}

impl std::fmt::Debug for MessagingMetricsExporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagingMetricsExporter").finish()
    }
}

impl MessagingMetricsExporter {
    /// Register messaging metrics with the provided registry.
    pub fn register(registry: &Registry) -> Result<Self, prometheus::Error> {
        let sent = IntCounterVec::new(
            Opts::new("hsp_messages_sent_total", "Envelopes published via transports"),
            &["message_type", "path"],
        )?;
        let received = IntCounterVec::new(
            Opts::new(
                "hsp_messages_received_total",
                "Envelopes accepted from transports",
            ),
            &["message_type"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new(
                "hsp_messages_dropped_total",
                "Inbound messages discarded before dispatch",
            ),
            &["reason"],
        )?;
        let acks = IntCounter::with_opts(Opts::new(
            "hsp_acknowledgements_received_total",
            "Acknowledgements matched to a pending send",
        ))?;
        let latency = Histogram::with_opts(HistogramOpts::new(
            "hsp_ack_roundtrip_latency_seconds",
            "Observed latency between publish and acknowledgement",
        ))?;

        registry.register(Box::new(sent.clone()))?;
        registry.register(Box::new(received.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(acks.clone()))?;
        registry.register(Box::new(latency.clone()))?;

        Ok(Self {
            sent,
            received,
            dropped,
            acks,
            latency,
        })
    }

    /// Record a sent envelope; `path` is `primary` or `fallback`.
    pub fn observe_sent(&self, envelope: &Envelope, path: &str) {
        self.sent
            .with_label_values(&[envelope.message_type.as_ref(), path])
            .inc();
    }

    /// Record an accepted inbound envelope.
    pub fn observe_received(&self, envelope: &Envelope) {
        self.received
            .with_label_values(&[envelope.message_type.as_ref()])
            .inc();
    }

    /// Record a dropped inbound message.
    pub fn observe_dropped(&self, reason: DropReason) {
        self.dropped.with_label_values(&[reason.as_ref()]).inc();
    }

    /// Record a matched acknowledgement and its round-trip latency.
    pub fn observe_ack(&self, latency: Duration) {
        self.acks.inc();
        self.latency.observe(latency.as_secs_f64());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MessageType;
    use serde_json::json;

    #[test]
    fn metrics_exporter_records_counts() {
        let registry = Registry::new();
        let metrics = MessagingMetricsExporter::register(&registry).expect("register metrics");
        let envelope = Envelope::builder("a", MessageType::Fact, json!({})).build();
        metrics.observe_sent(&envelope, "primary");
        metrics.observe_received(&envelope);
        metrics.observe_dropped(DropReason::UnknownType);
        metrics.observe_ack(Duration::from_millis(10));

        let families = registry.gather();
        let dropped = families
            .iter()
            .find(|f| f.get_name() == "hsp_messages_dropped_total")
            .expect("dropped family");
        assert_eq!(
            dropped.get_metric()[0].get_label()[0].get_value(),
            "unknown_type"
        );
        assert!(families
            .iter()
            .any(|f| f.get_name() == "hsp_messages_sent_total"));
    }
}
