//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Translation between transport bytes and the internal bus."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Translation between transport bytes and internal bus traffic.
//!
//! Outbound envelopes are serialized and published on their wire topic.
//! Inbound bytes are validated, mapped to an internal channel and fanned out
//! on the [`InternalBus`]; the call returns only after every handler
//! finished, so work that depends on handler completion (acknowledgements)
//! can follow directly.

use std::sync::Arc;

use bytes::Bytes;
use hsp_msg::{
    align, align_value, log_envelope, AlignError, Aligned, DeliveryReport, DropReason, Envelope,
    InternalBus, MessageDirection, MessagingMetricsExporter, TopicMapping, TypedPayload,
    WireTopics,
};
use hsp_transport::{DeliveryQos, TransportAdapter, TransportError};
use serde_json::Value;
use tracing::{debug, warn};

/// Where an inbound message came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundPath {
    /// The broker link.
    Broker,
    /// A fallback protocol.
    Fallback,
}

impl InboundPath {
    fn direction(self) -> MessageDirection {
        match self {
            InboundPath::Broker => MessageDirection::Inbound,
            InboundPath::Fallback => MessageDirection::Fallback,
        }
    }
}

/// Message published on the internal bus.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundEnvelope {
    /// Validated envelope.
    pub envelope: Envelope,
    /// Decoded payload.
    pub payload: TypedPayload,
    /// Wire topic the message arrived on.
    pub wire_topic: String,
    /// Transport that carried it.
    pub path: InboundPath,
}

/// Result of [`MessageBridge::handle_inbound`].
#[derive(Debug)]
pub enum InboundOutcome {
    /// Handlers ran.
    Delivered {
        /// What the handlers saw.
        message: Arc<InboundEnvelope>,
        /// Handler results.
        report: DeliveryReport,
    },
    /// The message never reached a handler.
    Dropped(DropReason),
}

/// Bus message type.
pub type BusMessage = Arc<InboundEnvelope>;

/// Glue between a transport adapter, the validator and the internal bus.
#[derive(Clone)]
pub struct MessageBridge {
    node_id: String,
    transport: Arc<dyn TransportAdapter>,
    bus: InternalBus<BusMessage>,
    mapping: TopicMapping,
    topics: WireTopics,
    metrics: Option<MessagingMetricsExporter>,
}

impl std::fmt::Debug for MessageBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageBridge")
            .field("node_id", &self.node_id)
            .field("transport", &self.transport.name())
            .field("namespace", &self.topics.namespace())
            .finish_non_exhaustive()
    }
}

impl MessageBridge {
    /// Bridge for `node_id`.
    pub fn new(
        node_id: impl Into<String>,
        transport: Arc<dyn TransportAdapter>,
        bus: InternalBus<BusMessage>,
        mapping: TopicMapping,
        topics: WireTopics,
        metrics: Option<MessagingMetricsExporter>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            transport,
            bus,
            mapping,
            topics,
            metrics,
        }
    }

    /// Internal bus handlers subscribe to.
    pub fn bus(&self) -> &InternalBus<BusMessage> {
        &self.bus
    }

    /// Channel table.
    pub fn mapping(&self) -> &TopicMapping {
        &self.mapping
    }

    /// Wire topic convention.
    pub fn topics(&self) -> &WireTopics {
        &self.topics
    }

    /// Serialize an envelope for the wire.
    pub fn encode(envelope: &Envelope) -> Result<Bytes, serde_json::Error> {
        serde_json::to_vec(envelope).map(Bytes::from)
    }

    /// Publish already encoded bytes on `topic`.
    pub async fn forward(&self, topic: &str, bytes: Bytes) -> Result<(), TransportError> {
        self.transport
            .publish(topic, bytes, DeliveryQos::AtLeastOnce)
            .await
    }

    /// Publish `envelope` on the wire topic implied by its type and recipient.
    pub async fn handle_outbound(&self, envelope: &Envelope) -> Result<(), TransportError> {
        let topic = self.topics.for_envelope(envelope);
        let bytes = Self::encode(envelope).map_err(|err| TransportError::Protocol(err.to_string()))?;
        self.forward(&topic, bytes).await?;
        log_envelope(MessageDirection::Outbound, &topic, envelope);
        Ok(())
    }

    /// Validate raw transport bytes and dispatch them.
    pub async fn handle_inbound(&self, topic: &str, raw: &[u8], path: InboundPath) -> InboundOutcome {
        self.dispatch(topic, align(raw), path).await
    }

    /// Validate an already parsed document and dispatch it.
    pub async fn handle_inbound_value(&self, topic: &str, value: Value, path: InboundPath) -> InboundOutcome {
        self.dispatch(topic, align_value(value), path).await
    }

    async fn dispatch(&self, topic: &str, aligned: Result<Aligned, AlignError>, path: InboundPath) -> InboundOutcome {
        let Aligned { envelope, payload } = match aligned {
            Ok(aligned) => aligned,
            Err(err) => {
                warn!(topic = %topic, path = ?path, error = %err, "dropping inbound message");
                return self.drop_with(DropReason::from(&err));
            }
        };

        if envelope.sender_id == self.node_id {
            debug!(topic = %topic, message_id = %envelope.message_id, "ignoring own envelope");
            return self.drop_with(DropReason::SelfOriginated);
        }

        let Some(channel) = self.mapping.channel_for(envelope.message_type) else {
            warn!(
                topic = %topic,
                message_type = %envelope.message_type,
                message_id = %envelope.message_id,
                "no internal channel mapped; dropping"
            );
            return self.drop_with(DropReason::Unmapped);
        };

        log_envelope(path.direction(), topic, &envelope);
        if let Some(metrics) = &self.metrics {
            metrics.observe_received(&envelope);
        }
        let message = Arc::new(InboundEnvelope {
            envelope,
            payload,
            wire_topic: topic.to_owned(),
            path,
        });
        let report = self
            .bus
            .publish_async(&channel, Arc::clone(&message))
            .wait()
            .await;
        if !report.had_subscribers() {
            debug!(channel = %channel, "no subscribers for inbound message");
        }
        InboundOutcome::Delivered { message, report }
    }

    fn drop_with(&self, reason: DropReason) -> InboundOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.observe_dropped(reason);
        }
        InboundOutcome::Dropped(reason)
    }
}
