//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Connector orchestration over bridge, resilience and fallback."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Node-level connector for HSP traffic.
//!
//! A [`Connector`] owns one broker transport, the internal bus handlers
//! subscribe to, the publish circuit breaker and the fallback protocols.
//! Build one with [`Connector::builder`], call [`Connector::connect`] and
//! publish envelopes; inbound messages arrive on the bus channels of the
//! configured [`hsp_msg::TopicMapping`].

pub mod bridge;
pub mod connector;
pub mod error;

pub use bridge::{BusMessage, InboundEnvelope, InboundOutcome, InboundPath, MessageBridge};
pub use connector::{
    CapabilityProvider, CommunicationStatus, ConnectionState, Connector, ConnectorBuilder,
    HealthReport, LinkListener, FALLBACK_MESSAGE_TYPE,
};
pub use error::{AckOutcome, ConnectorError, DeliveryPath, DeliveryReceipt};
