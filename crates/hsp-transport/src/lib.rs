//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Transport implementations for the messaging bridge."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Broker transport adapters for the HSP bridge.
//!
//! [`TransportAdapter`] is the seam between the bridge and a broker
//! connection. [`MqttTransport`] talks to a real MQTT broker through
//! `rumqttc`; [`loopback::LoopbackTransport`] implements the same trait
//! against an in-process, scriptable broker and is what the connector tests
//! run against. Adapters move opaque bytes only and never look inside
//! payloads.

pub mod adapter;
pub mod backoff;
pub mod error;
pub mod loopback;
pub mod mqtt;
pub mod topic;

pub use adapter::{inbound_handler, DeliveryQos, InboundHandler, InboundMessage, TransportAdapter};
pub use backoff::ReconnectBackoff;
pub use error::TransportError;
pub use loopback::{LoopbackBroker, LoopbackTransport, PublishedRecord};
pub use mqtt::{MqttSettings, MqttTransport};
pub use topic::topic_matches;
