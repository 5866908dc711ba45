//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Envelope model and in-process routing for the HSP bridge.
//!
//! Raw bytes received from any transport pass through [`align`] which yields a
//! canonical [`Envelope`] plus its [`TypedPayload`], rejecting envelope
//! versions the local [`VersionPolicy`] cannot read. [`TopicMapping`] resolves the
//! internal channel for a message type and [`InternalBus`] fans the envelope out
//! to registered handlers.
#![warn(missing_docs)]

pub mod bus;
pub mod logging;
pub mod topics;
pub mod types;
pub mod validator;
pub mod versioning;

pub use bus::{DeliveryHandle, DeliveryReport, Handler, InternalBus, SubscriptionId};
pub use logging::{log_envelope, DropReason, MessageDirection, MessagingMetricsExporter};
pub use topics::{TopicMapping, WireTopics};
pub use types::{
    AckPayload, CapabilityAdvertisementPayload, Envelope, EnvelopeBuilder, FactPayload,
    HspPayload, MessageType, ParseMessageTypeError, Priority, Qos, TaskRequestPayload,
    TaskResultPayload, TypedPayload, ACK_STATUS_RECEIVED, BROADCAST_RECIPIENT, ENVELOPE_VERSION,
};
pub use validator::{align, align_value, align_value_with, align_with, AlignError, Aligned};
pub use versioning::{Compatibility, EnvelopeVersion, ParseVersionError, Upgrade, VersionPolicy};
