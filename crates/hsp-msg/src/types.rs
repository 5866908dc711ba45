//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use strum::{AsRefStr, Display, EnumIter};
use uuid::Uuid;

/// Envelope schema version emitted by this crate.
pub const ENVELOPE_VERSION: &str = "0.1";

/// Recipient identifier addressing every node.
pub const BROADCAST_RECIPIENT: &str = "all";

/// Status carried by automatically generated acknowledgements.
pub const ACK_STATUS_RECEIVED: &str = "received";

/// Registry of message kinds understood by the bridge.
///
/// Serialises to the bare name (`"TaskRequest"`); parsing additionally accepts
/// the versioned `HSP::TaskRequest_v0.1` spelling and is insensitive to case,
/// underscores and dashes.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Display,
    AsRefStr,
    EnumIter,
    SerializeDisplay,
    DeserializeFromStr,
)]
pub enum MessageType {
    /// A unit of knowledge shared between nodes.
    Fact,
    /// A node announcing something it can do.
    CapabilityAdvertisement,
    /// A request for a peer to execute a capability.
    TaskRequest,
    /// The outcome of a previously requested task.
    TaskResult,
    /// Confirmation that an envelope was received and handled.
    Acknowledgement,
}

/// Error returned when a message type tag is not part of the registry.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown message type `{0}`")]
pub struct ParseMessageTypeError(pub String);

impl FromStr for MessageType {
    type Err = ParseMessageTypeError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let mut name = raw.trim();
        if let Some(stripped) = name.strip_prefix("HSP::") {
            name = stripped;
        }
        if let Some(idx) = name.rfind("_v") {
            let version = &name[idx + 2..];
            if !version.is_empty() && version.chars().all(|c| c.is_ascii_digit() || c == '.') {
                name = &name[..idx];
            }
        }
        let key: String = name
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .flat_map(char::to_lowercase)
            .collect();
        match key.as_str() {
            "fact" => Ok(MessageType::Fact),
            "capabilityadvertisement" => Ok(MessageType::CapabilityAdvertisement),
            "taskrequest" => Ok(MessageType::TaskRequest),
            "taskresult" => Ok(MessageType::TaskResult),
            "acknowledgement" | "acknowledgment" | "ack" => Ok(MessageType::Acknowledgement),
            _ => Err(ParseMessageTypeError(raw.to_owned())),
        }
    }
}

/// Delivery priority hint carried in the envelope QoS block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background traffic such as acknowledgements.
    Low,
    /// Default priority.
    #[default]
    #[serde(alias = "normal")]
    Medium,
    /// Latency sensitive traffic.
    High,
}

/// Quality of service parameters attached to every envelope.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Qos {
    /// Whether the receiver must answer with an acknowledgement.
    #[serde(default)]
    pub requires_ack: bool,
    /// Delivery priority hint.
    #[serde(default)]
    pub priority: Priority,
    /// Unrecognised QoS parameters, kept for forward compatibility.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Qos {
    /// QoS block for a message expecting an acknowledgement.
    pub fn acknowledged() -> Self {
        Self {
            requires_ack: true,
            ..Self::default()
        }
    }
}

/// Canonical wrapper around every transmitted message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Schema version of the envelope itself.
    pub envelope_version: String,
    /// Unique identifier of this transmission.
    pub message_id: String,
    /// Links replies and acknowledgements to the originating message.
    pub correlation_id: String,
    /// Node that produced the envelope.
    pub sender_id: String,
    /// Addressed node, or [`BROADCAST_RECIPIENT`].
    pub recipient_id: String,
    /// Time the sender built the envelope.
    pub sent_at: DateTime<Utc>,
    /// Tag selecting the payload schema.
    pub message_type: MessageType,
    /// Reference to the payload schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_schema_ref: Option<String>,
    /// Delivery parameters.
    #[serde(default)]
    pub qos: Qos,
    /// Opaque payload, typed by `message_type`.
    pub payload: JsonValue,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

impl Envelope {
    /// Start building an envelope carrying a raw JSON payload.
    pub fn builder(
        sender_id: impl Into<String>,
        message_type: MessageType,
        payload: JsonValue,
    ) -> EnvelopeBuilder {
        EnvelopeBuilder::new(sender_id, message_type, payload)
    }

    /// Whether the sender asked for an acknowledgement.
    pub fn requires_ack(&self) -> bool {
        self.qos.requires_ack
    }

    /// Whether the envelope addresses every node.
    pub fn is_broadcast(&self) -> bool {
        self.recipient_id == BROADCAST_RECIPIENT
    }

    /// Decode the payload into its typed representation.
    pub fn typed_payload(&self) -> Result<TypedPayload, serde_json::Error> {
        TypedPayload::decode(self.message_type, &self.payload)
    }

    /// Build the acknowledgement `responder` sends back for this envelope.
    ///
    /// The acknowledgement is addressed to the original sender, carries this
    /// envelope's correlation id and names the acknowledged `message_id`.
    pub fn acknowledgement(&self, responder: &str) -> Result<Envelope, serde_json::Error> {
        let ack = AckPayload {
            status: ACK_STATUS_RECEIVED.to_owned(),
            ack_timestamp: Utc::now(),
            target_message_id: self.message_id.clone(),
            extra: Map::new(),
        };
        Ok(EnvelopeBuilder::typed(responder, &ack)?
            .recipient(self.sender_id.clone())
            .correlation_id(self.correlation_id.clone())
            .priority(Priority::Low)
            .build())
    }
}

/// Fluent constructor for [`Envelope`].
#[derive(Debug, Clone)]
pub struct EnvelopeBuilder {
    envelope: Envelope,
    correlation_set: bool,
}

impl EnvelopeBuilder {
    /// Create a builder with a fresh message id and broadcast recipient.
    pub fn new(sender_id: impl Into<String>, message_type: MessageType, payload: JsonValue) -> Self {
        let message_id = Uuid::new_v4().to_string();
        Self {
            envelope: Envelope {
                envelope_version: ENVELOPE_VERSION.to_owned(),
                correlation_id: message_id.clone(),
                message_id,
                sender_id: sender_id.into(),
                recipient_id: BROADCAST_RECIPIENT.to_owned(),
                sent_at: Utc::now(),
                message_type,
                payload_schema_ref: Some(format!(
                    "hsp:schema:payload/{}/{}",
                    message_type, ENVELOPE_VERSION
                )),
                qos: Qos::default(),
                payload,
                extra: Map::new(),
            },
            correlation_set: false,
        }
    }

    /// Create a builder from a typed payload.
    pub fn typed<P: HspPayload>(
        sender_id: impl Into<String>,
        payload: &P,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(sender_id, P::MESSAGE_TYPE, serde_json::to_value(payload)?))
    }

    /// Address a single node.
    pub fn recipient(mut self, recipient_id: impl Into<String>) -> Self {
        self.envelope.recipient_id = recipient_id.into();
        self
    }

    /// Override the generated message id.
    pub fn message_id(mut self, message_id: impl Into<String>) -> Self {
        self.envelope.message_id = message_id.into();
        if !self.correlation_set {
            self.envelope.correlation_id = self.envelope.message_id.clone();
        }
        self
    }

    /// Link the envelope to an earlier message.
    pub fn correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.envelope.correlation_id = correlation_id.into();
        self.correlation_set = true;
        self
    }

    /// Request an acknowledgement from the receiver.
    pub fn requires_ack(mut self, requires_ack: bool) -> Self {
        self.envelope.qos.requires_ack = requires_ack;
        self
    }

    /// Set the delivery priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.envelope.qos.priority = priority;
        self
    }

    /// Replace the whole QoS block.
    pub fn qos(mut self, qos: Qos) -> Self {
        self.envelope.qos = qos;
        self
    }

    /// Override the payload schema reference.
    pub fn schema_ref(mut self, schema_ref: impl Into<String>) -> Self {
        self.envelope.payload_schema_ref = Some(schema_ref.into());
        self
    }

    /// Attach an additional top-level field.
    pub fn extra_field(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        self.envelope.extra.insert(key.into(), value);
        self
    }

    /// Finish the envelope.
    pub fn build(self) -> Envelope {
        self.envelope
    }
}

/// Implemented by every typed payload so callers can work with concrete structs.
pub trait HspPayload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Message type whose payload schema this struct models.
    const MESSAGE_TYPE: MessageType;

    /// Extract this payload from a decoded [`TypedPayload`].
    fn from_typed(payload: TypedPayload) -> Option<Self>;
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// A unit of knowledge shared between nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactPayload {
    /// Identifier of the fact.
    pub id: String,
    /// How the statement is expressed (`natural_language`, `semantic_triple`, ...).
    pub statement_type: String,
    /// Natural language rendering of the fact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_nl: Option<String>,
    /// Structured rendering of the fact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement_structured: Option<JsonValue>,
    /// Node that originally produced the fact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_ai_id: Option<String>,
    /// Creation time as reported by the producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp_created: Option<String>,
    /// Producer confidence between 0 and 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence_score: Option<f64>,
    /// Free form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A node announcing something it can do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapabilityAdvertisementPayload {
    /// Identifier of the capability.
    pub capability_id: String,
    /// Node offering the capability.
    pub ai_id: String,
    /// Human readable name.
    pub name: String,
    /// Longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Capability version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Availability (`online`, `degraded`, `offline`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_status: Option<String>,
    /// Free form labels.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// A request for a peer to execute a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRequestPayload {
    /// Identifier of the request.
    pub request_id: String,
    /// Node asking for the work.
    pub requester_ai_id: String,
    /// Node expected to execute the task.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_ai_id: Option<String>,
    /// Capability selected by id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_id_filter: Option<String>,
    /// Capability selected by name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capability_name_filter: Option<String>,
    /// Task arguments.
    #[serde(default)]
    pub parameters: Map<String, JsonValue>,
    /// Where the result should be sent when not the requester's results topic.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback_address: Option<String>,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// The outcome of a previously requested task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultPayload {
    /// Identifier of the result.
    pub result_id: String,
    /// Request this result answers.
    pub request_id: String,
    /// Node that executed the task.
    pub executing_ai_id: String,
    /// Execution status (`success`, `failure`, `in_progress`, ...).
    pub status: String,
    /// Result data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<JsonValue>,
    /// Error description when the task failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_details: Option<JsonValue>,
    /// Whether the result is partial.
    #[serde(default, skip_serializing_if = "is_false")]
    pub partial: bool,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Confirmation that an envelope was received and handled.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckPayload {
    /// Receipt status, `received` for automatic acknowledgements.
    pub status: String,
    /// Time the acknowledgement was produced.
    pub ack_timestamp: DateTime<Utc>,
    /// `message_id` of the acknowledged envelope.
    pub target_message_id: String,
    /// Fields this version does not know about.
    #[serde(flatten)]
    pub extra: Map<String, JsonValue>,
}

/// Payload decoded according to its message type.
#[derive(Debug, Clone, PartialEq)]
pub enum TypedPayload {
    /// See [`FactPayload`].
    Fact(FactPayload),
    /// See [`CapabilityAdvertisementPayload`].
    CapabilityAdvertisement(CapabilityAdvertisementPayload),
    /// See [`TaskRequestPayload`].
    TaskRequest(TaskRequestPayload),
    /// See [`TaskResultPayload`].
    TaskResult(TaskResultPayload),
    /// See [`AckPayload`].
    Acknowledgement(AckPayload),
}

impl TypedPayload {
    /// Decode a raw payload using the schema selected by `message_type`.
    pub fn decode(message_type: MessageType, payload: &JsonValue) -> Result<Self, serde_json::Error> {
        let value = payload.clone();
        Ok(match message_type {
            MessageType::Fact => TypedPayload::Fact(serde_json::from_value(value)?),
            MessageType::CapabilityAdvertisement => {
                TypedPayload::CapabilityAdvertisement(serde_json::from_value(value)?)
            }
            MessageType::TaskRequest => TypedPayload::TaskRequest(serde_json::from_value(value)?),
            MessageType::TaskResult => TypedPayload::TaskResult(serde_json::from_value(value)?),
            MessageType::Acknowledgement => {
                TypedPayload::Acknowledgement(serde_json::from_value(value)?)
            }
        })
    }

    /// Message type of the payload.
    pub fn message_type(&self) -> MessageType {
        match self {
            TypedPayload::Fact(_) => MessageType::Fact,
            TypedPayload::CapabilityAdvertisement(_) => MessageType::CapabilityAdvertisement,
            TypedPayload::TaskRequest(_) => MessageType::TaskRequest,
            TypedPayload::TaskResult(_) => MessageType::TaskResult,
            TypedPayload::Acknowledgement(_) => MessageType::Acknowledgement,
        }
    }
}

macro_rules! impl_hsp_payload {
    ($ty:ty, $variant:ident) => {
        impl HspPayload for $ty {
            const MESSAGE_TYPE: MessageType = MessageType::$variant;

            fn from_typed(payload: TypedPayload) -> Option<Self> {
                match payload {
                    TypedPayload::$variant(inner) => Some(inner),
                    _ => None,
                }
            }
        }
    };
}

impl_hsp_payload!(FactPayload, Fact);
impl_hsp_payload!(CapabilityAdvertisementPayload, CapabilityAdvertisement);
impl_hsp_payload!(TaskRequestPayload, TaskRequest);
impl_hsp_payload!(TaskResultPayload, TaskResult);
impl_hsp_payload!(AckPayload, Acknowledgement);
