//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Normalisation of raw inbound messages into canonical envelopes.
//!
//! Older peers emit envelopes with the `hsp_envelope_version`, `sender_ai_id`,
//! `recipient_ai_id`, `timestamp_sent`, `qos_parameters` and
//! `payload_schema_uri` field names. These are rewritten to their canonical
//! names before the envelope is decoded; any other unknown field is kept in
//! [`Envelope::extra`]. The envelope version is then checked against a
//! [`VersionPolicy`], see [`crate::versioning`].

use chrono::{DateTime, NaiveDateTime, Utc};
use serde_json::{Map, Value as JsonValue};

use crate::types::{Envelope, MessageType, TypedPayload, BROADCAST_RECIPIENT};
use crate::versioning::VersionPolicy;

const LEGACY_FIELDS: &[(&str, &str)] = &[
    ("hsp_envelope_version", "envelope_version"),
    ("sender_ai_id", "sender_id"),
    ("recipient_ai_id", "recipient_id"),
    ("timestamp_sent", "sent_at"),
    ("qos_parameters", "qos"),
    ("payload_schema_uri", "payload_schema_ref"),
];

/// Reasons an inbound message is rejected.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AlignError {
    /// The bytes are not a JSON object or do not fit the envelope shape.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// A field required to route or acknowledge the message is absent.
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    /// The message type is not part of the registry.
    #[error("unknown message type `{0}`")]
    UnknownMessageType(String),
    /// The payload does not match the schema of its message type.
    #[error("invalid {message_type} payload: {reason}")]
    InvalidPayload {
        /// Declared message type.
        message_type: MessageType,
        /// Decoder diagnostic.
        reason: String,
    },
    /// The envelope version is newer than ours or has no upgrade path.
    #[error("unsupported envelope version `{0}`")]
    UnsupportedVersion(String),
}

/// Successfully validated message.
#[derive(Debug, Clone, PartialEq)]
pub struct Aligned {
    /// Canonical envelope.
    pub envelope: Envelope,
    /// Payload decoded according to the envelope's message type.
    pub payload: TypedPayload,
}

/// Parse and validate raw transport bytes.
pub fn align(raw: &[u8]) -> Result<Aligned, AlignError> {
    align_with(raw, &VersionPolicy::default())
}

/// [`align`] with an explicit version policy.
pub fn align_with(raw: &[u8], versions: &VersionPolicy) -> Result<Aligned, AlignError> {
    let value: JsonValue =
        serde_json::from_slice(raw).map_err(|err| AlignError::MalformedInput(err.to_string()))?;
    align_value_with(value, versions)
}

/// Validate an already parsed JSON document.
pub fn align_value(value: JsonValue) -> Result<Aligned, AlignError> {
    align_value_with(value, &VersionPolicy::default())
}

/// [`align_value`] with an explicit version policy.
pub fn align_value_with(value: JsonValue, versions: &VersionPolicy) -> Result<Aligned, AlignError> {
    let JsonValue::Object(mut fields) = value else {
        return Err(AlignError::MalformedInput(
            "envelope must be a JSON object".to_owned(),
        ));
    };

    rename_legacy_fields(&mut fields);
    versions.apply(&mut fields)?;

    let message_id = required_string(&fields, "message_id")?;
    required_string(&fields, "sender_id")?;
    let raw_type = required_string(&fields, "message_type")?;
    if is_absent(fields.get("payload")) {
        return Err(AlignError::MissingField("payload"));
    }

    let message_type: MessageType = raw_type
        .parse()
        .map_err(|_| AlignError::UnknownMessageType(raw_type.clone()))?;
    fields.insert(
        "message_type".to_owned(),
        JsonValue::String(message_type.to_string()),
    );

    if is_absent(fields.get("correlation_id")) {
        fields.insert("correlation_id".to_owned(), JsonValue::String(message_id));
    }
    if is_absent(fields.get("recipient_id")) {
        fields.insert(
            "recipient_id".to_owned(),
            JsonValue::String(BROADCAST_RECIPIENT.to_owned()),
        );
    }
    if is_absent(fields.get("qos")) {
        fields.remove("qos");
    }
    if is_absent(fields.get("payload_schema_ref")) {
        fields.remove("payload_schema_ref");
    }
    normalise_timestamp(&mut fields)?;

    let envelope: Envelope = serde_json::from_value(JsonValue::Object(fields))
        .map_err(|err| AlignError::MalformedInput(err.to_string()))?;
    let payload =
        envelope
            .typed_payload()
            .map_err(|err| AlignError::InvalidPayload {
                message_type: envelope.message_type,
                reason: err.to_string(),
            })?;

    Ok(Aligned { envelope, payload })
}

fn rename_legacy_fields(fields: &mut Map<String, JsonValue>) {
    for (legacy, canonical) in LEGACY_FIELDS {
        if let Some(value) = fields.remove(*legacy) {
            if is_absent(fields.get(*canonical)) {
                fields.insert((*canonical).to_owned(), value);
            }
        }
    }
}

fn is_absent(value: Option<&JsonValue>) -> bool {
    matches!(value, None | Some(JsonValue::Null))
}

fn required_string(
    fields: &Map<String, JsonValue>,
    name: &'static str,
) -> Result<String, AlignError> {
    match fields.get(name) {
        Some(JsonValue::String(value)) if !value.trim().is_empty() => Ok(value.clone()),
        Some(JsonValue::String(_)) | None | Some(JsonValue::Null) => {
            Err(AlignError::MissingField(name))
        }
        Some(other) => Err(AlignError::MalformedInput(format!(
            "field `{}` must be a string, found {}",
            name, other
        ))),
    }
}

/// Timestamps without an offset are read as UTC; a missing timestamp is
/// replaced by the receive time.
fn normalise_timestamp(fields: &mut Map<String, JsonValue>) -> Result<(), AlignError> {
    let sent_at = match fields.get("sent_at") {
        None | Some(JsonValue::Null) => Utc::now(),
        Some(JsonValue::String(raw)) => parse_timestamp(raw).ok_or_else(|| {
            AlignError::MalformedInput(format!("unparseable sent_at timestamp `{}`", raw))
        })?,
        Some(other) => {
            return Err(AlignError::MalformedInput(format!(
                "field `sent_at` must be a string, found {}",
                other
            )))
        }
    };
    fields.insert(
        "sent_at".to_owned(),
        JsonValue::String(sent_at.to_rfc3339()),
    );
    Ok(())
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Some(parsed.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}
