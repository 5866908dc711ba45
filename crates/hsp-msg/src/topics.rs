//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
use std::collections::HashMap;

use serde_json::Value as JsonValue;

use crate::types::{Envelope, MessageType};

/// Prefix shared by the internal channels fed from external transports.
pub const DEFAULT_CHANNEL_PREFIX: &str = "hsp.external.";

/// Category used for facts that do not name one.
pub const DEFAULT_FACT_CATEGORY: &str = "general";

/// Static table resolving the internal bus channel for a message type.
///
/// Constructed once at start-up and handed to the bridge; a message type
/// without an entry is logged and dropped by the caller.
#[derive(Debug, Clone)]
pub struct TopicMapping {
    prefix: String,
    suffixes: HashMap<MessageType, String>,
}

impl TopicMapping {
    /// Empty mapping using the given channel prefix.
    pub fn empty(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            suffixes: HashMap::new(),
        }
    }

    /// Map a message type to a channel suffix.
    pub fn with_channel(mut self, message_type: MessageType, suffix: impl Into<String>) -> Self {
        self.suffixes.insert(message_type, suffix.into());
        self
    }

    /// Remove the entry of a message type.
    pub fn without(mut self, message_type: MessageType) -> Self {
        self.suffixes.remove(&message_type);
        self
    }

    /// Fully qualified internal channel for `message_type`.
    pub fn channel_for(&self, message_type: MessageType) -> Option<String> {
        self.suffixes
            .get(&message_type)
            .map(|suffix| format!("{}{}", self.prefix, suffix))
    }
}

impl Default for TopicMapping {
    fn default() -> Self {
        Self::empty(DEFAULT_CHANNEL_PREFIX)
            .with_channel(MessageType::Fact, "fact")
            .with_channel(
                MessageType::CapabilityAdvertisement,
                "capability_advertisement",
            )
            .with_channel(MessageType::TaskRequest, "task_request")
            .with_channel(MessageType::TaskResult, "task_result")
            .with_channel(MessageType::Acknowledgement, "acknowledgement")
    }
}

/// Wire topic naming convention rooted at a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireTopics {
    namespace: String,
}

impl WireTopics {
    /// Topics under `namespace` (for example `hsp`).
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
        }
    }

    /// Namespace the topics are rooted at.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// `ns/requests/{recipient}`.
    pub fn requests(&self, recipient_id: &str) -> String {
        format!("{}/requests/{}", self.namespace, recipient_id)
    }

    /// `ns/results/{recipient}`.
    pub fn results(&self, recipient_id: &str) -> String {
        format!("{}/results/{}", self.namespace, recipient_id)
    }

    /// `ns/acks/{recipient}`.
    pub fn acks(&self, recipient_id: &str) -> String {
        format!("{}/acks/{}", self.namespace, recipient_id)
    }

    /// `ns/capabilities/advertisements/{sender}`.
    pub fn capabilities(&self, sender_id: &str) -> String {
        format!("{}/capabilities/advertisements/{}", self.namespace, sender_id)
    }

    /// `ns/knowledge/facts/{category}`.
    pub fn facts(&self, category: &str) -> String {
        format!("{}/knowledge/facts/{}", self.namespace, category)
    }

    /// Filter matching `base` and everything beneath it.
    pub fn wildcard(base: &str) -> String {
        format!("{}/#", base.trim_end_matches('/'))
    }

    /// Filters a node subscribes to in order to receive its own traffic and
    /// every broadcast.
    pub fn subscriptions_for(&self, node_id: &str) -> Vec<String> {
        vec![
            self.requests(node_id),
            self.requests(crate::types::BROADCAST_RECIPIENT),
            self.results(node_id),
            self.acks(node_id),
            Self::wildcard(&format!("{}/capabilities/advertisements", self.namespace)),
            Self::wildcard(&format!("{}/knowledge/facts", self.namespace)),
        ]
    }

    /// Default wire topic for an envelope, derived from its message type.
    ///
    /// Facts are filed under the `category` payload field when present.
    pub fn for_envelope(&self, envelope: &Envelope) -> String {
        match envelope.message_type {
            MessageType::Fact => {
                let category = envelope
                    .payload
                    .get("category")
                    .and_then(JsonValue::as_str)
                    .filter(|c| !c.is_empty() && !c.contains(['/', '#', '+']))
                    .unwrap_or(DEFAULT_FACT_CATEGORY);
                self.facts(category)
            }
            MessageType::CapabilityAdvertisement => self.capabilities(&envelope.sender_id),
            MessageType::TaskRequest => self.requests(&envelope.recipient_id),
            MessageType::TaskResult => self.results(&envelope.recipient_id),
            MessageType::Acknowledgement => self.acks(&envelope.recipient_id),
        }
    }
}

impl Default for WireTopics {
    fn default() -> Self {
        Self::new("hsp")
    }
}
