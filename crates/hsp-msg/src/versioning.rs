//! ---
//! hsp_section: "02-messaging-ipc-data-model"
//! hsp_subsection: "module"
//! hsp_type: "source"
//! hsp_scope: "code"
//! hsp_description: "Envelope schema helpers, validation and in-process routing."
//! hsp_version: "v0.0.0-prealpha"
//! hsp_owner: "tbd"
//! ---
//! Envelope version compatibility.
//!
//! Versions are `major.minor[.patch]` and the patch level never affects
//! compatibility. An envelope carrying the local version is taken as is. An
//! older version is accepted only when a chain of registered upgrades leads
//! to the local version; the upgrades rewrite the raw fields before decoding.
//! Every other version, including any newer one, is rejected.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde_json::{Map, Value as JsonValue};
use tracing::debug;

use crate::types::ENVELOPE_VERSION;
use crate::validator::AlignError;

/// Field holding the envelope version after legacy names were rewritten.
pub const VERSION_FIELD: &str = "envelope_version";

/// `major.minor` envelope version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EnvelopeVersion {
    /// Incompatible layout changes.
    pub major: u32,
    /// Layout changes bridged by an upgrade.
    pub minor: u32,
}

impl EnvelopeVersion {
    /// Version from its parts.
    pub const fn new(major: u32, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Version this crate emits, see [`ENVELOPE_VERSION`].
    pub fn current() -> Self {
        ENVELOPE_VERSION.parse().unwrap_or(Self::new(0, 1))
    }
}

impl fmt::Display for EnvelopeVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Error returned when a version string is not `major.minor[.patch]`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid envelope version `{0}`")]
pub struct ParseVersionError(String);

impl FromStr for EnvelopeVersion {
    type Err = ParseVersionError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        let digits = trimmed.strip_prefix(['v', 'V']).unwrap_or(trimmed);
        let parts: Vec<&str> = digits.split('.').collect();
        if !(2..=3).contains(&parts.len()) {
            return Err(ParseVersionError(raw.to_owned()));
        }
        let mut numbers = parts.iter().map(|part| part.parse::<u32>());
        match (numbers.next(), numbers.next(), numbers.next()) {
            (Some(Ok(major)), Some(Ok(minor)), None | Some(Ok(_))) => Ok(Self::new(major, minor)),
            _ => Err(ParseVersionError(raw.to_owned())),
        }
    }
}

/// Rewrites the raw fields of an envelope from one version to the next.
pub type Upgrade = fn(&mut Map<String, JsonValue>);

/// How an envelope version relates to the local one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compatibility {
    /// Same `major.minor`.
    Current,
    /// Older, reachable through these intermediate versions, ending with the
    /// local one.
    Upgradable(Vec<EnvelopeVersion>),
    /// Newer, or older without an upgrade chain.
    Unsupported,
}

/// Local envelope version plus the upgrades accepted for older peers.
#[derive(Clone)]
pub struct VersionPolicy {
    current: EnvelopeVersion,
    upgrades: BTreeMap<EnvelopeVersion, (EnvelopeVersion, Upgrade)>,
}

impl fmt::Debug for VersionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VersionPolicy")
            .field("current", &self.current)
            .field("supported", &self.supported())
            .finish()
    }
}

impl Default for VersionPolicy {
    fn default() -> Self {
        Self::new(EnvelopeVersion::current())
    }
}

impl VersionPolicy {
    /// Policy accepting only `current`.
    pub fn new(current: EnvelopeVersion) -> Self {
        Self {
            current,
            upgrades: BTreeMap::new(),
        }
    }

    /// Accept `from` by running `upgrade`, which yields a `to` envelope.
    /// Upgrades that do not move forward are ignored.
    pub fn with_upgrade(mut self, from: EnvelopeVersion, to: EnvelopeVersion, upgrade: Upgrade) -> Self {
        if to > from {
            self.upgrades.insert(from, (to, upgrade));
        }
        self
    }

    /// Version envelopes are converted to.
    pub fn current(&self) -> EnvelopeVersion {
        self.current
    }

    /// Every accepted version, oldest first.
    pub fn supported(&self) -> Vec<EnvelopeVersion> {
        let mut versions: Vec<EnvelopeVersion> = self
            .upgrades
            .keys()
            .copied()
            .filter(|version| self.compatibility(*version) != Compatibility::Unsupported)
            .collect();
        versions.push(self.current);
        versions.sort();
        versions.dedup();
        versions
    }

    /// Relation of `version` to the local version.
    pub fn compatibility(&self, version: EnvelopeVersion) -> Compatibility {
        if version == self.current {
            return Compatibility::Current;
        }
        let mut path = Vec::new();
        let mut step = version;
        while step < self.current {
            match self.upgrades.get(&step) {
                Some((next, _)) => {
                    path.push(*next);
                    step = *next;
                }
                None => return Compatibility::Unsupported,
            }
        }
        if step == self.current {
            Compatibility::Upgradable(path)
        } else {
            Compatibility::Unsupported
        }
    }

    /// Highest version both this node and a peer offering `peer` accept.
    pub fn negotiate(&self, peer: &[EnvelopeVersion]) -> Option<EnvelopeVersion> {
        let local = self.supported();
        peer.iter()
            .copied()
            .filter(|version| local.contains(version))
            .max()
    }

    /// Check the version field of a raw envelope and bring the fields up to
    /// the local version. A missing version is taken as the local one.
    pub fn apply(&self, fields: &mut Map<String, JsonValue>) -> Result<(), AlignError> {
        let version = match fields.get(VERSION_FIELD) {
            None | Some(JsonValue::Null) => self.current,
            Some(JsonValue::String(raw)) => raw
                .parse::<EnvelopeVersion>()
                .map_err(|_| AlignError::UnsupportedVersion(raw.clone()))?,
            Some(other) => {
                return Err(AlignError::MalformedInput(format!(
                    "field `{}` must be a string, found {}",
                    VERSION_FIELD, other
                )))
            }
        };

        match self.compatibility(version) {
            Compatibility::Current => {}
            Compatibility::Upgradable(_) => {
                let mut step = version;
                while let Some((next, upgrade)) = self.upgrades.get(&step).filter(|_| step < self.current) {
                    upgrade(fields);
                    debug!(from = %step, to = %next, "upgraded envelope");
                    step = *next;
                }
            }
            Compatibility::Unsupported => {
                return Err(AlignError::UnsupportedVersion(version.to_string()));
            }
        }
        fields.insert(
            VERSION_FIELD.to_owned(),
            JsonValue::String(self.current.to_string()),
        );
        Ok(())
    }
}
