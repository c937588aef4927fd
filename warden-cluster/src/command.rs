//! Command protocol: everything that goes through the replicated log.
//!
//! A [`Command`] is an envelope `{kind, namespace, payload, compressed}`.
//! `kind` selects the payload schema. Payloads at or above the configured
//! compression size are zstd-compressed before they enter the envelope.
//!
//! Two error families live here:
//!
//! - [`CommandError`] is a request-level failure. It is replicated inside
//!   the response and never stops the state machine.
//! - [`ProtocolError`] means a log entry cannot be understood at all. The
//!   state machine treats it as fatal and halts.

use crate::types::{NodeId, RaftRequest};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;
use warden_core::PolicyError;

/// zstd level used for command payloads.
const ZSTD_LEVEL: i32 = 3;

/// Closed set of command kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    /// Create an empty enforcer for a new namespace.
    CreateNamespace,
    /// Replace a namespace's model with one parsed from text.
    SetModel,
    /// Append rules.
    AddPolicies,
    /// Replace one rule.
    UpdatePolicy,
    /// Replace several rules at once.
    UpdatePolicies,
    /// Remove rules.
    RemovePolicies,
    /// Remove rules matching a field filter.
    RemoveFilteredPolicy,
    /// Empty every rule section.
    ClearPolicy,
    /// Evaluate a request against the current model.
    Enforce,
    /// Merge key/value metadata for a node.
    MetadataSet,
    /// Drop all metadata of a node.
    MetadataDelete,
}

impl CommandKind {
    /// Get a human-readable name for this command kind.
    pub fn name(&self) -> &'static str {
        match self {
            CommandKind::CreateNamespace => "CreateNamespace",
            CommandKind::SetModel => "SetModel",
            CommandKind::AddPolicies => "AddPolicies",
            CommandKind::UpdatePolicy => "UpdatePolicy",
            CommandKind::UpdatePolicies => "UpdatePolicies",
            CommandKind::RemovePolicies => "RemovePolicies",
            CommandKind::RemoveFilteredPolicy => "RemoveFilteredPolicy",
            CommandKind::ClearPolicy => "ClearPolicy",
            CommandKind::Enforce => "Enforce",
            CommandKind::MetadataSet => "MetadataSet",
            CommandKind::MetadataDelete => "MetadataDelete",
        }
    }

    /// Whether the command addresses a namespace rather than cluster metadata.
    pub fn is_namespaced(&self) -> bool {
        !matches!(self, CommandKind::MetadataSet | CommandKind::MetadataDelete)
    }
}

/// Command envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    /// Payload schema selector.
    pub kind: CommandKind,
    /// Target namespace; empty for metadata commands.
    #[serde(default)]
    pub namespace: String,
    /// Encoded payload; empty for kinds without one.
    #[serde(default)]
    pub payload: Vec<u8>,
    /// Whether `payload` is zstd-compressed.
    #[serde(default)]
    pub compressed: bool,
}

/// Payload of [`CommandKind::SetModel`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetModelPayload {
    /// Model definition text.
    pub text: String,
}

/// Payload of [`CommandKind::AddPolicies`] and [`CommandKind::RemovePolicies`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoliciesPayload {
    /// Section key (`p` or `g`).
    pub sec: String,
    /// Rule type within the section (`p`, `g2`, ...).
    pub ptype: String,
    /// Rule rows.
    pub rules: Vec<Vec<String>>,
}

/// Payload of [`CommandKind::UpdatePolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePolicyPayload {
    /// Section key.
    pub sec: String,
    /// Rule type.
    pub ptype: String,
    /// Rule to replace.
    pub old_rule: Vec<String>,
    /// Replacement rule.
    pub new_rule: Vec<String>,
}

/// Payload of [`CommandKind::UpdatePolicies`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdatePoliciesPayload {
    /// Section key.
    pub sec: String,
    /// Rule type.
    pub ptype: String,
    /// Rules to replace, pairwise with `new_rules`.
    pub old_rules: Vec<Vec<String>>,
    /// Replacement rules.
    pub new_rules: Vec<Vec<String>>,
}

/// Payload of [`CommandKind::RemoveFilteredPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoveFilteredPolicyPayload {
    /// Section key.
    pub sec: String,
    /// Rule type.
    pub ptype: String,
    /// First field the filter applies to.
    pub field_index: usize,
    /// Values for fields `field_index..`; empty strings match anything.
    pub field_values: Vec<String>,
}

/// Read consistency requested for an evaluation.
///
/// Carried for API compatibility: evaluation always goes through the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadConsistency {
    /// Any replica's state is acceptable.
    None,
    /// Leader's state is acceptable.
    Weak,
    /// State must reflect every committed entry.
    #[default]
    Strong,
}

/// Payload of [`CommandKind::Enforce`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnforcePayload {
    /// Request values, each JSON-encoded by the caller.
    pub params: Vec<Vec<u8>>,
    /// Requested consistency.
    #[serde(default)]
    pub level: ReadConsistency,
    /// Maximum acceptable staleness in milliseconds.
    #[serde(default)]
    pub freshness_ms: u64,
}

/// Payload of [`CommandKind::MetadataSet`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataSetPayload {
    /// Node the metadata describes.
    pub node_id: NodeId,
    /// Keys to merge.
    pub data: BTreeMap<String, String>,
}

/// Payload of [`CommandKind::MetadataDelete`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataDeletePayload {
    /// Node whose metadata is dropped.
    pub node_id: NodeId,
}

/// Request-level failure reported back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandError {
    /// Create was issued for a namespace that already exists.
    #[error("namespace already exists")]
    NamespaceExists,

    /// The command referenced a namespace that was never created.
    #[error("namespace does not exist")]
    NamespaceNotExist,

    /// Caller-supplied request values could not be decoded.
    #[error("malformed payload: {0}")]
    MalformedPayload(String),

    /// The policy engine rejected the operation.
    #[error("engine error: {0}")]
    Engine(String),
}

impl From<PolicyError> for CommandError {
    fn from(e: PolicyError) -> Self {
        CommandError::Engine(e.to_string())
    }
}

/// A log entry or payload that cannot be decoded.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// The envelope itself is not a valid command.
    #[error("undecodable command envelope: {0}")]
    Envelope(#[source] serde_json::Error),

    /// The payload does not match the schema of its kind.
    #[error("undecodable {} payload: {source}", .kind.name())]
    Payload {
        /// Kind named by the envelope.
        kind: CommandKind,
        /// Decoder error.
        source: serde_json::Error,
    },

    /// The payload is flagged compressed but does not decompress.
    #[error("failed to decompress {} payload: {source}", .kind.name())]
    Decompress {
        /// Kind named by the envelope.
        kind: CommandKind,
        /// Decompressor error.
        source: std::io::Error,
    },

    /// A command could not be encoded.
    #[error("failed to encode command: {0}")]
    Encode(#[source] serde_json::Error),

    /// A payload could not be compressed.
    #[error("failed to compress payload: {0}")]
    Compress(#[source] std::io::Error),
}

impl Command {
    /// Build a command without a payload.
    pub fn bare(kind: CommandKind, namespace: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: namespace.into(),
            payload: Vec::new(),
            compressed: false,
        }
    }

    /// Build a command, compressing the encoded payload once it reaches
    /// `compression_size` bytes. A size of zero disables compression.
    pub fn with_payload<P: Serialize>(
        kind: CommandKind,
        namespace: impl Into<String>,
        payload: &P,
        compression_size: usize,
    ) -> Result<Self, ProtocolError> {
        let encoded = serde_json::to_vec(payload).map_err(ProtocolError::Encode)?;
        let compress = compression_size > 0 && encoded.len() >= compression_size;
        let payload = if compress {
            zstd::stream::encode_all(encoded.as_slice(), ZSTD_LEVEL)
                .map_err(ProtocolError::Compress)?
        } else {
            encoded
        };

        Ok(Self {
            kind,
            namespace: namespace.into(),
            payload,
            compressed: compress,
        })
    }

    /// Build a metadata merge for `node_id`.
    pub fn metadata_set(
        node_id: NodeId,
        data: BTreeMap<String, String>,
        compression_size: usize,
    ) -> Result<Self, ProtocolError> {
        Self::with_payload(
            CommandKind::MetadataSet,
            "",
            &MetadataSetPayload { node_id, data },
            compression_size,
        )
    }

    /// Build a metadata delete for `node_id`.
    pub fn metadata_delete(node_id: NodeId) -> Result<Self, ProtocolError> {
        Self::with_payload(
            CommandKind::MetadataDelete,
            "",
            &MetadataDeletePayload { node_id },
            0,
        )
    }

    /// Decode the payload as `P`, decompressing first if needed.
    pub fn decode_payload<P: DeserializeOwned>(&self) -> Result<P, ProtocolError> {
        let decompressed;
        let bytes = if self.compressed {
            decompressed = zstd::stream::decode_all(self.payload.as_slice()).map_err(|source| {
                ProtocolError::Decompress {
                    kind: self.kind,
                    source,
                }
            })?;
            decompressed.as_slice()
        } else {
            self.payload.as_slice()
        };

        serde_json::from_slice(bytes).map_err(|source| ProtocolError::Payload {
            kind: self.kind,
            source,
        })
    }

    /// Check that the payload matches the schema of `kind`.
    ///
    /// Commands arriving from outside the cluster are validated before they
    /// are proposed, so a bad payload is rejected instead of halting every
    /// replica that applies it.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        match self.kind {
            CommandKind::CreateNamespace | CommandKind::ClearPolicy => Ok(()),
            CommandKind::SetModel => self.decode_payload::<SetModelPayload>().map(drop),
            CommandKind::AddPolicies | CommandKind::RemovePolicies => {
                self.decode_payload::<PoliciesPayload>().map(drop)
            }
            CommandKind::UpdatePolicy => self.decode_payload::<UpdatePolicyPayload>().map(drop),
            CommandKind::UpdatePolicies => {
                self.decode_payload::<UpdatePoliciesPayload>().map(drop)
            }
            CommandKind::RemoveFilteredPolicy => {
                self.decode_payload::<RemoveFilteredPolicyPayload>().map(drop)
            }
            CommandKind::Enforce => self.decode_payload::<EnforcePayload>().map(drop),
            CommandKind::MetadataSet => self.decode_payload::<MetadataSetPayload>().map(drop),
            CommandKind::MetadataDelete => {
                self.decode_payload::<MetadataDeletePayload>().map(drop)
            }
        }
    }

    /// Encode the envelope for the log.
    pub fn encode(&self) -> Result<RaftRequest, ProtocolError> {
        serde_json::to_vec(self)
            .map(RaftRequest)
            .map_err(ProtocolError::Encode)
    }

    /// Decode an envelope from a log entry.
    pub fn decode(request: &RaftRequest) -> Result<Self, ProtocolError> {
        serde_json::from_slice(&request.0).map_err(ProtocolError::Envelope)
    }
}
