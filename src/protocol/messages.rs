//! Protocol message definitions
//!
//! Everything nodes exchange over a transport. Messages are serialized
//! as JSON with a type discriminator; payload bytes travel base64 encoded.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

use super::ProtocolVersion;
use crate::mesh::Mesh;

// ─────────────────────────────────────────────────────────────────
// Message Envelope
// ─────────────────────────────────────────────────────────────────

/// Wrapper for all protocol messages with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// Unique message ID
    pub id: Uuid,

    /// Message timestamp
    pub timestamp: DateTime<Utc>,

    /// Protocol version
    pub version: ProtocolVersion,

    /// The actual message payload
    #[serde(flatten)]
    pub payload: Message,
}

impl MessageEnvelope {
    /// Create a new message envelope
    pub fn new(payload: Message) -> Self {
        Self::with_version(payload, ProtocolVersion::default())
    }

    /// Create envelope with specific version
    pub fn with_version(payload: Message, version: ProtocolVersion) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            version,
            payload,
        }
    }

    /// Serialize to JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse from JSON string
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ─────────────────────────────────────────────────────────────────
// Message Types (Discriminated Union)
// ─────────────────────────────────────────────────────────────────

/// All protocol messages
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    // ─── Topology (never surfaced to subscribers) ───────────────
    /// A node asks to join the mesh
    JoinRequest(JoinRequest),

    /// Root accepted a join and assigned an upstream
    JoinAck(JoinAck),

    /// Root refused a join
    JoinRejected(JoinRejected),

    /// New mesh snapshot travelling down the tree
    MeshUpdate(MeshUpdate),

    /// Drop notice: the receiver is no longer part of the mesh
    Detached(DetachedNotice),

    // ─── Traffic ────────────────────────────────────────────────
    /// Opaque update fanned out to every node except the originator
    Update(UpdateMessage),

    /// Request for model or updater parameters
    ParamsRequest(ParamsRequest),

    /// Answer to a [`ParamsRequest`], echoing its request id
    ParamsResponse(ParamsResponse),
}

impl Message {
    /// Get the message type name
    pub fn type_name(&self) -> &'static str {
        match self {
            Message::JoinRequest(_) => "JOIN_REQUEST",
            Message::JoinAck(_) => "JOIN_ACK",
            Message::JoinRejected(_) => "JOIN_REJECTED",
            Message::MeshUpdate(_) => "MESH_UPDATE",
            Message::Detached(_) => "DETACHED",
            Message::Update(_) => "UPDATE",
            Message::ParamsRequest(_) => "PARAMS_REQUEST",
            Message::ParamsResponse(_) => "PARAMS_RESPONSE",
        }
    }

    /// Check if this is an internal topology message
    pub fn is_topology(&self) -> bool {
        matches!(
            self,
            Message::JoinRequest(_)
                | Message::JoinAck(_)
                | Message::JoinRejected(_)
                | Message::MeshUpdate(_)
                | Message::Detached(_)
        )
    }

    /// Node the message originates from
    pub fn originator_id(&self) -> &str {
        match self {
            Message::JoinRequest(m) => &m.node_id,
            Message::JoinAck(m) => m.mesh.root_id(),
            Message::JoinRejected(m) => &m.root_id,
            Message::MeshUpdate(m) => m.mesh.root_id(),
            Message::Detached(m) => &m.root_id,
            Message::Update(m) => &m.originator_id,
            Message::ParamsRequest(m) => &m.originator_id,
            Message::ParamsResponse(m) => &m.originator_id,
        }
    }

    /// Request id for request/response traffic
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Message::ParamsRequest(m) => Some(m.request_id),
            Message::ParamsResponse(m) => Some(m.request_id),
            _ => None,
        }
    }
}

// ─────────────────────────────────────────────────────────────────
// Topology Messages
// ─────────────────────────────────────────────────────────────────

/// Join request, forwarded hop by hop until it reaches the root
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRequest {
    /// Joining node
    pub node_id: String,

    /// Session of the joining transport instance
    pub session: Uuid,

    /// Upstream-of-record the request was first sent to
    pub via: String,
}

/// Join acknowledgment sent by the root straight to the joiner
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinAck {
    /// Accepted node
    pub node_id: String,

    /// Upstream assigned by the root
    pub upstream_id: String,

    /// Full mesh snapshot including the new node
    pub mesh: Arc<Mesh>,

    /// Set when the id was previously a member of the mesh
    #[serde(default)]
    pub restart: bool,
}

/// Join refusal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinRejected {
    pub node_id: String,
    pub root_id: String,
    pub reason: String,
}

/// Versioned mesh snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshUpdate {
    pub mesh: Arc<Mesh>,
}

/// Drop notice sent to nodes removed from the mesh
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetachedNotice {
    /// Node that was detached
    pub node_id: String,

    /// Root to rejoin through
    pub root_id: String,

    /// Mesh version that no longer contains the node
    pub mesh_version: u64,

    /// Human-readable cause
    pub reason: String,
}

// ─────────────────────────────────────────────────────────────────
// Traffic Messages
// ─────────────────────────────────────────────────────────────────

/// Update fanned out through the tree
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateMessage {
    /// Unique update id, used for duplicate suppression
    pub update_id: Uuid,

    /// Node that produced the update
    pub originator_id: String,

    /// Opaque update body
    pub payload: Payload,
}

/// Which parameter snapshot a request targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ParamsKind {
    /// Model parameters
    Model,
    /// Optimizer/updater state
    Updater,
}

impl ParamsKind {
    /// Both kinds, in the order a restarted node requests them
    pub const ALL: [ParamsKind; 2] = [ParamsKind::Model, ParamsKind::Updater];
}

impl fmt::Display for ParamsKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParamsKind::Model => write!(f, "MODEL"),
            ParamsKind::Updater => write!(f, "UPDATER"),
        }
    }
}

/// Parameter request sent to the parameter source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsRequest {
    pub kind: ParamsKind,
    pub request_id: Uuid,

    /// Requesting node, receiver of the response
    pub originator_id: String,
}

/// Parameter response sent back to the requester
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParamsResponse {
    pub kind: ParamsKind,

    /// Echo of [`ParamsRequest::request_id`]
    pub request_id: Uuid,

    /// Node that answered
    pub originator_id: String,

    pub payload: Payload,
}

// ─────────────────────────────────────────────────────────────────
// Payload
// ─────────────────────────────────────────────────────────────────

/// Opaque, cheaply clonable byte payload
///
/// The mesh never looks inside. Helpers exist for the common case of a
/// flat little-endian `f32` tensor.
#[derive(Clone, PartialEq, Eq)]
pub struct Payload(Arc<[u8]>);

impl Payload {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(Arc::from(bytes))
    }

    /// Encode values as little-endian `f32`
    pub fn from_f32s(values: &[f32]) -> Self {
        let bytes: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(bytes)
    }

    /// Decode as little-endian `f32`, `None` when the length is not a multiple of 4
    pub fn to_f32s(&self) -> Option<Vec<f32>> {
        if self.0.len() % 4 != 0 {
            return None;
        }
        Some(
            self.0
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        )
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Payload({} bytes)", self.0.len())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(&self.0))
    }
}

impl<'de> Deserialize<'de> for Payload {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64
            .decode(encoded.as_bytes())
            .map(Payload::new)
            .map_err(serde::de::Error::custom)
    }
}

// ─────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────
