//! JSON wire protocol for the session relay.
//!
//! Every frame is a WebSocket text frame holding one JSON object with a
//! `kind` discriminant:
//! ```text
//! client → relay                    relay → client
//! ───────────────────────────────   ─────────────────────────────────────────────
//! { kind: "join", sessionId }       { kind: "joined", sessionId, members }
//! { kind: "leave" }                 { kind: "update", sequence,
//! { kind: "change", payload }         originParticipantId, payload, timestamp }
//! { kind: "presence", cursor }      { kind: "presence-update", participantId, cursor }
//! { kind: "ping" }                  { kind: "participant-joined", participantId }
//!                                   { kind: "presence-removed", participantId }
//!                                   { kind: "error", reason }
//!                                   { kind: "pong" }
//! ```
//!
//! Payloads and cursors are opaque JSON values; the relay never inspects them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// Identity of one collaboratively edited document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SessionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Identity of one transport connection. Allocated by the relay, never by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(Uuid);

impl ParticipantId {
    /// Allocate a fresh random identity.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wrap an existing UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Reason carried by an `error` frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorReason {
    AlreadyJoined,
    UnknownSession,
    NotAMember,
    SessionFull,
}

/// Frames sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Bind this connection to a document session.
    #[serde(rename_all = "camelCase")]
    Join { session_id: SessionId },
    /// Leave the bound session (session is implicit).
    Leave,
    /// Edit to relay to the other members.
    Change { payload: Value },
    /// Cursor/selection state, last value wins.
    Presence { cursor: Value },
    /// Application-level heartbeat.
    Ping,
}

impl ClientMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// Frames sent by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ServerMessage {
    #[serde(rename_all = "camelCase")]
    Joined {
        session_id: SessionId,
        members: Vec<ParticipantId>,
    },
    #[serde(rename_all = "camelCase")]
    Update {
        sequence: u64,
        origin_participant_id: ParticipantId,
        payload: Value,
        /// Milliseconds since the Unix epoch. Advisory only.
        timestamp: u64,
    },
    #[serde(rename_all = "camelCase")]
    PresenceUpdate {
        participant_id: ParticipantId,
        cursor: Value,
    },
    #[serde(rename_all = "camelCase")]
    ParticipantJoined { participant_id: ParticipantId },
    #[serde(rename_all = "camelCase")]
    PresenceRemoved { participant_id: ParticipantId },
    Error { reason: ErrorReason },
    Pong,
}

impl ServerMessage {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::SerializationError(e.to_string()))
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::DeserializationError(e.to_string()))
    }
}

/// A sequenced edit, as accepted by the change relay.
#[derive(Debug, Clone, PartialEq)]
pub struct Change {
    pub session_id: SessionId,
    pub origin_participant_id: ParticipantId,
    pub sequence: u64,
    pub payload: Value,
    pub timestamp: u64,
}

impl Change {
    /// The `update` frame fanned out to the other members.
    pub fn to_update(&self) -> ServerMessage {
        ServerMessage::Update {
            sequence: self.sequence,
            origin_participant_id: self.origin_participant_id,
            payload: self.payload.clone(),
            timestamp: self.timestamp,
        }
    }
}

/// Wall-clock milliseconds since the Unix epoch (0 if the clock is before it).
pub fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Protocol errors.
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
}
