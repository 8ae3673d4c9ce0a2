//! `CollaborationMessage` — the universal envelope for hub traffic.
//!
//! ARCHITECTURE
//! ============
//! Every frame crossing the websocket, in either direction, is a
//! `CollaborationMessage` serialized as JSON text. Inbound frames are parsed
//! leniently (clients may omit ids and timestamps) and then stamped with the
//! authenticated sender before any handler sees them.
//!
//! DESIGN
//! ======
//! - `type` is a closed enumeration. Unknown types are a protocol error, never
//!   a panic or a silent drop.
//! - Payloads are flat `Data` maps; typed views are decoded on demand with
//!   `Inbound::payload`.
//! - `timestamp` is milliseconds since the Unix epoch. The per-connection
//!   writer clamps it so it never goes backwards for one client.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// FIELD CONSTANTS
// =============================================================================

/// Data key for human-readable error text.
pub const MSG_MESSAGE: &str = "message";

/// Data key for grepable error codes.
pub const MSG_CODE: &str = "code";

/// Data key for the retryable flag on error messages.
pub const MSG_RETRYABLE: &str = "retryable";

/// Data key pointing an error or acknowledgment at the inbound message id.
pub const MSG_REPLY_TO: &str = "reply_to";

/// Sender id used for messages the hub originates itself.
pub const SYSTEM_USER_ID: &str = "system";

/// Display name used for messages the hub originates itself.
pub const SYSTEM_USERNAME: &str = "System";

// =============================================================================
// TYPES
// =============================================================================

/// Flat key-value payload. Alias to reduce noise in signatures.
pub type Data = HashMap<String, serde_json::Value>;

/// Closed set of message types understood by the hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    TaskCreated,
    TaskUpdated,
    TaskDeleted,
    TaskAssigned,
    UserTyping,
    UserPresence,
    CursorPosition,
    DocumentEdit,
    UserJoined,
    UserLeft,
    RoomJoined,
    RoomLeft,
    Notification,
    Heartbeat,
    Error,
    Acknowledgment,
}

impl MessageType {
    pub const ALL: [MessageType; 16] = [
        MessageType::TaskCreated,
        MessageType::TaskUpdated,
        MessageType::TaskDeleted,
        MessageType::TaskAssigned,
        MessageType::UserTyping,
        MessageType::UserPresence,
        MessageType::CursorPosition,
        MessageType::DocumentEdit,
        MessageType::UserJoined,
        MessageType::UserLeft,
        MessageType::RoomJoined,
        MessageType::RoomLeft,
        MessageType::Notification,
        MessageType::Heartbeat,
        MessageType::Error,
        MessageType::Acknowledgment,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::TaskCreated => "task_created",
            Self::TaskUpdated => "task_updated",
            Self::TaskDeleted => "task_deleted",
            Self::TaskAssigned => "task_assigned",
            Self::UserTyping => "user_typing",
            Self::UserPresence => "user_presence",
            Self::CursorPosition => "cursor_position",
            Self::DocumentEdit => "document_edit",
            Self::UserJoined => "user_joined",
            Self::UserLeft => "user_left",
            Self::RoomJoined => "room_joined",
            Self::RoomLeft => "room_left",
            Self::Notification => "notification",
            Self::Heartbeat => "heartbeat",
            Self::Error => "error",
            Self::Acknowledgment => "acknowledgment",
        }
    }

    /// Parse a wire name. Returns `None` for anything outside the closed set.
    #[must_use]
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == raw)
    }

    /// Entity-mutation notifications announced through the relay.
    #[must_use]
    pub fn is_durable(self) -> bool {
        matches!(self, Self::TaskCreated | Self::TaskUpdated | Self::TaskDeleted | Self::TaskAssigned)
    }

    /// Best-effort signals with an implicit time-to-live.
    #[must_use]
    pub fn is_ephemeral(self) -> bool {
        matches!(self, Self::UserTyping | Self::CursorPosition)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollaborationMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: MessageType,
    #[serde(default)]
    pub data: Data,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room: Option<String>,
    /// Milliseconds since Unix epoch. Set automatically at construction.
    #[serde(default)]
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub requires_ack: bool,
}

// =============================================================================
// ERROR CODES
// =============================================================================

/// Grepable error code and retryable flag for structured error messages.
pub trait ErrorCode: fmt::Display {
    fn error_code(&self) -> &'static str;

    fn retryable(&self) -> bool {
        false
    }
}

/// Malformed or disallowed inbound traffic. Always connection-scoped: the
/// sender gets one `error` message and the connection stays up.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid json: {0}")]
    InvalidJson(String),
    #[error("unknown message type: {0}")]
    UnknownType(String),
    #[error("invalid {kind} payload: {reason}")]
    InvalidPayload { kind: MessageType, reason: String },
    #[error("room required for {0}")]
    RoomRequired(MessageType),
    #[error("not a member of room {0}")]
    NotInRoom(String),
    #[error("invalid room id: {0}")]
    InvalidRoom(&'static str),
    #[error("{0} messages are sent by the server only")]
    ServerOnly(MessageType),
    #[error("binary frames are not supported")]
    BinaryFrame,
}

impl ErrorCode for ProtocolError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidJson(_) => "E_INVALID_JSON",
            Self::UnknownType(_) => "E_UNKNOWN_TYPE",
            Self::InvalidPayload { .. } => "E_INVALID_PAYLOAD",
            Self::RoomRequired(_) => "E_ROOM_REQUIRED",
            Self::NotInRoom(_) => "E_NOT_IN_ROOM",
            Self::InvalidRoom(_) => "E_INVALID_ROOM",
            Self::ServerOnly(_) => "E_SERVER_ONLY",
            Self::BinaryFrame => "E_BINARY_FRAME",
        }
    }
}

/// Trim and check a client-supplied room id.
///
/// # Errors
///
/// `InvalidRoom` when the id is blank, longer than `max_len` characters,
/// or contains control characters.
pub fn validate_room_id(raw: &str, max_len: usize) -> Result<String, ProtocolError> {
    let room = raw.trim();
    if room.is_empty() {
        return Err(ProtocolError::InvalidRoom("room id is blank"));
    }
    if room.chars().count() > max_len {
        return Err(ProtocolError::InvalidRoom("room id is too long"));
    }
    if room.chars().any(char::is_control) {
        return Err(ProtocolError::InvalidRoom("room id contains control characters"));
    }
    Ok(room.to_owned())
}

// =============================================================================
// CONSTRUCTORS
// =============================================================================

/// Current time as milliseconds since Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(dur) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(dur.as_millis()).unwrap_or(0)
}

impl CollaborationMessage {
    /// Create a hub-originated message. Sender defaults to the system identity.
    #[must_use]
    pub fn new(kind: MessageType, data: Data) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            data,
            user_id: SYSTEM_USER_ID.into(),
            username: SYSTEM_USERNAME.into(),
            room: None,
            timestamp: now_ms(),
            requires_ack: false,
        }
    }

    /// Structured error addressed back to the sender of `reply_to`.
    #[must_use]
    pub fn error_from(err: &(impl ErrorCode + ?Sized), reply_to: Option<&str>) -> Self {
        let mut data = Data::new();
        data.insert(MSG_CODE.into(), serde_json::Value::String(err.error_code().to_string()));
        data.insert(MSG_MESSAGE.into(), serde_json::Value::String(err.to_string()));
        data.insert(MSG_RETRYABLE.into(), serde_json::Value::Bool(err.retryable()));
        if let Some(id) = reply_to {
            data.insert(MSG_REPLY_TO.into(), serde_json::Value::String(id.to_owned()));
        }
        Self::new(MessageType::Error, data)
    }

    /// Acknowledge a client message that asked for one.
    #[must_use]
    pub fn acknowledgment(message_id: &str) -> Self {
        Self::new(MessageType::Acknowledgment, Data::new()).with_data("message_id", message_id)
    }
}

// =============================================================================
// BUILDERS
// =============================================================================

impl CollaborationMessage {
    #[must_use]
    pub fn with_sender(mut self, user_id: impl Into<String>, username: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self.username = username.into();
        self
    }

    #[must_use]
    pub fn with_room(mut self, room: impl Into<String>) -> Self {
        self.room = Some(room.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

// =============================================================================
// INBOUND
// =============================================================================

/// Raw shape accepted from clients. `type` stays a string until validated
/// so an unknown type is reported as such rather than as bad JSON.
#[derive(Deserialize)]
struct RawInbound {
    #[serde(default)]
    id: Option<String>,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
    #[serde(default)]
    room: Option<String>,
    #[serde(default)]
    requires_ack: bool,
}

/// A validated inbound message. Sender identity is never taken from the wire.
#[derive(Debug, Clone)]
pub struct Inbound {
    pub id: String,
    pub kind: MessageType,
    pub data: Data,
    pub room: Option<String>,
    pub requires_ack: bool,
}

impl Inbound {
    /// Parse one text frame.
    ///
    /// # Errors
    ///
    /// `InvalidJson` for unparseable text, `UnknownType` for a type outside
    /// the closed set, `InvalidPayload` when `data` is not an object.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawInbound = serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;
        let Some(kind) = MessageType::parse(&raw.kind) else {
            return Err(ProtocolError::UnknownType(raw.kind));
        };
        let data = match raw.data {
            serde_json::Value::Null => Data::new(),
            serde_json::Value::Object(map) => map.into_iter().collect(),
            other => {
                return Err(ProtocolError::InvalidPayload {
                    kind,
                    reason: format!("data must be an object, got {}", json_kind(&other)),
                });
            }
        };
        let room = raw.room.filter(|r| !r.trim().is_empty());
        let id = raw
            .id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(Self { id, kind, data, room, requires_ack: raw.requires_ack })
    }

    /// Decode `data` into a typed payload.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` naming the serde failure.
    pub fn payload<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        let value = serde_json::Value::Object(self.data.clone().into_iter().collect());
        serde_json::from_value(value).map_err(|e| ProtocolError::InvalidPayload { kind: self.kind, reason: e.to_string() })
    }

    /// String field lookup on `data`.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.trim().is_empty())
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

// =============================================================================
// PAYLOADS
// =============================================================================

/// `user_typing` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct TypingPayload {
    pub task_id: String,
    pub is_typing: bool,
}

/// `cursor_position` payload.
#[derive(Debug, Clone, Deserialize)]
pub struct CursorPayload {
    pub task_id: String,
    pub x: f64,
    pub y: f64,
    #[serde(default)]
    pub element: Option<String>,
}

/// `user_presence` payload. Absent activity keeps the previous label.
#[derive(Debug, Clone, Deserialize)]
pub struct PresencePayload {
    pub status: crate::services::presence::PresenceStatus,
    #[serde(default)]
    pub activity: Option<String>,
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
