//! Domain model of the chat layer.

use std::fmt;

use souk_shared::protocol::{ChatPayload, RoomInfoDto, RoomSnapshotDto};

pub use souk_shared::protocol::MessageKind;

/// Sender id used for messages synthesized locally or coerced from raw text
pub const SYSTEM_SENDER_ID: i64 = 0;

/// Opaque chat room identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RoomId(String);

impl RoomId {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RoomId {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Immutable chat message as stored in a room's log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub sender_id: i64,
    pub body: String,
    pub kind: MessageKind,
    /// Unix timestamp (milliseconds)
    pub sent_at: i64,
}

impl ChatMessage {
    /// Synthesize a local `SYSTEM` entry.
    pub fn system(body: impl Into<String>, sent_at: i64) -> Self {
        Self {
            sender_id: SYSTEM_SENDER_ID,
            body: body.into(),
            kind: MessageKind::System,
            sent_at,
        }
    }

    /// Read an inbound frame body.
    ///
    /// Never fails: a body that is not a chat payload becomes a `SYSTEM`
    /// message carrying the raw text. `received_at` stands in for a missing
    /// `sentAt`.
    pub fn from_frame(raw: &str, received_at: i64) -> Self {
        match serde_json::from_str::<ChatPayload>(raw) {
            Ok(payload) => Self::from_payload(payload, received_at),
            Err(e) => {
                tracing::debug!("Inbound frame is not a chat payload ({}), keeping raw text", e);
                Self::system(raw, received_at)
            }
        }
    }

    /// Convert a wire payload, using `fallback_sent_at` when it carries no time.
    pub fn from_payload(payload: ChatPayload, fallback_sent_at: i64) -> Self {
        Self {
            sender_id: payload.sender_id,
            body: payload.body,
            kind: payload.kind,
            sent_at: payload.sent_at.unwrap_or(fallback_sent_at),
        }
    }
}

/// Lifecycle state of the shared broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

/// Lifecycle state of a per-room chat session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initializing,
    SyncingHistory,
    Live,
    Degraded,
    Terminated,
}

/// Room metadata from the chat REST API
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomInfo {
    pub id: RoomId,
    pub title: String,
    pub participants: Vec<i64>,
}

/// Room metadata plus the latest history page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub room_info: RoomInfo,
    pub messages: Vec<ChatMessage>,
}

impl From<RoomSnapshotDto> for RoomSnapshot {
    fn from(dto: RoomSnapshotDto) -> Self {
        Self {
            room_info: dto.room_info.into(),
            // history entries without a timestamp sort as "unknown" (0)
            messages: dto
                .messages
                .into_iter()
                .map(|payload| ChatMessage::from_payload(payload, 0))
                .collect(),
        }
    }
}

impl From<RoomInfoDto> for RoomInfo {
    fn from(dto: RoomInfoDto) -> Self {
        Self {
            id: RoomId::new(dto.id),
            title: dto.title,
            participants: dto.participants,
        }
    }
}

/// An image file to upload before it is posted to a room
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageUpload {
    pub file_name: String,
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// The signed-in user, as seen by the chat layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatIdentity {
    pub user_id: i64,
}
