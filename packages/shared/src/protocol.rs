//! Wire protocol spoken between the chat client and the broker.
//!
//! Every transport frame is a JSON text frame tagged by `type`. Chat bodies
//! travel as opaque text inside `send` / `message` frames so that a malformed
//! body never breaks frame decoding; the receiving side decides how to read it.

use serde::{Deserialize, Serialize};

/// Prefix of every chat room destination on the broker.
pub const ROOM_DESTINATION_PREFIX: &str = "/topic/chat/rooms/";

/// Broker destination for a chat room.
pub fn room_destination(room_id: &str) -> String {
    format!("{}{}", ROOM_DESTINATION_PREFIX, room_id)
}

/// Extract the room id from a room destination, if it is one.
pub fn room_id_from_destination(destination: &str) -> Option<&str> {
    destination
        .strip_prefix(ROOM_DESTINATION_PREFIX)
        .filter(|room_id| !room_id.is_empty())
}

/// Frames sent from the client to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientFrame {
    /// Session handshake carrying the bearer credential
    Connect {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    /// Start receiving frames published to `destination`
    Subscribe {
        id: String,
        destination: String,
        receipt: String,
    },
    /// Stop a subscription previously opened with `id`
    Unsubscribe { id: String, receipt: String },
    /// Publish `body` to `destination`
    Send {
        destination: String,
        receipt: String,
        body: String,
    },
    /// Graceful goodbye before closing the socket
    Disconnect,
}

/// Frames sent from the broker to the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerFrame {
    /// Handshake accepted
    Connected { session: String },
    /// Acknowledgment of the request that carried `receipt_id`
    Receipt { receipt_id: String },
    /// A frame published on a destination the client subscribed to
    Message {
        subscription: String,
        destination: String,
        body: String,
    },
    /// Failure; rejects the request named by `receipt_id` when present
    Error {
        code: ErrorCode,
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt_id: Option<String>,
    },
}

/// Broker error classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    /// The credential is missing, unknown or revoked
    AuthRejected,
    /// The frame could not be decoded or was out of sequence
    BadFrame,
    /// The destination is not a chat room
    UnknownDestination,
}

/// Kind of a chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    #[default]
    Text,
    Image,
    System,
}

/// JSON body of a chat message as published to a room
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub sender_id: i64,
    pub body: String,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sent_at: Option<i64>,
}

/// Room metadata returned by the room REST endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomInfoDto {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub participants: Vec<i64>,
}

/// Response body of `GET /api/chat/rooms/{room_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSnapshotDto {
    pub room_info: RoomInfoDto,
    #[serde(default)]
    pub messages: Vec<ChatPayload>,
}

/// Response body of `POST /api/uploads`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponseDto {
    pub url: String,
}
