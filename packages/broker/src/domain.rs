//! Broker bookkeeping without I/O: credentials, topic subscriptions and rooms.
//!
//! These are plain data structures so they can be tested in isolation; the
//! `ui` layer wraps them in locks and drives them from the handlers.

use std::collections::{BTreeSet, HashMap, HashSet};

use souk_shared::protocol::{ChatPayload, MessageKind, RoomInfoDto, RoomSnapshotDto};
use uuid::Uuid;

/// Identifier of one WebSocket connection
pub type ConnectionId = Uuid;

/// Which bearer tokens the broker accepts.
#[derive(Debug, Clone, Default)]
pub struct TokenPolicy {
    /// Empty: any non-empty token is accepted
    accepted: HashSet<String>,
    revoked: HashSet<String>,
}

impl TokenPolicy {
    pub fn new(accepted: impl IntoIterator<Item = String>) -> Self {
        Self {
            accepted: accepted.into_iter().collect(),
            revoked: HashSet::new(),
        }
    }

    /// Check if `token` may open a session or make requests.
    pub fn is_accepted(&self, token: Option<&str>) -> bool {
        let Some(token) = token.filter(|token| !token.is_empty()) else {
            return false;
        };
        if self.revoked.contains(token) {
            return false;
        }
        self.accepted.is_empty() || self.accepted.contains(token)
    }

    /// Reject `token` from now on.
    pub fn revoke(&mut self, token: &str) {
        self.revoked.insert(token.to_string());
    }
}

/// Subscriptions of every connection, by subscription id.
#[derive(Debug, Default)]
pub struct TopicTable {
    subscriptions: HashMap<ConnectionId, HashMap<String, String>>,
}

impl TopicTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register subscription `id` of `connection` on `destination`.
    ///
    /// Reusing an id moves the subscription to the new destination.
    pub fn subscribe(&mut self, connection: ConnectionId, id: &str, destination: &str) {
        self.subscriptions
            .entry(connection)
            .or_default()
            .insert(id.to_string(), destination.to_string());
    }

    /// Remove subscription `id`; `false` if it did not exist.
    pub fn unsubscribe(&mut self, connection: ConnectionId, id: &str) -> bool {
        let Some(subscriptions) = self.subscriptions.get_mut(&connection) else {
            return false;
        };
        let removed = subscriptions.remove(id).is_some();
        if subscriptions.is_empty() {
            self.subscriptions.remove(&connection);
        }
        removed
    }

    /// Drop everything `connection` subscribed to.
    pub fn remove_connection(&mut self, connection: ConnectionId) {
        self.subscriptions.remove(&connection);
    }

    /// `(connection, subscription id)` of every subscriber of `destination`.
    pub fn subscribers(&self, destination: &str) -> Vec<(ConnectionId, String)> {
        let mut subscribers: Vec<(ConnectionId, String)> = self
            .subscriptions
            .iter()
            .flat_map(|(connection, subscriptions)| {
                subscriptions
                    .iter()
                    .filter(|(_, subscribed)| subscribed.as_str() == destination)
                    .map(|(id, _)| (*connection, id.clone()))
            })
            .collect();
        // Sort for consistent ordering
        subscribers.sort();
        subscribers
    }
}

/// One chat room kept in memory
#[derive(Debug, Clone)]
pub struct RoomRecord {
    pub title: String,
    pub history: Vec<ChatPayload>,
    /// Tokens of the users that posted to or fetched the room
    pub members: HashSet<String>,
}

/// In-memory rooms, created on first use.
#[derive(Debug, Default)]
pub struct RoomStore {
    rooms: HashMap<String, RoomRecord>,
}

impl RoomStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or rename) a room.
    pub fn insert_room(&mut self, room_id: &str, title: &str) {
        self.room_mut(room_id).title = title.to_string();
    }

    fn room_mut(&mut self, room_id: &str) -> &mut RoomRecord {
        self.rooms
            .entry(room_id.to_string())
            .or_insert_with(|| RoomRecord {
                title: format!("Room {}", room_id),
                history: Vec::new(),
                members: HashSet::new(),
            })
    }

    pub fn get(&self, room_id: &str) -> Option<&RoomRecord> {
        self.rooms.get(room_id)
    }

    /// Record a published message.
    ///
    /// `raw` bodies that are not chat payloads are kept as `SYSTEM` entries;
    /// a missing `sentAt` is stamped with `now`.
    pub fn append(&mut self, room_id: &str, raw: &str, now: i64) {
        let payload = match serde_json::from_str::<ChatPayload>(raw) {
            Ok(mut payload) => {
                payload.sent_at = payload.sent_at.or(Some(now));
                payload
            }
            Err(_) => ChatPayload {
                sender_id: 0,
                body: raw.to_string(),
                kind: MessageKind::System,
                sent_at: Some(now),
            },
        };
        self.room_mut(room_id).history.push(payload);
    }

    /// Add `member` to the room.
    pub fn join(&mut self, room_id: &str, member: &str) {
        self.room_mut(room_id).members.insert(member.to_string());
    }

    /// Remove `member`; `false` if the room does not exist.
    pub fn leave(&mut self, room_id: &str, member: &str) -> bool {
        match self.rooms.get_mut(room_id) {
            Some(room) => {
                room.members.remove(member);
                true
            }
            None => false,
        }
    }

    /// Metadata plus the latest `limit` history entries.
    ///
    /// Participants are the distinct non-system senders of the history.
    pub fn snapshot(&mut self, room_id: &str, limit: usize) -> RoomSnapshotDto {
        let room = self.room_mut(room_id);
        let participants: BTreeSet<i64> = room
            .history
            .iter()
            .filter(|payload| payload.kind != MessageKind::System)
            .map(|payload| payload.sender_id)
            .collect();
        let skip = room.history.len().saturating_sub(limit);

        RoomSnapshotDto {
            room_info: RoomInfoDto {
                id: room_id.to_string(),
                title: room.title.clone(),
                participants: participants.into_iter().collect(),
            },
            messages: room.history[skip..].to_vec(),
        }
    }
}
