//! Shared broker state.

use std::{collections::HashMap, sync::Arc};

use souk_shared::{
    protocol::{ErrorCode, ServerFrame},
    time::{Clock, SystemClock},
};
use tokio::sync::{Mutex, RwLock, mpsc};

use crate::domain::{ConnectionId, RoomStore, TokenPolicy, TopicTable};

/// History entries returned by the room endpoint
pub const HISTORY_PAGE_SIZE: usize = 50;

/// Outbound channel and credential of one connected client
pub struct ClientConnection {
    pub sender: mpsc::UnboundedSender<ServerFrame>,
    pub token: String,
}

/// An uploaded file
#[derive(Debug, Clone)]
pub struct StoredUpload {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

/// Shared application state
pub struct AppState {
    /// Base URL used in upload references (e.g. `http://127.0.0.1:8080`)
    pub public_url: String,
    pub clock: Arc<dyn Clock>,
    pub tokens: RwLock<TokenPolicy>,
    pub topics: Mutex<TopicTable>,
    pub rooms: Mutex<RoomStore>,
    pub connections: Mutex<HashMap<ConnectionId, ClientConnection>>,
    pub uploads: Mutex<HashMap<String, StoredUpload>>,
}

impl AppState {
    /// Create the state; an empty `tokens` list accepts any non-empty token.
    pub fn new(tokens: Vec<String>, public_url: impl Into<String>) -> Self {
        Self {
            public_url: public_url.into().trim_end_matches('/').to_string(),
            clock: Arc::new(SystemClock),
            tokens: RwLock::new(TokenPolicy::new(tokens)),
            topics: Mutex::new(TopicTable::new()),
            rooms: Mutex::new(RoomStore::new()),
            connections: Mutex::new(HashMap::new()),
            uploads: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Seed a room with a title.
    pub async fn create_room(&self, room_id: &str, title: &str) {
        self.rooms.lock().await.insert_room(room_id, title);
    }

    pub async fn is_accepted(&self, token: Option<&str>) -> bool {
        self.tokens.read().await.is_accepted(token)
    }

    /// Revoke `token` and end the sessions that use it.
    ///
    /// Returns the number of sessions notified.
    pub async fn revoke_token(&self, token: &str) -> usize {
        self.tokens.write().await.revoke(token);

        let connections = self.connections.lock().await;
        let mut notified = 0;
        for (connection_id, connection) in connections.iter() {
            if connection.token != token {
                continue;
            }
            let frame = ServerFrame::Error {
                code: ErrorCode::AuthRejected,
                message: "session revoked".to_string(),
                receipt_id: None,
            };
            if connection.sender.send(frame).is_ok() {
                notified += 1;
            }
            tracing::info!("Revoked session of connection {}", connection_id);
        }
        notified
    }
}
