//! Chat facade tying the shared connection to the per-room sessions.
//!
//! One [`ChatClient`] lives for an application session: `start()` after login,
//! `shutdown()` on logout. Views enter and leave rooms through it; at most one
//! [`ChatSession`] is open per room.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use souk_shared::time::{Clock, SystemClock};
use tokio::{sync::Mutex, task::JoinHandle};

use crate::{
    api::{ChatApi, HttpChatApi},
    config::ChatConfig,
    connection::ConnectionManager,
    credentials::CredentialSource,
    domain::{ChatIdentity, RoomId, RoomSnapshot, SessionState},
    error::ChatError,
    reconnect::should_exit_immediately,
    registry::RoomSubscriptionRegistry,
    session::{ChatSession, SessionContext},
    transport::{Transport, WebSocketTransport},
};

/// Entry point of the chat layer for one logged-in user
pub struct ChatClient {
    config: ChatConfig,
    connection: ConnectionManager,
    registry: Arc<RoomSubscriptionRegistry>,
    api: Arc<dyn ChatApi>,
    clock: Arc<dyn Clock>,
    identity: ChatIdentity,
    sessions: StdMutex<HashMap<RoomId, SessionSlot>>,
    supervisor: StdMutex<Option<JoinHandle<()>>>,
}

/// A room's open session; locked while the room is being entered or left
type SessionSlot = Arc<Mutex<Option<Arc<ChatSession>>>>;

impl ChatClient {
    pub fn new(
        config: ChatConfig,
        transport: Arc<dyn Transport>,
        api: Arc<dyn ChatApi>,
        credentials: Arc<dyn CredentialSource>,
        identity: ChatIdentity,
    ) -> Self {
        let connection = ConnectionManager::new(&config, transport, credentials);
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let registry = Arc::new(RoomSubscriptionRegistry::new(
            connection.clone(),
            Arc::clone(&clock),
        ));
        Self {
            config,
            connection,
            registry,
            api,
            clock,
            identity,
            sessions: StdMutex::new(HashMap::new()),
            supervisor: StdMutex::new(None),
        }
    }

    /// Client over a WebSocket broker and the HTTP chat API of `config`.
    pub fn over_websocket(
        config: ChatConfig,
        credentials: Arc<dyn CredentialSource>,
        identity: ChatIdentity,
    ) -> Self {
        let api = Arc::new(HttpChatApi::new(
            config.api_base_url.clone(),
            Arc::clone(&credentials),
        ));
        Self::new(
            config,
            Arc::new(WebSocketTransport),
            api,
            credentials,
            identity,
        )
    }

    /// Replace the clock used to timestamp outgoing and local messages.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.registry = Arc::new(RoomSubscriptionRegistry::new(
            self.connection.clone(),
            Arc::clone(&clock),
        ));
        self.clock = clock;
        self
    }

    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    pub fn identity(&self) -> ChatIdentity {
        self.identity
    }

    /// Connect to the broker and keep reconnecting in the background.
    ///
    /// A rejected credential is returned as `AuthExpired`; any other failure
    /// is left to the reconnect supervisor.
    pub async fn start(&self) -> Result<(), ChatError> {
        match self.connection.connect().await {
            Ok(()) => {}
            Err(e) if should_exit_immediately(&e) => {
                tracing::error!("Broker rejected the credential: {}", e);
                return Err(e.into());
            }
            Err(e) => tracing::warn!("Initial connect failed, retrying in background: {}", e),
        }

        let mut supervisor = lock(&self.supervisor);
        if supervisor.is_none() {
            *supervisor = Some(
                self.connection
                    .spawn_supervisor(self.config.reconnect.clone()),
            );
        }
        Ok(())
    }

    /// Open the room, or return its session if it is already open.
    pub async fn enter_room(&self, room_id: &RoomId) -> Result<Arc<ChatSession>, ChatError> {
        self.enter(room_id, None).await
    }

    /// Open the room with metadata and history the caller already has.
    pub async fn enter_room_with(
        &self,
        room_id: &RoomId,
        snapshot: RoomSnapshot,
    ) -> Result<Arc<ChatSession>, ChatError> {
        self.enter(room_id, Some(snapshot)).await
    }

    async fn enter(
        &self,
        room_id: &RoomId,
        snapshot: Option<RoomSnapshot>,
    ) -> Result<Arc<ChatSession>, ChatError> {
        let slot = self.slot(room_id);
        let mut current = slot.lock().await;
        if let Some(session) = current.as_ref() {
            if session.state() != SessionState::Terminated {
                tracing::debug!("Room '{}' already open", room_id);
                return Ok(Arc::clone(session));
            }
            tracing::debug!("Replacing terminated session of room '{}'", room_id);
        }
        if let Some(stale) = current.take() {
            stale.teardown().await;
        }

        let ctx = self.session_context();
        let opened = match snapshot {
            Some(snapshot) => ChatSession::open_with_snapshot(ctx, room_id.clone(), snapshot).await,
            None => ChatSession::open(ctx, room_id.clone()).await,
        };
        let session = match opened {
            Ok(session) => Arc::new(session),
            Err(e) => {
                drop(current);
                self.prune(room_id, &slot);
                return Err(e);
            }
        };
        *current = Some(Arc::clone(&session));
        Ok(session)
    }

    /// The open session of `room_id`, if any.
    ///
    /// Waits while the room is being entered or left.
    pub async fn session(&self, room_id: &RoomId) -> Option<Arc<ChatSession>> {
        let slot = lock(&self.sessions).get(room_id).cloned()?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Navigate away from the room: tear its session down, keep membership.
    pub async fn close_room(&self, room_id: &RoomId) {
        match self.take_session(room_id).await {
            Some(session) => session.teardown().await,
            None => tracing::debug!("Room '{}' is not open", room_id),
        }
    }

    /// Leave the room: tear its session down, then drop the membership.
    pub async fn leave_room(&self, room_id: &RoomId) -> Result<(), ChatError> {
        match self.take_session(room_id).await {
            Some(session) => session.leave().await,
            None => {
                // no session open here, but the membership may still exist
                self.registry.unsubscribe(room_id).await;
                self.api.leave_room(room_id).await
            }
        }
    }

    /// Tear down every session, stop reconnecting and disconnect.
    pub async fn shutdown(&self) {
        if let Some(supervisor) = lock(&self.supervisor).take() {
            supervisor.abort();
        }

        let slots: Vec<_> = lock(&self.sessions).drain().collect();
        for (room_id, slot) in slots {
            if let Some(session) = slot.lock().await.take() {
                tracing::debug!("Closing room '{}' on shutdown", room_id);
                session.teardown().await;
            }
        }

        self.connection.disconnect().await;
        tracing::info!("Chat client shut down");
    }

    fn slot(&self, room_id: &RoomId) -> SessionSlot {
        Arc::clone(lock(&self.sessions).entry(room_id.clone()).or_default())
    }

    /// Remove the room's session and its slot.
    async fn take_session(&self, room_id: &RoomId) -> Option<Arc<ChatSession>> {
        let slot = lock(&self.sessions).get(room_id).cloned()?;
        let session = slot.lock().await.take();
        self.prune(room_id, &slot);
        session
    }

    /// Forget `slot` if it is empty and nobody else is using it.
    fn prune(&self, room_id: &RoomId, slot: &SessionSlot) {
        let mut sessions = lock(&self.sessions);
        let unused = sessions.get(room_id).is_some_and(|entry| {
            Arc::ptr_eq(entry, slot)
                && Arc::strong_count(entry) == 2
                && entry.try_lock().is_ok_and(|current| current.is_none())
        });
        if unused {
            sessions.remove(room_id);
        }
    }

    fn session_context(&self) -> SessionContext {
        SessionContext::new(
            &self.config,
            self.connection.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.api),
            Arc::clone(&self.clock),
            self.identity,
        )
    }
}

fn lock<T>(mutex: &StdMutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        api::MockChatApi,
        credentials::StaticCredentials,
        domain::{ChatMessage, ConnectionState, RoomInfo},
        testing::{ConnectBehavior, FakeBroker, SubscribeBehavior, TEST_NOW, settle},
    };
    use souk_shared::time::FixedClock;

    fn snapshot(room_id: &RoomId) -> RoomSnapshot {
        RoomSnapshot {
            room_info: RoomInfo {
                id: room_id.clone(),
                title: "Bicycle".to_string(),
                participants: vec![7],
            },
            messages: vec![ChatMessage::system("room created", 1)],
        }
    }

    fn client(broker: &FakeBroker, api: MockChatApi) -> ChatClient {
        ChatClient::new(
            ChatConfig::default(),
            Arc::new(broker.clone()),
            Arc::new(api),
            Arc::new(StaticCredentials::new("token-7")),
            ChatIdentity { user_id: 7 },
        )
        .with_clock(Arc::new(FixedClock::new(TEST_NOW)))
    }

    fn fetching_api(expected_fetches: usize) -> MockChatApi {
        let mut api = MockChatApi::new();
        api.expect_fetch_room()
            .times(expected_fetches)
            .returning(|room_id| Ok(snapshot(room_id)));
        api
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_with_rejected_credential() {
        // テスト項目: 認証拒否で start すると AuthExpired を返し、再接続しない
        // given (前提条件):
        let broker = FakeBroker::new();
        broker.set_connect(ConnectBehavior::RejectAuth);
        let client = client(&broker, MockChatApi::new());

        // when (操作):
        let result = client.start().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        // then (期待する結果):
        assert!(matches!(result, Err(ChatError::AuthExpired(_))));
        assert_eq!(broker.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_retries_refused_connection_in_background() {
        // テスト項目: 接続拒否はバックグラウンドの再接続に任される
        // given (前提条件):
        let broker = FakeBroker::new();
        broker.set_connect(ConnectBehavior::Refuse);
        let client = client(&broker, MockChatApi::new());

        // when (操作):
        let result = client.start().await;
        broker.set_connect(ConnectBehavior::Accept);
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(broker.open_count(), 2);
        assert_eq!(client.connection().state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_room_is_idempotent() {
        // テスト項目: 同じルームに2回入っても同じセッションが返り、履歴取得は1回だけ
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = client(&broker, fetching_api(1));
        client.start().await.unwrap();
        let room_id = RoomId::new("room-1");

        // when (操作):
        let first = client.enter_room(&room_id).await.unwrap();
        let second = client.enter_room(&room_id).await.unwrap();

        // then (期待する結果):
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.state(), SessionState::Live);
        assert_eq!(broker.subscription_count("room-1"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enter_room_with_snapshot() {
        // テスト項目: スナップショット付きで入室すると REST を呼ばずに履歴が表示される
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = client(&broker, MockChatApi::new());
        client.start().await.unwrap();
        let room_id = RoomId::new("room-1");

        // when (操作):
        let session = client
            .enter_room_with(&room_id, snapshot(&room_id))
            .await
            .unwrap();

        // then (期待する結果):
        assert_eq!(session.messages().len(), 1);
        assert_eq!(session.room_info().unwrap().title, "Bicycle");
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_room_then_reenter_opens_new_session() {
        // テスト項目: close_room 後に再入室すると新しいセッションが開かれる
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = client(&broker, fetching_api(2));
        client.start().await.unwrap();
        let room_id = RoomId::new("room-1");
        let first = client.enter_room(&room_id).await.unwrap();

        // when (操作):
        client.close_room(&room_id).await;
        let second = client.enter_room(&room_id).await.unwrap();

        // then (期待する結果):
        assert_eq!(first.state(), SessionState::Terminated);
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.state(), SessionState::Live);
        assert_eq!(broker.subscription_count("room-1"), 1);
        assert!(client.connection().is_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_rooms_are_not_blocked_while_entering() {
        // テスト項目: あるルームの入室が購読応答待ちでも、別ルームの操作は待たされない
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = Arc::new(client(&broker, fetching_api(1)));
        client.start().await.unwrap();
        broker.set_subscribe(SubscribeBehavior::Hold);
        let room_a = RoomId::new("room-a");
        let room_b = RoomId::new("room-b");
        let entering = {
            let client = Arc::clone(&client);
            let room_a = room_a.clone();
            tokio::spawn(async move { client.enter_room(&room_a).await })
        };
        settle().await;

        // when (操作):
        let closed = tokio::time::timeout(Duration::from_secs(1), client.close_room(&room_b)).await;
        let other = tokio::time::timeout(Duration::from_secs(1), client.session(&room_b)).await;
        let pending = tokio::time::timeout(Duration::from_secs(1), client.session(&room_a)).await;
        broker.release_held_subscribes();
        let entered = entering.await.unwrap();

        // then (期待する結果):
        assert!(closed.is_ok());
        assert!(matches!(other, Ok(None)));
        assert!(pending.is_err());
        assert_eq!(entered.unwrap().state(), SessionState::Live);
        assert!(client.session(&room_a).await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_room_without_session_calls_api() {
        // テスト項目: セッションがなくても leave_room は退室 API を呼ぶ
        // given (前提条件):
        let broker = FakeBroker::new();
        let mut api = MockChatApi::new();
        api.expect_leave_room().times(1).returning(|_| Ok(()));
        let client = client(&broker, api);
        client.start().await.unwrap();

        // when (操作):
        let result = client.leave_room(&RoomId::new("room-9")).await;

        // then (期待する結果):
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_room_closes_session() {
        // テスト項目: leave_room でセッションが終了し、退室 API が呼ばれる
        // given (前提条件):
        let broker = FakeBroker::new();
        let mut api = fetching_api(1);
        api.expect_leave_room().times(1).returning(|_| Ok(()));
        let client = client(&broker, api);
        client.start().await.unwrap();
        let room_id = RoomId::new("room-1");
        let session = client.enter_room(&room_id).await.unwrap();

        // when (操作):
        let result = client.leave_room(&room_id).await;

        // then (期待する結果):
        assert!(result.is_ok());
        assert_eq!(session.state(), SessionState::Terminated);
        assert!(client.session(&room_id).await.is_none());
        assert_eq!(broker.subscription_count("room-1"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_recover_after_connection_drop() {
        // テスト項目: 接続が切れても再接続と再購読でセッションが LIVE に戻る
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = client(&broker, fetching_api(2));
        client.start().await.unwrap();
        let room_a = client.enter_room(&RoomId::new("room-a")).await.unwrap();
        let room_b = client.enter_room(&RoomId::new("room-b")).await.unwrap();

        // when (操作):
        broker.drop_connection();
        settle().await;
        tokio::time::advance(Duration::from_secs(1)).await;
        settle().await;
        let degraded = (room_a.state(), room_b.state());
        tokio::time::advance(Duration::from_secs(5)).await;
        settle().await;

        // then (期待する結果):
        assert_eq!(degraded, (SessionState::Degraded, SessionState::Degraded));
        assert_eq!(broker.open_count(), 2);
        assert_eq!(room_a.state(), SessionState::Live);
        assert_eq!(room_b.state(), SessionState::Live);
        assert_eq!(broker.subscription_count("room-a"), 1);
        assert_eq!(broker.subscription_count("room-b"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_closes_everything() {
        // テスト項目: shutdown で全セッションが終了し、接続が切断され、再接続もしない
        // given (前提条件):
        let broker = FakeBroker::new();
        let client = client(&broker, fetching_api(1));
        client.start().await.unwrap();
        let session = client.enter_room(&RoomId::new("room-1")).await.unwrap();

        // when (操作):
        client.shutdown().await;
        tokio::time::advance(Duration::from_secs(60)).await;
        settle().await;

        // then (期待する結果):
        assert_eq!(session.state(), SessionState::Terminated);
        assert_eq!(client.connection().state(), ConnectionState::Disconnected);
        assert_eq!(broker.open_count(), 1);
    }
}
