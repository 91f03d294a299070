//! Per-room chat session.
//!
//! A session drives one room through
//! `Initializing → SyncingHistory → Live ⇄ Degraded → Terminated`:
//!
//! - on open it attaches to the room's inbox, starts the first subscribe
//!   attempt and loads the history page (unless the caller supplied it);
//! - a resubscribe poll retries the subscription while the session is
//!   `SyncingHistory` or `Degraded` and the connection is up;
//! - a status poll recomputes the `connected` flag and moves the session
//!   between `Live` and `Degraded`; a connection the broker closed by
//!   rejecting the credential ends the session with `AuthExpired`.
//!
//! Releasing the room on teardown or drop only touches the registry if no
//! newer session has attached to the same room since.
//!
//! Subscribe attempts run detached from the session so that tearing it down
//! never cancels one mid-flight; every continuation checks whether the session
//! is still running before it touches session state.

use std::{
    sync::{
        Arc, Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use souk_shared::{protocol::ChatPayload, time::Clock};
use tokio::{
    sync::{broadcast, mpsc, watch},
    task::JoinHandle,
    time::{Instant, MissedTickBehavior, interval_at},
};

use crate::{
    api::ChatApi,
    config::ChatConfig,
    connection::ConnectionManager,
    domain::{
        ChatIdentity, ChatMessage, ImageUpload, MessageKind, RoomId, RoomInfo, RoomSnapshot,
        SessionState,
    },
    error::{ChatError, TransportError},
    message_log::MessageLog,
    registry::{InboxToken, RoomSubscriptionRegistry},
};

const UPDATES_CAPACITY: usize = 256;

/// Collaborators shared by every session of an application session
#[derive(Clone)]
pub struct SessionContext {
    pub connection: ConnectionManager,
    pub registry: Arc<RoomSubscriptionRegistry>,
    pub api: Arc<dyn ChatApi>,
    pub clock: Arc<dyn Clock>,
    pub identity: ChatIdentity,
    pub resubscribe_interval: Duration,
    pub status_interval: Duration,
}

impl SessionContext {
    pub fn new(
        config: &ChatConfig,
        connection: ConnectionManager,
        registry: Arc<RoomSubscriptionRegistry>,
        api: Arc<dyn ChatApi>,
        clock: Arc<dyn Clock>,
        identity: ChatIdentity,
    ) -> Self {
        Self {
            connection,
            registry,
            api,
            clock,
            identity,
            resubscribe_interval: config.resubscribe_interval,
            status_interval: config.status_interval,
        }
    }
}

/// Chat session of one room, consumed by a view
pub struct ChatSession {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    room_id: RoomId,
    ctx: SessionContext,
    inbox_token: InboxToken,
    log: Mutex<MessageLog>,
    room_info: OnceLock<RoomInfo>,
    state_tx: watch::Sender<SessionState>,
    connected_tx: watch::Sender<bool>,
    fatal_tx: watch::Sender<Option<ChatError>>,
    updates_tx: broadcast::Sender<ChatMessage>,
    terminated: AtomicBool,
    subscribing: AtomicBool,
    /// Polls and the inbox pump; aborted on halt
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ChatSession {
    /// Open a session, fetching room metadata and history first.
    pub async fn open(ctx: SessionContext, room_id: RoomId) -> Result<Self, ChatError> {
        Self::start(ctx, room_id, None).await
    }

    /// Open a session with room metadata and history already at hand.
    pub async fn open_with_snapshot(
        ctx: SessionContext,
        room_id: RoomId,
        snapshot: RoomSnapshot,
    ) -> Result<Self, ChatError> {
        Self::start(ctx, room_id, Some(snapshot)).await
    }

    async fn start(
        ctx: SessionContext,
        room_id: RoomId,
        snapshot: Option<RoomSnapshot>,
    ) -> Result<Self, ChatError> {
        let (state_tx, _) = watch::channel(SessionState::Initializing);
        let (connected_tx, _) = watch::channel(false);
        let (fatal_tx, _) = watch::channel(None);
        let (updates_tx, _) = broadcast::channel(UPDATES_CAPACITY);

        let (inbox_token, inbox) = ctx.registry.attach(&room_id);
        let session = Self {
            inner: Arc::new(SessionInner {
                room_id,
                ctx,
                inbox_token,
                log: Mutex::new(MessageLog::new()),
                room_info: OnceLock::new(),
                state_tx,
                connected_tx,
                fatal_tx,
                updates_tx,
                terminated: AtomicBool::new(false),
                subscribing: AtomicBool::new(false),
                tasks: Mutex::new(Vec::new()),
            }),
        };
        let inner = &session.inner;
        tracing::info!("Opening chat session for room '{}'", inner.room_id);

        inner.spawn_task(pump(Arc::clone(inner), inbox));
        let first_attempt = if inner.ctx.connection.is_connected() {
            inner.spawn_subscribe()
        } else {
            tracing::info!(
                "Broker not connected yet, room '{}' waits for the resubscribe poll",
                inner.room_id
            );
            None
        };

        let snapshot = match snapshot {
            Some(snapshot) => snapshot,
            None => match inner.ctx.api.fetch_room(&inner.room_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    tracing::warn!("Loading room '{}' failed: {}", inner.room_id, e);
                    session.teardown().await;
                    return Err(e);
                }
            },
        };
        inner.load_history(snapshot);

        if let Some(attempt) = first_attempt {
            // a panicked attempt is left to the resubscribe poll
            let _ = attempt.await;
        }
        if let Some(error) = inner.credential_rejected().await {
            inner.fail(error).await;
        }
        if let Some(error) = session.fatal_error() {
            return Err(error);
        }
        if inner.is_terminated() {
            return Err(ChatError::NotReady);
        }

        inner.refresh_status().await;
        inner.spawn_task(resubscribe_poll(Arc::clone(inner)));
        inner.spawn_task(status_poll(Arc::clone(inner)));
        Ok(session)
    }

    pub fn room_id(&self) -> &RoomId {
        &self.inner.room_id
    }

    /// Room metadata, available once history is loaded.
    pub fn room_info(&self) -> Option<RoomInfo> {
        self.inner.room_info.get().cloned()
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state_tx.subscribe()
    }

    /// Connection AND room subscription live, as of the last status poll.
    pub fn is_connected(&self) -> bool {
        *self.inner.connected_tx.borrow()
    }

    pub fn watch_connected(&self) -> watch::Receiver<bool> {
        self.inner.connected_tx.subscribe()
    }

    /// The error that terminated the session, if it was fatal.
    pub fn fatal_error(&self) -> Option<ChatError> {
        self.inner.fatal_tx.borrow().clone()
    }

    pub fn watch_fatal(&self) -> watch::Receiver<Option<ChatError>> {
        self.inner.fatal_tx.subscribe()
    }

    /// Snapshot of the message log, in log order.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.inner.lock_log().entries().to_vec()
    }

    /// Messages as they are appended to the log.
    pub fn updates(&self) -> broadcast::Receiver<ChatMessage> {
        self.inner.updates_tx.subscribe()
    }

    /// Append a locally synthesized `SYSTEM` message.
    pub fn push_notice(&self, text: impl Into<String>) {
        if self.inner.is_terminated() {
            tracing::debug!("Session of room '{}' is terminated, notice dropped", self.inner.room_id);
            return;
        }
        let notice = ChatMessage::system(text, self.inner.ctx.clock.now_millis());
        self.inner.append(notice);
    }

    /// Publish a text message.
    ///
    /// The message shows up in the log once the broker echoes it back.
    pub async fn send(&self, body: impl Into<String>) -> Result<(), ChatError> {
        self.inner.ensure_ready().await?;
        self.inner
            .publish(MessageKind::Text, body.into())
            .await
            .map_err(|e| match e {
                // subscription dropped between the readiness check and publish
                ChatError::NotSubscribed(_) => ChatError::NotReady,
                other => other,
            })
    }

    /// Upload `image` and publish an `IMAGE` message referencing it.
    ///
    /// A publish failure after a successful upload is reported as
    /// `PublishFailed`; the upload is not rolled back.
    pub async fn send_image(&self, image: ImageUpload) -> Result<(), ChatError> {
        self.inner.ensure_ready().await?;

        let url = self
            .inner
            .ctx
            .api
            .upload_image(&image)
            .await
            .map_err(|e| match e {
                ChatError::AuthExpired(_) | ChatError::UploadFailed(_) => e,
                other => ChatError::UploadFailed(other.to_string()),
            })?;
        tracing::debug!("Image '{}' uploaded, publishing {}", image.file_name, url);

        self.inner
            .publish(MessageKind::Image, url.clone())
            .await
            .map_err(|e| match e {
                ChatError::AuthExpired(_) | ChatError::PublishFailed(_) => e,
                other => ChatError::PublishFailed(format!(
                    "image uploaded to {} but could not be posted: {}",
                    url, other
                )),
            })
    }

    /// Stop both polls and drop the room subscription.
    ///
    /// Idempotent; the shared connection is left untouched.
    pub async fn teardown(&self) {
        if !self.inner.halt() {
            return;
        }
        self.inner.release().await;
        tracing::info!("Chat session for room '{}' terminated", self.inner.room_id);
    }

    /// Tear down, then remove the user from the room's membership.
    pub async fn leave(&self) -> Result<(), ChatError> {
        self.teardown().await;
        self.inner.ctx.api.leave_room(&self.inner.room_id).await
    }
}

impl Drop for ChatSession {
    fn drop(&mut self) {
        if !self.inner.halt() {
            return;
        }
        tracing::debug!(
            "Chat session for room '{}' dropped without teardown",
            self.inner.room_id
        );
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let inner = Arc::clone(&self.inner);
            runtime.spawn(async move { inner.release().await });
        }
    }
}

impl SessionInner {
    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    fn lock_log(&self) -> MutexGuard<'_, MessageLog> {
        match self.log.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        match self.tasks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let handle = tokio::spawn(task);
        let mut tasks = self.lock_tasks();
        if self.is_terminated() {
            handle.abort();
            return;
        }
        tasks.push(handle);
    }

    /// Move to `to` if the current state is one of `from`.
    fn transition(&self, from: &[SessionState], to: SessionState) -> bool {
        self.state_tx.send_if_modified(|state| {
            if from.contains(state) {
                *state = to;
                true
            } else {
                false
            }
        })
    }

    /// Mark terminated and stop every task; `false` if already terminated.
    fn halt(&self) -> bool {
        if self.terminated.swap(true, Ordering::SeqCst) {
            return false;
        }
        for task in self.lock_tasks().drain(..) {
            task.abort();
        }
        self.state_tx.send_replace(SessionState::Terminated);
        self.connected_tx.send_replace(false);
        true
    }

    /// Give the room's subscription and inbox back to the registry.
    async fn release(&self) {
        self.ctx
            .registry
            .release_room(&self.room_id, self.inbox_token)
            .await;
    }

    /// Terminate on a fatal error and expose it to the consumer.
    async fn fail(&self, error: ChatError) {
        if !self.halt() {
            return;
        }
        tracing::error!("Chat session for room '{}' failed: {}", self.room_id, error);
        self.fatal_tx.send_replace(Some(error));
        self.release().await;
    }

    fn append(&self, message: ChatMessage) {
        self.lock_log().append(message.clone());
        // no receivers is fine
        let _ = self.updates_tx.send(message);
    }

    fn load_history(&self, snapshot: RoomSnapshot) {
        if self.is_terminated() {
            return;
        }
        tracing::debug!(
            "Room '{}' history loaded ({} messages)",
            self.room_id,
            snapshot.messages.len()
        );
        let _ = self.room_info.set(snapshot.room_info);
        self.lock_log().merge_history(snapshot.messages);
        self.transition(&[SessionState::Initializing], SessionState::SyncingHistory);
    }

    async fn ensure_ready(&self) -> Result<(), ChatError> {
        let ready = self.state() == SessionState::Live
            && self.ctx.connection.is_connected()
            && self.ctx.registry.is_live(&self.room_id).await;
        if ready { Ok(()) } else { Err(ChatError::NotReady) }
    }

    async fn publish(&self, kind: MessageKind, body: String) -> Result<(), ChatError> {
        let payload = ChatPayload {
            sender_id: self.ctx.identity.user_id,
            body,
            kind,
            sent_at: Some(self.ctx.clock.now_millis()),
        };
        self.ctx.registry.publish(&self.room_id, &payload).await
    }

    /// Start a detached subscribe attempt unless one is already running.
    fn spawn_subscribe(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if self.subscribing.swap(true, Ordering::SeqCst) {
            return None;
        }
        let inner = Arc::clone(self);
        Some(tokio::spawn(async move {
            let result = inner.ctx.registry.subscribe(&inner.room_id).await;
            inner.subscribing.store(false, Ordering::SeqCst);
            inner.on_subscribed(result).await;
        }))
    }

    async fn on_subscribed(&self, result: Result<(), ChatError>) {
        match result {
            Ok(()) if self.is_terminated() => {
                tracing::debug!(
                    "Room '{}' subscribed after teardown, releasing it",
                    self.room_id
                );
                self.release().await;
            }
            Ok(()) => {
                if self.transition(
                    &[SessionState::SyncingHistory, SessionState::Degraded],
                    SessionState::Live,
                ) {
                    tracing::info!("Room '{}' is live", self.room_id);
                }
            }
            Err(e) if e.is_fatal() => self.fail(e).await,
            Err(e) if self.is_terminated() => {
                tracing::debug!("Subscribe of terminated room '{}' ended: {}", self.room_id, e);
            }
            Err(e) => {
                tracing::warn!(
                    "Subscribing to room '{}' failed, retrying on the next poll: {}",
                    self.room_id,
                    e
                );
            }
        }
    }

    /// `AuthExpired` if the connection is down because the broker rejected
    /// the credential.
    async fn credential_rejected(&self) -> Option<ChatError> {
        if self.ctx.connection.is_connected() {
            return None;
        }
        match self.ctx.connection.last_error().await {
            Some(TransportError::AuthRejected(message)) => Some(ChatError::AuthExpired(message)),
            _ => None,
        }
    }

    /// Recompute the `connected` flag and the `Live`/`Degraded` state.
    async fn refresh_status(&self) {
        let live = self.ctx.connection.is_connected()
            && self.ctx.registry.is_live(&self.room_id).await;
        if self.is_terminated() {
            return;
        }

        self.connected_tx.send_if_modified(|connected| {
            let changed = *connected != live;
            *connected = live;
            changed
        });

        if live {
            if self.transition(
                &[SessionState::SyncingHistory, SessionState::Degraded],
                SessionState::Live,
            ) {
                tracing::info!("Room '{}' is live", self.room_id);
            }
        } else if self.transition(&[SessionState::Live], SessionState::Degraded) {
            tracing::warn!("Room '{}' lost its subscription, degraded", self.room_id);
        }
    }
}

/// Move inbound messages of the room into the log.
async fn pump(inner: Arc<SessionInner>, mut inbox: mpsc::UnboundedReceiver<ChatMessage>) {
    while let Some(message) = inbox.recv().await {
        if inner.is_terminated() {
            return;
        }
        inner.append(message);
    }
}

async fn resubscribe_poll(inner: Arc<SessionInner>) {
    let period = inner.ctx.resubscribe_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.is_terminated() {
            return;
        }
        if !matches!(
            inner.state(),
            SessionState::SyncingHistory | SessionState::Degraded
        ) {
            continue;
        }
        if !inner.ctx.connection.is_connected() || inner.ctx.registry.is_live(&inner.room_id).await
        {
            continue;
        }
        tracing::debug!("Resubscribing to room '{}'", inner.room_id);
        let _ = inner.spawn_subscribe();
    }
}

async fn status_poll(inner: Arc<SessionInner>) {
    let period = inner.ctx.status_interval;
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if inner.is_terminated() {
            return;
        }
        if let Some(error) = inner.credential_rejected().await {
            // fail() aborts this task, so it runs detached
            tokio::spawn(async move { inner.fail(error).await });
            return;
        }
        inner.refresh_status().await;
    }
}
