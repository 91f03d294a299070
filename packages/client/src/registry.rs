//! Room subscription registry.
//!
//! Maps room ids to their subscription on the shared connection and keeps at
//! most one live subscription per room. Inbound frames of a room are parsed
//! into [`ChatMessage`]s and queued on the room's inbox, which outlives
//! individual subscriptions so resubscribing never reorders or loses the
//! consumer's stream.
//!
//! Subscribe calls for the same room are serialized by a per-room gate.
//! `unsubscribe` does not wait for that gate: it records the new desired state
//! at once. A subscribe issued before it gives up once it gets the gate, and a
//! subscribe acknowledged afterwards releases what it created instead of
//! resurrecting the room.
//!
//! Each [`attach`](RoomSubscriptionRegistry::attach) hands out an
//! [`InboxToken`]; releasing a room with a token that a later attach replaced
//! leaves the newer owner's inbox and subscription alone.

use std::{
    collections::HashMap,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use souk_shared::{
    protocol::{ChatPayload, ClientFrame, room_destination},
    time::Clock,
};
use tokio::sync::{Mutex, mpsc};

use crate::{
    connection::{ConnectionManager, FrameHandler},
    domain::{ChatMessage, RoomId},
    error::ChatError,
};

type Inboxes = Arc<std::sync::Mutex<HashMap<RoomId, Inbox>>>;

/// Per-room registry of subscriptions on the shared connection
pub struct RoomSubscriptionRegistry {
    connection: ConnectionManager,
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<RoomId, SubscriptionSlot>>,
    inboxes: Inboxes,
    gates: Mutex<HashMap<RoomId, Arc<RoomGate>>>,
    next_generation: AtomicU64,
    next_subscription: AtomicU64,
    next_inbox: AtomicU64,
}

/// Identifies one `attach` of a room's inbox
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboxToken(u64);

/// Serializes subscribe calls of one room
#[derive(Default)]
struct RoomGate {
    op: Mutex<()>,
    /// Bumped by every `unsubscribe` of the room
    unsubscribes: AtomicU64,
}

/// Desired-state record of one room
struct SubscriptionSlot {
    /// Identifies the subscribe call that owns this slot
    generation: u64,
    active: Option<ActiveSubscription>,
}

struct ActiveSubscription {
    id: String,
    epoch: u64,
}

impl SubscriptionSlot {
    fn is_live(&self, current_epoch: u64, connected: bool) -> bool {
        connected
            && self
                .active
                .as_ref()
                .is_some_and(|active| active.epoch == current_epoch)
    }
}

struct Inbox {
    /// `None` until someone attaches
    owner: Option<InboxToken>,
    sender: mpsc::UnboundedSender<ChatMessage>,
    receiver: Option<mpsc::UnboundedReceiver<ChatMessage>>,
}

impl Inbox {
    fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            owner: None,
            sender,
            receiver: Some(receiver),
        }
    }
}

impl RoomSubscriptionRegistry {
    pub fn new(connection: ConnectionManager, clock: Arc<dyn Clock>) -> Self {
        Self {
            connection,
            clock,
            slots: Mutex::new(HashMap::new()),
            inboxes: Arc::new(std::sync::Mutex::new(HashMap::new())),
            gates: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(0),
            next_subscription: AtomicU64::new(0),
            next_inbox: AtomicU64::new(0),
        }
    }

    /// Take the stream of messages of `room_id`.
    ///
    /// Messages that arrived before the first call are kept. A second call
    /// replaces the stream and takes the room over; the previous receiver
    /// gets nothing further.
    pub fn attach(
        &self,
        room_id: &RoomId,
    ) -> (InboxToken, mpsc::UnboundedReceiver<ChatMessage>) {
        let token = InboxToken(self.next_inbox.fetch_add(1, Ordering::SeqCst) + 1);
        let mut inboxes = lock_inboxes(&self.inboxes);
        let inbox = inboxes.entry(room_id.clone()).or_insert_with(Inbox::new);
        inbox.owner = Some(token);
        let receiver = match inbox.receiver.take() {
            Some(receiver) => receiver,
            None => {
                let (sender, receiver) = mpsc::unbounded_channel();
                inbox.sender = sender;
                receiver
            }
        };
        (token, receiver)
    }

    /// Drop the message stream of `room_id` if `token` still owns it.
    pub fn detach(&self, room_id: &RoomId, token: InboxToken) -> bool {
        let mut inboxes = lock_inboxes(&self.inboxes);
        if inboxes
            .get(room_id)
            .is_some_and(|inbox| inbox.owner == Some(token))
        {
            inboxes.remove(room_id);
            true
        } else {
            false
        }
    }

    /// Unsubscribe and detach `room_id` on behalf of the attach `token`.
    ///
    /// No-op when a later attach owns the room.
    pub async fn release_room(&self, room_id: &RoomId, token: InboxToken) {
        if self.attached_elsewhere(room_id, token) {
            tracing::debug!(
                "Room '{}' was attached again, leaving its subscription in place",
                room_id
            );
            return;
        }
        self.unsubscribe(room_id).await;
        self.detach(room_id, token);
    }

    fn attached_elsewhere(&self, room_id: &RoomId, token: InboxToken) -> bool {
        lock_inboxes(&self.inboxes)
            .get(room_id)
            .and_then(|inbox| inbox.owner)
            .is_some_and(|owner| owner != token)
    }

    /// Subscribe to `room_id` on the shared connection.
    ///
    /// Resolves immediately when a live subscription already exists.
    pub async fn subscribe(&self, room_id: &RoomId) -> Result<(), ChatError> {
        let (gate, unsubscribes_seen) = self.gate(room_id).await;
        let _serialized = gate.op.lock().await;
        if gate.unsubscribes.load(Ordering::SeqCst) != unsubscribes_seen {
            tracing::debug!(
                "Room '{}' was unsubscribed while its subscribe was queued",
                room_id
            );
            return Err(ChatError::SubscribeFailed(format!(
                "room '{}' was unsubscribed before the subscription started",
                room_id
            )));
        }

        if !self.connection.is_connected() {
            return Err(ChatError::NotConnected);
        }

        let generation = {
            let mut slots = self.slots.lock().await;
            if slots
                .get(room_id)
                .is_some_and(|slot| slot.is_live(self.connection.epoch(), true))
            {
                tracing::debug!("Room '{}' already subscribed", room_id);
                return Ok(());
            }
            let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
            slots.insert(
                room_id.clone(),
                SubscriptionSlot {
                    generation,
                    active: None,
                },
            );
            generation
        };

        let subscription_id = format!(
            "sub-{}",
            self.next_subscription.fetch_add(1, Ordering::SeqCst) + 1
        );
        let epoch = self
            .connection
            .add_route(&subscription_id, self.frame_handler(room_id))
            .await
            .map_err(ChatError::from_subscribe)?;

        let receipt = self.connection.next_receipt();
        let frame = ClientFrame::Subscribe {
            id: subscription_id.clone(),
            destination: room_destination(room_id.as_str()),
            receipt: receipt.clone(),
        };
        if let Err(e) = self.connection.request(receipt, frame).await {
            self.connection.remove_route(&subscription_id).await;
            tracing::warn!("Subscribing to room '{}' failed: {}", room_id, e);
            return Err(ChatError::from_subscribe(e));
        }

        let mut slots = self.slots.lock().await;
        match slots.get_mut(room_id) {
            Some(slot) if slot.generation == generation => {
                slot.active = Some(ActiveSubscription {
                    id: subscription_id.clone(),
                    epoch,
                });
                tracing::info!(
                    "Subscribed to room '{}' as '{}' (epoch {})",
                    room_id,
                    subscription_id,
                    epoch
                );
                Ok(())
            }
            _ => {
                drop(slots);
                tracing::info!(
                    "Room '{}' was unsubscribed while subscribing, releasing '{}'",
                    room_id,
                    subscription_id
                );
                self.release(&subscription_id).await;
                Err(ChatError::SubscribeFailed(format!(
                    "room '{}' was unsubscribed while the subscription was pending",
                    room_id
                )))
            }
        }
    }

    /// Drop the subscription of `room_id`; no-op if there is none.
    pub async fn unsubscribe(&self, room_id: &RoomId) {
        {
            let mut gates = self.gates.lock().await;
            if let Some(gate) = gates.get(room_id) {
                gate.unsubscribes.fetch_add(1, Ordering::SeqCst);
                if Arc::strong_count(gate) == 1 {
                    gates.remove(room_id);
                }
            }
        }
        let removed = self.slots.lock().await.remove(room_id);

        let Some(active) = removed.and_then(|slot| slot.active) else {
            tracing::debug!("Room '{}' has no subscription to drop", room_id);
            return;
        };
        if active.epoch != self.connection.epoch() || !self.connection.is_connected() {
            // the broker forgot it together with the old connection
            tracing::debug!("Subscription '{}' already gone with its connection", active.id);
            return;
        }

        self.release(&active.id).await;
        tracing::info!("Unsubscribed from room '{}'", room_id);
    }

    /// Publish `payload` to `room_id`; requires a live subscription.
    pub async fn publish(&self, room_id: &RoomId, payload: &ChatPayload) -> Result<(), ChatError> {
        if !self.is_live(room_id).await {
            return Err(ChatError::NotSubscribed(room_id.to_string()));
        }

        let body =
            serde_json::to_string(payload).map_err(|e| ChatError::PublishFailed(e.to_string()))?;
        let receipt = self.connection.next_receipt();
        let frame = ClientFrame::Send {
            destination: room_destination(room_id.as_str()),
            receipt: receipt.clone(),
            body,
        };
        self.connection
            .request(receipt, frame)
            .await
            .map_err(ChatError::from_publish)
    }

    /// `true` while `room_id` has a subscription on the current connection.
    pub async fn is_live(&self, room_id: &RoomId) -> bool {
        let connected = self.connection.is_connected();
        let epoch = self.connection.epoch();
        self.slots
            .lock()
            .await
            .get(room_id)
            .is_some_and(|slot| slot.is_live(epoch, connected))
    }

    /// Rooms with a live subscription, sorted.
    pub async fn live_rooms(&self) -> Vec<RoomId> {
        let connected = self.connection.is_connected();
        let epoch = self.connection.epoch();
        let slots = self.slots.lock().await;
        let mut rooms: Vec<RoomId> = slots
            .iter()
            .filter(|(_, slot)| slot.is_live(epoch, connected))
            .map(|(room_id, _)| room_id.clone())
            .collect();
        rooms.sort();
        rooms
    }

    fn frame_handler(&self, room_id: &RoomId) -> FrameHandler {
        let inboxes = Arc::clone(&self.inboxes);
        let clock = Arc::clone(&self.clock);
        let room_id = room_id.clone();

        Arc::new(move |raw: String| {
            let message = ChatMessage::from_frame(&raw, clock.now_millis());
            let mut inboxes = lock_inboxes(&inboxes);
            let inbox = inboxes.entry(room_id.clone()).or_insert_with(Inbox::new);
            if inbox.sender.send(message).is_err() {
                tracing::debug!("Room '{}' has no reader, message discarded", room_id);
            }
        })
    }

    /// Remove the route and tell the broker to stop the subscription.
    async fn release(&self, subscription_id: &str) {
        self.connection.remove_route(subscription_id).await;

        let receipt = self.connection.next_receipt();
        let frame = ClientFrame::Unsubscribe {
            id: subscription_id.to_string(),
            receipt: receipt.clone(),
        };
        if let Err(e) = self.connection.request(receipt, frame).await {
            tracing::warn!("Releasing subscription '{}' failed: {}", subscription_id, e);
        }
    }

    /// The room's gate and its unsubscribe count as of now.
    async fn gate(&self, room_id: &RoomId) -> (Arc<RoomGate>, u64) {
        let mut gates = self.gates.lock().await;
        let gate = Arc::clone(gates.entry(room_id.clone()).or_default());
        let seen = gate.unsubscribes.load(Ordering::SeqCst);
        (gate, seen)
    }
}

fn lock_inboxes(inboxes: &Inboxes) -> std::sync::MutexGuard<'_, HashMap<RoomId, Inbox>> {
    match inboxes.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
