//! Test doubles: an in-memory transport with a scriptable broker behind it.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use async_trait::async_trait;
use souk_shared::{
    protocol::{ClientFrame, ErrorCode, ServerFrame, room_destination},
    time::FixedClock,
};
use tokio::sync::mpsc;

use crate::{
    config::ChatConfig,
    connection::ConnectionManager,
    credentials::StaticCredentials,
    error::TransportError,
    registry::RoomSubscriptionRegistry,
    transport::{Link, Transport},
};

/// Fixed "now" used by test clocks
pub(crate) const TEST_NOW: i64 = 1_700_000_000_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum ConnectBehavior {
    #[default]
    Accept,
    RejectAuth,
    Refuse,
    Hang,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum SubscribeBehavior {
    #[default]
    Ack,
    /// Keep the request until `release_held_subscribes`
    Hold,
    Reject,
    RejectAuth,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub(crate) enum PublishBehavior {
    #[default]
    AckAndEcho,
    Reject,
}

struct FakeConnection {
    id: u64,
    to_client: mpsc::UnboundedSender<ServerFrame>,
    /// subscription id -> destination
    subscriptions: HashMap<String, String>,
}

struct HeldSubscribe {
    connection: u64,
    id: String,
    destination: String,
    receipt: String,
}

#[derive(Default)]
struct BrokerState {
    connect: ConnectBehavior,
    subscribe: SubscribeBehavior,
    publish: PublishBehavior,
    opens: usize,
    next_connection: u64,
    connect_tokens: Vec<Option<String>>,
    connection: Option<FakeConnection>,
    frames: Vec<ClientFrame>,
    held_subscribes: Vec<HeldSubscribe>,
}

/// Scriptable broker reachable through the [`Transport`] trait
#[derive(Clone, Default)]
pub(crate) struct FakeBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl FakeBroker {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub(crate) fn set_connect(&self, behavior: ConnectBehavior) {
        self.lock().connect = behavior;
    }

    pub(crate) fn set_subscribe(&self, behavior: SubscribeBehavior) {
        self.lock().subscribe = behavior;
    }

    pub(crate) fn set_publish(&self, behavior: PublishBehavior) {
        self.lock().publish = behavior;
    }

    pub(crate) fn open_count(&self) -> usize {
        self.lock().opens
    }

    pub(crate) fn connect_tokens(&self) -> Vec<Option<String>> {
        self.lock().connect_tokens.clone()
    }

    /// Every frame the client sent, in order.
    pub(crate) fn frames(&self) -> Vec<ClientFrame> {
        self.lock().frames.clone()
    }

    /// Number of subscribe requests sent for `room_id`.
    pub(crate) fn subscribe_requests(&self, room_id: &str) -> usize {
        let destination = room_destination(room_id);
        self.frames()
            .iter()
            .filter(|frame| {
                matches!(frame, ClientFrame::Subscribe { destination: d, .. } if *d == destination)
            })
            .count()
    }

    /// Subscriptions for `room_id` active on the current connection.
    pub(crate) fn subscription_count(&self, room_id: &str) -> usize {
        let destination = room_destination(room_id);
        self.lock()
            .connection
            .as_ref()
            .map(|c| c.subscriptions.values().filter(|d| **d == destination).count())
            .unwrap_or(0)
    }

    /// Close the current connection from the broker side.
    pub(crate) fn drop_connection(&self) {
        self.lock().connection = None;
    }

    /// Revoke the session with an unsolicited auth error.
    pub(crate) fn revoke_session(&self) {
        self.send_to_client(ServerFrame::Error {
            code: ErrorCode::AuthRejected,
            message: "session revoked".to_string(),
            receipt_id: None,
        });
    }

    /// Push a message frame for an arbitrary subscription id.
    pub(crate) fn push_raw(&self, subscription: &str, destination: &str, body: &str) {
        self.send_to_client(ServerFrame::Message {
            subscription: subscription.to_string(),
            destination: destination.to_string(),
            body: body.to_string(),
        });
    }

    /// Publish `body` to every subscriber of `room_id`; returns the delivery count.
    pub(crate) fn deliver(&self, room_id: &str, body: &str) -> usize {
        let destination = room_destination(room_id);
        let state = self.lock();
        let Some(connection) = state.connection.as_ref() else {
            return 0;
        };
        fan_out(connection, &destination, body)
    }

    /// Acknowledge every held subscribe request that belongs to the live connection.
    pub(crate) fn release_held_subscribes(&self) {
        let mut state = self.lock();
        let held = std::mem::take(&mut state.held_subscribes);
        let Some(connection) = state.connection.as_mut() else {
            return;
        };
        for request in held {
            if request.connection != connection.id {
                continue;
            }
            connection
                .subscriptions
                .insert(request.id, request.destination);
            let _ = connection.to_client.send(ServerFrame::Receipt {
                receipt_id: request.receipt,
            });
        }
    }

    fn send_to_client(&self, frame: ServerFrame) {
        if let Some(connection) = self.lock().connection.as_ref() {
            let _ = connection.to_client.send(frame);
        }
    }

    fn handle(&self, connection_id: u64, frame: ClientFrame) {
        let mut guard = self.lock();
        let state = &mut *guard;
        state.frames.push(frame.clone());

        let Some(connection) = state.connection.as_mut() else {
            return;
        };
        if connection.id != connection_id {
            return;
        }

        match frame {
            ClientFrame::Connect { token } => {
                state.connect_tokens.push(token);
                match state.connect {
                    ConnectBehavior::Accept | ConnectBehavior::Refuse => {
                        let _ = connection.to_client.send(ServerFrame::Connected {
                            session: format!("session-{}", connection.id),
                        });
                    }
                    ConnectBehavior::RejectAuth => {
                        let _ = connection.to_client.send(ServerFrame::Error {
                            code: ErrorCode::AuthRejected,
                            message: "token expired".to_string(),
                            receipt_id: None,
                        });
                    }
                    ConnectBehavior::Hang => {}
                }
            }
            ClientFrame::Subscribe {
                id,
                destination,
                receipt,
            } => match state.subscribe {
                SubscribeBehavior::Ack => {
                    connection.subscriptions.insert(id, destination);
                    let _ = connection.to_client.send(ServerFrame::Receipt {
                        receipt_id: receipt,
                    });
                }
                SubscribeBehavior::Hold => state.held_subscribes.push(HeldSubscribe {
                    connection: connection.id,
                    id,
                    destination,
                    receipt,
                }),
                SubscribeBehavior::Reject => {
                    let _ = connection.to_client.send(ServerFrame::Error {
                        code: ErrorCode::BadFrame,
                        message: "subscribe refused".to_string(),
                        receipt_id: Some(receipt),
                    });
                }
                SubscribeBehavior::RejectAuth => {
                    let _ = connection.to_client.send(ServerFrame::Error {
                        code: ErrorCode::AuthRejected,
                        message: "token expired".to_string(),
                        receipt_id: Some(receipt),
                    });
                }
            },
            ClientFrame::Unsubscribe { id, receipt } => {
                connection.subscriptions.remove(&id);
                let _ = connection.to_client.send(ServerFrame::Receipt {
                    receipt_id: receipt,
                });
            }
            ClientFrame::Send {
                destination,
                receipt,
                body,
            } => match state.publish {
                PublishBehavior::AckAndEcho => {
                    fan_out(connection, &destination, &body);
                    let _ = connection.to_client.send(ServerFrame::Receipt {
                        receipt_id: receipt,
                    });
                }
                PublishBehavior::Reject => {
                    let _ = connection.to_client.send(ServerFrame::Error {
                        code: ErrorCode::BadFrame,
                        message: "publish refused".to_string(),
                        receipt_id: Some(receipt),
                    });
                }
            },
            ClientFrame::Disconnect => {}
        }
    }
}

fn fan_out(connection: &FakeConnection, destination: &str, body: &str) -> usize {
    let mut delivered = 0;
    for (subscription, subscribed) in &connection.subscriptions {
        if subscribed == destination {
            let _ = connection.to_client.send(ServerFrame::Message {
                subscription: subscription.clone(),
                destination: destination.to_string(),
                body: body.to_string(),
            });
            delivered += 1;
        }
    }
    delivered
}

#[async_trait]
impl Transport for FakeBroker {
    async fn open(&self, _url: &str, _token: Option<&str>) -> Result<Link, TransportError> {
        let (to_broker_tx, mut to_broker_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (to_client_tx, to_client_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let connection_id = {
            let mut state = self.lock();
            state.opens += 1;
            if state.connect == ConnectBehavior::Refuse {
                return Err(TransportError::Connection("connection refused".to_string()));
            }
            state.next_connection += 1;
            let id = state.next_connection;
            state.connection = Some(FakeConnection {
                id,
                to_client: to_client_tx,
                subscriptions: HashMap::new(),
            });
            id
        };

        let broker = self.clone();
        tokio::spawn(async move {
            while let Some(frame) = to_broker_rx.recv().await {
                broker.handle(connection_id, frame);
            }
        });

        Ok(Link::new(to_broker_tx, to_client_rx))
    }
}

/// Let every ready task run to quiescence.
pub(crate) async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// A connected manager and a registry over a fresh fake broker.
pub(crate) async fn connected_stack() -> (
    FakeBroker,
    ConnectionManager,
    Arc<RoomSubscriptionRegistry>,
) {
    let broker = FakeBroker::new();
    let connection = ConnectionManager::new(
        &ChatConfig::default(),
        Arc::new(broker.clone()),
        Arc::new(StaticCredentials::new("token-7")),
    );
    if let Err(e) = connection.connect().await {
        panic!("fake broker refused the connection: {e}");
    }
    let registry = Arc::new(RoomSubscriptionRegistry::new(
        connection.clone(),
        Arc::new(FixedClock::new(TEST_NOW)),
    ));
    (broker, connection, registry)
}
