//! Connection manager: the single shared connection to the broker.
//!
//! Owns the [`Transport`] link, the observable [`ConnectionState`], request
//! acknowledgments (receipts) and the routing of inbound frames to
//! subscription handlers. All room subscriptions of the application share
//! this one connection.
//!
//! Every successful handshake starts a new *epoch*. Routes and pending
//! requests never survive a transport cycle; subscribers compare the epoch they
//! subscribed in with [`ConnectionManager::epoch`] to know whether they are
//! still live.

use std::{
    collections::HashMap,
    sync::{
        Arc, Weak,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use souk_shared::protocol::{ClientFrame, ErrorCode, ServerFrame};
use tokio::{
    sync::{Mutex, mpsc, oneshot, watch},
    task::{AbortHandle, JoinHandle},
};

use crate::{
    config::{ChatConfig, ReconnectPolicy},
    credentials::CredentialSource,
    domain::ConnectionState,
    error::{RequestError, TransportError},
    reconnect::{backoff_delay, should_attempt_reconnect, should_exit_immediately},
    transport::{Link, Transport},
};

/// Handler invoked with the raw body of every frame routed to a subscription
pub type FrameHandler = Arc<dyn Fn(String) + Send + Sync>;

/// Cloneable handle to the shared broker connection
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

struct Shared {
    transport: Arc<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    broker_url: String,
    handshake_timeout: Duration,
    ack_timeout: Duration,
    state_tx: watch::Sender<ConnectionState>,
    epoch: AtomicU64,
    next_receipt: AtomicU64,
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    link: Option<ActiveLink>,
    pending: HashMap<String, oneshot::Sender<Result<(), RequestError>>>,
    routes: HashMap<String, FrameHandler>,
    last_error: Option<TransportError>,
}

struct ActiveLink {
    outbound: mpsc::UnboundedSender<ClientFrame>,
    reader: JoinHandle<()>,
    io_task: Option<AbortHandle>,
    epoch: u64,
}

impl ConnectionManager {
    /// Create a manager in the `Disconnected` state.
    pub fn new(
        config: &ChatConfig,
        transport: Arc<dyn Transport>,
        credentials: Arc<dyn CredentialSource>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                credentials,
                broker_url: config.broker_url.clone(),
                handshake_timeout: config.handshake_timeout,
                ack_timeout: config.ack_timeout,
                state_tx,
                epoch: AtomicU64::new(0),
                next_receipt: AtomicU64::new(0),
                inner: Mutex::new(Inner::default()),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    /// Observe state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of successful handshakes so far.
    pub fn epoch(&self) -> u64 {
        self.shared.epoch.load(Ordering::SeqCst)
    }

    /// The failure that ended the last connection or connect attempt.
    pub async fn last_error(&self) -> Option<TransportError> {
        self.shared.inner.lock().await.last_error.clone()
    }

    /// Open the shared connection.
    ///
    /// No-op while `Connecting` or `Connected`. On failure the state becomes
    /// `Failed` and no retry is scheduled here.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let claimed = self.shared.state_tx.send_if_modified(|state| match state {
            ConnectionState::Connecting | ConnectionState::Connected => false,
            ConnectionState::Disconnected | ConnectionState::Failed => {
                *state = ConnectionState::Connecting;
                true
            }
        });
        if !claimed {
            tracing::debug!("Connect requested while {:?}, ignoring", self.state());
            return Ok(());
        }

        tracing::info!("Connecting to broker at {}", self.shared.broker_url);
        let token = self.shared.credentials.bearer_token();
        let handshake = tokio::time::timeout(self.shared.handshake_timeout, self.handshake(token));

        match handshake.await {
            Ok(Ok(link)) => self.install(link).await,
            Ok(Err(e)) => {
                self.fail(e.clone()).await;
                Err(e)
            }
            Err(_) => {
                self.fail(TransportError::Timeout).await;
                Err(TransportError::Timeout)
            }
        }
    }

    /// Close the shared connection and drop every route and pending request.
    pub async fn disconnect(&self) {
        let mut inner = self.shared.inner.lock().await;
        if let Some(active) = inner.link.take() {
            let _ = active.outbound.send(ClientFrame::Disconnect);
            active.reader.abort();
            tracing::info!("Disconnected from broker (epoch {})", active.epoch);
        }
        inner.pending.clear();
        inner.routes.clear();
        self.shared
            .state_tx
            .send_replace(ConnectionState::Disconnected);
    }

    /// Allocate a receipt id for an acknowledged request.
    pub fn next_receipt(&self) -> String {
        let id = self.shared.next_receipt.fetch_add(1, Ordering::SeqCst) + 1;
        format!("receipt-{}", id)
    }

    /// Route frames of `subscription_id` to `handler`.
    ///
    /// Returns the epoch the route belongs to; the route is dropped when that
    /// connection ends.
    pub async fn add_route(
        &self,
        subscription_id: &str,
        handler: FrameHandler,
    ) -> Result<u64, RequestError> {
        let mut inner = self.shared.inner.lock().await;
        let epoch = match &inner.link {
            Some(active) if self.is_connected() => active.epoch,
            _ => return Err(RequestError::NotConnected),
        };
        inner.routes.insert(subscription_id.to_string(), handler);
        Ok(epoch)
    }

    pub async fn remove_route(&self, subscription_id: &str) {
        self.shared.inner.lock().await.routes.remove(subscription_id);
    }

    /// Send `frame` and wait for the broker to acknowledge `receipt`.
    pub async fn request(&self, receipt: String, frame: ClientFrame) -> Result<(), RequestError> {
        let ack = {
            let mut guard = self.shared.inner.lock().await;
            let inner = &mut *guard;
            let Some(active) = inner.link.as_ref() else {
                return Err(RequestError::NotConnected);
            };
            if active.outbound.send(frame).is_err() {
                return Err(RequestError::Closed);
            }
            let (tx, rx) = oneshot::channel();
            inner.pending.insert(receipt.clone(), tx);
            rx
        };

        match tokio::time::timeout(self.shared.ack_timeout, ack).await {
            Ok(Ok(result)) => result,
            // sender dropped: the connection ended before the ack
            Ok(Err(_)) => Err(RequestError::Closed),
            Err(_) => {
                self.shared.inner.lock().await.pending.remove(&receipt);
                tracing::warn!(
                    "Request '{}' not acknowledged within {:?}",
                    receipt,
                    self.shared.ack_timeout
                );
                Err(RequestError::Timeout)
            }
        }
    }

    /// Send `frame` without waiting for an acknowledgment.
    pub async fn notify(&self, frame: ClientFrame) -> Result<(), RequestError> {
        let inner = self.shared.inner.lock().await;
        let active = inner.link.as_ref().ok_or(RequestError::NotConnected)?;
        active.outbound.send(frame).map_err(|_| RequestError::Closed)
    }

    /// Keep the connection up: reconnect with backoff whenever it drops.
    ///
    /// Stops when the credential is rejected or the policy gives up.
    pub fn spawn_supervisor(&self, policy: ReconnectPolicy) -> JoinHandle<()> {
        let manager = self.clone();
        let mut state_rx = self.watch_state();

        tokio::spawn(async move {
            let mut attempt: u32 = 0;
            loop {
                let state = *state_rx.borrow_and_update();
                match state {
                    ConnectionState::Connected => attempt = 0,
                    ConnectionState::Connecting => {}
                    ConnectionState::Disconnected | ConnectionState::Failed => {
                        let last_error = manager.last_error().await;
                        if !should_attempt_reconnect(last_error.as_ref(), attempt, &policy) {
                            match last_error {
                                Some(e) if should_exit_immediately(&e) => tracing::error!(
                                    "Broker rejected the credential ({}), not reconnecting",
                                    e
                                ),
                                _ => tracing::error!(
                                    "Failed to reconnect after {} attempts, giving up",
                                    attempt
                                ),
                            }
                            return;
                        }

                        let delay = backoff_delay(attempt, &policy);
                        tracing::info!(
                            "Reconnecting in {:?} (attempt {})",
                            delay,
                            attempt + 1
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        if let Err(e) = manager.connect().await {
                            tracing::warn!("Reconnect attempt {} failed: {}", attempt, e);
                        }
                        continue;
                    }
                }

                if state_rx.changed().await.is_err() {
                    return;
                }
            }
        })
    }

    async fn handshake(&self, token: Option<String>) -> Result<Link, TransportError> {
        let mut link = self
            .shared
            .transport
            .open(&self.shared.broker_url, token.as_deref())
            .await?;

        link.outbound
            .send(ClientFrame::Connect { token })
            .map_err(|_| TransportError::Closed)?;

        match link.inbound.recv().await {
            Some(ServerFrame::Connected { session }) => {
                tracing::debug!("Broker accepted session '{}'", session);
                Ok(link)
            }
            Some(ServerFrame::Error {
                code: ErrorCode::AuthRejected,
                message,
                ..
            }) => Err(TransportError::AuthRejected(message)),
            Some(ServerFrame::Error { message, .. }) => Err(TransportError::Protocol(message)),
            Some(other) => Err(TransportError::Protocol(format!(
                "unexpected frame during handshake: {:?}",
                other
            ))),
            None => Err(TransportError::Closed),
        }
    }

    async fn install(&self, link: Link) -> Result<(), TransportError> {
        let mut inner = self.shared.inner.lock().await;

        // disconnect() may have run while the handshake was in flight
        if self.state() != ConnectionState::Connecting {
            tracing::info!("Connection was closed during the handshake, dropping it");
            return Err(TransportError::Closed);
        }

        let (outbound, inbound, io_task) = link.into_parts();
        let epoch = self.shared.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let reader = tokio::spawn(read_loop(Arc::downgrade(&self.shared), inbound, epoch));

        inner.link = Some(ActiveLink {
            outbound,
            reader,
            io_task,
            epoch,
        });
        inner.last_error = None;
        self.shared.state_tx.send_replace(ConnectionState::Connected);
        tracing::info!("Connected to broker (epoch {})", epoch);
        Ok(())
    }

    async fn fail(&self, error: TransportError) {
        tracing::warn!("Connecting to broker failed: {}", error);
        let mut inner = self.shared.inner.lock().await;
        inner.last_error = Some(error);
        self.shared.state_tx.send_replace(ConnectionState::Failed);
    }
}

/// Dispatch inbound frames until the link of `epoch` closes.
async fn read_loop(
    shared: Weak<Shared>,
    mut inbound: mpsc::UnboundedReceiver<ServerFrame>,
    epoch: u64,
) {
    let mut close_reason = None;

    while let Some(frame) = inbound.recv().await {
        let Some(manager) = shared.upgrade() else {
            return;
        };
        if let Some(reason) = manager.dispatch(frame).await {
            close_reason = Some(reason);
            break;
        }
    }

    if let Some(manager) = shared.upgrade() {
        manager.connection_lost(epoch, close_reason).await;
    }
}

impl Shared {
    /// Handle one inbound frame; returns a reason when the connection must end.
    async fn dispatch(&self, frame: ServerFrame) -> Option<TransportError> {
        let mut inner = self.inner.lock().await;
        match frame {
            ServerFrame::Receipt { receipt_id } => match inner.pending.remove(&receipt_id) {
                Some(ack) => {
                    let _ = ack.send(Ok(()));
                }
                None => tracing::debug!("Receipt '{}' matches no pending request", receipt_id),
            },
            ServerFrame::Error {
                code,
                message,
                receipt_id: Some(receipt_id),
            } => match inner.pending.remove(&receipt_id) {
                Some(ack) => {
                    let error = match code {
                        ErrorCode::AuthRejected => RequestError::AuthRejected(message),
                        _ => RequestError::Rejected(message),
                    };
                    let _ = ack.send(Err(error));
                }
                None => tracing::warn!(
                    "Broker error for unknown request '{}': {}",
                    receipt_id,
                    message
                ),
            },
            ServerFrame::Error {
                code: ErrorCode::AuthRejected,
                message,
                receipt_id: None,
            } => {
                tracing::error!("Broker revoked the session: {}", message);
                return Some(TransportError::AuthRejected(message));
            }
            ServerFrame::Error { message, .. } => {
                tracing::warn!("Broker error: {}", message);
            }
            ServerFrame::Message {
                subscription,
                destination,
                body,
            } => match inner.routes.get(&subscription) {
                Some(handler) => {
                    tracing::debug!("Routing frame on {} to '{}'", destination, subscription);
                    handler(body);
                }
                None => tracing::debug!(
                    "No route for subscription '{}' ({}), frame ignored",
                    subscription,
                    destination
                ),
            },
            ServerFrame::Connected { session } => {
                tracing::warn!("Unexpected handshake ack for session '{}'", session);
            }
        }
        None
    }

    async fn connection_lost(&self, epoch: u64, reason: Option<TransportError>) {
        let mut inner = self.inner.lock().await;
        match &inner.link {
            Some(active) if active.epoch == epoch => {}
            // already replaced or explicitly disconnected
            _ => return,
        }

        if let Some(active) = inner.link.take()
            && let Some(io_task) = active.io_task
        {
            io_task.abort();
        }
        inner.pending.clear();
        inner.routes.clear();
        if let Some(reason) = reason {
            inner.last_error = Some(reason);
        }
        self.state_tx.send_replace(ConnectionState::Disconnected);
        tracing::warn!("Connection to broker lost (epoch {})", epoch);
    }
}
