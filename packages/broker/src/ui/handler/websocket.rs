//! WebSocket endpoint: the broker side of the wire protocol.

use std::sync::Arc;

use axum::{
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use souk_shared::protocol::{ClientFrame, ErrorCode, ServerFrame, room_id_from_destination};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::{
    domain::ConnectionId,
    ui::state::{AppState, ClientConnection},
};

use super::bearer_token;

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let header_token = bearer_token(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, header_token))
}

/// Spawns a task that pushes frames from `rx` to the WebSocket sender.
fn pusher_loop(
    mut rx: mpsc::UnboundedReceiver<ServerFrame>,
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let json = match serde_json::to_string(&frame) {
                Ok(json) => json,
                Err(e) => {
                    tracing::error!("Failed to serialize frame: {}", e);
                    continue;
                }
            };
            if sender.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
        let _ = sender.close().await;
    })
}

/// Session of one client after a successful handshake
struct Session {
    id: ConnectionId,
    token: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, header_token: Option<String>) {
    let (sender, mut receiver) = socket.split();
    let (tx, rx) = mpsc::unbounded_channel();
    let mut send_task = pusher_loop(rx, sender);

    let Some(session) = handshake(&mut receiver, &state, header_token, tx).await else {
        // let the pusher flush the rejection, then close
        let _ = send_task.await;
        return;
    };

    let session_id = session.id;
    let state_clone = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::warn!("WebSocket error on {}: {}", session.id, e);
                    break;
                }
            };

            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(ClientFrame::Disconnect) => {
                        tracing::info!("Client {} disconnected", session.id);
                        break;
                    }
                    Ok(frame) => handle_frame(&state_clone, &session, frame).await,
                    Err(e) => {
                        tracing::warn!("Undecodable frame from {}: {}", session.id, e);
                        let _ = session.tx.send(ServerFrame::Error {
                            code: ErrorCode::BadFrame,
                            message: format!("undecodable frame: {}", e),
                            receipt_id: None,
                        });
                    }
                },
                Message::Close(_) => {
                    tracing::info!("Client {} requested close", session.id);
                    break;
                }
                _ => {}
            }
        }
    });

    // If any one of the tasks completes, abort the other
    tokio::select! {
        _ = &mut recv_task => send_task.abort(),
        _ = &mut send_task => recv_task.abort(),
    };

    state.topics.lock().await.remove_connection(session_id);
    state.connections.lock().await.remove(&session_id);
    tracing::info!("Connection {} closed", session_id);
}

/// Wait for the `connect` frame and validate its credential.
async fn handshake(
    receiver: &mut futures_util::stream::SplitStream<WebSocket>,
    state: &AppState,
    header_token: Option<String>,
    tx: mpsc::UnboundedSender<ServerFrame>,
) -> Option<Session> {
    let frame = loop {
        match receiver.next().await? {
            Ok(Message::Text(text)) => break serde_json::from_str::<ClientFrame>(&text),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    };

    let token = match frame {
        Ok(ClientFrame::Connect { token }) => token.or(header_token),
        Ok(other) => {
            let _ = tx.send(ServerFrame::Error {
                code: ErrorCode::BadFrame,
                message: format!("expected connect, got {:?}", other),
                receipt_id: None,
            });
            return None;
        }
        Err(e) => {
            let _ = tx.send(ServerFrame::Error {
                code: ErrorCode::BadFrame,
                message: format!("undecodable frame: {}", e),
                receipt_id: None,
            });
            return None;
        }
    };

    let token = match token {
        Some(token) if state.is_accepted(Some(&token)).await => token,
        _ => {
            tracing::warn!("Rejecting connection with missing or invalid token");
            let _ = tx.send(ServerFrame::Error {
                code: ErrorCode::AuthRejected,
                message: "invalid or expired token".to_string(),
                receipt_id: None,
            });
            return None;
        }
    };

    let id = Uuid::new_v4();
    state.connections.lock().await.insert(
        id,
        ClientConnection {
            sender: tx.clone(),
            token: token.clone(),
        },
    );
    let _ = tx.send(ServerFrame::Connected {
        session: id.to_string(),
    });
    tracing::info!("Client {} connected", id);

    Some(Session { id, token, tx })
}

async fn handle_frame(state: &AppState, session: &Session, frame: ClientFrame) {
    let receipt = match &frame {
        ClientFrame::Subscribe { receipt, .. }
        | ClientFrame::Unsubscribe { receipt, .. }
        | ClientFrame::Send { receipt, .. } => receipt.clone(),
        ClientFrame::Connect { .. } | ClientFrame::Disconnect => {
            let _ = session.tx.send(ServerFrame::Error {
                code: ErrorCode::BadFrame,
                message: "already connected".to_string(),
                receipt_id: None,
            });
            return;
        }
    };

    if !state.is_accepted(Some(&session.token)).await {
        tracing::warn!("Request from revoked session {}", session.id);
        reject(session, ErrorCode::AuthRejected, "token revoked", receipt);
        return;
    }

    match frame {
        ClientFrame::Subscribe {
            id, destination, ..
        } => {
            if room_id_from_destination(&destination).is_none() {
                reject(session, ErrorCode::UnknownDestination, &destination, receipt);
                return;
            }
            state
                .topics
                .lock()
                .await
                .subscribe(session.id, &id, &destination);
            tracing::info!("{} subscribed to {} as '{}'", session.id, destination, id);
        }
        ClientFrame::Unsubscribe { id, .. } => {
            let removed = state.topics.lock().await.unsubscribe(session.id, &id);
            tracing::info!("{} unsubscribed '{}' (existed: {})", session.id, id, removed);
        }
        ClientFrame::Send {
            destination, body, ..
        } => {
            let Some(room_id) = room_id_from_destination(&destination) else {
                reject(session, ErrorCode::UnknownDestination, &destination, receipt);
                return;
            };
            {
                let mut rooms = state.rooms.lock().await;
                rooms.append(room_id, &body, state.clock.now_millis());
                rooms.join(room_id, &session.token);
            }
            let delivered = publish(state, &destination, &body).await;
            tracing::debug!("Published to {} ({} subscribers)", destination, delivered);
        }
        ClientFrame::Connect { .. } | ClientFrame::Disconnect => return,
    }

    let _ = session.tx.send(ServerFrame::Receipt {
        receipt_id: receipt,
    });
}

/// Deliver `body` to every subscriber of `destination`, the sender included.
async fn publish(state: &AppState, destination: &str, body: &str) -> usize {
    let subscribers = state.topics.lock().await.subscribers(destination);
    let connections = state.connections.lock().await;

    let mut delivered = 0;
    for (connection_id, subscription) in subscribers {
        let Some(connection) = connections.get(&connection_id) else {
            continue;
        };
        let frame = ServerFrame::Message {
            subscription,
            destination: destination.to_string(),
            body: body.to_string(),
        };
        if connection.sender.send(frame).is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn reject(session: &Session, code: ErrorCode, message: &str, receipt: String) {
    let _ = session.tx.send(ServerFrame::Error {
        code,
        message: message.to_string(),
        receipt_id: Some(receipt),
    });
}
