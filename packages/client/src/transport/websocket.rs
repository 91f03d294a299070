//! WebSocket transport built on `tokio-tungstenite`.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use souk_shared::protocol::{ClientFrame, ServerFrame};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async,
    tungstenite::{
        self,
        client::IntoClientRequest,
        http::{HeaderValue, StatusCode, header::AUTHORIZATION},
        protocol::Message,
    },
};

use super::{Link, Transport};
use crate::error::TransportError;

/// Transport speaking JSON text frames over a WebSocket
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, url: &str, token: Option<&str>) -> Result<Link, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Connection(format!("invalid token: {}", e)))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _response) = connect_async(request).await.map_err(map_connect_error)?;
        tracing::debug!("WebSocket to {} established", url);

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientFrame>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ServerFrame>();

        let io_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        let Some(frame) = frame else {
                            // every sender is gone: close gracefully
                            let _ = write.close().await;
                            break;
                        };
                        let json = match serde_json::to_string(&frame) {
                            Ok(json) => json,
                            Err(e) => {
                                tracing::error!("Failed to serialize frame: {}", e);
                                continue;
                            }
                        };
                        if let Err(e) = write.send(Message::Text(json.into())).await {
                            tracing::warn!("WebSocket write error: {}", e);
                            break;
                        }
                    }
                    message = read.next() => {
                        match message {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ServerFrame>(&text) {
                                    Ok(frame) => {
                                        if inbound_tx.send(frame).is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        tracing::warn!("Undecodable broker frame ({}): {}", e, text.as_str());
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => {
                                tracing::info!("Broker closed the connection");
                                break;
                            }
                            Some(Err(e)) => {
                                tracing::warn!("WebSocket read error: {}", e);
                                break;
                            }
                            Some(Ok(_)) => {}
                        }
                    }
                }
            }
        });

        Ok(Link::new(outbound_tx, inbound_rx).with_io_task(io_task.abort_handle()))
    }
}

/// Distinguish a rejected credential from any other connect failure.
fn map_connect_error(error: tungstenite::Error) -> TransportError {
    match &error {
        tungstenite::Error::Http(response)
            if response.status() == StatusCode::UNAUTHORIZED
                || response.status() == StatusCode::FORBIDDEN =>
        {
            TransportError::AuthRejected(format!("broker answered {}", response.status()))
        }
        _ => TransportError::Connection(error.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_connect_error_io() {
        // テスト項目: I/O エラーは一般的な接続エラーとして扱われる
        // given (前提条件):
        let error = tungstenite::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "refused",
        ));

        // when (操作):
        let result = map_connect_error(error);

        // then (期待する結果):
        assert!(matches!(result, TransportError::Connection(_)));
    }

    #[tokio::test]
    async fn test_open_invalid_url_is_connection_error() {
        // テスト項目: 不正な URL は接続エラーになる
        // given (前提条件):
        let transport = WebSocketTransport;

        // when (操作):
        let result = transport.open("not a url", Some("token")).await;

        // then (期待する結果):
        assert!(matches!(result, Err(TransportError::Connection(_))));
    }
}
