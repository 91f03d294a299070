//! Chat layer configuration.

use std::time::Duration;

/// Period of the resubscribe poll
pub const RESUBSCRIBE_INTERVAL: Duration = Duration::from_secs(5);
/// Period of the status poll
pub const STATUS_INTERVAL: Duration = Duration::from_secs(1);
/// Upper bound on waiting for a subscribe / publish acknowledgment
pub const ACK_TIMEOUT: Duration = Duration::from_secs(10);
/// Upper bound on the transport handshake
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Automatic reconnection policy of the shared connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// `None` retries forever
    pub max_attempts: Option<u32>,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: None,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

/// Configuration of the chat layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// WebSocket URL of the broker (e.g. `ws://127.0.0.1:8080/ws`)
    pub broker_url: String,
    /// Base URL of the chat REST API (e.g. `http://127.0.0.1:8080`)
    pub api_base_url: String,
    pub resubscribe_interval: Duration,
    pub status_interval: Duration,
    pub ack_timeout: Duration,
    pub handshake_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl ChatConfig {
    /// Create a configuration with default timings for the given endpoints.
    pub fn new(broker_url: impl Into<String>, api_base_url: impl Into<String>) -> Self {
        Self {
            broker_url: broker_url.into(),
            api_base_url: api_base_url.into(),
            resubscribe_interval: RESUBSCRIBE_INTERVAL,
            status_interval: STATUS_INTERVAL,
            ack_timeout: ACK_TIMEOUT,
            handshake_timeout: HANDSHAKE_TIMEOUT,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self::new("ws://127.0.0.1:8080/ws", "http://127.0.0.1:8080")
    }
}
