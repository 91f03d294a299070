//! Error types for the chat layer.

use thiserror::Error;

/// Failures of the underlying broker connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The connection could not be established or broke
    #[error("Connection error: {0}")]
    Connection(String),

    /// The broker rejected the credential
    #[error("Authentication rejected: {0}")]
    AuthRejected(String),

    /// The broker answered with something unexpected
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The connection is closed
    #[error("Connection closed")]
    Closed,

    /// The handshake did not complete in time
    #[error("Handshake timed out")]
    Timeout,
}

/// Outcome of an acknowledged request on the shared connection
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RequestError {
    #[error("Not connected to the broker")]
    NotConnected,

    #[error("Request rejected by the broker: authentication expired ({0})")]
    AuthRejected(String),

    #[error("Request rejected by the broker: {0}")]
    Rejected(String),

    #[error("Request was not acknowledged in time")]
    Timeout,

    #[error("Connection closed before the request was acknowledged")]
    Closed,
}

/// Errors surfaced to chat consumers
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    /// The credential is no longer valid; the consumer must force a logout
    #[error("Authentication expired: {0}")]
    AuthExpired(String),

    /// The shared broker connection is down
    #[error("Not connected to the chat broker")]
    NotConnected,

    /// Publish attempted on a room without a live subscription
    #[error("Room '{0}' has no live subscription")]
    NotSubscribed(String),

    /// The session is not live yet (or degraded)
    #[error("Chat is not ready yet, please retry in a moment")]
    NotReady,

    #[error("Subscribe failed: {0}")]
    SubscribeFailed(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("Image upload failed: {0}")]
    UploadFailed(String),

    /// Room metadata/history or leave-room REST call failed
    #[error("Chat API error: {0}")]
    Api(String),
}

impl ChatError {
    /// `true` if the session cannot continue and the user must log in again.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ChatError::AuthExpired(_))
    }

    /// `true` if the error is absorbed by the resubscribe poll.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ChatError::NotConnected | ChatError::SubscribeFailed(_) | ChatError::NotReady
        )
    }

    /// Map a failed subscribe request.
    pub(crate) fn from_subscribe(error: RequestError) -> Self {
        match error {
            RequestError::NotConnected => ChatError::NotConnected,
            RequestError::AuthRejected(message) => ChatError::AuthExpired(message),
            other => ChatError::SubscribeFailed(other.to_string()),
        }
    }

    /// Map a failed publish request.
    pub(crate) fn from_publish(error: RequestError) -> Self {
        match error {
            RequestError::AuthRejected(message) => ChatError::AuthExpired(message),
            other => ChatError::PublishFailed(other.to_string()),
        }
    }
}

impl From<TransportError> for ChatError {
    fn from(error: TransportError) -> Self {
        match error {
            TransportError::AuthRejected(message) => ChatError::AuthExpired(message),
            _ => ChatError::NotConnected,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_auth_expired_is_fatal() {
        // テスト項目: AuthExpired のみが致命的エラーと判定される
        // given (前提条件):
        let fatal = ChatError::AuthExpired("token revoked".to_string());
        let others = [
            ChatError::NotConnected,
            ChatError::NotReady,
            ChatError::SubscribeFailed("x".to_string()),
            ChatError::PublishFailed("x".to_string()),
            ChatError::UploadFailed("x".to_string()),
        ];

        // when (操作) / then (期待する結果):
        assert!(fatal.is_fatal());
        assert!(!fatal.is_transient());
        for error in others {
            assert!(!error.is_fatal(), "{error} should not be fatal");
        }
    }

    #[test]
    fn test_subscribe_auth_rejection_maps_to_auth_expired() {
        // テスト項目: subscribe の認証拒否が AuthExpired に変換される
        // given (前提条件):
        let error = RequestError::AuthRejected("revoked".to_string());

        // when (操作):
        let result = ChatError::from_subscribe(error);

        // then (期待する結果):
        assert_eq!(result, ChatError::AuthExpired("revoked".to_string()));
    }

    #[test]
    fn test_subscribe_timeout_is_transient() {
        // テスト項目: subscribe のタイムアウトは一時的な SubscribeFailed になる
        // given (前提条件):
        let error = RequestError::Timeout;

        // when (操作):
        let result = ChatError::from_subscribe(error);

        // then (期待する結果):
        assert!(matches!(result, ChatError::SubscribeFailed(_)));
        assert!(result.is_transient());
    }

    #[test]
    fn test_publish_rejection_maps_to_publish_failed() {
        // テスト項目: publish の拒否は PublishFailed になり、自動リトライ対象ではない
        // given (前提条件):
        let error = RequestError::Rejected("unknown destination".to_string());

        // when (操作):
        let result = ChatError::from_publish(error);

        // then (期待する結果):
        assert!(matches!(result, ChatError::PublishFailed(_)));
        assert!(!result.is_transient());
    }
}
