//! Bearer credential sources.

use std::sync::{Arc, RwLock};

/// Accessor for the current bearer token
pub trait CredentialSource: Send + Sync {
    /// The token to present, or `None` when logged out.
    fn bearer_token(&self) -> Option<String>;
}

/// A token fixed for the whole application session
#[derive(Debug, Clone)]
pub struct StaticCredentials(Option<String>);

impl StaticCredentials {
    pub fn new(token: impl Into<String>) -> Self {
        Self(Some(token.into()))
    }

    pub fn anonymous() -> Self {
        Self(None)
    }
}

impl CredentialSource for StaticCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.0.clone()
    }
}

/// A token that can be replaced or cleared while the application runs
#[derive(Debug, Clone, Default)]
pub struct SharedCredentials {
    token: Arc<RwLock<Option<String>>>,
}

impl SharedCredentials {
    pub fn new(token: Option<String>) -> Self {
        Self {
            token: Arc::new(RwLock::new(token)),
        }
    }

    /// Replace the stored token (e.g. after a refresh).
    pub fn set(&self, token: impl Into<String>) {
        if let Ok(mut guard) = self.token.write() {
            *guard = Some(token.into());
        }
    }

    /// Forget the stored token; used on forced logout.
    pub fn clear(&self) {
        if let Ok(mut guard) = self.token.write() {
            *guard = None;
        }
    }
}

impl CredentialSource for SharedCredentials {
    fn bearer_token(&self) -> Option<String> {
        self.token.read().ok().and_then(|guard| guard.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_credentials_clear() {
        // テスト項目: clear 後はトークンが返されない
        // given (前提条件):
        let credentials = SharedCredentials::new(Some("token-a".to_string()));
        let view = credentials.clone();

        // when (操作):
        credentials.clear();

        // then (期待する結果):
        assert_eq!(view.bearer_token(), None);
    }

    #[test]
    fn test_shared_credentials_set_is_visible_to_clones() {
        // テスト項目: set したトークンがクローンからも参照できる
        // given (前提条件):
        let credentials = SharedCredentials::default();
        let view = credentials.clone();

        // when (操作):
        credentials.set("token-b");

        // then (期待する結果):
        assert_eq!(view.bearer_token(), Some("token-b".to_string()));
    }

    #[test]
    fn test_static_credentials() {
        // テスト項目: StaticCredentials は固定トークンを返す
        // given (前提条件) / when (操作):
        let fixed = StaticCredentials::new("abc");
        let anonymous = StaticCredentials::anonymous();

        // then (期待する結果):
        assert_eq!(fixed.bearer_token(), Some("abc".to_string()));
        assert_eq!(anonymous.bearer_token(), None);
    }
}
