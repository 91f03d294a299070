//! Request handlers.

mod http;
mod websocket;

pub use http::{get_room, get_upload, health_check, leave_room, upload_image};
pub use websocket::websocket_handler;

use axum::http::{HeaderMap, header::AUTHORIZATION};

/// Bearer token of the `Authorization` header, if any.
pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(|token| token.trim().to_string())
        .filter(|token| !token.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_bearer_token_from_header() {
        // テスト項目: Authorization ヘッダーから Bearer トークンが取り出される
        // given (前提条件):
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer alice-token"));

        // when (操作):
        let token = bearer_token(&headers);

        // then (期待する結果):
        assert_eq!(token, Some("alice-token".to_string()));
    }

    #[test]
    fn test_bearer_token_missing_or_other_scheme() {
        // テスト項目: ヘッダーがない場合や Bearer 以外の方式は None になる
        // given (前提条件):
        let empty = HeaderMap::new();
        let mut basic = HeaderMap::new();
        basic.insert(AUTHORIZATION, HeaderValue::from_static("Basic YWxpY2U="));

        // when (操作) / then (期待する結果):
        assert_eq!(bearer_token(&empty), None);
        assert_eq!(bearer_token(&basic), None);
    }
}
