//! Chat REST API: room metadata and history, leaving rooms, image uploads.

use async_trait::async_trait;
use reqwest::{StatusCode, multipart};
use souk_shared::protocol::{RoomSnapshotDto, UploadResponseDto};
use std::sync::Arc;

use crate::{
    credentials::CredentialSource,
    domain::{ImageUpload, RoomId, RoomSnapshot},
    error::ChatError,
};

/// REST operations the chat layer depends on
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Fetch room metadata and the latest history page.
    async fn fetch_room(&self, room_id: &RoomId) -> Result<RoomSnapshot, ChatError>;

    /// Remove the current user from the room's membership.
    async fn leave_room(&self, room_id: &RoomId) -> Result<(), ChatError>;

    /// Upload an image and return its public URL.
    async fn upload_image(&self, image: &ImageUpload) -> Result<String, ChatError>;
}

/// [`ChatApi`] over HTTP with bearer authentication
pub struct HttpChatApi {
    http: reqwest::Client,
    base_url: String,
    credentials: Arc<dyn CredentialSource>,
}

impl HttpChatApi {
    pub fn new(base_url: impl Into<String>, credentials: Arc<dyn CredentialSource>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            credentials,
        }
    }

    fn room_url(&self, room_id: &RoomId) -> String {
        format!("{}/api/chat/rooms/{}", self.base_url, room_id)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self.credentials.bearer_token() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

/// Map a non-success HTTP status; 401/403 mean the credential is gone.
fn status_error(status: StatusCode, context: &str) -> ChatError {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ChatError::AuthExpired(format!("{} returned {}", context, status))
        }
        _ => ChatError::Api(format!("{} returned {}", context, status)),
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn fetch_room(&self, room_id: &RoomId) -> Result<RoomSnapshot, ChatError> {
        let response = self
            .authorize(self.http.get(self.room_url(room_id)))
            .send()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "fetching room"));
        }

        let snapshot = response
            .json::<RoomSnapshotDto>()
            .await
            .map_err(|e| ChatError::Api(format!("invalid room snapshot: {}", e)))?;
        tracing::debug!(
            "Fetched room '{}' with {} history messages",
            room_id,
            snapshot.messages.len()
        );
        Ok(snapshot.into())
    }

    async fn leave_room(&self, room_id: &RoomId) -> Result<(), ChatError> {
        let url = format!("{}/members/me", self.room_url(room_id));
        let response = self
            .authorize(self.http.delete(url))
            .send()
            .await
            .map_err(|e| ChatError::Api(e.to_string()))?;

        if !response.status().is_success() {
            return Err(status_error(response.status(), "leaving room"));
        }
        tracing::info!("Left room '{}'", room_id);
        Ok(())
    }

    async fn upload_image(&self, image: &ImageUpload) -> Result<String, ChatError> {
        let part = multipart::Part::bytes(image.bytes.clone())
            .file_name(image.file_name.clone())
            .mime_str(&image.content_type)
            .map_err(|e| ChatError::UploadFailed(format!("invalid content type: {}", e)))?;
        let form = multipart::Form::new().part("file", part);

        let response = self
            .authorize(self.http.post(format!("{}/api/uploads", self.base_url)))
            .multipart(form)
            .send()
            .await
            .map_err(|e| ChatError::UploadFailed(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(match status_error(status, "uploading image") {
                ChatError::Api(message) => ChatError::UploadFailed(message),
                auth => auth,
            });
        }

        let uploaded = response
            .json::<UploadResponseDto>()
            .await
            .map_err(|e| ChatError::UploadFailed(format!("invalid upload response: {}", e)))?;
        tracing::debug!("Uploaded '{}' to {}", image.file_name, uploaded.url);
        Ok(uploaded.url)
    }
}
