//! HTTP API endpoint handlers.

use std::sync::Arc;

use axum::{
    Json,
    body::Bytes,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header::CONTENT_TYPE},
    response::{IntoResponse, Response},
};
use souk_shared::protocol::{RoomSnapshotDto, UploadResponseDto};
use thiserror::Error;
use uuid::Uuid;

use crate::ui::state::{AppState, HISTORY_PAGE_SIZE, StoredUpload};

use super::bearer_token;

/// Errors returned by the REST handlers
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid token")]
    Unauthorized,

    #[error("not found")]
    NotFound,

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
        };
        (status, Json(serde_json::json!({"error": self.to_string()}))).into_response()
    }
}

/// Token of an authorized request.
async fn authorize(state: &AppState, headers: &HeaderMap) -> Result<String, ApiError> {
    let token = bearer_token(headers).ok_or(ApiError::Unauthorized)?;
    if state.is_accepted(Some(&token)).await {
        Ok(token)
    } else {
        Err(ApiError::Unauthorized)
    }
}

/// Health check endpoint
pub async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({"status": "ok"}))
}

/// Room metadata and the latest history page
pub async fn get_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<RoomSnapshotDto>, ApiError> {
    let token = authorize(&state, &headers).await?;

    let mut rooms = state.rooms.lock().await;
    rooms.join(&room_id, &token);
    let snapshot = rooms.snapshot(&room_id, HISTORY_PAGE_SIZE);
    tracing::debug!(
        "Room '{}' snapshot with {} messages",
        room_id,
        snapshot.messages.len()
    );
    Ok(Json(snapshot))
}

/// Remove the caller from the room's members
pub async fn leave_room(
    State(state): State<Arc<AppState>>,
    Path(room_id): Path<String>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let token = authorize(&state, &headers).await?;

    if state.rooms.lock().await.leave(&room_id, &token) {
        tracing::info!("A member left room '{}'", room_id);
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::NotFound)
    }
}

/// Store the multipart field `file` and return its URL
pub async fn upload_image(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResponseDto>, ApiError> {
    authorize(&state, &headers).await?;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.to_string()))?
    {
        if field.name() != Some("file") {
            continue;
        }
        let content_type = field
            .content_type()
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = field
            .bytes()
            .await
            .map_err(|e| ApiError::BadRequest(e.to_string()))?;

        let id = Uuid::new_v4().to_string();
        tracing::info!("Stored upload {} ({} bytes, {})", id, bytes.len(), content_type);
        state.uploads.lock().await.insert(
            id.clone(),
            StoredUpload {
                content_type,
                bytes: bytes.to_vec(),
            },
        );
        return Ok(Json(UploadResponseDto {
            url: format!("{}/uploads/{}", state.public_url, id),
        }));
    }

    Err(ApiError::BadRequest("missing multipart field 'file'".to_string()))
}

/// Serve an uploaded file
pub async fn get_upload(
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let upload = state
        .uploads
        .lock()
        .await
        .get(&upload_id)
        .cloned()
        .ok_or(ApiError::NotFound)?;
    Ok(([(CONTENT_TYPE, upload.content_type)], Bytes::from(upload.bytes)))
}
