//! Chunked upload handlers for large file uploads.
//!
//! `start` opens a session; each chunk arrives as its own multipart request. The request
//! that delivers the final chunk triggers the commit in the background.

use crate::auth::AuthPrincipal;
use crate::error::{ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{Multipart, State},
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use lumen_core::models::{ChunkAck, StartChunkedUploadRequest};
use lumen_core::AppError;
use std::sync::Arc;

#[utoipa::path(
    post,
    path = "/api/media/chunked/start",
    tag = "uploads",
    request_body = StartChunkedUploadRequest,
    responses(
        (status = 200, description = "Chunked upload started", body = ChunkAck),
        (status = 400, description = "Invalid input", body = ErrorResponse),
        (status = 409, description = "Upload id already in use", body = ErrorResponse)
    )
)]
pub async fn start_chunked_upload(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<Arc<AppState>>,
    ValidatedJson(request): ValidatedJson<StartChunkedUploadRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let ack = state.uploads.start_chunked(&principal, request).await?;
    Ok(Json(ack))
}

#[utoipa::path(
    post,
    path = "/api/media/chunked/upload",
    tag = "uploads",
    request_body(content_type = "multipart/form-data", description = "`chunk` file part with `uploadId` and `chunkIndex` fields"),
    responses(
        (status = 200, description = "Chunk stored", body = ChunkAck),
        (status = 400, description = "Invalid chunk", body = ErrorResponse),
        (status = 404, description = "Unknown upload", body = ErrorResponse),
        (status = 409, description = "Upload already complete", body = ErrorResponse)
    )
)]
pub async fn upload_chunk(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut upload_id: Option<String> = None;
    let mut chunk_index: Option<u32> = None;
    let mut chunk: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read multipart: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "chunk" => {
                let data = field.bytes().await.map_err(|e| {
                    AppError::InvalidInput(format!("Failed to read chunk data: {}", e))
                })?;
                chunk = Some(data);
            }
            "uploadId" => upload_id = Some(read_text(field, &name).await?),
            "chunkIndex" => {
                let raw = read_text(field, &name).await?;
                let index = raw.trim().parse::<u32>().map_err(|_| {
                    AppError::InvalidInput(format!("chunkIndex must be a non-negative integer, got {:?}", raw))
                })?;
                chunk_index = Some(index);
            }
            other => tracing::debug!(field = other, "Ignoring unknown chunk field"),
        }
    }

    let upload_id =
        upload_id.ok_or_else(|| AppError::InvalidInput("uploadId is required".to_string()))?;
    let chunk_index =
        chunk_index.ok_or_else(|| AppError::InvalidInput("chunkIndex is required".to_string()))?;
    let chunk = chunk.ok_or_else(|| AppError::InvalidInput("chunk is required".to_string()))?;

    let ack = state
        .uploads
        .upload_chunk(&principal, &upload_id, chunk_index, chunk)
        .await?;
    Ok(Json(ack))
}

async fn read_text(
    field: axum::extract::multipart::Field<'_>,
    name: &str,
) -> Result<String, AppError> {
    field
        .text()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read field {}: {}", name, e)))
}
