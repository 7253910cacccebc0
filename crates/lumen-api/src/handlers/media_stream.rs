//! Byte streaming of originals and thumbnails.
//!
//! `/api/media/{id}/stream` and `/api/media/{id}/thumbnail` require a principal; the
//! `/api/media/stream/{id}` and `/api/media/thumbnail/{id}` aliases are public so they can
//! be used directly as `<video>` and `<img>` sources.

use crate::auth::AuthPrincipal;
use crate::constants::{ORIGINAL_CACHE_CONTROL, THUMBNAIL_CACHE_CONTROL};
use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    body::Body,
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use lumen_core::AppError;
use lumen_services::MediaContent;
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/api/media/{id}/stream",
    tag = "media",
    params(
        ("id" = String, Path, description = "Media ID"),
        ("Range" = Option<String>, Header, description = "Single byte range, e.g. bytes=0-1023")
    ),
    responses(
        (status = 200, description = "Whole original", content_type = "application/octet-stream"),
        (status = 206, description = "Requested byte range", content_type = "application/octet-stream"),
        (status = 404, description = "Media not found", body = ErrorResponse),
        (status = 416, description = "Range not satisfiable")
    )
)]
pub async fn stream_original(
    _principal: AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpAppError> {
    serve_original(&state, &id, &headers).await
}

pub async fn stream_original_public(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Result<Response, HttpAppError> {
    serve_original(&state, &id, &headers).await
}

#[utoipa::path(
    get,
    path = "/api/media/{id}/thumbnail",
    tag = "media",
    params(("id" = String, Path, description = "Media ID")),
    responses(
        (status = 200, description = "JPEG thumbnail", content_type = "image/jpeg"),
        (status = 404, description = "Media or thumbnail not found", body = ErrorResponse)
    )
)]
pub async fn thumbnail(
    _principal: AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HttpAppError> {
    let content = state.media.open_thumbnail(&id).await?;
    content_response(content, THUMBNAIL_CACHE_CONTROL)
}

pub async fn thumbnail_public(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, HttpAppError> {
    let content = state.media.open_thumbnail(&id).await?;
    content_response(content, THUMBNAIL_CACHE_CONTROL)
}

async fn serve_original(
    state: &AppState,
    id: &str,
    headers: &HeaderMap,
) -> Result<Response, HttpAppError> {
    let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
    match state.media.open_original(id, range).await? {
        Ok(content) => content_response(content, ORIGINAL_CACHE_CONTROL),
        Err(unsatisfiable) => {
            tracing::debug!(media_id = %id, range = ?range, "Range not satisfiable");
            Ok((
                StatusCode::RANGE_NOT_SATISFIABLE,
                [
                    (header::CONTENT_RANGE, format!("bytes */{}", unsatisfiable.size)),
                    (header::ACCEPT_RANGES, "bytes".to_string()),
                ],
            )
                .into_response())
        }
    }
}

fn content_response(content: MediaContent, cache_control: &'static str) -> Result<Response, HttpAppError> {
    let MediaContent {
        object,
        content_type,
        range,
    } = content;

    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CONTENT_LENGTH, object.content_length)
        .header(header::ACCEPT_RANGES, "bytes")
        .header(header::CACHE_CONTROL, cache_control);
    builder = match range {
        Some(range) => builder.status(StatusCode::PARTIAL_CONTENT).header(
            header::CONTENT_RANGE,
            format!("bytes {}-{}/{}", range.start, range.end - 1, object.total_size),
        ),
        None => builder.status(StatusCode::OK),
    };

    builder
        .body(Body::from_stream(object.stream))
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to build content response");
            AppError::Internal(format!("Failed to build response: {}", e)).into()
        })
}
