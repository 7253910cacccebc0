//! Lookup, listing, metadata update and deletion of media records.

use crate::auth::AuthPrincipal;
use crate::error::{query_rejection, ErrorResponse, HttpAppError, ValidatedJson};
use crate::state::AppState;
use axum::{
    extract::{rejection::QueryRejection, Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use lumen_core::models::{MediaListQuery, MediaListResponse, MediaResponse, UpdateMediaRequest};
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/api/media/{id}",
    tag = "media",
    params(("id" = String, Path, description = "Media ID")),
    responses(
        (status = 200, description = "Media record", body = MediaResponse),
        (status = 401, description = "Missing credentials", body = ErrorResponse),
        (status = 404, description = "Media not found", body = ErrorResponse)
    )
)]
pub async fn get_media(
    _principal: AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = state.media.get(&id).await?;
    Ok(Json(MediaResponse::from(record)))
}

#[utoipa::path(
    get,
    path = "/api/media",
    tag = "media",
    params(MediaListQuery),
    responses(
        (status = 200, description = "Page of media records", body = MediaListResponse),
        (status = 400, description = "Invalid filter", body = ErrorResponse),
        (status = 401, description = "Missing credentials", body = ErrorResponse)
    )
)]
pub async fn list_media(
    _principal: AuthPrincipal,
    State(state): State<Arc<AppState>>,
    query: Result<Query<MediaListQuery>, QueryRejection>,
) -> Result<impl IntoResponse, HttpAppError> {
    let Query(query) = query.map_err(query_rejection)?;
    let page = state.media.list(query).await?;
    Ok(Json(page))
}

#[utoipa::path(
    put,
    path = "/api/media/{id}",
    tag = "media",
    params(("id" = String, Path, description = "Media ID")),
    request_body = UpdateMediaRequest,
    responses(
        (status = 200, description = "Updated record", body = MediaResponse),
        (status = 400, description = "Invalid patch", body = ErrorResponse),
        (status = 401, description = "Not the owner", body = ErrorResponse),
        (status = 404, description = "Media not found", body = ErrorResponse),
        (status = 409, description = "Concurrent update", body = ErrorResponse)
    )
)]
pub async fn update_media(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    ValidatedJson(request): ValidatedJson<UpdateMediaRequest>,
) -> Result<impl IntoResponse, HttpAppError> {
    let record = state.media.update(&principal, &id, request).await?;
    Ok(Json(MediaResponse::from(record)))
}

#[utoipa::path(
    delete,
    path = "/api/media/{id}",
    tag = "media",
    params(("id" = String, Path, description = "Media ID")),
    responses(
        (status = 204, description = "Media deleted"),
        (status = 401, description = "Not the owner", body = ErrorResponse),
        (status = 404, description = "Media not found", body = ErrorResponse)
    )
)]
pub async fn delete_media(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    state.media.delete(&principal, &id).await?;
    Ok(StatusCode::NO_CONTENT)
}
