//! OpenAPI documentation, served at `/api/openapi.json`.

use utoipa::OpenApi;

use crate::error;
use crate::handlers;
use crate::setup::routes::health;
use lumen_core::models;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Lumen API",
        version = "0.1.0",
        description = "Media ingestion and delivery: single-shot and chunked uploads of images and videos, derived thumbnails, byte-range streaming and live upload progress."
    ),
    paths(
        handlers::media_upload::upload_media,
        handlers::chunked_upload::start_chunked_upload,
        handlers::chunked_upload::upload_chunk,
        handlers::progress::get_progress,
        handlers::media::get_media,
        handlers::media::list_media,
        handlers::media::update_media,
        handlers::media::delete_media,
        handlers::media_stream::stream_original,
        handlers::media_stream::thumbnail,
        health::health_check,
    ),
    components(schemas(
        error::ErrorResponse,
        models::MediaResponse,
        models::MediaListResponse,
        models::MediaKind,
        models::MediaStatus,
        models::MediaAttributes,
        models::Orientation,
        models::UpdateMediaRequest,
        models::StartChunkedUploadRequest,
        models::ChunkAck,
        models::UploadBatchResponse,
        models::ProgressSnapshot,
        models::ProgressPhase,
        health::HealthCheckResponse,
    )),
    tags(
        (name = "media", description = "Media records and content"),
        (name = "uploads", description = "Chunked uploads and progress"),
        (name = "health", description = "Service health")
    )
)]
pub struct ApiDoc;
