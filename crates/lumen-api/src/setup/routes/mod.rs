//! Route configuration and setup.
//!
//! Health checks live in [health](health).

pub mod health;

use crate::api_doc::ApiDoc;
use crate::constants::MEDIA_PREFIX;
use crate::handlers::{chunked_upload, media, media_stream, media_upload, progress};
use crate::state::AppState;
use axum::{
    extract::DefaultBodyLimit,
    http::{HeaderValue, Method},
    routing::{get, post},
    Json, Router,
};
use lumen_infra::{request_id_middleware, security_headers_middleware};
use std::sync::Arc;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use utoipa::OpenApi;

/// Setup all application routes
pub fn setup_routes(state: Arc<AppState>) -> Result<Router, anyhow::Error> {
    let cors = setup_cors(&state.config.cors_origins)?;
    let body_limit = state.config.max_request_body_bytes;
    let http_concurrency_limit = state.config.http_concurrency_limit;
    tracing::info!(
        http_concurrency_limit = http_concurrency_limit,
        "HTTP concurrency limit layer enabled"
    );

    let media_routes = Router::new()
        .route("/", get(media::list_media))
        .route("/upload", post(media_upload::upload_media))
        .route("/chunked/start", post(chunked_upload::start_chunked_upload))
        .route("/chunked/upload", post(chunked_upload::upload_chunk))
        .route("/progress/{upload_id}", get(progress::get_progress))
        .route("/stream/{id}", get(media_stream::stream_original_public))
        .route("/thumbnail/{id}", get(media_stream::thumbnail_public))
        .route(
            "/{id}",
            get(media::get_media)
                .put(media::update_media)
                .delete(media::delete_media),
        )
        .route("/{id}/stream", get(media_stream::stream_original))
        .route("/{id}/thumbnail", get(media_stream::thumbnail));

    let app = Router::new()
        .nest(MEDIA_PREFIX, media_routes)
        .route("/api/ws/upload-progress", get(progress::upload_progress_socket))
        .route("/health", get(health::health_check))
        .route("/api/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .layer(ConcurrencyLimitLayer::new(http_concurrency_limit))
        .layer(RequestBodyLimitLayer::new(body_limit))
        .layer(DefaultBodyLimit::disable())
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state);

    Ok(app)
}

fn setup_cors(origins: &[String]) -> Result<CorsLayer, anyhow::Error> {
    let methods = [
        Method::GET,
        Method::POST,
        Method::PUT,
        Method::DELETE,
        Method::OPTIONS,
    ];
    let cors = if origins.iter().any(|o| o == "*") {
        tracing::warn!("CORS configured to allow all origins - not recommended for production");
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(methods)
            .allow_headers(Any)
    } else {
        let origins = origins
            .iter()
            .map(|o| o.parse::<HeaderValue>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| anyhow::anyhow!("Invalid CORS origin: {}", e))?;
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(methods)
            .allow_headers(Any)
    };
    Ok(cors)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cors_rejects_invalid_origin() {
        assert!(setup_cors(&["https://ok.example".to_string()]).is_ok());
        assert!(setup_cors(&["*".to_string()]).is_ok());
        assert!(setup_cors(&["bad\norigin".to_string()]).is_err());
    }
}
