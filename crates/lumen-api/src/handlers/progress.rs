//! Upload progress: point-in-time lookup and the WebSocket push channel.

use crate::auth::AuthPrincipal;
use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use lumen_core::models::ProgressSnapshot;
use lumen_core::ErrorMetadata;
use serde::Deserialize;
use std::sync::Arc;

#[utoipa::path(
    get,
    path = "/api/media/progress/{upload_id}",
    tag = "uploads",
    params(("upload_id" = String, Path, description = "Upload ID")),
    responses(
        (status = 200, description = "Latest progress snapshot", body = ProgressSnapshot),
        (status = 404, description = "Unknown or expired upload", body = ErrorResponse)
    )
)]
pub async fn get_progress(
    _principal: AuthPrincipal,
    State(state): State<Arc<AppState>>,
    Path(upload_id): Path<String>,
) -> Result<impl IntoResponse, HttpAppError> {
    let snapshot = state.uploads.progress(&upload_id)?;
    Ok(Json(snapshot))
}

#[derive(Debug, Deserialize)]
pub struct ProgressSocketQuery {
    #[serde(rename = "uploadId", alias = "upload_id")]
    pub upload_id: Option<String>,
}

/// Push progress snapshots for one upload until it reaches a terminal phase.
pub async fn upload_progress_socket(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<ProgressSocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| push_progress(socket, state, query.upload_id))
}

async fn push_progress(mut socket: WebSocket, state: Arc<AppState>, upload_id: Option<String>) {
    let subscription = match upload_id.as_deref().map(str::trim).filter(|id| !id.is_empty()) {
        None => Err("uploadId is required".to_string()),
        Some(id) => state
            .uploads
            .bus()
            .subscribe(id)
            .map_err(|e| e.client_message()),
    };
    let mut subscription = match subscription {
        Ok(subscription) => subscription,
        Err(message) => {
            send_error_frame(&mut socket, &message).await;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };
    tracing::debug!(upload_id = %subscription.upload_id(), "Progress subscriber connected");

    loop {
        tokio::select! {
            snapshot = subscription.recv() => {
                let Some(snapshot) = snapshot else { break };
                let terminal = snapshot.is_terminal();
                match serde_json::to_string(&snapshot) {
                    Ok(text) => {
                        if socket.send(Message::Text(text.into())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to encode progress snapshot");
                        break;
                    }
                }
                if terminal {
                    break;
                }
            }
            incoming = socket.recv() => match incoming {
                // Dropping the subscription unregisters it from the bus.
                None | Some(Err(_)) | Some(Ok(Message::Close(_))) => return,
                Some(Ok(_)) => {}
            },
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_error_frame(socket: &mut WebSocket, message: &str) {
    let frame = serde_json::json!({
        "type": "error",
        "message": message,
        "time": Utc::now(),
    });
    let _ = socket.send(Message::Text(frame.to_string().into())).await;
}
