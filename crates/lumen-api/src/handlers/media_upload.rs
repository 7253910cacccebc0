//! Single-shot multipart upload of one or many files.
//!
//! Text fields describe the files that follow them: request-level `title`, `description`,
//! `category` and `tags` apply to every file, `files[i].<field>` overrides them for the
//! i-th file. Each file is streamed into the coordinator while it is still being received.

use crate::auth::AuthPrincipal;
use crate::error::{ErrorResponse, HttpAppError};
use crate::state::AppState;
use axum::{
    extract::{multipart::Field, Multipart, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use bytes::Bytes;
use futures::channel::mpsc;
use futures::SinkExt;
use lumen_core::models::{DisplayMetadata, MediaRecord, MediaResponse, UploadBatchResponse};
use lumen_core::{AppError, ErrorMetadata};
use lumen_services::IngestRequest;
use lumen_storage::ByteReader;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::io::StreamReader;

/// Multipart chunks buffered between the request body and the content store.
const PIPE_DEPTH: usize = 4;

/// Display fields for one file, or the request-level defaults.
#[derive(Debug, Clone, Default)]
struct FileFields {
    title: Option<String>,
    description: Option<String>,
    category: Option<String>,
    tags: Option<String>,
    upload_id: Option<String>,
}

impl FileFields {
    fn set(&mut self, key: &str, value: String) {
        match key {
            "title" => self.title = Some(value),
            "description" => self.description = Some(value),
            "category" | "categories" => self.category = Some(value),
            "tags" => self.tags = Some(value),
            "uploadId" => self.upload_id = Some(value),
            other => tracing::debug!(field = other, "Ignoring unknown upload field"),
        }
    }

    /// Overrides win; anything unset falls back to `defaults`.
    fn display(&self, defaults: &FileFields) -> DisplayMetadata {
        let pick = |own: &Option<String>, fallback: &Option<String>| {
            own.clone().or_else(|| fallback.clone()).unwrap_or_default()
        };
        DisplayMetadata {
            title: pick(&self.title, &defaults.title),
            description: pick(&self.description, &defaults.description),
            categories: split_list(&pick(&self.category, &defaults.category)),
            tags: split_list(&pick(&self.tags, &defaults.tags)),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// `files[3].title` -> `(3, "title")`
fn indexed_field(name: &str) -> Option<(usize, &str)> {
    let rest = name.strip_prefix("files[")?;
    let (index, key) = rest.split_once("].")?;
    Some((index.parse().ok()?, key))
}

fn is_file_field(name: &str) -> bool {
    name == "file" || name == "files"
}

#[utoipa::path(
    post,
    path = "/api/media/upload",
    tag = "media",
    request_body(content_type = "multipart/form-data", description = "One or more `file` parts plus display fields"),
    responses(
        (status = 201, description = "At least one file stored", body = UploadBatchResponse),
        (status = 400, description = "Every file was rejected", body = ErrorResponse),
        (status = 401, description = "Missing credentials", body = ErrorResponse)
    )
)]
pub async fn upload_media(
    AuthPrincipal(principal): AuthPrincipal,
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, HttpAppError> {
    let mut defaults = FileFields::default();
    let mut overrides: HashMap<usize, FileFields> = HashMap::new();
    let mut file_index = 0usize;
    let mut request_upload_id_used = false;

    let mut uploaded: Vec<MediaResponse> = Vec::new();
    let mut errors: Vec<String> = Vec::new();
    let mut first_error: Option<AppError> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::InvalidInput(format!("Failed to read multipart: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if is_file_field(&name) {
            let fields = overrides.remove(&file_index).unwrap_or_default();
            let progress_key = match fields.upload_id.clone() {
                Some(id) => Some(id),
                None if !request_upload_id_used => {
                    request_upload_id_used = true;
                    defaults.upload_id.clone()
                }
                None => None,
            };
            let filename = field.file_name().unwrap_or_default().to_string();
            let request = IngestRequest {
                owner: principal.clone(),
                filename: filename.clone(),
                content_type: field.content_type().map(str::to_string),
                declared_size: None,
                display: fields.display(&defaults),
                progress_key,
            };

            match ingest_field(&state, request, field).await {
                Ok(record) => uploaded.push(MediaResponse::from(record)),
                Err(e) => {
                    tracing::info!(filename = %filename, error = %e, "File rejected");
                    errors.push(format!("{}: {}", filename, e.client_message()));
                    first_error.get_or_insert(e);
                }
            }
            file_index += 1;
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| AppError::InvalidInput(format!("Failed to read field {}: {}", name, e)))?;
        match indexed_field(&name) {
            Some((index, key)) => overrides.entry(index).or_default().set(key, value),
            None => defaults.set(&name, value),
        }
    }

    if file_index == 0 {
        return Err(AppError::InvalidInput("No file provided".to_string()).into());
    }
    if uploaded.is_empty() {
        if let Some(error) = first_error {
            return Err(error.into());
        }
    }

    let successful_uploads = uploaded.len();
    let failed_uploads = errors.len();
    let message = if failed_uploads == 0 {
        format!("Successfully uploaded {} file(s)", successful_uploads)
    } else {
        format!(
            "Uploaded {} of {} file(s)",
            successful_uploads,
            successful_uploads + failed_uploads
        )
    };
    tracing::info!(
        user_id = %principal.user_id,
        successful_uploads,
        failed_uploads,
        "Upload request finished"
    );

    Ok((
        StatusCode::CREATED,
        Json(UploadBatchResponse {
            success: true,
            message,
            uploaded_media: uploaded,
            successful_uploads,
            failed_uploads,
            errors,
        }),
    ))
}

/// Stream one file part into the coordinator.
async fn ingest_field(
    state: &AppState,
    request: IngestRequest,
    field: Field<'_>,
) -> Result<MediaRecord, AppError> {
    let (tx, rx) = mpsc::channel::<Result<Bytes, std::io::Error>>(PIPE_DEPTH);
    let reader: ByteReader = Box::pin(StreamReader::new(rx));

    let (pumped, stored) = tokio::join!(pump(field, tx), state.uploads.upload(request, reader));
    match (stored, pumped) {
        (Ok(record), _) => Ok(record),
        // A truncated body is the root cause of whatever the store reported.
        (Err(_), Err(read_error)) => Err(read_error),
        (Err(e), Ok(())) => Err(e),
    }
}

/// Forward a multipart field into the pipe. Returns early once the reader is gone.
async fn pump(
    mut field: Field<'_>,
    mut tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
) -> Result<(), AppError> {
    loop {
        match field.chunk().await {
            Ok(Some(chunk)) => {
                if tx.send(Ok(chunk)).await.is_err() {
                    return Ok(());
                }
            }
            Ok(None) => return Ok(()),
            Err(e) => {
                let _ = tx.send(Err(std::io::Error::other(e.to_string()))).await;
                return Err(AppError::InvalidInput(format!(
                    "Failed to read file data: {}",
                    e
                )));
            }
        }
    }
}
