use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::{Validate, ValidationError};

use super::media::{DisplayMetadata, MediaResponse};
use crate::ids::is_url_safe_id;

/// Upper bound on chunks per session.
pub const MAX_CHUNK_COUNT: u32 = 10_000;

fn validate_upload_id(id: &str) -> Result<(), ValidationError> {
    if is_url_safe_id(id) {
        Ok(())
    } else {
        Err(ValidationError::new("upload_id")
            .with_message("uploadId must be 1-128 characters of [A-Za-z0-9_-]".into()))
    }
}

/// Request to begin a chunked upload
#[derive(Debug, Clone, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StartChunkedUploadRequest {
    /// Client-chosen session id; generated when absent
    #[serde(default)]
    #[validate(custom(function = "validate_upload_id"))]
    pub upload_id: Option<String>,
    #[validate(length(
        min = 1,
        max = 255,
        message = "Filename must be between 1 and 255 characters"
    ))]
    pub file_name: String,
    #[validate(range(min = 1, message = "File size must be at least 1 byte"))]
    pub file_size: u64,
    #[validate(range(min = 1, max = 10000, message = "totalChunks must be between 1 and 10000"))]
    pub total_chunks: u32,
    #[validate(range(min = 1, message = "chunkSize must be at least 1 byte"))]
    pub chunk_size: u64,
    #[serde(default)]
    #[validate(length(max = 255))]
    pub title: String,
    #[serde(default)]
    #[validate(length(max = 5000))]
    pub description: String,
    #[serde(default)]
    pub categories: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl StartChunkedUploadRequest {
    pub fn display(&self) -> DisplayMetadata {
        DisplayMetadata {
            title: self.title.clone(),
            description: self.description.clone(),
            categories: self.categories.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Acknowledgement returned by chunked-upload start and chunk requests
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub upload_id: String,
    pub chunk_index: u32,
    pub received: bool,
    /// Fraction of bytes received in [0, 1]
    pub progress: f64,
    pub is_complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Result of a (possibly multi-file) single-shot upload
#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UploadBatchResponse {
    pub success: bool,
    pub message: String,
    pub uploaded_media: Vec<MediaResponse>,
    pub successful_uploads: usize,
    pub failed_uploads: usize,
    pub errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> StartChunkedUploadRequest {
        serde_json::from_value(serde_json::json!({
            "fileName": "movie.mp4",
            "fileSize": 5_242_880u64,
            "totalChunks": 5,
            "chunkSize": 1_048_576u64,
            "title": "clip"
        }))
        .unwrap()
    }

    #[test]
    fn test_start_request_defaults() {
        let req = request();
        assert!(req.upload_id.is_none());
        assert!(req.categories.is_empty());
        assert!(req.validate().is_ok());
        assert_eq!(req.display().title, "clip");
    }

    #[test]
    fn test_start_request_rejects_unsafe_upload_id() {
        let mut req = request();
        req.upload_id = Some("../../etc".into());
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_start_request_rejects_zero_chunks() {
        let mut req = request();
        req.total_chunks = 0;
        assert!(req.validate().is_err());
    }

    #[test]
    fn test_ack_serializes_camel_case() {
        let ack = ChunkAck {
            upload_id: "u".into(),
            chunk_index: 0,
            received: false,
            progress: 0.0,
            is_complete: false,
            media_id: None,
            error_message: None,
        };
        let json = serde_json::to_value(ack).unwrap();
        assert_eq!(json["isComplete"], false);
        assert_eq!(json["chunkIndex"], 0);
    }
}
