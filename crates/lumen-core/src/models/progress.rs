use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ProgressPhase {
    Uploading,
    Processing,
    Completed,
    Failed,
}

impl ProgressPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, ProgressPhase::Completed | ProgressPhase::Failed)
    }
}

/// Point-in-time progress of one upload session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub upload_id: String,
    pub uploaded_bytes: u64,
    pub total_bytes: u64,
    /// Fraction complete in [0, 1]
    pub progress: f64,
    pub phase: ProgressPhase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_id: Option<String>,
    pub time: DateTime<Utc>,
}

impl ProgressSnapshot {
    pub fn new(
        upload_id: impl Into<String>,
        uploaded_bytes: u64,
        total_bytes: u64,
        phase: ProgressPhase,
    ) -> Self {
        Self {
            upload_id: upload_id.into(),
            uploaded_bytes,
            total_bytes,
            progress: fraction(uploaded_bytes, total_bytes),
            phase,
            error: None,
            media_id: None,
            time: Utc::now(),
        }
    }

    pub fn with_media_id(mut self, media_id: impl Into<String>) -> Self {
        self.media_id = Some(media_id.into());
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }
}

/// `done / total` clamped to [0, 1]; an empty total counts as complete.
pub fn fraction(done: u64, total: u64) -> f64 {
    if total == 0 {
        return 1.0;
    }
    (done as f64 / total as f64).clamp(0.0, 1.0)
}
