use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

/// Media kind enum
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "media_kind", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Image => "image",
            MediaKind::Video => "video",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "image" => Some(MediaKind::Image),
            "video" => Some(MediaKind::Video),
            _ => None,
        }
    }
}

/// Lifecycle of a media record.
///
/// Transitions are monotone along `pending -> processing -> (ready | failed)`; `deleted` is
/// absorbing and reachable from every other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(
    feature = "sqlx",
    sqlx(type_name = "media_status", rename_all = "lowercase")
)]
#[serde(rename_all = "lowercase")]
pub enum MediaStatus {
    Pending,
    Processing,
    Ready,
    Failed,
    Deleted,
}

impl MediaStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaStatus::Pending => "pending",
            MediaStatus::Processing => "processing",
            MediaStatus::Ready => "ready",
            MediaStatus::Failed => "failed",
            MediaStatus::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "pending" => Some(MediaStatus::Pending),
            "processing" => Some(MediaStatus::Processing),
            "ready" => Some(MediaStatus::Ready),
            "failed" => Some(MediaStatus::Failed),
            "deleted" => Some(MediaStatus::Deleted),
            _ => None,
        }
    }

    /// Whether a write moving a record from `self` to `next` is legal.
    ///
    /// Self-transitions are allowed for `processing` (a stale claim being re-taken) and
    /// `ready` (derivative keys filled in by a retry).
    pub fn can_transition_to(self, next: MediaStatus) -> bool {
        use MediaStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Processing)
                | (Processing, Ready)
                | (Processing, Failed)
                | (Ready, Ready)
                | (Pending, Deleted)
                | (Processing, Deleted)
                | (Ready, Deleted)
                | (Failed, Deleted)
        )
    }

    pub fn is_visible(self) -> bool {
        self != MediaStatus::Deleted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    Landscape,
    Portrait,
    Square,
}

impl Orientation {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        match width.cmp(&height) {
            std::cmp::Ordering::Greater => Orientation::Landscape,
            std::cmp::Ordering::Less => Orientation::Portrait,
            std::cmp::Ordering::Equal => Orientation::Square,
        }
    }
}

/// Attributes extracted by a deriver. Sparse by kind; unknown values stay `None`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framerate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aspect_ratio: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orientation: Option<Orientation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

impl MediaAttributes {
    /// Width, height, aspect ratio and orientation from pixel dimensions.
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        Self {
            width: Some(width),
            height: Some(height),
            aspect_ratio: (height != 0).then(|| width as f64 / height as f64),
            orientation: Some(Orientation::from_dimensions(width, height)),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &MediaAttributes::default()
    }
}

/// Authenticated caller on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub user_id: String,
    pub user_name: Option<String>,
}

impl Principal {
    pub fn new(user_id: impl Into<String>, user_name: Option<String>) -> Self {
        Self {
            user_id: user_id.into(),
            user_name,
        }
    }

    pub fn owns(&self, record: &MediaRecord) -> bool {
        self.user_id == record.owner_id
    }
}

/// Client-supplied display metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayMetadata {
    pub title: String,
    pub description: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
}

/// Authoritative metadata for an ingested media object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaRecord {
    pub id: String,
    pub owner_id: String,
    pub owner_name: Option<String>,
    pub original_filename: String,
    pub title: String,
    pub description: String,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub mime_type: String,
    pub kind: MediaKind,
    pub storage_key: String,
    pub thumbnail_key: Option<String>,
    pub optimized_key: Option<String>,
    pub size_bytes: u64,
    pub attributes: MediaAttributes,
    pub status: MediaStatus,
    pub failure_reason: Option<String>,
    /// Set when derivation was skipped for lack of a transcoder; the janitor retries these.
    pub derivatives_pending: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Everything the upload coordinator knows when registering a new original.
#[derive(Debug, Clone)]
pub struct NewMediaRecord {
    pub id: String,
    pub owner_id: String,
    pub owner_name: Option<String>,
    pub original_filename: String,
    pub display: DisplayMetadata,
    pub mime_type: String,
    pub kind: MediaKind,
    pub storage_key: String,
    pub size_bytes: u64,
}

impl MediaRecord {
    pub fn new_pending(new: NewMediaRecord, now: DateTime<Utc>) -> Self {
        Self {
            id: new.id,
            owner_id: new.owner_id,
            owner_name: new.owner_name,
            original_filename: new.original_filename,
            title: new.display.title,
            description: new.display.description,
            categories: new.display.categories,
            tags: new.display.tags,
            mime_type: new.mime_type,
            kind: new.kind,
            storage_key: new.storage_key,
            thumbnail_key: None,
            optimized_key: None,
            size_bytes: new.size_bytes,
            attributes: MediaAttributes::default(),
            status: MediaStatus::Pending,
            failure_reason: None,
            derivatives_pending: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Derivative keys currently recorded (thumbnail first).
    pub fn derivative_keys(&self) -> Vec<String> {
        self.thumbnail_key
            .iter()
            .chain(self.optimized_key.iter())
            .cloned()
            .collect()
    }

    /// Every key owned by this record, in deletion order: derivatives, then the original.
    pub fn keys_in_deletion_order(&self) -> Vec<String> {
        let mut keys = self.derivative_keys();
        keys.push(self.storage_key.clone());
        keys
    }

    pub fn references_key(&self, key: &str) -> bool {
        self.storage_key == key
            || self.thumbnail_key.as_deref() == Some(key)
            || self.optimized_key.as_deref() == Some(key)
    }
}

/// Outcome of a completed derivation, committed in a single repository update.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DerivationOutcome {
    pub attributes: MediaAttributes,
    pub thumbnail_key: Option<String>,
    pub optimized_key: Option<String>,
    pub derivatives_pending: bool,
}

/// Partial update of display metadata (owner-only).
#[derive(Debug, Clone, Default, Deserialize, Validate, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMediaRequest {
    #[validate(length(max = 255))]
    pub title: Option<String>,
    #[validate(length(max = 5000))]
    pub description: Option<String>,
    #[validate(length(max = 50))]
    pub categories: Option<Vec<String>>,
    #[validate(length(max = 50))]
    pub tags: Option<Vec<String>>,
}

impl UpdateMediaRequest {
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.description.is_none()
            && self.categories.is_none()
            && self.tags.is_none()
    }

    pub fn apply_to(self, record: &mut MediaRecord) {
        if let Some(title) = self.title {
            record.title = title;
        }
        if let Some(description) = self.description {
            record.description = description;
        }
        if let Some(categories) = self.categories {
            record.categories = categories;
        }
        if let Some(tags) = self.tags {
            record.tags = tags;
        }
    }
}

/// JSON projection of a media record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaResponse {
    pub id: String,
    pub title: String,
    pub description: String,
    pub original_filename: String,
    /// Storage key of the original
    pub file_path: String,
    #[serde(rename = "type")]
    pub kind: MediaKind,
    pub user_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub status: MediaStatus,
    pub categories: Vec<String>,
    pub tags: Vec<String>,
    pub uploaded_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub metadata: MediaAttributes,
    pub file_size: u64,
    pub mime_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub optimized_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default)]
    pub derivatives_pending: bool,
}

impl From<MediaRecord> for MediaResponse {
    fn from(record: MediaRecord) -> Self {
        Self {
            id: record.id,
            title: record.title,
            description: record.description,
            original_filename: record.original_filename,
            file_path: record.storage_key,
            kind: record.kind,
            user_id: record.owner_id,
            user_name: record.owner_name,
            status: record.status,
            categories: record.categories,
            tags: record.tags,
            uploaded_at: record.created_at,
            updated_at: record.updated_at,
            metadata: record.attributes,
            file_size: record.size_bytes,
            mime_type: record.mime_type,
            thumbnail_path: record.thumbnail_key,
            optimized_path: record.optimized_key,
            failure_reason: record.failure_reason,
            derivatives_pending: record.derivatives_pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> MediaRecord {
        MediaRecord::new_pending(
            NewMediaRecord {
                id: "m1".into(),
                owner_id: "u1".into(),
                owner_name: Some("Ada".into()),
                original_filename: "cat.png".into(),
                display: DisplayMetadata {
                    title: "t".into(),
                    ..Default::default()
                },
                mime_type: "image/png".into(),
                kind: MediaKind::Image,
                storage_key: "2024/01/02/u1/m1.png".into(),
                size_bytes: 70,
            },
            Utc::now(),
        )
    }

    #[test]
    fn test_status_transitions_are_monotone() {
        use MediaStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Ready));
        assert!(Processing.can_transition_to(Failed));
        assert!(!Ready.can_transition_to(Processing));
        assert!(!Failed.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Deleted.can_transition_to(Pending));
        assert!(!Deleted.can_transition_to(Deleted));
        for status in [Pending, Processing, Ready, Failed] {
            assert!(status.can_transition_to(Deleted));
        }
    }

    #[test]
    fn test_orientation_and_aspect_ratio() {
        let square = MediaAttributes::from_dimensions(3, 3);
        assert_eq!(square.orientation, Some(Orientation::Square));
        assert_eq!(square.aspect_ratio, Some(1.0));

        let wide = MediaAttributes::from_dimensions(1920, 1080);
        assert_eq!(wide.orientation, Some(Orientation::Landscape));

        let degenerate = MediaAttributes::from_dimensions(10, 0);
        assert_eq!(degenerate.aspect_ratio, None);
        assert_eq!(degenerate.orientation, Some(Orientation::Landscape));
    }

    #[test]
    fn test_deletion_order_puts_original_last() {
        let mut record = sample();
        record.thumbnail_key = Some("2024/01/02/u1/m1_thumb.jpg".into());
        record.optimized_key = Some("2024/01/02/u1/m1_opt.png".into());
        let keys = record.keys_in_deletion_order();
        assert_eq!(keys.len(), 3);
        assert_eq!(keys.last().unwrap(), "2024/01/02/u1/m1.png");
        assert!(record.references_key("2024/01/02/u1/m1_opt.png"));
        assert!(!record.references_key("2024/01/02/u1/other.png"));
    }

    #[test]
    fn test_response_projection_field_names() {
        let mut record = sample();
        record.attributes = MediaAttributes::from_dimensions(3, 3);
        let json = serde_json::to_value(MediaResponse::from(record)).unwrap();
        assert_eq!(json["type"], "image");
        assert_eq!(json["fileSize"], 70);
        assert_eq!(json["userId"], "u1");
        assert_eq!(json["status"], "pending");
        assert_eq!(json["metadata"]["orientation"], "square");
        assert!(json.get("thumbnailPath").is_none());
    }

    #[test]
    fn test_update_request_applies_only_present_fields() {
        let mut record = sample();
        UpdateMediaRequest {
            description: Some("new".into()),
            ..Default::default()
        }
        .apply_to(&mut record);
        assert_eq!(record.title, "t");
        assert_eq!(record.description, "new");
    }
}
