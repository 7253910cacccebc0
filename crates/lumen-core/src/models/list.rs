use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};

use super::media::{MediaKind, MediaRecord, MediaResponse, MediaStatus};
use crate::error::AppError;

pub const DEFAULT_PAGE_SIZE: u32 = 20;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortField {
    #[default]
    UploadedAt,
    Title,
    FileSize,
    Status,
}

impl SortField {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "uploaded_at" | "uploadedAt" | "created_at" => Some(SortField::UploadedAt),
            "title" => Some(SortField::Title),
            "file_size" | "fileSize" => Some(SortField::FileSize),
            "status" => Some(SortField::Status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

/// Continuation marker for the default (newest first) ordering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub id: String,
}

impl ListCursor {
    pub fn after(record: &MediaRecord) -> Self {
        Self {
            created_at: record.created_at,
            id: record.id.clone(),
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!(
            "{}|{}",
            self.created_at.timestamp_nanos_opt().unwrap_or_default(),
            self.id
        );
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(token: &str) -> Result<Self, AppError> {
        let invalid = || AppError::InvalidInput("Invalid list cursor".to_string());
        let bytes = URL_SAFE_NO_PAD.decode(token).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (nanos, id) = raw.split_once('|').ok_or_else(invalid)?;
        let nanos: i64 = nanos.parse().map_err(|_| invalid())?;
        if id.is_empty() {
            return Err(invalid());
        }
        Ok(Self {
            created_at: DateTime::from_timestamp_nanos(nanos),
            id: id.to_string(),
        })
    }

    /// Whether `record` sorts strictly after this cursor in newest-first order.
    pub fn precedes(&self, record: &MediaRecord) -> bool {
        record.created_at < self.created_at
            || (record.created_at == self.created_at && record.id < self.id)
    }
}

/// Query string accepted by the list endpoint.
#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct MediaListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    /// `image` or `video`
    #[serde(alias = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
    /// Owner id filter
    #[serde(alias = "userId")]
    pub owner: Option<String>,
    /// Case-insensitive match on title or description
    pub search: Option<String>,
    #[serde(alias = "categories")]
    pub category: Option<String>,
    pub sort_by: Option<String>,
    pub sort_order: Option<String>,
    pub cursor: Option<String>,
}

/// Normalised list filter consumed by the metadata repository.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub owner: Option<String>,
    pub status: Option<MediaStatus>,
    pub kind: Option<MediaKind>,
    pub search: Option<String>,
    pub category: Option<String>,
    pub sort: SortField,
    pub order: SortOrder,
    pub page: u32,
    pub limit: u32,
    pub cursor: Option<ListCursor>,
}

impl ListFilter {
    pub fn offset(&self) -> u64 {
        if self.cursor.is_some() {
            0
        } else {
            (self.page.saturating_sub(1) as u64) * self.limit as u64
        }
    }

    pub fn uses_default_order(&self) -> bool {
        self.sort == SortField::UploadedAt && self.order == SortOrder::Desc
    }
}

impl MediaListQuery {
    pub fn into_filter(self) -> Result<ListFilter, AppError> {
        let page = self.page.unwrap_or(1).max(1);
        let limit = self
            .limit
            .unwrap_or(DEFAULT_PAGE_SIZE)
            .clamp(1, MAX_PAGE_SIZE);

        let kind = match self.kind.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(MediaKind::parse(raw).ok_or_else(|| {
                AppError::InvalidInput(format!("Invalid media kind: {}", raw))
            })?),
            None => None,
        };
        let status = match self.status.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => Some(MediaStatus::parse(raw).ok_or_else(|| {
                AppError::InvalidInput(format!("Invalid status: {}", raw))
            })?),
            None => None,
        };
        let sort = match self.sort_by.as_deref().filter(|s| !s.is_empty()) {
            Some(raw) => SortField::parse(raw)
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid sortBy: {}", raw)))?,
            None => SortField::default(),
        };
        let order = match self.sort_order.as_deref().map(str::to_lowercase).as_deref() {
            None | Some("") | Some("desc") => SortOrder::Desc,
            Some("asc") => SortOrder::Asc,
            Some(other) => {
                return Err(AppError::InvalidInput(format!("Invalid sortOrder: {}", other)))
            }
        };

        let filter = ListFilter {
            owner: self.owner.filter(|s| !s.is_empty()),
            status,
            kind,
            search: self
                .search
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            category: self.category.filter(|s| !s.is_empty()),
            sort,
            order,
            page,
            limit,
            cursor: match self.cursor.as_deref().filter(|s| !s.is_empty()) {
                Some(token) => Some(ListCursor::decode(token)?),
                None => None,
            },
        };

        if filter.cursor.is_some() && !filter.uses_default_order() {
            return Err(AppError::InvalidInput(
                "cursor is only valid with the default ordering".to_string(),
            ));
        }

        Ok(filter)
    }
}

/// One page of list results.
#[derive(Debug, Clone)]
pub struct MediaPage {
    pub items: Vec<MediaRecord>,
    pub total: u64,
    pub next_cursor: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct MediaListResponse {
    pub media: Vec<MediaResponse>,
    pub total: u64,
    pub page: u32,
    pub limit: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_and_clamping() {
        let filter = MediaListQuery {
            limit: Some(1000),
            page: Some(0),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(filter.limit, MAX_PAGE_SIZE);
        assert_eq!(filter.page, 1);
        assert_eq!(filter.offset(), 0);
        assert!(filter.uses_default_order());

        let filter = MediaListQuery::default().into_filter().unwrap();
        assert_eq!(filter.limit, DEFAULT_PAGE_SIZE);
    }

    #[test]
    fn test_rejects_unknown_filters() {
        let bad_kind = MediaListQuery {
            kind: Some("audio".into()),
            ..Default::default()
        };
        assert!(bad_kind.into_filter().is_err());

        let bad_sort = MediaListQuery {
            sort_by: Some("owner".into()),
            ..Default::default()
        };
        assert!(bad_sort.into_filter().is_err());
    }

    #[test]
    fn test_cursor_round_trip() {
        let cursor = ListCursor {
            created_at: DateTime::from_timestamp_nanos(1_700_000_000_123_456_789),
            id: "abc-1".into(),
        };
        let decoded = ListCursor::decode(&cursor.encode()).unwrap();
        assert_eq!(decoded, cursor);
        assert!(ListCursor::decode("not base64!").is_err());
    }

    #[test]
    fn test_cursor_requires_default_order() {
        let cursor = ListCursor {
            created_at: Utc::now(),
            id: "x".into(),
        };
        let query = MediaListQuery {
            cursor: Some(cursor.encode()),
            sort_by: Some("title".into()),
            ..Default::default()
        };
        assert!(query.into_filter().is_err());
    }
}
