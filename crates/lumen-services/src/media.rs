//! Lookup, listing, metadata updates, deletion and content streaming for media records.

use lumen_core::models::{
    ListFilter, MediaListQuery, MediaListResponse, MediaRecord, MediaResponse, Principal,
    UpdateMediaRequest,
};
use lumen_core::AppError;
use lumen_db::MediaRepository;
use lumen_storage::{Storage, StorageError, StoredObject};
use std::ops::Range;
use std::sync::Arc;
use validator::Validate;

/// Optimistic update attempts before giving up with `conflict`.
const UPDATE_ATTEMPTS: usize = 3;

/// A `Range` header that cannot be served for an object of `size` bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("Requested range not satisfiable for {size} bytes")]
pub struct RangeNotSatisfiable {
    pub size: u64,
}

/// Resolve a `Range` header against an object of `size` bytes.
///
/// Only single `bytes=` ranges are honoured. Headers in any other unit, multi-range
/// requests and malformed values are ignored and the whole object is served.
pub fn resolve_range(
    header: Option<&str>,
    size: u64,
) -> Result<Option<Range<u64>>, RangeNotSatisfiable> {
    let Some(spec) = header.and_then(|h| h.trim().strip_prefix("bytes=")) else {
        return Ok(None);
    };
    if spec.contains(',') {
        return Ok(None);
    }
    let Some((start, end)) = spec.trim().split_once('-') else {
        return Ok(None);
    };
    let (start, end) = (start.trim(), end.trim());

    let range = if start.is_empty() {
        // bytes=-n: the final n bytes
        let Ok(suffix) = end.parse::<u64>() else {
            return Ok(None);
        };
        if suffix == 0 || size == 0 {
            return Err(RangeNotSatisfiable { size });
        }
        size.saturating_sub(suffix)..size
    } else {
        let Ok(first) = start.parse::<u64>() else {
            return Ok(None);
        };
        let last = if end.is_empty() {
            size.saturating_sub(1)
        } else {
            match end.parse::<u64>() {
                Ok(last) if last >= first => last.min(size.saturating_sub(1)),
                _ => return Ok(None),
            }
        };
        if first >= size {
            return Err(RangeNotSatisfiable { size });
        }
        first..last + 1
    };
    Ok(Some(range))
}

/// An opened original or derivative ready to stream.
pub struct MediaContent {
    pub object: StoredObject,
    pub content_type: String,
    /// Served range, when the request asked for one.
    pub range: Option<Range<u64>>,
}

#[derive(Clone)]
pub struct MediaService {
    repository: Arc<dyn MediaRepository>,
    storage: Arc<dyn Storage>,
}

impl MediaService {
    pub fn new(repository: Arc<dyn MediaRepository>, storage: Arc<dyn Storage>) -> Self {
        Self {
            repository,
            storage,
        }
    }

    /// A visible record. Deleted records are `not-found`.
    #[tracing::instrument(skip(self))]
    pub async fn get(&self, id: &str) -> Result<MediaRecord, AppError> {
        self.repository
            .get(id)
            .await?
            .filter(|record| record.status.is_visible())
            .ok_or_else(|| AppError::NotFound(format!("Media {} not found", id)))
    }

    #[tracing::instrument(skip(self, query))]
    pub async fn list(&self, query: MediaListQuery) -> Result<MediaListResponse, AppError> {
        let filter: ListFilter = query.into_filter()?;
        let page = self.repository.list(&filter).await?;
        Ok(MediaListResponse {
            media: page.items.into_iter().map(MediaResponse::from).collect(),
            total: page.total,
            page: filter.page,
            limit: filter.limit,
            next_cursor: page.next_cursor,
        })
    }

    /// Owner-only patch of display metadata, retried on concurrent writes.
    #[tracing::instrument(skip(self, principal, request), fields(user_id = %principal.user_id))]
    pub async fn update(
        &self,
        principal: &Principal,
        id: &str,
        request: UpdateMediaRequest,
    ) -> Result<MediaRecord, AppError> {
        request.validate()?;

        let mut last_conflict = None;
        for _ in 0..UPDATE_ATTEMPTS {
            let current = self.get(id).await?;
            if !principal.owns(&current) {
                return Err(AppError::Unauthorized(format!(
                    "Only the owner may update media {}",
                    id
                )));
            }
            if request.is_empty() {
                return Ok(current);
            }

            let expected = current.updated_at;
            let mut next = current;
            request.clone().apply_to(&mut next);
            match self.repository.update(&next, expected).await {
                Ok(stored) => return Ok(stored),
                Err(AppError::Conflict(msg)) => {
                    tracing::debug!(media_id = %id, "Concurrent update, retrying");
                    last_conflict = Some(msg);
                }
                Err(e) => return Err(e),
            }
        }
        Err(AppError::Conflict(last_conflict.unwrap_or_else(|| {
            format!("Media {} changed concurrently", id)
        })))
    }

    /// Owner-only delete. The record is hidden first, then content goes in the order
    /// derivatives, original, row. A partial failure is finished later by the janitor.
    #[tracing::instrument(skip(self, principal), fields(user_id = %principal.user_id))]
    pub async fn delete(&self, principal: &Principal, id: &str) -> Result<(), AppError> {
        let current = self.get(id).await?;
        if !principal.owns(&current) {
            return Err(AppError::Unauthorized(format!(
                "Only the owner may delete media {}",
                id
            )));
        }

        let record = self.repository.mark_deleted(id).await?;
        if let Err(e) = self.purge(&record).await {
            tracing::warn!(
                media_id = %id,
                error = %e,
                "Media hidden but content removal incomplete; janitor will retry"
            );
        }
        Ok(())
    }

    /// Remove every object of `record`, then its row.
    pub async fn purge(&self, record: &MediaRecord) -> Result<(), AppError> {
        for key in record.keys_in_deletion_order() {
            self.storage.delete(&key).await?;
        }
        self.repository.delete(&record.id).await?;
        tracing::info!(media_id = %record.id, "Media removed");
        Ok(())
    }

    /// Open the original, or the resolved part of it.
    #[tracing::instrument(skip(self, range_header))]
    pub async fn open_original(
        &self,
        id: &str,
        range_header: Option<&str>,
    ) -> Result<Result<MediaContent, RangeNotSatisfiable>, AppError> {
        let record = self.get(id).await?;
        let size = self.storage.size(&record.storage_key).await.map_err(missing_content)?;

        let range = match resolve_range(range_header, size) {
            Ok(range) => range,
            Err(unsatisfiable) => return Ok(Err(unsatisfiable)),
        };
        let object = match &range {
            Some(range) => self.storage.get_range(&record.storage_key, range.clone()).await,
            None => self.storage.get_stream(&record.storage_key).await,
        }
        .map_err(missing_content)?;

        Ok(Ok(MediaContent {
            object,
            content_type: record.mime_type,
            range,
        }))
    }

    /// Open the JPEG thumbnail. Records without one are `not-found`.
    #[tracing::instrument(skip(self))]
    pub async fn open_thumbnail(&self, id: &str) -> Result<MediaContent, AppError> {
        let record = self.get(id).await?;
        let key = record
            .thumbnail_key
            .ok_or_else(|| AppError::NotFound(format!("Media {} has no thumbnail", id)))?;
        let object = self.storage.get_stream(&key).await.map_err(missing_content)?;
        Ok(MediaContent {
            object,
            content_type: "image/jpeg".to_string(),
            range: None,
        })
    }
}

fn missing_content(error: StorageError) -> AppError {
    match error {
        StorageError::NotFound(key) => AppError::NotFound(format!("Content {} not found", key)),
        other => other.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::Utc;
    use lumen_core::models::{DisplayMetadata, MediaKind, MediaStatus, NewMediaRecord};
    use lumen_db::InMemoryMediaRepository;
    use lumen_storage::LocalStorage;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_resolve_range_forms() {
        assert_eq!(resolve_range(None, 100), Ok(None));
        assert_eq!(resolve_range(Some("bytes=0-9"), 100), Ok(Some(0..10)));
        assert_eq!(resolve_range(Some("bytes=90-"), 100), Ok(Some(90..100)));
        assert_eq!(resolve_range(Some("bytes=-10"), 100), Ok(Some(90..100)));
        assert_eq!(resolve_range(Some("bytes=-500"), 100), Ok(Some(0..100)));
        assert_eq!(resolve_range(Some("bytes=50-500"), 100), Ok(Some(50..100)));
        assert_eq!(resolve_range(Some("bytes=0-1,4-5"), 100), Ok(None));
        assert_eq!(resolve_range(Some("items=0-1"), 100), Ok(None));
        assert_eq!(resolve_range(Some("bytes=9-3"), 100), Ok(None));
        assert_eq!(
            resolve_range(Some("bytes=100-"), 100),
            Err(RangeNotSatisfiable { size: 100 })
        );
        assert_eq!(
            resolve_range(Some("bytes=-0"), 100),
            Err(RangeNotSatisfiable { size: 100 })
        );
    }

    struct Fixture {
        _dir: TempDir,
        repository: Arc<InMemoryMediaRepository>,
        storage: Arc<LocalStorage>,
        service: MediaService,
    }

    async fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let storage = Arc::new(
            LocalStorage::new(dir.path(), "/media".to_string())
                .await
                .unwrap(),
        );
        let repository = Arc::new(InMemoryMediaRepository::new());
        let service = MediaService::new(repository.clone(), storage.clone());
        Fixture {
            _dir: dir,
            repository,
            storage,
            service,
        }
    }

    async fn seed(f: &Fixture, id: &str, owner: &str, with_thumbnail: bool) -> MediaRecord {
        let key = format!("2024/01/01/{}/{}.png", owner, id);
        f.storage
            .put_bytes(&key, "image/png", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();
        let mut record = MediaRecord::new_pending(
            NewMediaRecord {
                id: id.to_string(),
                owner_id: owner.to_string(),
                owner_name: None,
                original_filename: "a.png".to_string(),
                display: DisplayMetadata {
                    title: "before".to_string(),
                    ..Default::default()
                },
                mime_type: "image/png".to_string(),
                kind: MediaKind::Image,
                storage_key: key.clone(),
                size_bytes: 10,
            },
            Utc::now(),
        );
        if with_thumbnail {
            let thumb = lumen_storage::thumbnail_key(&key);
            f.storage
                .put_bytes(&thumb, "image/jpeg", Bytes::from_static(b"\xFF\xD8\xFFjpg"))
                .await
                .unwrap();
            record.thumbnail_key = Some(thumb);
        }
        f.repository.create(&record).await.unwrap();
        record
    }

    async fn drain(content: MediaContent) -> Vec<u8> {
        let mut out = Vec::new();
        content
            .object
            .into_reader()
            .read_to_end(&mut out)
            .await
            .unwrap();
        out
    }

    #[tokio::test]
    async fn test_update_is_owner_only() {
        let f = fixture().await;
        seed(&f, "m1", "u1", false).await;

        let request = UpdateMediaRequest {
            title: Some("after".to_string()),
            tags: Some(vec!["cats".to_string()]),
            ..Default::default()
        };
        let err = f
            .service
            .update(&Principal::new("u2", None), "m1", request.clone())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        let updated = f
            .service
            .update(&Principal::new("u1", None), "m1", request)
            .await
            .unwrap();
        assert_eq!(updated.title, "after");
        assert_eq!(updated.tags, vec!["cats".to_string()]);
        assert_eq!(f.service.get("m1").await.unwrap().title, "after");

        let too_long = UpdateMediaRequest {
            title: Some("x".repeat(300)),
            ..Default::default()
        };
        let err = f
            .service
            .update(&Principal::new("u1", None), "m1", too_long)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn test_delete_removes_content_then_row() {
        let f = fixture().await;
        let record = seed(&f, "m1", "u1", true).await;
        let owner = Principal::new("u1", None);

        let err = f
            .service
            .delete(&Principal::new("u2", None), "m1")
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Unauthorized(_)));

        f.service.delete(&owner, "m1").await.unwrap();
        assert!(matches!(f.service.get("m1").await, Err(AppError::NotFound(_))));
        for key in record.keys_in_deletion_order() {
            assert!(!f.storage.exists(&key).await.unwrap());
        }
        assert!(f.repository.get("m1").await.unwrap().is_none());

        let again = f.service.delete(&owner, "m1").await.unwrap_err();
        assert!(matches!(again, AppError::NotFound(_)));
        assert!(matches!(
            f.service.open_original("m1", None).await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_streaming_with_ranges() {
        let f = fixture().await;
        seed(&f, "m1", "u1", false).await;

        let whole = f.service.open_original("m1", None).await.unwrap().unwrap();
        assert_eq!(whole.content_type, "image/png");
        assert!(whole.range.is_none());
        assert_eq!(drain(whole).await, b"0123456789");

        let part = f
            .service
            .open_original("m1", Some("bytes=2-4"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(part.range, Some(2..5));
        assert_eq!(part.object.total_size, 10);
        assert_eq!(drain(part).await, b"234");

        let unsatisfiable = f
            .service
            .open_original("m1", Some("bytes=10-"))
            .await
            .unwrap();
        assert!(matches!(unsatisfiable, Err(RangeNotSatisfiable { size: 10 })));
    }

    #[tokio::test]
    async fn test_thumbnail_lookup() {
        let f = fixture().await;
        seed(&f, "with", "u1", true).await;
        seed(&f, "without", "u1", false).await;

        let thumb = f.service.open_thumbnail("with").await.unwrap();
        assert_eq!(thumb.content_type, "image/jpeg");
        assert!(matches!(
            f.service.open_thumbnail("without").await,
            Err(AppError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_list_hides_deleted() {
        let f = fixture().await;
        seed(&f, "m1", "u1", false).await;
        seed(&f, "m2", "u1", false).await;
        f.repository.mark_deleted("m2").await.unwrap();

        let listed = f.service.list(MediaListQuery::default()).await.unwrap();
        assert_eq!(listed.total, 1);
        assert_eq!(listed.media[0].id, "m1");
        assert_eq!(listed.page, 1);
        assert_eq!(listed.limit, 20);
        assert_eq!(listed.media[0].status, MediaStatus::Pending);
    }
}
