//! In-process repository used when no database is configured, and by tests.

use super::repository::{ensure_transition, next_updated_at, truncate_micros, MediaRepository, OwnerUsage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lumen_core::models::{
    DerivationOutcome, ListCursor, ListFilter, MediaPage, MediaRecord, MediaStatus, SortField,
    SortOrder,
};
use lumen_core::AppError;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

#[derive(Default)]
pub struct InMemoryMediaRepository {
    records: RwLock<HashMap<String, MediaRecord>>,
}

impl InMemoryMediaRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn not_found(id: &str) -> AppError {
        AppError::NotFound(format!("Media {} not found", id))
    }

    fn matches(filter: &ListFilter, record: &MediaRecord) -> bool {
        if !record.status.is_visible() {
            return false;
        }
        if filter.owner.as_deref().is_some_and(|o| o != record.owner_id) {
            return false;
        }
        if filter.status.is_some_and(|s| s != record.status) {
            return false;
        }
        if filter.kind.is_some_and(|k| k != record.kind) {
            return false;
        }
        if let Some(category) = filter.category.as_deref() {
            if !record.categories.iter().any(|c| c == category) {
                return false;
            }
        }
        if let Some(search) = filter.search.as_deref() {
            let needle = search.to_lowercase();
            if !record.title.to_lowercase().contains(&needle)
                && !record.description.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        true
    }

    fn compare(sort: SortField, a: &MediaRecord, b: &MediaRecord) -> Ordering {
        let primary = match sort {
            SortField::UploadedAt => a.created_at.cmp(&b.created_at),
            SortField::Title => a.title.to_lowercase().cmp(&b.title.to_lowercase()),
            SortField::FileSize => a.size_bytes.cmp(&b.size_bytes),
            SortField::Status => a.status.as_str().cmp(b.status.as_str()),
        };
        primary.then_with(|| a.id.cmp(&b.id))
    }

    fn oldest_first(mut records: Vec<MediaRecord>, limit: usize) -> Vec<MediaRecord> {
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        records.truncate(limit);
        records
    }
}

#[async_trait]
impl MediaRepository for InMemoryMediaRepository {
    async fn create(&self, record: &MediaRecord) -> Result<(), AppError> {
        let mut records = self.records.write().await;
        if records.contains_key(&record.id) {
            return Err(AppError::Conflict(format!("Media {} already exists", record.id)));
        }
        if records.values().any(|r| r.storage_key == record.storage_key) {
            return Err(AppError::Conflict(format!(
                "Storage key {} already registered",
                record.storage_key
            )));
        }
        let mut stored = record.clone();
        stored.created_at = truncate_micros(stored.created_at);
        stored.updated_at = truncate_micros(stored.updated_at);
        records.insert(stored.id.clone(), stored);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Option<MediaRecord>, AppError> {
        Ok(self.records.read().await.get(id).cloned())
    }

    async fn update(
        &self,
        record: &MediaRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<MediaRecord, AppError> {
        let mut records = self.records.write().await;
        let current = records
            .get_mut(&record.id)
            .ok_or_else(|| Self::not_found(&record.id))?;

        if current.updated_at != truncate_micros(expected_updated_at) {
            return Err(AppError::Conflict(format!(
                "Media {} was modified concurrently",
                record.id
            )));
        }
        ensure_transition(current, record)?;

        let mut next = record.clone();
        next.created_at = current.created_at;
        next.updated_at = next_updated_at(current.updated_at);
        *current = next.clone();
        Ok(next)
    }

    async fn claim(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError> {
        let mut records = self.records.write().await;
        let Some(current) = records.get_mut(id) else {
            return Ok(None);
        };
        let claimable = match current.status {
            MediaStatus::Pending => true,
            MediaStatus::Processing => current.updated_at < stale_before,
            _ => false,
        };
        if !claimable {
            return Ok(None);
        }
        current.status = MediaStatus::Processing;
        current.updated_at = next_updated_at(current.updated_at);
        Ok(Some(current.clone()))
    }

    async fn claim_rederive(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError> {
        let mut records = self.records.write().await;
        let Some(current) = records.get_mut(id) else {
            return Ok(None);
        };
        if current.status != MediaStatus::Ready
            || !current.derivatives_pending
            || current.updated_at >= stale_before
        {
            return Ok(None);
        }
        current.updated_at = next_updated_at(current.updated_at);
        Ok(Some(current.clone()))
    }

    async fn complete_derivation(
        &self,
        id: &str,
        outcome: &DerivationOutcome,
    ) -> Result<MediaRecord, AppError> {
        let mut records = self.records.write().await;
        let current = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if !matches!(current.status, MediaStatus::Processing | MediaStatus::Ready) {
            return Err(AppError::Conflict(format!(
                "Media {} is {}; derivation result discarded",
                id,
                current.status.as_str()
            )));
        }
        current.attributes = outcome.attributes.clone();
        current.thumbnail_key = outcome.thumbnail_key.clone();
        current.optimized_key = outcome.optimized_key.clone();
        current.derivatives_pending = outcome.derivatives_pending;
        current.failure_reason = None;
        current.status = MediaStatus::Ready;
        current.updated_at = next_updated_at(current.updated_at);
        Ok(current.clone())
    }

    async fn fail_derivation(&self, id: &str, reason: &str) -> Result<MediaRecord, AppError> {
        let mut records = self.records.write().await;
        let current = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if current.status != MediaStatus::Processing {
            return Err(AppError::Conflict(format!(
                "Media {} is {}; failure not recorded",
                id,
                current.status.as_str()
            )));
        }
        current.status = MediaStatus::Failed;
        current.failure_reason = Some(reason.to_string());
        current.updated_at = next_updated_at(current.updated_at);
        Ok(current.clone())
    }

    async fn mark_deleted(&self, id: &str) -> Result<MediaRecord, AppError> {
        let mut records = self.records.write().await;
        let current = records.get_mut(id).ok_or_else(|| Self::not_found(id))?;
        if current.status == MediaStatus::Deleted {
            return Err(Self::not_found(id));
        }
        current.status = MediaStatus::Deleted;
        current.updated_at = next_updated_at(current.updated_at);
        Ok(current.clone())
    }

    async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.records.write().await.remove(id);
        Ok(())
    }

    async fn list(&self, filter: &ListFilter) -> Result<MediaPage, AppError> {
        let records = self.records.read().await;
        let mut matched: Vec<&MediaRecord> =
            records.values().filter(|r| Self::matches(filter, r)).collect();

        matched.sort_by(|a, b| {
            let ord = Self::compare(filter.sort, a, b);
            match filter.order {
                SortOrder::Asc => ord,
                SortOrder::Desc => ord.reverse(),
            }
        });

        let total = matched.len() as u64;
        let limit = filter.limit as usize;
        let window: Vec<&MediaRecord> = match &filter.cursor {
            Some(cursor) => matched
                .into_iter()
                .filter(|r| cursor.precedes(r))
                .take(limit + 1)
                .collect(),
            None => matched
                .into_iter()
                .skip(filter.offset() as usize)
                .take(limit + 1)
                .collect(),
        };

        let has_more = window.len() > limit;
        let items: Vec<MediaRecord> = window.into_iter().take(limit).cloned().collect();
        let next_cursor = match items.last() {
            Some(last) if has_more && filter.uses_default_order() => {
                Some(ListCursor::after(last).encode())
            }
            _ => None,
        };

        Ok(MediaPage {
            items,
            total,
            next_cursor,
        })
    }

    async fn list_stale(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let mut stale: Vec<MediaRecord> = records
            .values()
            .filter(|r| {
                matches!(r.status, MediaStatus::Pending | MediaStatus::Processing)
                    && r.updated_at < before
            })
            .cloned()
            .collect();
        stale.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then_with(|| a.id.cmp(&b.id)));
        stale.truncate(limit);
        Ok(stale)
    }

    async fn list_derivatives_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let pending = records
            .values()
            .filter(|r| {
                r.status == MediaStatus::Ready && r.derivatives_pending && r.updated_at < before
            })
            .cloned()
            .collect();
        Ok(Self::oldest_first(pending, limit))
    }

    async fn list_deleted(&self, limit: usize) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let deleted = records
            .values()
            .filter(|r| r.status == MediaStatus::Deleted)
            .cloned()
            .collect();
        Ok(Self::oldest_first(deleted, limit))
    }

    async fn list_created_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let old = records
            .values()
            .filter(|r| r.status.is_visible() && r.created_at < before)
            .cloned()
            .collect();
        Ok(Self::oldest_first(old, limit))
    }

    async fn usage_by_owner(&self) -> Result<Vec<OwnerUsage>, AppError> {
        let records = self.records.read().await;
        let mut usage: BTreeMap<&str, (u64, u64)> = BTreeMap::new();
        for record in records.values().filter(|r| r.status.is_visible()) {
            let entry = usage.entry(record.owner_id.as_str()).or_default();
            entry.0 += record.size_bytes;
            entry.1 += 1;
        }
        Ok(usage
            .into_iter()
            .map(|(owner, (total_bytes, count))| OwnerUsage {
                owner_id: owner.to_string(),
                total_bytes,
                records: count,
            })
            .collect())
    }

    async fn list_oldest_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let owned = records
            .values()
            .filter(|r| r.status.is_visible() && r.owner_id == owner_id)
            .cloned()
            .collect();
        Ok(Self::oldest_first(owned, limit))
    }

    async fn is_key_referenced(&self, key: &str) -> Result<bool, AppError> {
        Ok(self
            .records
            .read()
            .await
            .values()
            .any(|r| r.references_key(key)))
    }

    async fn list_ready(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let records = self.records.read().await;
        let mut ready: Vec<MediaRecord> = records
            .values()
            .filter(|r| r.status == MediaStatus::Ready)
            .filter(|r| after_id.is_none_or(|after| r.id.as_str() > after))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.id.cmp(&b.id));
        ready.truncate(limit);
        Ok(ready)
    }
}
