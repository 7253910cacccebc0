//! PostgreSQL-backed media repository.

use super::repository::{ensure_transition, MediaRepository, OwnerUsage};
use crate::db::transaction::TransactionGuard;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lumen_core::models::{
    DerivationOutcome, ListCursor, ListFilter, MediaAttributes, MediaKind, MediaPage,
    MediaRecord, MediaStatus, SortField, SortOrder,
};
use lumen_core::AppError;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};

const COLUMNS: &str = "id, owner_id, owner_name, original_filename, title, description, \
     categories, tags, mime_type, kind, storage_key, thumbnail_key, optimized_key, \
     size_bytes, attributes, status, failure_reason, derivatives_pending, created_at, updated_at";

/// Strictly newer than the stored stamp, even when the clock has not advanced.
const BUMP_UPDATED_AT: &str =
    "GREATEST(clock_timestamp(), updated_at + INTERVAL '1 microsecond')";

/// Row type for the media table.
#[derive(Debug, sqlx::FromRow)]
struct MediaRow {
    id: String,
    owner_id: String,
    owner_name: Option<String>,
    original_filename: String,
    title: String,
    description: String,
    categories: Vec<String>,
    tags: Vec<String>,
    mime_type: String,
    kind: MediaKind,
    storage_key: String,
    thumbnail_key: Option<String>,
    optimized_key: Option<String>,
    size_bytes: i64,
    attributes: Json<MediaAttributes>,
    status: MediaStatus,
    failure_reason: Option<String>,
    derivatives_pending: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl MediaRow {
    fn into_record(self) -> MediaRecord {
        MediaRecord {
            id: self.id,
            owner_id: self.owner_id,
            owner_name: self.owner_name,
            original_filename: self.original_filename,
            title: self.title,
            description: self.description,
            categories: self.categories,
            tags: self.tags,
            mime_type: self.mime_type,
            kind: self.kind,
            storage_key: self.storage_key,
            thumbnail_key: self.thumbnail_key,
            optimized_key: self.optimized_key,
            size_bytes: self.size_bytes.max(0) as u64,
            attributes: self.attributes.0,
            status: self.status,
            failure_reason: self.failure_reason,
            derivatives_pending: self.derivatives_pending,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn rows_to_records(rows: Vec<MediaRow>) -> Vec<MediaRecord> {
    rows.into_iter().map(MediaRow::into_record).collect()
}

fn size_to_db(size: u64) -> Result<i64, AppError> {
    i64::try_from(size).map_err(|_| AppError::InvalidInput(format!("Size {} is too large", size)))
}

fn limit_to_db(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn escape_like(raw: &str) -> String {
    raw.replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

fn map_write_error(err: sqlx::Error, id: &str) -> AppError {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            AppError::Conflict(format!("Media {} or its storage key already exists", id))
        }
        other => AppError::from(other),
    }
}

/// PostgreSQL media repository
#[derive(Clone)]
pub struct PgMediaRepository {
    pool: PgPool,
}

impl PgMediaRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Why a lifecycle CAS matched no row: missing id or a status that forbids the write.
    async fn explain_miss(&self, id: &str, action: &str) -> AppError {
        match self.get(id).await {
            Ok(Some(current)) => AppError::Conflict(format!(
                "Media {} is {}; {}",
                id,
                current.status.as_str(),
                action
            )),
            Ok(None) => AppError::NotFound(format!("Media {} not found", id)),
            Err(e) => e,
        }
    }

    fn push_filters(builder: &mut QueryBuilder<'_, Postgres>, filter: &ListFilter) {
        builder.push(" WHERE status <> 'deleted'");
        if let Some(owner) = &filter.owner {
            builder.push(" AND owner_id = ").push_bind(owner.clone());
        }
        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status);
        }
        if let Some(kind) = filter.kind {
            builder.push(" AND kind = ").push_bind(kind);
        }
        if let Some(category) = &filter.category {
            builder
                .push(" AND ")
                .push_bind(category.clone())
                .push(" = ANY(categories)");
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", escape_like(search));
            builder
                .push(" AND (title ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR description ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
    }

    fn order_clause(filter: &ListFilter) -> String {
        let column = match filter.sort {
            SortField::UploadedAt => "created_at",
            SortField::Title => "lower(title)",
            SortField::FileSize => "size_bytes",
            SortField::Status => "status::text",
        };
        let direction = match filter.order {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        };
        format!(" ORDER BY {} {}, id {}", column, direction, direction)
    }
}

#[async_trait]
impl MediaRepository for PgMediaRepository {
    #[tracing::instrument(skip(self, record), fields(db.table = "media", db.operation = "insert", db.record_id = %record.id))]
    async fn create(&self, record: &MediaRecord) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO media (
                id, owner_id, owner_name, original_filename, title, description,
                categories, tags, mime_type, kind, storage_key, thumbnail_key, optimized_key,
                size_bytes, attributes, status, failure_reason, derivatives_pending,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
            "#,
        )
        .bind(&record.id)
        .bind(&record.owner_id)
        .bind(&record.owner_name)
        .bind(&record.original_filename)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.categories)
        .bind(&record.tags)
        .bind(&record.mime_type)
        .bind(record.kind)
        .bind(&record.storage_key)
        .bind(&record.thumbnail_key)
        .bind(&record.optimized_key)
        .bind(size_to_db(record.size_bytes)?)
        .bind(Json(&record.attributes))
        .bind(record.status)
        .bind(&record.failure_reason)
        .bind(record.derivatives_pending)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_write_error(e, &record.id))?;

        Ok(())
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select", db.record_id = %id))]
    async fn get(&self, id: &str) -> Result<Option<MediaRecord>, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            "SELECT {} FROM media WHERE id = $1",
            COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MediaRow::into_record))
    }

    #[tracing::instrument(skip(self, record), fields(db.table = "media", db.operation = "update", db.record_id = %record.id))]
    async fn update(
        &self,
        record: &MediaRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<MediaRecord, AppError> {
        let mut tx = TransactionGuard::begin(&self.pool).await?;

        let current: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            "SELECT {} FROM media WHERE id = $1 FOR UPDATE",
            COLUMNS
        ))
        .bind(&record.id)
        .fetch_optional(tx.conn()?)
        .await?;

        let current = match current {
            Some(row) => row.into_record(),
            None => {
                tx.rollback().await?;
                return Err(AppError::NotFound(format!("Media {} not found", record.id)));
            }
        };

        if current.updated_at.timestamp_micros() != expected_updated_at.timestamp_micros() {
            tx.rollback().await?;
            return Err(AppError::Conflict(format!(
                "Media {} was modified concurrently",
                record.id
            )));
        }
        if let Err(e) = ensure_transition(&current, record) {
            tx.rollback().await?;
            return Err(e);
        }

        let row: MediaRow = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET
                owner_name = $2, title = $3, description = $4, categories = $5, tags = $6,
                thumbnail_key = $7, optimized_key = $8, attributes = $9, status = $10,
                failure_reason = $11, derivatives_pending = $12,
                updated_at = {}
            WHERE id = $1
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(&record.id)
        .bind(&record.owner_name)
        .bind(&record.title)
        .bind(&record.description)
        .bind(&record.categories)
        .bind(&record.tags)
        .bind(&record.thumbnail_key)
        .bind(&record.optimized_key)
        .bind(Json(&record.attributes))
        .bind(record.status)
        .bind(&record.failure_reason)
        .bind(record.derivatives_pending)
        .fetch_one(tx.conn()?)
        .await?;

        tx.commit().await?;
        Ok(row.into_record())
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "claim", db.record_id = %id))]
    async fn claim(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET status = 'processing', updated_at = {}
            WHERE id = $1
              AND (status = 'pending' OR (status = 'processing' AND updated_at < $2))
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MediaRow::into_record))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "claim", db.record_id = %id))]
    async fn claim_rederive(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET updated_at = {}
            WHERE id = $1 AND status = 'ready' AND derivatives_pending AND updated_at < $2
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(id)
        .bind(stale_before)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(MediaRow::into_record))
    }

    #[tracing::instrument(skip(self, outcome), fields(db.table = "media", db.operation = "update", db.record_id = %id))]
    async fn complete_derivation(
        &self,
        id: &str,
        outcome: &DerivationOutcome,
    ) -> Result<MediaRecord, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET
                status = 'ready', attributes = $2, thumbnail_key = $3, optimized_key = $4,
                derivatives_pending = $5, failure_reason = NULL, updated_at = {}
            WHERE id = $1 AND status IN ('processing', 'ready')
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(id)
        .bind(Json(&outcome.attributes))
        .bind(&outcome.thumbnail_key)
        .bind(&outcome.optimized_key)
        .bind(outcome.derivatives_pending)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_record()),
            None => Err(self
                .explain_miss(id, "derivation result discarded")
                .await),
        }
    }

    #[tracing::instrument(skip(self, reason), fields(db.table = "media", db.operation = "update", db.record_id = %id))]
    async fn fail_derivation(&self, id: &str, reason: &str) -> Result<MediaRecord, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET status = 'failed', failure_reason = $2, updated_at = {}
            WHERE id = $1 AND status = 'processing'
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(id)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(row.into_record()),
            None => Err(self.explain_miss(id, "failure not recorded").await),
        }
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "update", db.record_id = %id))]
    async fn mark_deleted(&self, id: &str) -> Result<MediaRecord, AppError> {
        let row: Option<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            UPDATE media SET status = 'deleted', updated_at = {}
            WHERE id = $1 AND status <> 'deleted'
            RETURNING {}
            "#,
            BUMP_UPDATED_AT, COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(MediaRow::into_record)
            .ok_or_else(|| AppError::NotFound(format!("Media {} not found", id)))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "delete", db.record_id = %id))]
    async fn delete(&self, id: &str) -> Result<(), AppError> {
        sqlx::query("DELETE FROM media WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    #[tracing::instrument(skip(self, filter), fields(db.table = "media", db.operation = "select"))]
    async fn list(&self, filter: &ListFilter) -> Result<MediaPage, AppError> {
        let mut count_query: QueryBuilder<Postgres> =
            QueryBuilder::new("SELECT COUNT(*) FROM media");
        Self::push_filters(&mut count_query, filter);
        let total: i64 = count_query
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;

        let mut query: QueryBuilder<Postgres> =
            QueryBuilder::new(format!("SELECT {} FROM media", COLUMNS));
        Self::push_filters(&mut query, filter);
        if let Some(cursor) = &filter.cursor {
            query
                .push(" AND (created_at, id) < (")
                .push_bind(cursor.created_at)
                .push(", ")
                .push_bind(cursor.id.clone())
                .push(")");
        }
        query.push(Self::order_clause(filter));
        query
            .push(" LIMIT ")
            .push_bind(filter.limit as i64 + 1);
        if filter.cursor.is_none() {
            query.push(" OFFSET ").push_bind(filter.offset() as i64);
        }

        let rows: Vec<MediaRow> = query
            .build_query_as::<MediaRow>()
            .fetch_all(&self.pool)
            .await?;

        let limit = filter.limit as usize;
        let has_more = rows.len() > limit;
        let items: Vec<MediaRecord> = rows.into_iter().take(limit).map(MediaRow::into_record).collect();
        let next_cursor = match items.last() {
            Some(last) if has_more && filter.uses_default_order() => {
                Some(ListCursor::after(last).encode())
            }
            _ => None,
        };

        Ok(MediaPage {
            items,
            total: total.max(0) as u64,
            next_cursor,
        })
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_stale(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE status IN ('pending', 'processing') AND updated_at < $1
            ORDER BY updated_at ASC, id ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(before)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_derivatives_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE status = 'ready' AND derivatives_pending AND updated_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(before)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_deleted(&self, limit: usize) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE status = 'deleted'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
            COLUMNS
        ))
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_created_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE status <> 'deleted' AND created_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(before)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "aggregate"))]
    async fn usage_by_owner(&self) -> Result<Vec<OwnerUsage>, AppError> {
        let rows: Vec<(String, i64, i64)> = sqlx::query_as(
            r#"
            SELECT owner_id, COALESCE(SUM(size_bytes), 0)::BIGINT, COUNT(*)
            FROM media
            WHERE status <> 'deleted'
            GROUP BY owner_id
            ORDER BY owner_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(owner_id, total, count)| OwnerUsage {
                owner_id,
                total_bytes: total.max(0) as u64,
                records: count.max(0) as u64,
            })
            .collect())
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_oldest_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE owner_id = $1 AND status <> 'deleted'
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(owner_id)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn is_key_referenced(&self, key: &str) -> Result<bool, AppError> {
        let referenced: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS(
                SELECT 1 FROM media
                WHERE storage_key = $1 OR thumbnail_key = $1 OR optimized_key = $1
            )
            "#,
        )
        .bind(key)
        .fetch_one(&self.pool)
        .await?;

        Ok(referenced)
    }

    #[tracing::instrument(skip(self), fields(db.table = "media", db.operation = "select"))]
    async fn list_ready(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError> {
        let rows: Vec<MediaRow> = sqlx::query_as::<Postgres, MediaRow>(&format!(
            r#"
            SELECT {} FROM media
            WHERE status = 'ready' AND ($1::TEXT IS NULL OR id > $1)
            ORDER BY id ASC
            LIMIT $2
            "#,
            COLUMNS
        ))
        .bind(after_id)
        .bind(limit_to_db(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows_to_records(rows))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::models::MediaListQuery;

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("50%_off\\"), "50\\%\\_off\\\\");
        assert_eq!(escape_like("cats"), "cats");
    }

    #[test]
    fn test_order_clause_whitelists_columns() {
        let filter = MediaListQuery {
            sort_by: Some("fileSize".into()),
            sort_order: Some("asc".into()),
            ..Default::default()
        }
        .into_filter()
        .unwrap();
        assert_eq!(
            PgMediaRepository::order_clause(&filter),
            " ORDER BY size_bytes ASC, id ASC"
        );

        let default = MediaListQuery::default().into_filter().unwrap();
        assert_eq!(
            PgMediaRepository::order_clause(&default),
            " ORDER BY created_at DESC, id DESC"
        );
    }

    #[test]
    fn test_size_conversion_rejects_overflow() {
        assert_eq!(size_to_db(70).unwrap(), 70);
        assert!(size_to_db(u64::MAX).is_err());
    }
}
