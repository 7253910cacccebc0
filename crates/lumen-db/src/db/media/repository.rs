//! Metadata repository contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lumen_core::models::{DerivationOutcome, ListFilter, MediaPage, MediaRecord};
use lumen_core::AppError;

/// Stored bytes and record count for one owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerUsage {
    pub owner_id: String,
    pub total_bytes: u64,
    pub records: u64,
}

/// Authoritative index of media records.
///
/// Every write is a single atomic unit. Status changes go through the narrow
/// lifecycle methods below, each of which is a compare-and-set on the stored status, so
/// observers never see a backward transition.
#[async_trait]
pub trait MediaRepository: Send + Sync {
    /// Insert a new record. A duplicate id or storage key is a `conflict`.
    async fn create(&self, record: &MediaRecord) -> Result<(), AppError>;

    /// Fetch a record by id, including records already marked `deleted`.
    async fn get(&self, id: &str) -> Result<Option<MediaRecord>, AppError>;

    /// Optimistic full update: succeeds only if the stored `updated_at` equals
    /// `expected_updated_at` and the status change is legal. Returns the stored record.
    async fn update(
        &self,
        record: &MediaRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<MediaRecord, AppError>;

    /// Move `pending` (or `processing` last touched before `stale_before`) to `processing`.
    ///
    /// `None` means another worker holds the record or it left the claimable states.
    async fn claim(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError>;

    /// Lease a `ready` record flagged for a derivative retry and untouched since
    /// `stale_before`. The lease is the bumped `updated_at`; the flag itself stays set until
    /// `complete_derivation` clears it, so an abandoned retry is offered again once the lease
    /// goes stale.
    async fn claim_rederive(
        &self,
        id: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<MediaRecord>, AppError>;

    /// Commit derivation results and move the record to `ready`.
    ///
    /// Fails with `conflict` if the record was deleted (or otherwise left `processing`)
    /// since it was claimed.
    async fn complete_derivation(
        &self,
        id: &str,
        outcome: &DerivationOutcome,
    ) -> Result<MediaRecord, AppError>;

    /// Move a `processing` record to `failed` with `reason`.
    async fn fail_derivation(&self, id: &str, reason: &str) -> Result<MediaRecord, AppError>;

    /// Mark a live record `deleted` and return it. Missing or already-deleted ids are
    /// `not-found`.
    async fn mark_deleted(&self, id: &str) -> Result<MediaRecord, AppError>;

    /// Remove the row. Idempotent.
    async fn delete(&self, id: &str) -> Result<(), AppError>;

    /// One page of visible records.
    async fn list(&self, filter: &ListFilter) -> Result<MediaPage, AppError>;

    /// `pending` or `processing` records not touched since `before`, oldest first.
    async fn list_stale(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError>;

    /// `ready` records flagged for a derivative retry and not leased since `before`,
    /// oldest first.
    async fn list_derivatives_pending(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError>;

    /// Records stuck in `deleted` (a removal that did not finish), oldest first.
    async fn list_deleted(&self, limit: usize) -> Result<Vec<MediaRecord>, AppError>;

    /// Live records created before `before`, oldest first.
    async fn list_created_before(
        &self,
        before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError>;

    /// Byte totals per owner over live records.
    async fn usage_by_owner(&self) -> Result<Vec<OwnerUsage>, AppError>;

    /// An owner's live records, oldest first.
    async fn list_oldest_by_owner(
        &self,
        owner_id: &str,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError>;

    /// Whether any row (deleted or not) still references `key`.
    async fn is_key_referenced(&self, key: &str) -> Result<bool, AppError>;

    /// `ready` records with ids after `after_id`, in id order.
    async fn list_ready(
        &self,
        after_id: Option<&str>,
        limit: usize,
    ) -> Result<Vec<MediaRecord>, AppError>;
}

/// Reject an illegal status change before it is written.
pub(crate) fn ensure_transition(current: &MediaRecord, next: &MediaRecord) -> Result<(), AppError> {
    if current.status == next.status && current.status != lumen_core::models::MediaStatus::Deleted
    {
        return Ok(());
    }
    if current.status.can_transition_to(next.status) {
        Ok(())
    } else {
        Err(AppError::Conflict(format!(
            "Illegal status transition {} -> {} for media {}",
            current.status.as_str(),
            next.status.as_str(),
            current.id
        )))
    }
}

/// `updated_at` for a write following `previous`; strictly increasing at microsecond
/// precision so optimistic checks never see two writes with the same stamp.
pub(crate) fn next_updated_at(previous: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    let floor = previous + chrono::Duration::microseconds(1);
    let stamp = if now > floor { now } else { floor };
    truncate_micros(stamp)
}

pub(crate) fn truncate_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    DateTime::from_timestamp_micros(ts.timestamp_micros()).unwrap_or(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_updated_at_is_strictly_increasing() {
        let future = Utc::now() + chrono::Duration::seconds(5);
        let next = next_updated_at(future);
        assert!(next > future - chrono::Duration::microseconds(1));
        assert!(next >= truncate_micros(future));
        assert_ne!(next, truncate_micros(future));
    }
}
