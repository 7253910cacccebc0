use chrono::Utc;
use lumen_core::config::JanitorConfig;
use lumen_core::models::MediaRecord;
use lumen_core::AppError;
use lumen_db::MediaRepository;
use lumen_storage::{Storage, StorageError};
use lumen_worker::{DerivationQueue, DerivationTask, EnqueueError};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::interval;

use crate::media::MediaService;
use crate::progress::ProgressBus;
use crate::upload::UploadCoordinator;

/// Counts from one janitor pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CleanupReport {
    pub expired_sessions: usize,
    pub pruned_progress: usize,
    pub requeued: usize,
    pub rederive_queued: usize,
    pub finished_deletions: usize,
    pub orphans_removed: usize,
    pub orphan_scan_skipped: bool,
    pub partials_removed: usize,
    pub retention_removed: usize,
    pub quota_removed: usize,
    pub integrity_mismatches: usize,
}

/// Periodic maintenance: idle sessions, stuck derivations, unfinished deletions, orphaned
/// objects, retention, quotas and an integrity sample. Each task handles at most one batch
/// per tick, and a failing task never stops the others.
pub struct CleanupService {
    repository: Arc<dyn MediaRepository>,
    storage: Arc<dyn Storage>,
    queue: Arc<DerivationQueue>,
    coordinator: Arc<UploadCoordinator>,
    bus: ProgressBus,
    media: MediaService,
    config: JanitorConfig,
    progress_ttl: Duration,
    orphan_cursor: Mutex<Option<String>>,
    integrity_cursor: Mutex<Option<String>>,
}

impl CleanupService {
    pub fn new(
        repository: Arc<dyn MediaRepository>,
        storage: Arc<dyn Storage>,
        queue: Arc<DerivationQueue>,
        coordinator: Arc<UploadCoordinator>,
        config: JanitorConfig,
        progress_ttl: Duration,
    ) -> Self {
        Self {
            media: MediaService::new(repository.clone(), storage.clone()),
            bus: coordinator.bus().clone(),
            repository,
            storage,
            queue,
            coordinator,
            config,
            progress_ttl,
            orphan_cursor: Mutex::new(None),
            integrity_cursor: Mutex::new(None),
        }
    }

    /// Run a pass every `interval_secs` until `shutdown` flips to true.
    pub fn start(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(self.config.interval_secs.max(1)));

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            tracing::info!("Cleanup janitor stopping");
                            break;
                        }
                        continue;
                    }
                }

                tracing::info!("Starting scheduled cleanup");
                let report = self.run_once().await;
                tracing::info!(?report, "Cleanup completed");
            }
        })
    }

    /// One full pass over every task.
    pub async fn run_once(&self) -> CleanupReport {
        let mut report = CleanupReport {
            expired_sessions: self.coordinator.expire_idle().await,
            pruned_progress: self.bus.prune_idle(self.progress_ttl),
            ..Default::default()
        };

        report.requeued = log_task("requeue_stale", self.requeue_stale().await);
        report.rederive_queued = log_task("rederive", self.requeue_derivatives_pending().await);
        report.finished_deletions = log_task("finish_deletions", self.finish_deletions().await);
        match self.remove_orphans().await {
            Ok(Some(removed)) => report.orphans_removed = removed,
            Ok(None) => report.orphan_scan_skipped = true,
            Err(e) => tracing::error!(error = %e, task = "orphans", "Cleanup task failed"),
        }
        report.partials_removed = log_task("partials", self.remove_stale_partials().await);
        report.retention_removed = log_task("retention", self.enforce_retention().await);
        report.quota_removed = log_task("quota", self.enforce_quotas().await);
        report.integrity_mismatches = log_task("integrity", self.check_integrity().await);
        report
    }

    /// Requeue `pending` and `processing` records untouched past the staleness threshold.
    /// `failed` records stay failed.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "requeue_stale"))]
    async fn requeue_stale(&self) -> Result<usize, AppError> {
        let stale_after = chrono::Duration::from_std(self.queue.config().stale_after)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let stale = self
            .repository
            .list_stale(Utc::now() - stale_after, self.config.batch_size)
            .await?;

        let mut queued = 0;
        for record in stale {
            match self.queue.enqueue(DerivationTask::new(record.id.clone())) {
                Ok(()) => {
                    tracing::info!(media_id = %record.id, status = record.status.as_str(), "Requeued stale derivation");
                    queued += 1;
                }
                Err(EnqueueError::Full(_)) | Err(EnqueueError::Closed(_)) => break,
            }
        }
        Ok(queued)
    }

    /// Retry derivatives for records that became ready while the transcoder was missing.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "rederive"))]
    async fn requeue_derivatives_pending(&self) -> Result<usize, AppError> {
        let stale_after = chrono::Duration::from_std(self.queue.config().stale_after)
            .map_err(|e| AppError::Internal(e.to_string()))?;
        let pending = self
            .repository
            .list_derivatives_pending(Utc::now() - stale_after, self.config.batch_size)
            .await?;
        let mut queued = 0;
        for record in pending {
            if self.queue.enqueue(DerivationTask::rederive(record.id)).is_err() {
                break;
            }
            queued += 1;
        }
        Ok(queued)
    }

    /// Finish removals interrupted after the record was hidden.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "finish_deletions"))]
    async fn finish_deletions(&self) -> Result<usize, AppError> {
        let deleted = self.repository.list_deleted(self.config.batch_size).await?;
        let mut finished = 0;
        for record in deleted {
            match self.media.purge(&record).await {
                Ok(()) => finished += 1,
                Err(e) => tracing::warn!(media_id = %record.id, error = %e, "Deferred removal failed again"),
            }
        }
        Ok(finished)
    }

    /// Delete objects no record references once they are older than the grace window.
    /// `None` means the backend cannot list its inventory.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "orphans"))]
    async fn remove_orphans(&self) -> Result<Option<usize>, AppError> {
        let start_after = self.lock_cursor(&self.orphan_cursor).clone();
        let page = match self
            .storage
            .list_page(start_after.as_deref(), self.config.batch_size)
            .await
        {
            Ok(page) => page,
            Err(StorageError::Unsupported(_)) => {
                tracing::info!("Storage backend cannot list objects; orphan scan skipped");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        *self.lock_cursor(&self.orphan_cursor) = if page.len() < self.config.batch_size {
            None
        } else {
            page.last().map(|o| o.key.clone())
        };

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.orphan_grace_secs as i64);
        let mut removed = 0;
        for object in page {
            if object.last_modified > cutoff {
                continue;
            }
            if self.repository.is_key_referenced(&object.key).await? {
                continue;
            }
            match self.storage.delete(&object.key).await {
                Ok(()) => {
                    tracing::info!(storage_key = %object.key, size = object.size, "Removed orphaned object");
                    removed += 1;
                }
                Err(e) => tracing::warn!(storage_key = %object.key, error = %e, "Failed to remove orphan"),
            }
        }
        Ok(Some(removed))
    }

    /// Delete temporary files of interrupted writes once they are older than the grace window.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "partials"))]
    async fn remove_stale_partials(&self) -> Result<usize, AppError> {
        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.orphan_grace_secs as i64);
        let removed = self.storage.remove_stale_partials(cutoff).await?;
        if removed > 0 {
            tracing::info!(removed, "Removed interrupted write leftovers");
        }
        Ok(removed)
    }

    #[tracing::instrument(skip(self), fields(cleanup.operation = "retention"))]
    async fn enforce_retention(&self) -> Result<usize, AppError> {
        let Some(days) = self.config.retention_days else {
            return Ok(0);
        };
        let cutoff = Utc::now() - chrono::Duration::days(i64::from(days));
        let expired = self
            .repository
            .list_created_before(cutoff, self.config.batch_size)
            .await?;

        let mut removed = 0;
        for record in expired {
            if self.remove(&record, "retention").await {
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Delete each over-quota owner's oldest records until they fit.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "quota"))]
    async fn enforce_quotas(&self) -> Result<usize, AppError> {
        let Some(quota) = self.config.per_owner_quota_bytes else {
            return Ok(0);
        };

        let mut removed = 0;
        for usage in self.repository.usage_by_owner().await? {
            if usage.total_bytes <= quota {
                continue;
            }
            let mut total = usage.total_bytes;
            let budget = self.config.batch_size.saturating_sub(removed);
            if budget == 0 {
                break;
            }
            let oldest = self
                .repository
                .list_oldest_by_owner(&usage.owner_id, budget)
                .await?;
            for record in oldest {
                if total <= quota {
                    break;
                }
                if self.remove(&record, "quota").await {
                    total = total.saturating_sub(record.size_bytes);
                    removed += 1;
                }
            }
            tracing::info!(owner_id = %usage.owner_id, total_bytes = total, quota, "Quota enforced");
        }
        Ok(removed)
    }

    /// Sample `ready` records and check that each original exists with the recorded size.
    /// Mismatches are reported, never repaired.
    #[tracing::instrument(skip(self), fields(cleanup.operation = "integrity"))]
    async fn check_integrity(&self) -> Result<usize, AppError> {
        let after = self.lock_cursor(&self.integrity_cursor).clone();
        let batch = self
            .repository
            .list_ready(after.as_deref(), self.config.batch_size)
            .await?;
        *self.lock_cursor(&self.integrity_cursor) = if batch.len() < self.config.batch_size {
            None
        } else {
            batch.last().map(|r| r.id.clone())
        };

        let mut mismatches = 0;
        for record in batch {
            match self.storage.size(&record.storage_key).await {
                Ok(size) if size == record.size_bytes => {}
                Ok(size) => {
                    tracing::warn!(media_id = %record.id, expected = record.size_bytes, actual = size, "Original size mismatch");
                    mismatches += 1;
                }
                Err(StorageError::NotFound(_)) => {
                    tracing::warn!(media_id = %record.id, storage_key = %record.storage_key, "Original missing for ready record");
                    mismatches += 1;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(mismatches)
    }

    async fn remove(&self, record: &MediaRecord, reason: &str) -> bool {
        let hidden = match self.repository.mark_deleted(&record.id).await {
            Ok(hidden) => hidden,
            Err(AppError::NotFound(_)) => return false,
            Err(e) => {
                tracing::warn!(media_id = %record.id, error = %e, reason, "Failed to hide record");
                return false;
            }
        };
        if let Err(e) = self.media.purge(&hidden).await {
            tracing::warn!(media_id = %record.id, error = %e, reason, "Removal incomplete; will retry");
        } else {
            tracing::info!(media_id = %record.id, reason, "Removed media");
        }
        true
    }

    fn lock_cursor<'a>(
        &self,
        cursor: &'a Mutex<Option<String>>,
    ) -> std::sync::MutexGuard<'a, Option<String>> {
        cursor.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn log_task(task: &'static str, result: Result<usize, AppError>) -> usize {
    match result {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(error = %e, task, "Cleanup task failed");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use chrono::DateTime;
    use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
    use lumen_core::config::SessionConfig;
    use lumen_core::models::{DisplayMetadata, MediaKind, MediaStatus, NewMediaRecord};
    use lumen_core::SequentialIdGenerator;
    use lumen_db::InMemoryMediaRepository;
    use lumen_processing::{DeriverRegistry, UploadValidator};
    use lumen_storage::LocalStorage;
    use lumen_worker::{noop_listener, DerivationQueueConfig};
    use std::io::Cursor;
    use tempfile::TempDir;

    struct Harness {
        _dir: TempDir,
        repository: Arc<InMemoryMediaRepository>,
        storage: Arc<LocalStorage>,
        janitor: CleanupService,
    }

    fn janitor_config() -> JanitorConfig {
        JanitorConfig {
            interval_secs: 3600,
            batch_size: 100,
            orphan_grace_secs: 0,
            retention_days: None,
            per_owner_quota_bytes: None,
        }
    }

    async fn harness(config: JanitorConfig) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let app = lumen_core::Config::for_tests(dir.path().to_string_lossy());
        let storage = Arc::new(
            LocalStorage::new(dir.path(), "/media".to_string())
                .await
                .unwrap(),
        );
        let repository = Arc::new(InMemoryMediaRepository::new());
        let queue = Arc::new(DerivationQueue::start(
            repository.clone(),
            storage.clone(),
            DeriverRegistry::from_config(&app.media),
            noop_listener(),
            DerivationQueueConfig {
                stale_after: Duration::ZERO,
                ..DerivationQueueConfig::default()
            },
        ));
        let coordinator = Arc::new(UploadCoordinator::new(
            repository.clone(),
            storage.clone(),
            queue.clone(),
            ProgressBus::new(),
            Arc::new(SequentialIdGenerator::new("id")),
            UploadValidator::from_config(&app.media),
            SessionConfig {
                idle_ttl_secs: 3600,
                progress_ttl_secs: 3600,
                memory_ceiling_bytes: 1 << 20,
                spill_threshold_bytes: 1 << 20,
            },
        ));
        let janitor = CleanupService::new(
            repository.clone(),
            storage.clone(),
            queue,
            coordinator,
            config,
            Duration::from_secs(3600),
        );
        Harness {
            _dir: dir,
            repository,
            storage,
            janitor,
        }
    }

    fn png() -> Vec<u8> {
        let mut buffer = Vec::new();
        DynamicImage::ImageRgb8(RgbImage::from_pixel(3, 3, Rgb([0, 0, 255])))
            .write_to(&mut Cursor::new(&mut buffer), ImageFormat::Png)
            .unwrap();
        buffer
    }

    async fn seed(
        h: &Harness,
        id: &str,
        owner: &str,
        data: Vec<u8>,
        created_at: DateTime<Utc>,
        status: MediaStatus,
    ) -> MediaRecord {
        let key = format!("2024/01/01/{}/{}.png", owner, id);
        h.storage
            .put_bytes(&key, "image/png", Bytes::from(data.clone()))
            .await
            .unwrap();
        let mut record = MediaRecord::new_pending(
            NewMediaRecord {
                id: id.to_string(),
                owner_id: owner.to_string(),
                owner_name: None,
                original_filename: "a.png".to_string(),
                display: DisplayMetadata::default(),
                mime_type: "image/png".to_string(),
                kind: MediaKind::Image,
                storage_key: key,
                size_bytes: data.len() as u64,
            },
            created_at,
        );
        record.status = status;
        h.repository.create(&record).await.unwrap();
        record
    }

    fn hours_ago(hours: i64) -> DateTime<Utc> {
        Utc::now() - chrono::Duration::hours(hours)
    }

    #[tokio::test]
    async fn test_stale_pending_record_is_requeued_and_failed_is_not() {
        let h = harness(janitor_config()).await;
        seed(&h, "stuck", "u1", png(), hours_ago(2), MediaStatus::Pending).await;
        seed(&h, "broken", "u1", png(), hours_ago(2), MediaStatus::Pending).await;
        h.repository
            .claim("broken", Utc::now())
            .await
            .unwrap()
            .unwrap();
        h.repository
            .fail_derivation("broken", "decode-failed: fixture")
            .await
            .unwrap();

        let report = h.janitor.run_once().await;
        assert_eq!(report.requeued, 1);

        let ready = tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let record = h.repository.get("stuck").await.unwrap().unwrap();
                if record.status == MediaStatus::Ready {
                    return record;
                }
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await
        .expect("requeued record should become ready");
        assert!(ready.thumbnail_key.is_some());

        let broken = h.repository.get("broken").await.unwrap().unwrap();
        assert_eq!(broken.status, MediaStatus::Failed);
    }

    #[tokio::test]
    async fn test_orphans_and_unfinished_deletions() {
        let h = harness(janitor_config()).await;
        let kept = seed(&h, "kept", "u1", png(), hours_ago(1), MediaStatus::Ready).await;
        let gone = seed(&h, "gone", "u1", png(), hours_ago(1), MediaStatus::Ready).await;
        h.repository.mark_deleted("gone").await.unwrap();
        h.storage
            .put_bytes("2024/01/01/u1/stray.png", "image/png", Bytes::from_static(b"stray"))
            .await
            .unwrap();

        let report = h.janitor.run_once().await;
        assert_eq!(report.finished_deletions, 1);
        assert_eq!(report.orphans_removed, 1);
        assert!(!report.orphan_scan_skipped);

        assert!(h.storage.exists(&kept.storage_key).await.unwrap());
        assert!(!h.storage.exists(&gone.storage_key).await.unwrap());
        assert!(!h.storage.exists("2024/01/01/u1/stray.png").await.unwrap());
        assert!(h.repository.get("gone").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_orphan_grace_window() {
        let h = harness(JanitorConfig {
            orphan_grace_secs: 86_400,
            ..janitor_config()
        })
        .await;
        h.storage
            .put_bytes("2024/01/01/u1/fresh.png", "image/png", Bytes::from_static(b"fresh"))
            .await
            .unwrap();
        let report = h.janitor.run_once().await;
        assert_eq!(report.orphans_removed, 0);
        assert!(h.storage.exists("2024/01/01/u1/fresh.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_interrupted_write_leftovers_removed_after_grace() {
        let h = harness(janitor_config()).await;
        let kept = seed(&h, "kept", "u1", png(), hours_ago(1), MediaStatus::Ready).await;
        let parent = h.storage.base_path().join("2024/01/01/u1");
        let leftover = parent.join(".partial-0b1c-gone.png");
        std::fs::write(&leftover, b"half written").unwrap();

        let report = h.janitor.run_once().await;
        assert_eq!(report.partials_removed, 1);
        assert_eq!(report.orphans_removed, 0);
        assert!(!leftover.exists());
        assert!(h.storage.exists(&kept.storage_key).await.unwrap());

        let patient = harness(JanitorConfig {
            orphan_grace_secs: 86_400,
            ..janitor_config()
        })
        .await;
        let fresh_dir = patient.storage.base_path().join("2024/01/01/u1");
        std::fs::create_dir_all(&fresh_dir).unwrap();
        let fresh = fresh_dir.join(".partial-77aa-new.png");
        std::fs::write(&fresh, b"still writing").unwrap();
        let report = patient.janitor.run_once().await;
        assert_eq!(report.partials_removed, 0);
        assert!(fresh.exists());
    }

    #[tokio::test]
    async fn test_retention_and_quota() {
        let h = harness(JanitorConfig {
            retention_days: Some(30),
            per_owner_quota_bytes: Some(15),
            ..janitor_config()
        })
        .await;
        let ancient = seed(&h, "ancient", "u2", vec![1; 4], hours_ago(24 * 40), MediaStatus::Ready).await;
        seed(&h, "q1", "u1", vec![1; 10], hours_ago(3), MediaStatus::Ready).await;
        seed(&h, "q2", "u1", vec![1; 10], hours_ago(2), MediaStatus::Ready).await;
        seed(&h, "q3", "u1", vec![1; 10], hours_ago(1), MediaStatus::Ready).await;

        let report = h.janitor.run_once().await;
        assert_eq!(report.retention_removed, 1);
        assert_eq!(report.quota_removed, 2);

        assert!(h.repository.get("ancient").await.unwrap().is_none());
        assert!(!h.storage.exists(&ancient.storage_key).await.unwrap());
        assert!(h.repository.get("q1").await.unwrap().is_none());
        assert!(h.repository.get("q2").await.unwrap().is_none());
        assert!(h.repository.get("q3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_integrity_check_reports_missing_original() {
        let h = harness(janitor_config()).await;
        let record = seed(&h, "lost", "u1", png(), hours_ago(1), MediaStatus::Ready).await;
        h.storage.delete(&record.storage_key).await.unwrap();

        let report = h.janitor.run_once().await;
        assert_eq!(report.integrity_mismatches, 1);
        let still = h.repository.get("lost").await.unwrap().unwrap();
        assert_eq!(still.status, MediaStatus::Ready);
    }

    #[tokio::test]
    async fn test_start_stops_on_shutdown() {
        let h = harness(janitor_config()).await;
        let (tx, rx) = watch::channel(false);
        let handle = Arc::new(h.janitor).start(rx);
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("janitor should stop")
            .unwrap();
    }
}
