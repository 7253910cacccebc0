//! Derivation queue: bounded channel, fixed worker pool, per-task deadline.
//!
//! Enqueue never blocks: a full queue is reported to the caller, which leaves the record
//! `pending` for the janitor. The queue does not retry; stale `processing` rows are
//! requeued by the janitor once they pass the staleness threshold.
//!
//! Shutdown: [`DerivationQueue::shutdown`] stops the pool from taking new tasks and waits
//! for the dispatch loop to exit. In-flight tasks keep running until they finish or hit
//! their deadline.

use chrono::Utc;
use lumen_core::config::DerivationConfig;
use lumen_core::models::{DerivationOutcome, MediaKind, MediaRecord};
use lumen_core::AppError;
use lumen_db::MediaRepository;
use lumen_processing::{ArtifactData, DeriveInput, Derivation, DeriverRegistry};
use lumen_storage::{optimized_key, thumbnail_key, Storage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;

use crate::context::{DerivationListener, TaskOutcome};

/// A request to derive one media record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivationTask {
    pub media_id: String,
    /// Progress stream to report the terminal event to
    pub progress_key: Option<String>,
    /// Retry of a `ready` record whose derivatives were skipped
    pub rederive: bool,
}

impl DerivationTask {
    pub fn new(media_id: impl Into<String>) -> Self {
        Self {
            media_id: media_id.into(),
            progress_key: None,
            rederive: false,
        }
    }

    pub fn rederive(media_id: impl Into<String>) -> Self {
        Self {
            rederive: true,
            ..Self::new(media_id)
        }
    }

    pub fn with_progress_key(mut self, key: impl Into<String>) -> Self {
        self.progress_key = Some(key.into());
        self
    }
}

#[derive(Clone, Debug)]
pub struct DerivationQueueConfig {
    pub max_workers: usize,
    pub queue_depth: usize,
    /// Hard deadline per task
    pub task_timeout: Duration,
    /// Age after which a `processing` claim may be taken over
    pub stale_after: Duration,
}

impl Default for DerivationQueueConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            queue_depth: 256,
            task_timeout: Duration::from_secs(600),
            stale_after: Duration::from_secs(600),
        }
    }
}

impl From<&DerivationConfig> for DerivationQueueConfig {
    fn from(config: &DerivationConfig) -> Self {
        Self {
            max_workers: config.worker_count.max(1),
            queue_depth: config.queue_depth.max(1),
            task_timeout: Duration::from_secs(config.task_timeout_secs.max(1)),
            stale_after: Duration::from_secs(config.stale_after_secs),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("derivation queue is full")]
    Full(DerivationTask),

    #[error("derivation queue is shut down")]
    Closed(DerivationTask),
}

impl From<EnqueueError> for AppError {
    fn from(err: EnqueueError) -> Self {
        match err {
            EnqueueError::Full(_) => AppError::QueueFull,
            EnqueueError::Closed(_) => AppError::Internal(err.to_string()),
        }
    }
}

/// Everything a worker needs to run a task.
struct WorkerContext {
    repository: Arc<dyn MediaRepository>,
    storage: Arc<dyn Storage>,
    derivers: DeriverRegistry,
    listener: Arc<dyn DerivationListener>,
    config: DerivationQueueConfig,
}

pub struct DerivationQueue {
    sender: mpsc::Sender<DerivationTask>,
    shutdown_tx: watch::Sender<bool>,
    pool: Mutex<Option<JoinHandle<()>>>,
    config: DerivationQueueConfig,
}

impl DerivationQueue {
    /// Create the queue and spawn its worker pool on the current runtime.
    pub fn start(
        repository: Arc<dyn MediaRepository>,
        storage: Arc<dyn Storage>,
        derivers: DeriverRegistry,
        listener: Arc<dyn DerivationListener>,
        config: DerivationQueueConfig,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.queue_depth.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let context = Arc::new(WorkerContext {
            repository,
            storage,
            derivers,
            listener,
            config: config.clone(),
        });
        let pool = tokio::spawn(Self::worker_pool(context, receiver, shutdown_rx));

        Self {
            sender,
            shutdown_tx,
            pool: Mutex::new(Some(pool)),
            config,
        }
    }

    /// Submit a task without waiting.
    pub fn enqueue(&self, task: DerivationTask) -> Result<(), EnqueueError> {
        self.sender.try_send(task).map_err(|e| match e {
            mpsc::error::TrySendError::Full(task) => {
                tracing::warn!(media_id = %task.media_id, "Derivation queue full");
                EnqueueError::Full(task)
            }
            mpsc::error::TrySendError::Closed(task) => EnqueueError::Closed(task),
        })
    }

    /// Tasks waiting for a worker.
    pub fn queued(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn config(&self) -> &DerivationQueueConfig {
        &self.config
    }

    /// Stop taking tasks and wait for the dispatch loop to exit.
    pub async fn shutdown(&self) {
        tracing::info!("Initiating derivation queue shutdown");
        let _ = self.shutdown_tx.send(true);
        if let Some(handle) = self.pool.lock().await.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Derivation worker pool panicked");
            }
        }
    }

    async fn worker_pool(
        context: Arc<WorkerContext>,
        mut receiver: mpsc::Receiver<DerivationTask>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tracing::info!(
            max_workers = context.config.max_workers,
            queue_depth = context.config.queue_depth,
            task_timeout_secs = context.config.task_timeout.as_secs(),
            "Derivation worker pool started"
        );
        let semaphore = Arc::new(Semaphore::new(context.config.max_workers.max(1)));

        loop {
            let permit = tokio::select! {
                _ = stopped(&mut shutdown_rx) => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let task = tokio::select! {
                _ = stopped(&mut shutdown_rx) => break,
                task = receiver.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            };

            let context = context.clone();
            tokio::spawn(async move {
                let _permit = permit;
                context.run(task).await;
            });
        }

        tracing::info!("Derivation worker pool stopped");
    }
}

/// Resolves once shutdown has been requested (or the sender is gone).
async fn stopped(rx: &mut watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

impl WorkerContext {
    #[tracing::instrument(skip(self), fields(media.id = %task.media_id, rederive = task.rederive))]
    async fn run(&self, task: DerivationTask) {
        let start = Instant::now();
        let outcome = self.process(&task).await;
        let elapsed_ms = start.elapsed().as_millis() as u64;

        match &outcome {
            TaskOutcome::Ready(record) => tracing::info!(
                elapsed_ms,
                thumbnail = record.thumbnail_key.is_some(),
                optimized = record.optimized_key.is_some(),
                derivatives_pending = record.derivatives_pending,
                "Derivation completed"
            ),
            TaskOutcome::Failed { reason } => {
                tracing::warn!(elapsed_ms, reason = %reason, "Derivation failed")
            }
            TaskOutcome::Skipped => tracing::debug!("Derivation claim lost; dropping task"),
            TaskOutcome::Discarded => {
                tracing::info!(elapsed_ms, "Record deleted during derivation; results discarded")
            }
            TaskOutcome::Deferred { reason } => {
                tracing::warn!(reason = %reason, "Derivation deferred to janitor")
            }
        }

        self.listener.derivation_finished(&task, &outcome);
    }

    async fn process(&self, task: &DerivationTask) -> TaskOutcome {
        let stale_before = Utc::now()
            - chrono::Duration::from_std(self.config.stale_after)
                .unwrap_or_else(|_| chrono::Duration::minutes(10));
        let claimed = if task.rederive {
            self.repository
                .claim_rederive(&task.media_id, stale_before)
                .await
        } else {
            self.repository.claim(&task.media_id, stale_before).await
        };

        let record = match claimed {
            Ok(Some(record)) => record,
            Ok(None) => return TaskOutcome::Skipped,
            Err(e) => {
                return TaskOutcome::Deferred {
                    reason: e.failure_reason(),
                }
            }
        };

        let mut written = Vec::new();
        let result = tokio::time::timeout(
            self.config.task_timeout,
            self.derive_and_store(&record, &mut written),
        )
        .await;

        let error = match result {
            Ok(Ok(outcome)) => {
                return match self
                    .repository
                    .complete_derivation(&record.id, &outcome)
                    .await
                {
                    Ok(stored) => TaskOutcome::Ready(stored),
                    Err(AppError::Conflict(_)) | Err(AppError::NotFound(_)) => {
                        self.discard(&written).await;
                        TaskOutcome::Discarded
                    }
                    Err(e) => {
                        self.discard(&written).await;
                        TaskOutcome::Deferred {
                            reason: e.failure_reason(),
                        }
                    }
                };
            }
            Ok(Err(e)) => e,
            Err(_) => AppError::TaskTimeout(self.config.task_timeout.as_secs()),
        };

        self.discard(&written).await;

        if task.rederive {
            // The record stays `ready` with whatever derivatives it already had.
            return TaskOutcome::Deferred {
                reason: error.failure_reason(),
            };
        }

        let reason = error.failure_reason();
        match self.repository.fail_derivation(&record.id, &reason).await {
            Ok(_) => TaskOutcome::Failed { reason },
            Err(AppError::Conflict(_)) | Err(AppError::NotFound(_)) => TaskOutcome::Discarded,
            Err(e) => TaskOutcome::Deferred {
                reason: e.failure_reason(),
            },
        }
    }

    /// Read the original, run the deriver and store its artifacts. Keys written are pushed
    /// onto `written` as they land so a later failure can remove them.
    async fn derive_and_store(
        &self,
        record: &MediaRecord,
        written: &mut Vec<String>,
    ) -> Result<DerivationOutcome, AppError> {
        let object = self.storage.get_stream(&record.storage_key).await?;
        let deriver = self.derivers.for_kind(record.kind);
        let derivation = deriver
            .derive(DeriveInput {
                media_id: record.id.clone(),
                reader: object.into_reader(),
                filename: record.original_filename.clone(),
                mime_type: record.mime_type.clone(),
                size_bytes: record.size_bytes,
            })
            .await?;

        let Derivation {
            attributes,
            thumbnail,
            optimized,
            issues,
            skipped,
        } = derivation;

        let mut outcome = DerivationOutcome {
            attributes,
            thumbnail_key: None,
            optimized_key: None,
            derivatives_pending: skipped,
        };
        if skipped {
            // Keep what an earlier run produced.
            outcome.thumbnail_key = record.thumbnail_key.clone();
            outcome.optimized_key = record.optimized_key.clone();
            if outcome.attributes.is_empty() {
                outcome.attributes = record.attributes.clone();
            }
            return Ok(outcome);
        }

        let mut last_error = None;

        if let Some(bytes) = thumbnail {
            let key = thumbnail_key(&record.storage_key);
            match self.storage.put_bytes(&key, "image/jpeg", bytes).await {
                Ok(size) => {
                    tracing::debug!(key = %key, size, "Stored thumbnail");
                    written.push(key.clone());
                    outcome.thumbnail_key = Some(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to store thumbnail");
                    last_error = Some(AppError::from(e));
                }
            }
        }

        if let Some(artifact) = optimized {
            let key = optimized_key(&record.storage_key, &artifact.extension);
            let stored = match artifact.data {
                ArtifactData::Memory(bytes) => {
                    self.storage
                        .put_bytes(&key, &artifact.content_type, bytes)
                        .await
                }
                ArtifactData::File(path) => match tokio::fs::File::open(&path).await {
                    Ok(file) => {
                        self.storage
                            .put_stream(&key, &artifact.content_type, Box::pin(file))
                            .await
                    }
                    Err(e) => Err(lumen_storage::StorageError::from_io(e, "optimized artifact")),
                },
            };
            match stored {
                Ok(size) => {
                    tracing::debug!(key = %key, size, "Stored optimized variant");
                    written.push(key.clone());
                    outcome.optimized_key = Some(key);
                }
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Failed to store optimized variant");
                    last_error = Some(AppError::from(e));
                }
            }
        }

        match record.kind {
            // A ready image must resolve at least one derivative.
            MediaKind::Image
                if outcome.thumbnail_key.is_none() && outcome.optimized_key.is_none() =>
            {
                return Err(last_error.unwrap_or_else(|| {
                    AppError::DecodeFailed("no image derivative was produced".to_string())
                }));
            }
            // The original is still playable; leave the thumbnail to a janitor retry.
            MediaKind::Video if outcome.thumbnail_key.is_none() => {
                tracing::warn!(
                    media_id = %record.id,
                    issues = ?issues,
                    "Video ready without a thumbnail; flagged for retry"
                );
                outcome.derivatives_pending = true;
            }
            _ => {}
        }

        Ok(outcome)
    }

    /// Best-effort removal of derivative keys written by an abandoned task.
    async fn discard(&self, keys: &[String]) {
        for key in keys {
            if let Err(e) = self.storage.delete(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to remove discarded derivative");
            }
        }
    }
}
