//! Upload coordinator
//!
//! Owns both ingest modes. Single-shot uploads stream straight into the content store;
//! chunked uploads collect chunks in a session and commit them through the same path once
//! the last chunk arrives. Every successful ingest leaves a `pending` record and a queued
//! derivation task.

use bytes::Bytes;
use chrono::Utc;
use futures::StreamExt;
use lumen_core::config::SessionConfig;
use lumen_core::models::{
    ChunkAck, DisplayMetadata, MediaRecord, NewMediaRecord, Principal, ProgressPhase,
    ProgressSnapshot, StartChunkedUploadRequest,
};
use lumen_core::{AppError, IdGenerator};
use lumen_db::MediaRepository;
use lumen_processing::{sniff, UploadValidator, ValidationError, SNIFF_LEN};
use lumen_storage::{ByteReader, PathPlanner, Storage};
use lumen_worker::{DerivationQueue, DerivationTask};
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::Mutex;
use tokio_util::io::StreamReader;
use validator::Validate;

use super::session::{ChunkData, CommitBatch, SessionPlan, SessionState, UploadSession};
use crate::progress::ProgressBus;

/// Bytes read between two `uploading` snapshots of a single-shot upload.
const PROGRESS_STEP_BYTES: u64 = 256 * 1024;

/// One original to ingest.
#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub owner: Principal,
    pub filename: String,
    pub content_type: Option<String>,
    pub declared_size: Option<u64>,
    pub display: DisplayMetadata,
    /// Progress stream to report on, if the client asked for one.
    pub progress_key: Option<String>,
}

type SessionMap = HashMap<String, Arc<Mutex<UploadSession>>>;

/// Where a new chunk will be kept, decided under the session lock.
enum Placement {
    Resubmitted(ChunkData),
    /// Memory already reserved against the ceiling.
    Memory,
    Spill(PathBuf),
}

pub struct UploadCoordinator {
    repository: Arc<dyn MediaRepository>,
    storage: Arc<dyn Storage>,
    queue: Arc<DerivationQueue>,
    bus: ProgressBus,
    planner: PathPlanner,
    ids: Arc<dyn IdGenerator>,
    validator: UploadValidator,
    config: SessionConfig,
    sessions: RwLock<SessionMap>,
    memory_in_use: AtomicU64,
}

impl UploadCoordinator {
    pub fn new(
        repository: Arc<dyn MediaRepository>,
        storage: Arc<dyn Storage>,
        queue: Arc<DerivationQueue>,
        bus: ProgressBus,
        ids: Arc<dyn IdGenerator>,
        validator: UploadValidator,
        config: SessionConfig,
    ) -> Self {
        Self {
            repository,
            storage,
            queue,
            bus,
            planner: PathPlanner::new(ids.clone()),
            ids,
            validator,
            config,
            sessions: RwLock::new(HashMap::new()),
            memory_in_use: AtomicU64::new(0),
        }
    }

    pub fn bus(&self) -> &ProgressBus {
        &self.bus
    }

    /// Latest progress for an upload id.
    pub fn progress(&self, upload_id: &str) -> Result<ProgressSnapshot, AppError> {
        self.bus
            .latest(upload_id)
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))
    }

    pub fn session_count(&self) -> usize {
        self.read_sessions().len()
    }

    /// Chunk bytes currently buffered in memory across all sessions.
    pub fn memory_in_use(&self) -> u64 {
        self.memory_in_use.load(Ordering::Relaxed)
    }

    /// Single-shot upload of one file.
    #[tracing::instrument(
        skip(self, request, reader),
        fields(owner = %request.owner.user_id, filename = %request.filename)
    )]
    pub async fn upload(
        &self,
        request: IngestRequest,
        reader: ByteReader,
    ) -> Result<MediaRecord, AppError> {
        let reader: ByteReader = match request.progress_key.clone() {
            Some(key) => {
                let total = request.declared_size.unwrap_or(0);
                self.bus.publish(ProgressSnapshot::new(
                    key.clone(),
                    0,
                    total,
                    ProgressPhase::Uploading,
                ));
                Box::pin(ProgressReader::new(reader, self.bus.clone(), key, total))
            }
            None => reader,
        };

        let progress_key = request.progress_key.clone();
        let result = self.ingest(request, reader).await;
        if let (Err(e), Some(key)) = (&result, progress_key) {
            self.publish_failure(&key, e);
        }
        result
    }

    /// Validate, store and index one original, then queue its derivation.
    async fn ingest(
        &self,
        request: IngestRequest,
        mut reader: ByteReader,
    ) -> Result<MediaRecord, AppError> {
        let name = self.validator.validate_all(
            &request.filename,
            request.content_type.as_deref(),
            request.declared_size,
        )?;

        let header = read_header(&mut reader).await?;
        if header.is_empty() {
            return Err(ValidationError::EmptyFile.into());
        }
        let sniffed = self.validator.check_content(&name, sniff(&header))?;

        let planned = self
            .planner
            .plan(&request.owner.user_id, &request.filename, Utc::now())?;

        // One byte past the ceiling is enough to tell an oversized body apart.
        let max = self.validator.max_bytes(name.kind);
        let body: ByteReader = Box::pin(
            std::io::Cursor::new(header)
                .chain(reader)
                .take(max.saturating_add(1)),
        );

        let started = std::time::Instant::now();
        let stored = self
            .storage
            .put_stream(&planned.storage_key, sniffed.mime, body)
            .await?;

        if let Err(e) = self.validator.validate_file_size(name.kind, stored) {
            self.discard_object(&planned.storage_key).await;
            return Err(e.into());
        }
        if let Some(declared) = request.declared_size {
            if declared != stored {
                self.discard_object(&planned.storage_key).await;
                return Err(AppError::InvalidInput(format!(
                    "Received {} bytes but {} were declared",
                    stored, declared
                )));
            }
        }

        let record = MediaRecord::new_pending(
            NewMediaRecord {
                id: planned.media_id,
                owner_id: request.owner.user_id.clone(),
                owner_name: request.owner.user_name.clone(),
                original_filename: request.filename.clone(),
                display: request.display,
                mime_type: sniffed.mime.to_string(),
                kind: name.kind,
                storage_key: planned.storage_key.clone(),
                size_bytes: stored,
            },
            Utc::now(),
        );

        if let Err(e) = self.repository.create(&record).await {
            tracing::error!(
                error = %e,
                media_id = %record.id,
                "Failed to create media record; removing stored original"
            );
            self.discard_object(&planned.storage_key).await;
            return Err(e);
        }

        tracing::info!(
            media_id = %record.id,
            kind = record.kind.as_str(),
            size_bytes = stored,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Media ingested"
        );

        let mut task = DerivationTask::new(record.id.clone());
        if let Some(key) = &request.progress_key {
            self.bus.publish(
                ProgressSnapshot::new(key.clone(), stored, stored, ProgressPhase::Processing)
                    .with_media_id(record.id.clone()),
            );
            task = task.with_progress_key(key.clone());
        }

        if let Err(e) = self.queue.enqueue(task) {
            // The record stays pending; the janitor requeues it.
            tracing::warn!(
                media_id = %record.id,
                error = %AppError::from(e),
                "Derivation not queued; deferring to janitor"
            );
            if let Some(key) = &request.progress_key {
                self.bus.publish(
                    ProgressSnapshot::new(key.clone(), stored, stored, ProgressPhase::Completed)
                        .with_media_id(record.id.clone()),
                );
            }
        }

        Ok(record)
    }

    /// Open a chunked upload session.
    #[tracing::instrument(skip(self, owner, request), fields(owner = %owner.user_id))]
    pub async fn start_chunked(
        &self,
        owner: &Principal,
        request: StartChunkedUploadRequest,
    ) -> Result<ChunkAck, AppError> {
        request.validate()?;
        let name = self
            .validator
            .validate_all(&request.file_name, None, Some(request.file_size))?;

        let plan = SessionPlan {
            file_name: request.file_name.clone(),
            name,
            file_size: request.file_size,
            chunk_size: request.chunk_size,
            total_chunks: request.total_chunks,
            display: request.display(),
        };
        plan.check_geometry()?;

        let upload_id = request
            .upload_id
            .clone()
            .unwrap_or_else(|| self.ids.next_id());

        {
            let mut sessions = self.write_sessions();
            if sessions.contains_key(&upload_id) || self.bus.latest(&upload_id).is_some() {
                return Err(AppError::Conflict(format!(
                    "Upload {} already exists",
                    upload_id
                )));
            }
            sessions.insert(
                upload_id.clone(),
                Arc::new(Mutex::new(UploadSession::new(
                    upload_id.clone(),
                    owner.clone(),
                    plan,
                ))),
            );
        }

        self.bus.publish(ProgressSnapshot::new(
            upload_id.clone(),
            0,
            request.file_size,
            ProgressPhase::Uploading,
        ));

        tracing::info!(
            upload_id = %upload_id,
            file_size = request.file_size,
            total_chunks = request.total_chunks,
            "Chunked upload started"
        );

        Ok(ChunkAck {
            upload_id,
            chunk_index: 0,
            received: false,
            progress: 0.0,
            is_complete: false,
            media_id: None,
            error_message: None,
        })
    }

    /// Accept one chunk. The request that completes the set starts the commit in the
    /// background and returns immediately.
    ///
    /// The session lock only covers bookkeeping. Spill writes and the read-back of a stored
    /// chunk for a resubmission happen outside it, so one slow disk write never stalls the
    /// other requests of the same upload.
    #[tracing::instrument(skip(self, owner, data), fields(len = data.len()))]
    pub async fn upload_chunk(
        self: &Arc<Self>,
        owner: &Principal,
        upload_id: &str,
        chunk_index: u32,
        data: Bytes,
    ) -> Result<ChunkAck, AppError> {
        let session = self.session(upload_id)?;
        let len = data.len() as u64;

        let placement = {
            let mut guard = session.lock().await;
            if guard.owner.user_id != owner.user_id {
                return Err(AppError::Unauthorized(format!(
                    "Upload {} belongs to another user",
                    upload_id
                )));
            }
            guard.check_chunk(chunk_index, len)?;
            guard.touch();
            match guard.stored_chunk(chunk_index) {
                Some(stored) => Placement::Resubmitted(stored),
                None => self.place(&mut guard, chunk_index, len)?,
            }
        };

        let chunk = match placement {
            Placement::Resubmitted(stored) => {
                return self
                    .acknowledge_resubmission(&session, upload_id, chunk_index, stored, &data)
                    .await;
            }
            Placement::Memory => ChunkData::Memory(data.clone()),
            Placement::Spill(path) => {
                if let Err(e) = tokio::fs::write(&path, &data).await {
                    let _ = tokio::fs::remove_file(&path).await;
                    return Err(e.into());
                }
                ChunkData::Spilled(path)
            }
        };

        let (ack, snapshot, commit) = {
            let mut guard = session.lock().await;
            if let Err(e) = guard.check_chunk(chunk_index, len) {
                drop(guard);
                self.discard_chunk(chunk).await;
                return Err(e);
            }
            // A racing submission of the same index landed first.
            if let Some(stored) = guard.stored_chunk(chunk_index) {
                drop(guard);
                self.discard_chunk(chunk).await;
                return self
                    .acknowledge_resubmission(&session, upload_id, chunk_index, stored, &data)
                    .await;
            }
            guard.store_chunk(chunk_index, chunk, len);

            let complete = guard.is_complete();
            let ack = ChunkAck {
                upload_id: upload_id.to_string(),
                chunk_index,
                received: true,
                progress: guard.progress(),
                is_complete: complete,
                media_id: None,
                error_message: None,
            };
            let snapshot = ProgressSnapshot::new(
                upload_id,
                guard.received_bytes(),
                guard.plan.file_size,
                ProgressPhase::Uploading,
            );
            let commit = complete.then(|| {
                let request = IngestRequest {
                    owner: guard.owner.clone(),
                    filename: guard.plan.file_name.clone(),
                    content_type: None,
                    declared_size: Some(guard.plan.file_size),
                    display: guard.plan.display.clone(),
                    progress_key: Some(upload_id.to_string()),
                };
                (request, guard.begin_commit())
            });
            (ack, snapshot, commit)
        };

        self.bus.publish(snapshot);

        if let Some((request, batch)) = commit {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move { coordinator.commit(session, request, batch).await });
        }

        Ok(ack)
    }

    /// Decide where a new chunk goes. Memory is reserved against the global ceiling in one
    /// atomic step; a chunk that does not fit, or would push its session past the spill
    /// threshold, goes to disk instead.
    fn place(&self, session: &mut UploadSession, index: u32, len: u64) -> Result<Placement, AppError> {
        if session.memory_bytes() + len <= self.config.spill_threshold_bytes
            && self.reserve_memory(len)
        {
            return Ok(Placement::Memory);
        }
        Ok(Placement::Spill(session.spill_path(index)?))
    }

    fn reserve_memory(&self, len: u64) -> bool {
        let ceiling = self.config.memory_ceiling_bytes;
        self.memory_in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(len).filter(|total| *total <= ceiling)
            })
            .is_ok()
    }

    /// Give back whatever an unstored chunk was holding.
    async fn discard_chunk(&self, chunk: ChunkData) {
        match chunk {
            ChunkData::Memory(bytes) => {
                self.memory_in_use
                    .fetch_sub(bytes.len() as u64, Ordering::AcqRel);
            }
            ChunkData::Spilled(path) => {
                let _ = tokio::fs::remove_file(&path).await;
            }
        }
    }

    /// Identical resubmissions succeed without changing the session; different content for
    /// an already received index is a conflict.
    async fn acknowledge_resubmission(
        &self,
        session: &Mutex<UploadSession>,
        upload_id: &str,
        chunk_index: u32,
        stored: ChunkData,
        data: &Bytes,
    ) -> Result<ChunkAck, AppError> {
        let same = match stored.load().await {
            Ok(bytes) => bytes == *data,
            Err(e) => {
                // The spill directory goes away once the session commits or expires.
                session.lock().await.check_chunk(chunk_index, data.len() as u64)?;
                return Err(e.into());
            }
        };
        if !same {
            return Err(AppError::Conflict(format!(
                "Chunk {} of upload {} was already received with different content",
                chunk_index, upload_id
            )));
        }

        let mut guard = session.lock().await;
        guard.touch();
        Ok(ChunkAck {
            upload_id: upload_id.to_string(),
            chunk_index,
            received: true,
            progress: guard.progress(),
            is_complete: guard.is_complete(),
            media_id: None,
            error_message: None,
        })
    }

    /// Assemble a complete session in chunk order and ingest it.
    async fn commit(
        self: Arc<Self>,
        session: Arc<Mutex<UploadSession>>,
        request: IngestRequest,
        batch: CommitBatch,
    ) {
        let CommitBatch {
            chunks,
            memory_bytes,
            spill_dir,
        } = batch;
        let upload_id = request.progress_key.clone().unwrap_or_default();

        let stream = futures::stream::iter(chunks).then(|chunk| async move { chunk.load().await });
        let reader: ByteReader = Box::pin(StreamReader::new(Box::pin(stream)));
        let result = self.ingest(request, reader).await;

        drop(spill_dir);
        self.memory_in_use.fetch_sub(memory_bytes, Ordering::AcqRel);

        let mut guard = session.lock().await;
        guard.touch();
        match result {
            Ok(record) => {
                tracing::info!(upload_id = %upload_id, media_id = %record.id, "Chunked upload committed");
                guard.state = SessionState::Completed {
                    media_id: record.id,
                };
            }
            Err(e) => {
                tracing::warn!(upload_id = %upload_id, error = %e, "Chunked upload commit failed");
                self.publish_failure(&upload_id, &e);
                guard.state = SessionState::Failed {
                    reason: e.failure_reason(),
                };
            }
        }
    }

    /// Drop sessions idle past their TTL. Sessions still receiving chunks end with a
    /// `failed` progress event.
    pub async fn expire_idle(&self) -> usize {
        let ttl = Duration::from_secs(self.config.idle_ttl_secs);
        let candidates: Vec<(String, Arc<Mutex<UploadSession>>)> = self
            .read_sessions()
            .iter()
            .map(|(id, session)| (id.clone(), session.clone()))
            .collect();

        let mut expired = 0;
        for (id, session) in candidates {
            // A held lock means the session is in use right now.
            let Ok(mut guard) = session.try_lock() else {
                continue;
            };
            if guard.idle_for() < ttl || guard.state == SessionState::Committing {
                continue;
            }

            if guard.state == SessionState::Receiving {
                let reason = AppError::IdleTimeout(id.clone()).failure_reason();
                self.bus.publish(
                    ProgressSnapshot::new(
                        id.clone(),
                        guard.received_bytes(),
                        guard.plan.file_size,
                        ProgressPhase::Failed,
                    )
                    .with_error(reason.clone()),
                );
                guard.state = SessionState::Failed { reason };
                tracing::info!(upload_id = %id, "Upload session expired while receiving");
            }

            let released = guard.release();
            self.memory_in_use.fetch_sub(released, Ordering::AcqRel);
            drop(guard);
            self.write_sessions().remove(&id);
            expired += 1;
        }
        expired
    }

    fn session(&self, upload_id: &str) -> Result<Arc<Mutex<UploadSession>>, AppError> {
        self.read_sessions()
            .get(upload_id)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("Upload {} not found", upload_id)))
    }

    fn publish_failure(&self, upload_id: &str, error: &AppError) {
        let (uploaded, total) = self
            .bus
            .latest(upload_id)
            .map(|s| (s.uploaded_bytes, s.total_bytes))
            .unwrap_or_default();
        self.bus.publish(
            ProgressSnapshot::new(upload_id, uploaded, total, ProgressPhase::Failed)
                .with_error(error.failure_reason()),
        );
    }

    /// Best-effort removal of an original whose record was never written.
    async fn discard_object(&self, key: &str) {
        if let Err(e) = self.storage.delete(key).await {
            tracing::warn!(storage_key = %key, error = %e, "Failed to remove uncommitted object");
        }
    }

    fn read_sessions(&self) -> RwLockReadGuard<'_, SessionMap> {
        self.sessions.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_sessions(&self) -> RwLockWriteGuard<'_, SessionMap> {
        self.sessions
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Fill up to [`SNIFF_LEN`] bytes, stopping early only at end of input.
async fn read_header(reader: &mut ByteReader) -> std::io::Result<Vec<u8>> {
    let mut header = vec![0u8; SNIFF_LEN];
    let mut filled = 0;
    while filled < header.len() {
        let n = reader.read(&mut header[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    header.truncate(filled);
    Ok(header)
}

/// Publishes `uploading` snapshots as a single-shot body is read.
struct ProgressReader {
    inner: ByteReader,
    bus: ProgressBus,
    key: String,
    total: u64,
    read: u64,
    reported: u64,
}

impl ProgressReader {
    fn new(inner: ByteReader, bus: ProgressBus, key: String, total: u64) -> Self {
        Self {
            inner,
            bus,
            key,
            total,
            read: 0,
            reported: 0,
        }
    }
}

impl AsyncRead for ProgressReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = self.inner.as_mut().poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = &poll {
            let this = &mut *self;
            this.read += (buf.filled().len() - before) as u64;
            if this.read - this.reported >= PROGRESS_STEP_BYTES {
                this.reported = this.read;
                this.bus.publish(ProgressSnapshot::new(
                    this.key.clone(),
                    this.read,
                    this.total.max(this.read),
                    ProgressPhase::Uploading,
                ));
            }
        }
        poll
    }
}
