//! Chunked upload session state.
//!
//! A session is guarded by its own mutex inside the coordinator. Nothing here touches the
//! content store or the repository; spilled chunks go to a per-session temporary directory.

use bytes::Bytes;
use lumen_core::models::{fraction, DisplayMetadata, Principal};
use lumen_core::AppError;
use lumen_processing::ValidatedName;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Where a received chunk lives until commit.
#[derive(Debug, Clone)]
pub enum ChunkData {
    Memory(Bytes),
    Spilled(PathBuf),
}

impl ChunkData {
    /// Bytes of this chunk, reading it back from disk if it was spilled.
    pub async fn load(&self) -> std::io::Result<Bytes> {
        match self {
            ChunkData::Memory(bytes) => Ok(bytes.clone()),
            ChunkData::Spilled(path) => tokio::fs::read(path).await.map(Bytes::from),
        }
    }

    pub fn memory_len(&self) -> u64 {
        match self {
            ChunkData::Memory(bytes) => bytes.len() as u64,
            ChunkData::Spilled(_) => 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Receiving,
    Committing,
    Completed { media_id: String },
    Failed { reason: String },
}

/// Declared shape of a chunked upload.
#[derive(Debug, Clone)]
pub struct SessionPlan {
    pub file_name: String,
    pub name: ValidatedName,
    pub file_size: u64,
    pub chunk_size: u64,
    pub total_chunks: u32,
    pub display: DisplayMetadata,
}

impl SessionPlan {
    /// Every chunk but the last is exactly `chunk_size`; the last carries the remainder.
    pub fn check_geometry(&self) -> Result<(), AppError> {
        if self.total_chunks == 0 {
            return Err(AppError::InvalidInput("totalChunks must be at least 1".to_string()));
        }
        let total = u64::from(self.total_chunks);
        let leading = self
            .chunk_size
            .checked_mul(total - 1)
            .ok_or_else(|| AppError::InvalidInput("chunkSize is too large".to_string()))?;
        let capacity = self.chunk_size.checked_mul(total).unwrap_or(u64::MAX);
        if leading >= self.file_size || self.file_size > capacity {
            return Err(AppError::InvalidInput(format!(
                "fileSize {} cannot be split into {} chunks of {} bytes",
                self.file_size, self.total_chunks, self.chunk_size
            )));
        }
        Ok(())
    }

    pub fn expected_len(&self, index: u32) -> u64 {
        if index + 1 == self.total_chunks {
            self.file_size - self.chunk_size * u64::from(self.total_chunks - 1)
        } else {
            self.chunk_size
        }
    }
}

/// Chunks handed to a commit, in index order.
pub struct CommitBatch {
    pub chunks: Vec<ChunkData>,
    pub memory_bytes: u64,
    /// Keeps spilled chunk files alive until the commit finishes.
    pub spill_dir: Option<TempDir>,
}

pub struct UploadSession {
    pub id: String,
    pub owner: Principal,
    pub plan: SessionPlan,
    pub state: SessionState,
    chunks: Vec<Option<ChunkData>>,
    received_count: u32,
    received_bytes: u64,
    memory_bytes: u64,
    spill_dir: Option<TempDir>,
    spill_seq: u64,
    last_activity: Instant,
}

impl UploadSession {
    pub fn new(id: String, owner: Principal, plan: SessionPlan) -> Self {
        let mut chunks = Vec::new();
        chunks.resize_with(plan.total_chunks as usize, || None);
        Self {
            id,
            owner,
            plan,
            state: SessionState::Receiving,
            chunks,
            received_count: 0,
            received_bytes: 0,
            memory_bytes: 0,
            spill_dir: None,
            spill_seq: 0,
            last_activity: Instant::now(),
        }
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn memory_bytes(&self) -> u64 {
        self.memory_bytes
    }

    pub fn progress(&self) -> f64 {
        fraction(self.received_bytes, self.plan.file_size)
    }

    pub fn is_complete(&self) -> bool {
        self.received_count == self.plan.total_chunks
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.elapsed()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Check a submission against the session's state and declared geometry.
    pub fn check_chunk(&self, index: u32, len: u64) -> Result<(), AppError> {
        if self.state != SessionState::Receiving {
            return Err(AppError::Conflict(format!(
                "already-complete: upload {} no longer accepts chunks",
                self.id
            )));
        }
        if index >= self.plan.total_chunks {
            return Err(AppError::InvalidInput(format!(
                "chunkIndex {} out of range (totalChunks {})",
                index, self.plan.total_chunks
            )));
        }
        let expected = self.plan.expected_len(index);
        if len != expected {
            return Err(AppError::InvalidInput(format!(
                "chunk {} has {} bytes, expected {}",
                index, len, expected
            )));
        }
        Ok(())
    }

    /// The chunk already stored at `index`, if any.
    pub fn stored_chunk(&self, index: u32) -> Option<ChunkData> {
        self.chunks.get(index as usize).and_then(Option::clone)
    }

    /// A fresh file path in this session's spill directory. Every call names a new file so
    /// racing submissions of one index never write over each other.
    pub fn spill_path(&mut self, index: u32) -> Result<PathBuf, AppError> {
        let dir = match &self.spill_dir {
            Some(dir) => dir.path().to_path_buf(),
            None => {
                let dir = tempfile::Builder::new()
                    .prefix(&format!("lumen-upload-{}-", self.id))
                    .tempdir()?;
                let path = dir.path().to_path_buf();
                self.spill_dir = Some(dir);
                path
            }
        };
        self.spill_seq += 1;
        Ok(dir.join(format!("{:05}-{}.part", index, self.spill_seq)))
    }

    /// Record a validated chunk. `len` is the chunk's byte count; spilled chunks are
    /// already on disk.
    pub fn store_chunk(&mut self, index: u32, chunk: ChunkData, len: u64) {
        self.memory_bytes += chunk.memory_len();
        self.chunks[index as usize] = Some(chunk);
        self.received_count += 1;
        self.received_bytes += len;
        self.touch();
    }

    /// Move every chunk out for assembly and enter the commit phase.
    pub fn begin_commit(&mut self) -> CommitBatch {
        self.state = SessionState::Committing;
        let chunks = self.chunks.iter_mut().filter_map(Option::take).collect();
        let memory_bytes = std::mem::take(&mut self.memory_bytes);
        CommitBatch {
            chunks,
            memory_bytes,
            spill_dir: self.spill_dir.take(),
        }
    }

    /// Drop buffered chunks and return the in-memory bytes released.
    pub fn release(&mut self) -> u64 {
        for chunk in self.chunks.iter_mut() {
            chunk.take();
        }
        self.spill_dir.take();
        std::mem::take(&mut self.memory_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::models::MediaKind;

    fn plan(file_size: u64, chunk_size: u64, total_chunks: u32) -> SessionPlan {
        SessionPlan {
            file_name: "clip.mp4".to_string(),
            name: ValidatedName {
                extension: "mp4".to_string(),
                kind: MediaKind::Video,
            },
            file_size,
            chunk_size,
            total_chunks,
            display: DisplayMetadata::default(),
        }
    }

    fn session(file_size: u64, chunk_size: u64, total_chunks: u32) -> UploadSession {
        UploadSession::new(
            "up-1".to_string(),
            Principal::new("u1", None),
            plan(file_size, chunk_size, total_chunks),
        )
    }

    #[test]
    fn test_geometry() {
        assert!(plan(10, 4, 3).check_geometry().is_ok());
        assert!(plan(12, 4, 3).check_geometry().is_ok());
        assert!(plan(8, 4, 3).check_geometry().is_err());
        assert!(plan(13, 4, 3).check_geometry().is_err());
        assert!(plan(1, 1, 1).check_geometry().is_ok());
        assert_eq!(plan(10, 4, 3).expected_len(0), 4);
        assert_eq!(plan(10, 4, 3).expected_len(2), 2);
    }

    #[test]
    fn test_chunk_checks() {
        let s = session(10, 4, 3);
        assert!(s.check_chunk(0, 4).is_ok());
        assert!(s.check_chunk(2, 2).is_ok());
        assert!(matches!(s.check_chunk(3, 4), Err(AppError::InvalidInput(_))));
        assert!(matches!(s.check_chunk(1, 3), Err(AppError::InvalidInput(_))));
    }

    async fn spill(s: &mut UploadSession, index: u32, data: &'static [u8]) {
        let path = s.spill_path(index).unwrap();
        tokio::fs::write(&path, data).await.unwrap();
        s.store_chunk(index, ChunkData::Spilled(path), data.len() as u64);
    }

    #[tokio::test]
    async fn test_store_spill_and_commit_in_order() {
        let mut s = session(10, 4, 3);
        spill(&mut s, 2, b"ij").await;
        s.store_chunk(0, ChunkData::Memory(Bytes::from_static(b"abcd")), 4);
        assert!(!s.is_complete());
        spill(&mut s, 1, b"efgh").await;
        assert!(s.is_complete());
        assert_eq!(s.received_bytes(), 10);
        assert_eq!(s.memory_bytes(), 4);

        let stored = s.stored_chunk(1).unwrap();
        assert_eq!(stored.load().await.unwrap(), Bytes::from_static(b"efgh"));
        assert_eq!(stored.memory_len(), 0);
        assert!(s.stored_chunk(0).is_some());

        let batch = s.begin_commit();
        assert_eq!(s.state, SessionState::Committing);
        assert_eq!(batch.memory_bytes, 4);
        let mut assembled = Vec::new();
        for chunk in &batch.chunks {
            assembled.extend_from_slice(&chunk.load().await.unwrap());
        }
        assert_eq!(assembled, b"abcdefghij");
        assert!(matches!(s.check_chunk(0, 4), Err(AppError::Conflict(_))));
    }

    #[test]
    fn test_spill_paths_are_unique_per_call() {
        let mut s = session(10, 4, 3);
        let first = s.spill_path(1).unwrap();
        let second = s.spill_path(1).unwrap();
        assert_ne!(first, second);
        assert_eq!(first.parent(), second.parent());
    }
}
