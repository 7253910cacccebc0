//! Storage abstraction trait
//!
//! This module defines the content store capability set that every backend implements.
//! Callers depend only on [`Storage`]; the factory is the only place that knows which
//! backend is in use.
//!
//! Cancellation follows the usual async contract: dropping an in-flight future aborts the
//! operation at its next await point, and backends clean up partial writes when that happens.

use crate::StorageBackend;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::{Stream, TryStreamExt};
use lumen_core::AppError;
use std::ops::Range;
use std::pin::Pin;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncRead;
use tokio_util::io::StreamReader;

/// Storage operation errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Delete failed: {0}")]
    DeleteFailed(String),

    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Invalid storage key: {0}")]
    InvalidKey(String),

    #[error("Out of space: {0}")]
    Space(String),

    #[error("Access denied: {0}")]
    Auth(String),

    #[error("Operation not supported by this backend: {0}")]
    Unsupported(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("Storage backend error: {0}")]
    BackendError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    ConfigError(String),
}

impl StorageError {
    /// Classify a filesystem error raised while working on `context`.
    pub fn from_io(err: std::io::Error, context: &str) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => StorageError::NotFound(context.to_string()),
            std::io::ErrorKind::StorageFull => {
                StorageError::Space(format!("{}: {}", context, err))
            }
            std::io::ErrorKind::PermissionDenied => {
                StorageError::Auth(format!("{}: {}", context, err))
            }
            _ => StorageError::IoError(err),
        }
    }
}

impl From<StorageError> for AppError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(key) => AppError::NotFound(format!("Object not found: {}", key)),
            StorageError::InvalidKey(msg) => AppError::InvalidInput(msg),
            StorageError::InvalidRange(msg) => AppError::InvalidInput(msg),
            StorageError::Space(msg) => AppError::StorageSpace(msg),
            StorageError::Auth(msg) => AppError::StorageAuth(msg),
            StorageError::ConfigError(msg) => AppError::Internal(msg),
            StorageError::Unsupported(msg) => AppError::Internal(msg),
            other => AppError::StorageIo(other.to_string()),
        }
    }
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Stream of object bytes
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send>>;

/// Reader consumed by streaming uploads
pub type ByteReader = Pin<Box<dyn AsyncRead + Send + Unpin>>;

/// An opened object: its byte stream plus sizes.
pub struct StoredObject {
    pub stream: ByteStream,
    /// Bytes this stream will yield
    pub content_length: u64,
    /// Size of the whole object
    pub total_size: u64,
}

impl StoredObject {
    /// Adapt the byte stream into an `AsyncRead`.
    pub fn into_reader(self) -> ByteReader {
        Box::pin(StreamReader::new(
            self.stream.map_err(|e| std::io::Error::other(e.to_string())),
        ))
    }
}

impl std::fmt::Debug for StoredObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoredObject")
            .field("content_length", &self.content_length)
            .field("total_size", &self.total_size)
            .finish()
    }
}

/// One entry of a backend inventory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Content store capability set.
///
/// Keys are slash-delimited relative paths produced by the path planner. Both backends
/// implement identical semantics.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Write `reader` to `key` until EOF and return the number of bytes stored.
    ///
    /// Writes are atomic: a failed or cancelled write leaves no object behind, and a
    /// successful write to an existing key replaces it whole.
    async fn put_stream(
        &self,
        key: &str,
        content_type: &str,
        reader: ByteReader,
    ) -> StorageResult<u64>;

    /// Write an in-memory buffer to `key`.
    async fn put_bytes(&self, key: &str, content_type: &str, data: Bytes) -> StorageResult<u64> {
        self.put_stream(key, content_type, Box::pin(std::io::Cursor::new(data)))
            .await
    }

    /// Open `key` for streaming reads.
    async fn get_stream(&self, key: &str) -> StorageResult<StoredObject>;

    /// Open the half-open byte `range` of `key`.
    async fn get_range(&self, key: &str, range: Range<u64>) -> StorageResult<StoredObject>;

    /// Delete `key`. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> StorageResult<()>;

    async fn exists(&self, key: &str) -> StorageResult<bool>;

    /// Size in bytes of `key`.
    async fn size(&self, key: &str) -> StorageResult<u64>;

    /// Short-lived URL for direct client access. Local backends return a relative path
    /// meant for a front-door reverse proxy.
    async fn resolve_url(&self, key: &str, expires_in: Duration) -> StorageResult<String>;

    /// Up to `limit` objects whose keys sort strictly after `start_after`, in key order.
    ///
    /// Backends without an inventory capability return [`StorageError::Unsupported`].
    async fn list_page(
        &self,
        _start_after: Option<&str>,
        _limit: usize,
    ) -> StorageResult<Vec<ObjectInfo>> {
        Err(StorageError::Unsupported("object listing".to_string()))
    }

    /// Remove leftovers of writes that were interrupted before they committed and were last
    /// touched before `older_than`. Returns how many were removed. Backends whose writes
    /// leave nothing behind on failure have nothing to do.
    async fn remove_stale_partials(&self, _older_than: DateTime<Utc>) -> StorageResult<usize> {
        Ok(0)
    }

    /// Get the storage backend type
    fn backend_type(&self) -> StorageBackend;
}

/// Validate a half-open range against an object of `size` bytes.
pub fn check_range(range: &Range<u64>, size: u64) -> StorageResult<()> {
    if range.start >= range.end || range.end > size {
        return Err(StorageError::InvalidRange(format!(
            "{}..{} outside object of {} bytes",
            range.start, range.end, size
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use lumen_core::ErrorMetadata;

    #[test]
    fn test_storage_errors_map_to_app_kinds() {
        let cases = [
            (StorageError::NotFound("k".into()), "not-found"),
            (StorageError::Space("full".into()), "storage-space"),
            (StorageError::Auth("denied".into()), "storage-auth"),
            (StorageError::UploadFailed("reset".into()), "storage-io"),
            (StorageError::InvalidKey("..".into()), "invalid-input"),
        ];
        for (err, code) in cases {
            assert_eq!(AppError::from(err).error_code(), code);
        }
    }

    #[test]
    fn test_io_classification() {
        let err = StorageError::from_io(
            std::io::Error::new(std::io::ErrorKind::StorageFull, "disk full"),
            "a/b.png",
        );
        assert!(matches!(err, StorageError::Space(_)));
    }

    #[test]
    fn test_check_range() {
        assert!(check_range(&(0..10), 10).is_ok());
        assert!(check_range(&(5..11), 10).is_err());
        assert!(check_range(&(3..3), 10).is_err());
    }

    #[tokio::test]
    async fn test_stored_object_reads_as_async_read() {
        use tokio::io::AsyncReadExt;

        let chunks: Vec<Result<Bytes, StorageError>> =
            vec![Ok(Bytes::from_static(b"abc")), Ok(Bytes::from_static(b"def"))];
        let object = StoredObject {
            stream: Box::pin(futures::stream::iter(chunks)),
            content_length: 6,
            total_size: 6,
        };
        let mut out = Vec::new();
        object.into_reader().read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdef");
    }
}
