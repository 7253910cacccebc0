use crate::keys::validate_key;
use crate::traits::{
    check_range, ByteReader, ObjectInfo, Storage, StorageError, StorageResult, StoredObject,
};
use crate::StorageBackend;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

/// Prefix of in-flight temporary files; never visible through `list_page`.
const PARTIAL_PREFIX: &str = ".partial-";

/// Local filesystem storage implementation
#[derive(Clone)]
pub struct LocalStorage {
    base_path: PathBuf,
    base_url: String,
}

impl LocalStorage {
    /// Create a new LocalStorage instance
    ///
    /// # Arguments
    /// * `base_path` - Root directory for file storage (e.g., "/var/lib/lumen/media")
    /// * `base_url` - Path prefix a reverse proxy serves the root under (e.g., "/media")
    pub async fn new(base_path: impl Into<PathBuf>, base_url: String) -> StorageResult<Self> {
        let base_path = base_path.into();

        fs::create_dir_all(&base_path).await.map_err(|e| {
            StorageError::ConfigError(format!(
                "Failed to create storage directory {}: {}",
                base_path.display(),
                e
            ))
        })?;

        let base_path = base_path.canonicalize().map_err(|e| {
            StorageError::ConfigError(format!("Failed to canonicalize base path: {}", e))
        })?;

        Ok(LocalStorage {
            base_path,
            base_url,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Convert storage key to filesystem path with security validation
    ///
    /// Rejects keys that contain `..`, start with `/`, or resolve outside the base
    /// directory (e.g. through a symlink).
    fn key_to_path(&self, storage_key: &str) -> StorageResult<PathBuf> {
        if storage_key.contains("..") || storage_key.starts_with('/') {
            return Err(StorageError::InvalidKey(
                "Storage key contains invalid characters".to_string(),
            ));
        }
        validate_key(storage_key).map_err(|e| StorageError::InvalidKey(e.to_string()))?;

        let path = self.base_path.join(storage_key);

        // The deepest existing ancestor must stay inside the root.
        let mut ancestor = path.as_path();
        loop {
            if let Ok(canonical) = ancestor.canonicalize() {
                if canonical.strip_prefix(&self.base_path).is_err() {
                    return Err(StorageError::InvalidKey(
                        "Storage key resolves outside storage directory".to_string(),
                    ));
                }
                break;
            }
            match ancestor.parent() {
                Some(parent) => ancestor = parent,
                None => break,
            }
        }

        Ok(path)
    }

    fn generate_url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), key)
    }

    async fn ensure_parent_dir(&self, path: &Path) -> StorageResult<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::from_io(e, &parent.display().to_string()))?;
        }
        Ok(())
    }

    fn partial_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!("{}{}-{}", PARTIAL_PREFIX, Uuid::new_v4(), name))
    }

    async fn write_partial(
        partial: &Path,
        reader: &mut ByteReader,
    ) -> Result<u64, std::io::Error> {
        let mut file = fs::File::create(partial).await?;
        let written = tokio::io::copy(reader, &mut file).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn open_existing(&self, storage_key: &str) -> StorageResult<(fs::File, u64)> {
        let path = self.key_to_path(storage_key)?;
        let file = fs::File::open(&path)
            .await
            .map_err(|e| StorageError::from_io(e, storage_key))?;
        let meta = file
            .metadata()
            .await
            .map_err(|e| StorageError::from_io(e, storage_key))?;
        if !meta.is_file() {
            return Err(StorageError::NotFound(storage_key.to_string()));
        }
        Ok((file, meta.len()))
    }

    /// Walk the tree (blocking) and return every committed object.
    fn collect_inventory(base: &Path) -> std::io::Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut pending = vec![base.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                let name = entry.file_name();
                if name.to_string_lossy().starts_with(PARTIAL_PREFIX) {
                    continue;
                }
                if file_type.is_dir() {
                    pending.push(entry.path());
                } else if file_type.is_file() {
                    let meta = entry.metadata()?;
                    let Ok(relative) = entry.path().strip_prefix(base).map(Path::to_path_buf)
                    else {
                        continue;
                    };
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    let last_modified = meta
                        .modified()
                        .map(DateTime::<Utc>::from)
                        .unwrap_or_else(|_| Utc::now());
                    objects.push(ObjectInfo {
                        key,
                        size: meta.len(),
                        last_modified,
                    });
                }
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    /// Walk the tree (blocking) and delete temporary files last modified before `older_than`.
    fn sweep_partials(base: &Path, older_than: DateTime<Utc>) -> std::io::Result<usize> {
        let mut removed = 0;
        let mut pending = vec![base.to_path_buf()];

        while let Some(dir) = pending.pop() {
            for entry in std::fs::read_dir(&dir)? {
                let entry = entry?;
                let file_type = entry.file_type()?;
                if file_type.is_dir() {
                    pending.push(entry.path());
                    continue;
                }
                if !file_type.is_file()
                    || !entry.file_name().to_string_lossy().starts_with(PARTIAL_PREFIX)
                {
                    continue;
                }
                let modified = entry.metadata()?.modified().map(DateTime::<Utc>::from)?;
                if modified >= older_than {
                    continue;
                }
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => removed += 1,
                    // Renamed into place or removed by its writer meanwhile.
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn put_stream(
        &self,
        key: &str,
        _content_type: &str,
        mut reader: ByteReader,
    ) -> StorageResult<u64> {
        let path = self.key_to_path(key)?;
        self.ensure_parent_dir(&path).await?;

        let start = std::time::Instant::now();
        let partial = Self::partial_path(&path);

        // Bytes land in a sibling temp file and are renamed into place once synced.
        let written = match Self::write_partial(&partial, &mut reader).await {
            Ok(written) => written,
            Err(e) => {
                if let Err(cleanup) = fs::remove_file(&partial).await {
                    tracing::debug!(error = %cleanup, path = %partial.display(), "Partial file cleanup failed");
                }
                tracing::warn!(
                    error = %e,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "Local storage upload failed"
                );
                return Err(match e.kind() {
                    std::io::ErrorKind::StorageFull => StorageError::Space(e.to_string()),
                    std::io::ErrorKind::PermissionDenied => StorageError::Auth(e.to_string()),
                    _ => StorageError::UploadFailed(format!(
                        "Failed to write file {}: {}",
                        path.display(),
                        e
                    )),
                });
            }
        };

        if let Err(e) = fs::rename(&partial, &path).await {
            let _ = fs::remove_file(&partial).await;
            return Err(StorageError::from_io(e, key));
        }

        tracing::info!(
            path = %path.display(),
            key = %key,
            size_bytes = written,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage upload successful"
        );

        Ok(written)
    }

    async fn get_stream(&self, storage_key: &str) -> StorageResult<StoredObject> {
        let (file, size) = self.open_existing(storage_key).await?;

        let key = storage_key.to_string();
        let stream = tokio_util::io::ReaderStream::new(file).map(move |result| {
            result.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Local storage stream download error");
                StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))
            })
        });

        Ok(StoredObject {
            stream: Box::pin(stream),
            content_length: size,
            total_size: size,
        })
    }

    async fn get_range(&self, storage_key: &str, range: Range<u64>) -> StorageResult<StoredObject> {
        let (mut file, size) = self.open_existing(storage_key).await?;
        check_range(&range, size)?;

        file.seek(std::io::SeekFrom::Start(range.start))
            .await
            .map_err(|e| StorageError::from_io(e, storage_key))?;
        let length = range.end - range.start;

        let key = storage_key.to_string();
        let stream = tokio_util::io::ReaderStream::new(file.take(length)).map(move |result| {
            result.map_err(|e| {
                tracing::error!(key = %key, error = %e, "Local storage range read error");
                StorageError::DownloadFailed(format!("Failed to read chunk: {}", e))
            })
        });

        Ok(StoredObject {
            stream: Box::pin(stream),
            content_length: length,
            total_size: size,
        })
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let path = self.key_to_path(storage_key)?;
        let start = std::time::Instant::now();

        match fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(StorageError::DeleteFailed(format!(
                    "Failed to delete file {}: {}",
                    path.display(),
                    e
                )))
            }
        }

        tracing::info!(
            path = %path.display(),
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "Local storage delete successful"
        );

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let path = self.key_to_path(storage_key)?;
        match fs::metadata(&path).await {
            Ok(meta) => Ok(meta.is_file()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::from_io(e, storage_key)),
        }
    }

    async fn size(&self, storage_key: &str) -> StorageResult<u64> {
        let path = self.key_to_path(storage_key)?;
        let meta = fs::metadata(&path)
            .await
            .map_err(|e| StorageError::from_io(e, storage_key))?;
        Ok(meta.len())
    }

    async fn resolve_url(&self, storage_key: &str, _expires_in: Duration) -> StorageResult<String> {
        self.key_to_path(storage_key)?;
        Ok(self.generate_url(storage_key))
    }

    async fn list_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<ObjectInfo>> {
        let base = self.base_path.clone();
        let inventory = tokio::task::spawn_blocking(move || Self::collect_inventory(&base))
            .await
            .map_err(|e| StorageError::BackendError(format!("Inventory task failed: {}", e)))?
            .map_err(|e| StorageError::from_io(e, "inventory"))?;

        Ok(inventory
            .into_iter()
            .filter(|o| start_after.is_none_or(|after| o.key.as_str() > after))
            .take(limit)
            .collect())
    }

    async fn remove_stale_partials(&self, older_than: DateTime<Utc>) -> StorageResult<usize> {
        let base = self.base_path.clone();
        tokio::task::spawn_blocking(move || Self::sweep_partials(&base, older_than))
            .await
            .map_err(|e| StorageError::BackendError(format!("Partial sweep task failed: {}", e)))?
            .map_err(|e| StorageError::from_io(e, "partial sweep"))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::Local
    }
}

#[cfg(all(test, feature = "storage-local"))]
mod tests {
    use super::*;
    use bytes::Bytes;
    use futures::TryStreamExt;
    use tempfile::tempdir;

    async fn storage(dir: &Path) -> LocalStorage {
        LocalStorage::new(dir, "/media".to_string()).await.unwrap()
    }

    async fn read_all(object: StoredObject) -> Vec<u8> {
        object
            .stream
            .try_fold(Vec::new(), |mut acc, chunk| async move {
                acc.extend_from_slice(&chunk);
                Ok(acc)
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_and_get_stream() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let written = storage
            .put_bytes("2024/01/01/u/m.png", "image/png", Bytes::from_static(b"test data"))
            .await
            .unwrap();
        assert_eq!(written, 9);

        let object = storage.get_stream("2024/01/01/u/m.png").await.unwrap();
        assert_eq!(object.content_length, 9);
        assert_eq!(read_all(object).await, b"test data");
        assert_eq!(storage.size("2024/01/01/u/m.png").await.unwrap(), 9);
    }

    #[tokio::test]
    async fn test_stale_partials_are_swept() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_bytes("2024/01/01/u/kept.png", "image/png", Bytes::from_static(b"kept"))
            .await
            .unwrap();
        let leftover = storage
            .base_path()
            .join("2024/01/01/u")
            .join(format!("{}abc-m.png", PARTIAL_PREFIX));
        std::fs::write(&leftover, b"half").unwrap();

        let earlier = Utc::now() - chrono::Duration::hours(1);
        assert_eq!(storage.remove_stale_partials(earlier).await.unwrap(), 0);
        assert!(leftover.exists());

        let later = Utc::now() + chrono::Duration::seconds(1);
        assert_eq!(storage.remove_stale_partials(later).await.unwrap(), 1);
        assert!(!leftover.exists());
        assert!(storage.exists("2024/01/01/u/kept.png").await.unwrap());
    }

    #[tokio::test]
    async fn test_path_traversal_rejected() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let result = storage.get_stream("../../../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.delete("../etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));

        let result = storage.exists("/etc/passwd").await;
        assert!(matches!(result, Err(StorageError::InvalidKey(_))));
    }

    #[tokio::test]
    async fn test_delete_is_idempotent() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        storage
            .put_bytes("a/b.jpg", "image/jpeg", Bytes::from_static(b"x"))
            .await
            .unwrap();
        storage.delete("a/b.jpg").await.unwrap();
        storage.delete("a/b.jpg").await.unwrap();
        assert!(!storage.exists("a/b.jpg").await.unwrap());
        assert!(storage.delete("nonexistent/file.txt").await.is_ok());
    }

    #[tokio::test]
    async fn test_missing_object_is_not_found() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        assert!(matches!(
            storage.get_stream("nope/missing.png").await,
            Err(StorageError::NotFound(_))
        ));
        assert!(matches!(
            storage.size("nope/missing.png").await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_stream_leaves_no_object() {
        struct Broken;
        impl tokio::io::AsyncRead for Broken {
            fn poll_read(
                self: std::pin::Pin<&mut Self>,
                _cx: &mut std::task::Context<'_>,
                _buf: &mut tokio::io::ReadBuf<'_>,
            ) -> std::task::Poll<std::io::Result<()>> {
                std::task::Poll::Ready(Err(std::io::Error::other("connection reset")))
            }
        }

        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;

        let result = storage
            .put_stream("x/broken.mp4", "video/mp4", Box::pin(Broken))
            .await;
        assert!(matches!(result, Err(StorageError::UploadFailed(_))));
        assert!(!storage.exists("x/broken.mp4").await.unwrap());
        assert!(storage.list_page(None, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_range() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        storage
            .put_bytes("r/v.mp4", "video/mp4", Bytes::from_static(b"0123456789"))
            .await
            .unwrap();

        let object = storage.get_range("r/v.mp4", 2..6).await.unwrap();
        assert_eq!(object.content_length, 4);
        assert_eq!(object.total_size, 10);
        assert_eq!(read_all(object).await, b"2345");

        assert!(matches!(
            storage.get_range("r/v.mp4", 8..12).await,
            Err(StorageError::InvalidRange(_))
        ));
    }

    #[tokio::test]
    async fn test_list_page_is_sorted_and_resumable() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        for key in ["b/2.png", "a/1.png", "c/3.png"] {
            storage
                .put_bytes(key, "image/png", Bytes::from_static(b"z"))
                .await
                .unwrap();
        }

        let first = storage.list_page(None, 2).await.unwrap();
        let keys: Vec<_> = first.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(keys, vec!["a/1.png", "b/2.png"]);

        let rest = storage.list_page(Some("b/2.png"), 2).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].key, "c/3.png");
    }

    #[tokio::test]
    async fn test_resolve_url_is_relative() {
        let dir = tempdir().unwrap();
        let storage = storage(dir.path()).await;
        let url = storage
            .resolve_url("2024/01/01/u/m.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(url, "/media/2024/01/01/u/m.png");
    }
}
