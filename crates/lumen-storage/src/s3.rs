use crate::keys::validate_key;
use crate::traits::{
    check_range, ByteReader, ObjectInfo, Storage, StorageError, StorageResult, StoredObject,
};
use crate::StorageBackend;
use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use http::Method;
use lumen_core::config::StorageConfig;
use object_store::aws::{AmazonS3, AmazonS3Builder};
use object_store::path::Path;
use object_store::signer::Signer;
use object_store::Error as ObjectStoreError;
use object_store::{GetOptions, GetRange, ObjectStore, ObjectStoreExt, WriteMultipart};
use std::ops::Range;
use std::time::Duration;
use tokio::io::AsyncReadExt;

/// Size of each part handed to the multipart writer.
const PART_SIZE: usize = 8 * 1024 * 1024;
/// Parts allowed in flight before the reader is throttled.
const MAX_IN_FLIGHT_PARTS: usize = 4;

/// S3 storage implementation
#[derive(Clone)]
pub struct S3Storage {
    store: AmazonS3,
    bucket: String,
}

impl S3Storage {
    /// Create a new S3Storage instance
    ///
    /// Credentials fall back to the standard AWS environment when the config leaves them
    /// unset. `s3_endpoint` selects an S3-compatible provider (e.g. "http://localhost:9000"
    /// for MinIO).
    pub async fn new(config: &StorageConfig) -> StorageResult<Self> {
        let bucket = config
            .s3_bucket
            .clone()
            .ok_or_else(|| StorageError::ConfigError("S3_BUCKET not configured".to_string()))?;

        let mut builder = AmazonS3Builder::from_env()
            .with_region(config.s3_region.clone())
            .with_bucket_name(bucket.clone());

        if let (Some(access_key), Some(secret_key)) = (&config.s3_access_key, &config.s3_secret_key)
        {
            builder = builder
                .with_access_key_id(access_key.clone())
                .with_secret_access_key(secret_key.clone());
        }

        if let Some(ref endpoint) = config.s3_endpoint {
            let allow_http = endpoint.starts_with("http://");
            builder = builder
                .with_endpoint(endpoint.clone())
                .with_allow_http(allow_http);
        }

        let store = builder
            .build()
            .map_err(|e| StorageError::ConfigError(e.to_string()))?;

        Ok(S3Storage { store, bucket })
    }

    fn location(key: &str) -> StorageResult<Path> {
        validate_key(key).map_err(|e| StorageError::InvalidKey(e.to_string()))?;
        Ok(Path::from(key.to_string()))
    }

    fn classify(err: ObjectStoreError, key: &str) -> StorageError {
        match err {
            ObjectStoreError::NotFound { .. } => StorageError::NotFound(key.to_string()),
            ObjectStoreError::PermissionDenied { .. } | ObjectStoreError::Unauthenticated { .. } => {
                StorageError::Auth(err.to_string())
            }
            other => StorageError::BackendError(other.to_string()),
        }
    }

    async fn write_parts(writer: &mut WriteMultipart, reader: &mut ByteReader) -> StorageResult<u64> {
        let mut buffer = vec![0u8; PART_SIZE];
        let mut total = 0u64;

        loop {
            let read = reader.read(&mut buffer).await.map_err(|e| {
                StorageError::UploadFailed(format!("Failed to read from stream: {}", e))
            })?;
            if read == 0 {
                break;
            }
            writer
                .wait_for_capacity(MAX_IN_FLIGHT_PARTS)
                .await
                .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
            writer.write(&buffer[..read]);
            total += read as u64;
        }

        Ok(total)
    }

    fn wrap_stream(
        &self,
        result: object_store::GetResult,
        key: &str,
    ) -> crate::traits::ByteStream {
        let bucket = self.bucket.clone();
        let key = key.to_string();
        Box::pin(result.into_stream().map(move |res| {
            res.map_err(|e| {
                tracing::error!(
                    bucket = %bucket,
                    key = %key,
                    error = %e,
                    "S3 stream download error"
                );
                StorageError::DownloadFailed(e.to_string())
            })
        }))
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn put_stream(
        &self,
        key: &str,
        _content_type: &str,
        mut reader: ByteReader,
    ) -> StorageResult<u64> {
        let location = Self::location(key)?;
        let start = std::time::Instant::now();

        // Objects only become visible once the multipart upload completes.
        let upload = self
            .store
            .put_multipart(&location)
            .await
            .map_err(|e| Self::classify(e, key))?;
        let mut writer = WriteMultipart::new(upload);

        let size = match Self::write_parts(&mut writer, &mut reader).await {
            Ok(size) => size,
            Err(e) => {
                if let Err(abort) = writer.abort().await {
                    tracing::warn!(error = %abort, key = %key, "S3 multipart abort failed");
                }
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 upload failed"
                );
                return Err(e);
            }
        };

        writer.finish().await.map_err(|e| {
            tracing::error!(
                error = %e,
                bucket = %self.bucket,
                key = %key,
                size_bytes = size,
                duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                "S3 upload failed"
            );
            match Self::classify(e, key) {
                StorageError::BackendError(msg) => StorageError::UploadFailed(msg),
                other => other,
            }
        })?;

        tracing::info!(
            bucket = %self.bucket,
            key = %key,
            size_bytes = size,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 upload successful"
        );

        Ok(size)
    }

    async fn get_stream(&self, storage_key: &str) -> StorageResult<StoredObject> {
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        let result = self.store.get(&location).await.map_err(|e| {
            let err = Self::classify(e, storage_key);
            if !matches!(err, StorageError::NotFound(_)) {
                tracing::error!(
                    error = %err,
                    bucket = %self.bucket,
                    key = %storage_key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 download failed"
                );
            }
            err
        })?;

        let size = result.meta.size;
        Ok(StoredObject {
            stream: self.wrap_stream(result, storage_key),
            content_length: size,
            total_size: size,
        })
    }

    async fn get_range(&self, storage_key: &str, range: Range<u64>) -> StorageResult<StoredObject> {
        let location = Self::location(storage_key)?;

        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| Self::classify(e, storage_key))?;
        check_range(&range, meta.size)?;

        let options = GetOptions {
            range: Some(GetRange::Bounded(range.clone())),
            ..Default::default()
        };
        let result = self
            .store
            .get_opts(&location, options)
            .await
            .map_err(|e| Self::classify(e, storage_key))?;

        Ok(StoredObject {
            stream: self.wrap_stream(result, storage_key),
            content_length: range.end - range.start,
            total_size: meta.size,
        })
    }

    async fn delete(&self, storage_key: &str) -> StorageResult<()> {
        let location = Self::location(storage_key)?;
        let start = std::time::Instant::now();

        match self.store.delete(&location).await {
            Ok(()) | Err(ObjectStoreError::NotFound { .. }) => {}
            Err(e) => {
                tracing::error!(
                    error = %e,
                    bucket = %self.bucket,
                    key = %storage_key,
                    duration_ms = start.elapsed().as_secs_f64() * 1000.0,
                    "S3 delete failed"
                );
                return Err(StorageError::DeleteFailed(e.to_string()));
            }
        }

        tracing::info!(
            bucket = %self.bucket,
            key = %storage_key,
            duration_ms = start.elapsed().as_secs_f64() * 1000.0,
            "S3 delete successful"
        );

        Ok(())
    }

    async fn exists(&self, storage_key: &str) -> StorageResult<bool> {
        let location = Self::location(storage_key)?;
        match self.store.head(&location).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(Self::classify(e, storage_key)),
        }
    }

    async fn size(&self, storage_key: &str) -> StorageResult<u64> {
        let location = Self::location(storage_key)?;
        let meta = self
            .store
            .head(&location)
            .await
            .map_err(|e| Self::classify(e, storage_key))?;
        Ok(meta.size)
    }

    async fn resolve_url(&self, storage_key: &str, expires_in: Duration) -> StorageResult<String> {
        let location = Self::location(storage_key)?;
        let url = self
            .store
            .signed_url(Method::GET, &location, expires_in)
            .await
            .map_err(|e| Self::classify(e, storage_key))?;

        Ok(url.to_string())
    }

    async fn list_page(
        &self,
        start_after: Option<&str>,
        limit: usize,
    ) -> StorageResult<Vec<ObjectInfo>> {
        let listing = match start_after {
            Some(after) => {
                let offset = Path::from(after.to_string());
                self.store.list_with_offset(None, &offset)
            }
            None => self.store.list(None),
        };

        listing
            .take(limit)
            .map_ok(|meta| ObjectInfo {
                key: meta.location.to_string(),
                size: meta.size,
                last_modified: meta.last_modified,
            })
            .try_collect()
            .await
            .map_err(|e| Self::classify(e, "inventory"))
    }

    fn backend_type(&self) -> StorageBackend {
        StorageBackend::S3
    }
}
