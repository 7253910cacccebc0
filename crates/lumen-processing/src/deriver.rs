//! Deriver contract shared by the image and video derivers.

use async_trait::async_trait;
use bytes::Bytes;
use lumen_core::config::MediaConfig;
use lumen_core::models::{MediaAttributes, MediaKind};
use lumen_core::AppError;
use lumen_storage::ByteReader;
use std::sync::Arc;
use tempfile::TempPath;

use crate::image::ImageDeriver;
use crate::video::VideoDeriver;

/// Input handed to a deriver: the original as a stream plus what the upload declared.
pub struct DeriveInput {
    pub media_id: String,
    pub reader: ByteReader,
    pub filename: String,
    pub mime_type: String,
    pub size_bytes: u64,
}

impl std::fmt::Debug for DeriveInput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeriveInput")
            .field("media_id", &self.media_id)
            .field("filename", &self.filename)
            .field("mime_type", &self.mime_type)
            .field("size_bytes", &self.size_bytes)
            .finish_non_exhaustive()
    }
}

/// Bytes of a derived artifact, held in memory or in a temp file removed on drop.
#[derive(Debug)]
pub enum ArtifactData {
    Memory(Bytes),
    File(TempPath),
}

#[derive(Debug)]
pub struct OptimizedArtifact {
    /// Extension of the optimised key, without the dot
    pub extension: String,
    pub content_type: String,
    pub data: ArtifactData,
}

/// Everything a deriver produced. Missing derivatives are reported in `issues`.
#[derive(Debug, Default)]
pub struct Derivation {
    pub attributes: MediaAttributes,
    /// JPEG thumbnail
    pub thumbnail: Option<Bytes>,
    pub optimized: Option<OptimizedArtifact>,
    pub issues: Vec<String>,
    /// Derivatives were not attempted because a required capability is missing.
    pub skipped: bool,
}

#[async_trait]
pub trait Deriver: Send + Sync {
    fn kind(&self) -> MediaKind;

    /// Produce attributes and derivatives. Returns `decode-failed` or `unsupported-kind`
    /// without side effects when the original is unusable.
    async fn derive(&self, input: DeriveInput) -> Result<Derivation, AppError>;
}

/// Kind-based routing to derivers.
#[derive(Clone)]
pub struct DeriverRegistry {
    image: Arc<dyn Deriver>,
    video: Arc<dyn Deriver>,
}

impl DeriverRegistry {
    pub fn new(image: Arc<dyn Deriver>, video: Arc<dyn Deriver>) -> Self {
        Self { image, video }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            Arc::new(ImageDeriver::new(config.image_thumbnail_edge)),
            Arc::new(VideoDeriver::from_config(config)),
        )
    }

    /// Replace the deriver registered for `deriver.kind()`.
    pub fn with_deriver(mut self, deriver: Arc<dyn Deriver>) -> Self {
        match deriver.kind() {
            MediaKind::Image => self.image = deriver,
            MediaKind::Video => self.video = deriver,
        }
        self
    }

    pub fn for_kind(&self, kind: MediaKind) -> Arc<dyn Deriver> {
        match kind {
            MediaKind::Image => self.image.clone(),
            MediaKind::Video => self.video.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Failing;

    #[async_trait]
    impl Deriver for Failing {
        fn kind(&self) -> MediaKind {
            MediaKind::Image
        }

        async fn derive(&self, _input: DeriveInput) -> Result<Derivation, AppError> {
            Err(AppError::DecodeFailed("fixture".into()))
        }
    }

    #[tokio::test]
    async fn test_with_deriver_replaces_by_kind() {
        let config = lumen_core::Config::for_tests("/tmp/unused").media;
        let registry = DeriverRegistry::from_config(&config).with_deriver(Arc::new(Failing));
        assert_eq!(registry.for_kind(MediaKind::Video).kind(), MediaKind::Video);

        let input = DeriveInput {
            media_id: "m".into(),
            reader: Box::pin(std::io::Cursor::new(Vec::new())),
            filename: "a.png".into(),
            mime_type: "image/png".into(),
            size_bytes: 0,
        };
        let err = registry
            .for_kind(MediaKind::Image)
            .derive(input)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::DecodeFailed(_)));
    }
}
