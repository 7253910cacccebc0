//! Scripted derivers for failure and timing scenarios.

use async_trait::async_trait;
use bytes::Bytes;
use lumen_core::models::{MediaAttributes, MediaKind};
use lumen_core::AppError;
use lumen_processing::{DeriveInput, Derivation, Deriver};
use std::sync::Arc;
use tokio::sync::Notify;

/// Image deriver that always reports a decode failure.
pub struct FailingDeriver;

#[async_trait]
impl Deriver for FailingDeriver {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    async fn derive(&self, input: DeriveInput) -> Result<Derivation, AppError> {
        Err(AppError::DecodeFailed(format!(
            "scripted failure for {}",
            input.filename
        )))
    }
}

/// Image deriver that holds every task until released, then emits a thumbnail.
pub struct GatedDeriver {
    pub release: Arc<Notify>,
}

#[async_trait]
impl Deriver for GatedDeriver {
    fn kind(&self) -> MediaKind {
        MediaKind::Image
    }

    async fn derive(&self, _input: DeriveInput) -> Result<Derivation, AppError> {
        self.release.notified().await;
        Ok(Derivation {
            attributes: MediaAttributes::from_dimensions(3, 3),
            thumbnail: Some(Bytes::from_static(b"\xff\xd8\xff\xe0thumbnail")),
            ..Default::default()
        })
    }
}
