//! Application state shared by every handler.

use crate::auth::AuthState;
use lumen_core::Config;
use lumen_db::MediaRepository;
use lumen_services::{CleanupService, MediaService, UploadCoordinator};
use lumen_storage::Storage;
use lumen_worker::DerivationQueue;
use sqlx::PgPool;
use std::sync::Arc;

pub struct AppState {
    pub config: Config,
    /// Present when records live in PostgreSQL
    pub pool: Option<PgPool>,
    pub repository: Arc<dyn MediaRepository>,
    pub storage: Arc<dyn Storage>,
    pub queue: Arc<DerivationQueue>,
    pub uploads: Arc<UploadCoordinator>,
    pub media: MediaService,
    pub cleanup: Arc<CleanupService>,
    pub auth: AuthState,
}
