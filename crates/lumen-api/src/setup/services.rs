//! Service construction.

use crate::auth::AuthState;
use crate::state::AppState;
use anyhow::Result;
use lumen_core::{Config, IdGenerator};
use lumen_db::MediaRepository;
use lumen_processing::{DeriverRegistry, UploadValidator};
use lumen_services::{CleanupService, MediaService, ProgressBus, UploadCoordinator};
use lumen_storage::Storage;
use lumen_worker::{DerivationQueue, DerivationQueueConfig};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Collaborators chosen by the caller: production passes Postgres and the configured store,
/// tests pass in-memory records, a temp-dir store and scripted derivers.
pub struct ServiceDeps {
    pub pool: Option<PgPool>,
    pub repository: Arc<dyn MediaRepository>,
    pub storage: Arc<dyn Storage>,
    pub derivers: DeriverRegistry,
    pub ids: Arc<dyn IdGenerator>,
}

/// Start the derivation pool and build every service on top of it.
pub fn build_state(config: Config, deps: ServiceDeps) -> Result<Arc<AppState>> {
    let auth = AuthState::from_config(&config.auth)?;
    let bus = ProgressBus::new();

    let queue = Arc::new(DerivationQueue::start(
        deps.repository.clone(),
        deps.storage.clone(),
        deps.derivers,
        Arc::new(bus.clone()),
        DerivationQueueConfig::from(&config.derivation),
    ));

    let uploads = Arc::new(UploadCoordinator::new(
        deps.repository.clone(),
        deps.storage.clone(),
        queue.clone(),
        bus,
        deps.ids,
        UploadValidator::from_config(&config.media),
        config.sessions.clone(),
    ));

    let cleanup = Arc::new(CleanupService::new(
        deps.repository.clone(),
        deps.storage.clone(),
        queue.clone(),
        uploads.clone(),
        config.janitor.clone(),
        Duration::from_secs(config.sessions.progress_ttl_secs),
    ));

    let media = MediaService::new(deps.repository.clone(), deps.storage.clone());

    tracing::info!(
        workers = config.derivation.worker_count,
        queue_depth = config.derivation.queue_depth,
        storage = ?deps.storage.backend_type(),
        "Services initialized"
    );

    Ok(Arc::new(AppState {
        config,
        pool: deps.pool,
        repository: deps.repository,
        storage: deps.storage,
        queue,
        uploads,
        media,
        cleanup,
        auth,
    }))
}
