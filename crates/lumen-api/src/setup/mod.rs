//! Application setup and initialization
//!
//! Wiring lives here rather than in main.rs so integration tests can build the same state
//! and router with in-memory collaborators.

pub mod database;
pub mod routes;
pub mod server;
pub mod services;

use crate::state::AppState;
use anyhow::{Context, Result};
use lumen_core::{Config, UuidIdGenerator};
use lumen_processing::DeriverRegistry;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub use services::{build_state, ServiceDeps};

/// A wired application: state, router and the background tasks it owns.
pub struct App {
    pub state: Arc<AppState>,
    pub router: axum::Router,
    pub background: BackgroundTasks,
}

/// Handles for the janitor loop and the derivation pool.
pub struct BackgroundTasks {
    state: Arc<AppState>,
    janitor_stop: watch::Sender<bool>,
    janitor: JoinHandle<()>,
}

impl BackgroundTasks {
    pub fn start(state: Arc<AppState>) -> Self {
        let (janitor_stop, stop_rx) = watch::channel(false);
        let janitor = state.cleanup.clone().start(stop_rx);
        Self {
            state,
            janitor_stop,
            janitor,
        }
    }

    /// Stop the janitor, then drain the derivation pool.
    pub async fn shutdown(self) {
        let _ = self.janitor_stop.send(true);
        if let Err(e) = self.janitor.await {
            tracing::error!(error = %e, "Cleanup janitor task failed");
        }
        self.state.queue.shutdown().await;
        tracing::info!("Background tasks stopped");
    }
}

/// Initialize the entire application
pub async fn initialize_app(config: Config) -> Result<App> {
    // Validate configuration first - fail fast on misconfiguration
    config.validate().context("Configuration validation failed")?;

    lumen_infra::init_telemetry(config.log_format, lumen_infra::telemetry::DEFAULT_FILTER)
        .context("Failed to initialize telemetry")?;

    tracing::info!(
        environment = %config.environment,
        storage = ?config.storage.backend,
        "Configuration loaded and validated successfully"
    );

    let pool = database::setup_database(&config).await?;
    let repository = lumen_db::create_media_repository(pool.clone());

    let storage = lumen_storage::create_storage(&config)
        .await
        .context("Failed to initialize storage")?;

    let deps = ServiceDeps {
        pool,
        repository,
        storage,
        derivers: DeriverRegistry::from_config(&config.media),
        ids: Arc::new(UuidIdGenerator),
    };
    let state = build_state(config, deps)?;
    let router = routes::setup_routes(state.clone())?;
    let background = BackgroundTasks::start(state.clone());

    Ok(App {
        state,
        router,
        background,
    })
}
