//! Database repositories for the data access layer
//!
//! The media repository is the only persistent entity. It has a PostgreSQL
//! implementation and an in-process one used when no database is configured.

pub mod media;
pub mod transaction;

pub use media::{InMemoryMediaRepository, MediaRepository, OwnerUsage, PgMediaRepository};

use sqlx::PgPool;
use std::sync::Arc;

/// Select the repository backend: PostgreSQL when a pool is available, in-memory otherwise.
pub fn create_media_repository(pool: Option<PgPool>) -> Arc<dyn MediaRepository> {
    match pool {
        Some(pool) => {
            tracing::info!("Initializing PostgreSQL media repository");
            Arc::new(PgMediaRepository::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set; media records are kept in memory only");
            Arc::new(InMemoryMediaRepository::new())
        }
    }
}
