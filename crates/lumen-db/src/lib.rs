//! Lumen Database Layer
//!
//! Metadata repository for media records.

pub mod db;

pub use db::transaction::TransactionGuard;
pub use db::{
    create_media_repository, InMemoryMediaRepository, MediaRepository, OwnerUsage,
    PgMediaRepository,
};
