//! Lumen Storage Library
//!
//! Content store abstraction with S3 and local filesystem backends, plus the path
//! planner that decides where originals and derivatives live.
//!
//! # Storage key format
//!
//! All backends use the same key layout:
//!
//! - **Original**: `YYYY/MM/DD/{owner_id}/{media_id}.{ext}`
//! - **Thumbnail**: `YYYY/MM/DD/{owner_id}/{media_id}_thumb.jpg`
//! - **Optimised**: `YYYY/MM/DD/{owner_id}/{media_id}_opt.{ext}`
//!
//! Keys must not contain `..` or a leading `/`.

pub mod factory;
pub mod keys;
#[cfg(feature = "storage-local")]
pub mod local;
#[cfg(feature = "storage-s3")]
pub mod s3;
pub mod traits;

pub use factory::create_storage;
pub use keys::{optimized_key, thumbnail_key, KeyError, PathPlanner, PlannedPath};
#[cfg(feature = "storage-local")]
pub use local::LocalStorage;
pub use lumen_core::StorageBackend;
#[cfg(feature = "storage-s3")]
pub use s3::S3Storage;
pub use traits::{
    ByteReader, ByteStream, ObjectInfo, Storage, StorageError, StorageResult, StoredObject,
};
