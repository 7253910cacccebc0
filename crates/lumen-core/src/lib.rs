//! Lumen Core Library
//!
//! Domain models, error types and configuration shared by every Lumen crate.

pub mod config;
pub mod error;
pub mod ids;
pub mod models;
pub mod storage_types;

pub use config::{AuthMode, Config, LogFormat};
pub use error::{AppError, ErrorMetadata, LogLevel};
pub use ids::{IdGenerator, SequentialIdGenerator, UuidIdGenerator};
pub use storage_types::StorageBackend;
