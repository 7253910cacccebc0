//! Lumen Services Layer
//!
//! Business services the HTTP surface is built on: the upload coordinator (single-shot and
//! chunked ingest), the in-process progress bus, media lookup/update/delete/streaming and
//! the cleanup janitor. Handlers in lumen-api stay thin and delegate here.

pub mod cleanup;
pub mod media;
pub mod progress;
pub mod upload;

pub use cleanup::{CleanupReport, CleanupService};
pub use media::{resolve_range, MediaContent, MediaService, RangeNotSatisfiable};
pub use progress::{ProgressBus, Subscription};
pub use upload::{IngestRequest, UploadCoordinator};
