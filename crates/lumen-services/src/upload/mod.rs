//! Single-shot and chunked ingest.

pub mod coordinator;
pub mod session;

pub use coordinator::{IngestRequest, UploadCoordinator};
pub use session::{ChunkData, SessionState};
