//! HTTP handlers, one module per resource area.

pub mod chunked_upload;
pub mod media;
pub mod media_stream;
pub mod media_upload;
pub mod progress;
