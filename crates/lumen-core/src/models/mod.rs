//! Data models for the media pipeline
//!
//! Each sub-module represents one feature area: media records, list queries, upload
//! protocol messages and progress snapshots.

mod list;
mod media;
mod progress;
mod upload;

pub use list::*;
pub use media::*;
pub use progress::*;
pub use upload::*;
