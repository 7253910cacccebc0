//! Video derivation through an external transcoder

pub mod deriver;
pub mod probe;

pub use deriver::{VideoDeriver, VideoSettings};
pub use probe::ProbeOutput;
