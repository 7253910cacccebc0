//! Image derivation

pub mod deriver;

pub use deriver::ImageDeriver;
