//! Lumen Processing Library
//!
//! Content sniffing, upload validation and the derivers that turn an original into
//! attributes, a thumbnail and an optimised variant.

pub mod deriver;
pub mod image;
pub mod sniff;
pub mod validator;
pub mod video;

pub use deriver::{ArtifactData, DeriveInput, Derivation, Deriver, DeriverRegistry, OptimizedArtifact};
pub use self::image::ImageDeriver;
pub use sniff::{sniff, Sniffed, SNIFF_LEN};
pub use validator::{
    content_type_for_extension, kind_for_extension, UploadValidator, ValidatedName,
    ValidationError,
};
pub use video::{VideoDeriver, VideoSettings};
