use lumen_core::config::MediaConfig;
use lumen_core::models::MediaKind;
use lumen_core::AppError;
use lumen_storage::keys::{filename_extension, KeyError};

use crate::sniff::Sniffed;

/// Declared MIME types accepted on upload. `application/octet-stream` is treated as absent.
pub const ALLOWED_CONTENT_TYPES: &[&str] = &[
    "image/jpeg",
    "image/jpg",
    "image/png",
    "image/gif",
    "image/webp",
    "video/mp4",
    "video/quicktime",
    "video/webm",
    "video/x-matroska",
    "video/x-msvideo",
];

const OPAQUE_CONTENT_TYPE: &str = "application/octet-stream";

/// Upload validation failures
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    #[error("File too large: {size} bytes (max: {max} bytes)")]
    FileTooLarge { size: u64, max: u64 },

    #[error("unsupported extension: {extension}")]
    InvalidExtension { extension: String },

    #[error("Invalid content type: {content_type}")]
    InvalidContentType { content_type: String },

    #[error("Invalid filename: {0}")]
    InvalidFilename(#[from] KeyError),

    #[error("Empty file")]
    EmptyFile,

    #[error("content is not a supported {expected}")]
    ContentMismatch { expected: &'static str },
}

impl From<ValidationError> for AppError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::ContentMismatch { .. } => AppError::UnsupportedKind(err.to_string()),
            other => AppError::InvalidInput(other.to_string()),
        }
    }
}

/// Kind implied by a (lowercased) extension.
pub fn kind_for_extension(extension: &str) -> Option<MediaKind> {
    match extension {
        "jpg" | "jpeg" | "png" | "gif" | "webp" => Some(MediaKind::Image),
        "mp4" | "m4v" | "mov" | "webm" | "mkv" | "avi" | "ogv" => Some(MediaKind::Video),
        _ => None,
    }
}

/// MIME type conventionally used for an extension.
pub fn content_type_for_extension(extension: &str) -> &'static str {
    match extension {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        "ogv" => "video/ogg",
        _ => OPAQUE_CONTENT_TYPE,
    }
}

/// What a filename passed validation as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedName {
    pub extension: String,
    pub kind: MediaKind,
}

/// Upload validator
///
/// Checks everything knowable before the first byte is stored: filename shape, extension
/// allow-list, declared MIME type and the per-kind size ceiling. Content sniffing happens
/// later, on the leading bytes, through [`UploadValidator::check_content`].
#[derive(Debug, Clone)]
pub struct UploadValidator {
    max_image_bytes: u64,
    max_video_bytes: u64,
    allowed_extensions: Vec<String>,
}

impl UploadValidator {
    pub fn new(max_image_bytes: u64, max_video_bytes: u64, allowed_extensions: Vec<String>) -> Self {
        Self {
            max_image_bytes,
            max_video_bytes,
            allowed_extensions: allowed_extensions
                .into_iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn from_config(config: &MediaConfig) -> Self {
        Self::new(
            config.max_image_bytes,
            config.max_video_bytes,
            config.allowed_extensions.clone(),
        )
    }

    pub fn max_bytes(&self, kind: MediaKind) -> u64 {
        match kind {
            MediaKind::Image => self.max_image_bytes,
            MediaKind::Video => self.max_video_bytes,
        }
    }

    /// Validate the filename and return its extension and implied kind.
    pub fn validate_filename(&self, filename: &str) -> Result<ValidatedName, ValidationError> {
        let extension = filename_extension(filename)?;
        if !self.allowed_extensions.contains(&extension) {
            return Err(ValidationError::InvalidExtension { extension });
        }
        let kind = kind_for_extension(&extension)
            .ok_or_else(|| ValidationError::InvalidExtension {
                extension: extension.clone(),
            })?;
        Ok(ValidatedName { extension, kind })
    }

    /// Validate file size against the kind's ceiling (inclusive).
    pub fn validate_file_size(&self, kind: MediaKind, size: u64) -> Result<(), ValidationError> {
        if size == 0 {
            return Err(ValidationError::EmptyFile);
        }
        let max = self.max_bytes(kind);
        if size > max {
            return Err(ValidationError::FileTooLarge { size, max });
        }
        Ok(())
    }

    /// Validate a declared content type, if any, against the allow-list and the extension.
    pub fn validate_content_type(
        &self,
        name: &ValidatedName,
        content_type: Option<&str>,
    ) -> Result<(), ValidationError> {
        let Some(declared) = content_type else {
            return Ok(());
        };
        let normalized = declared
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_lowercase();
        if normalized.is_empty() || normalized == OPAQUE_CONTENT_TYPE {
            return Ok(());
        }
        if !ALLOWED_CONTENT_TYPES.contains(&normalized.as_str()) {
            return Err(ValidationError::InvalidContentType {
                content_type: declared.to_string(),
            });
        }
        let declared_kind = if normalized.starts_with("image/") {
            MediaKind::Image
        } else {
            MediaKind::Video
        };
        if declared_kind != name.kind {
            return Err(ValidationError::InvalidContentType {
                content_type: format!(
                    "{} (does not match extension '{}')",
                    declared, name.extension
                ),
            });
        }
        Ok(())
    }

    /// Everything checkable from request headers alone.
    pub fn validate_all(
        &self,
        filename: &str,
        content_type: Option<&str>,
        size: Option<u64>,
    ) -> Result<ValidatedName, ValidationError> {
        let name = self.validate_filename(filename)?;
        if let Some(size) = size {
            self.validate_file_size(name.kind, size)?;
        }
        self.validate_content_type(&name, content_type)?;
        Ok(name)
    }

    /// The sniffed content must exist and agree with the extension's kind.
    pub fn check_content(
        &self,
        name: &ValidatedName,
        sniffed: Option<Sniffed>,
    ) -> Result<Sniffed, ValidationError> {
        match sniffed {
            Some(found) if found.kind == name.kind => Ok(found),
            _ => Err(ValidationError::ContentMismatch {
                expected: name.kind.as_str(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sniff::sniff;

    fn validator() -> UploadValidator {
        UploadValidator::new(
            100,
            1000,
            "jpg,jpeg,png,gif,webp,mp4,mov,webm,mkv,avi"
                .split(',')
                .map(String::from)
                .collect(),
        )
    }

    #[test]
    fn test_exact_limit_is_accepted() {
        let v = validator();
        assert!(v.validate_file_size(MediaKind::Image, 100).is_ok());
        assert!(matches!(
            v.validate_file_size(MediaKind::Image, 101),
            Err(ValidationError::FileTooLarge { size: 101, max: 100 })
        ));
        assert!(v.validate_file_size(MediaKind::Video, 1000).is_ok());
        assert!(matches!(
            v.validate_file_size(MediaKind::Video, 0),
            Err(ValidationError::EmptyFile)
        ));
    }

    #[test]
    fn test_rejects_unlisted_extension() {
        let err = validator().validate_filename("setup.exe").unwrap_err();
        assert_eq!(err.to_string(), "unsupported extension: exe");
        let app: AppError = err.into();
        assert!(matches!(app, AppError::InvalidInput(_)));
    }

    #[test]
    fn test_rejects_bad_filenames() {
        let v = validator();
        assert!(v.validate_filename("noextension").is_err());
        assert!(v.validate_filename("../cat.png").is_err());
        assert!(v.validate_filename("dir/cat.png").is_err());
        assert!(v.validate_filename("").is_err());
        assert_eq!(
            v.validate_filename("Cat.PNG").unwrap(),
            ValidatedName {
                extension: "png".into(),
                kind: MediaKind::Image
            }
        );
    }

    #[test]
    fn test_content_type_checks() {
        let v = validator();
        let png = v.validate_filename("cat.png").unwrap();
        assert!(v.validate_content_type(&png, None).is_ok());
        assert!(v
            .validate_content_type(&png, Some("application/octet-stream"))
            .is_ok());
        assert!(v.validate_content_type(&png, Some("image/png")).is_ok());
        assert!(v
            .validate_content_type(&png, Some("application/x-msdownload"))
            .is_err());
        assert!(v.validate_content_type(&png, Some("video/mp4")).is_err());
    }

    #[test]
    fn test_sniffed_kind_must_match_extension() {
        let v = validator();
        let png = v.validate_filename("cat.png").unwrap();
        assert!(v
            .check_content(&png, sniff(b"\x89PNG\r\n\x1a\n\0\0"))
            .is_ok());
        let err = v
            .check_content(&png, sniff(b"\0\0\0\x20ftypisom\0\0\0\0"))
            .unwrap_err();
        assert!(matches!(AppError::from(err), AppError::UnsupportedKind(_)));
        assert!(v.check_content(&png, sniff(b"MZ\x90\0")).is_err());
    }

    #[test]
    fn test_extension_tables() {
        assert_eq!(content_type_for_extension("mov"), "video/quicktime");
        assert_eq!(content_type_for_extension("exe"), "application/octet-stream");
        assert_eq!(kind_for_extension("mkv"), Some(MediaKind::Video));
        assert_eq!(kind_for_extension("txt"), None);
        assert_eq!(kind_for_extension("bmp"), None);
    }
}
