//! Shared key planning for storage backends.
//!
//! Original key format: `YYYY/MM/DD/{owner_id}/{media_id}.{ext}`. Derivatives live next to
//! the original: `{stem}_thumb.jpg` and `{stem}_opt.{ext}`.

use chrono::{DateTime, Datelike, Utc};
use lumen_core::{AppError, IdGenerator};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

const MAX_FILENAME_LEN: usize = 255;
const MAX_EXTENSION_LEN: usize = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum KeyError {
    #[error("filename is empty")]
    EmptyFilename,

    #[error("filename is too long")]
    FilenameTooLong,

    #[error("filename has no extension")]
    MissingExtension,

    #[error("filename contains a path separator")]
    PathSeparator,

    #[error("filename contains '..'")]
    Traversal,

    #[error("filename contains control characters")]
    ControlCharacter,

    #[error("owner id is not usable in a storage key")]
    InvalidOwner,

    #[error("storage key escapes the storage root")]
    EscapesRoot,
}

impl From<KeyError> for AppError {
    fn from(err: KeyError) -> Self {
        AppError::InvalidInput(err.to_string())
    }
}

/// Validate a client filename and return its lowercased extension.
pub fn filename_extension(filename: &str) -> Result<String, KeyError> {
    if filename.trim().is_empty() {
        return Err(KeyError::EmptyFilename);
    }
    if filename.len() > MAX_FILENAME_LEN {
        return Err(KeyError::FilenameTooLong);
    }
    if filename.contains('/') || filename.contains('\\') {
        return Err(KeyError::PathSeparator);
    }
    if filename.contains("..") {
        return Err(KeyError::Traversal);
    }
    if filename.chars().any(char::is_control) {
        return Err(KeyError::ControlCharacter);
    }

    let ext = Path::new(filename)
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_lowercase)
        .filter(|e| !e.is_empty())
        .ok_or(KeyError::MissingExtension)?;

    if ext.len() > MAX_EXTENSION_LEN || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(KeyError::MissingExtension);
    }

    Ok(ext)
}

/// Reject keys that are empty, absolute, or could escape the logical root.
pub fn validate_key(key: &str) -> Result<(), KeyError> {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') {
        return Err(KeyError::EscapesRoot);
    }
    if key
        .split('/')
        .any(|segment| segment.is_empty() || segment == "." || segment == "..")
    {
        return Err(KeyError::EscapesRoot);
    }
    Ok(())
}

fn validate_owner(owner_id: &str) -> Result<(), KeyError> {
    if owner_id.is_empty()
        || owner_id.len() > 128
        || owner_id.contains('/')
        || owner_id.contains('\\')
        || owner_id.contains("..")
        || owner_id.chars().any(char::is_control)
    {
        return Err(KeyError::InvalidOwner);
    }
    Ok(())
}

fn stem(storage_key: &str) -> &str {
    match storage_key.rfind('.') {
        Some(dot) if !storage_key[dot..].contains('/') => &storage_key[..dot],
        _ => storage_key,
    }
}

/// Key of the JPEG thumbnail derived from `storage_key`.
pub fn thumbnail_key(storage_key: &str) -> String {
    format!("{}_thumb.jpg", stem(storage_key))
}

/// Key of the optimised variant derived from `storage_key`, using the deriver's extension.
pub fn optimized_key(storage_key: &str, extension: &str) -> String {
    format!("{}_opt.{}", stem(storage_key), extension.trim_start_matches('.'))
}

/// Location planned for a new original.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedPath {
    pub media_id: String,
    pub storage_key: String,
    pub extension: String,
}

/// Derives media ids and storage keys for new uploads.
#[derive(Clone)]
pub struct PathPlanner {
    ids: Arc<dyn IdGenerator>,
}

impl PathPlanner {
    pub fn new(ids: Arc<dyn IdGenerator>) -> Self {
        Self { ids }
    }

    pub fn plan(
        &self,
        owner_id: &str,
        filename: &str,
        now: DateTime<Utc>,
    ) -> Result<PlannedPath, KeyError> {
        validate_owner(owner_id)?;
        let extension = filename_extension(filename)?;
        let media_id = self.ids.next_id();

        let storage_key = format!(
            "{:04}/{:02}/{:02}/{}/{}.{}",
            now.year(),
            now.month(),
            now.day(),
            owner_id,
            media_id,
            extension
        );
        validate_key(&storage_key)?;

        Ok(PlannedPath {
            media_id,
            storage_key,
            extension,
        })
    }
}
