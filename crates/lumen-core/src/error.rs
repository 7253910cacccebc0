//! Error types module
//!
//! All failures surfaced by the media pipeline are unified under [`AppError`]. Each variant
//! corresponds to one externally visible error kind (`invalid-input`, `storage-io`, ...) and
//! describes its own HTTP presentation through [`ErrorMetadata`].
//!
//! The `Database` variant and `From<sqlx::Error>` are gated behind the `sqlx` feature.

use std::io;

#[cfg(feature = "sqlx")]
use sqlx::Error as SqlxError;

/// Log level for error reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    /// Expected errors such as validation failures
    Debug,
    /// Recoverable issues such as a full queue or exhausted buffers
    Warn,
    /// Unexpected failures
    Error,
}

/// Metadata for error responses - defines how an error should be presented
pub trait ErrorMetadata {
    /// HTTP status code to return
    fn http_status_code(&self) -> u16;

    /// Machine-readable error kind (e.g. "storage-io")
    fn error_code(&self) -> &'static str;

    /// Whether the caller may retry
    fn is_recoverable(&self) -> bool;

    /// Suggested action for the client
    fn suggested_action(&self) -> Option<&'static str>;

    /// Client-facing message (may differ from internal error message)
    fn client_message(&self) -> String;

    /// Whether details should be hidden in production
    fn is_sensitive(&self) -> bool;

    /// Log level for this error
    fn log_level(&self) -> LogLevel;
}

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[cfg(feature = "sqlx")]
    #[error("Database error: {0}")]
    Database(#[source] SqlxError),

    #[cfg(not(feature = "sqlx"))]
    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Unsupported content: {0}")]
    UnsupportedKind(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Storage I/O error: {0}")]
    StorageIo(String),

    #[error("Storage out of space: {0}")]
    StorageSpace(String),

    #[error("Storage authentication failed: {0}")]
    StorageAuth(String),

    #[error("Decode failed: {0}")]
    DecodeFailed(String),

    #[error("Derivation timed out after {0} seconds")]
    TaskTimeout(u64),

    #[error("Upload session {0} expired after inactivity")]
    IdleTimeout(String),

    #[error("Derivation queue is full")]
    QueueFull,

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Internal error with source")]
    InternalWithSource {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(feature = "sqlx")]
impl From<SqlxError> for AppError {
    fn from(err: SqlxError) -> Self {
        match err {
            SqlxError::RowNotFound => AppError::NotFound("Record not found".to_string()),
            other => AppError::Database(other),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::InternalWithSource {
            message: err.to_string(),
            source: err,
        }
    }
}

impl From<io::Error> for AppError {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => AppError::NotFound(err.to_string()),
            io::ErrorKind::StorageFull => AppError::StorageSpace(err.to_string()),
            io::ErrorKind::PermissionDenied => AppError::StorageAuth(err.to_string()),
            _ => AppError::StorageIo(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InvalidInput(format!("JSON parsing error: {}", err))
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::InvalidInput(format!("Validation error: {}", err))
    }
}

/// Static metadata for each variant: (http_status, error_code, recoverable, suggested_action, sensitive, log_level).
fn app_error_static_metadata(
    err: &AppError,
) -> (
    u16,
    &'static str,
    bool,
    Option<&'static str>,
    bool,
    LogLevel,
) {
    match err {
        AppError::Database(_) => (
            500,
            "internal",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::InvalidInput(_) => (
            400,
            "invalid-input",
            false,
            Some("Check request parameters and try again"),
            false,
            LogLevel::Debug,
        ),
        AppError::UnsupportedKind(_) => (
            415,
            "unsupported-kind",
            false,
            Some("Upload a supported image or video file"),
            false,
            LogLevel::Debug,
        ),
        AppError::NotFound(_) => (
            404,
            "not-found",
            false,
            Some("Verify the resource ID exists"),
            false,
            LogLevel::Debug,
        ),
        AppError::Unauthorized(_) => (
            401,
            "unauthorized",
            false,
            Some("Check the authentication token or resource ownership"),
            false,
            LogLevel::Debug,
        ),
        AppError::Conflict(_) => (
            409,
            "conflict",
            true,
            Some("Reload the resource and retry"),
            false,
            LogLevel::Debug,
        ),
        AppError::StorageIo(_) => (
            503,
            "storage-io",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
        AppError::StorageSpace(_) => (
            507,
            "storage-space",
            true,
            Some("Retry after cleanup or wait for capacity"),
            false,
            LogLevel::Warn,
        ),
        AppError::StorageAuth(_) => (
            500,
            "storage-auth",
            false,
            Some("Contact support if this error persists"),
            true,
            LogLevel::Error,
        ),
        AppError::DecodeFailed(_) => (
            422,
            "decode-failed",
            false,
            Some("Check the file is not corrupted and try a different file"),
            false,
            LogLevel::Warn,
        ),
        AppError::TaskTimeout(_) => (
            504,
            "task-timeout",
            true,
            Some("Retry with a smaller file"),
            false,
            LogLevel::Warn,
        ),
        AppError::IdleTimeout(_) => (
            408,
            "idle-timeout",
            false,
            Some("Start a new upload session"),
            false,
            LogLevel::Debug,
        ),
        AppError::QueueFull => (
            503,
            "queue-full",
            true,
            Some("Retry after a short delay"),
            false,
            LogLevel::Warn,
        ),
        AppError::ResourceExhausted(_) => (
            503,
            "resource-exhausted",
            true,
            Some("Retry after a short delay"),
            false,
            LogLevel::Warn,
        ),
        AppError::Internal(_) | AppError::InternalWithSource { .. } => (
            500,
            "internal",
            true,
            Some("Retry after a short delay"),
            true,
            LogLevel::Error,
        ),
    }
}

impl AppError {
    /// Get the error type name for detailed error responses
    pub fn error_type(&self) -> &str {
        match self {
            AppError::Database(_) => "Database",
            AppError::InvalidInput(_) => "InvalidInput",
            AppError::UnsupportedKind(_) => "UnsupportedKind",
            AppError::NotFound(_) => "NotFound",
            AppError::Unauthorized(_) => "Unauthorized",
            AppError::Conflict(_) => "Conflict",
            AppError::StorageIo(_) => "StorageIo",
            AppError::StorageSpace(_) => "StorageSpace",
            AppError::StorageAuth(_) => "StorageAuth",
            AppError::DecodeFailed(_) => "DecodeFailed",
            AppError::TaskTimeout(_) => "TaskTimeout",
            AppError::IdleTimeout(_) => "IdleTimeout",
            AppError::QueueFull => "QueueFull",
            AppError::ResourceExhausted(_) => "ResourceExhausted",
            AppError::Internal(_) => "Internal",
            AppError::InternalWithSource { .. } => "Internal",
        }
    }

    /// Get detailed error information including error chain
    pub fn detailed_message(&self) -> String {
        use std::error::Error;

        let mut details = self.to_string();

        let mut source = self.source();
        let mut depth = 0;
        while let Some(err) = source {
            depth += 1;
            if depth > 5 {
                details.push_str("\n  ... (truncated)");
                break;
            }
            details.push_str(&format!("\n  Caused by: {}", err));
            source = err.source();
        }

        details
    }

    /// Reason text recorded on a failed MediaRecord or a failed progress event.
    pub fn failure_reason(&self) -> String {
        format!("{}: {}", self.error_code(), self.client_message())
    }
}

impl ErrorMetadata for AppError {
    fn http_status_code(&self) -> u16 {
        app_error_static_metadata(self).0
    }

    fn error_code(&self) -> &'static str {
        app_error_static_metadata(self).1
    }

    fn is_recoverable(&self) -> bool {
        app_error_static_metadata(self).2
    }

    fn suggested_action(&self) -> Option<&'static str> {
        app_error_static_metadata(self).3
    }

    fn is_sensitive(&self) -> bool {
        app_error_static_metadata(self).4
    }

    fn log_level(&self) -> LogLevel {
        app_error_static_metadata(self).5
    }

    fn client_message(&self) -> String {
        match self {
            AppError::Database(_) => "Failed to access database".to_string(),
            AppError::InvalidInput(ref msg) => msg.clone(),
            AppError::UnsupportedKind(ref msg) => msg.clone(),
            AppError::NotFound(ref msg) => msg.clone(),
            AppError::Unauthorized(ref msg) => msg.clone(),
            AppError::Conflict(ref msg) => msg.clone(),
            AppError::StorageIo(_) => "Failed to access storage".to_string(),
            AppError::StorageSpace(_) => "Storage is out of space".to_string(),
            AppError::StorageAuth(_) => "Storage rejected the credentials".to_string(),
            AppError::DecodeFailed(ref msg) => msg.clone(),
            AppError::TaskTimeout(secs) => {
                format!("Derivation exceeded the {} second deadline", secs)
            }
            AppError::IdleTimeout(_) => "idle-timeout".to_string(),
            AppError::QueueFull => "Derivation queue is full".to_string(),
            AppError::ResourceExhausted(ref msg) => msg.clone(),
            AppError::Internal(_) => "Internal server error".to_string(),
            AppError::InternalWithSource { .. } => "Internal server error".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_metadata_database() {
        #[cfg(feature = "sqlx")]
        let err = AppError::from(sqlx::Error::PoolClosed);
        #[cfg(not(feature = "sqlx"))]
        let err = AppError::Database("pool closed".to_string());
        assert_eq!(err.http_status_code(), 500);
        assert_eq!(err.error_code(), "internal");
        assert!(err.is_recoverable());
        assert_eq!(err.client_message(), "Failed to access database");
        assert!(err.is_sensitive());
        assert_eq!(err.log_level(), LogLevel::Error);
    }

    #[cfg(feature = "sqlx")]
    #[test]
    fn test_row_not_found_maps_to_not_found() {
        let err = AppError::from(sqlx::Error::RowNotFound);
        assert_eq!(err.http_status_code(), 404);
        assert_eq!(err.error_code(), "not-found");
    }

    #[test]
    fn test_client_errors_are_4xx() {
        let cases = [
            AppError::InvalidInput("bad".into()),
            AppError::UnsupportedKind("exe".into()),
            AppError::NotFound("gone".into()),
            AppError::Unauthorized("not yours".into()),
            AppError::Conflict("stale".into()),
        ];
        for err in cases {
            let status = err.http_status_code();
            assert!((400..500).contains(&status), "{} -> {}", err, status);
            assert!(!err.is_sensitive());
        }
    }

    #[test]
    fn test_server_errors_are_5xx() {
        let cases = [
            AppError::StorageIo("disk".into()),
            AppError::StorageSpace("full".into()),
            AppError::TaskTimeout(600),
            AppError::Internal("bug".into()),
            AppError::QueueFull,
        ];
        for err in cases {
            let status = err.http_status_code();
            assert!((500..600).contains(&status), "{} -> {}", err, status);
        }
    }

    #[test]
    fn test_io_error_classification() {
        let full = AppError::from(io::Error::new(io::ErrorKind::StorageFull, "no space"));
        assert_eq!(full.error_code(), "storage-space");

        let missing = AppError::from(io::Error::new(io::ErrorKind::NotFound, "missing"));
        assert_eq!(missing.error_code(), "not-found");

        let other = AppError::from(io::Error::other("broken pipe"));
        assert_eq!(other.error_code(), "storage-io");
    }

    #[test]
    fn test_failure_reason_includes_kind() {
        let err = AppError::DecodeFailed("truncated PNG".into());
        assert_eq!(err.failure_reason(), "decode-failed: truncated PNG");

        let idle = AppError::IdleTimeout("abc".into());
        assert_eq!(idle.client_message(), "idle-timeout");
    }

    #[test]
    fn test_detailed_message_includes_source_chain() {
        let err = AppError::from(anyhow::anyhow!("root cause").context("outer"));
        let details = err.detailed_message();
        assert!(details.contains("Internal error with source"));
        assert!(details.contains("outer"));
    }
}
