//! Route prefixes and response header values.

/// Prefix of every media route
pub const MEDIA_PREFIX: &str = "/api/media";

/// Cache-Control for originals
pub const ORIGINAL_CACHE_CONTROL: &str = "public, max-age=3600";

/// Cache-Control for thumbnails
pub const THUMBNAIL_CACHE_CONTROL: &str = "public, max-age=86400";

/// Header-mode principal headers
pub const USER_ID_HEADER: &str = "X-User-Id";
pub const USER_NAME_HEADER: &str = "X-User-Name";
