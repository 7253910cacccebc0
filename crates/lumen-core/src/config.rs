//! Configuration module
//!
//! Settings are read from the environment (after loading an optional `.env` file) and
//! grouped by the component that consumes them. Every value has a default so a development
//! instance starts with no configuration at all.

use std::env;
use std::str::FromStr;

use crate::storage_types::StorageBackend;

const MIB: u64 = 1024 * 1024;

const SERVER_PORT: u16 = 8081;
const DB_MAX_CONNECTIONS: u32 = 10;
const DB_TIMEOUT_SECS: u64 = 30;
const HTTP_CONCURRENCY_LIMIT: usize = 10_000;
const LOCAL_STORAGE_PATH: &str = "./uploads/media";
const LOCAL_STORAGE_BASE_URL: &str = "/media";
const S3_REGION: &str = "us-east-1";
const MAX_IMAGE_SIZE: u64 = 100 * MIB;
const MAX_VIDEO_SIZE: u64 = 500 * MIB;
const ALLOWED_EXTENSIONS: &str = "jpg,jpeg,png,gif,webp,mp4,mov,webm,mkv,avi";
const IMAGE_THUMBNAIL_SIZE: u32 = 300;
const VIDEO_THUMBNAIL_SIZE: u32 = 320;
const VIDEO_THUMBNAIL_OFFSET_SECS: f64 = 1.0;
const DERIVATION_WORKERS: usize = 4;
const DERIVATION_QUEUE_DEPTH: usize = 256;
const DERIVATION_TASK_TIMEOUT_SECS: u64 = 600;
const DERIVATION_STALE_SECS: u64 = 600;
const SESSION_IDLE_TTL_SECS: u64 = 2 * 60 * 60;
const PROGRESS_TTL_SECS: u64 = 60 * 60;
const CHUNK_MEMORY_CEILING: u64 = 1024 * MIB;
const CHUNK_SPILL_THRESHOLD: u64 = 64 * MIB;
const JANITOR_INTERVAL_SECS: u64 = 60 * 60;
const JANITOR_BATCH_SIZE: usize = 100;
const ORPHAN_GRACE_SECS: u64 = 24 * 60 * 60;

/// How request principals are established
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    /// HS256 bearer tokens carrying `user_id` / `user_name` claims
    Jwt,
    /// Trusted `X-User-Id` / `X-User-Name` headers (development and tests)
    Header,
}

impl FromStr for AuthMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "jwt" => Ok(AuthMode::Jwt),
            "header" => Ok(AuthMode::Header),
            _ => Err(anyhow::anyhow!("Invalid auth mode: {}", s)),
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(anyhow::anyhow!("Invalid log format: {}", s)),
        }
    }
}

#[derive(Clone, Debug)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub local_base_path: String,
    pub local_base_url: String,
    pub s3_bucket: Option<String>,
    pub s3_region: String,
    pub s3_access_key: Option<String>,
    pub s3_secret_key: Option<String>,
    /// Custom endpoint for S3-compatible providers (MinIO, R2, ...)
    pub s3_endpoint: Option<String>,
}

#[derive(Clone, Debug)]
pub struct MediaConfig {
    pub max_image_bytes: u64,
    pub max_video_bytes: u64,
    pub allowed_extensions: Vec<String>,
    pub image_thumbnail_edge: u32,
    pub video_thumbnail_edge: u32,
    pub video_thumbnail_offset_secs: f64,
    pub video_optimize: bool,
    pub ffmpeg_path: String,
    pub ffprobe_path: String,
}

#[derive(Clone, Debug)]
pub struct DerivationConfig {
    pub worker_count: usize,
    pub queue_depth: usize,
    pub task_timeout_secs: u64,
    pub stale_after_secs: u64,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub idle_ttl_secs: u64,
    pub progress_ttl_secs: u64,
    pub memory_ceiling_bytes: u64,
    pub spill_threshold_bytes: u64,
}

#[derive(Clone, Debug)]
pub struct JanitorConfig {
    pub interval_secs: u64,
    pub batch_size: usize,
    pub orphan_grace_secs: u64,
    pub retention_days: Option<u32>,
    pub per_owner_quota_bytes: Option<u64>,
}

#[derive(Clone, Debug)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub jwt_secret: Option<String>,
}

/// Service configuration
#[derive(Clone, Debug)]
pub struct Config {
    pub server_host: String,
    pub server_port: u16,
    pub environment: String,
    pub cors_origins: Vec<String>,
    pub max_request_body_bytes: usize,
    /// In-flight request ceiling for the HTTP stack
    pub http_concurrency_limit: usize,
    pub log_format: LogFormat,
    /// When unset the service keeps records in memory (development only)
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub db_timeout_seconds: u64,
    pub storage: StorageConfig,
    pub media: MediaConfig,
    pub derivation: DerivationConfig,
    pub sessions: SessionConfig,
    pub janitor: JanitorConfig,
    pub auth: AuthConfig,
}

fn var_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parsed_or<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn optional<T: FromStr>(name: &str) -> Option<T> {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .and_then(|v| v.trim().parse().ok())
}

fn non_empty(name: &str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Split a comma-separated list, trimming and lowercasing entries.
pub fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().trim_start_matches('.').to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Config {
    pub fn from_env() -> Result<Self, anyhow::Error> {
        dotenvy::dotenv().ok();

        let storage_backend = var_or("STORAGE_TYPE", "local").parse::<StorageBackend>()?;
        let auth_mode = var_or("AUTH_MODE", "jwt").parse::<AuthMode>()?;
        let log_format = var_or("LOG_FORMAT", "text").parse::<LogFormat>()?;

        let max_image_bytes = parsed_or("MAX_IMAGE_SIZE", MAX_IMAGE_SIZE);
        let max_video_bytes = parsed_or("MAX_VIDEO_SIZE", MAX_VIDEO_SIZE);
        let default_body = max_image_bytes.max(max_video_bytes) + MIB;

        let cors_origins = var_or("CORS_ORIGINS", "*")
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            server_host: var_or("SERVER_HOST", "0.0.0.0"),
            server_port: parsed_or("PORT", SERVER_PORT),
            environment: env::var("ENVIRONMENT")
                .or_else(|_| env::var("APP_ENV"))
                .unwrap_or_else(|_| "development".to_string()),
            cors_origins,
            max_request_body_bytes: parsed_or("MAX_REQUEST_BODY", default_body as usize),
            http_concurrency_limit: parsed_or("HTTP_CONCURRENCY_LIMIT", HTTP_CONCURRENCY_LIMIT),
            log_format,
            database_url: non_empty("DATABASE_URL"),
            db_max_connections: parsed_or("DB_MAX_CONNECTIONS", DB_MAX_CONNECTIONS),
            db_timeout_seconds: parsed_or("DB_TIMEOUT_SECONDS", DB_TIMEOUT_SECS),
            storage: StorageConfig {
                backend: storage_backend,
                local_base_path: var_or("LOCAL_STORAGE_PATH", LOCAL_STORAGE_PATH),
                local_base_url: var_or("LOCAL_STORAGE_BASE_URL", LOCAL_STORAGE_BASE_URL),
                s3_bucket: non_empty("S3_BUCKET"),
                s3_region: non_empty("S3_REGION")
                    .or_else(|| non_empty("AWS_REGION"))
                    .unwrap_or_else(|| S3_REGION.to_string()),
                s3_access_key: non_empty("S3_ACCESS_KEY"),
                s3_secret_key: non_empty("S3_SECRET_KEY"),
                s3_endpoint: non_empty("S3_ENDPOINT"),
            },
            media: MediaConfig {
                max_image_bytes,
                max_video_bytes,
                allowed_extensions: parse_list(&var_or("ALLOWED_EXTENSIONS", ALLOWED_EXTENSIONS)),
                image_thumbnail_edge: parsed_or("IMAGE_THUMBNAIL_SIZE", IMAGE_THUMBNAIL_SIZE),
                video_thumbnail_edge: parsed_or("VIDEO_THUMBNAIL_SIZE", VIDEO_THUMBNAIL_SIZE),
                video_thumbnail_offset_secs: parsed_or(
                    "VIDEO_THUMBNAIL_OFFSET_SECS",
                    VIDEO_THUMBNAIL_OFFSET_SECS,
                ),
                video_optimize: parsed_or("VIDEO_OPTIMIZE", false),
                ffmpeg_path: var_or("FFMPEG_PATH", "ffmpeg"),
                ffprobe_path: var_or("FFPROBE_PATH", "ffprobe"),
            },
            derivation: DerivationConfig {
                worker_count: parsed_or("DERIVATION_WORKERS", DERIVATION_WORKERS),
                queue_depth: parsed_or("DERIVATION_QUEUE_DEPTH", DERIVATION_QUEUE_DEPTH),
                task_timeout_secs: parsed_or(
                    "DERIVATION_TASK_TIMEOUT_SECS",
                    DERIVATION_TASK_TIMEOUT_SECS,
                ),
                stale_after_secs: parsed_or("DERIVATION_STALE_SECS", DERIVATION_STALE_SECS),
            },
            sessions: SessionConfig {
                idle_ttl_secs: parsed_or("SESSION_IDLE_TTL_SECS", SESSION_IDLE_TTL_SECS),
                progress_ttl_secs: parsed_or("PROGRESS_TTL_SECS", PROGRESS_TTL_SECS),
                memory_ceiling_bytes: parsed_or("CHUNK_MEMORY_CEILING", CHUNK_MEMORY_CEILING),
                spill_threshold_bytes: parsed_or("CHUNK_SPILL_THRESHOLD", CHUNK_SPILL_THRESHOLD),
            },
            janitor: JanitorConfig {
                interval_secs: parsed_or("JANITOR_INTERVAL_SECS", JANITOR_INTERVAL_SECS),
                batch_size: parsed_or("JANITOR_BATCH_SIZE", JANITOR_BATCH_SIZE),
                orphan_grace_secs: parsed_or("ORPHAN_GRACE_SECS", ORPHAN_GRACE_SECS),
                retention_days: optional("RETENTION_DAYS"),
                per_owner_quota_bytes: optional("PER_OWNER_QUOTA_BYTES"),
            },
            auth: AuthConfig {
                mode: auth_mode,
                jwt_secret: non_empty("JWT_SECRET"),
            },
        })
    }

    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.auth.mode == AuthMode::Jwt {
            match self.auth.jwt_secret.as_deref() {
                None => {
                    return Err(anyhow::anyhow!("JWT_SECRET must be set when AUTH_MODE=jwt"));
                }
                Some(secret) if self.is_production() && secret.len() < 32 => {
                    return Err(anyhow::anyhow!(
                        "JWT_SECRET must be at least 32 characters long in production"
                    ));
                }
                Some(_) => {}
            }
        }

        if self.is_production() && self.auth.mode == AuthMode::Header {
            return Err(anyhow::anyhow!(
                "AUTH_MODE=header trusts client headers and is not allowed in production"
            ));
        }

        if let Some(url) = self.database_url.as_deref() {
            if !url.starts_with("postgres://") && !url.starts_with("postgresql://") {
                return Err(anyhow::anyhow!(
                    "DATABASE_URL must be a valid PostgreSQL connection string"
                ));
            }
        }

        match self.storage.backend {
            StorageBackend::S3 => {
                if self.storage.s3_bucket.is_none() {
                    return Err(anyhow::anyhow!(
                        "S3_BUCKET must be set when using S3 storage backend"
                    ));
                }
            }
            StorageBackend::Local => {
                if self.storage.local_base_path.trim().is_empty() {
                    return Err(anyhow::anyhow!(
                        "LOCAL_STORAGE_PATH must be set when using local storage backend"
                    ));
                }
            }
        }

        if self.media.allowed_extensions.is_empty() {
            return Err(anyhow::anyhow!("ALLOWED_EXTENSIONS must not be empty"));
        }
        if self.media.max_image_bytes == 0 || self.media.max_video_bytes == 0 {
            return Err(anyhow::anyhow!(
                "MAX_IMAGE_SIZE and MAX_VIDEO_SIZE must be greater than zero"
            ));
        }
        if self.media.image_thumbnail_edge == 0 || self.media.video_thumbnail_edge == 0 {
            return Err(anyhow::anyhow!("Thumbnail sizes must be greater than zero"));
        }
        if self.derivation.worker_count == 0 || self.derivation.queue_depth == 0 {
            return Err(anyhow::anyhow!(
                "DERIVATION_WORKERS and DERIVATION_QUEUE_DEPTH must be greater than zero"
            ));
        }
        if self.sessions.spill_threshold_bytes > self.sessions.memory_ceiling_bytes {
            return Err(anyhow::anyhow!(
                "CHUNK_SPILL_THRESHOLD must not exceed CHUNK_MEMORY_CEILING"
            ));
        }
        if self.http_concurrency_limit == 0 {
            return Err(anyhow::anyhow!("HTTP_CONCURRENCY_LIMIT must be greater than zero"));
        }
        if self.janitor.batch_size == 0 {
            return Err(anyhow::anyhow!("JANITOR_BATCH_SIZE must be greater than zero"));
        }

        Ok(())
    }

    pub fn is_production(&self) -> bool {
        matches!(self.environment.to_lowercase().as_str(), "production" | "prod")
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    /// Defaults suitable for tests: local storage under `base_path`, header auth.
    pub fn for_tests(base_path: impl Into<String>) -> Self {
        Self {
            server_host: "127.0.0.1".to_string(),
            server_port: 0,
            environment: "test".to_string(),
            cors_origins: vec!["*".to_string()],
            max_request_body_bytes: (MAX_VIDEO_SIZE + MIB) as usize,
            http_concurrency_limit: HTTP_CONCURRENCY_LIMIT,
            log_format: LogFormat::Text,
            database_url: None,
            db_max_connections: 1,
            db_timeout_seconds: DB_TIMEOUT_SECS,
            storage: StorageConfig {
                backend: StorageBackend::Local,
                local_base_path: base_path.into(),
                local_base_url: LOCAL_STORAGE_BASE_URL.to_string(),
                s3_bucket: None,
                s3_region: S3_REGION.to_string(),
                s3_access_key: None,
                s3_secret_key: None,
                s3_endpoint: None,
            },
            media: MediaConfig {
                max_image_bytes: MAX_IMAGE_SIZE,
                max_video_bytes: MAX_VIDEO_SIZE,
                allowed_extensions: parse_list(ALLOWED_EXTENSIONS),
                image_thumbnail_edge: IMAGE_THUMBNAIL_SIZE,
                video_thumbnail_edge: VIDEO_THUMBNAIL_SIZE,
                video_thumbnail_offset_secs: VIDEO_THUMBNAIL_OFFSET_SECS,
                video_optimize: false,
                ffmpeg_path: "ffmpeg".to_string(),
                ffprobe_path: "ffprobe".to_string(),
            },
            derivation: DerivationConfig {
                worker_count: 2,
                queue_depth: 32,
                task_timeout_secs: 30,
                stale_after_secs: DERIVATION_STALE_SECS,
            },
            sessions: SessionConfig {
                idle_ttl_secs: SESSION_IDLE_TTL_SECS,
                progress_ttl_secs: PROGRESS_TTL_SECS,
                memory_ceiling_bytes: 256 * MIB,
                spill_threshold_bytes: 64 * MIB,
            },
            janitor: JanitorConfig {
                interval_secs: JANITOR_INTERVAL_SECS,
                batch_size: JANITOR_BATCH_SIZE,
                orphan_grace_secs: ORPHAN_GRACE_SECS,
                retention_days: None,
                per_owner_quota_bytes: None,
            },
            auth: AuthConfig {
                mode: AuthMode::Header,
                jwt_secret: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_normalizes_entries() {
        assert_eq!(
            parse_list(" JPG, .png,,webp "),
            vec!["jpg".to_string(), "png".to_string(), "webp".to_string()]
        );
    }

    #[test]
    fn test_auth_mode_from_str() {
        assert_eq!("JWT".parse::<AuthMode>().unwrap(), AuthMode::Jwt);
        assert_eq!("header".parse::<AuthMode>().unwrap(), AuthMode::Header);
        assert!("basic".parse::<AuthMode>().is_err());
    }

    #[test]
    fn test_test_config_is_valid() {
        let config = Config::for_tests("/tmp/lumen");
        assert!(config.validate().is_ok());
        assert!(!config.is_production());
    }

    #[test]
    fn test_jwt_mode_requires_secret() {
        let mut config = Config::for_tests("/tmp/lumen");
        config.auth.mode = AuthMode::Jwt;
        assert!(config.validate().is_err());

        config.auth.jwt_secret = Some("dev-secret".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_production_rejects_header_auth() {
        let mut config = Config::for_tests("/tmp/lumen");
        config.environment = "production".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_s3_requires_bucket() {
        let mut config = Config::for_tests("/tmp/lumen");
        config.storage.backend = StorageBackend::S3;
        assert!(config.validate().is_err());

        config.storage.s3_bucket = Some("media".to_string());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_spill_threshold_bounded_by_ceiling() {
        let mut config = Config::for_tests("/tmp/lumen");
        config.sessions.spill_threshold_bytes = config.sessions.memory_ceiling_bytes + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_http_concurrency_limit_must_be_positive() {
        let mut config = Config::for_tests("/tmp/lumen");
        assert_eq!(config.http_concurrency_limit, HTTP_CONCURRENCY_LIMIT);
        config.http_concurrency_limit = 0;
        assert!(config.validate().is_err());
    }
}
