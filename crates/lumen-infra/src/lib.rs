//! Lumen Infrastructure Library
//!
//! Shared plumbing for the HTTP service:
//! - Tracing subscriber initialisation
//! - Request id and security header middleware
//! - The JSON error body returned by every endpoint

pub mod error;
pub mod middleware;
pub mod telemetry;

pub use error::ErrorResponse;
pub use middleware::{get_request_id, request_id_middleware, security_headers_middleware, RequestId};
pub use telemetry::init_telemetry;
