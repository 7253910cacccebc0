//! HTTP error body
//!
//! `IntoResponse` for `AppError` lives in lumen-api: the orphan rule forbids implementing
//! axum's trait for lumen-core's type here.

use serde::Serialize;
use utoipa::ToSchema;

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    /// Stable machine-readable kind, e.g. `invalid-input`
    pub code: String,
    pub recoverable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_action: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_fields_are_omitted() {
        let body = ErrorResponse {
            error: "bad".to_string(),
            details: None,
            error_type: None,
            code: "invalid-input".to_string(),
            recoverable: false,
            suggested_action: None,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["code"], "invalid-input");
        assert!(json.get("details").is_none());
        assert!(json.get("error_type").is_none());
        assert!(json.get("suggested_action").is_none());
    }
}
