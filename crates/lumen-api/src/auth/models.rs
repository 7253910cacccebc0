use crate::auth::jwt::JwtService;
use crate::constants::{USER_ID_HEADER, USER_NAME_HEADER};
use crate::error::HttpAppError;
use crate::state::AppState;
use axum::extract::FromRequestParts;
use axum::http::{header, request::Parts, HeaderMap};
use lumen_core::config::AuthConfig;
use lumen_core::models::Principal;
use lumen_core::{AppError, AuthMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// JWT claims structure
#[derive(Debug, Serialize, Deserialize)]
pub struct JwtClaims {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<i64>,
}

/// How principals are established for this process.
pub enum AuthState {
    Jwt(JwtService),
    Header,
}

impl AuthState {
    pub fn from_config(config: &AuthConfig) -> Result<Self, anyhow::Error> {
        match config.mode {
            AuthMode::Jwt => {
                let secret = config
                    .jwt_secret
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("JWT_SECRET is required when AUTH_MODE=jwt"))?;
                Ok(AuthState::Jwt(JwtService::new(secret)))
            }
            AuthMode::Header => {
                tracing::warn!("Header authentication enabled; X-User-Id is trusted as-is");
                Ok(AuthState::Header)
            }
        }
    }

    pub fn authenticate(&self, headers: &HeaderMap) -> Result<Principal, AppError> {
        match self {
            AuthState::Jwt(service) => {
                let value = headers
                    .get(header::AUTHORIZATION)
                    .and_then(|h| h.to_str().ok())
                    .ok_or_else(|| {
                        AppError::Unauthorized("Missing authorization header".to_string())
                    })?;
                let token = value.strip_prefix("Bearer ").ok_or_else(|| {
                    AppError::Unauthorized("Invalid authorization header format".to_string())
                })?;
                service.verify(token.trim())
            }
            AuthState::Header => {
                let user_id = header_value(headers, USER_ID_HEADER)
                    .ok_or_else(|| AppError::Unauthorized(format!("Missing {} header", USER_ID_HEADER)))?;
                Ok(Principal::new(user_id, header_value(headers, USER_NAME_HEADER)))
            }
        }
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// The authenticated caller.
#[derive(Debug, Clone)]
pub struct AuthPrincipal(pub Principal);

// Extracted from parts so it composes with Multipart, which must consume the body.
impl FromRequestParts<Arc<AppState>> for AuthPrincipal {
    type Rejection = HttpAppError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let principal = state.auth.authenticate(&parts.headers)?;
        Ok(AuthPrincipal(principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_header_mode() {
        let auth = AuthState::Header;
        let mut headers = HeaderMap::new();
        assert!(matches!(
            auth.authenticate(&headers),
            Err(AppError::Unauthorized(_))
        ));

        headers.insert(USER_ID_HEADER, HeaderValue::from_static("u1"));
        headers.insert(USER_NAME_HEADER, HeaderValue::from_static("Ada"));
        let principal = auth.authenticate(&headers).unwrap();
        assert_eq!(principal.user_id, "u1");
        assert_eq!(principal.user_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_jwt_mode_requires_bearer() {
        let auth = AuthState::Jwt(JwtService::new("secret"));
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Basic abc"));
        assert!(matches!(
            auth.authenticate(&headers),
            Err(AppError::Unauthorized(_))
        ));
    }

    #[test]
    fn test_jwt_mode_needs_secret() {
        let config = AuthConfig {
            mode: AuthMode::Jwt,
            jwt_secret: None,
        };
        assert!(AuthState::from_config(&config).is_err());
    }
}
