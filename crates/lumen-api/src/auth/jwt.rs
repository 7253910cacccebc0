//! HS256 bearer token validation.

use crate::auth::models::JwtClaims;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use lumen_core::models::Principal;
use lumen_core::AppError;

pub struct JwtService {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtService {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;
        Self {
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Validate `token` and return the principal it names.
    pub fn verify(&self, token: &str) -> Result<Principal, AppError> {
        let data = decode::<JwtClaims>(token, &self.decoding_key, &self.validation).map_err(|e| {
            tracing::debug!(error = %e, "Rejected bearer token");
            AppError::Unauthorized("Invalid or expired token".to_string())
        })?;

        let claims = data.claims;
        if claims.user_id.trim().is_empty() {
            return Err(AppError::Unauthorized(
                "Token carries no user_id".to_string(),
            ));
        }
        Ok(Principal::new(claims.user_id, claims.user_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    const SECRET: &str = "test-secret-with-enough-entropy-0123456789";

    fn token(secret: &str, user_id: &str, exp_offset: i64) -> String {
        let claims = JwtClaims {
            user_id: user_id.to_string(),
            user_name: Some("Ada".to_string()),
            exp: chrono::Utc::now().timestamp() + exp_offset,
            iat: Some(chrono::Utc::now().timestamp()),
        };
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let service = JwtService::new(SECRET);
        let principal = service.verify(&token(SECRET, "u1", 3600)).unwrap();
        assert_eq!(principal.user_id, "u1");
        assert_eq!(principal.user_name.as_deref(), Some("Ada"));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let service = JwtService::new(SECRET);
        let result = service.verify(&token("another-secret", "u1", 3600));
        assert!(matches!(result, Err(AppError::Unauthorized(_))));
    }

    #[test]
    fn test_expired_token_rejected() {
        let service = JwtService::new(SECRET);
        assert!(service.verify(&token(SECRET, "u1", -3600)).is_err());
    }

    #[test]
    fn test_empty_user_rejected() {
        let service = JwtService::new(SECRET);
        assert!(service.verify(&token(SECRET, " ", 3600)).is_err());
    }
}
