//! Access-token issuing and verification.
//!
//! Tokens are HS256 JWTs signed with the configured secret. Verification
//! failures all collapse into one generic error so responses never leak
//! why a token was rejected.

use chrono::{Duration as ChronoDuration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::AppConfig;

/// Tokens larger than this are rejected before any parsing.
const MAX_TOKEN_BYTES: usize = 8192;

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("invalid credentials")]
    InvalidCredentials,
    #[error("the access token is invalid or expired")]
    InvalidToken,
    #[error("token encoding failed")]
    Encoding,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Check login credentials against the configured admin account.
pub fn check_credentials(cfg: &AppConfig, username: &str, password: &str) -> Result<(), AuthError> {
    if username == cfg.admin_username && password == cfg.admin_password {
        Ok(())
    } else {
        Err(AuthError::InvalidCredentials)
    }
}

/// Issue a bearer token for `subject`, valid for the configured lifetime.
pub fn issue_token(secret: &str, subject: &str, lifetime_minutes: i64) -> Result<String, AuthError> {
    let now = Utc::now();
    let claims = Claims {
        sub: subject.to_string(),
        iat: now.timestamp(),
        exp: (now + ChronoDuration::minutes(lifetime_minutes)).timestamp(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|_| AuthError::Encoding)
}

/// Verify a bearer token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, AuthError> {
    if token.len() > MAX_TOKEN_BYTES {
        return Err(AuthError::InvalidToken);
    }
    let validation = Validation::new(Algorithm::HS256);
    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|_| AuthError::InvalidToken)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "unit-test-secret";

    #[test]
    fn test_issue_and_verify_round_trip() {
        let token = issue_token(SECRET, "admin", 60).unwrap();
        let claims = verify_token(SECRET, &token).unwrap();
        assert_eq!(claims.sub, "admin");
        assert!(claims.exp > claims.iat);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let token = issue_token(SECRET, "admin", 60).unwrap();
        assert!(matches!(
            verify_token("another-secret", &token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        // Past the default clock-skew leeway.
        let token = issue_token(SECRET, "admin", -5).unwrap();
        assert!(matches!(
            verify_token(SECRET, &token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_garbage_and_oversized_tokens_rejected() {
        assert!(verify_token(SECRET, "not.a.jwt").is_err());
        let huge = "a".repeat(MAX_TOKEN_BYTES + 1);
        assert!(verify_token(SECRET, &huge).is_err());
    }

    #[test]
    fn test_check_credentials() {
        let cfg = AppConfig::default();
        assert!(check_credentials(&cfg, "admin", "admin").is_ok());
        assert!(matches!(
            check_credentials(&cfg, "admin", "wrong"),
            Err(AuthError::InvalidCredentials)
        ));
        assert!(check_credentials(&cfg, "root", "admin").is_err());
    }
}
