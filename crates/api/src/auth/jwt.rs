//! JWT validation for identity tokens

use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use supportdesk_shared::{Role, UserId};
use time::{Duration, OffsetDateTime};

use super::{AuthError, Identity, IdentityProvider};

/// JWT claims carried by identity tokens
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user ID)
    pub sub: i64,
    pub username: String,
    pub role: Role,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    token_expiry_hours: i64,
}

impl JwtManager {
    pub fn new(secret: &str, token_expiry_hours: i64) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            token_expiry_hours,
        }
    }

    /// Sign a token for `identity`. Used by tooling and tests; production tokens
    /// come from the ticketing system with the same secret.
    pub fn generate_token(&self, identity: &Identity) -> Result<String, JwtError> {
        let now = OffsetDateTime::now_utc();
        let exp = now + Duration::hours(self.token_expiry_hours);

        let claims = Claims {
            sub: identity.user_id.0,
            username: identity.username.clone(),
            role: identity.role,
            iat: now.unix_timestamp(),
            exp: exp.unix_timestamp(),
        };

        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| JwtError::Encoding(e.to_string()))
    }

    /// Validate and decode a token
    pub fn validate_token(&self, token: &str) -> Result<Claims, JwtError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 60; // 60 second clock skew tolerance

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::Expired,
                jsonwebtoken::errors::ErrorKind::InvalidToken => JwtError::Invalid,
                jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => JwtError::Invalid,
                _ => JwtError::Validation(e.to_string()),
            })
    }
}

impl IdentityProvider for JwtManager {
    fn authenticate(&self, token: &str) -> Result<Identity, AuthError> {
        let claims = self.validate_token(token).map_err(|e| match e {
            JwtError::Expired => AuthError::Expired,
            _ => AuthError::InvalidToken,
        })?;

        Ok(Identity {
            user_id: UserId(claims.sub),
            username: claims.username,
            role: claims.role,
        })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum JwtError {
    #[error("Token has expired")]
    Expired,
    #[error("Invalid token")]
    Invalid,
    #[error("Token encoding failed: {0}")]
    Encoding(String),
    #[error("Token validation failed: {0}")]
    Validation(String),
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    fn identity() -> Identity {
        Identity {
            user_id: UserId(7),
            username: "dana".to_string(),
            role: Role::Admin,
        }
    }

    #[test]
    fn test_token_generation_and_authentication() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let token = jwt.generate_token(&identity()).expect("Failed to generate token");

        let resolved = jwt.authenticate(&token).expect("Token should authenticate");
        assert_eq!(resolved, identity());
    }

    #[test]
    fn test_token_signed_with_other_secret_rejected() {
        let issuer = JwtManager::new("another-secret-key-at-least-32-chars", 24);
        let verifier = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        let token = issuer.generate_token(&identity()).unwrap();

        assert!(matches!(
            verifier.authenticate(&token),
            Err(AuthError::InvalidToken)
        ));
    }

    #[test]
    fn test_expired_token_rejected() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", -2);
        let token = jwt.generate_token(&identity()).unwrap();

        assert!(matches!(jwt.authenticate(&token), Err(AuthError::Expired)));
    }

    #[test]
    fn test_garbage_token_rejected() {
        let jwt = JwtManager::new("test-secret-key-at-least-32-chars!", 24);
        assert!(jwt.authenticate("not-a-jwt").is_err());
    }
}
