//! HS256 access-token verification against the auth service's shared secret.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;

pub const ACCESS_TOKEN_TYPE: &str = "access";
pub const REFRESH_TOKEN_TYPE: &str = "refresh";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// User id.
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: String,
    pub iat: i64,
    pub exp: i64,
}

#[derive(Clone)]
pub struct JwtVerifier {
    decoding: DecodingKey,
    encoding: EncodingKey,
}

impl JwtVerifier {
    /// Build from the base64-encoded HMAC secret.
    pub fn from_base64_secret(secret: &str) -> Result<Self, ApiError> {
        let bytes = STANDARD.decode(secret.trim()).map_err(|e| {
            tracing::error!(?e, "JWT secret is not valid base64");
            ApiError::internal("Invalid JWT secret")
        })?;
        Ok(Self::from_secret(&bytes))
    }

    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
        }
    }

    /// Validate signature, expiry and token type, returning the user id.
    pub fn verify_access(&self, token: &str) -> Result<String, ApiError> {
        let token = token.strip_prefix("Bearer ").unwrap_or(token);
        let validation = Validation::new(Algorithm::HS256);

        let data = jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &validation).map_err(|e| {
            tracing::debug!(?e, "access token validation failed");
            ApiError::unauthorized("Invalid or expired token")
        })?;

        if data.claims.token_type != ACCESS_TOKEN_TYPE {
            return Err(ApiError::unauthorized("Not an access token"));
        }
        Ok(data.claims.sub)
    }

    /// Mint a token. The auth service normally does this; the chat service
    /// uses it for local tooling.
    pub fn issue(&self, user_id: &str, token_type: &str, ttl: chrono::Duration) -> Result<String, ApiError> {
        let now = Utc::now();
        let claims = TokenClaims {
            sub: user_id.to_string(),
            token_type: token_type.to_string(),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(|e| {
            tracing::error!(?e, "failed to sign token");
            ApiError::internal("Failed to sign token")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn verifier() -> JwtVerifier {
        JwtVerifier::from_base64_secret(&STANDARD.encode(b"0123456789abcdef0123456789abcdef")).unwrap()
    }

    #[test]
    fn accepts_access_token_with_or_without_bearer_prefix() {
        let v = verifier();
        let token = v.issue("u1", ACCESS_TOKEN_TYPE, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(v.verify_access(&token).unwrap(), "u1");
        assert_eq!(v.verify_access(&format!("Bearer {token}")).unwrap(), "u1");
    }

    #[test]
    fn rejects_refresh_tokens() {
        let v = verifier();
        let token = v.issue("u1", REFRESH_TOKEN_TYPE, chrono::Duration::minutes(5)).unwrap();
        assert_eq!(v.verify_access(&token).unwrap_err().code, "UNAUTHORIZED");
    }

    #[test]
    fn rejects_expired_and_foreign_tokens() {
        let v = verifier();
        let expired = v.issue("u1", ACCESS_TOKEN_TYPE, chrono::Duration::hours(-1)).unwrap();
        assert!(v.verify_access(&expired).is_err());

        let other = JwtVerifier::from_secret(b"another secret entirely, 32 byt");
        let foreign = other.issue("u1", ACCESS_TOKEN_TYPE, chrono::Duration::minutes(5)).unwrap();
        assert!(v.verify_access(&foreign).is_err());
        assert!(v.verify_access("garbage").is_err());
    }

    #[test]
    fn rejects_non_base64_secret() {
        assert!(JwtVerifier::from_base64_secret("not base64!!").is_err());
    }
}
