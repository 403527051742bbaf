//! Signing and validation of JSON Web Tokens.
//!
//! Access and refresh tokens are signed with *different* secrets so a leaked
//! refresh secret cannot mint access tokens, and vice versa.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{
    Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::token::TokenError;

/// `type` claim value of access tokens.
pub const ACCESS_TOKEN_USE: &str = "access_token";
/// `type` claim value of refresh tokens.
pub const REFRESH_TOKEN_USE: &str = "refresh_token";

/// Pieces of information asserted on a JWT.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Whether the token is an access or a refresh token.
    pub r#type: String,
    /// User ID.
    pub sub: String,
    /// Identifies the time at which the JWT was issued.
    pub iat: u64,
    /// Identifies the expiration time on or after which the JWT must not be
    /// accepted for processing.
    pub exp: u64,
}

/// Mint and validate access/refresh JWTs.
#[derive(Clone)]
pub struct JwtSigner {
    access_encoding: EncodingKey,
    access_decoding: DecodingKey,
    refresh_encoding: EncodingKey,
    refresh_decoding: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl JwtSigner {
    /// Create a new [`JwtSigner`] from the two environment-provided secrets.
    pub fn new(
        access_secret: &str,
        refresh_secret: &str,
        access_ttl: Duration,
        refresh_ttl: Duration,
    ) -> Self {
        Self {
            access_encoding: EncodingKey::from_secret(access_secret.as_bytes()),
            access_decoding: DecodingKey::from_secret(access_secret.as_bytes()),
            refresh_encoding: EncodingKey::from_secret(
                refresh_secret.as_bytes(),
            ),
            refresh_decoding: DecodingKey::from_secret(
                refresh_secret.as_bytes(),
            ),
            access_ttl,
            refresh_ttl,
        }
    }

    fn sign(
        &self,
        key: &EncodingKey,
        token_use: &str,
        ttl: Duration,
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        let expires_at = now + ttl;
        let claims = Claims {
            r#type: token_use.to_owned(),
            sub: subject.to_string(),
            iat: now.timestamp() as u64,
            exp: expires_at.timestamp() as u64,
        };
        let token = encode(&Header::new(Algorithm::HS256), &claims, key)
            .map_err(|err| TokenError::Creation(err.to_string()))?;

        Ok((token, expires_at))
    }

    /// Mint a new access JWT, returning it with its expiry.
    pub fn sign_access(
        &self,
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        self.sign(
            &self.access_encoding,
            ACCESS_TOKEN_USE,
            self.access_ttl,
            subject,
            now,
        )
    }

    /// Mint a new refresh JWT, returning it with its expiry.
    pub fn sign_refresh(
        &self,
        subject: Uuid,
        now: DateTime<Utc>,
    ) -> Result<(String, DateTime<Utc>), TokenError> {
        self.sign(
            &self.refresh_encoding,
            REFRESH_TOKEN_USE,
            self.refresh_ttl,
            subject,
            now,
        )
    }

    fn decode(
        key: &DecodingKey,
        token: &str,
        expected_use: &str,
    ) -> Result<Claims, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        let claims = decode::<Claims>(token, key, &validation)
            .map_err(|err| match err.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => {
                    TokenError::Expired
                },
                _ => TokenError::Invalid,
            })?
            .claims;

        if claims.r#type != expected_use {
            return Err(TokenError::Invalid);
        }

        Ok(claims)
    }

    /// Decode and check an access token.
    pub fn decode_access(&self, token: &str) -> Result<Claims, TokenError> {
        Self::decode(&self.access_decoding, token, ACCESS_TOKEN_USE)
    }

    /// Decode and check a refresh token.
    pub fn decode_refresh(&self, token: &str) -> Result<Claims, TokenError> {
        Self::decode(&self.refresh_decoding, token, REFRESH_TOKEN_USE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> JwtSigner {
        JwtSigner::new(
            "access-secret",
            "refresh-secret",
            Duration::minutes(30),
            Duration::days(7),
        )
    }

    #[test]
    fn test_access_roundtrip() {
        let signer = signer();
        let user_id = Uuid::new_v4();
        let now = Utc::now();

        let (token, expires_at) = signer.sign_access(user_id, now).unwrap();
        let claims = signer.decode_access(&token).unwrap();

        assert_eq!(claims.sub, user_id.to_string());
        assert_eq!(claims.r#type, ACCESS_TOKEN_USE);
        assert_eq!(claims.exp, expires_at.timestamp() as u64);
        assert_eq!(expires_at, now + Duration::minutes(30));
    }

    #[test]
    fn test_secrets_are_isolated() {
        let signer = signer();
        let user_id = Uuid::new_v4();

        let (access, _) = signer.sign_access(user_id, Utc::now()).unwrap();
        let (refresh, _) = signer.sign_refresh(user_id, Utc::now()).unwrap();

        // An access token must never validate as a refresh token.
        assert!(matches!(
            signer.decode_refresh(&access),
            Err(TokenError::Invalid)
        ));
        assert!(matches!(
            signer.decode_access(&refresh),
            Err(TokenError::Invalid)
        ));
    }

    #[test]
    fn test_type_claim_checked_even_with_shared_secret() {
        let signer = JwtSigner::new(
            "same-secret",
            "same-secret",
            Duration::minutes(30),
            Duration::days(7),
        );
        let (access, _) =
            signer.sign_access(Uuid::new_v4(), Utc::now()).unwrap();

        // Signature verifies, but the `type` claim does not match.
        assert!(matches!(
            signer.decode_refresh(&access),
            Err(TokenError::Invalid)
        ));
    }

    #[test]
    fn test_expired_token() {
        let signer = signer();
        // Far enough in the past to defeat the default validation leeway.
        let issued = Utc::now() - Duration::hours(2);
        let (token, _) = signer.sign_access(Uuid::new_v4(), issued).unwrap();

        assert!(matches!(
            signer.decode_access(&token),
            Err(TokenError::Expired)
        ));
    }

    #[test]
    fn test_garbage_token() {
        assert!(matches!(
            signer().decode_access("not.a.jwt"),
            Err(TokenError::Invalid)
        ));
    }
}
