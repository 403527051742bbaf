//! Sole authority for creating and invalidating credentials: JWT
//! access/refresh pairs and single-use opaque tokens.

mod jwt;

pub use jwt::{ACCESS_TOKEN_USE, Claims, JwtSigner, REFRESH_TOKEN_USE};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::crypto::generate_opaque_token;
use crate::error::Result;
use crate::store::CredentialStore;
use crate::user::User;

/// Errors raised by token operations.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Signing or persistence failure. Fatal to the calling operation and
    /// never retried silently.
    #[error("failed to create token: {0}")]
    Creation(String),
    /// A matching credential exists but is past expiry.
    #[error("token has expired")]
    Expired,
    /// Malformed signature, wrong type claim, unparseable subject or no
    /// matching credential.
    #[error("token is invalid")]
    Invalid,
}

/// Kinds of durable credentials.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum TokenKind {
    Access,
    Refresh,
    Activation,
    PasswordReset,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Access => "access",
            TokenKind::Refresh => "refresh",
            TokenKind::Activation => "activation",
            TokenKind::PasswordReset => "password_reset",
        }
    }
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<String> for TokenKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        match value.as_str() {
            "access" => Ok(TokenKind::Access),
            "refresh" => Ok(TokenKind::Refresh),
            "activation" => Ok(TokenKind::Activation),
            "password_reset" => Ok(TokenKind::PasswordReset),
            other => Err(format!("unknown token kind: {other}")),
        }
    }
}

/// A single durable credential record.
///
/// Never mutated after creation except for the revoked flag.
#[derive(Clone, Debug, PartialEq, Serialize, sqlx::FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token: String,
    #[sqlx(rename = "token_type", try_from = "String")]
    pub kind: TokenKind,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub created_at: DateTime<Utc>,
}

impl TokenRecord {
    pub fn new(
        user_id: Uuid,
        token: String,
        kind: TokenKind,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            token,
            kind,
            expires_at,
            is_revoked: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// A token is valid iff it is neither revoked nor expired.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && !self.is_expired(now)
    }
}

/// Time-to-live of single-use opaque tokens.
#[derive(Clone, Copy, Debug)]
pub struct OpaqueTtl {
    pub activation: Duration,
    pub reset: Duration,
}

/// Issue, verify, rotate and revoke every token kind.
#[derive(Clone)]
pub struct TokenService<S> {
    store: S,
    jwt: JwtSigner,
    ttl: OpaqueTtl,
}

impl<S: CredentialStore> TokenService<S> {
    /// Create a new [`TokenService`].
    pub fn new(store: S, jwt: JwtSigner, ttl: OpaqueTtl) -> Self {
        Self { store, jwt, ttl }
    }

    /// Sign a fresh access/refresh pair without persisting it.
    ///
    /// Callers that need the pair committed together with other state (the
    /// login transaction) persist the returned records themselves;
    /// [`Self::create_token_pair`] is the standalone variant.
    pub fn issue_pair(
        &self,
        user_id: Uuid,
    ) -> Result<(TokenRecord, TokenRecord)> {
        let now = Utc::now();
        let (access_jwt, access_exp) = self.jwt.sign_access(user_id, now)?;
        let (refresh_jwt, refresh_exp) = self.jwt.sign_refresh(user_id, now)?;

        Ok((
            TokenRecord::new(user_id, access_jwt, TokenKind::Access, access_exp),
            TokenRecord::new(
                user_id,
                refresh_jwt,
                TokenKind::Refresh,
                refresh_exp,
            ),
        ))
    }

    /// Mint and persist a new access/refresh pair.
    ///
    /// Both rows are inserted in one transaction; if persistence fails the
    /// whole pair is discarded.
    pub async fn create_token_pair(
        &self,
        user_id: Uuid,
    ) -> Result<(String, String)> {
        let (access, refresh) = self.issue_pair(user_id)?;
        let pair = (access.token.clone(), refresh.token.clone());

        self.store
            .insert_token_pair(&access, &refresh)
            .await
            .map_err(|err| TokenError::Creation(err.to_string()))?;

        Ok(pair)
    }

    async fn create_opaque_token(
        &self,
        user_id: Uuid,
        kind: TokenKind,
        ttl: Duration,
    ) -> Result<TokenRecord> {
        let record = TokenRecord::new(
            user_id,
            generate_opaque_token(),
            kind,
            Utc::now() + ttl,
        );

        self.store
            .insert_token(&record)
            .await
            .map_err(|err| TokenError::Creation(err.to_string()))?;

        Ok(record)
    }

    /// Create and save a new activation token.
    pub async fn create_activation_token(
        &self,
        user_id: Uuid,
    ) -> Result<TokenRecord> {
        self.create_opaque_token(user_id, TokenKind::Activation, self.ttl.activation)
            .await
    }

    /// Create and save a password-reset token, revoking any prior one.
    ///
    /// At most one live reset token per user at any time; a stale reset link
    /// must not survive a newer request.
    pub async fn create_password_reset_token(
        &self,
        user_id: Uuid,
    ) -> Result<TokenRecord> {
        self.store
            .revoke_user_tokens_by_kind(user_id, TokenKind::PasswordReset)
            .await
            .map_err(|err| TokenError::Creation(err.to_string()))?;

        self.create_opaque_token(user_id, TokenKind::PasswordReset, self.ttl.reset)
            .await
    }

    /// Check whether a matching, non-revoked, unexpired credential exists.
    ///
    /// Revocation wins over expiry: a revoked token is plain `false`
    /// whatever its expiry state. An unrevoked but expired match raises
    /// [`TokenError::Expired`] so callers can tell "expired" from "invalid".
    pub async fn verify_token(
        &self,
        token: &str,
        kind: TokenKind,
        user_id: Option<Uuid>,
    ) -> Result<bool> {
        let Some(record) = self.store.find_token(token, Some(kind)).await?
        else {
            return Ok(false);
        };

        if user_id.is_some_and(|id| id != record.user_id) {
            return Ok(false);
        }
        if record.is_revoked {
            return Ok(false);
        }
        if record.is_expired(Utc::now()) {
            return Err(TokenError::Expired.into());
        }

        Ok(true)
    }

    /// Fetch a live password-reset token.
    ///
    /// An expired token is revoked as a side effect before signaling
    /// [`TokenError::Expired`].
    pub async fn get_valid_reset_token(
        &self,
        token: &str,
    ) -> Result<TokenRecord> {
        let record = self
            .store
            .find_token(token, Some(TokenKind::PasswordReset))
            .await?
            .filter(|record| !record.is_revoked)
            .ok_or(TokenError::Invalid)?;

        if record.is_expired(Utc::now()) {
            self.revoke_token(&record).await?;
            return Err(TokenError::Expired.into());
        }

        Ok(record)
    }

    /// Fetch a non-revoked token together with its owning user in a single
    /// atomic read. Expired records are returned so callers can distinguish
    /// "expired" from "not found".
    pub async fn get_active_token_with_user(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> Result<Option<(TokenRecord, User)>> {
        Ok(self.store.find_token_with_user(token, kind).await?)
    }

    /// Revoke a specific token. Revoking an already-revoked token is a
    /// no-op success.
    pub async fn revoke_token(&self, token: &TokenRecord) -> Result<()> {
        Ok(self.store.revoke_token(token.id).await?)
    }

    /// Revoke all tokens of a user.
    pub async fn revoke_all_user_tokens(&self, user_id: Uuid) -> Result<()> {
        Ok(self.store.revoke_user_tokens(user_id).await?)
    }

    /// Revoke all tokens of a given kind for a user.
    pub async fn revoke_user_tokens_by_kind(
        &self,
        user_id: Uuid,
        kind: TokenKind,
    ) -> Result<()> {
        Ok(self.store.revoke_user_tokens_by_kind(user_id, kind).await?)
    }

    /// Validate a refresh token end to end and return its subject.
    ///
    /// Checks, in order: signature and expiry, `type` claim, parseable UUID
    /// subject, then the durable row (revoked or expired rows fail even if
    /// the signature still verifies).
    pub async fn verify_refresh_token(&self, refresh: &str) -> Result<Uuid> {
        let claims = self.jwt.decode_refresh(refresh)?;
        let user_id =
            Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Invalid)?;

        match self
            .store
            .find_token(refresh, Some(TokenKind::Refresh))
            .await?
        {
            Some(record) if record.is_revoked => {
                Err(TokenError::Invalid.into())
            },
            Some(record) if record.is_expired(Utc::now()) => {
                Err(TokenError::Expired.into())
            },
            Some(_) => Ok(user_id),
            None => Err(TokenError::Invalid.into()),
        }
    }

    /// Mint exactly one new access token from a valid refresh token.
    ///
    /// The refresh token itself is not rotated.
    pub async fn refresh_access_token(
        &self,
        refresh: &str,
    ) -> Result<(String, TokenRecord)> {
        let user_id = self.verify_refresh_token(refresh).await?;

        let (access_jwt, expires_at) =
            self.jwt.sign_access(user_id, Utc::now())?;
        let record = TokenRecord::new(
            user_id,
            access_jwt.clone(),
            TokenKind::Access,
            expires_at,
        );

        self.store
            .insert_token(&record)
            .await
            .map_err(|err| TokenError::Creation(err.to_string()))?;

        Ok((access_jwt, record))
    }

    /// Validate a bearer access token and return its subject.
    pub fn authenticate(&self, bearer: &str) -> Result<Uuid> {
        let claims = self.jwt.decode_access(bearer)?;
        Ok(Uuid::parse_str(&claims.sub).map_err(|_| TokenError::Invalid)?)
    }
}
