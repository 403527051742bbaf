//! Durable credential state.
//!
//! [`CredentialStore`] is the single seam between the services and the
//! database, so the whole HTTP surface can be exercised against the
//! in-memory store in tests.

#[cfg(test)]
mod memory;
mod postgres;

#[cfg(test)]
pub use memory::MemoryStore;
pub use postgres::PgStore;

use uuid::Uuid;

use crate::limiter::BlockedIp;
use crate::token::{TokenKind, TokenRecord};
use crate::user::User;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
    /// The query did not complete within the configured deadline.
    #[error("database operation timed out")]
    Timeout,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Persistence operations over users, tokens and blocked IPs.
///
/// Each method is one logical operation; multi-row methods (the `commit_*`
/// family and [`Self::insert_token_pair`]) are atomic, all rows land or
/// none do.
pub trait CredentialStore: Clone + Send + Sync + 'static {
    fn find_user_by_id(
        &self,
        id: Uuid,
    ) -> impl Future<Output = StoreResult<Option<User>>> + Send;

    fn find_user_by_email(
        &self,
        email: &str,
    ) -> impl Future<Output = StoreResult<Option<User>>> + Send;

    fn insert_user(
        &self,
        user: &User,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Persist the lockout and last-login fields of a user.
    fn save_login_state(
        &self,
        user: &User,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn delete_user(
        &self,
        id: Uuid,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Commit a successful login: the reset lockout state and the fresh
    /// access/refresh pair, atomically.
    fn commit_login(
        &self,
        user: &User,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Mark the user active and revoke all their outstanding tokens.
    fn commit_activation(
        &self,
        user: &User,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Save the user's new password hash and revoke all their outstanding
    /// tokens.
    fn commit_password_reset(
        &self,
        user: &User,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn insert_token(
        &self,
        token: &TokenRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn insert_token_pair(
        &self,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    /// Look up a token by its exact string, optionally narrowed to a kind.
    /// Revoked and expired rows are returned; callers decide what they mean.
    fn find_token(
        &self,
        token: &str,
        kind: Option<TokenKind>,
    ) -> impl Future<Output = StoreResult<Option<TokenRecord>>> + Send;

    /// Fetch a non-revoked token and its owning user in one read.
    fn find_token_with_user(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> impl Future<Output = StoreResult<Option<(TokenRecord, User)>>> + Send;

    fn revoke_token(
        &self,
        id: Uuid,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn revoke_user_tokens(
        &self,
        user_id: Uuid,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn revoke_user_tokens_by_kind(
        &self,
        user_id: Uuid,
        kind: TokenKind,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn find_blocked_ip(
        &self,
        ip: &str,
    ) -> impl Future<Output = StoreResult<Option<BlockedIp>>> + Send;

    fn upsert_blocked_ip(
        &self,
        block: &BlockedIp,
    ) -> impl Future<Output = StoreResult<()>> + Send;

    fn delete_blocked_ip(
        &self,
        ip: &str,
    ) -> impl Future<Output = StoreResult<()>> + Send;
}
