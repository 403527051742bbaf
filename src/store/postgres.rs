//! PostgreSQL-backed [`CredentialStore`].

use std::time::Duration;

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{CredentialStore, StoreError, StoreResult};
use crate::config::Postgres;
use crate::limiter::BlockedIp;
use crate::token::{TokenKind, TokenRecord};
use crate::user::User;

pub const DEFAULT_CREDENTIALS: &str = "postgres";
pub const DEFAULT_DATABASE_NAME: &str = "portcullis";
pub const DEFAULT_POOL_SIZE: u32 = 10;
const DEFAULT_QUERY_DEADLINE: Duration = Duration::from_secs(5);

const USER_COLUMNS: &str = "id, username, email, password_hash, is_active, \
     is_locked, login_attempts, account_unlock, last_login_at, \
     last_login_ip, created_at";
const TOKEN_COLUMNS: &str =
    "id, user_id, token, token_type, expires_at, is_revoked, created_at";

/// Connection pool with a per-query deadline.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
    deadline: Duration,
}

impl PgStore {
    /// Open a connection pool against the configured instance.
    pub async fn connect(config: &Postgres) -> Result<Self, sqlx::Error> {
        let hostname = &config.address;
        let username =
            config.username.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let password =
            config.password.as_deref().unwrap_or(DEFAULT_CREDENTIALS);
        let db =
            config.database.as_deref().unwrap_or(DEFAULT_DATABASE_NAME);

        let addr = format!("postgres://{username}:{password}@{hostname}/{db}");
        let pool = PgPoolOptions::new()
            .max_connections(config.pool_size.unwrap_or(DEFAULT_POOL_SIZE))
            .connect(&addr)
            .await?;

        tracing::info!(%hostname, %db, "postgres connected");

        Ok(Self {
            pool,
            deadline: config
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_QUERY_DEADLINE),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run a query under the configured deadline. A stuck connection turns
    /// into [`StoreError::Timeout`] instead of hanging its caller.
    async fn bounded<T>(
        &self,
        operation: impl Future<Output = Result<T, sqlx::Error>> + Send,
    ) -> StoreResult<T> {
        match tokio::time::timeout(self.deadline, operation).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(StoreError::Timeout),
        }
    }
}

async fn insert_token_on(
    conn: &mut PgConnection,
    token: &TokenRecord,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO tokens (id, user_id, token, token_type, expires_at, \
         is_revoked, created_at) VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(token.id)
    .bind(token.user_id)
    .bind(&token.token)
    .bind(token.kind.as_str())
    .bind(token.expires_at)
    .bind(token.is_revoked)
    .bind(token.created_at)
    .execute(conn)
    .await?;

    Ok(())
}

async fn save_login_state_on(
    conn: &mut PgConnection,
    user: &User,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE users SET login_attempts = $2, is_locked = $3, \
         account_unlock = $4, last_login_at = $5, last_login_ip = $6 \
         WHERE id = $1",
    )
    .bind(user.id)
    .bind(user.login_attempts)
    .bind(user.is_locked)
    .bind(user.account_unlock)
    .bind(user.last_login_at)
    .bind(&user.last_login_ip)
    .execute(conn)
    .await?;

    Ok(())
}

async fn revoke_user_tokens_on(
    conn: &mut PgConnection,
    user_id: Uuid,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tokens SET is_revoked = TRUE WHERE user_id = $1")
        .bind(user_id)
        .execute(conn)
        .await?;

    Ok(())
}

impl CredentialStore for PgStore {
    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        self.bounded(
            sqlx::query_as(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
            ))
            .bind(id)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<User>> {
        self.bounded(
            sqlx::query_as(&format!(
                "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
            ))
            .bind(email)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query(
                "INSERT INTO users (id, username, email, password_hash, \
                 is_active, is_locked, login_attempts, account_unlock, \
                 last_login_at, last_login_ip, created_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
            )
            .bind(user.id)
            .bind(&user.username)
            .bind(&user.email)
            .bind(&user.password_hash)
            .bind(user.is_active)
            .bind(user.is_locked)
            .bind(user.login_attempts)
            .bind(user.account_unlock)
            .bind(user.last_login_at)
            .bind(&user.last_login_ip)
            .bind(user.created_at)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
        .await
    }

    async fn save_login_state(&self, user: &User) -> StoreResult<()> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            save_login_state_on(&mut *conn, user).await?;

            Ok(())
        })
        .await
    }

    async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query("DELETE FROM users WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
        .await
    }

    async fn commit_login(
        &self,
        user: &User,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> StoreResult<()> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            save_login_state_on(&mut *tx, user).await?;
            insert_token_on(&mut *tx, access).await?;
            insert_token_on(&mut *tx, refresh).await?;
            tx.commit().await
        })
        .await
    }

    async fn commit_activation(&self, user: &User) -> StoreResult<()> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE users SET is_active = TRUE WHERE id = $1")
                .bind(user.id)
                .execute(&mut *tx)
                .await?;
            revoke_user_tokens_on(&mut *tx, user.id).await?;
            tx.commit().await
        })
        .await
    }

    async fn commit_password_reset(&self, user: &User) -> StoreResult<()> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            sqlx::query("UPDATE users SET password_hash = $2 WHERE id = $1")
                .bind(user.id)
                .bind(&user.password_hash)
                .execute(&mut *tx)
                .await?;
            revoke_user_tokens_on(&mut *tx, user.id).await?;
            tx.commit().await
        })
        .await
    }

    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            insert_token_on(&mut *conn, token).await
        })
        .await
    }

    async fn insert_token_pair(
        &self,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> StoreResult<()> {
        self.bounded(async {
            let mut tx = self.pool.begin().await?;
            insert_token_on(&mut *tx, access).await?;
            insert_token_on(&mut *tx, refresh).await?;
            tx.commit().await
        })
        .await
    }

    async fn find_token(
        &self,
        token: &str,
        kind: Option<TokenKind>,
    ) -> StoreResult<Option<TokenRecord>> {
        self.bounded(
            sqlx::query_as(&format!(
                "SELECT {TOKEN_COLUMNS} FROM tokens WHERE token = $1 \
                 AND ($2::text IS NULL OR token_type = $2)"
            ))
            .bind(token)
            .bind(kind.map(|kind| kind.as_str()))
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn find_token_with_user(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> StoreResult<Option<(TokenRecord, User)>> {
        // One read so the token cannot change under its user between two
        // queries.
        let row: Option<TokenUserRow> = self
            .bounded(
                sqlx::query_as(
                    "SELECT t.id, t.user_id, t.token, t.token_type, \
                     t.expires_at, t.is_revoked, t.created_at, \
                     u.username, u.email, u.password_hash, u.is_active, \
                     u.is_locked, u.login_attempts, u.account_unlock, \
                     u.last_login_at, u.last_login_ip, \
                     u.created_at AS user_created_at \
                     FROM tokens t JOIN users u ON u.id = t.user_id \
                     WHERE t.token = $1 AND t.token_type = $2 \
                     AND t.is_revoked = FALSE",
                )
                .bind(token)
                .bind(kind.as_str())
                .fetch_optional(&self.pool),
            )
            .await?;

        Ok(row.map(TokenUserRow::split))
    }

    async fn revoke_token(&self, id: Uuid) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query("UPDATE tokens SET is_revoked = TRUE WHERE id = $1")
                .bind(id)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
        .await
    }

    async fn revoke_user_tokens(&self, user_id: Uuid) -> StoreResult<()> {
        self.bounded(async {
            let mut conn = self.pool.acquire().await?;
            revoke_user_tokens_on(&mut *conn, user_id).await
        })
        .await
    }

    async fn revoke_user_tokens_by_kind(
        &self,
        user_id: Uuid,
        kind: TokenKind,
    ) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query(
                "UPDATE tokens SET is_revoked = TRUE \
                 WHERE user_id = $1 AND token_type = $2",
            )
            .bind(user_id)
            .bind(kind.as_str())
            .execute(&self.pool)
            .await?;

            Ok(())
        })
        .await
    }

    async fn find_blocked_ip(
        &self,
        ip: &str,
    ) -> StoreResult<Option<BlockedIp>> {
        self.bounded(
            sqlx::query_as(
                "SELECT ip, blocked_at, expires_at FROM blocked_ips \
                 WHERE ip = $1",
            )
            .bind(ip)
            .fetch_optional(&self.pool),
        )
        .await
    }

    async fn upsert_blocked_ip(&self, block: &BlockedIp) -> StoreResult<()> {
        self.bounded(async {
            // Two limiter instances may block the same address at once.
            sqlx::query(
                "INSERT INTO blocked_ips (ip, blocked_at, expires_at) \
                 VALUES ($1, $2, $3) ON CONFLICT (ip) DO UPDATE \
                 SET blocked_at = EXCLUDED.blocked_at, \
                 expires_at = EXCLUDED.expires_at",
            )
            .bind(&block.ip)
            .bind(block.blocked_at)
            .bind(block.expires_at)
            .execute(&self.pool)
            .await?;

            Ok(())
        })
        .await
    }

    async fn delete_blocked_ip(&self, ip: &str) -> StoreResult<()> {
        self.bounded(async {
            sqlx::query("DELETE FROM blocked_ips WHERE ip = $1")
                .bind(ip)
                .execute(&self.pool)
                .await?;

            Ok(())
        })
        .await
    }
}

#[derive(sqlx::FromRow)]
struct TokenUserRow {
    id: Uuid,
    user_id: Uuid,
    token: String,
    #[sqlx(try_from = "String")]
    token_type: TokenKind,
    expires_at: chrono::DateTime<chrono::Utc>,
    is_revoked: bool,
    created_at: chrono::DateTime<chrono::Utc>,
    username: String,
    email: String,
    password_hash: String,
    is_active: bool,
    is_locked: bool,
    login_attempts: i32,
    account_unlock: Option<chrono::DateTime<chrono::Utc>>,
    last_login_at: Option<chrono::DateTime<chrono::Utc>>,
    last_login_ip: Option<String>,
    user_created_at: chrono::DateTime<chrono::Utc>,
}

impl TokenUserRow {
    fn split(self) -> (TokenRecord, User) {
        (
            TokenRecord {
                id: self.id,
                user_id: self.user_id,
                token: self.token,
                kind: self.token_type,
                expires_at: self.expires_at,
                is_revoked: self.is_revoked,
                created_at: self.created_at,
            },
            User {
                id: self.user_id,
                username: self.username,
                email: self.email,
                password_hash: self.password_hash,
                is_active: self.is_active,
                is_locked: self.is_locked,
                login_attempts: self.login_attempts,
                account_unlock: self.account_unlock,
                last_login_at: self.last_login_at,
                last_login_ip: self.last_login_ip,
                created_at: self.user_created_at,
            },
        )
    }
}
