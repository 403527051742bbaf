//! Fixed-window rate limiting keyed by (endpoint, client IP).
//!
//! Counters live in process memory; an address that overruns its window is
//! also written to the database so the block outlives a restart and is
//! shared between instances.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::error::ServerError;
use crate::store::CredentialStore;

/// A durable per-address block.
#[derive(Clone, Debug, PartialEq, sqlx::FromRow)]
pub struct BlockedIp {
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    /// `None` means the block never expires on its own.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockedIp {
    pub fn new(
        ip: &str,
        now: DateTime<Utc>,
        ttl: Option<chrono::Duration>,
    ) -> Self {
        Self {
            ip: ip.to_owned(),
            blocked_at: now,
            expires_at: ttl.map(|ttl| now + ttl),
        }
    }

    pub fn is_blocked(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_none_or(|until| until > now)
    }

    /// Seconds until the block lifts, if it ever does.
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> Option<u64> {
        self.expires_at
            .map(|until| (until - now).num_seconds().max(0) as u64)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RateLimitConfig {
    /// Requests allowed per key within one window.
    pub max_requests: u32,
    pub window: Duration,
    /// How long an offending address stays blocked.
    pub block: chrono::Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 5,
            window: Duration::from_secs(60),
            block: chrono::Duration::minutes(15),
        }
    }
}

struct RateWindow {
    count: u32,
    start: Instant,
}

/// Shared request counter.
#[derive(Clone)]
pub struct RateLimiter<S> {
    store: S,
    config: RateLimitConfig,
    windows: Arc<DashMap<(String, String), RateWindow>>,
}

impl<S: CredentialStore> RateLimiter<S> {
    pub fn new(store: S, config: RateLimitConfig) -> Self {
        Self {
            store,
            config,
            windows: Arc::new(DashMap::new()),
        }
    }

    /// Count one request against `(endpoint, ip)` and decide whether it may
    /// proceed.
    ///
    /// The durable block is consulted before any counting, so requests from
    /// a blocked address never advance a window. An expired block row is
    /// deleted on the way.
    pub async fn check(
        &self,
        endpoint: &str,
        ip: &str,
    ) -> Result<(), ServerError> {
        if let Some(block) = self.store.find_blocked_ip(ip).await? {
            let now = Utc::now();
            if block.is_blocked(now) {
                return Err(ServerError::RateLimited {
                    retry_after_secs: block.retry_after_secs(now),
                });
            }
            self.store.delete_blocked_ip(ip).await?;
        }

        // Guard must not be held across an await.
        let exceeded = {
            let mut entry = self
                .windows
                .entry((endpoint.to_owned(), ip.to_owned()))
                .or_insert_with(|| RateWindow {
                    count: 0,
                    start: Instant::now(),
                });

            if entry.start.elapsed() >= self.config.window {
                entry.count = 0;
                entry.start = Instant::now();
            }
            entry.count += 1;
            entry.count > self.config.max_requests
        };

        if exceeded {
            let now = Utc::now();
            let block = BlockedIp::new(ip, now, Some(self.config.block));
            self.store.upsert_blocked_ip(&block).await?;
            self.windows
                .remove(&(endpoint.to_owned(), ip.to_owned()));

            tracing::warn!(%endpoint, %ip, "rate limit exceeded, address blocked");

            return Err(ServerError::RateLimited {
                retry_after_secs: block.retry_after_secs(now),
            });
        }

        Ok(())
    }

    /// Drop windows that have rolled over. Run periodically so idle keys do
    /// not accumulate.
    pub fn sweep(&self) {
        self.windows
            .retain(|_, window| window.start.elapsed() < self.config.window);
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn limiter(store: MemoryStore) -> RateLimiter<MemoryStore> {
        RateLimiter::new(store, RateLimitConfig::default())
    }

    #[tokio::test]
    async fn test_block_on_overrun() {
        let store = MemoryStore::new();
        let limiter = limiter(store.clone());

        for _ in 0..5 {
            limiter.check("/login", "10.0.0.1").await.unwrap();
        }

        let err = limiter.check("/login", "10.0.0.1").await.unwrap_err();
        assert!(matches!(
            err,
            ServerError::RateLimited {
                retry_after_secs: Some(secs)
            } if secs <= 15 * 60
        ));

        // The block is durable, not just an in-memory counter.
        let block = store.find_blocked_ip("10.0.0.1").await.unwrap().unwrap();
        assert!(block.is_blocked(Utc::now()));
    }

    #[tokio::test]
    async fn test_block_survives_restart() {
        let store = MemoryStore::new();
        let first = limiter(store.clone());
        for _ in 0..6 {
            let _ = first.check("/login", "10.0.0.2").await;
        }

        // A fresh limiter over the same store has empty windows but must
        // still refuse the blocked address.
        let restarted = limiter(store.clone());
        let err = restarted.check("/login", "10.0.0.2").await.unwrap_err();
        assert!(matches!(err, ServerError::RateLimited { .. }));
        assert_eq!(restarted.tracked(), 0);
    }

    #[tokio::test]
    async fn test_keys_are_independent() {
        let limiter = limiter(MemoryStore::new());

        for _ in 0..5 {
            limiter.check("/login", "10.0.0.3").await.unwrap();
        }
        // Same address, different endpoint: its own window.
        limiter.check("/password/forgot", "10.0.0.3").await.unwrap();
        // Same endpoint, different address.
        limiter.check("/login", "10.0.0.4").await.unwrap();
    }

    #[tokio::test]
    async fn test_window_rollover() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(
            store,
            RateLimitConfig {
                max_requests: 1,
                window: Duration::from_millis(50),
                ..Default::default()
            },
        );

        limiter.check("/login", "10.0.0.5").await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        limiter.check("/login", "10.0.0.5").await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_block_is_cleared() {
        let store = MemoryStore::new();
        let stale = BlockedIp::new(
            "10.0.0.6",
            Utc::now() - chrono::Duration::hours(1),
            Some(chrono::Duration::minutes(15)),
        );
        store.upsert_blocked_ip(&stale).await.unwrap();

        let limiter = limiter(store.clone());
        limiter.check("/login", "10.0.0.6").await.unwrap();

        assert!(store.find_blocked_ip("10.0.0.6").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_indefinite_block() {
        let block = BlockedIp::new("10.0.0.7", Utc::now(), None);
        assert!(block.is_blocked(Utc::now() + chrono::Duration::days(365)));
        assert_eq!(block.retry_after_secs(Utc::now()), None);
    }

    #[tokio::test]
    async fn test_sweep_drops_rolled_over_windows() {
        let store = MemoryStore::new();
        let limiter = RateLimiter::new(
            store,
            RateLimitConfig {
                window: Duration::from_millis(10),
                ..Default::default()
            },
        );

        limiter.check("/login", "10.0.0.8").await.unwrap();
        assert_eq!(limiter.tracked(), 1);

        tokio::time::sleep(Duration::from_millis(20)).await;
        limiter.sweep();
        assert_eq!(limiter.tracked(), 0);
    }
}
