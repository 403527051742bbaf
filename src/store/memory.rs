//! In-memory [`CredentialStore`] used by the test suite.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use uuid::Uuid;

use super::{CredentialStore, StoreError, StoreResult};
use crate::limiter::BlockedIp;
use crate::token::{TokenKind, TokenRecord};
use crate::user::User;

#[derive(Default)]
struct Inner {
    users: HashMap<Uuid, User>,
    tokens: Vec<TokenRecord>,
    blocked: HashMap<String, BlockedIp>,
}

/// Hash-map backed store with a write-failure switch for exercising
/// rollback paths.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    write_budget: Arc<AtomicI32>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            inner: Arc::default(),
            write_budget: Arc::new(AtomicI32::new(i32::MAX)),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next write return [`StoreError::Timeout`]. Later writes
    /// succeed again.
    pub fn fail_writes(&self, fail: bool) {
        self.write_budget
            .store(if fail { 0 } else { i32::MAX }, Ordering::SeqCst);
    }

    /// Let `writes` more writes succeed, fail the one after, then recover.
    pub fn fail_after(&self, writes: i32) {
        self.write_budget.store(writes, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap()
    }

    fn write(&self) -> StoreResult<MutexGuard<'_, Inner>> {
        if self.write_budget.fetch_sub(1, Ordering::SeqCst) <= 0 {
            self.write_budget.store(i32::MAX, Ordering::SeqCst);
            return Err(StoreError::Timeout);
        }
        Ok(self.lock())
    }

    pub fn token_count(&self) -> usize {
        self.lock().tokens.len()
    }

    pub fn tokens_for(&self, user_id: Uuid) -> Vec<TokenRecord> {
        self.lock()
            .tokens
            .iter()
            .filter(|token| token.user_id == user_id)
            .cloned()
            .collect()
    }

    pub fn user(&self, id: Uuid) -> Option<User> {
        self.lock().users.get(&id).cloned()
    }
}

fn revoke_matching(
    tokens: &mut [TokenRecord],
    user_id: Uuid,
    kind: Option<TokenKind>,
) {
    for token in tokens {
        if token.user_id == user_id
            && kind.is_none_or(|kind| token.kind == kind)
        {
            token.is_revoked = true;
        }
    }
}

impl CredentialStore for MemoryStore {
    async fn find_user_by_id(&self, id: Uuid) -> StoreResult<Option<User>> {
        Ok(self.lock().users.get(&id).cloned())
    }

    async fn find_user_by_email(
        &self,
        email: &str,
    ) -> StoreResult<Option<User>> {
        Ok(self
            .lock()
            .users
            .values()
            .find(|user| user.email == email)
            .cloned())
    }

    async fn insert_user(&self, user: &User) -> StoreResult<()> {
        self.write()?.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn save_login_state(&self, user: &User) -> StoreResult<()> {
        self.write()?.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn delete_user(&self, id: Uuid) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.users.remove(&id);
        inner.tokens.retain(|token| token.user_id != id);
        Ok(())
    }

    async fn commit_login(
        &self,
        user: &User,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.users.insert(user.id, user.clone());
        inner.tokens.push(access.clone());
        inner.tokens.push(refresh.clone());
        Ok(())
    }

    async fn commit_activation(&self, user: &User) -> StoreResult<()> {
        let mut inner = self.write()?;
        if let Some(row) = inner.users.get_mut(&user.id) {
            row.is_active = true;
        }
        revoke_matching(&mut inner.tokens, user.id, None);
        Ok(())
    }

    async fn commit_password_reset(&self, user: &User) -> StoreResult<()> {
        let mut inner = self.write()?;
        if let Some(row) = inner.users.get_mut(&user.id) {
            row.password_hash = user.password_hash.clone();
        }
        revoke_matching(&mut inner.tokens, user.id, None);
        Ok(())
    }

    async fn insert_token(&self, token: &TokenRecord) -> StoreResult<()> {
        self.write()?.tokens.push(token.clone());
        Ok(())
    }

    async fn insert_token_pair(
        &self,
        access: &TokenRecord,
        refresh: &TokenRecord,
    ) -> StoreResult<()> {
        let mut inner = self.write()?;
        inner.tokens.push(access.clone());
        inner.tokens.push(refresh.clone());
        Ok(())
    }

    async fn find_token(
        &self,
        token: &str,
        kind: Option<TokenKind>,
    ) -> StoreResult<Option<TokenRecord>> {
        Ok(self
            .lock()
            .tokens
            .iter()
            .find(|record| {
                record.token == token
                    && kind.is_none_or(|kind| record.kind == kind)
            })
            .cloned())
    }

    async fn find_token_with_user(
        &self,
        token: &str,
        kind: TokenKind,
    ) -> StoreResult<Option<(TokenRecord, User)>> {
        let inner = self.lock();
        Ok(inner
            .tokens
            .iter()
            .find(|record| {
                record.token == token
                    && record.kind == kind
                    && !record.is_revoked
            })
            .and_then(|record| {
                inner
                    .users
                    .get(&record.user_id)
                    .map(|user| (record.clone(), user.clone()))
            }))
    }

    async fn revoke_token(&self, id: Uuid) -> StoreResult<()> {
        for token in &mut self.write()?.tokens {
            if token.id == id {
                token.is_revoked = true;
            }
        }
        Ok(())
    }

    async fn revoke_user_tokens(&self, user_id: Uuid) -> StoreResult<()> {
        revoke_matching(&mut self.write()?.tokens, user_id, None);
        Ok(())
    }

    async fn revoke_user_tokens_by_kind(
        &self,
        user_id: Uuid,
        kind: TokenKind,
    ) -> StoreResult<()> {
        revoke_matching(&mut self.write()?.tokens, user_id, Some(kind));
        Ok(())
    }

    async fn find_blocked_ip(
        &self,
        ip: &str,
    ) -> StoreResult<Option<BlockedIp>> {
        Ok(self.lock().blocked.get(ip).cloned())
    }

    async fn upsert_blocked_ip(&self, block: &BlockedIp) -> StoreResult<()> {
        self.write()?
            .blocked
            .insert(block.ip.clone(), block.clone());
        Ok(())
    }

    async fn delete_blocked_ip(&self, ip: &str) -> StoreResult<()> {
        self.write()?.blocked.remove(ip);
        Ok(())
    }
}
