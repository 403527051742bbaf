//! User model and login lockout state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// User as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub username: String,
    pub email: String,
    #[serde(skip)]
    pub password_hash: String,
    pub is_active: bool,
    #[serde(skip)]
    pub is_locked: bool,
    #[serde(skip)]
    pub login_attempts: i32,
    #[serde(skip)]
    pub account_unlock: Option<DateTime<Utc>>,
    pub last_login_at: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_login_ip: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a fresh, inactive user. Activation happens by token.
    pub fn new(username: &str, email: &str, password_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            username: username.to_owned(),
            email: email.to_owned(),
            password_hash,
            is_active: false,
            is_locked: false,
            login_attempts: 0,
            account_unlock: None,
            last_login_at: None,
            last_login_ip: None,
            created_at: Utc::now(),
        }
    }

    /// Whether the lockout is in effect at `now`.
    ///
    /// `account_unlock == None` while locked means an indefinite,
    /// admin-placed lock. A past `account_unlock` unlocks implicitly; the
    /// flag is cleared on the next successful login.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.is_locked && self.account_unlock.is_none_or(|until| until > now)
    }

    /// Record a failed password check. Locks the account once the attempt
    /// counter reaches `max_attempts`.
    pub fn register_login_failure(
        &mut self,
        max_attempts: i32,
        unlock_after: Duration,
        now: DateTime<Utc>,
    ) {
        self.login_attempts += 1;
        if self.login_attempts >= max_attempts {
            self.is_locked = true;
            self.account_unlock = Some(now + unlock_after);
        }
    }

    /// Record a successful login: counter and lock reset, metadata updated.
    pub fn register_login_success(
        &mut self,
        now: DateTime<Utc>,
        ip: Option<String>,
    ) {
        self.login_attempts = 0;
        self.is_locked = false;
        self.account_unlock = None;
        self.last_login_at = Some(now);
        self.last_login_ip = ip;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> User {
        User::new("alice", "alice@example.org", "$argon2id$fake".into())
    }

    #[test]
    fn test_lock_after_max_attempts() {
        let mut user = user();
        let now = Utc::now();

        for _ in 0..4 {
            user.register_login_failure(5, Duration::minutes(15), now);
            assert!(!user.is_locked_at(now));
        }

        user.register_login_failure(5, Duration::minutes(15), now);
        assert!(user.is_locked_at(now));
        assert_eq!(user.login_attempts, 5);
        assert_eq!(user.account_unlock, Some(now + Duration::minutes(15)));
    }

    #[test]
    fn test_lock_expires_implicitly() {
        let mut user = user();
        let now = Utc::now();
        user.is_locked = true;
        user.account_unlock = Some(now - Duration::seconds(1));

        assert!(!user.is_locked_at(now));
    }

    #[test]
    fn test_indefinite_lock() {
        let mut user = user();
        user.is_locked = true;
        user.account_unlock = None;

        assert!(user.is_locked_at(Utc::now()));
    }

    #[test]
    fn test_success_resets_state() {
        let mut user = user();
        let now = Utc::now();
        user.login_attempts = 4;
        user.is_locked = true;
        user.account_unlock = Some(now + Duration::minutes(15));

        user.register_login_success(now, Some("10.0.0.1".into()));

        assert_eq!(user.login_attempts, 0);
        assert!(!user.is_locked);
        assert!(user.account_unlock.is_none());
        assert_eq!(user.last_login_at, Some(now));
        assert_eq!(user.last_login_ip.as_deref(), Some("10.0.0.1"));
    }
}
