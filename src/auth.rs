//! Account lifecycle: registration, login with lockout, activation and
//! password reset.

use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::crypto::PasswordManager;
use crate::error::{Result, ServerError};
use crate::mail::{Mailer, Template};
use crate::store::CredentialStore;
use crate::token::{TokenError, TokenKind, TokenService};
use crate::user::User;

/// Failed-login lockout policy.
#[derive(Clone, Copy, Debug)]
pub struct LockoutPolicy {
    pub max_attempts: i32,
    pub unlock: Duration,
}

impl Default for LockoutPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            unlock: Duration::minutes(15),
        }
    }
}

/// Token pair handed out on login.
#[derive(Debug, Serialize)]
pub struct TokenSchema {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: &'static str,
}

/// Deliberately uninformative acknowledgment.
#[derive(Debug, Serialize)]
pub struct Receipt {
    pub message: String,
}

impl Receipt {
    pub fn new(message: &str) -> Self {
        Self {
            message: message.to_owned(),
        }
    }
}

/// Account operations over a [`CredentialStore`] and a [`Mailer`].
#[derive(Clone)]
pub struct AuthService<S, M> {
    store: S,
    tokens: TokenService<S>,
    mail: M,
    pwd: Arc<PasswordManager>,
    policy: LockoutPolicy,
}

impl<S: CredentialStore, M: Mailer> AuthService<S, M> {
    pub fn new(
        store: S,
        tokens: TokenService<S>,
        mail: M,
        pwd: Arc<PasswordManager>,
        policy: LockoutPolicy,
    ) -> Self {
        Self {
            store,
            tokens,
            mail,
            pwd,
            policy,
        }
    }

    /// Check credentials and hand out a fresh token pair.
    ///
    /// The lockout check comes before the password check, so a locked
    /// account rejects even the correct password without touching the
    /// attempt counter. The reset lockout state and the new pair are
    /// committed together.
    pub async fn authenticate_user(
        &self,
        email: &str,
        password: &str,
        ip: Option<String>,
    ) -> Result<(User, TokenSchema)> {
        let Some(mut user) = self.store.find_user_by_email(email).await?
        else {
            return Err(ServerError::InvalidCredentials);
        };

        let now = Utc::now();
        if user.is_locked_at(now) {
            return Err(ServerError::AccountLocked {
                until: user.account_unlock,
            });
        }

        if !self.pwd.verify_password(password, &user.password_hash) {
            user.register_login_failure(
                self.policy.max_attempts,
                self.policy.unlock,
                now,
            );
            self.store.save_login_state(&user).await?;
            if user.is_locked {
                tracing::warn!(
                    user_id = %user.id,
                    attempts = user.login_attempts,
                    "account locked after repeated login failures"
                );
            }
            return Err(ServerError::InvalidCredentials);
        }

        if !user.is_active {
            return Err(ServerError::NotActivated);
        }

        user.register_login_success(now, ip);
        let (access, refresh) = self.tokens.issue_pair(user.id)?;
        self.store.commit_login(&user, &access, &refresh).await?;

        tracing::debug!(user_id = %user.id, "login succeeded");

        Ok((
            user,
            TokenSchema {
                access_token: access.token,
                refresh_token: refresh.token,
                token_type: crate::TOKEN_TYPE,
            },
        ))
    }

    /// Create an inactive account and send its activation link.
    ///
    /// If the activation token cannot be written, the fresh user row is
    /// removed again so registration can simply be retried.
    pub async fn register_user(
        &self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<User> {
        if self.store.find_user_by_email(email).await?.is_some() {
            return Err(ServerError::AlreadyExists);
        }

        let hash = self.pwd.hash_password(password)?;
        let user = User::new(username, email, hash);
        self.store.insert_user(&user).await?;

        let token = match self.tokens.create_activation_token(user.id).await {
            Ok(token) => token,
            Err(err) => {
                self.store.delete_user(user.id).await?;
                return Err(err);
            },
        };

        if let Err(err) = self
            .mail
            .send(
                Template::AccountActivation,
                &user.email,
                &user.username,
                Some(&token.token),
            )
            .await
        {
            // The account stays; a resend can mint a fresh link. The unsent
            // token must not remain usable.
            self.tokens.revoke_token(&token).await?;
            return Err(err.into());
        }

        tracing::info!(user_id = %user.id, "user registered");

        Ok(user)
    }

    /// Consume an activation token and mark the account active.
    ///
    /// Activating an already-active account consumes the token and reports
    /// success, so a double-clicked link does not error.
    pub async fn process_account_activation(&self, token: &str) -> Result<User> {
        let Some((record, mut user)) = self
            .tokens
            .get_active_token_with_user(token, TokenKind::Activation)
            .await?
        else {
            return Err(TokenError::Invalid.into());
        };

        if record.is_expired(Utc::now()) {
            self.tokens.revoke_token(&record).await?;
            return Err(TokenError::Expired.into());
        }

        if user.is_active {
            self.tokens.revoke_token(&record).await?;
            return Ok(user);
        }

        self.store.commit_activation(&user).await?;
        user.is_active = true;

        // Confirmation mail is best effort; activation already happened.
        if let Err(err) = self
            .mail
            .send(
                Template::ActivationConfirm,
                &user.email,
                &user.username,
                None,
            )
            .await
        {
            tracing::warn!(%err, user_id = %user.id, "confirmation mail failed");
        }

        Ok(user)
    }

    /// Mint a fresh activation link for an inactive account.
    pub async fn resend_activation_token(&self, email: &str) -> Result<Receipt> {
        let Some(user) = self.store.find_user_by_email(email).await? else {
            return Err(ServerError::NotFound { resource: "user" });
        };
        if user.is_active {
            return Err(ServerError::AlreadyActive);
        }

        self.tokens
            .revoke_user_tokens_by_kind(user.id, TokenKind::Activation)
            .await?;
        let token = self.tokens.create_activation_token(user.id).await?;

        if let Err(err) = self
            .mail
            .send(
                Template::AccountActivation,
                &user.email,
                &user.username,
                Some(&token.token),
            )
            .await
        {
            self.tokens.revoke_token(&token).await?;
            return Err(err.into());
        }

        Ok(Receipt::new("Activation email sent."))
    }

    /// Send a password-reset link if the address is known.
    ///
    /// Unknown addresses get the same receipt as known ones, so this
    /// endpoint cannot be used to probe which emails are registered.
    pub async fn request_password_reset(&self, email: &str) -> Result<Receipt> {
        let receipt = Receipt::new(
            "If the address is registered, a reset email has been sent.",
        );

        let Some(user) = self.store.find_user_by_email(email).await? else {
            return Ok(receipt);
        };

        let token =
            self.tokens.create_password_reset_token(user.id).await?;

        if let Err(err) = self
            .mail
            .send(
                Template::PasswordReset,
                &user.email,
                &user.username,
                Some(&token.token),
            )
            .await
        {
            self.tokens.revoke_token(&token).await?;
            return Err(err.into());
        }

        Ok(receipt)
    }

    /// Consume a reset token and save the new password.
    ///
    /// Every outstanding token of the user is revoked in the same commit;
    /// stolen sessions do not survive a password change.
    pub async fn reset_password(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<Receipt> {
        let record = self.tokens.get_valid_reset_token(token).await?;

        let Some(mut user) =
            self.store.find_user_by_id(record.user_id).await?
        else {
            return Err(TokenError::Invalid.into());
        };

        user.password_hash = self.pwd.hash_password(new_password)?;
        self.store.commit_password_reset(&user).await?;

        tracing::info!(user_id = %user.id, "password reset");

        Ok(Receipt::new("Password has been reset."))
    }

    /// Revoke every token of the bearer's account.
    pub async fn logout(&self, bearer: &str) -> Result<Uuid> {
        let user_id = self.tokens.authenticate(bearer)?;
        self.tokens.revoke_all_user_tokens(user_id).await?;

        Ok(user_id)
    }
}
