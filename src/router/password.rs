//! Password reset flow.

use axum::{Json, extract::State};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::auth::Receipt;
use crate::crypto::OPAQUE_TOKEN_LENGTH;
use crate::error::Result;
use crate::mail::Mailer;
use crate::router::Valid;
use crate::store::CredentialStore;

#[derive(Debug, Deserialize, Validate)]
pub struct ForgotBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

/// Handler requesting a reset link.
///
/// Responds identically whether or not the address is registered.
pub async fn forgot<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<ForgotBody>,
) -> Result<Json<Receipt>> {
    let receipt = state.auth.request_password_reset(&body.email).await?;

    Ok(Json(receipt))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResetBody {
    #[validate(length(
        equal = OPAQUE_TOKEN_LENGTH,
        message = "Malformed reset token."
    ))]
    pub token: String,
    #[validate(length(
        min = 8,
        max = 255,
        message = "Password must contain at least 8 characters."
    ))]
    pub new_password: String,
}

/// Handler consuming a reset token and saving the new password.
pub async fn reset<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<ResetBody>,
) -> Result<Json<Receipt>> {
    let receipt = state
        .auth
        .reset_password(&body.token, &body.new_password)
        .await?;

    Ok(Json(receipt))
}
