//! Account activation by mailed token.

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
use crate::user::User;

#[derive(Debug, Deserialize, Validate)]
pub struct Body {
    #[validate(length(
        equal = OPAQUE_TOKEN_LENGTH,
        message = "Malformed activation token."
    ))]
    pub token: String,
}

/// Handler consuming an activation token.
pub async fn handler<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<Body>,
) -> Result<Json<User>> {
    let user = state.auth.process_account_activation(&body.token).await?;

    Ok(Json(user))
}

#[derive(Debug, Deserialize, Validate)]
pub struct ResendBody {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
}

/// Handler minting a fresh activation link.
pub async fn resend<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<ResendBody>,
) -> Result<Json<Receipt>> {
    let receipt = state.auth.resend_activation_token(&body.email).await?;

    Ok(Json(receipt))
}
