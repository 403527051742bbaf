//! Account registration.

use axum::{Json, extract::State, http::StatusCode};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::error::Result;
use crate::mail::Mailer;
use crate::router::Valid;
use crate::store::CredentialStore;
use crate::user::User;

#[derive(Debug, Deserialize, Validate)]
pub struct Body {
    #[validate(length(
        min = 2,
        max = 32,
        message = "Username must contain 2 to 32 characters."
    ))]
    pub username: String,
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(
        min = 8,
        max = 255,
        message = "Password must contain at least 8 characters."
    ))]
    pub password: String,
}

/// Handler to create user.
pub async fn handler<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<Body>,
) -> Result<(StatusCode, Json<User>)> {
    let user = state
        .auth
        .register_user(&body.username, &body.email, &body.password)
        .await?;

    Ok((StatusCode::CREATED, Json(user)))
}
