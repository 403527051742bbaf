//! Password login.

use axum::{Json, extract::State};
use serde::Deserialize;
use validator::Validate;

use crate::AppState;
use crate::auth::TokenSchema;
use crate::error::Result;
use crate::mail::Mailer;
use crate::middleware::ClientIp;
use crate::router::Valid;
use crate::store::CredentialStore;

#[derive(Debug, Deserialize, Validate)]
pub struct Body {
    #[validate(email(message = "Email must be formatted."))]
    pub email: String,
    #[validate(length(min = 1, message = "Password is required."))]
    pub password: String,
}

/// Handler to log a user in and hand out a token pair.
pub async fn handler<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    ClientIp(ip): ClientIp,
    Valid(body): Valid<Body>,
) -> Result<Json<TokenSchema>> {
    let (_, schema) = state
        .auth
        .authenticate_user(&body.email, &body.password, Some(ip))
        .await?;

    Ok(Json(schema))
}
