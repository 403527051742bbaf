//! Get a new access token with a refresh token, and session logout.

use axum::http::{HeaderMap, StatusCode, header};
use axum::{Json, extract::State};
use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use crate::error::{Result, ServerError};
use crate::mail::Mailer;
use crate::router::Valid;
use crate::store::CredentialStore;
use crate::{AppState, TOKEN_TYPE};

fn validate_grant_type(
    grant_type: &str,
) -> std::result::Result<(), ValidationError> {
    // As specified on OAuth2.0 spec, reject if grant_type is not valid.
    if grant_type != "refresh_token" {
        return Err(ValidationError::new("invalid_grant_type"));
    }

    Ok(())
}

#[derive(Debug, Validate, Deserialize)]
pub struct Body {
    #[validate(length(min = 1, message = "Refresh token is required."))]
    refresh_token: String,
    #[validate(custom(
        function = "validate_grant_type",
        message = "\"grant_type\" must be \"refresh_token\"."
    ))]
    grant_type: String,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub token_type: String,
    pub access_token: String,
    pub expires_in: u64,
}

/// Handler to exchange a refresh token for a fresh access token.
///
/// The refresh token stays valid; only an access token is minted.
pub async fn handler<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    Valid(body): Valid<Body>,
) -> Result<Json<Response>> {
    let (access_token, _) =
        state.tokens.refresh_access_token(&body.refresh_token).await?;

    Ok(Json(Response {
        token_type: TOKEN_TYPE.to_owned(),
        access_token,
        expires_in: state.config.tokens.access_ttl_minutes as u64 * 60,
    }))
}

fn bearer(headers: &HeaderMap) -> Result<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ServerError::Unauthorized)
}

/// Handler to revoke every session of the calling user.
pub async fn logout<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    headers: HeaderMap,
) -> Result<StatusCode> {
    let token = bearer(&headers)?;
    state.auth.logout(token).await?;

    Ok(StatusCode::NO_CONTENT)
}
