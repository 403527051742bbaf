//! Error handler for the credential API.

use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use validator::ValidationErrors;

use crate::mail::MailError;
use crate::store::StoreError;
use crate::token::TokenError;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Axum(#[from] JsonRejection),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Token(#[from] TokenError),

    #[error(transparent)]
    Mail(#[from] MailError),

    #[error(transparent)]
    Crypto(#[from] crate::crypto::CryptoError),

    #[error("invalid email or password")]
    InvalidCredentials,

    #[error("email address is already registered")]
    AlreadyExists,

    #[error("account is already activated")]
    AlreadyActive,

    #[error("account is locked")]
    AccountLocked { until: Option<DateTime<Utc>> },

    #[error("account is not activated")]
    NotActivated,

    #[error("{resource} not found")]
    NotFound { resource: &'static str },

    #[error("too many requests")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("invalid 'Authorization' header")]
    Unauthorized,
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    r#type: Option<String>,
    title: String,
    status: u16,
    detail: String,
    instance: Option<String>,
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `title` field.
    pub fn title(mut self, title: &str) -> Self {
        self.title = title.into();
        self
    }

    /// Add detailed error.
    pub fn details(mut self, description: &str) -> Self {
        self.detail = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        self.errors = Some(parse_validation_errors(errors));
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(
        self,
    ) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            r#type: None,
            title: "Internal server error.".to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            detail: String::default(),
            instance: None,
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect()
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default()
            .title("There were errors with your request.")
            .details(&self.to_string())
            .status(StatusCode::BAD_REQUEST);

        let mut retry_after = None;
        let response = match &self {
            ServerError::Validation(validation_errors) => response
                .title("There were validation errors with your request.")
                .errors(validation_errors),

            ServerError::Axum(err) => response
                .title("Server error during data parsing.")
                .details(&err.to_string()),

            ServerError::Store(err) => {
                tracing::error!(%err, "database failure");
                ResponseError::default()
            },

            ServerError::Token(TokenError::Creation(details)) => {
                tracing::error!(%details, "token creation failure");
                ResponseError::default()
            },

            ServerError::Token(_) => response
                .title("Token is expired or invalid.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::Mail(err) => {
                tracing::error!(%err, "mail delivery failure");
                response
                    .title("Could not deliver the account email.")
                    .status(StatusCode::BAD_GATEWAY)
            },

            ServerError::Crypto(err) => {
                tracing::error!(%err, "password hashing failure");
                ResponseError::default()
            },

            ServerError::InvalidCredentials => response
                .title("Invalid email or password.")
                .status(StatusCode::UNAUTHORIZED),

            ServerError::AlreadyExists => response
                .title("Email address already in use.")
                .status(StatusCode::CONFLICT),

            ServerError::AlreadyActive => response
                .title("Account is already activated.")
                .status(StatusCode::CONFLICT),

            ServerError::AccountLocked { until } => {
                let detail = match until {
                    Some(until) => format!(
                        "Account is locked until {}.",
                        until.to_rfc3339()
                    ),
                    None => "Account is locked.".to_owned(),
                };
                response
                    .title("Account temporarily locked.")
                    .details(&detail)
                    .status(StatusCode::FORBIDDEN)
            },

            ServerError::NotActivated => response
                .title("Account is not activated.")
                .status(StatusCode::FORBIDDEN),

            ServerError::NotFound { .. } => response
                .title("Resource not found.")
                .status(StatusCode::NOT_FOUND),

            ServerError::RateLimited { retry_after_secs } => {
                retry_after = *retry_after_secs;
                response
                    .title("Too many requests.")
                    .status(StatusCode::TOO_MANY_REQUESTS)
            },

            ServerError::Unauthorized => response
                .title("Missing or invalid 'Authorization' header.")
                .status(StatusCode::UNAUTHORIZED),
        };

        let mut response = response
            .into_response()
            .unwrap_or_else(|_| internal_server_error());

        if let Some(secs) = retry_after
            && let Ok(value) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, value);
        }

        response
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "type": null,
                "title": "Internal server error.",
                "status": StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
                "detail": null,
                "instance": null,
                "errors": null,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new("Internal server error".into()))
}

#[cfg(test)]
mod tests {
    use http_body_util::BodyExt;

    use super::*;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_invalid_credentials_response() {
        let response = ServerError::InvalidCredentials.into_response();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let body = body_json(response).await;
        assert_eq!(body["title"], "Invalid email or password.");
        assert_eq!(body["status"], 401);
    }

    #[tokio::test]
    async fn test_rate_limited_sets_retry_after() {
        let response = ServerError::RateLimited {
            retry_after_secs: Some(120),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "120"
        );
    }

    #[tokio::test]
    async fn test_store_failure_hides_details() {
        let response =
            ServerError::Store(StoreError::Timeout).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["title"], "Internal server error.");
        assert_eq!(body["detail"], "");
    }

    #[tokio::test]
    async fn test_locked_account_names_unlock_time() {
        let until = Utc::now();
        let response =
            ServerError::AccountLocked { until: Some(until) }.into_response();
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = body_json(response).await;
        assert!(
            body["detail"]
                .as_str()
                .unwrap()
                .contains(&until.to_rfc3339())
        );
    }
}
