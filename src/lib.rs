//! Portcullis is a lightweight credential and session API: JWT
//! access/refresh pairs, single-use activation and password-reset tokens,
//! login lockout and per-address rate limiting.

#![forbid(unsafe_code)]

pub mod auth;
pub mod config;
pub mod crypto;
pub mod error;
pub mod limiter;
pub mod mail;
pub mod middleware;
pub mod router;
pub mod store;
pub mod token;
pub mod user;

use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{Method, header};
use axum::routing::post;
use axum::{Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{Any, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use crate::mail::Mailer;
use crate::store::CredentialStore;

pub const TOKEN_TYPE: &str = "Bearer";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState<S = store::PgStore, M = mail::MailManager> {
    pub config: Arc<config::Configuration>,
    pub auth: auth::AuthService<S, M>,
    pub tokens: token::TokenService<S>,
    pub limiter: limiter::RateLimiter<S>,
}

/// Create router.
pub fn app<S: CredentialStore, M: Mailer>(state: AppState<S, M>) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        // Set a timeout.
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        // Add CORS preflight support.
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::POST, Method::OPTIONS])
                .allow_headers(Any)
                .vary([header::AUTHORIZATION]),
        );

    Router::new()
        // `POST /create` goes to account registration.
        .route("/create", post(router::create::handler::<S, M>))
        // `POST /login` goes to password login.
        .route("/login", post(router::login::handler::<S, M>))
        // `POST /oauth/token` exchanges a refresh token.
        .route("/oauth/token", post(router::token::handler::<S, M>))
        // `POST /logout` revokes the bearer's sessions.
        .route("/logout", post(router::token::logout::<S, M>))
        .route("/activate", post(router::activate::handler::<S, M>))
        .route("/activate/resend", post(router::activate::resend::<S, M>))
        .route("/password/forgot", post(router::password::forgot::<S, M>))
        .route("/password/reset", post(router::password::reset::<S, M>))
        // Every endpoint is rate limited per (endpoint, IP).
        .route_layer(AxumMiddleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::<S, M>,
        ))
        .with_state(state)
        .layer(middleware)
}

/// Wire services together over an already-connected store.
pub fn build_state<S: CredentialStore, M: Mailer>(
    config: Arc<config::Configuration>,
    store: S,
    mail: M,
    access_secret: &str,
    refresh_secret: &str,
) -> Result<AppState<S, M>, crypto::CryptoError> {
    let jwt = token::JwtSigner::new(
        access_secret,
        refresh_secret,
        chrono::Duration::minutes(config.tokens.access_ttl_minutes),
        chrono::Duration::days(config.tokens.refresh_ttl_days),
    );
    let ttl = token::OpaqueTtl {
        activation: chrono::Duration::hours(config.tokens.activation_ttl_hours),
        reset: chrono::Duration::minutes(config.tokens.reset_ttl_minutes),
    };
    let tokens = token::TokenService::new(store.clone(), jwt, ttl);

    let pwd = Arc::new(crypto::PasswordManager::new(config.argon2.clone())?);
    let policy = auth::LockoutPolicy {
        max_attempts: config.login.max_attempts,
        unlock: chrono::Duration::minutes(config.login.unlock_minutes),
    };
    let auth = auth::AuthService::new(
        store.clone(),
        tokens.clone(),
        mail,
        pwd,
        policy,
    );

    let limiter = limiter::RateLimiter::new(
        store,
        limiter::RateLimitConfig {
            max_requests: config.limits.max_requests,
            window: Duration::from_secs(config.limits.window_seconds),
            block: chrono::Duration::minutes(config.limits.block_minutes),
        },
    );

    Ok(AppState {
        config,
        auth,
        tokens,
        limiter,
    })
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>>
{
    // read configuration file, let it in memory.
    let config = config::Configuration::default().read()?;

    let store = match config.postgres {
        Some(ref cfg) => store::PgStore::connect(cfg).await?,
        None => {
            tracing::error!("missing `postgres` entry on `config.yaml` file");
            std::process::exit(0);
        },
    };

    // execute migrations scripts on start.
    sqlx::migrate!().run(store.pool()).await?;

    // Signing secrets stay out of the configuration file.
    let access_secret = std::env::var("ACCESS_TOKEN_SECRET")
        .expect("missing `ACCESS_TOKEN_SECRET` environment variable");
    let refresh_secret = std::env::var("REFRESH_TOKEN_SECRET")
        .expect("missing `REFRESH_TOKEN_SECRET` environment variable");

    // handle mail sender.
    let mail = if let Some(cfg) = &config.mail {
        mail::MailManager::new(cfg).await?
    } else {
        mail::MailManager::default()
    };

    Ok(build_state(
        config,
        store,
        mail,
        &access_secret,
        &refresh_secret,
    )?)
}
