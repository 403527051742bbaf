//! Middlewares for routes.

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{
    ConnectInfo, FromRequestParts, MatchedPath, Request, State,
};
use axum::http::HeaderMap;
use axum::http::request::Parts;
use axum::middleware::Next;
use axum::response::Response;

use crate::AppState;
use crate::error::Result;
use crate::mail::Mailer;
use crate::store::CredentialStore;

const FORWARDED_FOR: &str = "x-forwarded-for";
const FALLBACK_IP: &str = "127.0.0.1";

/// Best-effort client address: first `X-Forwarded-For` entry, then the
/// peer address.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    headers
        .get(FORWARDED_FOR)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| FALLBACK_IP.to_owned())
}

/// Extractor form of [`client_ip`] for handlers that record addresses.
pub struct ClientIp(pub String);

impl<S: Send + Sync> FromRequestParts<S> for ClientIp {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        _state: &S,
    ) -> std::result::Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(ClientIp(client_ip(&parts.headers, peer)))
    }
}

/// Middleware counting every request against its (endpoint, IP) window.
pub async fn rate_limit<S: CredentialStore, M: Mailer>(
    State(state): State<AppState<S, M>>,
    req: Request,
    next: Next,
) -> Result<Response> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let ip = client_ip(req.headers(), peer);

    // Routes sharing a pattern share a window, path parameters do not
    // split it.
    let endpoint = req
        .extensions()
        .get::<MatchedPath>()
        .map(|path| path.as_str().to_owned())
        .unwrap_or_else(|| req.uri().path().to_owned());

    state.limiter.check(&endpoint, &ip).await?;

    Ok(next.run(req).await)
}
