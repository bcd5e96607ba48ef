use std::convert::Infallible;
use std::net::SocketAddr;

use axum::extract::{ConnectInfo, FromRequestParts, Request, State};
use axum::http::request::Parts;
use axum::http::{HeaderMap, header};
use axum::middleware::Next;
use axum::response::Response;

use parley_core::Error;
use parley_core::tokens::ClientInfo;
use parley_types::Role;
use parley_types::api::Claims;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Verify the bearer access credential and stash its claims for handlers.
pub async fn require_auth(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> ApiResult<Response> {
    let token = bearer_token(req.headers()).ok_or_else(Error::reauthenticate)?;
    let claims = state.tokens.verify_access(token)?;
    req.extensions_mut().insert(claims);
    Ok(next.run(req).await)
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn require_admin(claims: &Claims) -> ApiResult<()> {
    if claims.role == Role::Admin {
        Ok(())
    } else {
        Err(ApiError(Error::Forbidden("administrator role required".into())))
    }
}

/// Caller provenance for session rows: first `X-Forwarded-For` hop, else the
/// peer address, plus the `User-Agent` header.
pub struct ClientMeta(pub ClientInfo);

impl<S: Send + Sync> FromRequestParts<S> for ClientMeta {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let forwarded = parts
            .headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty());
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| addr.ip().to_string());
        let user_agent = parts
            .headers
            .get(header::USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Ok(Self(ClientInfo {
            ip_address: forwarded.or(peer),
            user_agent,
        }))
    }
}
