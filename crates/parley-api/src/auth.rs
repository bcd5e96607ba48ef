use axum::{Extension, Json, extract::State, http::StatusCode, response::IntoResponse};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use tracing::{info, warn};

use parley_core::Error;
use parley_types::User;
use parley_types::api::{
    Claims, LoginRequest, LoginResponse, RefreshResponse, RegisterRequest, SessionInfo,
};

use crate::error::ApiResult;
use crate::middleware::ClientMeta;
use crate::state::{AppState, AppStateInner};

pub const REFRESH_COOKIE: &str = "refresh_token";

fn refresh_cookie(state: &AppStateInner, secret: String) -> Cookie<'static> {
    let max_age = time::Duration::seconds(state.tokens.refresh_ttl().num_seconds());
    Cookie::build((REFRESH_COOKIE, secret))
        .http_only(true)
        .same_site(SameSite::Strict)
        .path("/")
        .max_age(max_age)
        .secure(state.secure_cookies)
        .build()
}

fn cleared_cookie() -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, "")).path("/").build()
}

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> ApiResult<impl IntoResponse> {
    let user = state.accounts.register(req).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

pub async fn login(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> ApiResult<(CookieJar, Json<LoginResponse>)> {
    let issued = state.accounts.login(req, client).await?;
    let jar = jar.add(refresh_cookie(&state, issued.refresh_token));
    Ok((
        jar,
        Json(LoginResponse {
            access_token: issued.access_token,
            user: issued.user,
        }),
    ))
}

/// Rotate the refresh cookie. The presented secret is dead afterwards
/// whether or not the caller receives the response.
pub async fn refresh(
    State(state): State<AppState>,
    ClientMeta(client): ClientMeta,
    jar: CookieJar,
) -> ApiResult<(CookieJar, Json<RefreshResponse>)> {
    let secret = jar
        .get(REFRESH_COOKIE)
        .map(|c| c.value().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(Error::reauthenticate)?;

    let issued = state.tokens.rotate(&secret, client).await?;
    let jar = jar.add(refresh_cookie(&state, issued.refresh_token));
    Ok((
        jar,
        Json(RefreshResponse {
            access_token: issued.access_token,
        }),
    ))
}

/// Always succeeds and always clears the cookie.
pub async fn logout(State(state): State<AppState>, jar: CookieJar) -> impl IntoResponse {
    if let Some(secret) = jar.get(REFRESH_COOKIE).map(|c| c.value().to_string()) {
        if let Err(e) = state.tokens.revoke(&secret).await {
            warn!("Logout could not revoke refresh credential: {}", e);
        } else {
            info!("Session logged out");
        }
    }
    (jar.remove(cleared_cookie()), StatusCode::NO_CONTENT)
}

pub async fn me(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<User>> {
    Ok(Json(state.accounts.profile(claims.sub).await?))
}

pub async fn sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<SessionInfo>>> {
    Ok(Json(state.tokens.sessions(claims.sub).await?))
}
