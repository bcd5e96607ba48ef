use axum::{
    Extension, Json,
    extract::{Path, State},
};
use tracing::info;

use parley_types::Capability;
use parley_types::api::{Claims, SetCapabilityRequest};

use crate::error::ApiResult;
use crate::middleware::require_admin;
use crate::state::AppState;

/// Every capability with its effective state, for client feature toggles.
pub async fn list(State(state): State<AppState>) -> ApiResult<Json<Vec<Capability>>> {
    Ok(Json(state.gateway.chat().gate().all()))
}

pub async fn admin_list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<Capability>>> {
    require_admin(&claims)?;
    Ok(Json(state.gateway.chat().gate().optional()))
}

pub async fn admin_set(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SetCapabilityRequest>,
) -> ApiResult<Json<Capability>> {
    require_admin(&claims)?;
    let capability = state.gateway.chat().gate().set(&key, req.enabled).await?;
    info!("{} set {} = {}", claims.username, key, req.enabled);
    Ok(Json(capability))
}
