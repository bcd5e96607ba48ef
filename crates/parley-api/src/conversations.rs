use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use parley_types::api::{
    Claims, CreateGroupRequest, CreatePrivateRequest, SuggestionResponse, ToggleBotRequest,
    ToggleBotResponse,
};
use parley_types::{Conversation, ConversationSummary};

use crate::error::ApiResult;
use crate::state::AppState;

pub async fn list(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    let summaries = state.gateway.chat().list_conversations(claims.sub).await?;
    Ok(Json(summaries))
}

/// 201 when the pair had no conversation yet, 200 when an existing one is returned.
pub async fn open_private(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePrivateRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let (conversation, created) = state
        .gateway
        .chat()
        .open_private(claims.sub, req.target_user_id)
        .await?;

    if created {
        state
            .gateway
            .announce_conversation(&conversation, &[claims.sub, req.target_user_id])
            .await;
        Ok((StatusCode::CREATED, Json(conversation)))
    } else {
        Ok((StatusCode::OK, Json(conversation)))
    }
}

pub async fn create_group(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupRequest>,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let (conversation, members) = state
        .gateway
        .chat()
        .create_group(claims.sub, req.title, req.member_ids)
        .await?;
    info!(
        "{} created group {} with {} members",
        claims.username,
        conversation.id,
        members.len()
    );
    state.gateway.announce_conversation(&conversation, &members).await;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn leave(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let outcome = state.gateway.chat().leave_group(conversation_id, claims.sub).await?;
    state
        .gateway
        .member_left(conversation_id, claims.sub, &outcome)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn delete(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    let former = state.gateway.chat().delete_group(conversation_id, claims.sub).await?;
    info!(
        "Group {} deleted by {} ({} members removed)",
        conversation_id,
        claims.username,
        former.len()
    );
    state.gateway.group_deleted(conversation_id).await;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn toggle_bot(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<ToggleBotRequest>,
) -> ApiResult<Json<ToggleBotResponse>> {
    let conversation = state
        .gateway
        .chat()
        .toggle_bot(conversation_id, claims.sub, req.active)
        .await?;
    Ok(Json(ToggleBotResponse {
        is_bot_active: conversation.is_bot_active,
    }))
}

pub async fn suggestion(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<SuggestionResponse>> {
    let suggestion = state
        .gateway
        .chat()
        .suggest_reply(conversation_id, claims.sub)
        .await?;
    Ok(Json(SuggestionResponse { suggestion }))
}

pub async fn mark_read(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<impl IntoResponse> {
    state.gateway.chat().mark_read(conversation_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}
