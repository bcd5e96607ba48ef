use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
};
use serde::Deserialize;
use uuid::Uuid;

use parley_types::Message;
use parley_types::api::{Claims, SendMessageRequest};

use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    pub limit: Option<u32>,
    /// Id of the oldest message on the previous page.
    pub before: Option<Uuid>,
}

pub async fn get_messages(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Query(query): Query<MessageQuery>,
) -> ApiResult<Json<Vec<Message>>> {
    let messages = state
        .gateway
        .chat()
        .messages(conversation_id, claims.sub, query.limit, query.before)
        .await?;
    Ok(Json(messages))
}

/// Same pipeline as the socket `message:send` event: the room sees the
/// message and the assistant may answer.
pub async fn send_message(
    State(state): State<AppState>,
    Path(conversation_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<SendMessageRequest>,
) -> ApiResult<(StatusCode, Json<Message>)> {
    let message = state
        .gateway
        .send_message(claims.sub, conversation_id, &req.content, req.kind, req.metadata)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

pub async fn recall(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<Json<Message>> {
    let message = state.gateway.chat().recall(message_id, claims.sub).await?;
    state.gateway.announce_recall(&message).await;
    Ok(Json(message))
}

pub async fn delete_for_me(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> ApiResult<StatusCode> {
    state.gateway.chat().delete_for_me(message_id, claims.sub).await?;
    Ok(StatusCode::NO_CONTENT)
}
