//! Conversation routes
//!
//! REST access to the same lifecycle the WebSocket sessions drive: open a
//! conversation, list them, page through history, close and reopen.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use supportdesk_shared::{ConversationId, MessageId};

use crate::{
    auth::AuthUser,
    chat::models::{AdminConversationState, Conversation, ConversationSummary, MessagePage},
    error::ApiResult,
    state::AppState,
};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<i64>,
    /// Id of the oldest message already seen; unparseable values are ignored
    pub cursor: Option<String>,
}

/// Create a conversation for the calling customer
pub async fn create_conversation(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<(StatusCode, Json<Conversation>)> {
    let conversation = state.chat.create_customer_conversation(&identity).await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

/// Conversations visible to the caller; admins also get each customer's profile
pub async fn list_conversations(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<Json<Vec<ConversationSummary>>> {
    Ok(Json(state.chat.list_conversations(&identity).await?))
}

/// Unread counters for the calling admin
pub async fn list_states(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
) -> ApiResult<Json<Vec<AdminConversationState>>> {
    Ok(Json(state.chat.list_admin_states(&identity).await?))
}

pub async fn get_messages(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<ConversationId>,
    Query(query): Query<HistoryQuery>,
) -> ApiResult<Json<MessagePage>> {
    let cursor = query
        .cursor
        .as_deref()
        .and_then(|raw| raw.trim().parse::<MessageId>().ok());

    let page = state
        .chat
        .get_message_history(conversation_id, query.limit, cursor, &identity)
        .await?;
    Ok(Json(page))
}

pub async fn close_conversation(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> ApiResult<Json<Conversation>> {
    Ok(Json(
        state
            .chat
            .close_conversation(conversation_id, &identity)
            .await?,
    ))
}

pub async fn reopen_conversation(
    State(state): State<AppState>,
    AuthUser(identity): AuthUser,
    Path(conversation_id): Path<ConversationId>,
) -> ApiResult<Json<Conversation>> {
    state
        .chat
        .authorized_conversation(conversation_id, &identity)
        .await?;
    Ok(Json(state.chat.reopen_conversation(conversation_id).await?))
}
