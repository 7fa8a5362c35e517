//! WebSocket handler for Axum
//!
//! Authenticates the upgrade request, then hands the socket to a
//! [`ClientSession`].

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use crate::auth::{bearer_token, AuthError};
use crate::error::ApiError;
use crate::state::AppState;

use super::{
    connection::split_socket,
    session::{ClientSession, MAX_FRAME_BYTES},
};

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket.
/// The token comes from `?token=` (browsers cannot set headers on an upgrade)
/// or an `Authorization: Bearer` header.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
    headers: HeaderMap,
) -> Response {
    let token = params
        .token
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .or_else(|| bearer_token(&headers));

    let Some(token) = token else {
        tracing::warn!("WebSocket auth failed: no token");
        return ApiError::from(AuthError::MissingToken).into_response();
    };

    let identity = match state.identity.authenticate(token) {
        Ok(identity) => identity,
        Err(e) => {
            tracing::warn!(error = %e, "WebSocket auth failed: invalid token");
            return ApiError::from(e).into_response();
        }
    };

    tracing::info!(user_id = %identity.user_id, "WebSocket connection upgrade requested");

    let session = ClientSession::new(
        identity,
        state.chat.clone(),
        state.config.session_queue_capacity,
    );

    ws.max_message_size(MAX_FRAME_BYTES)
        .max_frame_size(MAX_FRAME_BYTES)
        .on_upgrade(move |socket| async move {
            let (source, sink) = split_socket(socket);
            session.run(source, sink).await;
        })
}
