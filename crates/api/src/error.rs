//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use supportdesk_shared::StoreError;

use crate::auth::AuthError;
use crate::chat::ChatError;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("Authentication required")]
    Unauthorized,
    #[error("Insufficient permissions")]
    Forbidden,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Resource not found")]
    NotFound,
    #[error("Resource already exists")]
    Conflict(String),

    // Internal errors
    #[error("Database error: {0}")]
    Database(String),
    #[error("Internal server error")]
    Internal,
    #[error("Service unavailable: {0}")]
    ServiceUnavailable(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::NotFound => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, "CONFLICT", msg.clone()),

            // Internal
            ApiError::Database(_) => (StatusCode::INTERNAL_SERVER_ERROR, "DATABASE_ERROR", "Database error".to_string()),
            ApiError::Internal => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", self.to_string()),
            ApiError::ServiceUnavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, "SERVICE_UNAVAILABLE", msg.clone()),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => ApiError::NotFound,
            StoreError::Conflict(msg) => ApiError::Conflict(msg),
            StoreError::Unavailable(msg) => {
                tracing::error!(error = %msg, "Store unavailable");
                ApiError::ServiceUnavailable("Storage temporarily unavailable".to_string())
            }
            StoreError::InvalidData(msg) => {
                tracing::error!(error = %msg, "Invalid data in store");
                ApiError::Internal
            }
            StoreError::Database(db_err) => {
                tracing::error!("Database error: {:?}", db_err);
                ApiError::Database(db_err.to_string())
            }
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::ConversationNotFound => ApiError::NotFound,
            ChatError::Forbidden => ApiError::Forbidden,
            ChatError::NotSubscribed
            | ChatError::EmptyMessage
            | ChatError::MessageTooLong(_)
            | ChatError::InvalidConversationId => ApiError::Validation(err.to_string()),
            ChatError::NoAdminAvailable => ApiError::ServiceUnavailable(err.to_string()),
            ChatError::Store(store_err) => store_err.into(),
            ChatError::Hub(hub_err) => {
                tracing::error!(error = %hub_err, "Hub unreachable");
                ApiError::Internal
            }
            ChatError::PurgeDeadlineOutOfRange => {
                tracing::error!("Purge retention pushes the deadline out of range");
                ApiError::Internal
            }
        }
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::MissingToken => ApiError::Unauthorized,
            AuthError::InvalidToken | AuthError::Expired => ApiError::InvalidToken,
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (ApiError::from(ChatError::ConversationNotFound), StatusCode::NOT_FOUND),
            (ApiError::from(ChatError::Forbidden), StatusCode::FORBIDDEN),
            (ApiError::from(ChatError::EmptyMessage), StatusCode::BAD_REQUEST),
            (ApiError::from(ChatError::NoAdminAvailable), StatusCode::SERVICE_UNAVAILABLE),
            (ApiError::from(AuthError::MissingToken), StatusCode::UNAUTHORIZED),
            (ApiError::from(StoreError::NotFound), StatusCode::NOT_FOUND),
        ];

        for (error, expected) in cases {
            assert_eq!(error.into_response().status(), expected);
        }
    }
}
