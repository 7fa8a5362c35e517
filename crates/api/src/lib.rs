//! Supportdesk API Library
//!
//! Real-time customer support conversations: the WebSocket hub, the
//! conversation lifecycle service and the REST surface around them.

pub mod auth;
pub mod chat;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;
pub mod websocket;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
