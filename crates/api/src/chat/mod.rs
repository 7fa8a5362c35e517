//! Conversations, messages and their lifecycle
//!
//! [`ChatStore`] is the persistence seam with a Postgres and an in-memory
//! implementation. [`ChatService`] layers assignment, close/reopen, history
//! and the session-facing flows on top, and pushes live updates through the
//! websocket hub.

pub mod memory;
pub mod models;
pub mod postgres;
pub mod purge;
pub mod service;
pub mod store;

pub use memory::MemoryChatStore;
pub use postgres::PgChatStore;
pub use purge::spawn_purge_sweeper;
pub use service::{ChatError, ChatResult, ChatService};
pub use store::ChatStore;
