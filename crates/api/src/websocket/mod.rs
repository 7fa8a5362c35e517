//! Real-time conversation delivery over WebSockets
//!
//! # Architecture
//!
//! - **Connection**: read/write adapter over a socket, with deadlines
//! - **Room**: membership tables and non-blocking fan-out
//! - **Hub**: single task owning the room tables, fed by bounded mailboxes
//! - **Session**: per-connection read and write loops
//! - **Handler**: Axum upgrade route
//! - **Events**: wire frames for client/server communication

pub mod connection;
pub mod events;
pub mod handler;
pub mod hub;
pub mod room;
pub mod session;

pub use handler::ws_handler;
pub use hub::{Hub, HubError};
pub use session::ClientSession;
