//! Supportdesk Shared Types and Utilities
//!
//! Identifier types, persistence errors, and database helpers shared by the
//! supportdesk crates.

pub mod db;
pub mod error;
pub mod types;

pub use db::*;
pub use error::*;
pub use types::*;
