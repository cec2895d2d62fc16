//! Database module for pingboard.
//!
//! Stores the target catalogue in SQLite.

mod models;
mod store;

pub use models::*;
pub use store::*;
