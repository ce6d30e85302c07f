//! Database module for Tracklight.
//!
//! Provides SQLite metadata storage with automatic migrations.

mod models;
mod store;

pub use models::*;
pub use store::*;
