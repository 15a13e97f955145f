//! Database module for PingMeDaddy.
//!
//! SQLite storage for targets, raw samples, roll-ups, and events.

mod models;
mod store;

pub use models::*;
pub use store::*;
