//! Database module.
//!
//! SQLite storage for device configurations and per-device presence state.

mod models;
mod store;

pub use models::*;
pub use store::*;
