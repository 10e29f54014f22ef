//! Durable state persistence
//!
//! Handles:
//! - One JSON document per concern (nonce state, gas state)
//! - Crash-safe writes via temp file + atomic rename
//! - Cold start on missing or corrupt documents

mod store;

pub use store::StateStore;
