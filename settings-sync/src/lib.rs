//! Settings Sync Library
//!
//! Cloud backup and restore of application settings against an object
//! store, plus the self-update lifecycle controller.

pub mod backup;
pub mod config;
pub mod events;
pub mod orchestrator;
pub mod store;
pub mod transfer;
pub mod update;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{Result, SyncError};
