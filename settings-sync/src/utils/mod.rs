//! Utility modules for settings sync.

pub mod errors;
pub mod logger;

pub use errors::{Result, SyncError};
