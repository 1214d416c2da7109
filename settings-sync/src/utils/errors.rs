//! Custom error types for settings sync.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Malformed backup: {0}")]
    MalformedEnvelope(String),

    #[error("Backup payload is empty or not a settings record")]
    EmptyPayload,

    #[error("Restore incomplete: {failed} of {total} settings could not be written ({keys})")]
    PartialWriteFailure {
        failed: usize,
        total: usize,
        keys: String,
    },

    #[error("Another transfer is already in progress")]
    Busy,

    #[error("Invalid backup name: {0:?}")]
    InvalidName(String),

    #[error("Cannot {action} while update is {state}")]
    InvalidTransition { action: &'static str, state: String },
}

impl SyncError {
    /// True for failures of the transport or the store's HTTP surface.
    pub fn is_network(&self) -> bool {
        matches!(self, SyncError::Network(_) | SyncError::Http(_))
    }
}

impl From<toml::de::Error> for SyncError {
    fn from(e: toml::de::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
