//! User-facing events.
//!
//! The orchestrator and the update controller never talk to the front end
//! directly; they publish notifications and prompts here and whoever renders
//! them subscribes.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

/// Maximum number of queued events per subscriber
const BROADCAST_CAPACITY: usize = 256;

/// Severity of a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Events published for the front end
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    /// Passive notification (toast)
    #[serde(rename = "notice")]
    Notice { level: NoticeLevel, message: String },

    /// Visible backup list was replaced
    #[serde(rename = "backups:refreshed")]
    BackupsRefreshed { count: usize },

    /// An update was found and the user has to decide whether to download it
    #[serde(rename = "update:prompt-download")]
    DownloadPrompt { version: String, size: String },

    /// A manually downloaded update is ready to install
    #[serde(rename = "update:prompt-install")]
    InstallPrompt { version: String },
}

impl Event {
    pub fn info(message: impl Into<String>) -> Self {
        Event::Notice {
            level: NoticeLevel::Info,
            message: message.into(),
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Event::Notice {
            level: NoticeLevel::Success,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Event::Notice {
            level: NoticeLevel::Error,
            message: message.into(),
        }
    }
}

/// Broadcast hub shared by the components that publish events
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(BROADCAST_CAPACITY);
        Self { tx }
    }

    /// Publish an event; having no subscriber is not an error
    pub fn publish(&self, event: Event) {
        match self.tx.send(event) {
            Ok(count) => debug!("Published event to {} subscriber(s)", count),
            Err(broadcast::error::SendError(event)) => {
                debug!("No subscribers for event: {:?}", event)
            }
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
