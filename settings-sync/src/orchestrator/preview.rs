//! Restore preview shown before a backup is written back.

use crate::backup::BackupEnvelope;
use crate::store::SettingsMap;
use chrono::{DateTime, Local, TimeZone, Utc};

/// Decoded backup waiting for the user to confirm or cancel.
///
/// Committing or cancelling consumes the preview, so it cannot outlive the
/// decision.
#[derive(Debug, Clone, PartialEq)]
pub struct RestorePreview {
    pub source_name: String,
    pub captured_at_ms: i64,
    pub entries: SettingsMap,
}

impl RestorePreview {
    pub fn new(source_name: impl Into<String>, envelope: BackupEnvelope) -> Self {
        Self {
            source_name: source_name.into(),
            captured_at_ms: envelope.captured_at_ms,
            entries: envelope.payload,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn captured_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.captured_at_ms).single()
    }

    /// Capture time in local time, `-` when out of range
    pub fn captured_at_local(&self) -> String {
        self.captured_at()
            .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string())
    }

    /// Entries as indented JSON
    pub fn pretty_entries(&self) -> String {
        serde_json::to_string_pretty(&self.entries).unwrap_or_default()
    }
}
