//! Messages exchanged with the host updater.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One downloadable artifact of an update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateFile {
    pub url: String,
    #[serde(default)]
    pub size: u64,
    #[serde(rename = "sha512", default)]
    pub checksum: String,
}

/// Update found by the host updater
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateDescriptor {
    pub version: String,
    #[serde(default)]
    pub files: Vec<UpdateFile>,
}

impl UpdateDescriptor {
    /// Size of the primary artifact, 0 when unknown
    pub fn download_size(&self) -> u64 {
        self.files.first().map(|f| f.size).unwrap_or(0)
    }
}

/// Download progress as reported by the updater
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadProgress {
    pub percent: f64,
    pub bytes_per_second: u64,
    pub total: u64,
    pub transferred: u64,
}

/// Download statistics shown while an update is downloading
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadStats {
    pub percent: f64,
    pub bytes_per_second: u64,
    pub total_bytes: u64,
    pub transferred_bytes: u64,
}

impl From<DownloadProgress> for DownloadStats {
    fn from(progress: DownloadProgress) -> Self {
        Self {
            percent: progress.percent,
            bytes_per_second: progress.bytes_per_second,
            total_bytes: progress.total,
            transferred_bytes: progress.transferred,
        }
    }
}

/// Lifecycle signals emitted by the host updater
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum UpdaterSignal {
    #[serde(rename = "autoUpdater/update-available")]
    UpdateAvailable(UpdateDescriptor),

    #[serde(rename = "autoUpdater/download-progress")]
    DownloadProgress(DownloadProgress),

    #[serde(rename = "autoUpdater/update-downloaded")]
    UpdateDownloaded,
}

/// Decisions taken by the user on a prompt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum UserAction {
    ConfirmDownload,
    Defer,
    Install,
}

/// Anything the controller reacts to
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UpdateInput {
    Signal(UpdaterSignal),
    Action(UserAction),
}

/// Commands sent back to the host updater
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdaterCommand {
    #[serde(rename = "autoUpdater/downloadUpdate")]
    RequestDownload,

    #[serde(rename = "autoUpdater/quitAndInstall")]
    RequestInstall,
}

/// Where the update lifecycle currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Available,
    Downloading,
    Ready,
    Installing,
}

impl fmt::Display for UpdatePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            UpdatePhase::Idle => "idle",
            UpdatePhase::Available => "available",
            UpdatePhase::Downloading => "downloading",
            UpdatePhase::Ready => "ready",
            UpdatePhase::Installing => "installing",
        };
        f.write_str(name)
    }
}

/// Observable lifecycle state
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateState {
    pub phase: UpdatePhase,
    pub descriptor: Option<UpdateDescriptor>,
    pub download_stats: DownloadStats,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_signal_deserialization() {
        let json = r#"{"type":"autoUpdater/update-available","payload":{"version":"2.1.0",
            "files":[{"url":"app-2.1.0.exe","size":73400320,"sha512":"abc"}]}}"#;
        let signal: UpdaterSignal = serde_json::from_str(json).unwrap();
        match signal {
            UpdaterSignal::UpdateAvailable(descriptor) => {
                assert_eq!(descriptor.version, "2.1.0");
                assert_eq!(descriptor.download_size(), 73_400_320);
                assert_eq!(descriptor.files[0].checksum, "abc");
            }
            other => panic!("Wrong signal: {:?}", other),
        }

        let signal: UpdaterSignal =
            serde_json::from_str(r#"{"type":"autoUpdater/update-downloaded"}"#).unwrap();
        assert_eq!(signal, UpdaterSignal::UpdateDownloaded);
    }

    #[test]
    fn test_progress_maps_to_stats() {
        let json = r#"{"type":"autoUpdater/download-progress","payload":
            {"percent":42.5,"bytesPerSecond":2048,"total":1000,"transferred":425}}"#;
        let UpdaterSignal::DownloadProgress(progress) = serde_json::from_str(json).unwrap() else {
            panic!("Wrong signal");
        };
        let stats = DownloadStats::from(progress);
        assert_eq!(stats.percent, 42.5);
        assert_eq!(stats.bytes_per_second, 2048);
        assert_eq!(stats.total_bytes, 1000);
        assert_eq!(stats.transferred_bytes, 425);
    }

    #[test]
    fn test_input_accepts_signals_and_actions() {
        let input: UpdateInput = serde_json::from_str(r#"{"action":"confirm-download"}"#).unwrap();
        assert_eq!(input, UpdateInput::Action(UserAction::ConfirmDownload));

        let input: UpdateInput =
            serde_json::from_str(r#"{"type":"autoUpdater/update-downloaded"}"#).unwrap();
        assert_eq!(input, UpdateInput::Signal(UpdaterSignal::UpdateDownloaded));
    }

    #[test]
    fn test_command_serialization() {
        assert_eq!(
            serde_json::to_string(&UpdaterCommand::RequestInstall).unwrap(),
            r#"{"type":"autoUpdater/quitAndInstall"}"#
        );
    }

    #[test]
    fn test_descriptor_without_files() {
        let descriptor: UpdateDescriptor = serde_json::from_str(r#"{"version":"1.0.1"}"#).unwrap();
        assert_eq!(descriptor.download_size(), 0);
    }
}
