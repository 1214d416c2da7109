//! Self-update lifecycle.
//!
//! The host updater does the actual work (checking, downloading, installing)
//! and reports back through lifecycle signals. This controller turns those
//! signals and the user's decisions into state transitions:
//!
//! ```text
//! Idle --available--> Available --auto / confirm--> Downloading --downloaded--> Ready --install--> Installing
//!                         |                                           |
//!                         +--defer--> Idle            (auto mode) ---+--> Idle
//! ```
//!
//! Whether downloads start unattended comes from the `upgrade.autoDownloadUpdate`
//! setting, read at construction and refreshed whenever the settings store
//! reports a change to it.

pub mod types;

use crate::events::{Event, EventBus};
use crate::store::{affects, ConfigStore, Subscription};
use crate::transfer::progress::format_size;
use crate::utils::errors::{Result, SyncError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

pub use types::{
    DownloadProgress, DownloadStats, UpdateDescriptor, UpdateFile, UpdateInput, UpdatePhase,
    UpdateState, UpdaterCommand, UpdaterSignal, UserAction,
};

/// Setting controlling unattended downloads
pub const AUTO_DOWNLOAD_KEY: &str = "upgrade.autoDownloadUpdate";

/// Current auto-download preference; anything but a boolean means `true`
fn read_auto_download(settings: &dyn ConfigStore) -> bool {
    settings
        .get(AUTO_DOWNLOAD_KEY)
        .and_then(|value| value.as_bool())
        .unwrap_or(true)
}

/// State machine for one running application session
pub struct UpdateController {
    auto_download: Arc<AtomicBool>,
    state: watch::Sender<UpdateState>,
    commands: mpsc::UnboundedSender<UpdaterCommand>,
    events: EventBus,
    _subscription: Subscription,
}

impl UpdateController {
    /// Read the preference and subscribe to its changes. The subscription
    /// is released when the controller is dropped.
    pub fn new(
        settings: Arc<dyn ConfigStore>,
        commands: mpsc::UnboundedSender<UpdaterCommand>,
        events: EventBus,
    ) -> Self {
        let auto_download = Arc::new(AtomicBool::new(read_auto_download(settings.as_ref())));
        info!(
            "Update controller started (auto download: {})",
            auto_download.load(Ordering::Acquire)
        );

        let flag = Arc::clone(&auto_download);
        let store = Arc::downgrade(&settings);
        let subscription = settings.subscribe(Arc::new(move |name: &str| {
            if !affects(name, AUTO_DOWNLOAD_KEY) {
                return;
            }
            if let Some(store) = store.upgrade() {
                let value = read_auto_download(store.as_ref());
                flag.store(value, Ordering::Release);
                debug!("Auto download preference is now {}", value);
            }
        }));

        let (state, _rx) = watch::channel(UpdateState::default());
        Self {
            auto_download,
            state,
            commands,
            events,
            _subscription: subscription,
        }
    }

    pub fn auto_download(&self) -> bool {
        self.auto_download.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> UpdatePhase {
        self.state.borrow().phase
    }

    /// Watch the lifecycle state
    pub fn state(&self) -> watch::Receiver<UpdateState> {
        self.state.subscribe()
    }

    /// React to a lifecycle signal from the host updater
    pub fn handle_signal(&self, signal: UpdaterSignal) {
        match signal {
            UpdaterSignal::UpdateAvailable(descriptor) => self.on_update_available(descriptor),
            UpdaterSignal::DownloadProgress(progress) => self.on_download_progress(progress),
            UpdaterSignal::UpdateDownloaded => self.on_update_downloaded(),
        }
    }

    /// Apply a user decision
    pub fn handle_action(&self, action: UserAction) -> Result<()> {
        match action {
            UserAction::ConfirmDownload => self.confirm_download(),
            UserAction::Defer => self.defer(),
            UserAction::Install => self.install(),
        }
    }

    fn on_update_available(&self, descriptor: UpdateDescriptor) {
        let previous = self.phase();
        if previous != UpdatePhase::Idle {
            warn!(
                "Update {} detected while {}; starting over",
                descriptor.version, previous
            );
        }
        info!("Update {} available", descriptor.version);

        let version = descriptor.version.clone();
        let size = format_size(descriptor.download_size());
        self.state.send_replace(UpdateState {
            phase: UpdatePhase::Available,
            descriptor: Some(descriptor),
            download_stats: DownloadStats::default(),
        });

        if self.auto_download() {
            self.events.publish(Event::info(format!(
                "New version {} found, downloading in the background",
                version
            )));
            self.start_download();
        } else {
            self.events
                .publish(Event::DownloadPrompt { version, size });
        }
    }

    fn on_download_progress(&self, progress: DownloadProgress) {
        let stats = DownloadStats::from(progress);
        self.state.send_if_modified(|state| match state.phase {
            UpdatePhase::Downloading => {
                state.download_stats = stats;
                true
            }
            UpdatePhase::Available => {
                debug!("Updater began downloading on its own");
                state.phase = UpdatePhase::Downloading;
                state.download_stats = stats;
                true
            }
            phase => {
                debug!("Ignoring download progress while {}", phase);
                false
            }
        });
    }

    fn on_update_downloaded(&self) {
        let phase = self.phase();
        if phase == UpdatePhase::Installing {
            debug!("Ignoring download completion while installing");
            return;
        }

        if self.auto_download() {
            info!("Update downloaded; it will be installed on a later restart");
            self.events
                .publish(Event::success("Update downloaded, restart to install"));
            self.state.send_replace(UpdateState::default());
            return;
        }

        let version = self
            .state
            .borrow()
            .descriptor
            .as_ref()
            .map(|d| d.version.clone())
            .unwrap_or_default();
        info!("Update {} downloaded, waiting for install confirmation", version);
        self.state.send_modify(|state| {
            state.phase = UpdatePhase::Ready;
            state.download_stats = DownloadStats::default();
        });
        self.events.publish(Event::InstallPrompt { version });
    }

    /// User accepted the download prompt
    pub fn confirm_download(&self) -> Result<()> {
        self.expect_phase(UpdatePhase::Available, "download the update")?;
        self.start_download();
        Ok(())
    }

    /// User postponed the decision. From `Available` this drops the update
    /// for this session; from `Ready` it only dismisses the install prompt.
    pub fn defer(&self) -> Result<()> {
        match self.phase() {
            UpdatePhase::Available => {
                info!("Update deferred");
                self.state.send_replace(UpdateState::default());
                Ok(())
            }
            UpdatePhase::Ready => {
                debug!("Install prompt dismissed");
                Ok(())
            }
            phase => Err(self.reject("defer the update", phase)),
        }
    }

    /// User asked to restart and install
    pub fn install(&self) -> Result<()> {
        self.expect_phase(UpdatePhase::Ready, "install the update")?;
        info!("Handing over to the updater for installation");
        self.state.send_modify(|state| state.phase = UpdatePhase::Installing);
        self.send(UpdaterCommand::RequestInstall);
        Ok(())
    }

    fn start_download(&self) {
        self.state.send_modify(|state| state.phase = UpdatePhase::Downloading);
        self.send(UpdaterCommand::RequestDownload);
    }

    fn expect_phase(&self, expected: UpdatePhase, action: &'static str) -> Result<()> {
        let phase = self.phase();
        if phase != expected {
            return Err(self.reject(action, phase));
        }
        Ok(())
    }

    fn reject(&self, action: &'static str, phase: UpdatePhase) -> SyncError {
        let error = SyncError::InvalidTransition {
            action,
            state: phase.to_string(),
        };
        warn!("{}", error);
        self.events.publish(Event::error(error.to_string()));
        error
    }

    fn send(&self, command: UpdaterCommand) {
        debug!("Sending updater command {:?}", command);
        if self.commands.send(command).is_err() {
            warn!("Updater command channel closed, dropped {:?}", command);
        }
    }

    /// Process inputs until the channel closes, then release the controller.
    pub async fn run(self, mut inputs: mpsc::Receiver<UpdateInput>) {
        while let Some(input) = inputs.recv().await {
            match input {
                UpdateInput::Signal(signal) => self.handle_signal(signal),
                UpdateInput::Action(action) => {
                    if let Err(e) = self.handle_action(action) {
                        debug!("Action {:?} rejected: {}", action, e);
                    }
                }
            }
        }
        info!("Update input closed in phase {}", self.phase());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NoticeLevel;
    use crate::store::FileConfigStore;
    use serde_json::{json, Value};
    use tokio::sync::mpsc::error::TryRecvError;

    fn store(value: Value) -> Arc<FileConfigStore> {
        let Value::Object(map) = value else {
            unreachable!()
        };
        Arc::new(FileConfigStore::in_memory(map))
    }

    fn controller(
        settings: Arc<FileConfigStore>,
    ) -> (UpdateController, mpsc::UnboundedReceiver<UpdaterCommand>, EventBus) {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = EventBus::new();
        (UpdateController::new(settings, tx, events.clone()), rx, events)
    }

    fn manual() -> Arc<FileConfigStore> {
        store(json!({"upgrade": {"autoDownloadUpdate": false}}))
    }

    fn available(version: &str) -> UpdaterSignal {
        UpdaterSignal::UpdateAvailable(UpdateDescriptor {
            version: version.to_string(),
            files: vec![UpdateFile {
                url: format!("app-{}.exe", version),
                size: 5 * 1024 * 1024,
                checksum: "sha".to_string(),
            }],
        })
    }

    fn progress(percent: f64) -> UpdaterSignal {
        UpdaterSignal::DownloadProgress(DownloadProgress {
            percent,
            bytes_per_second: 4096,
            total: 1000,
            transferred: (percent * 10.0) as u64,
        })
    }

    #[test]
    fn test_preference_defaults_to_true() {
        let (controller, _rx, _events) = controller(store(json!({})));
        assert!(controller.auto_download());

        let (controller, _rx, _events) =
            self::controller(store(json!({"upgrade": {"autoDownloadUpdate": "no"}})));
        assert!(controller.auto_download());

        let (controller, _rx, _events) = self::controller(store(json!({"upgrade": "off"})));
        assert!(controller.auto_download());
    }

    #[tokio::test]
    async fn test_manual_mode_prompts_without_downloading() {
        let (controller, mut rx, events) = controller(manual());
        let mut notices = events.subscribe();

        controller.handle_signal(available("2.0.0"));

        assert_eq!(controller.phase(), UpdatePhase::Available);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            notices.recv().await.unwrap(),
            Event::DownloadPrompt {
                version: "2.0.0".to_string(),
                size: "5.00 MB".to_string()
            }
        );
    }

    #[test]
    fn test_auto_mode_downloads_immediately() {
        let (controller, mut rx, _events) = controller(store(json!({})));

        controller.handle_signal(available("2.0.0"));

        assert_eq!(controller.phase(), UpdatePhase::Downloading);
        assert_eq!(rx.try_recv(), Ok(UpdaterCommand::RequestDownload));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_progress_replaces_stats_wholesale() {
        let (controller, _rx, _events) = controller(store(json!({})));
        controller.handle_signal(available("2.0.0"));

        controller.handle_signal(progress(10.0));
        controller.handle_signal(UpdaterSignal::DownloadProgress(DownloadProgress {
            percent: 55.5,
            bytes_per_second: 0,
            total: 2000,
            transferred: 1110,
        }));

        let stats = controller.state().borrow().download_stats;
        assert_eq!(
            stats,
            DownloadStats {
                percent: 55.5,
                bytes_per_second: 0,
                total_bytes: 2000,
                transferred_bytes: 1110,
            }
        );
    }

    #[test]
    fn test_progress_ignored_when_idle() {
        let (controller, _rx, _events) = controller(manual());
        controller.handle_signal(progress(50.0));
        assert_eq!(controller.state().borrow().clone(), UpdateState::default());
    }

    #[tokio::test]
    async fn test_auto_mode_completion_returns_to_idle() {
        let (controller, mut rx, events) = controller(store(json!({})));
        controller.handle_signal(available("2.0.0"));
        controller.handle_signal(progress(100.0));
        let mut notices = events.subscribe();

        controller.handle_signal(UpdaterSignal::UpdateDownloaded);

        assert_eq!(controller.phase(), UpdatePhase::Idle);
        assert_eq!(rx.try_recv(), Ok(UpdaterCommand::RequestDownload));
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
        assert_eq!(
            notices.recv().await.unwrap(),
            Event::success("Update downloaded, restart to install")
        );
    }

    #[test]
    fn test_manual_mode_waits_for_install() {
        let (controller, mut rx, _events) = controller(manual());
        controller.handle_signal(available("2.0.0"));
        controller.confirm_download().unwrap();
        assert_eq!(controller.phase(), UpdatePhase::Downloading);
        assert_eq!(rx.try_recv(), Ok(UpdaterCommand::RequestDownload));

        controller.handle_signal(UpdaterSignal::UpdateDownloaded);
        assert_eq!(controller.phase(), UpdatePhase::Ready);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));

        controller.defer().unwrap();
        assert_eq!(controller.phase(), UpdatePhase::Ready);

        controller.install().unwrap();
        assert_eq!(controller.phase(), UpdatePhase::Installing);
        assert_eq!(rx.try_recv(), Ok(UpdaterCommand::RequestInstall));
    }

    #[test]
    fn test_defer_drops_available_update() {
        let (controller, mut rx, _events) = controller(manual());
        controller.handle_signal(available("2.0.0"));

        controller.defer().unwrap();

        assert_eq!(controller.state().borrow().clone(), UpdateState::default());
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_invalid_actions_leave_state_alone() {
        let (controller, mut rx, events) = controller(manual());
        let mut notices = events.subscribe();

        assert!(matches!(
            controller.install(),
            Err(SyncError::InvalidTransition { .. })
        ));
        assert!(matches!(
            notices.try_recv(),
            Ok(Event::Notice {
                level: NoticeLevel::Error,
                ..
            })
        ));
        assert!(controller.confirm_download().is_err());
        assert!(controller.defer().is_err());
        assert_eq!(controller.phase(), UpdatePhase::Idle);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn test_new_update_mid_download_starts_over() {
        let (controller, _rx, _events) = controller(manual());
        controller.handle_signal(available("2.0.0"));
        controller.confirm_download().unwrap();
        controller.handle_signal(progress(40.0));

        controller.handle_signal(available("2.0.1"));

        let state = controller.state().borrow().clone();
        assert_eq!(state.phase, UpdatePhase::Available);
        assert_eq!(state.descriptor.unwrap().version, "2.0.1");
        assert_eq!(state.download_stats, DownloadStats::default());
    }

    #[test]
    fn test_latest_preference_wins() {
        let settings = manual();
        let (controller, mut rx, _events) = controller(settings.clone());
        assert!(!controller.auto_download());

        settings.set(AUTO_DOWNLOAD_KEY, json!(true)).unwrap();
        assert!(controller.auto_download());

        controller.handle_signal(available("2.0.0"));
        assert_eq!(rx.try_recv(), Ok(UpdaterCommand::RequestDownload));

        settings
            .set("upgrade", json!({"autoDownloadUpdate": false}))
            .unwrap();
        assert!(!controller.auto_download());

        controller.handle_signal(UpdaterSignal::UpdateDownloaded);
        assert_eq!(controller.phase(), UpdatePhase::Ready);
    }

    #[test]
    fn test_drop_unsubscribes_once() {
        let settings = store(json!({}));
        let (controller, _rx, _events) = controller(settings.clone());
        assert_eq!(settings.listener_count(), 1);

        drop(controller);
        assert_eq!(settings.listener_count(), 0);

        settings.set(AUTO_DOWNLOAD_KEY, json!(false)).unwrap();
    }

    #[tokio::test]
    async fn test_run_processes_inputs_in_order() {
        let settings = manual();
        let (controller, mut commands, _events) = controller(settings.clone());
        let state = controller.state();
        let (tx, rx) = mpsc::channel(8);

        let handle = tokio::spawn(controller.run(rx));
        tx.send(UpdateInput::Signal(available("3.0.0"))).await.unwrap();
        tx.send(UpdateInput::Action(UserAction::ConfirmDownload))
            .await
            .unwrap();
        tx.send(UpdateInput::Signal(UpdaterSignal::UpdateDownloaded))
            .await
            .unwrap();
        tx.send(UpdateInput::Action(UserAction::Install)).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(state.borrow().phase, UpdatePhase::Installing);
        assert_eq!(commands.recv().await, Some(UpdaterCommand::RequestDownload));
        assert_eq!(commands.recv().await, Some(UpdaterCommand::RequestInstall));
        assert_eq!(settings.listener_count(), 0);
    }
}
