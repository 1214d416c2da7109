//! Backup transfer orchestrator.
//!
//! Sequences the user-initiated store operations (refresh, save, restore,
//! delete) and owns the state the front end observes:
//! - the visible backup list
//! - the progress of the current transfer
//! - the single-flight flag that keeps a second transfer from starting
//!
//! Failures are published as notifications on the event bus and returned to
//! the caller. Nothing is retried automatically.

pub mod listing;
pub mod preview;

use crate::backup::envelope;
use crate::config::Config;
use crate::events::{Event, EventBus};
use crate::store::ConfigStore;
use crate::transfer::progress::capped_percent;
use crate::transfer::{ProgressCallback, RemoteItem, StoreClient, TransferProgress};
use crate::utils::errors::{Result, SyncError};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use preview::RestorePreview;

/// Progress channel plus the generation of the transfer that owns it.
///
/// A delayed reset only applies if no newer transfer has started since.
struct ProgressState {
    tx: watch::Sender<TransferProgress>,
    generation: AtomicU64,
}

impl ProgressState {
    fn begin(&self) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.tx.send_replace(TransferProgress::started());
        generation
    }

    fn report(&self, generation: u64, percent: u8) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.tx.send_if_modified(|progress| {
                let before = *progress;
                progress.update(percent);
                *progress != before
            });
        }
    }

    fn reset(&self, generation: u64) {
        if self.generation.load(Ordering::Acquire) == generation {
            self.tx.send_replace(TransferProgress::idle());
        }
    }

    /// Reset to idle once the settle delay has passed
    fn settle(self: &Arc<Self>, generation: u64, delay: Duration) {
        if delay.is_zero() {
            self.reset(generation);
            return;
        }
        let state = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            state.reset(generation);
        });
    }

    fn callback(self: &Arc<Self>, generation: u64) -> ProgressCallback {
        let state = Arc::clone(self);
        Arc::new(move |percent| state.report(generation, percent))
    }
}

/// Releases the single-flight flag on every exit path
struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Drives backup transfers for the front end
pub struct TransferOrchestrator {
    client: StoreClient,
    settings: Arc<dyn ConfigStore>,
    events: EventBus,
    items: RwLock<Vec<RemoteItem>>,
    in_flight: AtomicBool,
    progress: Arc<ProgressState>,
    settle_delay: Duration,
}

impl TransferOrchestrator {
    pub fn new(
        client: StoreClient,
        settings: Arc<dyn ConfigStore>,
        events: EventBus,
        settle_delay: Duration,
    ) -> Self {
        let (tx, _rx) = watch::channel(TransferProgress::idle());
        Self {
            client,
            settings,
            events,
            items: RwLock::new(Vec::new()),
            in_flight: AtomicBool::new(false),
            progress: Arc::new(ProgressState {
                tx,
                generation: AtomicU64::new(0),
            }),
            settle_delay,
        }
    }

    /// Build the store client from configuration
    pub fn from_config(
        config: &Config,
        settings: Arc<dyn ConfigStore>,
        events: EventBus,
    ) -> Result<Self> {
        let client = StoreClient::new(&config.store, &config.transfer)?;
        Ok(Self::new(
            client,
            settings,
            events,
            config.transfer.settle_delay(),
        ))
    }

    /// Visible backups, newest first
    pub fn items(&self) -> Vec<RemoteItem> {
        self.items
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Watch the progress of the current transfer
    pub fn progress(&self) -> watch::Receiver<TransferProgress> {
        self.progress.tx.subscribe()
    }

    /// True while a transfer is running; triggering actions should be disabled
    pub fn is_busy(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Name to show for a listed item
    pub fn display_name(&self, item: &RemoteItem) -> String {
        listing::display_name(self.client.namespace(), &item.key)
    }

    fn try_begin(&self, operation: &str) -> Result<FlightGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| {
                warn!("Rejected {}: another transfer is in progress", operation);
                SyncError::Busy
            })?;
        debug!("Starting {}", operation);
        Ok(FlightGuard {
            flag: &self.in_flight,
        })
    }

    fn ensure_named(&self, name: &str, what: &str) -> Result<()> {
        if name.trim().is_empty() {
            return Err(self.fail(what, SyncError::InvalidName(name.to_string())));
        }
        Ok(())
    }

    fn fail(&self, what: &str, error: SyncError) -> SyncError {
        warn!("{} failed: {}", what, error);
        self.events
            .publish(Event::error(format!("{} failed: {}", what, error)));
        error
    }

    /// Reload the backup list. On failure the previous list stays visible.
    pub async fn refresh(&self) -> Result<Vec<RemoteItem>> {
        let _guard = self.try_begin("refresh")?;
        self.refresh_items().await
    }

    async fn refresh_items(&self) -> Result<Vec<RemoteItem>> {
        let mut items = match self.client.list().await {
            Ok(items) => items,
            Err(e) => return Err(self.fail("Loading backups", e)),
        };
        listing::sort_newest_first(&mut items);

        *self.items.write().unwrap_or_else(PoisonError::into_inner) = items.clone();
        info!("Backup list refreshed: {} item(s)", items.len());
        self.events
            .publish(Event::BackupsRefreshed { count: items.len() });
        Ok(items)
    }

    /// Upload the current settings as `name`, then refresh the list.
    pub async fn save(&self, name: &str) -> Result<()> {
        let name = name.trim();
        self.ensure_named(name, "Saving backup")?;
        let _guard = self.try_begin("save")?;
        let generation = self.progress.begin();

        let result = self.upload_snapshot(name, generation).await;
        let outcome = match result {
            Ok(()) => {
                self.events
                    .publish(Event::success(format!("Backup \"{}\" saved", name)));
                if let Err(e) = self.refresh_items().await {
                    debug!("List refresh after save failed: {}", e);
                }
                Ok(())
            }
            Err(e) => Err(self.fail("Saving backup", e)),
        };

        self.progress.settle(generation, self.settle_delay);
        outcome
    }

    async fn upload_snapshot(&self, name: &str, generation: u64) -> Result<()> {
        let snapshot = self.settings.get_all()?;
        let text = envelope::encode(&snapshot)?;
        info!(
            "Saving backup {} ({} settings, {} bytes)",
            name,
            snapshot.len(),
            text.len()
        );
        self.client
            .put(
                name,
                Bytes::from(text),
                Some(self.progress.callback(generation)),
            )
            .await
    }

    /// Download and validate a backup; nothing is written until the
    /// returned preview is committed.
    pub async fn begin_restore(&self, name: &str) -> Result<RestorePreview> {
        self.ensure_named(name, "Loading backup")?;
        let _guard = self.try_begin("restore preview")?;
        let generation = self.progress.begin();

        let result = self.load_preview(name, generation).await;
        let outcome = match result {
            Ok(preview) => {
                info!(
                    "Loaded backup {} with {} setting(s)",
                    name,
                    preview.len()
                );
                Ok(preview)
            }
            Err(e) => Err(self.fail("Loading backup", e)),
        };

        self.progress.settle(generation, self.settle_delay);
        outcome
    }

    async fn load_preview(&self, name: &str, generation: u64) -> Result<RestorePreview> {
        let raw = self
            .client
            .get(name, Some(self.progress.callback(generation)))
            .await?;
        let envelope = envelope::decode(&raw)?;
        Ok(RestorePreview::new(name, envelope))
    }

    /// Write every previewed setting back, one key at a time.
    ///
    /// Best effort: a failed key does not stop the rest and keys already
    /// written are not rolled back, so a partial failure can leave some
    /// settings restored and others not. Returns the number of keys written.
    pub async fn commit_restore(&self, preview: RestorePreview) -> Result<usize> {
        let _guard = self.try_begin("restore")?;
        let generation = self.progress.begin();

        let RestorePreview {
            source_name,
            entries,
            ..
        } = preview;
        let total = entries.len();
        let mut failed = Vec::new();

        for (index, (key, value)) in entries.into_iter().enumerate() {
            if let Err(e) = self.settings.set(&key, value) {
                warn!("Failed to restore setting {}: {}", key, e);
                failed.push(key);
            }
            if let Some(percent) = capped_percent(index as u64 + 1, total as u64) {
                self.progress.report(generation, percent);
            }
        }

        let outcome = if failed.is_empty() {
            self.progress.report(generation, 100);
            info!("Restored {} setting(s) from {}", total, source_name);
            self.events.publish(Event::success(format!(
                "Restored \"{}\": {} setting(s) written",
                source_name, total
            )));
            Ok(total)
        } else {
            Err(self.fail(
                "Restore",
                SyncError::PartialWriteFailure {
                    failed: failed.len(),
                    total,
                    keys: failed.join(", "),
                },
            ))
        };

        self.progress.settle(generation, self.settle_delay);
        outcome
    }

    /// Drop a preview without writing anything
    pub fn cancel_restore(&self, preview: RestorePreview) {
        info!("Restore of {} cancelled", preview.source_name);
    }

    /// Delete a backup, then refresh the list.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.ensure_named(name, "Deleting backup")?;
        let _guard = self.try_begin("delete")?;
        let generation = self.progress.begin();

        let outcome = match self.client.delete(name).await {
            Ok(()) => {
                self.progress.report(generation, 100);
                info!("Deleted backup {}", name);
                if let Err(e) = self.refresh_items().await {
                    debug!("List refresh after delete failed: {}", e);
                }
                Ok(())
            }
            Err(e) => Err(self.fail("Deleting backup", e)),
        };

        self.progress.settle(generation, self.settle_delay);
        outcome
    }
}
