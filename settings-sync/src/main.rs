//! Settings Sync - Main entry point
//!
//! Backs up and restores application settings, and drives the update
//! lifecycle for a host updater speaking JSON lines over stdio.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use settings_sync::events::{Event, EventBus, NoticeLevel};
use settings_sync::orchestrator::{RestorePreview, TransferOrchestrator};
use settings_sync::store::{ConfigStore, FileConfigStore};
use settings_sync::transfer::progress::{format_size, format_speed};
use settings_sync::update::{UpdateController, UpdateInput, UpdatePhase, UserAction};
use settings_sync::{utils, Config};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List remote backups, newest first
    List,

    /// Upload the current settings as a named backup
    Save { name: String },

    /// Download a backup, show it and write it back to the settings
    Restore {
        name: String,

        /// Apply without asking
        #[arg(long)]
        yes: bool,
    },

    /// Delete a remote backup
    Delete { name: String },

    /// Run the update controller: signals and actions in on stdin,
    /// updater commands out on stdout
    Updates {
        /// Accept every download and install prompt
        #[arg(long)]
        assume_yes: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Load configuration
    let config = Config::load(args.config.as_deref())?;

    // Initialize logging
    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level)?;

    tracing::info!(
        "Starting settings-sync v{} (settings: {})",
        env!("CARGO_PKG_VERSION"),
        config.settings.path.display()
    );

    let settings: Arc<dyn ConfigStore> = Arc::new(
        FileConfigStore::open(&config.settings.path)
            .with_context(|| format!("opening {}", config.settings.path.display()))?,
    );
    let events = EventBus::new();
    let notices = tokio::spawn(log_events(events.subscribe()));

    let outcome = match args.command {
        Command::Updates { assume_yes } => run_updates(settings, events, assume_yes).await,
        command => {
            config.validate_store()?;
            let orchestrator =
                TransferOrchestrator::from_config(&config, settings, events)?;
            run_transfer(&orchestrator, command).await
        }
    };

    // Every publisher is gone by now, so the logger drains and stops
    let _ = notices.await;
    outcome
}

async fn run_transfer(orchestrator: &TransferOrchestrator, command: Command) -> Result<()> {
    let mut progress = orchestrator.progress();
    let watcher = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let current = *progress.borrow_and_update();
            if current.is_active {
                tracing::info!("Transfer {:.0}%", current.percent_complete);
            }
        }
    });

    let result = match command {
        Command::List => {
            let items = orchestrator.refresh().await?;
            let mut stdout = tokio::io::stdout();
            for item in &items {
                let modified = chrono::DateTime::from_timestamp_millis(item.last_modified_ms)
                    .map(|t| t.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M").to_string())
                    .unwrap_or_else(|| "-".to_string());
                let line = format!(
                    "{}\t{}\t{}\n",
                    orchestrator.display_name(item),
                    format_size(item.size),
                    modified
                );
                stdout.write_all(line.as_bytes()).await?;
            }
            stdout.flush().await?;
            Ok(())
        }
        Command::Save { name } => Ok(orchestrator.save(&name).await?),
        Command::Restore { name, yes } => {
            let preview = orchestrator.begin_restore(&name).await?;
            print_preview(&preview).await?;
            if yes || confirm(&format!("Apply {} settings?", preview.len())).await? {
                let written = orchestrator.commit_restore(preview).await?;
                tracing::info!("Restored {} settings from {}", written, name);
            } else {
                orchestrator.cancel_restore(preview);
            }
            Ok(())
        }
        Command::Delete { name } => Ok(orchestrator.remove(&name).await?),
        Command::Updates { .. } => bail!("updates is not a transfer command"),
    };

    watcher.abort();
    result
}

async fn print_preview(preview: &RestorePreview) -> Result<()> {
    let text = format!(
        "Backup {} taken {} ({} settings)\n{}\n",
        preview.source_name,
        preview.captured_at_local(),
        preview.len(),
        preview.pretty_entries()
    );
    let mut stdout = tokio::io::stdout();
    stdout.write_all(text.as_bytes()).await?;
    stdout.flush().await?;
    Ok(())
}

async fn confirm(question: &str) -> Result<bool> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(format!("{} [y/N] ", question).as_bytes()).await?;
    stderr.flush().await?;

    let mut answer = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut answer)
        .await?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

async fn run_updates(settings: Arc<dyn ConfigStore>, events: EventBus, assume_yes: bool) -> Result<()> {
    let (command_tx, mut command_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::channel::<UpdateInput>(32);

    let prompts = events.subscribe();
    let controller = UpdateController::new(settings, command_tx, events);
    let mut state = controller.state();
    let controller_handle = tokio::spawn(controller.run(input_rx));

    let state_logger = tokio::spawn(async move {
        while state.changed().await.is_ok() {
            let current = state.borrow_and_update().clone();
            let stats = current.download_stats;
            if current.phase == UpdatePhase::Downloading && stats.total_bytes > 0 {
                tracing::info!(
                    "Downloading update: {:.1}% of {} at {}",
                    stats.percent,
                    format_size(stats.total_bytes),
                    format_speed(stats.bytes_per_second)
                );
            } else {
                tracing::debug!("Update phase: {}", current.phase);
            }
        }
    });

    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(command) = command_rx.recv().await {
            let mut line = serde_json::to_vec(&command)?;
            line.push(b'\n');
            stdout.write_all(&line).await?;
            stdout.flush().await?;
        }
        Ok::<_, anyhow::Error>(())
    });

    let auto_confirm = assume_yes.then(|| tokio::spawn(accept_prompts(prompts, input_tx.clone())));

    let mut outcome = Ok(());
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => {
                        tracing::info!("Input closed");
                        break;
                    }
                    Err(e) => {
                        outcome = Err(e.into());
                        break;
                    }
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<UpdateInput>(&line) {
                    Ok(input) => {
                        if input_tx.send(input).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!("Ignoring unrecognized input {:?}: {}", line, e),
                }
            }
            _ = &mut shutdown => break,
        }
    }

    if let Some(handle) = auto_confirm {
        handle.abort();
    }
    drop(input_tx);
    controller_handle.await?;
    let _ = state_logger.await;
    writer.await??;
    outcome
}

async fn accept_prompts(mut prompts: broadcast::Receiver<Event>, inputs: mpsc::Sender<UpdateInput>) {
    loop {
        let action = match prompts.recv().await {
            Ok(Event::DownloadPrompt { .. }) => UserAction::ConfirmDownload,
            Ok(Event::InstallPrompt { .. }) => UserAction::Install,
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                tracing::warn!("Missed {} events", n);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        tracing::info!("Accepting prompt: {:?}", action);
        if inputs.send(UpdateInput::Action(action)).await.is_err() {
            break;
        }
    }
}

async fn log_events(mut events: broadcast::Receiver<Event>) {
    loop {
        match events.recv().await {
            Ok(Event::Notice { level: NoticeLevel::Error, message }) => tracing::error!("{}", message),
            Ok(Event::Notice { message, .. }) => tracing::info!("{}", message),
            Ok(Event::BackupsRefreshed { count }) => tracing::debug!("{} backups listed", count),
            Ok(Event::DownloadPrompt { version, size }) => {
                tracing::info!("Update {} available ({})", version, size)
            }
            Ok(Event::InstallPrompt { version }) => {
                tracing::info!("Update {} ready to install", version)
            }
            Err(broadcast::error::RecvError::Lagged(n)) => tracing::warn!("Missed {} events", n),
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT (Ctrl+C), stopping"),
        _ = terminate => tracing::info!("Received SIGTERM, stopping"),
    }
}
