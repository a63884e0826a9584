//! # reprise-bot
//!
//! Admin-only keyword filter bot.
//!
//! This binary provides:
//! - **Filters**: admins save a replied-to message under a keyword and
//!   replay it later with `!keyword`, including downloaded media
//! - **Delete confirmation** with inline buttons and an expiry timer
//! - **Per-principal rate limiting** with an advisory warning
//! - **Backups** on demand, on a schedule and before every restore, with
//!   automatic recovery of a damaged store at startup
//! - **Media garbage collection** of unreferenced descriptors and aged
//!   files
//!
//! Platform events arrive as JSON lines on stdin and outbound calls are
//! written as JSON lines to stdout.

mod admins;
mod config;
mod confirm;
mod dispatch;
mod error;
mod fetcher;
mod gateway;
mod jobs;
mod rate_limit;
#[cfg(test)]
mod testing;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use reprise_shared::constants::RATE_SWEEP_INTERVAL_SECS;
use reprise_store::backup::TAG_SHUTDOWN;
use reprise_store::{BackupManager, FilterStore, LoadOutcome};

use crate::config::BotConfig;
use crate::dispatch::Bot;
use crate::gateway::{parse_event_line, JsonLinesGateway};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Environment and tracing (respects RUST_LOG)
    // -----------------------------------------------------------------------
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,reprise_bot=debug,reprise_store=debug")),
        )
        .init();

    info!("Starting reprise bot v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Configuration
    // -----------------------------------------------------------------------
    let config = BotConfig::from_env();
    config.validate()?;
    config.ensure_dirs().await?;
    info!(
        admins = config.admin_ids.len(),
        data_dir = %config.data_dir.display(),
        rate_limit = config.rate_limit,
        auto_backup = config.auto_backup,
        "Loaded configuration"
    );

    // -----------------------------------------------------------------------
    // 3. Store, with recovery from backups when the file is damaged
    // -----------------------------------------------------------------------
    let (store, outcome) = FilterStore::open(config.store_path()).await?;
    let store = Arc::new(store);
    let backups = Arc::new(BackupManager::new(&config.backup_dir, config.max_backups).await?);

    let recovery = backups.auto_recover(&store).await?;
    if recovery.succeeded {
        warn!(source = ?recovery.source, "Store recovered from backup");
    } else if recovery.attempted {
        error!("No usable backup, starting empty");
    }
    if !recovery.succeeded && !matches!(outcome, LoadOutcome::Loaded) {
        store.persist().await?;
    }
    let summary = store.summary().await;
    info!(filters = summary.filters, media = summary.media, "Store ready");

    // -----------------------------------------------------------------------
    // 4. Bot and background jobs
    // -----------------------------------------------------------------------
    let shutdown = CancellationToken::new();
    let gateway = Arc::new(JsonLinesGateway::new(tokio::io::stdout(), 1));
    let bot = Arc::new(Bot::new(
        config.clone(),
        store.clone(),
        backups.clone(),
        gateway,
        shutdown.clone(),
    )?);

    let background = TaskTracker::new();
    if config.auto_backup {
        jobs::spawn_backup_loop(
            &background,
            shutdown.clone(),
            store.clone(),
            backups.clone(),
            config.backup_interval,
        );
    }
    jobs::spawn_gc_loop(
        &background,
        shutdown.clone(),
        store.clone(),
        config.media_dir.clone(),
        config.media_retention,
        config.media_cleanup_interval,
    );
    jobs::spawn_rate_sweep_loop(
        &background,
        shutdown.clone(),
        bot.governor().clone(),
        Duration::from_secs(RATE_SWEEP_INTERVAL_SECS),
    );
    background.close();

    // -----------------------------------------------------------------------
    // 5. Event loop (until stdin closes or Ctrl+C)
    // -----------------------------------------------------------------------
    let handlers = TaskTracker::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let Some(event) = parse_event_line(&line) else {
                        continue;
                    };
                    let bot = bot.clone();
                    handlers.spawn(async move { bot.handle(event).await });
                }
                Ok(None) => {
                    info!("Event stream closed, shutting down");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Failed to read event stream");
                    break;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down");
                break;
            }
        }
    }

    // -----------------------------------------------------------------------
    // 6. Shutdown: drain handlers, stop timers and jobs, final backup
    // -----------------------------------------------------------------------
    handlers.close();
    handlers.wait().await;
    shutdown.cancel();
    bot.confirmations().wait().await;
    background.wait().await;

    match backups.snapshot(&store, TAG_SHUTDOWN).await {
        Ok(Some(path)) => info!(path = %path.display(), "Shutdown backup written"),
        Ok(None) => {}
        Err(e) => error!(error = %e, "Shutdown backup failed"),
    }
    info!("Stopped");
    Ok(())
}
