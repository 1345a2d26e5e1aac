mod classifier;
mod config;
mod listener;
mod platform;
mod reconcile;
mod report;
mod scheduler;
mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::listener::Listener;
use crate::platform::discord::DiscordClient;
use crate::platform::ChatPlatform;
use crate::scheduler::tasks::register_builtin_tasks;
use crate::scheduler::Scheduler;
use crate::stats::CounterStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,redirect_stats=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    info!("Loading configuration from: {}", config_path.display());
    let config = Config::load(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path.display()))?;

    let channel_id = config.discord.channel_id.clone();
    info!("Configuration loaded successfully");
    info!("  Channel: {}", channel_id);
    info!("  Poll interval: {:?}", config.poll_interval());

    let platform: Arc<dyn ChatPlatform> =
        Arc::new(DiscordClient::new(&config.discord, config.poll_interval()));
    let bot_user_id = platform
        .current_user_id()
        .await
        .context("Failed to fetch bot identity")?;
    info!("Logged in as user {}", bot_user_id);

    let store = CounterStore::new();

    // Live delivery starts after the newest message seen before the backfill
    let cursor = listener::start_cursor(platform.as_ref(), &channel_id).await;
    info!("Live updates start after message {}", cursor);

    // Live events queue up until the backfill opens the gate
    let (event_tx, event_rx) = mpsc::channel(listener::EVENT_QUEUE_CAPACITY);
    let (ready_tx, ready_rx) = oneshot::channel();
    listener::spawn_supervised(platform.clone(), channel_id.clone(), cursor.clone(), event_tx);
    tokio::spawn(Listener::run(store.clone(), bot_user_id, ready_rx, event_rx));

    let mut scheduler = Scheduler::new().await?;
    register_builtin_tasks(
        &scheduler,
        platform.clone(),
        channel_id.clone(),
        store.clone(),
        config.report.clone(),
    )
    .await?;
    scheduler.start().await?;

    let backfilled = reconcile::backfill(platform.as_ref(), &channel_id, &cursor, &store).await;
    if ready_tx.send(backfilled).is_err() {
        anyhow::bail!("Listener stopped before the backfill finished");
    }

    info!("Bot is running. Press Ctrl-C to stop.");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;

    info!("Shutting down...");
    scheduler.shutdown().await?;

    Ok(())
}
