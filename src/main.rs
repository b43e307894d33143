use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use futures::StreamExt;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use channel_relay::channels::{TelegramTransport, Transport};
use channel_relay::commands::CommandHandler;
use channel_relay::config::RelayConfig;
use channel_relay::pipeline::backfill::spawn_backfill_worker;
use channel_relay::pipeline::coordinator::ForwardingCoordinator;
use channel_relay::pipeline::index::TaskIndex;
use channel_relay::pipeline::types::InboundMessage;
use channel_relay::store::{Database, LibSqlBackend};
use channel_relay::tasks::TaskManager;

/// How long in-flight handlers get to finish after Ctrl-C.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export TELEGRAM_BOT_TOKEN=123456:ABC...");
        std::process::exit(1);
    });

    eprintln!("Channel relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    match config.admin_chat_id {
        Some(id) => eprintln!("   Admin chat: {id}"),
        None => eprintln!("   Admin chat: not set (commands disabled)"),
    }

    let (db, transport) = connect(&config)
        .await
        .context("connecting store and transport")?;

    // ── Tasks ────────────────────────────────────────────────────────────
    let index = Arc::new(TaskIndex::new());
    let tasks = Arc::new(TaskManager::new(Arc::clone(&db), Arc::clone(&index)));
    let loaded = tasks.reload().await.context("loading tasks")?;
    eprintln!("   Tasks: {loaded} stored, {} live", index.len());

    let coordinator = Arc::new(ForwardingCoordinator::new(
        Arc::clone(&db),
        Arc::clone(&transport),
        Arc::clone(&index),
        config.retry.clone(),
    ));
    let commands = Arc::new(CommandHandler::new(
        tasks,
        Arc::clone(&db),
        Arc::clone(&transport),
    ));

    let (mut backfill_handle, backfill_shutdown) = spawn_backfill_worker(
        Arc::clone(&db),
        Arc::clone(&transport),
        Arc::clone(&coordinator),
        config.backfill.clone(),
    );

    // ── Event loop ───────────────────────────────────────────────────────
    let mut stream = transport
        .start()
        .await
        .context("starting Telegram transport")?;
    let mut in_flight = JoinSet::new();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            next = stream.next() => {
                let Some(message) = next else {
                    warn!("Update stream ended");
                    break;
                };
                in_flight.spawn(dispatch(
                    message,
                    config.admin_chat_id,
                    Arc::clone(&coordinator),
                    Arc::clone(&commands),
                    Arc::clone(&transport),
                ));
            }
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!("Message handler panicked: {e}");
                }
            }
            _ = &mut ctrl_c => {
                info!("Shutdown requested");
                break;
            }
        }
    }

    // ── Shutdown ─────────────────────────────────────────────────────────
    backfill_shutdown.store(true, Ordering::Relaxed);

    let pending = in_flight.len();
    if pending > 0 {
        info!(pending, "Waiting for in-flight messages");
    }
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while in_flight.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(
            remaining = in_flight.len(),
            "Drain timed out, aborting remaining handlers"
        );
        in_flight.abort_all();
    }

    if tokio::time::timeout(DRAIN_TIMEOUT, &mut backfill_handle)
        .await
        .is_err()
    {
        warn!("Backfill worker did not stop in time");
        backfill_handle.abort();
    }

    if let Err(e) = transport.shutdown().await {
        warn!("Transport shutdown failed: {e}");
    }

    info!("Relay stopped");
    Ok(())
}

/// Open the store and check the bot credentials.
async fn connect(
    config: &RelayConfig,
) -> channel_relay::error::Result<(Arc<dyn Database>, Arc<dyn Transport>)> {
    let db: Arc<dyn Database> = Arc::new(LibSqlBackend::new_local(&config.db_path).await?);
    let transport: Arc<dyn Transport> = Arc::new(TelegramTransport::new(
        config.bot_token.clone(),
        Arc::clone(&db),
    ));
    transport.health_check().await?;
    Ok((db, transport))
}

/// Route one inbound message: admin commands to the command handler,
/// everything else to the coordinator.
async fn dispatch(
    message: InboundMessage,
    admin_chat_id: Option<i64>,
    coordinator: Arc<ForwardingCoordinator>,
    commands: Arc<CommandHandler>,
    transport: Arc<dyn Transport>,
) {
    let admin = admin_chat_id
        .filter(|admin| message.chat.as_ref().is_some_and(|c| c.id == *admin));

    if let Some(admin) = admin {
        if let Some(reply) = commands.handle(&message.text).await {
            if let Err(e) = transport
                .send_message(&admin.to_string(), &reply, None)
                .await
            {
                warn!(chat_id = admin, "Failed to send command reply: {e}");
            }
            return;
        }
    }

    for outcome in coordinator.handle(&message).await {
        debug!(
            message_id = message.id,
            task_id = outcome.task_id(),
            outcome = outcome.label(),
            "Message handled"
        );
    }
}
