//! History backfill worker.
//!
//! Replays the past messages of every active `history` task through the
//! coordinator, oldest first, one page per task per poll. The persisted
//! checkpoint only moves on successful sends; a per-task cursor kept in
//! memory moves past skipped messages too, so a page ending in skips is not
//! replayed on every poll.
//!
//! After each pass the message journal is pruned up to the lowest persisted
//! checkpoint of the tasks reading each chat.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::channels::Transport;
use crate::config::BackfillConfig;
use crate::error::{ChannelError, DatabaseError};
use crate::pipeline::coordinator::ForwardingCoordinator;
use crate::pipeline::types::{ChannelRef, TaskOutcome};
use crate::store::Database;
use crate::tasks::model::{Task, TaskMode};

/// Spawn the backfill loop.
///
/// Returns a `JoinHandle` and a shutdown flag. Set the flag to stop.
pub fn spawn_backfill_worker(
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<ForwardingCoordinator>,
    config: BackfillConfig,
) -> (JoinHandle<()>, Arc<AtomicBool>) {
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = Arc::clone(&shutdown);

    let handle = tokio::spawn(async move {
        info!(
            "Backfill worker started, polling every {}s",
            config.poll_interval.as_secs()
        );

        let mut worker = BackfillWorker::new(store, transport, coordinator, config);

        loop {
            if shutdown.load(Ordering::Relaxed) {
                info!("Backfill worker shutting down");
                return;
            }

            let pause = match worker.run_once(&shutdown).await {
                Ok(pass) if pass.tasks == 0 => worker.config.idle_interval,
                Ok(pass) => {
                    debug!(
                        tasks = pass.tasks,
                        forwarded = pass.forwarded,
                        failures = pass.failures,
                        "Backfill pass complete"
                    );
                    worker.config.poll_interval
                }
                Err(e) => {
                    error!("Backfill poll failed: {e}");
                    worker.config.idle_interval
                }
            };

            tokio::time::sleep(pause).await;
        }
    });

    (handle, shutdown_flag)
}

/// Counters for one poll.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BackfillPass {
    /// Active history tasks found.
    pub tasks: usize,
    pub forwarded: usize,
    /// Tasks that errored this pass.
    pub failures: usize,
    /// Journal rows deleted after the pass.
    pub pruned: u64,
}

pub struct BackfillWorker {
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    coordinator: Arc<ForwardingCoordinator>,
    config: BackfillConfig,
    /// Last message ID handed to the coordinator, per task.
    cursors: HashMap<i64, i64>,
    /// Resolved sources by task source identifier.
    sources: HashMap<String, ChannelRef>,
    consecutive_failures: u32,
}

impl BackfillWorker {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        coordinator: Arc<ForwardingCoordinator>,
        config: BackfillConfig,
    ) -> Self {
        Self {
            store,
            transport,
            coordinator,
            config,
            cursors: HashMap::new(),
            sources: HashMap::new(),
            consecutive_failures: 0,
        }
    }

    /// Process one page for every active history task.
    pub async fn run_once(&mut self, shutdown: &AtomicBool) -> Result<BackfillPass, DatabaseError> {
        let tasks = self.store.list_active_tasks(TaskMode::History).await?;
        let mut pass = BackfillPass {
            tasks: tasks.len(),
            ..BackfillPass::default()
        };

        // Forget cursors of tasks that were deleted, paused or switched to live.
        self.cursors
            .retain(|id, _| tasks.iter().any(|t| t.id == *id));

        for task in &tasks {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            match self.backfill_task(task, shutdown).await {
                Ok(forwarded) => {
                    pass.forwarded += forwarded;
                    self.consecutive_failures = 0;
                }
                Err(e) => {
                    warn!(task_id = task.id, "Backfill failed: {e}");
                    pass.failures += 1;
                    self.consecutive_failures += 1;
                    if self.consecutive_failures >= self.config.max_consecutive_failures {
                        warn!(
                            failures = self.consecutive_failures,
                            cooldown_secs = self.config.failure_cooldown.as_secs(),
                            "Backfill cooling down after repeated failures"
                        );
                        tokio::time::sleep(self.config.failure_cooldown).await;
                        self.consecutive_failures = 0;
                    }
                }
            }
        }

        if pass.tasks > 0 && !shutdown.load(Ordering::Relaxed) {
            pass.pruned = self.prune_journal().await;
        }

        Ok(pass)
    }

    /// Delete journal rows every history task has already consumed.
    ///
    /// Skipped entirely while any task's source is unresolved, since that
    /// task may read one of the pruned chats.
    async fn prune_journal(&self) -> u64 {
        let tasks = match self.store.list_active_tasks(TaskMode::History).await {
            Ok(tasks) => tasks,
            Err(e) => {
                warn!("Journal prune skipped: {e}");
                return 0;
            }
        };

        let mut floors: HashMap<i64, i64> = HashMap::new();
        for task in &tasks {
            let Some(source) = self.sources.get(&task.source_id) else {
                debug!(task_id = task.id, "Journal prune skipped: source unresolved");
                return 0;
            };
            floors
                .entry(source.id)
                .and_modify(|floor| *floor = (*floor).min(task.last_processed_id))
                .or_insert(task.last_processed_id);
        }

        let mut pruned = 0;
        for (chat_id, floor) in floors {
            if floor <= 0 {
                continue;
            }
            match self.store.prune_channel_messages(chat_id, floor).await {
                Ok(0) => {}
                Ok(removed) => {
                    debug!(chat_id, up_to = floor, removed, "Pruned message journal");
                    pruned += removed;
                }
                Err(e) => warn!(chat_id, "Journal prune failed: {e}"),
            }
        }
        pruned
    }

    /// Forward one page of a task's history. Returns how many were sent.
    async fn backfill_task(&mut self, task: &Task, shutdown: &AtomicBool) -> Result<usize, ChannelError> {
        let source = self.resolve_source(&task.source_id).await?;

        let cursor = self
            .cursors
            .get(&task.id)
            .copied()
            .unwrap_or(0)
            .max(task.last_processed_id);
        let limit = if cursor == 0 {
            self.config.first_page_size
        } else {
            self.config.page_size
        };

        let page = timeout(
            self.config.request_timeout,
            self.transport.iter_history(&source, cursor, limit),
        )
        .await
        .map_err(|_| self.timeout_error())??;

        if page.is_empty() {
            debug!(task_id = task.id, cursor, "History caught up");
            return Ok(0);
        }

        let mut forwarded = 0;
        for message in &page {
            if shutdown.load(Ordering::Relaxed) {
                break;
            }

            let outcome = self.coordinator.process_task(task.id, message).await;
            debug!(
                task_id = task.id,
                message_id = message.id,
                outcome = outcome.label(),
                "Backfilled message"
            );

            match outcome {
                TaskOutcome::Forwarded { .. } => forwarded += 1,
                TaskOutcome::Skipped { .. } | TaskOutcome::Empty { .. } => {}
                TaskOutcome::Inactive { .. } => break,
                // Leave the cursor here so the message is retried next poll.
                TaskOutcome::Failed { error, .. } => {
                    return Err(ChannelError::SendFailed {
                        name: self.transport.name().to_string(),
                        reason: format!("message {}: {error}", message.id),
                    });
                }
            }
            self.cursors.insert(task.id, message.id);

            tokio::time::sleep(self.config.message_delay).await;
        }

        Ok(forwarded)
    }

    async fn resolve_source(&mut self, identifier: &str) -> Result<ChannelRef, ChannelError> {
        if let Some(source) = self.sources.get(identifier) {
            return Ok(source.clone());
        }
        let source = timeout(
            self.config.request_timeout,
            self.transport.resolve_channel(identifier),
        )
        .await
        .map_err(|_| self.timeout_error())??;
        self.sources.insert(identifier.to_string(), source.clone());
        Ok(source)
    }

    fn timeout_error(&self) -> ChannelError {
        ChannelError::Timeout {
            name: self.transport.name().to_string(),
            timeout: self.config.request_timeout,
        }
    }
}
