//! Forwarding coordinator.
//!
//! Per inbound message:
//! 1. `TaskIndex::candidates()`: which live tasks watch this chat
//! 2. re-fetch each task and the global settings from the store
//! 3. `rules::apply()`: rewrite or skip
//! 4. send to the target with timeout and bounded backoff
//! 5. advance the checkpoint, or bump the error count on final failure
//! 6. post a `ForwardReport` to the log channel, if one is configured
//!
//! Tasks for the same message run concurrently and never affect each other.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::channels::Transport;
use crate::config::RetryPolicy;
use crate::error::ChannelError;
use crate::pipeline::index::TaskIndex;
use crate::pipeline::rules::{self, RuleOutcome};
use crate::pipeline::types::{ChannelRef, ForwardReport, InboundMessage, Media, TaskOutcome};
use crate::settings::GlobalSettings;
use crate::store::Database;

pub struct ForwardingCoordinator {
    store: Arc<dyn Database>,
    transport: Arc<dyn Transport>,
    index: Arc<TaskIndex>,
    retry: RetryPolicy,
    /// Resolved log channels by configured identifier.
    log_channels: RwLock<HashMap<String, ChannelRef>>,
}

impl ForwardingCoordinator {
    pub fn new(
        store: Arc<dyn Database>,
        transport: Arc<dyn Transport>,
        index: Arc<TaskIndex>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            index,
            retry,
            log_channels: RwLock::new(HashMap::new()),
        }
    }

    /// Route a live message to every matching task.
    pub async fn handle(&self, message: &InboundMessage) -> Vec<TaskOutcome> {
        let Some(chat) = &message.chat else {
            debug!(message_id = message.id, "Dropping message with unresolved origin");
            return Vec::new();
        };

        let candidates = self.index.candidates(chat);
        if candidates.is_empty() {
            return Vec::new();
        }

        debug!(
            chat_id = chat.id,
            message_id = message.id,
            tasks = candidates.len(),
            "Routing message"
        );

        join_all(
            candidates
                .iter()
                .map(|task| self.process_task(task.id, message)),
        )
        .await
    }

    /// Run one task against one message. Shared by the live and backfill paths.
    pub async fn process_task(&self, task_id: i64, message: &InboundMessage) -> TaskOutcome {
        let task = match self.store.get_task(task_id).await {
            Ok(Some(task)) if task.is_active => task,
            Ok(_) => {
                debug!(task_id, "Task gone or paused; not forwarding");
                return TaskOutcome::Inactive { task_id };
            }
            Err(e) => {
                warn!(task_id, "Failed to load task: {e}");
                return TaskOutcome::Inactive { task_id };
            }
        };

        let settings = match GlobalSettings::load(self.store.as_ref()).await {
            Ok(s) => s,
            Err(e) => {
                error!(task_id, "Failed to load global settings: {e}");
                return TaskOutcome::Failed {
                    task_id,
                    error: e.to_string(),
                };
            }
        };

        let transformation = rules::apply(&message.text, &task.rules, &settings.rules, &task.config);
        let mut changes = transformation.changes;

        let mut text = match transformation.outcome {
            RuleOutcome::Skip { pattern } => {
                info!(task_id, message_id = message.id, pattern = %pattern, "Message skipped");
                return TaskOutcome::Skipped { task_id, pattern };
            }
            RuleOutcome::Forward(text) => text,
        };

        if task.config.strip_captions && message.media.is_some() && !text.is_empty() {
            text.clear();
            changes.push("Stripped caption.".to_string());
        }

        if text.is_empty() && message.media.is_none() {
            info!(task_id, message_id = message.id, "Nothing left to forward");
            return TaskOutcome::Empty { task_id };
        }

        if let Err(e) = self
            .send_with_retry(&task.target_id, &text, message.media.as_ref())
            .await
        {
            error!(
                task_id,
                message_id = message.id,
                target_id = %task.target_id,
                "Failed to forward: {e}"
            );
            if let Err(db_err) = self.store.increment_error_count(task_id).await {
                error!(task_id, "Failed to record send failure: {db_err}");
            }
            return TaskOutcome::Failed {
                task_id,
                error: e.to_string(),
            };
        }

        if let Err(e) = self.store.advance_checkpoint(task_id, message.id).await {
            error!(task_id, message_id = message.id, "Failed to advance checkpoint: {e}");
        }

        info!(
            task_id,
            message_id = message.id,
            changes = changes.len(),
            "Forwarded message"
        );

        let report = ForwardReport {
            task_id,
            source_title: task.source_title,
            target_title: task.target_title,
            message_id: message.id,
            changes,
        };

        if let Some(log_channel) = settings.log_channel.as_deref() {
            self.send_report(log_channel, &report).await;
        }

        TaskOutcome::Forwarded { task_id, report }
    }

    /// One transport call bounded by the send timeout.
    async fn send_once(
        &self,
        target: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<i64, ChannelError> {
        match timeout(
            self.retry.send_timeout,
            self.transport.send_message(target, text, media),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout {
                name: self.transport.name().to_string(),
                timeout: self.retry.send_timeout,
            }),
        }
    }

    async fn send_with_retry(
        &self,
        target: &str,
        text: &str,
        media: Option<&Media>,
    ) -> Result<i64, ChannelError> {
        let mut attempt = 1;
        loop {
            match self.send_once(target, text, media).await {
                Ok(id) => return Ok(id),
                Err(e @ ChannelError::InvalidMessage(_)) => return Err(e),
                Err(e) if attempt >= self.retry.max_attempts => return Err(e),
                Err(e) => {
                    let mut delay = self.retry.backoff(attempt);
                    if let ChannelError::RateLimited {
                        retry_after: Some(after),
                        ..
                    } = &e
                    {
                        delay = delay.max(*after);
                    }
                    warn!(
                        to = %target,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        "Send failed, retrying: {e}"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Deliver a report. Failures are logged and dropped.
    async fn send_report(&self, log_channel: &str, report: &ForwardReport) {
        let channel = match self.resolve_log_channel(log_channel).await {
            Ok(c) => c,
            Err(e) => {
                warn!(log_channel, "Cannot resolve log channel: {e}");
                return;
            }
        };

        if let Err(e) = self
            .send_once(&channel.id.to_string(), &report.render(), None)
            .await
        {
            warn!(log_channel, task_id = report.task_id, "Failed to send report: {e}");
        }
    }

    async fn resolve_log_channel(&self, identifier: &str) -> Result<ChannelRef, ChannelError> {
        if let Some(channel) = self.log_channels.read().await.get(identifier) {
            return Ok(channel.clone());
        }

        let channel = timeout(
            self.retry.send_timeout,
            self.transport.resolve_channel(identifier),
        )
        .await
        .map_err(|_| ChannelError::Timeout {
            name: self.transport.name().to_string(),
            timeout: self.retry.send_timeout,
        })??;

        self.log_channels
            .write()
            .await
            .insert(identifier.to_string(), channel.clone());
        Ok(channel)
    }
}
