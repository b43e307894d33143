//! `Database` trait: single async interface for all persistence.

use async_trait::async_trait;

use crate::error::DatabaseError;
use crate::pipeline::types::InboundMessage;
use crate::tasks::model::{NewTask, Task, TaskMode};

/// Backend-agnostic database trait covering tasks, settings and the
/// channel message journal.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a task. The store assigns the ID.
    async fn create_task(&self, task: &NewTask) -> Result<Task, DatabaseError>;

    /// Get a task by ID.
    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError>;

    /// All tasks, ordered by ID.
    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError>;

    /// Active tasks of one mode, ordered by ID.
    async fn list_active_tasks(&self, mode: TaskMode) -> Result<Vec<Task>, DatabaseError>;

    /// Overwrite the editable fields of a task. Counters are left alone.
    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError>;

    /// Pause or resume a task. Returns `false` if it does not exist.
    async fn set_task_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError>;

    /// Delete a task. Returns `false` if it did not exist.
    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError>;

    /// `last_processed_id = max(last_processed_id, message_id)`.
    async fn advance_checkpoint(&self, id: i64, message_id: i64) -> Result<(), DatabaseError>;

    /// `error_count += 1`.
    async fn increment_error_count(&self, id: i64) -> Result<(), DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Get a global setting value.
    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Set a global setting value (upsert).
    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError>;

    // ── Message journal ─────────────────────────────────────────────

    /// Record an observed channel message. Re-recording an ID updates it.
    async fn record_channel_message(&self, message: &InboundMessage) -> Result<(), DatabaseError>;

    /// Journaled messages of a chat with ID > `after_id`, oldest first.
    async fn list_channel_messages(
        &self,
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, DatabaseError>;

    /// Drop journaled messages of a chat with ID <= `up_to_id`. Returns the count.
    async fn prune_channel_messages(&self, chat_id: i64, up_to_id: i64) -> Result<u64, DatabaseError>;
}
