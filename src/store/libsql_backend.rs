//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{info, warn};

use crate::error::DatabaseError;
use crate::pipeline::rules::Rule;
use crate::pipeline::types::{ChannelRef, InboundMessage, Media};
use crate::store::migrations;
use crate::store::traits::Database;
use crate::tasks::model::{LegacyRules, NewTask, StoredRules, Task, TaskConfig, TaskMode};

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_tasks(
        &self,
        sql: &str,
        params: impl libsql::params::IntoParams,
        op: &str,
    ) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_task(&row) {
                Ok(t) => tasks.push(t),
                Err(e) => warn!("Skipping task row: {e}"),
            }
        }
        Ok(tasks)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn opt_int(v: Option<i64>) -> libsql::Value {
    match v {
        Some(v) => libsql::Value::Integer(v),
        None => libsql::Value::Null,
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

const TASK_COLUMNS: &str = "id, source_id, target_id, source_title, target_title, mode, is_active, find_user, replace_user, find_link, replace_link, rules, config, last_processed_id, error_count, created_at, updated_at";

fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task id: {e}")))?;

    let mode_str: String = row.get(5).unwrap_or_else(|_| "live".to_string());
    let mode = mode_str.parse::<TaskMode>().map_err(DatabaseError::Serialization)?;

    let legacy = LegacyRules {
        find_user: row.get(7).ok(),
        replace_user: row.get(8).ok(),
        find_link: row.get(9).ok(),
        replace_link: row.get(10).ok(),
    };

    let rules_str: String = row.get(11).unwrap_or_else(|_| "[]".to_string());
    let typed: Vec<Rule> = serde_json::from_str(&rules_str)
        .map_err(|e| DatabaseError::Serialization(format!("task {id} rules: {e}")))?;

    let config_str: String = row.get(12).unwrap_or_else(|_| "{}".to_string());
    let config: TaskConfig = serde_json::from_str(&config_str).unwrap_or_default();

    let created_str: String = row.get(15).unwrap_or_default();
    let updated_str: String = row.get(16).unwrap_or_default();

    Ok(Task {
        id,
        source_id: row.get(1).unwrap_or_default(),
        target_id: row.get(2).unwrap_or_default(),
        source_title: row.get(3).unwrap_or_default(),
        target_title: row.get(4).unwrap_or_default(),
        mode,
        is_active: row.get::<i64>(6).unwrap_or(1) != 0,
        rules: StoredRules { legacy, typed }.normalize(),
        config,
        last_processed_id: row.get(13).unwrap_or(0),
        error_count: row.get(14).unwrap_or(0),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_channel_message(row: &libsql::Row) -> Result<InboundMessage, DatabaseError> {
    let chat_id: i64 = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("chat_id: {e}")))?;
    let message_id: i64 = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("message_id: {e}")))?;

    let chat = ChannelRef {
        id: chat_id,
        username: row.get(2).ok(),
        title: row.get(3).ok(),
    };

    let media: Option<Media> = match row.get::<String>(5) {
        Ok(s) => Some(
            serde_json::from_str(&s)
                .map_err(|e| DatabaseError::Serialization(format!("media: {e}")))?,
        ),
        Err(_) => None,
    };

    let sent_str: String = row.get(7).unwrap_or_default();

    Ok(InboundMessage {
        id: message_id,
        chat: Some(chat),
        text: row.get(4).unwrap_or_default(),
        media,
        sender_id: row.get::<i64>(6).ok(),
        date: parse_datetime(&sent_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(&self, task: &NewTask) -> Result<Task, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let rules = to_json(&task.rules)?;
        let config = to_json(&task.config)?;

        let mut rows = self
            .conn()
            .query(
                "INSERT INTO tasks (source_id, target_id, source_title, target_title, mode, is_active, rules, config, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9)
                 RETURNING id",
                params![
                    task.source_id.clone(),
                    task.target_id.clone(),
                    task.source_title.clone(),
                    task.target_title.clone(),
                    task.mode.as_str(),
                    task.is_active as i64,
                    rules,
                    config,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?;

        let id: i64 = match rows.next().await {
            Ok(Some(row)) => row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("create_task: {e}")))?,
            Ok(None) => return Err(DatabaseError::Query("create_task: no id returned".into())),
            Err(e) => return Err(DatabaseError::Query(format!("create_task: {e}"))),
        };
        drop(rows);

        self.get_task(id).await?.ok_or_else(|| DatabaseError::NotFound {
            entity: "task".into(),
            id: id.to_string(),
        })
    }

    async fn get_task(&self, id: i64) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    async fn list_tasks(&self) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!("SELECT {TASK_COLUMNS} FROM tasks ORDER BY id"),
            (),
            "list_tasks",
        )
        .await
    }

    async fn list_active_tasks(&self, mode: TaskMode) -> Result<Vec<Task>, DatabaseError> {
        self.query_tasks(
            &format!(
                "SELECT {TASK_COLUMNS} FROM tasks WHERE is_active = 1 AND mode = ?1 ORDER BY id"
            ),
            params![mode.as_str()],
            "list_active_tasks",
        )
        .await
    }

    async fn update_task(&self, task: &Task) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let rules = to_json(&task.rules)?;
        let config = to_json(&task.config)?;

        // Rules are already normalized, so the legacy columns are cleared.
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET source_id = ?2, target_id = ?3, source_title = ?4, target_title = ?5,
                     mode = ?6, is_active = ?7, rules = ?8, config = ?9,
                     find_user = NULL, replace_user = NULL, find_link = NULL, replace_link = NULL,
                     updated_at = ?10
                 WHERE id = ?1",
                params![
                    task.id,
                    task.source_id.clone(),
                    task.target_id.clone(),
                    task.source_title.clone(),
                    task.target_title.clone(),
                    task.mode.as_str(),
                    task.is_active as i64,
                    rules,
                    config,
                    now,
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("update_task: {e}")))?;

        if count == 0 {
            return Err(DatabaseError::NotFound {
                entity: "task".into(),
                id: task.id.to_string(),
            });
        }
        Ok(())
    }

    async fn set_task_active(&self, id: i64, active: bool) -> Result<bool, DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let count = self
            .conn()
            .execute(
                "UPDATE tasks SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active as i64, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_task_active: {e}")))?;
        Ok(count > 0)
    }

    async fn delete_task(&self, id: i64) -> Result<bool, DatabaseError> {
        let count = self
            .conn()
            .execute("DELETE FROM tasks WHERE id = ?1", params![id])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_task: {e}")))?;
        Ok(count > 0)
    }

    async fn advance_checkpoint(&self, id: i64, message_id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET last_processed_id = MAX(last_processed_id, ?2), updated_at = ?3 WHERE id = ?1",
                params![id, message_id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_checkpoint: {e}")))?;
        Ok(())
    }

    async fn increment_error_count(&self, id: i64) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "UPDATE tasks SET error_count = error_count + 1, updated_at = ?2 WHERE id = ?1",
                params![id, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("increment_error_count: {e}")))?;
        Ok(())
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(&self, key: &str) -> Result<Option<serde_json::Value>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT value FROM settings WHERE key = ?1", params![key])
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value = serde_json::from_str(&value_str)
                    .map_err(|e| DatabaseError::Serialization(format!("setting {key}: {e}")))?;
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(&self, key: &str, value: &serde_json::Value) -> Result<(), DatabaseError> {
        let now = Utc::now().to_rfc3339();
        let value_str = to_json(value)?;

        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (key) DO UPDATE SET value = ?2, updated_at = ?3",
                params![key, value_str, now],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;

        Ok(())
    }

    // ── Message journal ─────────────────────────────────────────────

    async fn record_channel_message(&self, message: &InboundMessage) -> Result<(), DatabaseError> {
        let Some(chat) = &message.chat else {
            return Err(DatabaseError::Constraint(format!(
                "message {} has no chat",
                message.id
            )));
        };
        let media = match &message.media {
            Some(m) => libsql::Value::Text(to_json(m)?),
            None => libsql::Value::Null,
        };

        self.conn()
            .execute(
                "INSERT INTO channel_messages (chat_id, message_id, username, title, text, media, sender_id, sent_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (chat_id, message_id) DO UPDATE SET text = ?5, media = ?6",
                params![
                    chat.id,
                    message.id,
                    opt_text(chat.username.as_deref()),
                    opt_text(chat.title.as_deref()),
                    message.text.clone(),
                    media,
                    opt_int(message.sender_id),
                    message.date.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_channel_message: {e}")))?;
        Ok(())
    }

    async fn list_channel_messages(
        &self,
        chat_id: i64,
        after_id: i64,
        limit: usize,
    ) -> Result<Vec<InboundMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT chat_id, message_id, username, title, text, media, sender_id, sent_at
                 FROM channel_messages
                 WHERE chat_id = ?1 AND message_id > ?2
                 ORDER BY message_id ASC
                 LIMIT ?3",
                params![chat_id, after_id, limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_channel_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_channel_message(&row) {
                Ok(m) => messages.push(m),
                Err(e) => warn!("Skipping journal row: {e}"),
            }
        }
        Ok(messages)
    }

    async fn prune_channel_messages(&self, chat_id: i64, up_to_id: i64) -> Result<u64, DatabaseError> {
        self.conn()
            .execute(
                "DELETE FROM channel_messages WHERE chat_id = ?1 AND message_id <= ?2",
                params![chat_id, up_to_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("prune_channel_messages: {e}")))
    }
}
