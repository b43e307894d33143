//! Relay schema migrations.
//!
//! Applied versions are recorded in `_migrations`; a start-up run applies
//! whatever is newer than the recorded maximum, in order.

use libsql::Connection;

use crate::error::DatabaseError;

/// One schema version.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Versions must stay increasing.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                source_id TEXT NOT NULL,
                target_id TEXT NOT NULL,
                source_title TEXT NOT NULL DEFAULT '',
                target_title TEXT NOT NULL DEFAULT '',
                mode TEXT NOT NULL DEFAULT 'live',
                is_active INTEGER NOT NULL DEFAULT 1,
                find_user TEXT,
                replace_user TEXT,
                find_link TEXT,
                replace_link TEXT,
                config TEXT NOT NULL DEFAULT '{}',
                last_processed_id INTEGER NOT NULL DEFAULT 0,
                error_count INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_source ON tasks(source_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_mode_active ON tasks(mode, is_active);

            CREATE TABLE IF NOT EXISTS settings (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );

            CREATE TABLE IF NOT EXISTS channel_messages (
                chat_id INTEGER NOT NULL,
                message_id INTEGER NOT NULL,
                username TEXT,
                title TEXT,
                text TEXT NOT NULL DEFAULT '',
                media TEXT,
                sender_id INTEGER,
                sent_at TEXT NOT NULL,
                PRIMARY KEY (chat_id, message_id)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "typed_task_rules",
        sql: r#"
            ALTER TABLE tasks ADD COLUMN rules TEXT NOT NULL DEFAULT '[]';
        "#,
    },
];

/// Bring `conn` up to the latest schema version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("creating _migrations: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            record_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");

    Ok(())
}

/// Highest recorded version; 0 on a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("reading schema version row: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("decoding schema version: {e}"))
        }),
        None => Ok(0),
    }
}

async fn record_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("recording V{version}: {e}")))?;
    Ok(())
}
