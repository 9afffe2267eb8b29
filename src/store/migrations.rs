//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "autopilot_core",
        sql: r#"
            CREATE TABLE IF NOT EXISTS autopilot_policies (
                conversation_id TEXT PRIMARY KEY,
                location_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                is_enabled INTEGER NOT NULL DEFAULT 0,
                reply_delay_minutes INTEGER NOT NULL DEFAULT 0 CHECK (reply_delay_minutes >= 0),
                max_replies_per_conversation INTEGER NOT NULL DEFAULT 0
                    CHECK (max_replies_per_conversation >= 0),
                max_replies_per_day INTEGER NOT NULL DEFAULT 0 CHECK (max_replies_per_day >= 0),
                operating_hours TEXT,
                cancel_on_user_reply INTEGER NOT NULL DEFAULT 0,
                require_human_keywords TEXT NOT NULL DEFAULT '[]',
                exclude_keywords TEXT NOT NULL DEFAULT '[]',
                agent_id TEXT,
                model TEXT NOT NULL,
                temperature REAL NOT NULL DEFAULT 0.7,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_autopilot_policies_enabled
                ON autopilot_policies(is_enabled);
            CREATE INDEX IF NOT EXISTS idx_autopilot_policies_location
                ON autopilot_policies(location_id);

            CREATE TABLE IF NOT EXISTS conversation_tracking (
                conversation_id TEXT PRIMARY KEY,
                last_seen_message_id TEXT,
                last_human_message_at TEXT,
                last_ai_message_at TEXT,
                replies_total INTEGER NOT NULL DEFAULT 0 CHECK (replies_total >= 0),
                replies_today INTEGER NOT NULL DEFAULT 0 CHECK (replies_today >= 0),
                last_reply_date TEXT,
                conversation_status TEXT,
                contact_id TEXT,
                contact_name TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS processed_messages (
                message_id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                processed_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_processed_messages_conversation
                ON processed_messages(conversation_id);
        "#,
    },
    Migration {
        version: 2,
        name: "provider_credentials",
        sql: r#"
            CREATE TABLE IF NOT EXISTS provider_credentials (
                location_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NOT NULL,
                expires_at TEXT,
                updated_at TEXT NOT NULL
            );
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
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
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

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
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    let version = get_current_version(conn).await?;
    tracing::debug!(version, "Database migrations complete");
    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => row.get::<i64>(0).map_err(|e| {
            DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
        }),
        None => Ok(0),
    }
}

/// Record a migration version as applied.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}
