//! Schema migrations for the libSQL store.
//!
//! Versions are recorded in `schema_version`. Each pending step runs in its
//! own transaction together with its version row, so a crash mid-migration
//! leaves the previous version intact.

use libsql::{Connection, params};
use tracing::{debug, info};

use crate::error::DatabaseError;

struct Step {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// Append only. Never edit a step that has shipped.
const STEPS: &[Step] = &[
    Step {
        version: 1,
        name: "cursors_and_audit",
        sql: r#"
            CREATE TABLE IF NOT EXISTS cursors (
                channel_id TEXT PRIMARY KEY,
                message_id TEXT NOT NULL,
                message_created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS audit_log (
                id TEXT PRIMARY KEY,
                channel_id TEXT NOT NULL,
                message_id TEXT NOT NULL,
                action TEXT NOT NULL,
                outcome TEXT NOT NULL,
                category TEXT,
                severity REAL NOT NULL,
                notify INTEGER NOT NULL DEFAULT 0,
                degraded INTEGER NOT NULL DEFAULT 0,
                dry_run INTEGER NOT NULL DEFAULT 0,
                rationale TEXT NOT NULL,
                policy_version TEXT NOT NULL,
                decided_at TEXT NOT NULL
            );
            CREATE UNIQUE INDEX IF NOT EXISTS idx_audit_channel_message
                ON audit_log(channel_id, message_id);
        "#,
    },
    Step {
        version: 2,
        name: "audit_time_index",
        sql: r#"
            CREATE INDEX IF NOT EXISTS idx_audit_decided_at ON audit_log(decided_at);
            CREATE INDEX IF NOT EXISTS idx_audit_action ON audit_log(action);
        "#,
    },
];

/// Latest schema version this build knows about.
pub fn latest_version() -> i64 {
    STEPS.last().map(|s| s.version).unwrap_or(0)
}

/// Bring the schema up to [`latest_version`].
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("schema_version table: {e}")))?;

    let current = applied_version(conn).await?;
    if current > latest_version() {
        return Err(DatabaseError::Migration(format!(
            "database is at schema V{current}, newer than this build (V{})",
            latest_version()
        )));
    }

    for step in STEPS.iter().filter(|s| s.version > current) {
        info!(version = step.version, name = step.name, "Applying migration");
        apply(conn, step).await?;
    }

    debug!(version = latest_version(), "Schema up to date");
    Ok(())
}

async fn apply(conn: &Connection, step: &Step) -> Result<(), DatabaseError> {
    let fail = |stage: &str, e: libsql::Error| {
        DatabaseError::Migration(format!("V{} ({}) {stage}: {e}", step.version, step.name))
    };

    let tx = conn.transaction().await.map_err(|e| fail("begin", e))?;

    let result = async {
        tx.execute_batch(step.sql).await?;
        tx.execute(
            "INSERT INTO schema_version (version, name) VALUES (?1, ?2)",
            params![step.version, step.name],
        )
        .await?;
        Ok::<(), libsql::Error>(())
    }
    .await;

    match result {
        Ok(()) => tx.commit().await.map_err(|e| fail("commit", e)),
        Err(e) => {
            let _ = tx.rollback().await;
            Err(fail("apply", e))
        }
    }
}

/// Highest recorded version, or 0 on a fresh database.
async fn applied_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM schema_version", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;

    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?
    else {
        return Ok(0);
    };

    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(format!("parse schema version: {e}")))
}
