//! libSQL backend for [`ModerationStore`].
//!
//! Supports local file and in-memory databases. A single connection is
//! shared; writes that span statements run inside a transaction and are
//! serialized by `write_lock` so concurrent channel tasks cannot interleave
//! inside each other's transaction.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::executor::ActionOutcome;
use crate::moderation::Decision;
use crate::policy::{Category, ModerationAction};
use crate::store::migrations;
use crate::store::traits::{AuditRecord, Cursor, ModerationStore};
use crate::transport::MessageId;

/// libSQL database backend.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and `--once` dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let backend = Self::from_database(db)?;
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
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

/// Convert `Option<&str>` to libsql Value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

const CURSOR_COLUMNS: &str = "channel_id, message_id, message_created_at, updated_at";

const AUDIT_COLUMNS: &str = "id, channel_id, message_id, action, outcome, category, severity, notify, degraded, dry_run, rationale, policy_version, decided_at";

fn row_to_cursor(row: &libsql::Row) -> Result<Cursor, libsql::Error> {
    let message_id: String = row.get(1)?;
    let created_str: String = row.get(2)?;
    let updated_str: String = row.get(3)?;
    Ok(Cursor {
        channel_id: row.get(0)?,
        message_id: MessageId::new(message_id),
        message_created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

fn row_to_audit(row: &libsql::Row) -> Result<AuditRecord, DatabaseError> {
    let parse_err = |e: libsql::Error| DatabaseError::Query(format!("audit row parse: {e}"));

    let id_str: String = row.get(0).map_err(parse_err)?;
    let action_str: String = row.get(3).map_err(parse_err)?;
    let outcome_str: String = row.get(4).map_err(parse_err)?;
    let category: Option<String> = row.get::<String>(5).ok();
    let decided_str: String = row.get(12).map_err(parse_err)?;

    let id = Uuid::parse_str(&id_str)
        .map_err(|e| DatabaseError::Serialization(format!("audit id {id_str}: {e}")))?;
    let action = ModerationAction::parse(&action_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown action {action_str}")))?;
    let outcome = ActionOutcome::parse(&outcome_str)
        .ok_or_else(|| DatabaseError::Serialization(format!("unknown outcome {outcome_str}")))?;

    let decision = Decision {
        message_id: MessageId::new(row.get::<String>(2).map_err(parse_err)?),
        channel_id: row.get(1).map_err(parse_err)?,
        action,
        category: category.as_deref().map(Category::parse),
        severity: row.get(6).map_err(parse_err)?,
        notify: row.get::<i64>(7).map_err(parse_err)? != 0,
        degraded: row.get::<i64>(8).map_err(parse_err)? != 0,
        rationale: row.get(10).map_err(parse_err)?,
        policy_version: row.get(11).map_err(parse_err)?,
    };

    Ok(AuditRecord {
        id,
        decision,
        outcome,
        dry_run: row.get::<i64>(9).map_err(parse_err)? != 0,
        decided_at: parse_datetime(&decided_str),
    })
}

/// Stored cursor position for a channel, read on the given connection
/// (which may be a transaction).
async fn stored_position(
    conn: &Connection,
    channel_id: &str,
) -> Result<Option<MessageId>, DatabaseError> {
    let mut rows = conn
        .query(
            "SELECT message_id FROM cursors WHERE channel_id = ?1",
            params![channel_id],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("stored_position: {e}")))?;

    match rows.next().await {
        Ok(Some(row)) => {
            let id: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("stored_position row parse: {e}")))?;
            Ok(Some(MessageId::new(id)))
        }
        Ok(None) => Ok(None),
        Err(e) => Err(DatabaseError::Query(format!("stored_position: {e}"))),
    }
}

/// Upsert the cursor if `message_id` is strictly ahead. Returns whether it moved.
async fn move_cursor_forward(
    conn: &Connection,
    channel_id: &str,
    message_id: &MessageId,
    message_created_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    if let Some(current) = stored_position(conn, channel_id).await?
        && *message_id <= current
    {
        if *message_id < current {
            warn!(
                channel = channel_id,
                message_id = %message_id,
                cursor = %current,
                error_kind = "data_quality",
                "Refusing to move cursor backwards"
            );
        }
        return Ok(false);
    }

    conn.execute(
        "INSERT INTO cursors (channel_id, message_id, message_created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(channel_id) DO UPDATE SET
            message_id = excluded.message_id,
            message_created_at = excluded.message_created_at,
            updated_at = excluded.updated_at",
        params![
            channel_id,
            message_id.as_str(),
            message_created_at.to_rfc3339(),
            Utc::now().to_rfc3339()
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("move_cursor_forward: {e}")))?;

    Ok(true)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl ModerationStore for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Cursors ─────────────────────────────────────────────────────

    async fn get_cursor(&self, channel_id: &str) -> Result<Option<Cursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CURSOR_COLUMNS} FROM cursors WHERE channel_id = ?1"),
                params![channel_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_cursor: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let cursor = row_to_cursor(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_cursor row parse: {e}")))?;
                Ok(Some(cursor))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_cursor: {e}"))),
        }
    }

    async fn list_cursors(&self) -> Result<Vec<Cursor>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {CURSOR_COLUMNS} FROM cursors ORDER BY channel_id"),
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?;

        let mut cursors = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_cursors: {e}")))?
        {
            cursors.push(
                row_to_cursor(&row)
                    .map_err(|e| DatabaseError::Query(format!("list_cursors row parse: {e}")))?,
            );
        }
        Ok(cursors)
    }

    async fn advance_cursor(
        &self,
        channel_id: &str,
        message_id: &MessageId,
        message_created_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_cursor begin: {e}")))?;

        let moved = move_cursor_forward(&tx, channel_id, message_id, message_created_at).await?;

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_cursor commit: {e}")))?;

        debug!(channel = channel_id, message_id = %message_id, moved, "Cursor advanced");
        Ok(moved)
    }

    // ── Audit log ───────────────────────────────────────────────────

    async fn commit_decision(
        &self,
        record: &AuditRecord,
        message_created_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError> {
        let d = &record.decision;

        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_decision begin: {e}")))?;

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO audit_log ({AUDIT_COLUMNS})
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    record.id.to_string(),
                    d.channel_id.as_str(),
                    d.message_id.as_str(),
                    d.action.label(),
                    record.outcome.label(),
                    opt_text(d.category.as_ref().map(|c| c.as_str())),
                    d.severity,
                    d.notify as i64,
                    d.degraded as i64,
                    record.dry_run as i64,
                    d.rationale.as_str(),
                    d.policy_version.as_str(),
                    record.decided_at.to_rfc3339()
                ],
            )
            .await;

        if let Err(e) = inserted {
            let _ = tx.rollback().await;
            return Err(DatabaseError::Query(format!("commit_decision insert: {e}")));
        }

        let moved = move_cursor_forward(&tx, &d.channel_id, &d.message_id, message_created_at).await;
        let moved = match moved {
            Ok(moved) => moved,
            Err(e) => {
                let _ = tx.rollback().await;
                return Err(e);
            }
        };

        tx.commit()
            .await
            .map_err(|e| DatabaseError::Query(format!("commit_decision commit: {e}")))?;

        Ok(moved)
    }

    async fn has_audit(
        &self,
        channel_id: &str,
        message_id: &MessageId,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM audit_log WHERE channel_id = ?1 AND message_id = ?2 LIMIT 1",
                params![channel_id, message_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("has_audit: {e}")))?;

        match rows.next().await {
            Ok(row) => Ok(row.is_some()),
            Err(e) => Err(DatabaseError::Query(format!("has_audit: {e}"))),
        }
    }

    async fn get_audit(
        &self,
        channel_id: &str,
        message_id: &MessageId,
    ) -> Result<Option<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log WHERE channel_id = ?1 AND message_id = ?2"
                ),
                params![channel_id, message_id.as_str()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_audit: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_audit(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_audit: {e}"))),
        }
    }

    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AUDIT_COLUMNS} FROM audit_log ORDER BY decided_at DESC, rowid DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_audits: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_audits: {e}")))?
        {
            records.push(row_to_audit(&row)?);
        }
        Ok(records)
    }
}
