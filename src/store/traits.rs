//! `ModerationStore`: the async persistence interface.
//!
//! Two concerns live here: the per-channel cursor (high-water mark of
//! processed messages) and the append-only decision audit log. They share a
//! trait because they must be committed together.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::executor::ActionOutcome;
use crate::moderation::Decision;
use crate::transport::MessageId;

/// Durable per-channel position.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Cursor {
    pub channel_id: String,
    /// Last message processed (or deliberately skipped).
    pub message_id: MessageId,
    pub message_created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One row of the audit log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub id: Uuid,
    #[serde(flatten)]
    pub decision: Decision,
    /// What was actually done upstream.
    pub outcome: ActionOutcome,
    pub dry_run: bool,
    pub decided_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn new(decision: Decision, outcome: ActionOutcome, dry_run: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            decision,
            outcome,
            dry_run,
            decided_at: Utc::now(),
        }
    }
}

/// Backend-agnostic store for cursors and the audit log.
#[async_trait]
pub trait ModerationStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Cursors ─────────────────────────────────────────────────────

    /// Current cursor for a channel, if it has ever been advanced.
    async fn get_cursor(&self, channel_id: &str) -> Result<Option<Cursor>, DatabaseError>;

    /// All cursors, ordered by channel id.
    async fn list_cursors(&self) -> Result<Vec<Cursor>, DatabaseError>;

    /// Move a channel's cursor forward without recording a decision.
    ///
    /// Returns `false` (and leaves the cursor alone) when `message_id` is not
    /// strictly ahead of the stored position.
    async fn advance_cursor(
        &self,
        channel_id: &str,
        message_id: &MessageId,
        message_created_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    // ── Audit log ───────────────────────────────────────────────────

    /// Append an audit row and advance the cursor to its message, atomically.
    ///
    /// Returns whether the cursor moved.
    async fn commit_decision(
        &self,
        record: &AuditRecord,
        message_created_at: DateTime<Utc>,
    ) -> Result<bool, DatabaseError>;

    /// Whether a decision was already recorded for this message.
    async fn has_audit(&self, channel_id: &str, message_id: &MessageId)
    -> Result<bool, DatabaseError>;

    /// The recorded decision for a message.
    async fn get_audit(
        &self,
        channel_id: &str,
        message_id: &MessageId,
    ) -> Result<Option<AuditRecord>, DatabaseError>;

    /// Most recent audit rows, newest first.
    async fn recent_audits(&self, limit: usize) -> Result<Vec<AuditRecord>, DatabaseError>;
}
