//! Action executor.
//!
//! Turns a [`Decision`] into upstream side effects: delete, mark, or nothing,
//! followed by an optional notification. A refused or already-gone delete is
//! an outcome and gets recorded. Any other delete error is handed back to the
//! poller so the message is decided again next cycle.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Serialize, Serializer};
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::moderation::Decision;
use crate::notify::{NotificationPayload, Notifier, Urgency};
use crate::policy::{ModerationAction, ThresholdScale};
use crate::transport::{ChannelRef, ChannelTransport, MarkOutcome, Message, bounded};

const REDACTED: &str = "[Content redacted due to severe violation]";
const SNIPPET_CHARS: usize = 100;
const DEFAULT_TRANSPORT_TIMEOUT: Duration = Duration::from_secs(30);

/// What actually happened upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionOutcome {
    Allowed,
    Flagged,
    Archived,
    Deleted,
    /// Delete requested but the message was already gone.
    AlreadyDeleted,
    /// Platform refused the delete; treated as flagged.
    DeleteForbidden,
    /// Monitor mode; nothing was touched.
    DryRun { would: ModerationAction },
}

impl ActionOutcome {
    /// Stable label used in the audit log.
    pub fn label(&self) -> String {
        match self {
            Self::Allowed => "allowed".into(),
            Self::Flagged => "flagged".into(),
            Self::Archived => "archived".into(),
            Self::Deleted => "deleted".into(),
            Self::AlreadyDeleted => "already_deleted".into(),
            Self::DeleteForbidden => "delete_forbidden".into(),
            Self::DryRun { would } => format!("dry_run:{}", would.label()),
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        if let Some(would) = s.strip_prefix("dry_run:") {
            return ModerationAction::parse(would).map(|would| Self::DryRun { would });
        }
        match s {
            "allowed" => Some(Self::Allowed),
            "flagged" => Some(Self::Flagged),
            "archived" => Some(Self::Archived),
            "deleted" => Some(Self::Deleted),
            "already_deleted" => Some(Self::AlreadyDeleted),
            "delete_forbidden" => Some(Self::DeleteForbidden),
            _ => None,
        }
    }

    /// The moderation state the message effectively ended up in.
    pub fn effective_action(&self) -> ModerationAction {
        match self {
            Self::Allowed => ModerationAction::Allow,
            Self::Flagged | Self::DeleteForbidden => ModerationAction::Flag,
            Self::Archived => ModerationAction::Archive,
            Self::Deleted | Self::AlreadyDeleted => ModerationAction::Delete,
            Self::DryRun { would } => *would,
        }
    }

    /// Human-readable description for notifications.
    pub fn describe(&self) -> String {
        match self {
            Self::Allowed => "allowed (logged only)".into(),
            Self::Flagged => "flagged".into(),
            Self::Archived => "archived".into(),
            Self::Deleted => "deleted".into(),
            Self::AlreadyDeleted => "already deleted".into(),
            Self::DeleteForbidden => "flagged (deletion not permitted)".into(),
            Self::DryRun { would } => format!("none (monitor mode, would {would})"),
        }
    }
}

impl fmt::Display for ActionOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.label())
    }
}

impl Serialize for ActionOutcome {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.label())
    }
}

/// Result of executing one decision.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionResult {
    pub outcome: ActionOutcome,
    /// A notification was delivered.
    pub notified: bool,
}

/// Sanitize a message body for inclusion in a notification.
pub fn sanitize_snippet(body: &str, severity: f64, scale: &ThresholdScale) -> String {
    if severity >= scale.high {
        return REDACTED.to_string();
    }
    if body.chars().count() > SNIPPET_CHARS {
        let head: String = body.chars().take(SNIPPET_CHARS).collect();
        return format!("{head}... [truncated]");
    }
    body.to_string()
}

fn urgency_for(severity: f64, scale: &ThresholdScale) -> Urgency {
    if severity >= scale.high {
        Urgency::High
    } else if severity >= scale.medium {
        Urgency::Medium
    } else {
        Urgency::Low
    }
}

pub struct ActionExecutor {
    transport: Arc<dyn ChannelTransport>,
    notifier: Arc<dyn Notifier>,
    dry_run: bool,
    transport_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        notifier: Arc<dyn Notifier>,
        dry_run: bool,
    ) -> Self {
        Self {
            transport,
            notifier,
            dry_run,
            transport_timeout: DEFAULT_TRANSPORT_TIMEOUT,
        }
    }

    /// Bound every transport call made by the executor.
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout = timeout;
        self
    }

    async fn call<T>(
        &self,
        fut: impl Future<Output = Result<T, TransportError>>,
    ) -> Result<T, TransportError> {
        bounded(self.transport_timeout, fut).await
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    /// Apply a decision to its message and notify if the decision asks for it.
    ///
    /// `Err` means the delete hit a transient error. Nothing was notified and
    /// the decision must not be recorded.
    pub async fn execute(
        &self,
        decision: &Decision,
        message: &Message,
        scale: &ThresholdScale,
    ) -> Result<ExecutionResult, TransportError> {
        if self.dry_run {
            info!(
                channel = %message.channel_name,
                message_id = %message.id,
                action = %decision.action,
                notify = decision.notify,
                "Dry run: no action taken"
            );
            return Ok(ExecutionResult {
                outcome: ActionOutcome::DryRun {
                    would: decision.action,
                },
                notified: false,
            });
        }

        let channel = ChannelRef {
            id: message.channel_id.clone(),
            name: message.channel_name.clone(),
        };

        let outcome = match decision.action {
            ModerationAction::Allow => ActionOutcome::Allowed,
            ModerationAction::Delete => self.delete(&channel, message).await?,
            action @ (ModerationAction::Flag | ModerationAction::Archive) => {
                self.mark(&channel, message, action).await
            }
        };

        info!(
            channel = %message.channel_name,
            message_id = %message.id,
            category = decision.category.as_ref().map(|c| c.as_str()).unwrap_or("none"),
            severity = decision.severity,
            action = %decision.action,
            outcome = %outcome,
            degraded = decision.degraded,
            "Decision executed"
        );

        let notified = if decision.notify {
            self.send_notification(decision, message, outcome, scale)
                .await
        } else {
            false
        };

        Ok(ExecutionResult { outcome, notified })
    }

    async fn delete(
        &self,
        channel: &ChannelRef,
        message: &Message,
    ) -> Result<ActionOutcome, TransportError> {
        match self
            .call(self.transport.message_exists(channel, &message.id))
            .await
        {
            Ok(false) => {
                debug!(message_id = %message.id, "Message already gone; delete is a no-op");
                return Ok(ActionOutcome::AlreadyDeleted);
            }
            Ok(true) => {}
            Err(e) => {
                debug!(
                    message_id = %message.id,
                    error = %e,
                    "Existence check failed; attempting delete anyway"
                );
            }
        }

        match self
            .call(self.transport.delete_message(channel, &message.id))
            .await
        {
            Ok(()) => Ok(ActionOutcome::Deleted),
            Err(TransportError::MessageNotFound { .. }) => Ok(ActionOutcome::AlreadyDeleted),
            Err(e @ TransportError::DeletionForbidden { .. }) => {
                info!(
                    channel = %channel.name,
                    message_id = %message.id,
                    error = %e,
                    error_kind = e.kind(),
                    fatal = false,
                    "Deletion not permitted; recording as flagged"
                );
                Ok(ActionOutcome::DeleteForbidden)
            }
            Err(e) => Err(e),
        }
    }

    async fn mark(
        &self,
        channel: &ChannelRef,
        message: &Message,
        action: ModerationAction,
    ) -> ActionOutcome {
        match self
            .call(self.transport.mark_message(channel, &message.id, action))
            .await
        {
            Ok(MarkOutcome::Marked) | Ok(MarkOutcome::LoggedOnly) => {}
            Err(e) => warn!(
                channel = %channel.name,
                message_id = %message.id,
                action = %action,
                error = %e,
                error_kind = e.kind(),
                fatal = false,
                "Marking failed; decision still recorded"
            ),
        }
        if action == ModerationAction::Archive {
            ActionOutcome::Archived
        } else {
            ActionOutcome::Flagged
        }
    }

    async fn send_notification(
        &self,
        decision: &Decision,
        message: &Message,
        outcome: ActionOutcome,
        scale: &ThresholdScale,
    ) -> bool {
        let payload = NotificationPayload {
            message_id: message.id.to_string(),
            channel_id: message.channel_id.clone(),
            channel_name: message.channel_name.clone(),
            author: message.author_name.clone(),
            category: decision.category.as_ref().map(|c| c.to_string()),
            severity: decision.severity,
            urgency: urgency_for(decision.severity, scale),
            requested_action: decision.action.to_string(),
            action_taken: outcome.describe(),
            snippet: sanitize_snippet(&message.body, decision.severity, scale),
            rationale: decision.rationale.clone(),
            degraded: decision.degraded,
            posted_at: message.created_at,
        };

        match self.notifier.notify(&payload).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    notifier = self.notifier.name(),
                    message_id = %message.id,
                    error = %e,
                    fatal = false,
                    "Notification failed; action stands"
                );
                false
            }
        }
    }
}
