//! Violation notifications.
//!
//! A [`Notifier`] receives a [`NotificationPayload`] that already contains a
//! sanitized snippet; notifiers never see the raw message body.

pub mod email;
pub mod webhook;

pub use email::{EmailConfig, EmailNotifier};
pub use webhook::WebhookNotifier;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::NotifyError;

/// Coarse urgency, derived from severity against the policy tier cuts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Everything a notifier needs to describe one violation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NotificationPayload {
    pub message_id: String,
    pub channel_id: String,
    pub channel_name: String,
    pub author: String,
    /// Triggering category, if any rule fired.
    pub category: Option<String>,
    pub severity: f64,
    pub urgency: Urgency,
    /// Action the policy asked for.
    pub requested_action: String,
    /// What actually happened (e.g. "flagged (deletion not permitted)").
    pub action_taken: String,
    /// Sanitized excerpt; redacted entirely for severe violations.
    pub snippet: String,
    pub rationale: String,
    pub degraded: bool,
    pub posted_at: DateTime<Utc>,
}

impl NotificationPayload {
    /// One-line subject for email and card titles.
    pub fn subject(&self) -> String {
        format!(
            "Content policy violation: {} ({})",
            self.category.as_deref().unwrap_or("unclassified"),
            self.urgency.label().to_uppercase()
        )
    }

    /// Plain-text body shared by the email and log notifiers.
    pub fn text_body(&self) -> String {
        let mut body = format!(
            "A policy violation was detected.\n\n\
             Category: {}\n\
             Severity: {:.2} ({})\n\
             Author: {}\n\
             Channel: {}\n\
             Posted: {}\n\
             Action taken: {}\n\
             Message id: {}\n\n\
             Excerpt: \"{}\"\n\n\
             Reason: {}\n",
            self.category.as_deref().unwrap_or("unclassified"),
            self.severity,
            self.urgency.label(),
            self.author,
            self.channel_name,
            self.posted_at.to_rfc3339(),
            self.action_taken,
            self.message_id,
            self.snippet,
            self.rationale,
        );
        if self.degraded {
            body.push_str("\nNote: decided on partial classifier signal.\n");
        }
        body
    }
}

/// A notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Notifier name for logs.
    fn name(&self) -> &str;

    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Writes the notification to the log only.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        info!(
            channel = %payload.channel_name,
            message_id = %payload.message_id,
            category = payload.category.as_deref().unwrap_or("none"),
            severity = payload.severity,
            urgency = payload.urgency.label(),
            action = %payload.action_taken,
            "Violation notification"
        );
        Ok(())
    }
}

/// Sends to every child; fails only when all of them fail.
pub struct FanoutNotifier {
    children: Vec<Arc<dyn Notifier>>,
}

impl FanoutNotifier {
    pub fn new(children: Vec<Arc<dyn Notifier>>) -> Self {
        Self { children }
    }

    pub fn names(&self) -> Vec<String> {
        self.children.iter().map(|c| c.name().to_string()).collect()
    }
}

#[async_trait]
impl Notifier for FanoutNotifier {
    fn name(&self) -> &str {
        "fanout"
    }

    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        if self.children.is_empty() {
            return Ok(());
        }

        let results = join_all(self.children.iter().map(|c| c.notify(payload))).await;

        let mut failures = Vec::new();
        for (child, result) in self.children.iter().zip(results) {
            if let Err(e) = result {
                warn!(notifier = child.name(), error = %e, "Notifier failed");
                failures.push(format!("{}: {e}", child.name()));
            }
        }

        if failures.len() == self.children.len() {
            return Err(NotifyError::SendFailed {
                name: "fanout".into(),
                reason: failures.join("; "),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    pub(crate) fn sample_payload() -> NotificationPayload {
        NotificationPayload {
            message_id: "1700000000001".into(),
            channel_id: "19:general".into(),
            channel_name: "general".into(),
            author: "Pat Doe".into(),
            category: Some("hate_speech".into()),
            severity: 0.86,
            urgency: Urgency::High,
            requested_action: "delete".into(),
            action_taken: "flagged (deletion not permitted)".into(),
            snippet: "[Content redacted due to severe violation]".into(),
            rationale: "hate_speech severity 0.86 >= 0.40 (medium) -> delete".into(),
            degraded: false,
            posted_at: Utc::now(),
        }
    }

    struct Counting {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Counting {
        fn name(&self) -> &str {
            "counting"
        }
        async fn notify(&self, _payload: &NotificationPayload) -> Result<(), NotifyError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Err(NotifyError::SendFailed {
                    name: "counting".into(),
                    reason: "boom".into(),
                })
            } else {
                Ok(())
            }
        }
    }

    fn counting(fail: bool) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            fail,
        })
    }

    #[tokio::test]
    async fn fanout_succeeds_when_one_child_succeeds() {
        let ok = counting(false);
        let bad = counting(true);
        let fanout = FanoutNotifier::new(vec![ok.clone(), bad.clone()]);
        assert!(fanout.notify(&sample_payload()).await.is_ok());
        assert_eq!(ok.calls.load(Ordering::SeqCst), 1);
        assert_eq!(bad.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fanout_fails_when_all_fail() {
        let fanout = FanoutNotifier::new(vec![counting(true), counting(true)]);
        assert!(fanout.notify(&sample_payload()).await.is_err());
    }

    #[tokio::test]
    async fn empty_fanout_is_noop() {
        assert!(FanoutNotifier::new(vec![]).notify(&sample_payload()).await.is_ok());
    }

    #[test]
    fn subject_and_body_carry_context() {
        let p = sample_payload();
        assert_eq!(p.subject(), "Content policy violation: hate_speech (HIGH)");
        let body = p.text_body();
        assert!(body.contains("Author: Pat Doe"));
        assert!(body.contains("Action taken: flagged (deletion not permitted)"));
        assert!(!body.contains("partial classifier signal"));
    }
}
