//! Channel transport: the I/O boundary to the chat platform.
//!
//! Transports are pure I/O: list channels, fetch messages after a cursor,
//! and apply moderation actions. Decision logic lives elsewhere.

pub mod graph;

pub use graph::{GraphConfig, GraphTransport};

use std::cmp::Ordering;
use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::TransportError;
use crate::policy::ModerationAction;

/// Channel-scoped message identifier.
///
/// Purely numeric ids (Teams uses epoch milliseconds) compare numerically;
/// anything else compares lexicographically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn numeric_digits(&self) -> Option<&str> {
        if !self.0.is_empty() && self.0.bytes().all(|b| b.is_ascii_digit()) {
            let trimmed = self.0.trim_start_matches('0');
            Some(if trimmed.is_empty() { "0" } else { trimmed })
        } else {
            None
        }
    }
}

impl Ord for MessageId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.numeric_digits(), other.numeric_digits()) {
            (Some(a), Some(b)) => a
                .len()
                .cmp(&b.len())
                .then_with(|| a.cmp(b))
                .then_with(|| self.0.cmp(&other.0)),
            _ => self.0.cmp(&other.0),
        }
    }
}

impl PartialOrd for MessageId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A channel as listed by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRef {
    pub id: String,
    pub name: String,
}

/// A fetched chat message. Read-only once fetched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub channel_id: String,
    pub channel_name: String,
    pub author_id: String,
    pub author_name: String,
    /// Plain-text body (markup already stripped).
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// What a flag/archive call actually did upstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    /// The platform recorded the mark.
    Marked,
    /// The platform has no marking API; the action was logged only.
    LoggedOnly,
}

/// Trait for channel transports.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Transport name for logs (e.g. "graph").
    fn name(&self) -> &str;

    /// List every channel visible to the transport.
    async fn list_channels(&self) -> Result<Vec<ChannelRef>, TransportError>;

    /// Fetch messages with id strictly greater than `after` (all, if `None`).
    async fn fetch_messages(
        &self,
        channel: &ChannelRef,
        after: Option<&MessageId>,
    ) -> Result<Vec<Message>, TransportError>;

    /// Whether the message still exists upstream.
    async fn message_exists(
        &self,
        channel: &ChannelRef,
        message_id: &MessageId,
    ) -> Result<bool, TransportError>;

    /// Delete a message. May fail with `DeletionForbidden`.
    async fn delete_message(
        &self,
        channel: &ChannelRef,
        message_id: &MessageId,
    ) -> Result<(), TransportError>;

    /// Lightweight flag/archive marking. Default is logging only.
    async fn mark_message(
        &self,
        channel: &ChannelRef,
        message_id: &MessageId,
        action: ModerationAction,
    ) -> Result<MarkOutcome, TransportError> {
        info!(
            transport = self.name(),
            channel = %channel.name,
            message_id = %message_id,
            action = action.label(),
            "Message marked (log only)"
        );
        Ok(MarkOutcome::LoggedOnly)
    }
}

/// Run a transport call under a deadline; an elapsed deadline is `Timeout`.
pub async fn bounded<T>(
    limit: Duration,
    call: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::Timeout(limit)),
    }
}

/// Strip HTML tags from message content and normalize whitespace.
pub fn strip_html(html: &str) -> String {
    let mut result = String::new();
    let mut in_tag = false;
    for ch in html.chars() {
        match ch {
            '<' => in_tag = true,
            '>' => in_tag = false,
            _ if !in_tag => result.push(ch),
            _ => {}
        }
    }
    let decoded = result
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");
    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}
