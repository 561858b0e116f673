//! Teams incoming-webhook notifier (adaptive card).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::debug;

use super::{NotificationPayload, Notifier, Urgency};
use crate::error::NotifyError;

pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            url: url.into(),
            client,
        }
    }

    /// Read `NOTIFICATION_WEBHOOK_URL`; `None` when unset.
    pub fn from_env(timeout: Duration) -> Option<Self> {
        std::env::var("NOTIFICATION_WEBHOOK_URL")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .map(|url| Self::new(url, timeout))
    }
}

fn urgency_marker(urgency: Urgency) -> (&'static str, &'static str) {
    match urgency {
        Urgency::High => ("🔴", "attention"),
        Urgency::Medium => ("🟡", "warning"),
        Urgency::Low => ("🟢", "good"),
    }
}

/// Build the adaptive card message body.
pub fn build_card(payload: &NotificationPayload) -> Value {
    let (emoji, color) = urgency_marker(payload.urgency);

    let mut facts = vec![
        json!({"title": "Severity:", "value": format!("{} ({:.2})", payload.urgency.label().to_uppercase(), payload.severity)}),
        json!({"title": "Category:", "value": payload.category.as_deref().unwrap_or("unclassified")}),
        json!({"title": "Author:", "value": payload.author}),
        json!({"title": "Channel:", "value": payload.channel_name}),
        json!({"title": "Action Taken:", "value": payload.action_taken}),
        json!({"title": "Posted:", "value": payload.posted_at.to_rfc3339()}),
    ];
    if payload.degraded {
        facts.push(json!({"title": "Signal:", "value": "partial (a classifier was unavailable)"}));
    }

    json!({
        "type": "message",
        "attachments": [{
            "contentType": "application/vnd.microsoft.card.adaptive",
            "content": {
                "$schema": "http://adaptivecards.io/schemas/adaptive-card.json",
                "type": "AdaptiveCard",
                "version": "1.4",
                "body": [
                    {
                        "type": "TextBlock",
                        "text": format!("{emoji} {}", payload.subject()),
                        "weight": "bolder",
                        "size": "large",
                        "color": color,
                        "wrap": true
                    },
                    {"type": "FactSet", "facts": facts},
                    {
                        "type": "TextBlock",
                        "text": format!("\"{}\"", payload.snippet),
                        "wrap": true,
                        "separator": true
                    },
                    {
                        "type": "TextBlock",
                        "text": payload.rationale,
                        "isSubtle": true,
                        "wrap": true
                    }
                ],
                "msteams": {"width": "Full"}
            }
        }]
    })
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(&self.url)
            .json(&build_card(payload))
            .send()
            .await
            .map_err(|e| NotifyError::SendFailed {
                name: "webhook".into(),
                reason: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(NotifyError::SendFailed {
                name: "webhook".into(),
                reason: format!("HTTP {status}"),
            });
        }

        debug!(message_id = %payload.message_id, "Webhook notification delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::tests::sample_payload;

    #[test]
    fn card_has_adaptive_shape() {
        let card = build_card(&sample_payload());
        let content = &card["attachments"][0]["content"];
        assert_eq!(content["type"], "AdaptiveCard");
        assert_eq!(content["body"][0]["color"], "attention");
        let facts = content["body"][1]["facts"].as_array().unwrap();
        assert!(facts.iter().any(|f| f["value"] == "Pat Doe"));
        assert_eq!(content["body"][2]["text"], "\"[Content redacted due to severe violation]\"");
    }

    #[test]
    fn degraded_adds_signal_fact() {
        let mut payload = sample_payload();
        payload.degraded = true;
        let card = build_card(&payload);
        let facts = card["attachments"][0]["content"]["body"][1]["facts"]
            .as_array()
            .unwrap()
            .clone();
        assert!(facts.iter().any(|f| f["title"] == "Signal:"));
    }
}
