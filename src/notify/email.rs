//! SMTP email notifier via lettre.

use async_trait::async_trait;
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use secrecy::{ExposeSecret, SecretString};
use tracing::info;

use super::{NotificationPayload, Notifier};
use crate::error::{ConfigError, NotifyError};

#[derive(Debug, Clone)]
pub struct EmailConfig {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub username: String,
    pub password: SecretString,
    pub from_address: String,
    pub recipients: Vec<String>,
}

impl EmailConfig {
    /// Build from `NOTIFICATION_EMAIL` (comma-separated recipients) and the
    /// `SMTP_*` variables. `Ok(None)` when no recipient is configured.
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let Some(recipients) = std::env::var("NOTIFICATION_EMAIL")
            .ok()
            .filter(|v| !v.trim().is_empty())
        else {
            return Ok(None);
        };

        let required = |key: &str| {
            std::env::var(key)
                .ok()
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
        };

        let smtp_port = match std::env::var("SMTP_PORT") {
            Ok(raw) => raw.parse().map_err(|e| ConfigError::InvalidValue {
                key: "SMTP_PORT".into(),
                message: format!("{e}"),
            })?,
            Err(_) => 587,
        };

        let username = required("SMTP_USERNAME")?;
        Ok(Some(Self {
            smtp_host: required("SMTP_HOST")?,
            smtp_port,
            from_address: std::env::var("SMTP_FROM").unwrap_or_else(|_| username.clone()),
            username,
            password: SecretString::from(required("SMTP_PASSWORD")?),
            recipients: recipients
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        }))
    }
}

pub struct EmailNotifier {
    config: EmailConfig,
}

impl EmailNotifier {
    pub fn new(config: EmailConfig) -> Self {
        Self { config }
    }
}

fn send_failed(reason: String) -> NotifyError {
    NotifyError::SendFailed {
        name: "email".into(),
        reason,
    }
}

/// Build the message. Kept separate from sending so it can be tested offline.
fn build_message(config: &EmailConfig, payload: &NotificationPayload) -> Result<Message, NotifyError> {
    let mut builder = Message::builder()
        .from(config.from_address.parse().map_err(|e| NotifyError::Misconfigured {
            name: "email".into(),
            reason: format!("Invalid from address: {e}"),
        })?)
        .subject(payload.subject());

    for to in &config.recipients {
        builder = builder.to(to.parse().map_err(|e| NotifyError::Misconfigured {
            name: "email".into(),
            reason: format!("Invalid to address {to}: {e}"),
        })?);
    }

    builder
        .body(payload.text_body())
        .map_err(|e| send_failed(format!("Failed to build email: {e}")))
}

/// Send an email via SMTP (blocking).
fn send_email(config: &EmailConfig, email: &Message) -> Result<(), NotifyError> {
    let creds = Credentials::new(
        config.username.clone(),
        config.password.expose_secret().to_string(),
    );

    let transport = SmtpTransport::relay(&config.smtp_host)
        .map_err(|e| send_failed(format!("SMTP relay error: {e}")))?
        .port(config.smtp_port)
        .credentials(creds)
        .build();

    transport
        .send(email)
        .map_err(|e| send_failed(format!("SMTP send failed: {e}")))?;
    Ok(())
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn notify(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let email = build_message(&self.config, payload)?;
        let config = self.config.clone();

        tokio::task::spawn_blocking(move || send_email(&config, &email))
            .await
            .map_err(|e| send_failed(format!("SMTP task panicked: {e}")))??;

        info!(
            recipients = self.config.recipients.len(),
            message_id = %payload.message_id,
            "Email notification sent"
        );
        Ok(())
    }
}
