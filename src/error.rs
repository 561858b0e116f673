//! Error types for the moderator.
//!
//! Every layer gets its own enum so call sites can decide at the smallest
//! scope whether a failure is fatal. `ErrorClass` is what ends up in the
//! structured log lines.

use std::time::Duration;

/// How a failure is treated by the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Logged and retried next call or next cycle.
    Transient,
    /// Expected steady-state restriction (e.g. deletion not permitted).
    Permission,
    /// Bad or missing configuration. Fatal at startup only.
    Configuration,
    /// Out-of-range or malformed input; clamped or defaulted.
    DataQuality,
}

impl ErrorClass {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permission => "permission",
            Self::Configuration => "configuration",
            Self::DataQuality => "data_quality",
        }
    }
}

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Classifier error: {0}")]
    Classifier(#[from] ClassifierError),

    #[error("Notify error: {0}")]
    Notify(#[from] NotifyError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Configuration document not found: {0}")]
    NotFound(String),

    #[error("Failed to parse {document}: {reason}")]
    ParseError { document: String, reason: String },

    #[error("Duplicate policy rule for category {0}")]
    DuplicateRule(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Channel transport errors.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport lacks permission to delete message {message_id}: {reason}")]
    DeletionForbidden { message_id: String, reason: String },

    #[error("Message {message_id} not found")]
    MessageNotFound { message_id: String },

    #[error("Channel {channel} not found upstream")]
    ChannelNotFound { channel: String },

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl TransportError {
    /// Short label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::DeletionForbidden { .. } => "deletion_forbidden",
            Self::MessageNotFound { .. } => "message_not_found",
            Self::ChannelNotFound { .. } => "channel_not_found",
            Self::Auth(_) => "auth",
            Self::Unavailable(_) => "unavailable",
            Self::Timeout(_) => "timeout",
            Self::Http(_) => "http",
            Self::InvalidResponse(_) => "invalid_response",
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::DeletionForbidden { .. } => ErrorClass::Permission,
            Self::ChannelNotFound { .. } => ErrorClass::Configuration,
            _ => ErrorClass::Transient,
        }
    }
}

/// Classifier backend errors.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClassifierError {
    #[error("Classifier {source_name} unavailable: {reason}")]
    Unavailable { source_name: String, reason: String },

    #[error("Classifier {source_name} timed out after {after:?}")]
    Timeout { source_name: String, after: Duration },

    #[error("Invalid response from classifier {source_name}: {reason}")]
    InvalidResponse { source_name: String, reason: String },

    #[error("All {count} classifier backends failed")]
    AllFailed { count: usize },
}

impl ClassifierError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Unavailable { .. } => "classifier_unavailable",
            Self::Timeout { .. } => "classifier_timeout",
            Self::InvalidResponse { .. } => "classifier_invalid_response",
            Self::AllFailed { .. } => "classifier_all_failed",
        }
    }
}

/// Notification delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum NotifyError {
    #[error("Notifier {name} failed: {reason}")]
    SendFailed { name: String, reason: String },

    #[error("Notifier {name} misconfigured: {reason}")]
    Misconfigured { name: String, reason: String },
}

/// Result type alias for the moderator.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deletion_forbidden_is_permission_class() {
        let err = TransportError::DeletionForbidden {
            message_id: "1".into(),
            reason: "412".into(),
        };
        assert_eq!(err.class(), ErrorClass::Permission);
        assert_eq!(err.kind(), "deletion_forbidden");
    }

    #[test]
    fn network_errors_are_transient() {
        assert_eq!(
            TransportError::Unavailable("503".into()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            TransportError::Timeout(Duration::from_secs(3)).class(),
            ErrorClass::Transient
        );
    }

    #[test]
    fn channel_gone_is_configuration_class() {
        let err = TransportError::ChannelNotFound {
            channel: "general".into(),
        };
        assert_eq!(err.class().label(), "configuration");
    }

    #[test]
    fn top_level_wraps_layer_errors() {
        let err: Error = ConfigError::MissingEnvVar("TEAMS_TEAM_ID".into()).into();
        assert!(err.to_string().contains("TEAMS_TEAM_ID"));
    }
}
