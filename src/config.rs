//! Process configuration.
//!
//! Everything here comes from environment variables (CLI flags override a
//! few of them in `main`). Policy and channel selection are NOT here; they
//! live in JSON documents loaded by the policy store.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::classify::{LlmBackend, LlmConfig};
use crate::error::ConfigError;

/// Enforcement mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModerationMode {
    /// Apply actions and send notifications.
    Enforce,
    /// Decide and record only (dry run).
    Monitor,
}

impl FromStr for ModerationMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "enforce" | "" => Ok(Self::Enforce),
            "monitor" | "dry-run" | "dry_run" => Ok(Self::Monitor),
            other => Err(ConfigError::InvalidValue {
                key: "MODERATION_MODE".into(),
                message: format!("expected 'enforce' or 'monitor', got '{other}'"),
            }),
        }
    }
}

/// Core runtime settings.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Directory holding `channels.json` / `policies.json`.
    pub config_dir: PathBuf,
    pub db_path: PathBuf,
    pub mode: ModerationMode,
    pub poll_interval: Duration,
    pub cycle_budget: Duration,
    pub classify_timeout: Duration,
    pub transport_timeout: Duration,
    pub max_concurrent_channels: usize,
    pub max_backoff_multiplier: u32,
    pub backoff_jitter: f64,
    /// Serve the status API on this port when set.
    pub status_port: Option<u16>,
    /// Also write logs to this file (rotated daily).
    pub log_file: Option<PathBuf>,
    /// Run the local pattern classifier.
    pub rules_enabled: bool,
    /// Contextual LLM classifier; `None` when no API key is configured.
    pub llm: Option<LlmConfig>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup (tests use a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let parse = |key: &str| -> Result<Option<u64>, ConfigError> {
            get(key)
                .map(|raw| {
                    raw.trim().parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                        key: key.to_string(),
                        message: format!("{e}"),
                    })
                })
                .transpose()
        };
        let secs = |key: &str, default: u64| -> Result<Duration, ConfigError> {
            let value = parse(key)?.unwrap_or(default);
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".into(),
                });
            }
            Ok(Duration::from_secs(value))
        };

        let mode = match get("MODERATION_MODE") {
            Some(raw) => raw.parse()?,
            None => ModerationMode::Enforce,
        };

        let backoff_jitter = match get("MODERATOR_BACKOFF_JITTER") {
            Some(raw) => {
                let value: f64 = raw.trim().parse().map_err(|e| ConfigError::InvalidValue {
                    key: "MODERATOR_BACKOFF_JITTER".into(),
                    message: format!("{e}"),
                })?;
                if !(0.0..=1.0).contains(&value) {
                    return Err(ConfigError::InvalidValue {
                        key: "MODERATOR_BACKOFF_JITTER".into(),
                        message: format!("{value} is outside [0, 1]"),
                    });
                }
                value
            }
            None => 0.1,
        };

        let status_port = parse("MODERATOR_STATUS_PORT")?
            .map(|p| {
                u16::try_from(p).map_err(|_| ConfigError::InvalidValue {
                    key: "MODERATOR_STATUS_PORT".into(),
                    message: format!("{p} is not a valid port"),
                })
            })
            .transpose()?;

        let rules_enabled = !matches!(
            get("MODERATOR_RULES_ENABLED").as_deref().map(str::trim),
            Some("0") | Some("false") | Some("no")
        );

        Ok(Self {
            config_dir: PathBuf::from(get("MODERATOR_CONFIG_DIR").unwrap_or_else(|| "./config".into())),
            db_path: PathBuf::from(
                get("MODERATOR_DB_PATH").unwrap_or_else(|| "./data/moderator.db".into()),
            ),
            mode,
            poll_interval: secs("MODERATOR_POLL_INTERVAL_SECS", 60)?,
            cycle_budget: secs("MODERATOR_CYCLE_BUDGET_SECS", 45)?,
            classify_timeout: secs("MODERATOR_CLASSIFY_TIMEOUT_SECS", 10)?,
            transport_timeout: secs("MODERATOR_TRANSPORT_TIMEOUT_SECS", 30)?,
            max_concurrent_channels: parse("MODERATOR_MAX_CONCURRENT_CHANNELS")?
                .unwrap_or(1)
                .max(1) as usize,
            max_backoff_multiplier: parse("MODERATOR_MAX_BACKOFF_MULTIPLIER")?
                .unwrap_or(10)
                .clamp(1, u32::MAX as u64) as u32,
            backoff_jitter,
            status_port,
            log_file: get("MODERATOR_LOG_FILE").map(PathBuf::from),
            rules_enabled,
            llm: llm_from_lookup(&get)?,
        })
    }

    pub fn dry_run(&self) -> bool {
        self.mode == ModerationMode::Monitor
    }
}

/// Contextual classifier settings: `MODERATOR_LLM_BACKEND` picks the
/// provider, whose API key must be present for the classifier to run.
fn llm_from_lookup(get: &impl Fn(&str) -> Option<String>) -> Result<Option<LlmConfig>, ConfigError> {
    let backend = match get("MODERATOR_LLM_BACKEND") {
        Some(raw) => LlmBackend::parse(&raw).ok_or_else(|| ConfigError::InvalidValue {
            key: "MODERATOR_LLM_BACKEND".into(),
            message: format!("unknown backend '{raw}'"),
        })?,
        None => LlmBackend::Anthropic,
    };

    let (key_var, default_model) = match backend {
        LlmBackend::Anthropic => ("ANTHROPIC_API_KEY", "claude-3-5-haiku-latest"),
        LlmBackend::OpenAi => ("OPENAI_API_KEY", "gpt-4o-mini"),
    };

    Ok(get(key_var).map(|key| LlmConfig {
        backend,
        api_key: secrecy::SecretString::from(key),
        model: get("MODERATOR_LLM_MODEL").unwrap_or_else(|| default_model.to_string()),
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config(pairs: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|k| map.get(k).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[]).unwrap();
        assert_eq!(cfg.mode, ModerationMode::Enforce);
        assert_eq!(cfg.poll_interval, Duration::from_secs(60));
        assert_eq!(cfg.cycle_budget, Duration::from_secs(45));
        assert_eq!(cfg.classify_timeout, Duration::from_secs(10));
        assert_eq!(cfg.transport_timeout, Duration::from_secs(30));
        assert_eq!(cfg.max_concurrent_channels, 1);
        assert!(cfg.rules_enabled);
        assert!(cfg.llm.is_none());
        assert!(cfg.status_port.is_none());
    }

    #[test]
    fn monitor_mode_is_dry_run() {
        let cfg = config(&[("MODERATION_MODE", "monitor")]).unwrap();
        assert!(cfg.dry_run());
    }

    #[test]
    fn unknown_mode_rejected() {
        assert!(config(&[("MODERATION_MODE", "yolo")]).is_err());
    }

    #[test]
    fn bad_numbers_rejected() {
        assert!(config(&[("MODERATOR_POLL_INTERVAL_SECS", "soon")]).is_err());
        assert!(config(&[("MODERATOR_POLL_INTERVAL_SECS", "0")]).is_err());
        assert!(config(&[("MODERATOR_STATUS_PORT", "70000")]).is_err());
        assert!(config(&[("MODERATOR_BACKOFF_JITTER", "2")]).is_err());
    }

    #[test]
    fn llm_configured_from_key() {
        let cfg = config(&[
            ("MODERATOR_LLM_BACKEND", "openai"),
            ("OPENAI_API_KEY", "sk-test"),
        ])
        .unwrap();
        let llm = cfg.llm.unwrap();
        assert_eq!(llm.backend, LlmBackend::OpenAi);
        assert_eq!(llm.model, "gpt-4o-mini");
    }

    #[test]
    fn rules_can_be_disabled() {
        let cfg = config(&[("MODERATOR_RULES_ENABLED", "false")]).unwrap();
        assert!(!cfg.rules_enabled);
    }
}
