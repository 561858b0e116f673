//! Policy store. Loads documents from a [`PolicySource`] and hands out
//! immutable snapshots.
//!
//! The loop calls `refresh()` at the start of every cycle. If the source is
//! unreadable or a document is malformed, the last-known-good snapshot stays
//! in place. Only the very first load is allowed to fail the process.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::model::{ChannelSelection, Policy};
use crate::error::ConfigError;

/// Where policy documents come from (local files, a remote key-value store, ...).
#[async_trait]
pub trait PolicySource: Send + Sync {
    /// Human-readable location for logs.
    fn describe(&self) -> String;

    async fn load_channels(&self) -> Result<ChannelSelection, ConfigError>;

    async fn load_policy(&self) -> Result<Policy, ConfigError>;
}

/// Reads `channels.json` and `policies.json` from a directory.
///
/// A missing `<name>.json` falls back to `<name>.example.json`.
pub struct FilePolicySource {
    dir: PathBuf,
}

impl FilePolicySource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    async fn read_document(&self, name: &str) -> Result<String, ConfigError> {
        let primary = self.dir.join(format!("{name}.json"));
        let fallback = self.dir.join(format!("{name}.example.json"));

        let path: &Path = if tokio::fs::try_exists(&primary).await.unwrap_or(false) {
            &primary
        } else if tokio::fs::try_exists(&fallback).await.unwrap_or(false) {
            debug!(path = %fallback.display(), "Using example configuration");
            &fallback
        } else {
            return Err(ConfigError::NotFound(primary.display().to_string()));
        };

        Ok(tokio::fs::read_to_string(path).await?)
    }
}

#[async_trait]
impl PolicySource for FilePolicySource {
    fn describe(&self) -> String {
        self.dir.display().to_string()
    }

    async fn load_channels(&self) -> Result<ChannelSelection, ConfigError> {
        let raw = self.read_document("channels").await?;
        ChannelSelection::from_json(&raw)
    }

    async fn load_policy(&self) -> Result<Policy, ConfigError> {
        let raw = self.read_document("policies").await?;
        Policy::from_json(&raw)
    }
}

/// One consistent view of policy + channel selection.
#[derive(Debug, Clone)]
pub struct PolicySnapshot {
    pub policy: Policy,
    pub channels: ChannelSelection,
    pub loaded_at: DateTime<Utc>,
    /// Incremented on every successful load.
    pub generation: u64,
}

/// Holds the current snapshot and refreshes it from the source.
pub struct PolicyStore {
    source: Arc<dyn PolicySource>,
    current: RwLock<Arc<PolicySnapshot>>,
    generation: AtomicU64,
}

impl PolicyStore {
    /// Load the initial snapshot. Failure here is fatal to startup.
    pub async fn load(source: Arc<dyn PolicySource>) -> Result<Self, ConfigError> {
        let channels = source.load_channels().await?;
        let policy = source.load_policy().await?;

        info!(
            source = %source.describe(),
            policy_version = %policy.version,
            enabled_rules = policy.enabled_count(),
            monitored = channels.monitored_channels.len(),
            excluded = channels.excluded_channels.len(),
            "Policy loaded"
        );

        let snapshot = PolicySnapshot {
            policy,
            channels,
            loaded_at: Utc::now(),
            generation: 1,
        };

        Ok(Self {
            source,
            current: RwLock::new(Arc::new(snapshot)),
            generation: AtomicU64::new(1),
        })
    }

    /// Current snapshot without touching the source.
    pub async fn snapshot(&self) -> Arc<PolicySnapshot> {
        Arc::clone(&*self.current.read().await)
    }

    /// Re-read both documents. On any failure the previous snapshot is kept.
    pub async fn refresh(&self) -> Arc<PolicySnapshot> {
        let loaded = async {
            let channels = self.source.load_channels().await?;
            let policy = self.source.load_policy().await?;
            Ok::<_, ConfigError>((channels, policy))
        }
        .await;

        match loaded {
            Ok((channels, policy)) => {
                let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
                let snapshot = Arc::new(PolicySnapshot {
                    policy,
                    channels,
                    loaded_at: Utc::now(),
                    generation,
                });
                *self.current.write().await = Arc::clone(&snapshot);
                debug!(
                    generation,
                    policy_version = %snapshot.policy.version,
                    "Policy refreshed"
                );
                snapshot
            }
            Err(e) => {
                let current = self.snapshot().await;
                warn!(
                    error = %e,
                    error_kind = "configuration",
                    fatal = false,
                    generation = current.generation,
                    "Policy refresh failed; keeping last-known-good snapshot"
                );
                current
            }
        }
    }
}
