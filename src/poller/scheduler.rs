//! The poll loop.
//!
//! One cycle:
//! 1. refresh policy (last-known-good on failure) and pin a snapshot
//! 2. list channels, keep monitored-and-not-excluded (plus CLI override)
//! 3. process each channel whose backoff allows it
//!
//! Within a channel messages are handled strictly in id order, and each
//! decision is committed together with the cursor before the next message
//! starts. A failure stops that channel for the cycle; it never touches
//! other channels.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::sync::{RwLock, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::{BackoffConfig, ChannelHealth, ChannelHealthView};
use crate::classify::{ClassifierSet, ClassifyContext};
use crate::error::TransportError;
use crate::executor::ActionExecutor;
use crate::moderation::decide;
use crate::policy::{ChannelSelection, PolicySnapshot, PolicyStore};
use crate::store::{AuditRecord, ModerationStore};
use crate::transport::{ChannelRef, ChannelTransport, Message, bounded};

/// Latest channel health, published after every cycle.
pub type HealthBoard = Arc<RwLock<Vec<ChannelHealthView>>>;

#[derive(Debug, Clone)]
pub struct PollerConfig {
    pub interval: Duration,
    /// Wall-clock budget for one cycle; unfinished work rolls over.
    pub cycle_budget: Duration,
    pub max_concurrent_channels: usize,
    pub backoff: BackoffConfig,
    /// Restrict polling to one channel (id or name).
    pub channel_filter: Option<String>,
    /// Deadline for each transport call. A paged fetch gets at least the
    /// cycle budget.
    pub transport_timeout: Duration,
}

impl PollerConfig {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            cycle_budget: Duration::from_secs(45),
            max_concurrent_channels: 1,
            backoff: BackoffConfig::new(interval),
            channel_filter: None,
            transport_timeout: Duration::from_secs(30),
        }
    }
}

/// How one channel's turn ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOutcome {
    /// Processed `processed` messages; `remaining` were left for next cycle.
    Ok { processed: usize, remaining: usize },
    /// Transient failure; counts toward backoff.
    Failed { kind: &'static str, error: String },
    /// Channel no longer exists upstream.
    Gone,
}

/// Summary of one cycle, for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub channels_selected: usize,
    pub channels_polled: usize,
    pub channels_skipped: usize,
    pub processed: usize,
    pub remaining: usize,
    pub failures: usize,
    pub gone: usize,
    /// Channel listing failed; nothing was polled.
    pub aborted: bool,
}

struct HealthEntry {
    name: String,
    health: ChannelHealth,
}

pub struct PollLoop {
    transport: Arc<dyn ChannelTransport>,
    classifiers: Arc<ClassifierSet>,
    store: Arc<dyn ModerationStore>,
    policy: Arc<PolicyStore>,
    executor: Arc<ActionExecutor>,
    config: PollerConfig,
    health: HashMap<String, HealthEntry>,
    last_selection: Option<ChannelSelection>,
    board: HealthBoard,
}

impl PollLoop {
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        classifiers: Arc<ClassifierSet>,
        store: Arc<dyn ModerationStore>,
        policy: Arc<PolicyStore>,
        executor: Arc<ActionExecutor>,
        config: PollerConfig,
    ) -> Self {
        Self {
            transport,
            classifiers,
            store,
            policy,
            executor,
            config,
            health: HashMap::new(),
            last_selection: None,
            board: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Shared handle to the published channel health.
    pub fn health_board(&self) -> HealthBoard {
        Arc::clone(&self.board)
    }

    /// Health of one channel, if it has been seen.
    pub fn channel_health(&self, channel_id: &str) -> Option<&ChannelHealth> {
        self.health.get(channel_id).map(|e| &e.health)
    }

    /// Run cycles until shutdown is signalled.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            budget_secs = self.config.cycle_budget.as_secs(),
            transport = self.transport.name(),
            dry_run = self.executor.is_dry_run(),
            "Poll loop started"
        );

        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }

            if *shutdown.borrow() {
                break;
            }

            self.run_cycle(&shutdown).await;
        }

        info!("Poll loop stopped");
    }

    /// One full cycle over every due channel.
    pub async fn run_cycle(&mut self, shutdown: &watch::Receiver<bool>) -> CycleReport {
        let started = Instant::now();
        let deadline = started + self.config.cycle_budget;
        let snapshot = self.policy.refresh().await;
        self.reconcile_selection(&snapshot.channels);

        let mut report = CycleReport::default();

        let channels = match bounded(
            self.config.transport_timeout,
            self.transport.list_channels(),
        )
        .await
        {
            Ok(channels) => channels,
            Err(e) => {
                warn!(
                    error = %e,
                    error_kind = e.kind(),
                    fatal = false,
                    "Channel listing failed; skipping cycle"
                );
                report.aborted = true;
                return report;
            }
        };

        let selected: Vec<ChannelRef> = channels
            .into_iter()
            .filter(|c| snapshot.channels.allows(&c.id, &c.name))
            .filter(|c| match &self.config.channel_filter {
                Some(only) => only == &c.id || only.eq_ignore_ascii_case(&c.name),
                None => true,
            })
            .collect();
        report.channels_selected = selected.len();

        let now = Instant::now();
        let mut due = Vec::with_capacity(selected.len());
        for channel in selected {
            let entry = self
                .health
                .entry(channel.id.clone())
                .or_insert_with(|| HealthEntry {
                    name: channel.name.clone(),
                    health: ChannelHealth::default(),
                });
            entry.name = channel.name.clone();
            if entry.health.can_poll(now) {
                due.push(channel);
            } else {
                debug!(channel = %channel.name, state = entry.health.state_label(), "Channel not due");
                report.channels_skipped += 1;
            }
        }

        let outcomes = self.poll_channels(due, &snapshot, deadline, shutdown).await;
        report.channels_polled = outcomes.len();

        let now = Instant::now();
        for (channel, outcome) in outcomes {
            let Some(entry) = self.health.get_mut(&channel.id) else {
                continue;
            };
            match outcome {
                ChannelOutcome::Ok {
                    processed,
                    remaining,
                } => {
                    entry.health.record_success();
                    report.processed += processed;
                    report.remaining += remaining;
                }
                ChannelOutcome::Failed { kind, error } => {
                    let delay = entry
                        .health
                        .record_failure(format!("{kind}: {error}"), now, &self.config.backoff);
                    warn!(
                        channel = %channel.name,
                        error = %error,
                        error_kind = kind,
                        fatal = false,
                        retry_in_secs = delay.as_secs(),
                        "Channel failed this cycle"
                    );
                    report.failures += 1;
                }
                ChannelOutcome::Gone => {
                    warn!(
                        channel = %channel.name,
                        error_kind = "channel_not_found",
                        fatal = false,
                        "Channel gone upstream; disabled until channel configuration changes"
                    );
                    entry.health.disable("channel not found upstream");
                    report.gone += 1;
                }
            }
        }

        self.publish_health().await;

        info!(
            selected = report.channels_selected,
            polled = report.channels_polled,
            skipped = report.channels_skipped,
            processed = report.processed,
            remaining = report.remaining,
            failures = report.failures,
            elapsed_ms = started.elapsed().as_millis() as u64,
            policy_generation = snapshot.generation,
            "Poll cycle complete"
        );

        report
    }

    async fn poll_channels(
        &self,
        due: Vec<ChannelRef>,
        snapshot: &PolicySnapshot,
        deadline: Instant,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<(ChannelRef, ChannelOutcome)> {
        if self.config.max_concurrent_channels <= 1 {
            let mut outcomes = Vec::with_capacity(due.len());
            for channel in due {
                if *shutdown.borrow() || Instant::now() >= deadline {
                    break;
                }
                let outcome = self
                    .process_channel(&channel, snapshot, deadline, shutdown)
                    .await;
                outcomes.push((channel, outcome));
            }
            return outcomes;
        }

        stream::iter(due)
            .map(|channel| async move {
                let outcome = self
                    .process_channel(&channel, snapshot, deadline, shutdown)
                    .await;
                (channel, outcome)
            })
            .buffer_unordered(self.config.max_concurrent_channels)
            .collect()
            .await
    }

    /// Fetch and process one channel's new messages, in order.
    pub async fn process_channel(
        &self,
        channel: &ChannelRef,
        snapshot: &PolicySnapshot,
        deadline: Instant,
        shutdown: &watch::Receiver<bool>,
    ) -> ChannelOutcome {
        let cursor = match self.store.get_cursor(&channel.id).await {
            Ok(cursor) => cursor.map(|c| c.message_id),
            Err(e) => {
                return ChannelOutcome::Failed {
                    kind: "database",
                    error: e.to_string(),
                };
            }
        };

        // A paged fetch makes several calls, so it gets at least the budget.
        let fetch_limit = self.config.transport_timeout.max(self.config.cycle_budget);
        let mut messages = match bounded(
            fetch_limit,
            self.transport.fetch_messages(channel, cursor.as_ref()),
        )
        .await
        {
            Ok(messages) => messages,
            Err(TransportError::ChannelNotFound { .. }) => return ChannelOutcome::Gone,
            Err(e) => {
                return ChannelOutcome::Failed {
                    kind: e.kind(),
                    error: e.to_string(),
                };
            }
        };

        if let Some(after) = &cursor {
            messages.retain(|m| &m.id > after);
        }
        messages.sort_by(|a, b| a.id.cmp(&b.id));
        messages.dedup_by(|a, b| a.id == b.id);

        if messages.is_empty() {
            debug!(channel = %channel.name, "No new messages");
            return ChannelOutcome::Ok {
                processed: 0,
                remaining: 0,
            };
        }

        debug!(channel = %channel.name, count = messages.len(), "Fetched new messages");

        let total = messages.len();
        let mut processed = 0;
        for (index, message) in messages.iter().enumerate() {
            if *shutdown.borrow() {
                info!(channel = %channel.name, remaining = total - index, "Shutdown requested; stopping channel");
                return ChannelOutcome::Ok {
                    processed,
                    remaining: total - index,
                };
            }
            if Instant::now() >= deadline {
                info!(
                    channel = %channel.name,
                    remaining = total - index,
                    "Cycle budget exhausted; resuming next cycle"
                );
                return ChannelOutcome::Ok {
                    processed,
                    remaining: total - index,
                };
            }

            if let Err(outcome) = self.process_message(channel, message, snapshot).await {
                return outcome;
            }
            processed += 1;
        }

        ChannelOutcome::Ok {
            processed,
            remaining: 0,
        }
    }

    /// Handle one message end to end. `Err` carries the channel outcome that
    /// stops the channel for this cycle.
    async fn process_message(
        &self,
        channel: &ChannelRef,
        message: &Message,
        snapshot: &PolicySnapshot,
    ) -> Result<(), ChannelOutcome> {
        let db_failure = |e: crate::error::DatabaseError| ChannelOutcome::Failed {
            kind: "database",
            error: e.to_string(),
        };

        // Crash window between action and commit: the audit row is the
        // source of truth, so just catch the cursor up.
        if self
            .store
            .has_audit(&channel.id, &message.id)
            .await
            .map_err(db_failure)?
        {
            debug!(channel = %channel.name, message_id = %message.id, "Already decided; advancing cursor");
            self.store
                .advance_cursor(&channel.id, &message.id, message.created_at)
                .await
                .map_err(db_failure)?;
            return Ok(());
        }

        if message.body.trim().is_empty() {
            debug!(channel = %channel.name, message_id = %message.id, "Empty body; skipping");
            self.store
                .advance_cursor(&channel.id, &message.id, message.created_at)
                .await
                .map_err(db_failure)?;
            return Ok(());
        }

        let ctx = ClassifyContext {
            author: message.author_name.clone(),
            channel: message.channel_name.clone(),
        };
        let classification = self
            .classifiers
            .classify(&message.body, &ctx)
            .await
            .map_err(|e| ChannelOutcome::Failed {
                kind: e.kind(),
                error: e.to_string(),
            })?;

        let decision = decide(message, &classification, &snapshot.policy);
        // A transient delete error leaves the message undecided; the
        // existence check makes the retry safe.
        let result = match self
            .executor
            .execute(&decision, message, &snapshot.policy.scale)
            .await
        {
            Ok(result) => result,
            Err(TransportError::ChannelNotFound { .. }) => return Err(ChannelOutcome::Gone),
            Err(e) => {
                return Err(ChannelOutcome::Failed {
                    kind: e.kind(),
                    error: format!("delete {}: {e}", message.id),
                });
            }
        };

        let record = AuditRecord::new(decision, result.outcome, self.executor.is_dry_run());
        self.store
            .commit_decision(&record, message.created_at)
            .await
            .map_err(db_failure)?;

        Ok(())
    }

    /// Re-enable disabled channels when the channel selection changes.
    fn reconcile_selection(&mut self, selection: &ChannelSelection) {
        let changed = self
            .last_selection
            .as_ref()
            .is_some_and(|previous| previous != selection);

        if changed {
            for (id, entry) in self.health.iter_mut() {
                if entry.health.reenable() {
                    info!(channel = %entry.name, channel_id = %id, "Channel selection changed; re-enabling channel");
                }
            }
        }
        self.last_selection = Some(selection.clone());
    }

    async fn publish_health(&self) {
        let now = Instant::now();
        let mut views: Vec<ChannelHealthView> = self
            .health
            .iter()
            .map(|(id, entry)| entry.health.view(id, &entry.name, now))
            .collect();
        views.sort_by(|a, b| a.channel_name.cmp(&b.channel_name));
        *self.board.write().await = views;
    }
}
