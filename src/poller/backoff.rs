//! Per-channel health and exponential backoff.
//!
//! ```text
//! Healthy ──failure──▶ BackingOff{n} ──failure──▶ BackingOff{n+1}
//!    ▲                      │
//!    └──────success─────────┘
//! any ──gone──▶ Disabled (until the channel selection changes)
//! ```
//!
//! Delay after the n-th consecutive failure is `base * 2^(n-1)`, capped at
//! `base * max_multiplier`, with optional symmetric jitter.

use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use tokio::time::Instant;

/// Backoff tuning.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max_multiplier: u32,
    /// Fraction of the delay to randomize by (0.1 = ±10%). Zero disables.
    pub jitter: f64,
}

impl BackoffConfig {
    pub fn new(base: Duration) -> Self {
        Self {
            base,
            max_multiplier: 10,
            jitter: 0.1,
        }
    }

    /// Un-jittered delay after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        let multiplier = 2u32.saturating_pow(exponent).min(self.max_multiplier.max(1));
        self.base.saturating_mul(multiplier)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        if self.jitter <= 0.0 || delay.is_zero() {
            return delay;
        }
        let spread = self.jitter.min(1.0);
        let factor = 1.0 + rand::thread_rng().gen_range(-spread..=spread);
        delay.mul_f64(factor.max(0.0))
    }
}

/// Health state of one channel.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ChannelHealth {
    #[default]
    Healthy,
    BackingOff {
        consecutive_failures: u32,
        next_attempt_at: Instant,
        last_error: String,
    },
    Disabled {
        reason: String,
    },
}

impl ChannelHealth {
    /// Whether the channel may be polled at `now`.
    pub fn can_poll(&self, now: Instant) -> bool {
        match self {
            Self::Healthy => true,
            Self::BackingOff {
                next_attempt_at, ..
            } => now >= *next_attempt_at,
            Self::Disabled { .. } => false,
        }
    }

    pub fn record_success(&mut self) {
        if !matches!(self, Self::Disabled { .. }) {
            *self = Self::Healthy;
        }
    }

    /// Count a failure and schedule the next attempt. Returns the delay.
    pub fn record_failure(
        &mut self,
        error: impl Into<String>,
        now: Instant,
        config: &BackoffConfig,
    ) -> Duration {
        let failures = match self {
            Self::BackingOff {
                consecutive_failures,
                ..
            } => consecutive_failures.saturating_add(1),
            Self::Healthy => 1,
            Self::Disabled { .. } => return Duration::ZERO,
        };

        let delay = config.jittered(config.delay_for(failures));
        *self = Self::BackingOff {
            consecutive_failures: failures,
            next_attempt_at: now + delay,
            last_error: error.into(),
        };
        delay
    }

    pub fn disable(&mut self, reason: impl Into<String>) {
        *self = Self::Disabled {
            reason: reason.into(),
        };
    }

    /// Re-enable a disabled channel (after a selection change).
    pub fn reenable(&mut self) -> bool {
        if matches!(self, Self::Disabled { .. }) {
            *self = Self::Healthy;
            true
        } else {
            false
        }
    }

    pub fn state_label(&self) -> &'static str {
        match self {
            Self::Healthy => "healthy",
            Self::BackingOff { .. } => "backing_off",
            Self::Disabled { .. } => "disabled",
        }
    }

    /// Serializable view for the status endpoint.
    pub fn view(&self, channel_id: &str, channel_name: &str, now: Instant) -> ChannelHealthView {
        let (consecutive_failures, retry_in_secs, detail) = match self {
            Self::Healthy => (0, None, None),
            Self::BackingOff {
                consecutive_failures,
                next_attempt_at,
                last_error,
            } => (
                *consecutive_failures,
                Some(next_attempt_at.saturating_duration_since(now).as_secs()),
                Some(last_error.clone()),
            ),
            Self::Disabled { reason } => (0, None, Some(reason.clone())),
        };
        ChannelHealthView {
            channel_id: channel_id.to_string(),
            channel_name: channel_name.to_string(),
            state: self.state_label(),
            consecutive_failures,
            retry_in_secs,
            detail,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChannelHealthView {
    pub channel_id: String,
    pub channel_name: String,
    pub state: &'static str,
    pub consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_in_secs: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
