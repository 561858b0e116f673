//! The decision engine.
//!
//! `decide` is a pure function of (message, classification, policy): no I/O,
//! no clock, no randomness. Identical inputs always yield an identical
//! [`Decision`], which is what makes the audit log reproducible.
//!
//! Selection among fired rules:
//! 1. strictest action (`delete > archive > flag > allow`)
//! 2. then highest severity
//! 3. then policy declaration order

use std::cmp::Ordering;

use serde::Serialize;
use tracing::{debug, warn};

use crate::classify::Classification;
use crate::policy::{Category, ModerationAction, Policy, PolicyRule, Threshold};
use crate::transport::{Message, MessageId};

/// Outcome of evaluating one message against the policy.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Decision {
    pub message_id: MessageId,
    pub channel_id: String,
    pub action: ModerationAction,
    /// Triggering category; `None` when nothing fired.
    pub category: Option<Category>,
    /// Severity of the triggering category, or the highest seen when nothing fired.
    pub severity: f64,
    pub notify: bool,
    /// Made on incomplete classifier signal.
    pub degraded: bool,
    pub rationale: String,
    pub policy_version: String,
}

/// A rule that met its threshold.
struct Fired<'a> {
    index: usize,
    rule: &'a PolicyRule,
    severity: f64,
    threshold: f64,
}

/// Clamp into [0, 1]; NaN becomes 0.
fn clamp_severity(raw: f64, category: &Category, message_id: &MessageId) -> f64 {
    let clamped = if raw.is_nan() { 0.0 } else { raw.clamp(0.0, 1.0) };
    if clamped != raw || raw.is_nan() {
        warn!(
            message_id = %message_id,
            category = %category,
            raw_severity = raw,
            clamped,
            error_kind = "data_quality",
            fatal = false,
            "Out-of-range classifier severity clamped"
        );
    }
    clamped
}

/// Strictness ordering over fired rules; `Greater` is the winner.
fn strictness(a: &Fired<'_>, b: &Fired<'_>) -> Ordering {
    a.rule
        .action
        .cmp(&b.rule.action)
        .then_with(|| a.severity.total_cmp(&b.severity))
        // Earlier declaration wins, so a lower index is "greater".
        .then_with(|| b.index.cmp(&a.index))
}

fn describe_threshold(threshold: &Threshold, value: f64) -> String {
    match threshold {
        Threshold::Tier(tier) => format!("{value:.2} ({})", tier.label()),
        Threshold::Value(_) => format!("{value:.2}"),
    }
}

/// Evaluate a message's classification against the policy.
pub fn decide(message: &Message, classification: &Classification, policy: &Policy) -> Decision {
    let mut fired: Vec<Fired<'_>> = Vec::new();
    let mut highest_seen = 0.0_f64;

    for result in &classification.results {
        let severity = clamp_severity(result.severity, &result.category, &message.id);
        highest_seen = highest_seen.max(severity);

        let Some((index, rule)) = policy.rule_for(&result.category) else {
            debug!(
                message_id = %message.id,
                category = %result.category,
                error_kind = "data_quality",
                "No policy rule for classified category"
            );
            continue;
        };
        if !rule.enabled {
            continue;
        }

        let threshold = policy.threshold_value(rule);
        if severity >= threshold {
            fired.push(Fired {
                index,
                rule,
                severity,
                threshold,
            });
        }
    }

    let notify = fired.iter().any(|f| f.rule.notify);
    let winner = fired.iter().max_by(|a, b| strictness(a, b));

    let (action, category, severity, mut rationale) = match winner {
        Some(w) => (
            w.rule.action,
            Some(w.rule.category.clone()),
            w.severity,
            format!(
                "{} severity {:.2} >= {} -> {}",
                w.rule.category,
                w.severity,
                describe_threshold(&w.rule.threshold, w.threshold),
                w.rule.action
            ),
        ),
        None => (
            ModerationAction::Allow,
            None,
            highest_seen,
            "no enabled rule triggered".to_string(),
        ),
    };

    if fired.len() > 1 {
        rationale.push_str(&format!(" ({} rules fired)", fired.len()));
    }
    if classification.degraded {
        rationale.push_str("; degraded classification");
    }

    Decision {
        message_id: message.id.clone(),
        channel_id: message.channel_id.clone(),
        action,
        category,
        severity,
        notify,
        degraded: classification.degraded,
        rationale,
        policy_version: policy.version.clone(),
    }
}
