//! Policy document types.

use std::fmt;

use serde::de::{MapAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ConfigError;

// ── Category ────────────────────────────────────────────────────────

/// A moderation category.
///
/// The well-known categories are enumerated; anything else named in a policy
/// document or reported by a classifier becomes `Custom`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Category {
    HateSpeech,
    Profanity,
    Violence,
    SelfHarm,
    SexualContent,
    PiiLeak,
    Custom(String),
}

impl Category {
    /// Parse a category name, accepting the aliases classifiers commonly emit.
    pub fn parse(name: &str) -> Self {
        let normalized: String = name
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c == '-' || c == ' ' { '_' } else { c })
            .collect();

        match normalized.as_str() {
            "hate_speech" | "hate" | "hatespeech" => Self::HateSpeech,
            "profanity" => Self::Profanity,
            "violence" => Self::Violence,
            "self_harm" | "selfharm" => Self::SelfHarm,
            "sexual_content" | "sexual" => Self::SexualContent,
            "pii_leak" | "pii" => Self::PiiLeak,
            _ => Self::Custom(normalized),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::HateSpeech => "hate_speech",
            Self::Profanity => "profanity",
            Self::Violence => "violence",
            Self::SelfHarm => "self_harm",
            Self::SexualContent => "sexual_content",
            Self::PiiLeak => "pii_leak",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for Category {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Category {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}

// ── Action ──────────────────────────────────────────────────────────

/// Moderation action. Variant order is strictness order:
/// `Allow < Flag < Archive < Delete`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ModerationAction {
    Allow,
    #[default]
    Flag,
    Archive,
    Delete,
}

impl ModerationAction {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Flag => "flag",
            Self::Archive => "archive",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "allow" => Some(Self::Allow),
            "flag" => Some(Self::Flag),
            "archive" => Some(Self::Archive),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl fmt::Display for ModerationAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

// ── Thresholds ──────────────────────────────────────────────────────

/// Ordinal threshold tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdTier {
    Low,
    Medium,
    High,
}

impl ThresholdTier {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Numeric cut points for each tier on the normalized 0–1 scale.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThresholdScale {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
}

impl Default for ThresholdScale {
    fn default() -> Self {
        Self {
            low: 0.0,
            medium: 0.4,
            high: 0.7,
        }
    }
}

impl ThresholdScale {
    pub fn value(&self, tier: ThresholdTier) -> f64 {
        match tier {
            ThresholdTier::Low => self.low,
            ThresholdTier::Medium => self.medium,
            ThresholdTier::High => self.high,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in [("low", self.low), ("medium", self.medium), ("high", self.high)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: format!("thresholds.{key}"),
                    message: format!("{value} is outside [0, 1]"),
                });
            }
        }
        if !(self.low <= self.medium && self.medium <= self.high) {
            return Err(ConfigError::InvalidValue {
                key: "thresholds".into(),
                message: "tiers must satisfy low <= medium <= high".into(),
            });
        }
        Ok(())
    }
}

/// A rule threshold: either a named tier or an explicit cut point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Threshold {
    Tier(ThresholdTier),
    Value(f64),
}

impl Default for Threshold {
    fn default() -> Self {
        Self::Tier(ThresholdTier::Medium)
    }
}

impl Threshold {
    pub fn resolve(&self, scale: &ThresholdScale) -> f64 {
        match self {
            Self::Tier(tier) => scale.value(*tier),
            Self::Value(v) => *v,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Self::Tier(tier) => tier.label().to_string(),
            Self::Value(v) => format!("{v:.2}"),
        }
    }
}

// ── Rules ───────────────────────────────────────────────────────────

/// One policy rule, bound to a category.
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyRule {
    pub category: Category,
    pub enabled: bool,
    pub threshold: Threshold,
    pub action: ModerationAction,
    pub notify: bool,
}

/// Rule as written in `policies.json`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct RuleDocument {
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    threshold: Threshold,
    #[serde(default)]
    action: ModerationAction,
    #[serde(default)]
    notify: bool,
    #[serde(default)]
    #[allow(dead_code)]
    description: Option<String>,
}

fn default_true() -> bool {
    true
}

/// Top-level shape of `policies.json`.
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PolicyDocument {
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    thresholds: ThresholdScale,
    #[serde(deserialize_with = "ordered_rules")]
    text_policies: Vec<(String, RuleDocument)>,
}

/// Deserialize a JSON object into its entries, preserving declaration order.
fn ordered_rules<'de, D>(deserializer: D) -> Result<Vec<(String, RuleDocument)>, D::Error>
where
    D: Deserializer<'de>,
{
    struct OrderedVisitor;

    impl<'de> Visitor<'de> for OrderedVisitor {
        type Value = Vec<(String, RuleDocument)>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a map of category name to rule")
        }

        fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<Self::Value, A::Error> {
            let mut entries = Vec::with_capacity(map.size_hint().unwrap_or(0));
            while let Some((key, value)) = map.next_entry::<String, RuleDocument>()? {
                entries.push((key, value));
            }
            Ok(entries)
        }
    }

    deserializer.deserialize_map(OrderedVisitor)
}

/// A validated moderation policy.
#[derive(Debug, Clone, PartialEq)]
pub struct Policy {
    pub version: String,
    pub scale: ThresholdScale,
    /// Rules in declaration order.
    rules: Vec<PolicyRule>,
}

impl Policy {
    /// Build a policy from rules in declaration order.
    pub fn new(
        version: impl Into<String>,
        scale: ThresholdScale,
        rules: Vec<PolicyRule>,
    ) -> Result<Self, ConfigError> {
        scale.validate()?;

        for (i, rule) in rules.iter().enumerate() {
            if rules[..i].iter().any(|r| r.category == rule.category) {
                return Err(ConfigError::DuplicateRule(rule.category.to_string()));
            }
            if let Threshold::Value(v) = rule.threshold
                && !(0.0..=1.0).contains(&v)
            {
                return Err(ConfigError::InvalidValue {
                    key: format!("text_policies.{}.threshold", rule.category),
                    message: format!("{v} is outside [0, 1]"),
                });
            }
        }

        Ok(Self {
            version: version.into(),
            scale,
            rules,
        })
    }

    /// Parse and validate a `policies.json` document.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let doc: PolicyDocument =
            serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
                document: "policies".into(),
                reason: e.to_string(),
            })?;

        let rules = doc
            .text_policies
            .into_iter()
            .map(|(name, rule)| PolicyRule {
                category: Category::parse(&name),
                enabled: rule.enabled,
                threshold: rule.threshold,
                action: rule.action,
                notify: rule.notify,
            })
            .collect();

        Self::new(
            doc.version.unwrap_or_else(|| "unversioned".to_string()),
            doc.thresholds,
            rules,
        )
    }

    /// Look up the rule for a category along with its declaration index.
    pub fn rule_for(&self, category: &Category) -> Option<(usize, &PolicyRule)> {
        self.rules
            .iter()
            .enumerate()
            .find(|(_, r)| &r.category == category)
    }

    pub fn rules(&self) -> &[PolicyRule] {
        &self.rules
    }

    pub fn threshold_value(&self, rule: &PolicyRule) -> f64 {
        rule.threshold.resolve(&self.scale)
    }

    pub fn enabled_count(&self) -> usize {
        self.rules.iter().filter(|r| r.enabled).count()
    }
}

// ── Channel selection ───────────────────────────────────────────────

/// Contents of `channels.json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelSelection {
    #[serde(default)]
    pub monitored_channels: Vec<String>,
    #[serde(default)]
    pub excluded_channels: Vec<String>,
}

impl ChannelSelection {
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(raw).map_err(|e| ConfigError::ParseError {
            document: "channels".into(),
            reason: e.to_string(),
        })
    }

    /// Whether a channel should be polled. Exclusion wins over monitoring.
    pub fn allows(&self, id: &str, name: &str) -> bool {
        if matches_any(&self.excluded_channels, id, name) {
            return false;
        }
        matches_any(&self.monitored_channels, id, name)
    }
}

/// Entries match a channel by exact id or case-insensitive display name.
fn matches_any(entries: &[String], id: &str, name: &str) -> bool {
    entries.iter().any(|e| {
        let e = e.trim();
        e == id || e.eq_ignore_ascii_case(name)
    })
}
