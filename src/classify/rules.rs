//! Local pattern classifier.
//!
//! Cheap, offline signal for things regexes catch reliably:
//! - leaked personal data (SSNs, card numbers, emails, phone numbers)
//! - a short list of common profanity
//!
//! Never needs the network, so it keeps producing results when the remote
//! backends are down.

use async_trait::async_trait;
use regex::Regex;
use tracing::debug;

use super::{ClassifierBackend, ClassifierSource, ClassifyContext, RawClassification};
use crate::error::ClassifierError;
use crate::policy::Category;

/// A single pattern with the category and severity it implies.
#[derive(Debug, Clone)]
pub struct PatternRule {
    /// Human-readable description.
    pub label: String,
    pub regex: Regex,
    pub category: Category,
    pub severity: f64,
}

pub struct RuleClassifier {
    rules: Vec<PatternRule>,
}

impl RuleClassifier {
    /// Built-in PII and profanity patterns.
    pub fn default_rules() -> Self {
        let rules = vec![
            // US social security number
            PatternRule {
                label: "ssn".into(),
                regex: Regex::new(r"\b\d{3}-\d{2}-\d{4}\b").unwrap(),
                category: Category::PiiLeak,
                severity: 0.9,
            },
            // 13-16 digit card number, optionally grouped
            PatternRule {
                label: "card number".into(),
                regex: Regex::new(r"\b\d{4}[ -]?\d{4}[ -]?\d{4}[ -]?\d{1,4}\b").unwrap(),
                category: Category::PiiLeak,
                severity: 0.8,
            },
            PatternRule {
                label: "email address".into(),
                regex: Regex::new(r"(?i)\b[a-z0-9._%+-]+@[a-z0-9.-]+\.[a-z]{2,}\b").unwrap(),
                category: Category::PiiLeak,
                severity: 0.3,
            },
            PatternRule {
                label: "phone number".into(),
                regex: Regex::new(r"(?:\+?1[-. ]?)?\(?\b\d{3}\)?[-. ]\d{3}[-. ]\d{4}\b").unwrap(),
                category: Category::PiiLeak,
                severity: 0.4,
            },
            PatternRule {
                label: "profanity".into(),
                regex: Regex::new(
                    r"(?i)\b(fuck\w*|shit\w*|bullshit|bitch\w*|asshole\w*|bastard\w*|dickhead\w*|motherfuck\w*)\b",
                )
                .unwrap(),
                category: Category::Profanity,
                severity: 0.5,
            },
        ];

        Self { rules }
    }

    /// A classifier with no rules (add them with [`Self::add_rule`]).
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Add a custom rule. Fails on an invalid pattern.
    pub fn add_rule(
        &mut self,
        label: &str,
        pattern: &str,
        category: Category,
        severity: f64,
    ) -> Result<(), regex::Error> {
        self.rules.push(PatternRule {
            label: label.to_string(),
            regex: Regex::new(pattern)?,
            category,
            severity,
        });
        Ok(())
    }

    /// Evaluate every rule; one finding per category at its highest severity.
    pub fn evaluate(&self, text: &str) -> Vec<RawClassification> {
        let mut findings: Vec<RawClassification> = Vec::new();

        for rule in &self.rules {
            if !rule.regex.is_match(text) {
                continue;
            }
            debug!(rule = %rule.label, category = %rule.category, "Pattern rule matched");
            match findings.iter_mut().find(|f| f.category == rule.category) {
                Some(existing) if existing.severity < rule.severity => {
                    existing.severity = rule.severity;
                }
                Some(_) => {}
                None => findings.push(RawClassification::new(rule.category.clone(), rule.severity)),
            }
        }

        findings
    }
}

#[async_trait]
impl ClassifierBackend for RuleClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::Rules
    }

    async fn classify(
        &self,
        text: &str,
        _ctx: &ClassifyContext,
    ) -> Result<Vec<RawClassification>, ClassifierError> {
        Ok(self.evaluate(text))
    }
}
