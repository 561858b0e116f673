//! Classifier adapter: fan a message out to every backend and merge.
//!
//! Merge policy:
//! - union of categories across backends
//! - per category, the MAXIMUM severity wins (never an average)
//! - a backend that errors or times out does not block the others; the
//!   merged result is marked `degraded` instead
//!
//! Only when every backend fails does the adapter return an error.

pub mod contextual;
pub mod content_safety;
pub mod rules;

pub use content_safety::{ContentSafetyClassifier, ContentSafetyConfig};
pub use contextual::{ContextModel, ContextualClassifier, LlmBackend, LlmConfig, create_context_model};
pub use rules::RuleClassifier;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::ClassifierError;
use crate::policy::Category;

/// Which backend produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierSource {
    /// External content-safety service (baseline).
    ContentSafety,
    /// LLM-based contextual classifier.
    Contextual,
    /// Local pattern rules.
    Rules,
}

impl ClassifierSource {
    pub fn label(&self) -> &'static str {
        match self {
            Self::ContentSafety => "content_safety",
            Self::Contextual => "contextual",
            Self::Rules => "rules",
        }
    }
}

impl fmt::Display for ClassifierSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A single backend's finding, before merging.
#[derive(Debug, Clone, PartialEq)]
pub struct RawClassification {
    pub category: Category,
    /// Normalized severity; expected in [0, 1] but not guaranteed.
    pub severity: f64,
}

impl RawClassification {
    pub fn new(category: Category, severity: f64) -> Self {
        Self { category, severity }
    }
}

/// A merged finding for one category.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassificationResult {
    pub category: Category,
    pub severity: f64,
    pub source: ClassifierSource,
}

/// Merged output of all backends for one message.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Classification {
    pub results: Vec<ClassificationResult>,
    /// At least one backend failed; results are incomplete.
    pub degraded: bool,
    /// Backends that failed, with the error kind.
    pub failures: Vec<(ClassifierSource, &'static str)>,
}

impl Classification {
    /// A non-degraded classification (handy for callers that bypass backends).
    pub fn complete(results: Vec<ClassificationResult>) -> Self {
        Self {
            results,
            degraded: false,
            failures: Vec::new(),
        }
    }
}

/// Context passed to backends alongside the text.
#[derive(Debug, Clone, Default)]
pub struct ClassifyContext {
    pub author: String,
    pub channel: String,
}

/// A content classifier backend.
#[async_trait]
pub trait ClassifierBackend: Send + Sync {
    fn source(&self) -> ClassifierSource;

    async fn classify(
        &self,
        text: &str,
        ctx: &ClassifyContext,
    ) -> Result<Vec<RawClassification>, ClassifierError>;
}

/// All configured backends, queried together.
pub struct ClassifierSet {
    backends: Vec<Arc<dyn ClassifierBackend>>,
    timeout: Duration,
}

impl ClassifierSet {
    pub fn new(backends: Vec<Arc<dyn ClassifierBackend>>, timeout: Duration) -> Self {
        Self { backends, timeout }
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }

    /// Query every backend concurrently and merge the results.
    pub async fn classify(
        &self,
        text: &str,
        ctx: &ClassifyContext,
    ) -> Result<Classification, ClassifierError> {
        if self.backends.is_empty() {
            return Err(ClassifierError::AllFailed { count: 0 });
        }

        let calls = self.backends.iter().map(|backend| {
            let source = backend.source();
            async move {
                let outcome = match tokio::time::timeout(self.timeout, backend.classify(text, ctx))
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(ClassifierError::Timeout {
                        source_name: source.label().to_string(),
                        after: self.timeout,
                    }),
                };
                (source, outcome)
            }
        });

        let outcomes = join_all(calls).await;

        let mut successes = Vec::new();
        let mut failures = Vec::new();
        for (source, outcome) in outcomes {
            match outcome {
                Ok(raw) => {
                    debug!(source = %source, findings = raw.len(), "Classifier responded");
                    successes.push((source, raw));
                }
                Err(e) => {
                    warn!(
                        source = %source,
                        error = %e,
                        error_kind = e.kind(),
                        fatal = false,
                        "Classifier backend failed; continuing with partial signal"
                    );
                    failures.push((source, e.kind()));
                }
            }
        }

        if successes.is_empty() {
            return Err(ClassifierError::AllFailed {
                count: failures.len(),
            });
        }

        Ok(Classification {
            results: merge_max(successes),
            degraded: !failures.is_empty(),
            failures,
        })
    }
}

/// NaN sorts below everything so a real score always wins the merge.
fn merge_key(severity: f64) -> f64 {
    if severity.is_nan() {
        f64::NEG_INFINITY
    } else {
        severity
    }
}

/// Max-severity merge per category. Category order is first-seen order; on
/// equal severity the earlier backend keeps the attribution.
pub fn merge_max(
    per_backend: Vec<(ClassifierSource, Vec<RawClassification>)>,
) -> Vec<ClassificationResult> {
    let mut merged: Vec<ClassificationResult> = Vec::new();

    for (source, raw) in per_backend {
        for finding in raw {
            match merged.iter_mut().find(|r| r.category == finding.category) {
                Some(existing) => {
                    if merge_key(finding.severity) > merge_key(existing.severity) {
                        existing.severity = finding.severity;
                        existing.source = source;
                    }
                }
                None => merged.push(ClassificationResult {
                    category: finding.category,
                    severity: finding.severity,
                    source,
                }),
            }
        }
    }

    merged
}

/// Pull a JSON object out of a model reply that may be wrapped in a
/// markdown code fence.
pub(crate) fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    if let Some(start) = trimmed.find("```") {
        let rest = &trimmed[start + 3..];
        return rest.split("```").next().unwrap_or(rest).trim();
    }
    match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(s), Some(e)) if e > s => &trimmed[s..=e],
        _ => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed {
        source: ClassifierSource,
        findings: Vec<RawClassification>,
    }

    #[async_trait]
    impl ClassifierBackend for Fixed {
        fn source(&self) -> ClassifierSource {
            self.source
        }
        async fn classify(
            &self,
            _text: &str,
            _ctx: &ClassifyContext,
        ) -> Result<Vec<RawClassification>, ClassifierError> {
            Ok(self.findings.clone())
        }
    }

    struct Down;

    #[async_trait]
    impl ClassifierBackend for Down {
        fn source(&self) -> ClassifierSource {
            ClassifierSource::Contextual
        }
        async fn classify(
            &self,
            _text: &str,
            _ctx: &ClassifyContext,
        ) -> Result<Vec<RawClassification>, ClassifierError> {
            Err(ClassifierError::Unavailable {
                source_name: "contextual".into(),
                reason: "connection refused".into(),
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl ClassifierBackend for Slow {
        fn source(&self) -> ClassifierSource {
            ClassifierSource::Contextual
        }
        async fn classify(
            &self,
            _text: &str,
            _ctx: &ClassifyContext,
        ) -> Result<Vec<RawClassification>, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }
    }

    fn fixed(source: ClassifierSource, findings: &[(Category, f64)]) -> Arc<dyn ClassifierBackend> {
        Arc::new(Fixed {
            source,
            findings: findings
                .iter()
                .map(|(c, s)| RawClassification::new(c.clone(), *s))
                .collect(),
        })
    }

    #[tokio::test]
    async fn merge_takes_maximum_not_average() {
        let set = ClassifierSet::new(
            vec![
                fixed(ClassifierSource::ContentSafety, &[(Category::HateSpeech, 0.3)]),
                fixed(ClassifierSource::Contextual, &[(Category::HateSpeech, 0.9)]),
            ],
            Duration::from_secs(1),
        );
        let out = set.classify("x", &ClassifyContext::default()).await.unwrap();
        assert_eq!(out.results.len(), 1);
        assert!((out.results[0].severity - 0.9).abs() < f64::EPSILON);
        assert_eq!(out.results[0].source, ClassifierSource::Contextual);
        assert!(!out.degraded);
    }

    #[tokio::test]
    async fn merge_unions_categories() {
        let set = ClassifierSet::new(
            vec![
                fixed(ClassifierSource::ContentSafety, &[(Category::Violence, 0.5)]),
                fixed(ClassifierSource::Rules, &[(Category::PiiLeak, 0.9)]),
            ],
            Duration::from_secs(1),
        );
        let out = set.classify("x", &ClassifyContext::default()).await.unwrap();
        let cats: Vec<&Category> = out.results.iter().map(|r| &r.category).collect();
        assert_eq!(cats, vec![&Category::Violence, &Category::PiiLeak]);
    }

    #[tokio::test]
    async fn partial_failure_is_degraded() {
        let set = ClassifierSet::new(
            vec![
                fixed(ClassifierSource::ContentSafety, &[(Category::Profanity, 0.8)]),
                Arc::new(Down),
            ],
            Duration::from_secs(1),
        );
        let out = set.classify("x", &ClassifyContext::default()).await.unwrap();
        assert!(out.degraded);
        assert_eq!(out.results.len(), 1);
        assert_eq!(
            out.failures,
            vec![(ClassifierSource::Contextual, "classifier_unavailable")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_backend_times_out_as_degraded() {
        let set = ClassifierSet::new(
            vec![
                fixed(ClassifierSource::ContentSafety, &[]),
                Arc::new(Slow),
            ],
            Duration::from_secs(2),
        );
        let out = set.classify("x", &ClassifyContext::default()).await.unwrap();
        assert!(out.degraded);
        assert_eq!(out.failures[0].1, "classifier_timeout");
    }

    #[tokio::test]
    async fn all_failed_is_an_error() {
        let set = ClassifierSet::new(vec![Arc::new(Down)], Duration::from_secs(1));
        let err = set
            .classify("x", &ClassifyContext::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ClassifierError::AllFailed { count: 1 }));
    }

    #[test]
    fn nan_never_wins_merge() {
        let merged = merge_max(vec![
            (
                ClassifierSource::ContentSafety,
                vec![RawClassification::new(Category::Violence, f64::NAN)],
            ),
            (
                ClassifierSource::Contextual,
                vec![RawClassification::new(Category::Violence, 0.2)],
            ),
        ]);
        assert!((merged[0].severity - 0.2).abs() < f64::EPSILON);
    }

    #[test]
    fn equal_severity_keeps_first_source() {
        let merged = merge_max(vec![
            (
                ClassifierSource::ContentSafety,
                vec![RawClassification::new(Category::Violence, 0.5)],
            ),
            (
                ClassifierSource::Contextual,
                vec![RawClassification::new(Category::Violence, 0.5)],
            ),
        ]);
        assert_eq!(merged[0].source, ClassifierSource::ContentSafety);
    }

    #[test]
    fn extract_json_from_fence() {
        let reply = "Here you go:\n```json\n{\"a\": 1}\n```\n";
        assert_eq!(extract_json(reply), "{\"a\": 1}");
    }

    #[test]
    fn extract_json_from_bare_text() {
        assert_eq!(extract_json("sure {\"a\": 1} done"), "{\"a\": 1}");
    }
}
