//! Azure AI Content Safety text classifier (baseline signal).

use std::time::Duration;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{ClassifierBackend, ClassifierSource, ClassifyContext, RawClassification};
use crate::error::{ClassifierError, ConfigError};
use crate::policy::Category;

const API_VERSION: &str = "2024-09-01";

/// Service limit on analyzed text length (characters).
const MAX_TEXT_CHARS: usize = 10_000;

/// The eight-level scale tops out at 7.
const MAX_SEVERITY: f64 = 7.0;

#[derive(Debug, Clone)]
pub struct ContentSafetyConfig {
    pub endpoint: String,
    pub api_key: SecretString,
}

impl ContentSafetyConfig {
    /// Read `CONTENT_SAFETY_ENDPOINT` / `CONTENT_SAFETY_KEY`.
    ///
    /// Returns `Ok(None)` when neither is set (backend disabled).
    pub fn from_env() -> Result<Option<Self>, ConfigError> {
        let endpoint = std::env::var("CONTENT_SAFETY_ENDPOINT")
            .ok()
            .filter(|v| !v.trim().is_empty());
        let key = std::env::var("CONTENT_SAFETY_KEY")
            .ok()
            .filter(|v| !v.trim().is_empty());

        match (endpoint, key) {
            (None, None) => Ok(None),
            (Some(endpoint), Some(key)) => Ok(Some(Self {
                endpoint: endpoint.trim_end_matches('/').to_string(),
                api_key: SecretString::from(key),
            })),
            (Some(_), None) => Err(ConfigError::MissingEnvVar("CONTENT_SAFETY_KEY".into())),
            (None, Some(_)) => Err(ConfigError::MissingEnvVar(
                "CONTENT_SAFETY_ENDPOINT".into(),
            )),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeRequest<'a> {
    text: &'a str,
    output_type: &'static str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AnalyzeResponse {
    #[serde(default)]
    categories_analysis: Vec<CategoryAnalysis>,
}

#[derive(Debug, Deserialize)]
struct CategoryAnalysis {
    category: String,
    #[serde(default)]
    severity: Option<u32>,
}

/// Map a service category name onto ours.
fn map_category(name: &str) -> Category {
    match name {
        "Hate" => Category::HateSpeech,
        "Violence" => Category::Violence,
        "SelfHarm" => Category::SelfHarm,
        "Sexual" => Category::SexualContent,
        other => Category::parse(other),
    }
}

/// Normalize a response; zero-severity categories are dropped.
fn normalize(response: AnalyzeResponse) -> Vec<RawClassification> {
    response
        .categories_analysis
        .into_iter()
        .filter_map(|c| {
            let severity = c.severity.unwrap_or(0);
            (severity > 0).then(|| {
                RawClassification::new(
                    map_category(&c.category),
                    (f64::from(severity) / MAX_SEVERITY).min(1.0),
                )
            })
        })
        .collect()
}

fn truncate_chars(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

pub struct ContentSafetyClassifier {
    config: ContentSafetyConfig,
    client: reqwest::Client,
    timeout: Duration,
}

impl ContentSafetyClassifier {
    pub fn new(config: ContentSafetyConfig, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            config,
            client,
            timeout,
        }
    }

    fn unavailable(reason: impl Into<String>) -> ClassifierError {
        ClassifierError::Unavailable {
            source_name: ClassifierSource::ContentSafety.label().to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl ClassifierBackend for ContentSafetyClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::ContentSafety
    }

    async fn classify(
        &self,
        text: &str,
        _ctx: &ClassifyContext,
    ) -> Result<Vec<RawClassification>, ClassifierError> {
        let url = format!(
            "{}/contentsafety/text:analyze?api-version={API_VERSION}",
            self.config.endpoint
        );
        let body = AnalyzeRequest {
            text: truncate_chars(text, MAX_TEXT_CHARS),
            output_type: "EightSeverityLevels",
        };

        let response = self
            .client
            .post(&url)
            .header(
                "Ocp-Apim-Subscription-Key",
                self.config.api_key.expose_secret(),
            )
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ClassifierError::Timeout {
                        source_name: ClassifierSource::ContentSafety.label().to_string(),
                        after: self.timeout,
                    }
                } else {
                    Self::unavailable(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Self::unavailable(format!(
                "HTTP {status}: {}",
                detail.chars().take(200).collect::<String>()
            )));
        }

        let parsed: AnalyzeResponse =
            response
                .json()
                .await
                .map_err(|e| ClassifierError::InvalidResponse {
                    source_name: ClassifierSource::ContentSafety.label().to_string(),
                    reason: e.to_string(),
                })?;

        let findings = normalize(parsed);
        debug!(findings = findings.len(), "Content safety analysis complete");
        Ok(findings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> AnalyzeResponse {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn severity_scaled_to_unit_range() {
        let findings = normalize(parse(
            r#"{"categoriesAnalysis":[
                {"category":"Hate","severity":7},
                {"category":"Violence","severity":2}
            ]}"#,
        ));
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].category, Category::HateSpeech);
        assert!((findings[0].severity - 1.0).abs() < 1e-9);
        assert!((findings[1].severity - 2.0 / 7.0).abs() < 1e-9);
    }

    #[test]
    fn zero_severity_dropped() {
        let findings = normalize(parse(
            r#"{"categoriesAnalysis":[
                {"category":"Hate","severity":0},
                {"category":"SelfHarm","severity":0},
                {"category":"Sexual","severity":4}
            ]}"#,
        ));
        assert_eq!(findings.len(), 1);
        assert_eq!(findings[0].category, Category::SexualContent);
    }

    #[test]
    fn missing_analysis_is_empty() {
        assert!(normalize(parse("{}")).is_empty());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate_chars("héllo", 2), "hé");
        assert_eq!(truncate_chars("hi", 10), "hi");
    }
}
