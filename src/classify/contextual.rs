//! Contextual classifier backed by an LLM.
//!
//! The model sees the message plus who posted it and where, and answers with
//! a small JSON verdict. Two reply shapes are accepted:
//!
//! ```json
//! {"violations": [{"category": "hate_speech", "severity": "high"}]}
//! {"is_violation": true, "violations": ["harassment"], "severity": "medium"}
//! ```
//!
//! Tier words map to fixed scores (low 0.3, medium 0.6, high 0.9); numeric
//! severities are taken as-is.

use std::sync::Arc;

use async_trait::async_trait;
use rig::client::CompletionClient;
use rig::completion::{CompletionModel, Prompt};
use secrecy::ExposeSecret;
use serde::Deserialize;
use tracing::debug;

use super::{ClassifierBackend, ClassifierSource, ClassifyContext, RawClassification, extract_json};
use crate::error::ClassifierError;
use crate::policy::Category;

const PREAMBLE: &str = "You are a workplace chat moderator. Judge the message in context \
and reply with JSON only, no prose. Shape: \
{\"violations\": [{\"category\": <name>, \"severity\": \"low\"|\"medium\"|\"high\"}]}. \
Categories: hate_speech, harassment, profanity, violence, self_harm, sexual_content, \
pii_leak, spam. Workplace banter, sarcasm between colleagues and quoting policy \
are not violations. Reply {\"violations\": []} when the message is fine.";

const MAX_TOKENS: u64 = 512;

/// Supported LLM backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmBackend {
    Anthropic,
    OpenAi,
}

impl LlmBackend {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "anthropic" | "claude" => Some(Self::Anthropic),
            "openai" => Some(Self::OpenAi),
            _ => None,
        }
    }
}

/// Configuration for the contextual model.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub backend: LlmBackend,
    pub api_key: secrecy::SecretString,
    pub model: String,
}

/// Minimal text-in/text-out model seam.
#[async_trait]
pub trait ContextModel: Send + Sync {
    fn model_name(&self) -> &str;

    async fn complete(&self, prompt: &str) -> Result<String, String>;
}

/// A rig agent with the moderation preamble baked in.
struct RigContextModel<M: CompletionModel> {
    agent: rig::agent::Agent<M>,
    model: String,
}

#[async_trait]
impl<M> ContextModel for RigContextModel<M>
where
    M: CompletionModel + 'static,
{
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn complete(&self, prompt: &str) -> Result<String, String> {
        self.agent
            .prompt(prompt.to_string())
            .await
            .map_err(|e| e.to_string())
    }
}

/// Build the contextual model from configuration.
pub fn create_context_model(config: &LlmConfig) -> Result<Arc<dyn ContextModel>, ClassifierError> {
    let client_error = |provider: &str, e: String| ClassifierError::Unavailable {
        source_name: ClassifierSource::Contextual.label().to_string(),
        reason: format!("Failed to create {provider} client: {e}"),
    };

    match config.backend {
        LlmBackend::Anthropic => {
            use rig::providers::anthropic;

            let client: rig::client::Client<anthropic::client::AnthropicExt> =
                anthropic::Client::new(config.api_key.expose_secret())
                    .map_err(|e| client_error("Anthropic", e.to_string()))?;
            let agent = client
                .agent(&config.model)
                .preamble(PREAMBLE)
                .max_tokens(MAX_TOKENS)
                .build();
            tracing::info!("Contextual classifier using Anthropic (model: {})", config.model);
            Ok(Arc::new(RigContextModel {
                agent,
                model: config.model.clone(),
            }))
        }
        LlmBackend::OpenAi => {
            use rig::providers::openai;

            let client: rig::client::Client<openai::client::OpenAIResponsesExt> =
                openai::Client::new(config.api_key.expose_secret())
                    .map_err(|e| client_error("OpenAI", e.to_string()))?;
            let agent = client
                .agent(&config.model)
                .preamble(PREAMBLE)
                .max_tokens(MAX_TOKENS)
                .build();
            tracing::info!("Contextual classifier using OpenAI (model: {})", config.model);
            Ok(Arc::new(RigContextModel {
                agent,
                model: config.model.clone(),
            }))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SeverityValue {
    Score(f64),
    Tier(String),
}

impl SeverityValue {
    fn score(&self) -> Option<f64> {
        match self {
            Self::Score(v) => Some(*v),
            Self::Tier(t) => tier_score(t),
        }
    }
}

fn tier_score(tier: &str) -> Option<f64> {
    match tier.trim().to_lowercase().as_str() {
        "low" => Some(0.3),
        "medium" | "moderate" => Some(0.6),
        "high" | "severe" => Some(0.9),
        "none" => Some(0.0),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ViolationEntry {
    Detailed {
        category: String,
        severity: Option<SeverityValue>,
    },
    Named(String),
}

#[derive(Debug, Deserialize)]
struct Verdict {
    #[serde(default)]
    is_violation: Option<bool>,
    #[serde(default)]
    violations: Vec<ViolationEntry>,
    /// Verdict-wide severity, used for entries that carry none.
    #[serde(default)]
    severity: Option<SeverityValue>,
}

/// Parse a model reply into findings.
fn parse_verdict(reply: &str) -> Result<Vec<RawClassification>, String> {
    let verdict: Verdict =
        serde_json::from_str(extract_json(reply)).map_err(|e| format!("unparseable verdict: {e}"))?;

    if verdict.is_violation == Some(false) {
        return Ok(Vec::new());
    }

    let fallback = verdict.severity.as_ref().and_then(SeverityValue::score);

    let findings = verdict
        .violations
        .into_iter()
        .filter_map(|entry| {
            let (category, severity) = match entry {
                ViolationEntry::Detailed { category, severity } => {
                    (category, severity.as_ref().and_then(SeverityValue::score).or(fallback))
                }
                ViolationEntry::Named(category) => (category, fallback),
            };
            let severity = severity?;
            (severity > 0.0).then(|| RawClassification::new(Category::parse(&category), severity))
        })
        .collect();

    Ok(findings)
}

pub struct ContextualClassifier {
    model: Arc<dyn ContextModel>,
}

impl ContextualClassifier {
    pub fn new(model: Arc<dyn ContextModel>) -> Self {
        Self { model }
    }
}

#[async_trait]
impl ClassifierBackend for ContextualClassifier {
    fn source(&self) -> ClassifierSource {
        ClassifierSource::Contextual
    }

    async fn classify(
        &self,
        text: &str,
        ctx: &ClassifyContext,
    ) -> Result<Vec<RawClassification>, ClassifierError> {
        let prompt = format!(
            "Channel: {}\nAuthor: {}\nMessage:\n{}",
            ctx.channel, ctx.author, text
        );

        let reply = self
            .model
            .complete(&prompt)
            .await
            .map_err(|reason| ClassifierError::Unavailable {
                source_name: ClassifierSource::Contextual.label().to_string(),
                reason,
            })?;

        let findings = parse_verdict(&reply).map_err(|reason| ClassifierError::InvalidResponse {
            source_name: ClassifierSource::Contextual.label().to_string(),
            reason,
        })?;

        debug!(
            model = self.model.model_name(),
            findings = findings.len(),
            "Contextual classification complete"
        );
        Ok(findings)
    }
}
