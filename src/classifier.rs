//! LLM fallback for requests the heuristic scorer is unsure about.
//!
//! A small model is asked to put the latest request into a tier. The classifier never fails a
//! request: timeouts, backend errors and unreadable answers all degrade to a tier derived from
//! the heuristic score.
use crate::errors::BackendError;
use crate::inventory::{InventorySnapshot, Tier};
use crate::models::ChatRequest;
use crate::scorer::ComplexityScore;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

pub const CLASSIFIER_SYSTEM_PROMPT: &str = "\
You are a request complexity classifier. Given a user's conversation with an AI assistant, \
classify the complexity of the LATEST user request into one of three tiers:

SMALL: Short factual questions, translations, simple formatting, yes/no questions, \
basic lookups, trivial code fixes.
MEDIUM: Standard coding tasks, summarization of longer texts, moderate analysis, \
explanations of concepts, typical chat interactions.
LARGE: Multi-step reasoning, architecture design, complex debugging, in-depth analysis, \
creative writing with specific constraints, tasks requiring deep domain expertise.

Respond with ONLY a JSON object: {\"tier\": \"SMALL\"|\"MEDIUM\"|\"LARGE\", \"reason\": \"brief explanation\"}";

const MAX_TRANSCRIPT_CHARS: usize = 2000;
const TRANSCRIPT_HEAD_CHARS: usize = 500;
const TRANSCRIPT_TAIL_CHARS: usize = 1500;

/// Sends a single-turn completion to a named model.
#[async_trait]
pub trait CompletionBackend: Send + Sync + fmt::Debug {
    /// Returns the text of the first choice. Implementations use temperature 0 and a short
    /// `max_tokens` budget.
    async fn complete(&self, model: &str, system: &str, prompt: &str)
    -> Result<String, BackendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("no classifier model available")]
    NoModel,

    #[error("classifier timed out after {0:?}")]
    Timeout(Duration),

    #[error("classifier request failed: {0}")]
    Backend(#[from] BackendError),

    #[error("unreadable classifier answer: {0}")]
    Unparsable(String),
}

/// The classifier's verdict.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassifierOutcome {
    pub tier: Tier,
    pub reason: String,
    /// Set when the tier came from the degraded rule instead of the model.
    pub degraded: bool,
}

/// The tier used when the classifier cannot answer. Never MEDIUM.
pub fn degraded_tier(score: f64) -> Tier {
    if score < 0.5 { Tier::Small } else { Tier::Large }
}

/// The configured classifier model, or else the smallest model in the inventory.
pub fn select_classifier_model(
    configured: Option<&str>,
    snapshot: &InventorySnapshot,
) -> Option<String> {
    configured
        .map(str::to_owned)
        .or_else(|| snapshot.smallest_model().map(|m| m.id.clone()))
}

/// A `role: text` transcript of the conversation. Long transcripts keep their beginning (usually
/// the system prompt) and their end (the latest turns).
pub fn condense_messages(request: &ChatRequest) -> String {
    let full = request
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.render("[image]", " ")))
        .collect::<Vec<_>>()
        .join("\n");

    let len = full.chars().count();
    if len <= MAX_TRANSCRIPT_CHARS {
        return full;
    }
    let head: String = full.chars().take(TRANSCRIPT_HEAD_CHARS).collect();
    let tail: String = full.chars().skip(len - TRANSCRIPT_TAIL_CHARS).collect();
    format!("{head}\n...\n{tail}")
}

/// Read the tier out of a classifier answer. Tolerates Markdown fences and chatter around the
/// JSON object; accepts tier labels in any case or the numbers 1 to 3.
pub fn parse_tier_label(text: &str) -> Result<(Tier, String), ClassifierError> {
    let unparsable = || ClassifierError::Unparsable(text.chars().take(200).collect());

    let (start, end) = match (text.find('{'), text.rfind('}')) {
        (Some(start), Some(end)) if start < end => (start, end),
        _ => return Err(unparsable()),
    };
    let value: serde_json::Value =
        serde_json::from_str(&text[start..=end]).map_err(|_| unparsable())?;

    let tier = match &value["tier"] {
        serde_json::Value::String(label) => match label.trim() {
            "1" => Some(Tier::Small),
            "2" => Some(Tier::Medium),
            "3" => Some(Tier::Large),
            other => other.parse().ok(),
        },
        serde_json::Value::Number(n) => match n.as_u64() {
            Some(1) => Some(Tier::Small),
            Some(2) => Some(Tier::Medium),
            Some(3) => Some(Tier::Large),
            _ => None,
        },
        _ => None,
    }
    .ok_or_else(unparsable)?;

    let reason = value["reason"].as_str().unwrap_or_default().to_string();
    Ok((tier, reason))
}

#[derive(Debug, Clone)]
pub struct TierClassifier {
    backend: Arc<dyn CompletionBackend>,
}

impl TierClassifier {
    pub fn new(backend: Arc<dyn CompletionBackend>) -> Self {
        Self { backend }
    }

    async fn ask(
        &self,
        request: &ChatRequest,
        model: Option<&str>,
        timeout: Duration,
    ) -> Result<(Tier, String), ClassifierError> {
        let model = model.ok_or(ClassifierError::NoModel)?;
        let transcript = condense_messages(request);

        let answer = tokio::time::timeout(
            timeout,
            self.backend
                .complete(model, CLASSIFIER_SYSTEM_PROMPT, &transcript),
        )
        .await
        .map_err(|_| ClassifierError::Timeout(timeout))??;

        parse_tier_label(&answer)
    }

    /// Classify `request` with `model`. Always returns a tier.
    #[instrument(skip_all, fields(model = model.unwrap_or("none"), score = score.value))]
    pub async fn classify(
        &self,
        request: &ChatRequest,
        score: &ComplexityScore,
        model: Option<&str>,
        timeout: Duration,
    ) -> ClassifierOutcome {
        match self.ask(request, model, timeout).await {
            Ok((tier, reason)) => {
                info!(%tier, reason = %reason, "Classifier decided tier");
                let reason = if reason.is_empty() {
                    format!("classifier: {tier}")
                } else {
                    format!("classifier: {tier} ({reason})")
                };
                ClassifierOutcome {
                    tier,
                    reason,
                    degraded: false,
                }
            }
            Err(e) => {
                let tier = degraded_tier(score.value);
                warn!(error = %e, %tier, "Classifier unavailable, using degraded tier");
                ClassifierOutcome {
                    tier,
                    reason: format!("classifier degraded ({e}), score {} -> {tier}", score.value),
                    degraded: true,
                }
            }
        }
    }
}
