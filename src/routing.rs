//! Per-request routing: explicit override, heuristic score, classifier fallback, model choice.
use crate::classifier::{TierClassifier, select_classifier_model};
use crate::errors::RoutingError;
use crate::inventory::{InventorySnapshot, Tier};
use crate::models::ChatRequest;
use crate::scorer;
use crate::settings::RouterSettings;
use regex::Regex;
use serde::Serialize;
use std::sync::LazyLock;
use tracing::{info, instrument};

static CODE_INDICATORS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(concat!(
        r"(?i)\b(?:code|function|class|implement|bug|error|exception|stacktrace|",
        r"api|endpoint|database|query|sql|html|css|javascript|python|",
        r"typescript|rust|golang|java|refactor|test|unittest|",
        r"implementiere|debugge|Quellcode|Quelltext|Programmier\w*|kompilier\w*|",
        r"Algorithmus|Algorithmen|Skript)\b"
    ))
    .expect("code indicator pattern is valid")
});

/// How many of the latest user messages are checked for code.
const CODING_LOOKBACK: usize = 3;

/// Reported for explicitly requested models whose size could not be read from their name.
const UNSIZED_MODEL_TIER: Tier = Tier::Medium;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingSource {
    Explicit,
    Heuristic,
    Classifier,
}

/// Where a request goes, and why.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    pub tier: Tier,
    pub selected_model: String,
    pub routing_source: RoutingSource,
    /// Absent for explicit requests, which are never scored.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heuristic_score: Option<f64>,
    pub reasons: Vec<String>,
    pub prefer_coder: bool,
}

/// Whether any of the latest user messages looks like programming work.
pub fn is_coding_request(request: &ChatRequest) -> bool {
    request.last_user_messages(CODING_LOOKBACK).any(|m| {
        let text = m.render("", "\n");
        text.contains("```") || CODE_INDICATORS.is_match(&text)
    })
}

/// The model id the client asked for, unless it is empty or the router's own virtual name.
fn requested_model<'r>(request: &'r ChatRequest, settings: &RouterSettings) -> Option<&'r str> {
    request
        .model
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty() && *m != settings.model_name)
}

/// Decide which model serves `request`.
#[instrument(skip_all, fields(generation = snapshot.generation))]
pub async fn route(
    request: &ChatRequest,
    snapshot: &InventorySnapshot,
    settings: &RouterSettings,
    classifier: &TierClassifier,
) -> Result<RoutingDecision, RoutingError> {
    if let Some(id) = requested_model(request, settings) {
        let tier = match snapshot.get(id) {
            Some(model) if model.is_retained() || settings.explicit_bypasses_filter => model.tier,
            None if settings.explicit_bypasses_filter && snapshot.is_unsized(id) => {
                UNSIZED_MODEL_TIER
            }
            _ => return Err(RoutingError::InvalidExplicitModel(id.to_string())),
        };

        info!(model = %id, %tier, "Explicit model requested");
        return Ok(RoutingDecision {
            tier,
            selected_model: id.to_string(),
            routing_source: RoutingSource::Explicit,
            heuristic_score: None,
            reasons: vec!["explicit model requested".to_string()],
            prefer_coder: false,
        });
    }

    if snapshot.is_empty() {
        return Err(RoutingError::NoModelAvailable);
    }

    let score = scorer::score(request, &settings.thresholds);
    let mut reasons = score.reasons.clone();

    let (tier, routing_source) = match score.tier {
        Some(tier) => (tier, RoutingSource::Heuristic),
        None => {
            let classifier_model =
                select_classifier_model(settings.classifier_model.as_deref(), snapshot);
            let outcome = classifier
                .classify(
                    request,
                    &score,
                    classifier_model.as_deref(),
                    settings.classifier_timeout,
                )
                .await;
            reasons.push(outcome.reason);
            (outcome.tier, RoutingSource::Classifier)
        }
    };

    let prefer_coder = settings.prefer_coder && is_coding_request(request);
    let model = snapshot
        .best_model(tier, prefer_coder)
        .ok_or(RoutingError::NoModelAvailable)?;

    info!(
        model = %model.id,
        %tier,
        source = ?routing_source,
        score = score.value,
        prefer_coder,
        "Routed request"
    );

    Ok(RoutingDecision {
        tier,
        selected_model: model.id.clone(),
        routing_source,
        heuristic_score: Some(score.value),
        reasons,
        prefer_coder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inventory::{DiscoveredModel, ModelInfo};
    use crate::models::Message;
    use crate::params::ParamCount;
    use crate::settings::{ConfigFile, FilterExclusion};
    use crate::test_utils::MockBackend;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Instant;

    fn settings() -> RouterSettings {
        RouterSettings::default()
    }

    fn model(id: &str, total: f64, tier: Tier, is_coder: bool) -> ModelInfo {
        ModelInfo::builder()
            .id(id)
            .params(ParamCount::dense(total))
            .tier(tier)
            .is_coder(is_coder)
            .build()
    }

    fn snapshot_of(entries: Vec<ModelInfo>) -> InventorySnapshot {
        InventorySnapshot {
            generation: 1,
            refreshed_at: Some(Instant::now()),
            entries,
            rejected: vec![],
            settings: None,
        }
    }

    fn full_inventory() -> InventorySnapshot {
        snapshot_of(vec![
            model("gemma-3-4b", 4.0, Tier::Small, false),
            model("qwen2.5-coder-7b", 7.0, Tier::Small, true),
            model("gemma-3-27b", 27.0, Tier::Medium, false),
            model("gpt-oss-120b", 120.0, Tier::Large, false),
            model("qwen2.5-coder-32b", 32.0, Tier::Large, true),
        ])
    }

    fn classifier_answering(answer: &str) -> (Arc<MockBackend>, TierClassifier) {
        let backend = Arc::new(MockBackend::answering(answer));
        (backend.clone(), TierClassifier::new(backend))
    }

    fn ask(text: &str) -> ChatRequest {
        ChatRequest {
            messages: vec![Message::new("user", text)],
            ..ChatRequest::default()
        }
    }

    #[tokio::test]
    async fn test_simple_request_routes_small_without_classifier() {
        let (backend, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let decision = route(&ask("What is 2+2?"), &full_inventory(), &settings(), &classifier)
            .await
            .unwrap();

        assert_eq!(decision.tier, Tier::Small);
        assert_eq!(decision.selected_model, "gemma-3-4b");
        assert_eq!(decision.routing_source, RoutingSource::Heuristic);
        assert_eq!(decision.heuristic_score, Some(0.0));
        assert!(!decision.prefer_coder);
        assert!(decision.reasons.contains(&"simple keywords: What is".to_string()));
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_explicit_model_skips_scoring() {
        let (backend, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let mut request = ask("Analyze this in detail");
        request.model = Some("gemma-3-27b".to_string());

        let decision = route(&request, &full_inventory(), &settings(), &classifier)
            .await
            .unwrap();

        assert_eq!(decision.routing_source, RoutingSource::Explicit);
        assert_eq!(decision.selected_model, "gemma-3-27b");
        assert_eq!(decision.tier, Tier::Medium);
        assert_eq!(decision.heuristic_score, None);
        assert!(backend.calls().is_empty());

        let rendered = serde_json::to_value(&decision).unwrap();
        assert!(rendered.get("heuristic_score").is_none());
        assert_eq!(rendered["routing_source"], "explicit");
    }

    #[tokio::test]
    async fn test_virtual_model_name_means_automatic_routing() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let mut request = ask("Hi");
        request.model = Some("smart-router".to_string());

        let decision = route(&request, &full_inventory(), &settings(), &classifier)
            .await
            .unwrap();
        assert_eq!(decision.routing_source, RoutingSource::Heuristic);
    }

    #[tokio::test]
    async fn test_unknown_explicit_model_is_an_error() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let mut request = ask("Hi");
        request.model = Some("gpt-5".to_string());

        let err = route(&request, &full_inventory(), &settings(), &classifier)
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::InvalidExplicitModel("gpt-5".to_string()));
    }

    #[tokio::test]
    async fn test_explicit_filtered_model_respects_bypass_flag() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let mut blocked = model("blocked-7b", 7.0, Tier::Small, false);
        blocked.excluded = Some(FilterExclusion::Blocklisted);
        let snapshot = snapshot_of(vec![blocked, model("gemma-3-4b", 4.0, Tier::Small, false)]);

        let mut request = ask("Hi");
        request.model = Some("blocked-7b".to_string());

        let decision = route(&request, &snapshot, &settings(), &classifier)
            .await
            .unwrap();
        assert_eq!(decision.selected_model, "blocked-7b");

        let mut config = ConfigFile::default();
        config.routing.explicit_bypasses_filter = false;
        let strict = RouterSettings::from_config(config).unwrap();
        let err = route(&request, &snapshot, &strict, &classifier)
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::InvalidExplicitModel("blocked-7b".to_string()));
    }

    #[tokio::test]
    async fn test_explicit_model_of_unknown_size() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let discovered: Vec<_> = ["gpt-4o", "gemma-3-4b", "nomic-embed-text"]
            .into_iter()
            .map(DiscoveredModel::from_id)
            .collect();
        let settings = Arc::new(settings());
        let snapshot = InventorySnapshot::build(&discovered, &settings, 1, Instant::now());
        assert!(snapshot.get("gpt-4o").is_none());

        let mut request = ask("Hi");
        request.model = Some("gpt-4o".to_string());
        let decision = route(&request, &snapshot, &settings, &classifier)
            .await
            .unwrap();
        assert_eq!(decision.selected_model, "gpt-4o");
        assert_eq!(decision.tier, Tier::Medium);
        assert_eq!(decision.routing_source, RoutingSource::Explicit);

        // Never picked automatically.
        let decision = route(&ask("Hi"), &snapshot, &settings, &classifier)
            .await
            .unwrap();
        assert_eq!(decision.selected_model, "gemma-3-4b");

        // Non-text models stay unreachable.
        request.model = Some("nomic-embed-text".to_string());
        assert_eq!(
            route(&request, &snapshot, &settings, &classifier)
                .await
                .unwrap_err(),
            RoutingError::InvalidExplicitModel("nomic-embed-text".to_string())
        );

        let mut config = ConfigFile::default();
        config.routing.explicit_bypasses_filter = false;
        let strict = RouterSettings::from_config(config).unwrap();
        request.model = Some("gpt-4o".to_string());
        assert_eq!(
            route(&request, &snapshot, &strict, &classifier)
                .await
                .unwrap_err(),
            RoutingError::InvalidExplicitModel("gpt-4o".to_string())
        );
    }

    #[tokio::test]
    async fn test_small_request_falls_through_to_only_medium_model() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let snapshot = snapshot_of(vec![model("gemma-3-27b", 27.0, Tier::Medium, false)]);

        let decision = route(&ask("Hi"), &snapshot, &settings(), &classifier)
            .await
            .unwrap();
        assert_eq!(decision.tier, Tier::Small);
        assert_eq!(decision.selected_model, "gemma-3-27b");
    }

    #[tokio::test]
    async fn test_uncertain_score_asks_classifier() {
        let (backend, classifier) =
            classifier_answering(r#"{"tier": "MEDIUM", "reason": "typical analysis"}"#);
        let decision = route(
            &ask(concat!(
                "Compare renting versus buying a home, and design a decision ",
                "framework for a young family with two kids."
            )),
            &full_inventory(),
            &settings(),
            &classifier,
        )
        .await
        .unwrap();

        assert_eq!(decision.routing_source, RoutingSource::Classifier);
        assert_eq!(decision.tier, Tier::Medium);
        assert_eq!(decision.selected_model, "gemma-3-27b");
        assert!(
            decision
                .reasons
                .contains(&"classifier: MEDIUM (typical analysis)".to_string())
        );

        // The smallest model classifies when none is configured.
        assert_eq!(backend.calls()[0].model, "gemma-3-4b");
    }

    #[tokio::test]
    async fn test_configured_classifier_model_is_used() {
        let (backend, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let mut config = ConfigFile::default();
        config.routing.classifier_model = "gemma-3-27b".to_string();
        let settings = RouterSettings::from_config(config).unwrap();

        route(&ask("Design a weekly meal plan."), &full_inventory(), &settings, &classifier)
            .await
            .unwrap();
        assert_eq!(backend.calls()[0].model, "gemma-3-27b");
    }

    #[tokio::test]
    async fn test_classifier_failure_degrades() {
        let (_, classifier) = classifier_answering("no idea");
        let decision = route(
            &ask("Design a weekly meal plan."),
            &full_inventory(),
            &settings(),
            &classifier,
        )
        .await
        .unwrap();

        assert_eq!(decision.routing_source, RoutingSource::Classifier);
        assert_eq!(decision.heuristic_score, Some(0.45));
        assert_eq!(decision.tier, Tier::Small);
        assert!(
            decision
                .reasons
                .iter()
                .any(|r| r.starts_with("classifier degraded"))
        );
    }

    #[tokio::test]
    async fn test_coding_request_prefers_coder_model() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let context = "Our billing service keeps timing out under load. ".repeat(16);
        let request = ask(&format!(
            "{context}Give me a step-by-step plan to refactor the Rust code."
        ));

        let decision = route(&request, &full_inventory(), &settings(), &classifier)
            .await
            .unwrap();
        assert_eq!(decision.tier, Tier::Large);
        assert!(decision.prefer_coder);
        assert_eq!(decision.selected_model, "qwen2.5-coder-32b");

        let mut config = ConfigFile::default();
        config.routing.prefer_coder = false;
        let no_coder = RouterSettings::from_config(config).unwrap();
        let decision = route(&request, &full_inventory(), &no_coder, &classifier)
            .await
            .unwrap();
        assert!(!decision.prefer_coder);
        assert_eq!(decision.selected_model, "gpt-oss-120b");
    }

    #[tokio::test]
    async fn test_empty_inventory_is_no_model_available() {
        let (backend, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let err = route(&ask("Hi"), &InventorySnapshot::empty(), &settings(), &classifier)
            .await
            .unwrap_err();
        assert_eq!(err, RoutingError::NoModelAvailable);
        assert!(backend.calls().is_empty());
    }

    #[tokio::test]
    async fn test_routes_against_built_snapshot() {
        let (_, classifier) = classifier_answering(r#"{"tier": "LARGE"}"#);
        let discovered: Vec<_> = ["Qwen3-30B-A3B", "qwen-3-4b"]
            .into_iter()
            .map(DiscoveredModel::from_id)
            .collect();
        let settings = Arc::new(settings());
        let snapshot = InventorySnapshot::build(&discovered, &settings, 1, Instant::now());

        let request: ChatRequest = serde_json::from_value(json!({
            "model": "Qwen3-30B-A3B",
            "messages": [{"role": "user", "content": "Hi"}]
        }))
        .unwrap();
        let decision = route(&request, &snapshot, &settings, &classifier)
            .await
            .unwrap();
        assert_eq!(decision.tier, Tier::Large);
    }

    #[test]
    fn test_is_coding_request() {
        assert!(is_coding_request(&ask("Why does this Python function fail?")));
        assert!(is_coding_request(&ask("Schreib ein Skript für den Export")));
        assert!(is_coding_request(&ask("look:\n```\nx = 1\n```")));
        assert!(!is_coding_request(&ask("What is the capital of France?")));

        // Only the last three user messages count.
        let request = ChatRequest {
            messages: vec![
                Message::new("user", "Fix this bug in my code"),
                Message::new("user", "Thanks"),
                Message::new("user", "Nice weather"),
                Message::new("user", "Tell me a joke"),
            ],
            ..ChatRequest::default()
        };
        assert!(!is_coding_request(&request));
    }
}
