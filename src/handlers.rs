/// Axum handlers for the router
use crate::AppState;
use crate::client::HttpClient;
use crate::errors::{BackendError, GatewayError};
use crate::models::{ChatRequest, ListModelResponse, Model};
use crate::routing::{self, RoutingDecision};
use crate::settings::RouterSettings;
use axum::{
    Json,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderValue, header},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};
use tracing::{debug, error, info, instrument, warn};

pub const ROUTED_MODEL_HEADER: &str = "x-smart-router-model";
pub const ROUTED_TIER_HEADER: &str = "x-smart-router-tier";

/// Field added to non-streaming completion bodies describing the routing decision.
pub const ROUTING_FIELD: &str = "_routing";

/// Route a chat completion to a backend model and forward it.
#[instrument(skip_all)]
pub async fn chat_completions<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
    body: Bytes,
) -> Result<Response, GatewayError> {
    debug!("Received request body of size: {}", body.len());
    let mut body: Value = serde_json::from_slice(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid JSON body: {e}")))?;
    if !body.is_object() {
        return Err(GatewayError::InvalidRequest(
            "Request body must be a JSON object".to_string(),
        ));
    }

    let request: ChatRequest = serde_json::from_value(body.clone())
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid chat completion request: {e}")))?;
    if request.messages.is_empty() {
        return Err(GatewayError::InvalidRequest(
            "messages must not be empty".to_string(),
        ));
    }

    let snapshot = state.inventory.snapshot_or_refresh().await;
    let settings = state.settings.current();
    let decision = routing::route(&request, &snapshot, &settings, &state.classifier).await?;

    if let Some(object) = body.as_object_mut() {
        object.insert(
            "model".to_string(),
            Value::String(decision.selected_model.clone()),
        );
    }
    let forwarded = serde_json::to_vec(&body)
        .map_err(|e| GatewayError::InvalidRequest(format!("Invalid JSON body: {e}")))?;

    let response = state.backend.forward_chat(Bytes::from(forwarded)).await?;
    if !response.status().is_success() {
        warn!(
            status = %response.status(),
            model = %decision.selected_model,
            "Backend rejected chat completion"
        );
    }

    let mut response = if request.is_streaming() || !response.status().is_success() {
        response
    } else {
        attach_routing(response, &decision).await?
    };

    let headers = response.headers_mut();
    match HeaderValue::from_str(&decision.selected_model) {
        Ok(value) => {
            headers.insert(ROUTED_MODEL_HEADER, value);
        }
        Err(_) => error!(model = %decision.selected_model, "Model id is not a valid header value"),
    }
    headers.insert(
        ROUTED_TIER_HEADER,
        HeaderValue::from_static(decision.tier.as_str()),
    );

    Ok(response)
}

/// Add the routing decision to a JSON completion body. Bodies that are not JSON objects are
/// returned unchanged.
async fn attach_routing(response: Response, decision: &RoutingDecision) -> Result<Response, GatewayError> {
    let (mut parts, body) = response.into_parts();
    let bytes = axum::body::to_bytes(body, usize::MAX)
        .await
        .map_err(|e| BackendError::Transport(e.to_string()))?;

    let Ok(Value::Object(mut completion)) = serde_json::from_slice::<Value>(&bytes) else {
        debug!("Backend response is not a JSON object, leaving it untouched");
        return Ok(Response::from_parts(parts, Body::from(bytes)));
    };

    completion.insert(
        ROUTING_FIELD.to_string(),
        serde_json::to_value(decision).unwrap_or_default(),
    );
    let body = serde_json::to_vec(&completion)
        .map_err(|e| BackendError::Malformed(e.to_string()))?;

    // The body changed size; let axum recompute the length.
    parts.headers.remove(header::CONTENT_LENGTH);
    Ok(Response::from_parts(parts, Body::from(body)))
}

/// Clients see only the router's virtual model.
#[instrument(skip(state))]
pub async fn models<T: HttpClient + Clone>(State(state): State<AppState<T>>) -> impl IntoResponse {
    let settings = state.settings.current();
    Json(ListModelResponse::single(Model::virtual_model(
        &settings.model_name,
    )))
}

#[instrument(skip(state))]
pub async fn health<T: HttpClient + Clone>(State(state): State<AppState<T>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "models_loaded": state.inventory.snapshot().len()
    }))
}

/// Re-read the config file (if the server has one) and rediscover models.
#[instrument(skip(state))]
pub async fn admin_reload<T: HttpClient + Clone>(
    State(state): State<AppState<T>>,
) -> Result<impl IntoResponse, GatewayError> {
    if let Some(path) = &state.config_path {
        let settings = RouterSettings::from_file(path)
            .await
            .map_err(|e| GatewayError::Reload(e.to_string()))?;
        state.settings.replace(settings);
    }

    let snapshot = state.inventory.refresh().await?;
    let settings = state.settings.current();
    info!(
        generation = snapshot.generation,
        active_models = snapshot.len(),
        "Reloaded configuration and models"
    );

    Ok(Json(json!({
        "status": "reloaded",
        "model_name": settings.model_name,
        "active_models": snapshot.len(),
        "models_by_tier": snapshot.models_by_tier()
    })))
}
