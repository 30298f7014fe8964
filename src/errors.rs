//! Error taxonomy for the router
//!
//! Failures inside scoring and classification degrade and never show up here; these are the
//! failures that make a request (or a refresh) impossible.
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::time::Duration;

/// Failures talking to the model-serving backend.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    #[error("invalid backend request: {0}")]
    InvalidRequest(String),

    #[error("backend request failed: {0}")]
    Transport(String),

    #[error("backend request timed out after {0:?}")]
    Timeout(Duration),

    #[error("backend returned status {0}")]
    Status(StatusCode),

    #[error("malformed backend response: {0}")]
    Malformed(String),
}

/// Failures that leave the router with no model to send a request to.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RoutingError {
    #[error("no models available for routing")]
    NoModelAvailable,

    #[error("model '{0}' does not exist")]
    InvalidExplicitModel(String),
}

/// Errors returned from the HTTP handlers.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("{0}")]
    InvalidRequest(String),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error("failed to reach backend: {0}")]
    Upstream(#[from] BackendError),

    #[error("failed to reload configuration: {0}")]
    Reload(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Routing(RoutingError::InvalidExplicitModel(_)) => StatusCode::NOT_FOUND,
            GatewayError::Routing(RoutingError::NoModelAvailable) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
            GatewayError::Reload(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_type(&self) -> &'static str {
        match self {
            GatewayError::InvalidRequest(_)
            | GatewayError::Routing(RoutingError::InvalidExplicitModel(_)) => {
                "invalid_request_error"
            }
            GatewayError::Upstream(_) => "upstream_error",
            GatewayError::Routing(RoutingError::NoModelAvailable) | GatewayError::Reload(_) => {
                "server_error"
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let body = json!({
            "error": {
                "type": self.error_type(),
                "message": self.to_string()
            }
        });

        (self.status(), Json(body)).into_response()
    }
}
