//! Smart Router - a model-selecting LLM gateway
//!
//! This library decides, per chat completion request, which backend model tier (SMALL, MEDIUM or
//! LARGE) and which concrete model should serve it, then forwards the request to an
//! OpenAI-compatible backend.

use axum::Router;
use axum::routing::{get, post};
use axum_prometheus::{
    GenericMetricLayer, Handle, PrometheusMetricLayerBuilder,
    metrics_exporter_prometheus::PrometheusHandle,
};
use std::borrow::Cow;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, instrument};

pub mod backend;
pub mod classifier;
pub mod client;
pub mod errors;
pub mod handlers;
pub mod inventory;
pub mod models;
pub mod params;
pub mod routing;
pub mod scorer;
pub mod settings;

use backend::Backend;
use classifier::TierClassifier;
use client::{HttpClient, HyperClient};
use handlers::{admin_reload, chat_completions, health, models as models_handler};
use inventory::ModelInventory;
use settings::{RouterSettings, SharedSettings};

/// The main application state: the backend, the live settings and the live model inventory
#[derive(Clone, Debug)]
pub struct AppState<T: HttpClient> {
    pub backend: Arc<Backend<T>>,
    pub settings: SharedSettings,
    pub inventory: ModelInventory,
    pub classifier: TierClassifier,
    /// Re-read by `POST /admin/reload`.
    pub config_path: Option<PathBuf>,
}

impl AppState<HyperClient> {
    /// Create a new AppState with a pooled Hyper client
    pub fn new(
        settings: RouterSettings,
        pool_idle_timeout_secs: u64,
        pool_max_idle_per_host: usize,
    ) -> Self {
        let http_client = client::create_hyper_client(pool_idle_timeout_secs, pool_max_idle_per_host);
        Self::with_client(settings, http_client)
    }
}

impl<T: HttpClient> AppState<T> {
    /// Create a new AppState with a custom HTTP client (useful for testing)
    pub fn with_client(settings: RouterSettings, http_client: T) -> Self {
        let settings = SharedSettings::new(settings);
        let backend = Arc::new(Backend::new(Arc::new(http_client), settings.clone()));
        let inventory = ModelInventory::new(backend.clone(), settings.clone());
        let classifier = TierClassifier::new(backend.clone());
        Self {
            backend,
            settings,
            inventory,
            classifier,
            config_path: None,
        }
    }

    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }
}

/// Build the main router
/// This creates routes for:
/// - `/v1/chat/completions` - Routes and forwards chat completions
/// - `/v1/models` - Returns the router's virtual model
/// - `/health` - Liveness and inventory size
/// - `/admin/reload` - Reloads the config file and rediscovers models
#[instrument(skip(state))]
pub fn build_router<T: HttpClient + Clone>(state: AppState<T>) -> Router {
    info!("Building router");
    Router::new()
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(models_handler))
        .route("/health", get(health))
        .route("/admin/reload", post(admin_reload))
        .with_state(state)
}

/// Builds a router for the metrics endpoint.
#[instrument(skip(handle))]
pub fn build_metrics_router(handle: PrometheusHandle) -> Router {
    info!("Building metrics router");
    Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

type MetricsLayerAndHandle = (
    GenericMetricLayer<'static, PrometheusHandle, Handle>,
    PrometheusHandle,
);

/// Builds a layer and handle for prometheus metrics collection.
///
/// `prefix` must live for the whole program, as the Prometheus layer requires.
pub fn build_metrics_layer_and_handle(
    prefix: impl Into<Cow<'static, str>>,
) -> MetricsLayerAndHandle {
    info!("Building metrics layer");
    PrometheusMetricLayerBuilder::new()
        .with_prefix(prefix)
        .enable_response_body_size(true)
        .with_endpoint_label_type(axum_prometheus::EndpointLabel::Exact)
        .with_default_metrics()
        .build_pair()
}
