//! The OpenAI-compatible backend the router sits in front of.
//!
//! One [`Backend`] serves three purposes: listing models for the inventory, answering
//! classifier prompts, and carrying the client's chat completion once a model is chosen.
use crate::classifier::CompletionBackend;
use crate::client::HttpClient;
use crate::errors::BackendError;
use crate::inventory::{DiscoveredModel, ModelSource};
use crate::settings::{RouterSettings, SharedSettings};
use async_trait::async_trait;
use axum::body::{Body, Bytes};
use axum::http::{Method, Request, Uri, header};
use axum::response::Response;
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, instrument};

/// How long model discovery may take before the refresh is abandoned.
pub const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(10);

const CLASSIFIER_MAX_TOKENS: u32 = 100;

#[derive(Debug, Deserialize)]
struct ModelList {
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Clone)]
pub struct Backend<T: HttpClient> {
    http_client: Arc<T>,
    settings: SharedSettings,
}

/// `{base_url}/{path}`, keeping any path prefix of the base URL (usually `/v1`).
pub fn endpoint(settings: &RouterSettings, path: &str) -> Result<Uri, BackendError> {
    let url = format!(
        "{}/{}",
        settings.base_url.as_str().trim_end_matches('/'),
        path.trim_start_matches('/')
    );
    Uri::try_from(&url).map_err(|e| BackendError::InvalidRequest(format!("{url}: {e}")))
}

impl<T: HttpClient> Backend<T> {
    pub fn new(http_client: Arc<T>, settings: SharedSettings) -> Self {
        Self {
            http_client,
            settings,
        }
    }

    fn build_request(&self, method: Method, path: &str, body: Body) -> Result<Request<Body>, BackendError> {
        let settings = self.settings.current();
        let mut builder = Request::builder()
            .method(method)
            .uri(endpoint(&settings, path)?)
            .header(header::CONTENT_TYPE, "application/json");

        if let Some(key) = &settings.api_key {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {key}"));
        }

        builder
            .body(body)
            .map_err(|e| BackendError::InvalidRequest(e.to_string()))
    }

    async fn send(&self, req: Request<Body>) -> Result<Response, BackendError> {
        let uri = req.uri().clone();
        self.http_client.request(req).await.map_err(|e| {
            error!("Error sending request to backend url {}: {}", uri, e);
            BackendError::Transport(e.to_string())
        })
    }

    /// Send a request and decode a successful JSON response.
    async fn send_json<R: serde::de::DeserializeOwned>(
        &self,
        req: Request<Body>,
    ) -> Result<R, BackendError> {
        let response = self.send(req).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BackendError::Status(status));
        }

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .map_err(|e| BackendError::Transport(e.to_string()))?;
        serde_json::from_slice(&bytes).map_err(|e| BackendError::Malformed(e.to_string()))
    }

    /// Forward a chat completion body to the backend and return its response untouched, so
    /// streamed bodies pass straight through.
    #[instrument(skip_all, fields(len = body.len()))]
    pub async fn forward_chat(&self, body: Bytes) -> Result<Response, BackendError> {
        let req = self.build_request(Method::POST, "chat/completions", Body::from(body))?;
        let response = self.send(req).await?;
        debug!(status = %response.status(), "Backend answered chat completion");
        Ok(response)
    }
}

#[async_trait]
impl<T: HttpClient> ModelSource for Backend<T> {
    #[instrument(skip(self))]
    async fn list_models(&self) -> Result<Vec<DiscoveredModel>, BackendError> {
        let req = self.build_request(Method::GET, "models", Body::empty())?;
        let list: ModelList = tokio::time::timeout(DISCOVERY_TIMEOUT, self.send_json(req))
            .await
            .map_err(|_| BackendError::Timeout(DISCOVERY_TIMEOUT))??;

        debug!(count = list.data.len(), "Discovered models");
        Ok(list
            .data
            .into_iter()
            .map(|m| DiscoveredModel::from_id(m.id))
            .collect())
    }
}

#[async_trait]
impl<T: HttpClient> CompletionBackend for Backend<T> {
    #[instrument(skip(self, system, prompt))]
    async fn complete(&self, model: &str, system: &str, prompt: &str) -> Result<String, BackendError> {
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": prompt}
            ],
            "temperature": 0.0,
            "max_tokens": CLASSIFIER_MAX_TOKENS,
            "stream": false
        });
        let body = serde_json::to_vec(&body).map_err(|e| BackendError::InvalidRequest(e.to_string()))?;
        let req = self.build_request(Method::POST, "chat/completions", Body::from(body))?;

        let completion: serde_json::Value = self.send_json(req).await?;
        completion["choices"][0]["message"]["content"]
            .as_str()
            .map(|text| text.trim().to_string())
            .ok_or_else(|| BackendError::Malformed("completion has no message content".to_string()))
    }
}
