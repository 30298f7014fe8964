//! The HTTP transport to the OpenAI-compatible backend.
//!
//! Model discovery, classifier prompts and forwarded chat completions all go out through an
//! [`HttpClient`]. Production uses a pooled hyper client sized from the command line; tests
//! substitute scripted clients.
use async_trait::async_trait;
use axum::response::IntoResponse;
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use std::time::Duration;

pub type HyperClient = Client<
    hyper_tls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    axum::body::Body,
>;

#[async_trait]
pub trait HttpClient: std::fmt::Debug + Send + Sync + 'static {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>>;
}

#[async_trait]
impl HttpClient for HyperClient {
    async fn request(
        &self,
        req: axum::extract::Request,
    ) -> Result<axum::response::Response, Box<dyn std::error::Error + Send + Sync>> {
        self.request(req)
            .await
            .map(|res| res.into_response())
            .map_err(|e| Box::new(e) as Box<dyn std::error::Error + Send + Sync>)
    }
}

pub fn create_hyper_client(pool_idle_timeout_secs: u64, pool_max_idle_per_host: usize) -> HyperClient {
    let https = hyper_tls::HttpsConnector::new();

    tracing::debug!(
        idle_timeout_secs = pool_idle_timeout_secs,
        max_idle_per_host = pool_max_idle_per_host,
        "Backend connection pool configured"
    );

    Client::builder(TokioExecutor::new())
        .pool_idle_timeout(Duration::from_secs(pool_idle_timeout_secs))
        .pool_max_idle_per_host(pool_max_idle_per_host)
        .pool_timer(hyper_util::rt::TokioTimer::new())
        .build(https)
}
