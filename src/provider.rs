use anyhow::Context as _;

use crate::config::Config;
use crate::error::{AppError, map_upstream_status};
use crate::models::{UpstreamRequest, UpstreamResponse};

/// HTTP client for the upstream chat-completions endpoint. Every outbound
/// call the gateway makes goes through here, so classification of
/// transport failures happens in exactly one place.
///
/// Two connection pools: the unary client enforces a total read timeout,
/// the streaming client must not (a healthy stream can outlive any fixed
/// deadline; idleness is policed per-chunk in `streaming`).
pub struct UpstreamClient {
    unary: reqwest::Client,
    streaming: reqwest::Client,
    url: String,
    api_key: String,
}

impl UpstreamClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let unary = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .timeout(config.read_timeout())
            .pool_max_idle_per_host(config.upstream.pool_max_idle_per_host)
            .build()
            .context("building unary upstream client")?;
        let streaming = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.upstream.pool_max_idle_per_host)
            .build()
            .context("building streaming upstream client")?;
        Ok(Self {
            unary,
            streaming,
            url: config.chat_completions_url(),
            api_key: config.upstream.api_key.clone(),
        })
    }

    /// One blocking completion round-trip.
    pub async fn complete(&self, request: &UpstreamRequest) -> Result<UpstreamResponse, AppError> {
        let response = self
            .unary
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_upstream_status(status, &body));
        }
        response.json::<UpstreamResponse>().await.map_err(|e| {
            AppError::upstream_protocol(format!("upstream response is not valid JSON: {}", e))
        })
    }

    /// Opens a streaming completion. A non-2xx status before the first
    /// event fails the request outright; once this returns the caller
    /// owns the byte stream.
    pub async fn open_stream(&self, request: &UpstreamRequest) -> Result<reqwest::Response, AppError> {
        let response = self
            .streaming
            .post(&self.url)
            .bearer_auth(&self.api_key)
            .json(request)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(map_upstream_status(status, &body));
        }
        Ok(response)
    }
}

pub fn classify_transport_error(error: &reqwest::Error) -> AppError {
    if error.is_timeout() {
        AppError::upstream_timeout(format!("upstream call timed out: {}", error))
    } else if error.is_connect() {
        AppError::service_failure(format!("could not reach upstream: {}", error))
    } else {
        AppError::service_failure(format!("upstream transport error: {}", error))
    }
}
