//! reqwest-backed discovery and download against the photo API.
//!
//! Both `HttpItemSource` and `HttpItemFetcher` go through one `ApiClient`, so listing pages,
//! search pages and download-location lookups share a single `governor` request budget.

mod error_mapping;
mod fetcher;
mod source;

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use reqwest::header::{HeaderMap, ACCEPT, AUTHORIZATION, RETRY_AFTER};
use reqwest::{RequestBuilder, Response};
use thiserror::Error;
use tracing::debug;

pub use error_mapping::{is_rate_limit_exceeded, parse_retry_after};
pub use fetcher::HttpItemFetcher;
pub use source::HttpItemSource;

pub type GlobalRateLimiter = Arc<RateLimiter<NotKeyed, InMemoryState, DefaultClock>>;

/// One request budget per process, spent by every API call including retries.
pub fn global_rate_limiter(requests_per_minute: NonZeroU32) -> GlobalRateLimiter {
    Arc::new(RateLimiter::direct(Quota::per_minute(requests_per_minute)))
}

const RATE_LIMIT_REMAINING: &str = "X-Ratelimit-Remaining";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpSourceConfig {
    pub base_url: String,
    /// Sent as `Authorization: Client-ID {token}`.
    pub access_token: Option<String>,
    /// Listing page size; the API caps it at 30.
    pub list_page_size: u64,
    pub search_page_size: u64,
    /// Listing order. Must be stable for scan positions to mean anything.
    pub order_by: String,
    pub request_timeout: Duration,
    pub download_timeout: Duration,
    pub user_agent: String,
}

impl Default for HttpSourceConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.unsplash.com".to_string(),
            access_token: None,
            list_page_size: 30,
            search_page_size: 10,
            order_by: "oldest".to_string(),
            request_timeout: Duration::from_secs(20),
            download_timeout: Duration::from_secs(30),
            user_agent: format!("harvest-worker/{}", crate::build_info::VERSION),
        }
    }
}

impl HttpSourceConfig {
    pub fn clamped(mut self) -> Self {
        self.list_page_size = self.list_page_size.clamp(1, 30);
        self.search_page_size = self.search_page_size.clamp(1, 30);
        self.base_url = self.base_url.trim_end_matches('/').to_string();
        self
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("unexpected HTTP status while fetching {resource}: {status}")]
    UnexpectedStatus { resource: String, status: u16 },
    #[error("rate limited while fetching {resource} (status {status})")]
    RateLimited {
        resource: String,
        status: u16,
        retry_after: Option<Duration>,
    },
    #[error("malformed response for {resource}: {message}")]
    Malformed { resource: String, message: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Thin wrapper over `reqwest::Client` that applies auth headers, the shared rate limiter and
/// rate-limit detection to every API call.
pub struct ApiClient {
    client: reqwest::Client,
    config: HttpSourceConfig,
    limiter: GlobalRateLimiter,
}

impl ApiClient {
    pub fn new(config: HttpSourceConfig, limiter: GlobalRateLimiter) -> Result<Self, ApiError> {
        let config = config.clamped();
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config,
            limiter,
        })
    }

    pub fn config(&self) -> &HttpSourceConfig {
        &self.config
    }

    fn api_request(&self, url: &str) -> RequestBuilder {
        let mut request = self
            .client
            .get(url)
            .timeout(self.config.request_timeout)
            .header(ACCEPT, "application/json")
            .header("Accept-Version", "v1");
        if let Some(token) = &self.config.access_token {
            request = request.header(AUTHORIZATION, format!("Client-ID {}", token.trim()));
        }
        request
    }

    /// Sends an authenticated API call and decodes the JSON body.
    async fn get_json(
        &self,
        url: &str,
        query: &[(&str, String)],
        resource: &str,
    ) -> Result<serde_json::Value, ApiError> {
        self.limiter.until_ready().await;
        let response = self.api_request(url).query(query).send().await?;
        let response = check_status(response, resource).await?;
        Ok(response.json::<serde_json::Value>().await?)
    }

    /// Downloads raw bytes from a CDN URL. These requests do not count against the API budget.
    async fn get_bytes(&self, url: &str, resource: &str) -> Result<(Vec<u8>, Option<String>), ApiError> {
        let response = self
            .client
            .get(url)
            .timeout(self.config.download_timeout)
            .send()
            .await?;
        let response = check_status(response, resource).await?;
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response.bytes().await?;
        Ok((bytes.to_vec(), content_type))
    }
}

async fn check_status(response: Response, resource: &str) -> Result<Response, ApiError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let retry_after = parse_retry_after(response.headers());
    let remaining = remaining_budget(response.headers());
    // 403 bodies are the only place some APIs say "Rate Limit Exceeded".
    let body = if status == 403 {
        response.text().await.unwrap_or_default()
    } else {
        String::new()
    };

    if is_rate_limit_exceeded(status, remaining.as_deref(), &body) {
        debug!(
            event = "api_rate_limited",
            resource,
            status,
            retry_after_ms = retry_after.map(|wait| wait.as_millis() as u64),
            remaining = ?remaining,
            "API reported rate limit"
        );
        return Err(ApiError::RateLimited {
            resource: resource.to_string(),
            status,
            retry_after,
        });
    }
    Err(ApiError::UnexpectedStatus {
        resource: resource.to_string(),
        status,
    })
}

fn remaining_budget(headers: &HeaderMap) -> Option<String> {
    headers
        .get(RATE_LIMIT_REMAINING)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
}

fn retry_after_header(headers: &HeaderMap) -> Option<&str> {
    headers.get(RETRY_AFTER).and_then(|value| value.to_str().ok())
}

#[cfg(test)]
mod tests;
