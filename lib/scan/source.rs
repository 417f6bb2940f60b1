use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::warn;

use super::{RateLimitPolicy, ScanError};
use crate::commit_governor::{run_with_retry, BackoffPolicy, RetryClass};
use crate::pipeline::ControlHandle;
use crate::work::WorkId;

/// One item as reported by the discovery API.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredItem {
    pub work_id: WorkId,
    pub download_url: Option<String>,
    pub metadata: serde_json::Value,
}

impl DiscoveredItem {
    pub fn new(work_id: WorkId) -> Self {
        Self {
            work_id,
            download_url: None,
            metadata: serde_json::Value::Null,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryErrorKind {
    /// The API asked us to slow down. Never retried in place; escalates to the scan's
    /// `RateLimitPolicy`.
    RateLimited,
    Transient,
    Fatal,
}

#[derive(Error, Debug, Clone)]
#[error("{kind:?} discovery error: {message}")]
pub struct DiscoveryError {
    pub kind: DiscoveryErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl DiscoveryError {
    pub fn new(kind: DiscoveryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn rate_limited(retry_after: Option<Duration>) -> Self {
        Self {
            kind: DiscoveryErrorKind::RateLimited,
            message: "discovery API rate limit reached".to_string(),
            retry_after,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == DiscoveryErrorKind::Transient
    }
}

impl RetryClass for DiscoveryError {
    fn is_retryable(&self) -> bool {
        DiscoveryError::is_retryable(self)
    }
}

/// Lazy paginated discovery.
///
/// The ordered listing is oldest-first and stable: listing page `p` holds positions
/// `[p * page_size, (p + 1) * page_size)`. A page shorter than `page_size` marks the end.
/// Search results carry no positions.
pub trait ItemSource: Send + Sync {
    fn page_size(&self) -> u64;

    fn list_page<'a>(
        &'a self,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>>;

    fn search<'a>(
        &'a self,
        query: &'a str,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>>;
}

impl<T> ItemSource for Arc<T>
where
    T: ItemSource + ?Sized,
{
    fn page_size(&self) -> u64 {
        (**self).page_size()
    }

    fn list_page<'a>(
        &'a self,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        (**self).list_page(page)
    }

    fn search<'a>(
        &'a self,
        query: &'a str,
        page: u64,
    ) -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>> {
        (**self).search(query, page)
    }
}

pub(crate) enum Discovery {
    Items(Vec<DiscoveredItem>),
    RateLimited,
    Stopped,
}

/// Fetches one page, retrying transient errors and applying the rate-limit policy.
pub(crate) async fn discover<'a, F>(
    control: &ControlHandle,
    rate_limit: RateLimitPolicy,
    retry: &BackoffPolicy,
    mut call: F,
) -> Result<Discovery, ScanError>
where
    F: FnMut() -> BoxFuture<'a, Result<Vec<DiscoveredItem>, DiscoveryError>>,
{
    loop {
        let terminal = match run_with_retry(retry, |_| call()).await {
            Ok((items, _)) => return Ok(Discovery::Items(items)),
            Err(terminal) => terminal,
        };
        if terminal.error.kind != DiscoveryErrorKind::RateLimited {
            return Err(ScanError::Discovery {
                source: terminal.error,
                attempts: terminal.attempts,
            });
        }

        let wait = match rate_limit {
            RateLimitPolicy::Stop => {
                warn!(
                    event = "discovery_rate_limited",
                    policy = "stop",
                    "discovery rate limited; ending scan"
                );
                return Ok(Discovery::RateLimited);
            }
            RateLimitPolicy::Backoff(wait) => terminal
                .error
                .retry_after
                .map_or(wait, |retry_after| retry_after.max(wait)),
        };
        warn!(
            event = "discovery_rate_limited",
            policy = "backoff",
            wait_ms = wait.as_millis() as u64,
            "discovery rate limited; sleeping before retry"
        );
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = control.stopped() => return Ok(Discovery::Stopped),
        }
    }
}
