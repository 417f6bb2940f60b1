//! Discovery side of a harvest run.
//!
//! `ScanDriver` walks the ordered listing range by range, feeding the pipeline and folding its
//! completions back into `OrderedProgress`. `search` pages through keyword results with item
//! leases only.

mod driver;
mod search;
mod source;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::commit_governor::BackoffPolicy;
use crate::coordination::CoordinationError;
use crate::pipeline::PipelineError;
use crate::progress::ProgressStoreError;

pub use driver::ScanDriver;
pub use search::{search, SearchConfig, SearchSummary};
pub use source::{DiscoveredItem, DiscoveryError, DiscoveryErrorKind, ItemSource};

/// What the scan does when discovery reports a rate limit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// End the scan; leased ranges are drained and released.
    #[default]
    Stop,
    /// Sleep for at least this long (or the server's `retry_after`) and retry the page.
    Backoff(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScanConfig {
    /// Frontier used when no progress snapshot exists yet.
    pub start_position: u64,
    /// Exclusive upper bound on scan positions.
    pub end_position: Option<u64>,
    /// Stop selecting new ranges once this many entries were accepted.
    pub max_items: Option<u64>,
    pub range_heartbeat: Duration,
    pub range_progress_interval: Duration,
    /// Ranges submitted but not yet fully completed before selection waits.
    pub max_active_ranges: usize,
    /// Tick for lease upkeep while waiting on completions.
    pub poll_interval: Duration,
    pub rate_limit: RateLimitPolicy,
    pub discovery_retry: BackoffPolicy,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            start_position: 0,
            end_position: None,
            max_items: None,
            range_heartbeat: Duration::from_secs(600),
            range_progress_interval: Duration::from_secs(300),
            max_active_ranges: 2,
            poll_interval: Duration::from_secs(1),
            rate_limit: RateLimitPolicy::Stop,
            discovery_retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Reached the end of the listing or `end_position`.
    Exhausted,
    LimitReached,
    RateLimited,
    Stopped,
    /// A pipeline worker exited early; completions can no longer arrive.
    PipelineClosed,
}

impl StopReason {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::LimitReached => "limit_reached",
            Self::RateLimited => "rate_limited",
            Self::Stopped => "stopped",
            Self::PipelineClosed => "pipeline_closed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScanSummary {
    pub start_frontier: u64,
    pub frontier: u64,
    pub submitted: u64,
    pub skipped_done: u64,
    pub skipped_locked: u64,
    pub ranges_acquired: u64,
    pub ranges_done: u64,
    pub ranges_released: u64,
    pub fallback_windows: u64,
    pub stop_reason: StopReason,
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error(transparent)]
    Progress(#[from] ProgressStoreError),
    #[error("discovery failed after {attempts} attempts: {source}")]
    Discovery {
        #[source]
        source: DiscoveryError,
        attempts: u32,
    },
}

#[cfg(test)]
pub(crate) mod test_support;
