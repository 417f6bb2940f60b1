use serde::Serialize;
use tracing::{debug, info};

use super::source::{discover, Discovery, ItemSource};
use super::{RateLimitPolicy, ScanError, StopReason};
use crate::commit_governor::BackoffPolicy;
use crate::pipeline::{EntryOrigin, QueueEntry, RunningPipeline, SubmitOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct SearchConfig {
    pub queries: Vec<String>,
    /// Pages fetched per query before moving to the next one.
    pub max_pages: u64,
    pub max_items: Option<u64>,
    pub rate_limit: RateLimitPolicy,
    pub discovery_retry: BackoffPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            queries: Vec::new(),
            max_pages: 10,
            max_items: None,
            rate_limit: RateLimitPolicy::Stop,
            discovery_retry: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SearchSummary {
    pub pages: u64,
    pub submitted: u64,
    pub skipped_done: u64,
    pub skipped_locked: u64,
    pub stop_reason: Option<StopReason>,
}

/// Pages through keyword results and submits every item under an item lease.
///
/// Search results have no stable order, so nothing is recorded in scan progress.
pub async fn search(
    source: &dyn ItemSource,
    pipeline: &RunningPipeline,
    config: &SearchConfig,
) -> Result<SearchSummary, ScanError> {
    let control = pipeline.control();
    let mut summary = SearchSummary::default();

    let reason = 'queries: {
        for query in &config.queries {
            for page in 0..config.max_pages {
                if !control.checkpoint().await {
                    break 'queries StopReason::Stopped;
                }
                let items = match discover(
                    control,
                    config.rate_limit,
                    &config.discovery_retry,
                    || source.search(query, page),
                )
                .await?
                {
                    Discovery::Items(items) => items,
                    Discovery::RateLimited => break 'queries StopReason::RateLimited,
                    Discovery::Stopped => break 'queries StopReason::Stopped,
                };
                summary.pages += 1;
                if items.is_empty() {
                    debug!(event = "search_query_exhausted", query = %query, page, "no more results");
                    break;
                }

                for item in items {
                    if config
                        .max_items
                        .is_some_and(|max| summary.submitted >= max)
                    {
                        break 'queries StopReason::LimitReached;
                    }
                    let mut entry = QueueEntry::new(item.work_id, EntryOrigin::Search)
                        .with_metadata(item.metadata);
                    if let Some(url) = item.download_url {
                        entry = entry.with_download_url(url);
                    }
                    match pipeline.submit(entry).await? {
                        SubmitOutcome::Accepted { .. } => summary.submitted += 1,
                        SubmitOutcome::SkippedDone => summary.skipped_done += 1,
                        SubmitOutcome::SkippedLocked { .. } => summary.skipped_locked += 1,
                        SubmitOutcome::Stopped => break 'queries StopReason::Stopped,
                    }
                }
            }
        }
        StopReason::Exhausted
    };

    summary.stop_reason = Some(reason);
    info!(
        event = "search_finished",
        reason = reason.as_str(),
        pages = summary.pages,
        submitted = summary.submitted,
        skipped_done = summary.skipped_done,
        skipped_locked = summary.skipped_locked,
        "search pass finished"
    );
    Ok(summary)
}
