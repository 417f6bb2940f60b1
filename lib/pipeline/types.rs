use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::commit_governor::BackoffPolicy;
use crate::coordination::Range;
use crate::work::WorkId;

/// Last stage an entry reached. Persisted in the queue log for operator listings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    #[default]
    Intake,
    Download,
    Process,
    Publish,
}

/// Per-entry override of the publish policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PublishOverride {
    #[default]
    Default,
    /// Skip the done check at intake and publish even when publishing is disabled.
    Force,
    /// Run the item through processing but write nothing to the shared store.
    Suppress,
}

impl PublishOverride {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "default" => Some(Self::Default),
            "force" => Some(Self::Force),
            "suppress" => Some(Self::Suppress),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryOrigin {
    #[default]
    Scan,
    Manual,
    Search,
}

impl EntryOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Scan => "scan",
            Self::Manual => "manual",
            Self::Search => "search",
        }
    }
}

/// One unit of work moving through the local pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub work_id: WorkId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u64>,
    #[serde(default)]
    pub stage: Stage,
    #[serde(default)]
    pub attempt_count: u32,
    #[serde(default)]
    pub publish_override: PublishOverride,
    /// Set when the entry was claimed under a range lease; no item lease is taken then.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range: Option<Range>,
    #[serde(default)]
    pub origin: EntryOrigin,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

impl QueueEntry {
    pub fn new(work_id: WorkId, origin: EntryOrigin) -> Self {
        Self {
            work_id,
            position: None,
            stage: Stage::Intake,
            attempt_count: 0,
            publish_override: PublishOverride::Default,
            range: None,
            origin,
            download_url: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_position(mut self, position: u64) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_range(mut self, range: Range) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_override(mut self, publish_override: PublishOverride) -> Self {
        self.publish_override = publish_override;
        self
    }

    pub fn with_download_url(mut self, url: impl Into<String>) -> Self {
        self.download_url = Some(url.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }

    pub(crate) fn holds_item_lease(&self) -> bool {
        self.range.is_none()
    }
}

/// Queue capacities, pool sizes and publish batching.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PipelineConfig {
    pub download_queue: usize,
    pub process_queue: usize,
    pub publish_queue: usize,
    pub download_workers: usize,
    pub process_workers: usize,
    /// Publish workers share one queue; each batches and commits on its own.
    pub publish_workers: usize,
    pub batch_size: usize,
    pub batch_wait: Duration,
    pub fetch_retry: BackoffPolicy,
    /// When false only `Force` entries reach the shared store.
    pub publish_enabled: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            download_queue: 8,
            process_queue: 8,
            publish_queue: 256,
            download_workers: 2,
            process_workers: 1,
            publish_workers: 2,
            batch_size: 8,
            batch_wait: Duration::from_millis(500),
            fetch_retry: BackoffPolicy {
                max_attempts: 4,
                base_delay: Duration::from_millis(250),
                multiplier: 2.0,
                max_delay: Duration::from_secs(5),
                jitter: 0.2,
            },
            publish_enabled: true,
        }
    }
}

impl PipelineConfig {
    pub fn clamped(self) -> Self {
        Self {
            download_queue: self.download_queue.max(1),
            process_queue: self.process_queue.max(1),
            publish_queue: self.publish_queue.max(1),
            download_workers: self.download_workers.max(1),
            process_workers: self.process_workers.max(1),
            publish_workers: self.publish_workers.max(1),
            batch_size: self.batch_size.clamp(1, 64),
            batch_wait: self.batch_wait.min(Duration::from_secs(5)),
            ..self
        }
    }
}

/// Result of handing one entry to the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted { seq: u64 },
    SkippedDone,
    SkippedLocked { owner: String },
    /// The pipeline is stopping; nothing was written.
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionKind {
    Published,
    /// Finished locally without writing to the shared store.
    Suppressed,
    Failed,
    SkippedDone,
}

impl CompletionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Published => "published",
            Self::Suppressed => "suppressed",
            Self::Failed => "failed",
            Self::SkippedDone => "skipped_done",
        }
    }
}

/// Emitted once per accepted entry when it leaves the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionEvent {
    pub work_id: WorkId,
    pub position: Option<u64>,
    pub range: Option<Range>,
    pub origin: EntryOrigin,
    pub kind: CompletionKind,
}

impl CompletionEvent {
    pub(crate) fn for_entry(entry: &QueueEntry, kind: CompletionKind) -> Self {
        Self {
            work_id: entry.work_id.clone(),
            position: entry.position,
            range: entry.range,
            origin: entry.origin,
            kind,
        }
    }
}

/// Rollup of one pipeline run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineSummary {
    pub downloaded: usize,
    pub processed: usize,
    pub published: usize,
    pub suppressed: usize,
    pub failed: usize,
    pub publish_batches: usize,
    pub had_fatal_failures: bool,
}

impl PipelineSummary {
    pub(crate) fn merge(&mut self, other: PipelineSummary) {
        self.downloaded += other.downloaded;
        self.processed += other.processed;
        self.published += other.published;
        self.suppressed += other.suppressed;
        self.failed += other.failed;
        self.publish_batches += other.publish_batches;
        self.had_fatal_failures |= other.had_fatal_failures;
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoverySummary {
    pub replayed: usize,
    pub requeued: usize,
    pub skipped_done: usize,
    /// Leased by another owner; left in the queue log for a later run.
    pub skipped_locked: usize,
    /// Scan positions of the requeued entries.
    pub requeued_positions: Vec<u64>,
}

#[cfg(test)]
mod tests {
    use super::{EntryOrigin, PipelineConfig, PublishOverride, QueueEntry};
    use crate::work::WorkId;
    use std::time::Duration;

    #[test]
    fn entry_json_omits_unset_fields() {
        let entry = QueueEntry::new(WorkId::parse("p1").expect("id"), EntryOrigin::Manual)
            .with_override(PublishOverride::Force);
        let json = serde_json::to_value(&entry).expect("encode");
        assert_eq!(json["work_id"], "p1");
        assert_eq!(json["publish_override"], "force");
        assert_eq!(json["origin"], "manual");
        assert!(json.get("position").is_none());
        assert!(json.get("metadata").is_none());

        let decoded: QueueEntry =
            serde_json::from_str(r#"{"work_id":"p2","position":7}"#).expect("decode");
        assert_eq!(decoded.position, Some(7));
        assert_eq!(decoded.origin, EntryOrigin::Scan);
        assert_eq!(decoded.publish_override, PublishOverride::Default);
    }

    #[test]
    fn batch_knobs_are_clamped() {
        let config = PipelineConfig {
            batch_size: 500,
            batch_wait: Duration::from_secs(60),
            download_workers: 0,
            publish_workers: 0,
            ..PipelineConfig::default()
        }
        .clamped();
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.batch_wait, Duration::from_secs(5));
        assert_eq!(config.download_workers, 1);
        assert_eq!(config.publish_workers, 1);
        assert_eq!(PipelineConfig { batch_size: 0, ..PipelineConfig::default() }.clamped().batch_size, 1);
    }

    #[test]
    fn publish_override_parses_case_insensitively() {
        assert_eq!(PublishOverride::parse("FORCE"), Some(PublishOverride::Force));
        assert_eq!(PublishOverride::parse(" suppress "), Some(PublishOverride::Suppress));
        assert_eq!(PublishOverride::parse("maybe"), None);
    }
}
