use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;

use super::types::QueueEntry;
use crate::commit_governor::RetryClass;
use crate::work::WorkId;

pub const FAILURE_CLASS_NOT_FOUND: &str = "not_found";
pub const FAILURE_CLASS_DOWNLOAD: &str = "download";
pub const FAILURE_CLASS_PROCESSING: &str = "processing";

/// Raw bytes of one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedItem {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchErrorKind {
    NotFound,
    Network,
    RateLimited,
    UpstreamUnavailable,
    Unauthorized,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind:?}: {message}")]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
    pub retry_after: Option<Duration>,
}

impl FetchError {
    pub fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FetchErrorKind::Network
                | FetchErrorKind::RateLimited
                | FetchErrorKind::UpstreamUnavailable
        )
    }

    pub fn failure_class(&self) -> &'static str {
        match self.kind {
            FetchErrorKind::NotFound => FAILURE_CLASS_NOT_FOUND,
            _ => FAILURE_CLASS_DOWNLOAD,
        }
    }
}

impl RetryClass for FetchError {
    fn is_retryable(&self) -> bool {
        FetchError::is_retryable(self)
    }

    fn retry_after(&self) -> Option<Duration> {
        self.retry_after
    }
}

/// Downloads the raw bytes behind a queue entry.
pub trait ItemFetcher: Send + Sync {
    fn fetch<'a>(&'a self, entry: &'a QueueEntry) -> BoxFuture<'a, Result<FetchedItem, FetchError>>;
}

impl<T> ItemFetcher for Arc<T>
where
    T: ItemFetcher + ?Sized,
{
    fn fetch<'a>(&'a self, entry: &'a QueueEntry) -> BoxFuture<'a, Result<FetchedItem, FetchError>> {
        (**self).fetch(entry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactFile {
    pub name: String,
    pub contents: Vec<u8>,
}

/// Derived files produced for one item, published under `artifacts/{id}/`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    pub files: Vec<ArtifactFile>,
}

impl Artifact {
    pub fn single(name: impl Into<String>, contents: impl Into<Vec<u8>>) -> Self {
        Self {
            files: vec![ArtifactFile {
                name: name.into(),
                contents: contents.into(),
            }],
        }
    }

    pub fn total_bytes(&self) -> usize {
        self.files.iter().map(|file| file.contents.len()).sum()
    }
}

/// Terminal for the item: it is recorded in the failure log and never retried in this run.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("processing failed for {work_id}: {message}")]
pub struct ProcessError {
    pub work_id: WorkId,
    pub message: String,
}

impl ProcessError {
    pub fn new(work_id: &WorkId, message: impl Into<String>) -> Self {
        Self {
            work_id: work_id.clone(),
            message: message.into(),
        }
    }
}

/// Runs the external model over one downloaded item.
pub trait Processor: Send + Sync {
    fn process<'a>(
        &'a self,
        work_id: &'a WorkId,
        input: &'a FetchedItem,
    ) -> BoxFuture<'a, Result<Artifact, ProcessError>>;
}

impl<T> Processor for Arc<T>
where
    T: Processor + ?Sized,
{
    fn process<'a>(
        &'a self,
        work_id: &'a WorkId,
        input: &'a FetchedItem,
    ) -> BoxFuture<'a, Result<Artifact, ProcessError>> {
        (**self).process(work_id, input)
    }
}
