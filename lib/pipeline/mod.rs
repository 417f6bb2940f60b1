//! Local producer/consumer pipeline: intake → download → process → publish.
//!
//! Queues are bounded `flume` channels, so a full stage suspends the one feeding it. The queue
//! log makes every accepted entry survive a crash; `RunningPipeline::recover` replays it.

mod collaborators;
mod control;
mod failure_log;
mod orchestrator;
mod queue_log;
mod types;

use thiserror::Error;

use crate::coordination::CoordinationError;

pub use collaborators::{
    Artifact, ArtifactFile, FetchError, FetchErrorKind, FetchedItem, ItemFetcher, ProcessError,
    Processor, FAILURE_CLASS_DOWNLOAD, FAILURE_CLASS_NOT_FOUND, FAILURE_CLASS_PROCESSING,
};
pub use control::{ControlHandle, RunState};
pub use failure_log::{FailureLog, FailureLogError, FailureRecord};
pub use orchestrator::{PipelineOrchestrator, QueueDepthSnapshot, RunningPipeline, StageDepths};
pub use queue_log::{LoggedEntry, QueueLog, QueueLogError};
pub use types::{
    CompletionEvent, CompletionKind, EntryOrigin, PipelineConfig, PipelineSummary,
    PublishOverride, QueueEntry, RecoverySummary, Stage, SubmitOutcome,
};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    QueueLog(#[from] QueueLogError),
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
    #[error("task join error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

#[cfg(test)]
pub(crate) mod test_support;
