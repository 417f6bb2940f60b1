use std::sync::{Arc, OnceLock};

use prometheus_client::registry::Registry;
use serde::Serialize;
use tokio::sync::{watch, RwLock};
use tokio_util::sync::CancellationToken;

use crate::commit_governor::{CircuitSnapshot, CommitGovernor};
use crate::pipeline::{ControlHandle, QueueDepthSnapshot, RunState, StageDepths};
use crate::progress::ProgressSnapshot;

/// Holes listed on `/status`; the full set is in the local progress file.
const STATUS_HOLES_SHOWN: usize = 32;

pub struct AppState {
    pub shutdown_token: CancellationToken,
    pub registry: RwLock<Registry>,
    pub control: ControlHandle,
    pub owner_id: String,
    pub progress: Arc<watch::Sender<Option<ProgressSnapshot>>>,
    governor: Arc<CommitGovernor>,
    depths: OnceLock<Arc<StageDepths>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProgressStatus {
    pub frontier: u64,
    pub hole_count: usize,
    pub holes: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub owner_id: String,
    pub run_state: RunState,
    pub circuit: CircuitSnapshot,
    pub progress: Option<ProgressStatus>,
    pub queue_depth: Option<QueueDepthSnapshot>,
}

impl AppState {
    pub fn new(
        shutdown_token: CancellationToken,
        control: ControlHandle,
        governor: Arc<CommitGovernor>,
        owner_id: impl Into<String>,
    ) -> Self {
        let (progress, _) = watch::channel(None);
        Self {
            shutdown_token,
            registry: RwLock::new(<Registry>::default()),
            control,
            owner_id: owner_id.into(),
            progress: Arc::new(progress),
            governor,
            depths: OnceLock::new(),
        }
    }

    /// Called once the pipeline is running so `/status` can report queue depth.
    pub fn attach_pipeline(&self, depths: Arc<StageDepths>) {
        let _ = self.depths.set(depths);
    }

    pub fn status(&self) -> StatusReport {
        let progress = self.progress.borrow().as_ref().map(|snapshot| ProgressStatus {
            frontier: snapshot.frontier,
            hole_count: snapshot.holes.len(),
            holes: snapshot.holes.iter().take(STATUS_HOLES_SHOWN).copied().collect(),
        });
        StatusReport {
            owner_id: self.owner_id.clone(),
            run_state: self.control.state(),
            circuit: self.governor.circuit(),
            progress,
            queue_depth: self.depths.get().map(|depths| depths.snapshot()),
        }
    }
}
