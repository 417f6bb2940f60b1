use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::sync::Semaphore;

use super::{
    Artifact, ControlHandle, EntryOrigin, FailureLog, FetchError, FetchedItem, ItemFetcher,
    LoggedEntry, PipelineConfig, PipelineOrchestrator, ProcessError, Processor, QueueEntry,
    QueueLog, RunningPipeline,
};
use crate::commit_governor::BackoffPolicy;
use crate::test_support::{shared_world, TestClient};
use crate::work::WorkId;

pub(crate) fn test_pipeline_config(batch_size: usize) -> PipelineConfig {
    PipelineConfig {
        download_queue: 4,
        process_queue: 4,
        publish_queue: 16,
        download_workers: 2,
        process_workers: 1,
        publish_workers: 1,
        batch_size,
        batch_wait: Duration::from_secs(5),
        fetch_retry: BackoffPolicy::immediate(3),
        publish_enabled: true,
    }
}

pub(crate) fn entry(id: &str) -> QueueEntry {
    QueueEntry::new(WorkId::parse(id).expect("valid id"), EntryOrigin::Scan)
}

/// Fetcher that returns the id bytes unless a plan says otherwise.
#[derive(Default)]
pub(crate) struct ScriptedFetcher {
    plans: Mutex<HashMap<String, VecDeque<Result<FetchedItem, FetchError>>>>,
    call_counts: Mutex<HashMap<String, u32>>,
}

impl ScriptedFetcher {
    pub(crate) fn with_plan(plan: Vec<(&str, Vec<Result<FetchedItem, FetchError>>)>) -> Self {
        let fetcher = Self::default();
        {
            let mut plans = fetcher.plans.lock().expect("plans mutex poisoned");
            for (id, responses) in plan {
                plans.insert(id.to_string(), responses.into_iter().collect());
            }
        }
        fetcher
    }

    pub(crate) fn calls_for(&self, id: &str) -> u32 {
        *self
            .call_counts
            .lock()
            .expect("call_counts mutex poisoned")
            .get(id)
            .unwrap_or(&0)
    }

    pub(crate) fn total_calls(&self) -> u32 {
        self.call_counts
            .lock()
            .expect("call_counts mutex poisoned")
            .values()
            .sum()
    }
}

impl ItemFetcher for ScriptedFetcher {
    fn fetch<'a>(&'a self, entry: &'a QueueEntry) -> BoxFuture<'a, Result<FetchedItem, FetchError>> {
        Box::pin(async move {
            let id = entry.work_id.to_string();
            *self
                .call_counts
                .lock()
                .expect("call_counts mutex poisoned")
                .entry(id.clone())
                .or_insert(0) += 1;

            let scripted = self
                .plans
                .lock()
                .expect("plans mutex poisoned")
                .get_mut(&id)
                .and_then(VecDeque::pop_front);
            scripted.unwrap_or_else(|| {
                Ok(FetchedItem {
                    bytes: id.into_bytes(),
                    content_type: Some("image/jpeg".to_string()),
                })
            })
        })
    }
}

/// Processor producing one `{id}.ply` file per item. Optionally gated by a semaphore so tests
/// can hold items in flight.
#[derive(Default)]
pub(crate) struct ScriptedProcessor {
    failing: Mutex<HashSet<String>>,
    gate: Option<Arc<Semaphore>>,
    processed: Mutex<Vec<String>>,
}

impl ScriptedProcessor {
    pub(crate) fn failing(ids: &[&str]) -> Self {
        Self {
            failing: Mutex::new(ids.iter().map(|id| id.to_string()).collect()),
            ..Self::default()
        }
    }

    pub(crate) fn gated(gate: Arc<Semaphore>) -> Self {
        Self {
            gate: Some(gate),
            ..Self::default()
        }
    }

    pub(crate) fn processed(&self) -> Vec<String> {
        self.processed
            .lock()
            .expect("processed mutex poisoned")
            .clone()
    }
}

impl Processor for ScriptedProcessor {
    fn process<'a>(
        &'a self,
        work_id: &'a WorkId,
        input: &'a FetchedItem,
    ) -> BoxFuture<'a, Result<Artifact, ProcessError>> {
        Box::pin(async move {
            if let Some(gate) = &self.gate {
                gate.acquire().await.expect("gate closed").forget();
            }
            self.processed
                .lock()
                .expect("processed mutex poisoned")
                .push(work_id.to_string());
            if self
                .failing
                .lock()
                .expect("failing mutex poisoned")
                .contains(work_id.as_str())
            {
                return Err(ProcessError::new(work_id, "predictor exited with status 3"));
            }
            Ok(Artifact::single(format!("{work_id}.ply"), input.bytes.clone()))
        })
    }
}

/// A pipeline wired to one simulated client, with its local files in a temp dir.
pub(crate) struct PipelineFixture {
    pub client: TestClient,
    pub fetcher: Arc<ScriptedFetcher>,
    pub processor: Arc<ScriptedProcessor>,
    pub queue_log: Arc<QueueLog>,
    pub failure_log: Arc<FailureLog>,
    pub control: ControlHandle,
    pub dir: tempfile::TempDir,
}

impl PipelineFixture {
    pub(crate) async fn new(fetcher: ScriptedFetcher, processor: ScriptedProcessor) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let (store, clock) = shared_world();
        Self::in_dir(dir, TestClient::new(&store, &clock, "worker-a"), fetcher, processor).await
    }

    pub(crate) async fn in_dir(
        dir: tempfile::TempDir,
        client: TestClient,
        fetcher: ScriptedFetcher,
        processor: ScriptedProcessor,
    ) -> Self {
        let (queue_log, _) = QueueLog::open(dir.path().join("pending_queue.jsonl"))
            .await
            .expect("open queue log");
        Self {
            client,
            fetcher: Arc::new(fetcher),
            processor: Arc::new(processor),
            queue_log: Arc::new(queue_log),
            failure_log: Arc::new(FailureLog::new(dir.path().join("failures.jsonl"), "test-run")),
            control: ControlHandle::new(),
            dir,
        }
    }

    pub(crate) fn start(&self, config: PipelineConfig) -> RunningPipeline {
        PipelineOrchestrator::new(
            config,
            self.client.coordinator.clone(),
            self.fetcher.clone(),
            self.processor.clone(),
            self.queue_log.clone(),
            self.failure_log.clone(),
            self.control.clone(),
        )
        .start()
    }

    pub(crate) async fn pending(&self) -> Vec<LoggedEntry> {
        self.queue_log.pending().await.expect("pending")
    }
}
