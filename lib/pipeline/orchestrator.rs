use std::mem;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use flume::{Receiver, Sender};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::collaborators::{
    Artifact, FetchedItem, ItemFetcher, Processor, FAILURE_CLASS_PROCESSING,
};
use super::control::ControlHandle;
use super::failure_log::{FailureLog, FailureRecord};
use super::queue_log::{LoggedEntry, QueueLog};
use super::types::{
    CompletionEvent, CompletionKind, EntryOrigin, PipelineConfig, PipelineSummary,
    PublishOverride, QueueEntry, RecoverySummary, Stage, SubmitOutcome,
};
use super::PipelineError;
use crate::commit_governor::run_with_retry;
use crate::coordination::{AcquireOutcome, CoordinationError, LockCoordinator};
use crate::lease_store::StoreFile;
use crate::logging::format_error_report;
use crate::server::monitoring::PIPELINE_METRICS;

struct Job {
    seq: u64,
    entry: QueueEntry,
}

struct Downloaded {
    job: Job,
    item: FetchedItem,
}

struct Processed {
    job: Job,
    artifact: Artifact,
}

/// Items sitting in each stage queue.
#[derive(Debug, Default)]
pub struct StageDepths {
    download: AtomicI64,
    process: AtomicI64,
    publish: AtomicI64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueDepthSnapshot {
    pub download: u64,
    pub process: u64,
    pub publish: u64,
}

impl StageDepths {
    pub fn snapshot(&self) -> QueueDepthSnapshot {
        let read = |value: &AtomicI64| value.load(Ordering::Relaxed).max(0) as u64;
        QueueDepthSnapshot {
            download: read(&self.download),
            process: read(&self.process),
            publish: read(&self.publish),
        }
    }

    fn add(&self, stage: Stage, delta: i64) {
        let counter = match stage {
            Stage::Intake | Stage::Download => &self.download,
            Stage::Process => &self.process,
            Stage::Publish => &self.publish,
        };
        let depth = counter.fetch_add(delta, Ordering::Relaxed) + delta;
        if let Some(metrics) = PIPELINE_METRICS.get() {
            let gauge = match stage {
                Stage::Intake | Stage::Download => &metrics.download_queue_depth,
                Stage::Process => &metrics.process_queue_depth,
                Stage::Publish => &metrics.publish_queue_depth,
            };
            gauge.set(depth.max(0));
        }
    }
}

struct Shared {
    config: PipelineConfig,
    coordinator: Arc<LockCoordinator>,
    fetcher: Arc<dyn ItemFetcher>,
    processor: Arc<dyn Processor>,
    queue_log: Arc<QueueLog>,
    failure_log: Arc<FailureLog>,
    control: ControlHandle,
    depths: Arc<StageDepths>,
    completions: Sender<CompletionEvent>,
}

/// Intake, download, process and publish over bounded queues and fixed worker pools.
///
/// Every accepted entry is in the queue log before it reaches a queue, and leaves the log only
/// once it has been published, suppressed or recorded as failed.
pub struct PipelineOrchestrator {
    shared: Arc<Shared>,
    completions: Receiver<CompletionEvent>,
}

impl PipelineOrchestrator {
    pub fn new(
        config: PipelineConfig,
        coordinator: Arc<LockCoordinator>,
        fetcher: Arc<dyn ItemFetcher>,
        processor: Arc<dyn Processor>,
        queue_log: Arc<QueueLog>,
        failure_log: Arc<FailureLog>,
        control: ControlHandle,
    ) -> Self {
        let (sender, completions) = flume::unbounded();
        Self {
            shared: Arc::new(Shared {
                config: config.clamped(),
                coordinator,
                fetcher,
                processor,
                queue_log,
                failure_log,
                control,
                depths: Arc::new(StageDepths::default()),
                completions: sender,
            }),
            completions,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.shared.config
    }

    /// Spawns every stage worker and returns the intake side.
    pub fn start(self) -> RunningPipeline {
        let config = self.shared.config;
        let (download_tx, download_rx) = flume::bounded::<Job>(config.download_queue);
        let (process_tx, process_rx) = flume::bounded::<Downloaded>(config.process_queue);
        let (publish_tx, publish_rx) = flume::bounded::<Processed>(config.publish_queue);

        let mut handles = Vec::new();
        for worker_idx in 0..config.download_workers {
            let shared = self.shared.clone();
            let receiver = download_rx.clone();
            let sender = process_tx.clone();
            handles.push((
                "download",
                tokio::spawn(async move {
                    run_download_worker(shared, worker_idx, receiver, sender).await
                }),
            ));
        }
        for worker_idx in 0..config.process_workers {
            let shared = self.shared.clone();
            let receiver = process_rx.clone();
            let sender = publish_tx.clone();
            handles.push((
                "process",
                tokio::spawn(async move {
                    run_process_worker(shared, worker_idx, receiver, sender).await
                }),
            ));
        }
        for worker_idx in 0..config.publish_workers {
            let shared = self.shared.clone();
            let receiver = publish_rx.clone();
            handles.push((
                "publish",
                tokio::spawn(async move {
                    run_publish_worker(shared, worker_idx, receiver).await
                }),
            ));
        }

        info!(
            event = "pipeline_started",
            download_workers = config.download_workers,
            process_workers = config.process_workers,
            publish_workers = config.publish_workers,
            batch_size = config.batch_size,
            batch_wait_ms = config.batch_wait.as_millis() as u64,
            publish_enabled = config.publish_enabled,
            "pipeline workers started"
        );

        RunningPipeline {
            shared: self.shared,
            completions: self.completions,
            download_tx,
            handles,
        }
    }
}

/// A started pipeline. Dropping the last intake sender via `finish` drains and joins it.
pub struct RunningPipeline {
    shared: Arc<Shared>,
    completions: Receiver<CompletionEvent>,
    download_tx: Sender<Job>,
    handles: Vec<(&'static str, JoinHandle<Result<PipelineSummary, PipelineError>>)>,
}

impl RunningPipeline {
    pub fn control(&self) -> &ControlHandle {
        &self.shared.control
    }

    pub fn depths(&self) -> Arc<StageDepths> {
        self.shared.depths.clone()
    }

    pub fn completions(&self) -> Receiver<CompletionEvent> {
        self.completions.clone()
    }

    /// False once every worker of some stage has exited. Before `finish` that only happens on
    /// fatal errors or a stop, so callers waiting on completions should give up.
    pub fn workers_alive(&self) -> bool {
        ["download", "process", "publish"].iter().all(|stage| {
            self.handles
                .iter()
                .any(|(name, handle)| name == stage && !handle.is_finished())
        })
    }

    /// Claims and durably accepts one entry, then pushes it into the download queue.
    ///
    /// Suspends while the download queue is full.
    pub async fn submit(&self, mut entry: QueueEntry) -> Result<SubmitOutcome, PipelineError> {
        let shared = &self.shared;
        if shared.control.is_stopping() {
            return Ok(SubmitOutcome::Stopped);
        }

        let coordinator = &shared.coordinator;
        let forced = entry.publish_override == PublishOverride::Force;
        if !forced && coordinator.is_done(&entry.work_id).await? {
            record_skipped_done();
            return Ok(SubmitOutcome::SkippedDone);
        }
        if entry.holds_item_lease() {
            match coordinator.acquire_item(&entry.work_id).await? {
                AcquireOutcome::Acquired => {}
                AcquireOutcome::AlreadyDone if forced => {}
                AcquireOutcome::AlreadyDone => {
                    record_skipped_done();
                    return Ok(SubmitOutcome::SkippedDone);
                }
                AcquireOutcome::AlreadyLocked { owner, .. } => {
                    debug!(
                        event = "item_skipped_locked",
                        work_id = %entry.work_id,
                        holder = %owner,
                        "item leased by another client"
                    );
                    if let Some(metrics) = PIPELINE_METRICS.get() {
                        metrics.items_skipped_locked_total.inc();
                    }
                    return Ok(SubmitOutcome::SkippedLocked { owner });
                }
            }
        }

        entry.stage = Stage::Intake;
        let seq = shared.queue_log.append(&entry).await?;
        if let Some(metrics) = PIPELINE_METRICS.get() {
            metrics.items_accepted_total.inc();
        }
        debug!(
            event = "item_accepted",
            seq,
            work_id = %entry.work_id,
            origin = entry.origin.as_str(),
            "entry accepted into queue log"
        );

        if self.enqueue(Job { seq, entry }).await {
            Ok(SubmitOutcome::Accepted { seq })
        } else {
            Ok(SubmitOutcome::Stopped)
        }
    }

    /// Replays entries left in the queue log by an earlier run.
    ///
    /// Entries whose done marker appeared meanwhile are dropped; the rest are re-claimed with an
    /// item lease and re-enqueued. An entry whose item is leased by another owner stays in the
    /// log untouched for a later run. The log is then compacted to the entries still not done.
    pub async fn recover(
        &self,
        pending: Vec<LoggedEntry>,
    ) -> Result<RecoverySummary, PipelineError> {
        let shared = &self.shared;
        let coordinator = &shared.coordinator;
        let mut summary = RecoverySummary {
            replayed: pending.len(),
            ..RecoverySummary::default()
        };
        let mut live = Vec::new();
        let mut deferred = Vec::new();

        for mut logged in pending {
            let forced = logged.entry.publish_override == PublishOverride::Force;
            if !forced && coordinator.is_done(&logged.entry.work_id).await? {
                summary.skipped_done += 1;
                let _ = shared.completions.send(CompletionEvent::for_entry(
                    &logged.entry,
                    CompletionKind::SkippedDone,
                ));
                continue;
            }

            // A range lease from the earlier run may be gone, so recovered entries always hold
            // an item lease.
            logged.entry.range = None;
            match coordinator.acquire_item(&logged.entry.work_id).await? {
                AcquireOutcome::Acquired => live.push(logged),
                AcquireOutcome::AlreadyDone if forced => live.push(logged),
                AcquireOutcome::AlreadyDone => summary.skipped_done += 1,
                AcquireOutcome::AlreadyLocked { owner, .. } => {
                    debug!(
                        event = "recovered_entry_deferred",
                        seq = logged.seq,
                        work_id = %logged.entry.work_id,
                        holder = %owner,
                        "item leased elsewhere; keeping entry in the queue log"
                    );
                    summary.skipped_locked += 1;
                    deferred.push(logged);
                }
            }
        }

        let kept: Vec<LoggedEntry> = live.iter().chain(deferred.iter()).cloned().collect();
        shared.queue_log.compact(&kept).await?;
        summary.requeued = live.len();
        summary.requeued_positions = live
            .iter()
            .filter(|logged| logged.entry.origin == EntryOrigin::Scan)
            .filter_map(|logged| logged.entry.position)
            .collect();
        if let Some(metrics) = PIPELINE_METRICS.get() {
            metrics.recovered_entries_total.inc_by(live.len() as u64);
        }
        info!(
            event = "queue_recovered",
            replayed = summary.replayed,
            requeued = summary.requeued,
            skipped_done = summary.skipped_done,
            skipped_locked = summary.skipped_locked,
            "replayed queue log"
        );

        for logged in live {
            let job = Job {
                seq: logged.seq,
                entry: logged.entry,
            };
            if !self.enqueue(job).await {
                break;
            }
        }
        Ok(summary)
    }

    /// Closes intake, waits for every worker to drain, and rolls up their summaries.
    pub async fn finish(self) -> Result<PipelineSummary, PipelineError> {
        let RunningPipeline {
            download_tx,
            handles,
            ..
        } = self;
        drop(download_tx);

        let mut summary = PipelineSummary::default();
        for (stage, handle) in handles {
            match handle.await? {
                Ok(worker_summary) => summary.merge(worker_summary),
                Err(err) => {
                    error!(
                        event = "pipeline_worker_failed",
                        stage,
                        error = %format_error_report(&err),
                        "pipeline worker stopped on a fatal error"
                    );
                    summary.had_fatal_failures = true;
                }
            }
        }
        info!(
            event = "pipeline_finished",
            published = summary.published,
            suppressed = summary.suppressed,
            failed = summary.failed,
            publish_batches = summary.publish_batches,
            had_fatal_failures = summary.had_fatal_failures,
            "pipeline drained"
        );
        Ok(summary)
    }

    async fn enqueue(&self, job: Job) -> bool {
        let shared = &self.shared;
        tokio::select! {
            sent = self.download_tx.send_async(job) => {
                if sent.is_ok() {
                    shared.depths.add(Stage::Download, 1);
                    true
                } else {
                    false
                }
            }
            _ = shared.control.stopped() => false,
        }
    }
}

fn record_skipped_done() {
    if let Some(metrics) = PIPELINE_METRICS.get() {
        metrics.items_skipped_done_total.inc();
    }
}

/// Next unit of work, honoring pause and stop on both sides of the wait.
///
/// A unit taken off the queue leaves the depth gauge even when a stop then drops it; its entry
/// stays in the queue log.
async fn next_work<T>(shared: &Shared, stage: Stage, receiver: &Receiver<T>) -> Option<T> {
    let control = &shared.control;
    if !control.checkpoint().await {
        return None;
    }
    let work = tokio::select! {
        work = receiver.recv_async() => work.ok()?,
        _ = control.stopped() => return None,
    };
    shared.depths.add(stage, -1);
    if !control.checkpoint().await {
        return None;
    }
    Some(work)
}

async fn run_download_worker(
    shared: Arc<Shared>,
    worker_idx: usize,
    receiver: Receiver<Job>,
    sender: Sender<Downloaded>,
) -> Result<PipelineSummary, PipelineError> {
    let mut summary = PipelineSummary::default();
    while let Some(mut job) = next_work(&shared, Stage::Download, &receiver).await {
        job.entry.stage = Stage::Download;

        let fetched = {
            let fetcher = &shared.fetcher;
            let entry = &job.entry;
            run_with_retry(&shared.config.fetch_retry, |_| fetcher.fetch(entry)).await
        };
        match fetched {
            Ok((item, attempts)) => {
                job.entry.attempt_count += attempts;
                summary.downloaded += 1;
                if sender.send_async(Downloaded { job, item }).await.is_err() {
                    warn!(
                        event = "download_worker_orphaned",
                        worker_idx,
                        "process stage is gone; leaving remaining entries in the queue log"
                    );
                    break;
                }
                shared.depths.add(Stage::Process, 1);
            }
            Err(terminal) => {
                job.entry.attempt_count += terminal.attempts;
                fail_entry(
                    &shared,
                    &job,
                    terminal.error.failure_class(),
                    &terminal.error.to_string(),
                )
                .await?;
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

async fn run_process_worker(
    shared: Arc<Shared>,
    worker_idx: usize,
    receiver: Receiver<Downloaded>,
    sender: Sender<Processed>,
) -> Result<PipelineSummary, PipelineError> {
    let mut summary = PipelineSummary::default();
    while let Some(Downloaded { mut job, item }) =
        next_work(&shared, Stage::Process, &receiver).await
    {
        job.entry.stage = Stage::Process;

        match shared.processor.process(&job.entry.work_id, &item).await {
            Ok(artifact) => {
                summary.processed += 1;
                debug!(
                    event = "item_processed",
                    worker_idx,
                    work_id = %job.entry.work_id,
                    artifact_bytes = artifact.total_bytes(),
                    "processor produced artifact"
                );
                if sender.send_async(Processed { job, artifact }).await.is_err() {
                    warn!(
                        event = "process_worker_orphaned",
                        worker_idx,
                        "publish stage is gone; leaving remaining entries in the queue log"
                    );
                    break;
                }
                shared.depths.add(Stage::Publish, 1);
            }
            Err(err) => {
                fail_entry(&shared, &job, FAILURE_CLASS_PROCESSING, &err.message).await?;
                summary.failed += 1;
            }
        }
    }
    Ok(summary)
}

/// Collects processed items into micro-batches: `batch_size` items or `batch_wait` after the
/// first one, whichever comes first. A pending batch is flushed on stop and on close.
///
/// An exhausted critical write ends this worker only; the rest of the pool keeps publishing.
async fn run_publish_worker(
    shared: Arc<Shared>,
    worker_idx: usize,
    receiver: Receiver<Processed>,
) -> Result<PipelineSummary, PipelineError> {
    let result = publish_loop(&shared, &receiver).await;
    if let Err(err) = &result {
        error!(
            event = "publish_worker_failed",
            worker_idx,
            error = %format_error_report(err),
            "publish worker stopped; its unpublished entries stay in the queue log"
        );
    }
    result
}

async fn publish_loop(
    shared: &Shared,
    receiver: &Receiver<Processed>,
) -> Result<PipelineSummary, PipelineError> {
    let mut summary = PipelineSummary::default();
    let mut batch: Vec<Processed> = Vec::new();
    let mut deadline = Instant::now();

    loop {
        let next = if batch.is_empty() {
            if !shared.control.checkpoint().await {
                break;
            }
            tokio::select! {
                item = receiver.recv_async() => item.ok(),
                _ = shared.control.stopped() => None,
            }
        } else {
            tokio::select! {
                item = receiver.recv_async() => item.ok(),
                _ = tokio::time::sleep_until(deadline) => {
                    flush_batch(shared, &mut batch, &mut summary).await?;
                    continue;
                }
                _ = shared.control.stopped() => None,
            }
        };

        let Some(mut processed) = next else {
            break;
        };
        shared.depths.add(Stage::Publish, -1);
        processed.job.entry.stage = Stage::Publish;
        if batch.is_empty() {
            deadline = Instant::now() + shared.config.batch_wait;
        }
        batch.push(processed);
        if batch.len() >= shared.config.batch_size {
            flush_batch(shared, &mut batch, &mut summary).await?;
        }
    }

    flush_batch(shared, &mut batch, &mut summary).await?;
    Ok(summary)
}

fn should_publish(config: &PipelineConfig, entry: &QueueEntry) -> bool {
    match entry.publish_override {
        PublishOverride::Force => true,
        PublishOverride::Suppress => false,
        PublishOverride::Default => config.publish_enabled,
    }
}

async fn flush_batch(
    shared: &Shared,
    batch: &mut Vec<Processed>,
    summary: &mut PipelineSummary,
) -> Result<(), PipelineError> {
    if batch.is_empty() {
        return Ok(());
    }
    let (to_publish, local_only): (Vec<Processed>, Vec<Processed>) = mem::take(batch)
        .into_iter()
        .partition(|processed| should_publish(&shared.config, &processed.job.entry));

    for processed in &local_only {
        let entry = &processed.job.entry;
        release_item_lease(shared, entry).await;
        shared
            .queue_log
            .ack(processed.job.seq, CompletionKind::Suppressed)
            .await?;
        summary.suppressed += 1;
        let _ = shared
            .completions
            .send(CompletionEvent::for_entry(entry, CompletionKind::Suppressed));
    }

    let mut finished = 0;
    let result = publish_items(shared, &to_publish, &mut finished, summary).await;
    if result.is_err() {
        // Not done: left unacknowledged for the next run, reported as failed to this one.
        for processed in &to_publish[finished..] {
            let _ = shared.completions.send(CompletionEvent::for_entry(
                &processed.job.entry,
                CompletionKind::Failed,
            ));
        }
    }
    result
}

/// One combined artifact commit, then a done marker and an ack per item. `finished` counts the
/// items fully completed.
async fn publish_items(
    shared: &Shared,
    to_publish: &[Processed],
    finished: &mut usize,
    summary: &mut PipelineSummary,
) -> Result<(), PipelineError> {
    if to_publish.is_empty() {
        return Ok(());
    }
    let coordinator = &shared.coordinator;
    let files: Vec<StoreFile> = to_publish
        .iter()
        .flat_map(|processed| {
            processed.artifact.files.iter().map(|file| {
                StoreFile::new(
                    coordinator.keys().artifact(&processed.job.entry.work_id, &file.name),
                    file.contents.clone(),
                )
            })
        })
        .collect();

    if !files.is_empty() {
        let message = format!("publish {} items", to_publish.len());
        coordinator
            .governor()
            .execute_critical("publish_batch", || {
                coordinator.store().commit_batch(&files, &message)
            })
            .await
            .map_err(CoordinationError::from)?;
    }
    summary.publish_batches += 1;
    if let Some(metrics) = PIPELINE_METRICS.get() {
        metrics.publish_batches_total.inc();
        metrics.last_publish_batch_size.set(to_publish.len() as i64);
    }
    info!(
        event = "publish_batch_committed",
        items = to_publish.len(),
        files = files.len(),
        "published artifact batch"
    );

    for processed in to_publish {
        let entry = &processed.job.entry;
        coordinator.mark_item_done(&entry.work_id).await?;
        shared
            .queue_log
            .ack(processed.job.seq, CompletionKind::Published)
            .await?;
        *finished += 1;
        summary.published += 1;
        if let Some(metrics) = PIPELINE_METRICS.get() {
            metrics.items_published_total.inc();
        }
        let _ = shared
            .completions
            .send(CompletionEvent::for_entry(entry, CompletionKind::Published));
    }
    Ok(())
}

/// Records a terminal failure for one entry and takes it out of the queue log.
async fn fail_entry(
    shared: &Shared,
    job: &Job,
    failure_class: &str,
    message: &str,
) -> Result<(), PipelineError> {
    let entry = &job.entry;
    warn!(
        event = "item_failed",
        work_id = %entry.work_id,
        stage = ?entry.stage,
        attempts = entry.attempt_count,
        failure_class,
        error = message,
        "item left the pipeline without publishing"
    );
    if let Some(metrics) = PIPELINE_METRICS.get() {
        metrics.items_failed_total.inc();
    }

    let record = FailureRecord::from_entry(
        shared.failure_log.run_id(),
        entry,
        failure_class,
        message,
        shared.coordinator.now_ms(),
    );
    if let Err(err) = shared.failure_log.append(&record).await {
        error!(
            event = "failure_log_write_failed",
            work_id = %entry.work_id,
            error = %format_error_report(&err),
            "could not record item failure"
        );
    }

    release_item_lease(shared, entry).await;
    shared.queue_log.ack(job.seq, CompletionKind::Failed).await?;
    let _ = shared
        .completions
        .send(CompletionEvent::for_entry(entry, CompletionKind::Failed));
    Ok(())
}

async fn release_item_lease(shared: &Shared, entry: &QueueEntry) {
    if !entry.holds_item_lease() {
        return;
    }
    if let Err(err) = shared.coordinator.release_item(&entry.work_id).await {
        warn!(
            event = "item_lease_release_failed",
            work_id = %entry.work_id,
            error = %err,
            "lease will expire on its own"
        );
    }
}
