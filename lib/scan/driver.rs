use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use flume::Receiver;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::source::{discover, Discovery, ItemSource};
use super::{ScanConfig, ScanError, ScanSummary, StopReason};
use crate::clock::duration_ms;
use crate::coordination::{
    LockCoordinator, Range, RangeProgressRecord, RangeSelector, RenewOutcome, SelectionOutcome,
};
use crate::pipeline::{
    CompletionEvent, CompletionKind, ControlHandle, EntryOrigin, QueueEntry, RunningPipeline,
    SubmitOutcome,
};
use crate::progress::{OrderedProgress, ProgressSnapshot, ProgressStore};
use crate::server::monitoring::COORDINATION_METRICS;

/// A range (or fallback window) whose entries are in the pipeline.
struct ActiveRange {
    leased: bool,
    submitting: bool,
    pending: HashSet<u64>,
    published: u64,
    skipped_done: u64,
    /// Positions that ended without a done marker, or were never submitted.
    incomplete: u64,
    lost: bool,
    last_heartbeat_ms: u64,
    last_progress_ms: u64,
}

impl ActiveRange {
    fn new(leased: bool, now_ms: u64) -> Self {
        Self {
            leased,
            submitting: true,
            pending: HashSet::new(),
            published: 0,
            skipped_done: 0,
            incomplete: 0,
            lost: false,
            last_heartbeat_ms: now_ms,
            last_progress_ms: now_ms,
        }
    }
}

enum RangeScan {
    Submitted,
    /// The listing ended at this position.
    SourceEnd(u64),
    LimitReached,
    RateLimited,
    Stopped,
    PipelineClosed,
}

struct ScanState {
    progress: OrderedProgress,
    progress_dirty: bool,
    /// First position not yet covered by a range handled this run.
    cursor: u64,
    handled: BTreeSet<Range>,
    active: BTreeMap<Range, ActiveRange>,
    known_done: BTreeSet<Range>,
    shared_prefix: u64,
    limit_end: Option<u64>,
    in_flight: HashSet<u64>,
    summary: ScanSummary,
}

impl ScanState {
    fn next_cursor(&mut self, range_size: u64) -> u64 {
        let mut cursor = self.cursor.max(self.progress.frontier());
        loop {
            let range = Range::containing(cursor, range_size);
            if !self.handled.contains(&range) && !self.known_done.contains(&range) {
                break;
            }
            cursor = range.end;
        }
        self.cursor = cursor;
        self.handled.retain(|range| range.end > cursor);
        cursor
    }

    fn observe(&mut self, position: u64) {
        self.progress.observe(position);
        self.progress_dirty = true;
    }

    fn apply(&mut self, event: CompletionEvent, range_size: u64) {
        let Some(position) = event.position else {
            return;
        };
        self.in_flight.remove(&position);
        let finished = matches!(
            event.kind,
            CompletionKind::Published | CompletionKind::SkippedDone
        );
        // Only positions with a done marker may move the frontier.
        if finished {
            self.observe(position);
        }

        let key = Range::containing(position, range_size);
        let Some(active) = self.active.get_mut(&key) else {
            return;
        };
        if !active.pending.remove(&position) {
            return;
        }
        if finished {
            active.published += 1;
        } else {
            active.incomplete += 1;
        }
    }

    fn record_known_done(&mut self, range: Range) {
        self.progress.observe_range(range.start, range.end);
        self.progress_dirty = true;
        self.known_done.insert(range);
    }

    fn has_pending(&self) -> bool {
        self.active.values().any(|active| !active.pending.is_empty())
    }
}

/// Walks the ordered listing one range at a time.
///
/// Each selected range is submitted to the pipeline in full, then tracked until every entry has
/// completed. A range whose entries all ended with a done marker is marked done and may extend
/// the shared done prefix; anything else is released with an abandon note so another client can
/// pick it up.
pub struct ScanDriver {
    coordinator: Arc<LockCoordinator>,
    selector: RangeSelector,
    source: Arc<dyn ItemSource>,
    progress_store: ProgressStore,
    config: ScanConfig,
    in_flight: HashSet<u64>,
    progress_watch: Option<Arc<watch::Sender<Option<ProgressSnapshot>>>>,
}

impl ScanDriver {
    pub fn new(
        coordinator: Arc<LockCoordinator>,
        selector: RangeSelector,
        source: Arc<dyn ItemSource>,
        progress_store: ProgressStore,
        config: ScanConfig,
    ) -> Self {
        Self {
            coordinator,
            selector,
            source,
            progress_store,
            config,
            in_flight: HashSet::new(),
            progress_watch: None,
        }
    }

    /// Mirrors every saved progress snapshot into `sender` (read by `/status`).
    pub fn publish_progress_to(&mut self, sender: Arc<watch::Sender<Option<ProgressSnapshot>>>) {
        self.progress_watch = Some(sender);
    }

    /// Positions already in the pipeline (requeued from the queue log). They are not submitted
    /// again, but a range containing one is only finalized once that entry completes.
    pub fn note_in_flight(&mut self, positions: impl IntoIterator<Item = u64>) {
        self.in_flight.extend(positions);
    }

    fn range_size(&self) -> u64 {
        self.selector.config().range_size
    }

    pub async fn run(&mut self, pipeline: &RunningPipeline) -> Result<ScanSummary, ScanError> {
        let mut state = self.load_state().await?;
        let completions = pipeline.completions();
        let control = pipeline.control().clone();
        let range_size = self.range_size();
        info!(
            event = "scan_started",
            owner = %self.coordinator.owner(),
            frontier = state.progress.frontier(),
            holes = state.progress.holes().len(),
            shared_prefix = state.shared_prefix,
            range_size,
            stride = self.selector.stride(),
            "starting ordered scan"
        );

        let reason = loop {
            self.absorb(&completions, &mut state);
            self.upkeep(&mut state).await?;

            if !control.checkpoint().await {
                break StopReason::Stopped;
            }
            if !pipeline.workers_alive() {
                break StopReason::PipelineClosed;
            }
            if self.limit_reached(&state) {
                break StopReason::LimitReached;
            }
            if state.active.len() >= self.config.max_active_ranges.max(1) {
                self.wait_for_completions(&completions, &control, &mut state)
                    .await;
                continue;
            }

            let cursor = state.next_cursor(range_size);
            if state.limit_end.is_some_and(|end| cursor >= end) {
                break StopReason::Exhausted;
            }
            let exclude: HashSet<Range> = state
                .handled
                .iter()
                .chain(state.known_done.range(Range::containing(cursor, range_size)..))
                .copied()
                .collect();
            let scanned = match self
                .selector
                .select_excluding(cursor, state.limit_end, &exclude)
                .await?
            {
                SelectionOutcome::Acquired(range) => {
                    state.summary.ranges_acquired += 1;
                    self.scan_range(range, true, pipeline, &completions, &mut state)
                        .await?
                }
                SelectionOutcome::Fallback { window } => {
                    state.summary.fallback_windows += 1;
                    self.scan_range(window, false, pipeline, &completions, &mut state)
                        .await?
                }
                SelectionOutcome::AllDone { done } => {
                    if done.is_empty() {
                        break StopReason::Exhausted;
                    }
                    debug!(
                        event = "scan_skipped_done_ranges",
                        ranges = done.len(),
                        "candidate ranges already done"
                    );
                    for range in done {
                        state.record_known_done(range);
                    }
                    self.publish_done_prefix(&mut state).await?;
                    continue;
                }
            };

            match scanned {
                RangeScan::Submitted => {}
                RangeScan::SourceEnd(end) => {
                    info!(event = "scan_source_end", end, "listing ended");
                    state.limit_end = Some(state.limit_end.map_or(end, |limit| limit.min(end)));
                }
                RangeScan::LimitReached => break StopReason::LimitReached,
                RangeScan::RateLimited => break StopReason::RateLimited,
                RangeScan::Stopped => break StopReason::Stopped,
                RangeScan::PipelineClosed => break StopReason::PipelineClosed,
            }
        };

        if matches!(
            reason,
            StopReason::Exhausted | StopReason::LimitReached | StopReason::RateLimited
        ) {
            while state.has_pending() && !control.is_stopping() && pipeline.workers_alive() {
                self.wait_for_completions(&completions, &control, &mut state)
                    .await;
                self.absorb(&completions, &mut state);
                self.upkeep(&mut state).await?;
            }
        }
        let reason = if control.is_stopping() {
            StopReason::Stopped
        } else {
            reason
        };
        self.absorb(&completions, &mut state);
        self.finalize_ready(&mut state).await?;
        self.release_remaining(&mut state, reason).await?;
        self.save_progress(&mut state).await?;

        let mut summary = state.summary;
        summary.frontier = state.progress.frontier();
        summary.stop_reason = reason;
        info!(
            event = "scan_finished",
            reason = reason.as_str(),
            frontier = summary.frontier,
            submitted = summary.submitted,
            skipped_done = summary.skipped_done,
            ranges_done = summary.ranges_done,
            ranges_released = summary.ranges_released,
            "ordered scan finished"
        );
        Ok(summary)
    }

    async fn load_state(&mut self) -> Result<ScanState, ScanError> {
        let mut progress = match self.progress_store.load().await? {
            Some(progress) => progress,
            None => OrderedProgress::new(self.config.start_position),
        };
        let start_frontier = progress.frontier();
        let shared_prefix = self.coordinator.read_done_prefix().await?.unwrap_or(0);
        if progress.advance_to(shared_prefix) {
            info!(
                event = "scan_fast_forwarded",
                from = start_frontier,
                to = shared_prefix,
                "skipping ranges other clients already finished"
            );
        }
        if let Some(sender) = &self.progress_watch {
            sender.send_replace(Some(progress.snapshot()));
        }

        Ok(ScanState {
            cursor: progress.frontier(),
            progress_dirty: progress.frontier() != start_frontier,
            progress,
            handled: BTreeSet::new(),
            active: BTreeMap::new(),
            known_done: BTreeSet::new(),
            shared_prefix,
            limit_end: self.config.end_position,
            in_flight: std::mem::take(&mut self.in_flight),
            summary: ScanSummary {
                start_frontier,
                frontier: start_frontier,
                submitted: 0,
                skipped_done: 0,
                skipped_locked: 0,
                ranges_acquired: 0,
                ranges_done: 0,
                ranges_released: 0,
                fallback_windows: 0,
                stop_reason: StopReason::Exhausted,
            },
        })
    }

    fn limit_reached(&self, state: &ScanState) -> bool {
        self.config
            .max_items
            .is_some_and(|max| state.summary.submitted >= max)
    }

    /// Submits every not-yet-done position of `range` that the listing has.
    async fn scan_range(
        &self,
        range: Range,
        leased: bool,
        pipeline: &RunningPipeline,
        completions: &Receiver<CompletionEvent>,
        state: &mut ScanState,
    ) -> Result<RangeScan, ScanError> {
        state.handled.insert(range);
        state
            .active
            .insert(range, ActiveRange::new(leased, self.coordinator.now_ms()));

        let control = pipeline.control();
        let page_size = self.source.page_size().max(1);
        let first_page = range.start / page_size;
        let last_page = (range.end - 1) / page_size;
        let mut result = RangeScan::Submitted;

        'pages: for page in first_page..=last_page {
            if state
                .limit_end
                .is_some_and(|end| page.saturating_mul(page_size) >= end)
            {
                break;
            }
            let source = &self.source;
            let items = match discover(
                control,
                self.config.rate_limit,
                &self.config.discovery_retry,
                || source.list_page(page),
            )
            .await?
            {
                Discovery::Items(items) => items,
                Discovery::RateLimited => {
                    result = RangeScan::RateLimited;
                    break;
                }
                Discovery::Stopped => {
                    result = RangeScan::Stopped;
                    break;
                }
            };

            let base = page * page_size;
            let count = items.len() as u64;
            for (offset, item) in items.into_iter().enumerate() {
                let position = base + offset as u64;
                if !range.contains(position) || state.limit_end.is_some_and(|end| position >= end)
                {
                    continue;
                }
                if state.in_flight.contains(&position) {
                    // Recovered entry: the range waits for its completion like any other.
                    if let Some(active) = state.active.get_mut(&range) {
                        active.pending.insert(position);
                    }
                    continue;
                }
                if state.progress.is_done(position) {
                    if let Some(active) = state.active.get_mut(&range) {
                        active.skipped_done += 1;
                    }
                    continue;
                }
                if self.limit_reached(state) {
                    result = RangeScan::LimitReached;
                    break 'pages;
                }

                let mut entry = QueueEntry::new(item.work_id, EntryOrigin::Scan)
                    .with_position(position)
                    .with_metadata(item.metadata);
                if let Some(url) = item.download_url {
                    entry = entry.with_download_url(url);
                }
                if leased {
                    entry = entry.with_range(range);
                }

                match pipeline.submit(entry).await? {
                    SubmitOutcome::Accepted { .. } => {
                        state.summary.submitted += 1;
                        if let Some(active) = state.active.get_mut(&range) {
                            active.pending.insert(position);
                        }
                    }
                    SubmitOutcome::SkippedDone => {
                        state.summary.skipped_done += 1;
                        state.observe(position);
                        if let Some(active) = state.active.get_mut(&range) {
                            active.skipped_done += 1;
                        }
                    }
                    SubmitOutcome::SkippedLocked { .. } => {
                        state.summary.skipped_locked += 1;
                        if let Some(active) = state.active.get_mut(&range) {
                            active.incomplete += 1;
                        }
                    }
                    SubmitOutcome::Stopped => {
                        result = if control.is_stopping() {
                            RangeScan::Stopped
                        } else {
                            RangeScan::PipelineClosed
                        };
                        break 'pages;
                    }
                }
            }

            if count < page_size {
                result = RangeScan::SourceEnd(base + count);
                break;
            }
            self.absorb(completions, state);
            self.upkeep(state).await?;
        }

        let fully_listed = match result {
            RangeScan::Submitted => true,
            RangeScan::SourceEnd(end) => end >= range.end,
            _ => false,
        };
        if let Some(active) = state.active.get_mut(&range) {
            active.submitting = false;
            if !fully_listed {
                active.incomplete += 1;
            }
            debug!(
                event = "range_submitted",
                range = %range,
                leased,
                pending = active.pending.len(),
                skipped_done = active.skipped_done,
                "range handed to pipeline"
            );
        }
        Ok(result)
    }

    fn absorb(&self, completions: &Receiver<CompletionEvent>, state: &mut ScanState) {
        let range_size = self.range_size();
        for event in completions.try_iter() {
            state.apply(event, range_size);
        }
    }

    async fn wait_for_completions(
        &self,
        completions: &Receiver<CompletionEvent>,
        control: &ControlHandle,
        state: &mut ScanState,
    ) {
        tokio::select! {
            event = completions.recv_async() => {
                if let Ok(event) = event {
                    state.apply(event, self.range_size());
                }
            }
            _ = tokio::time::sleep(self.config.poll_interval) => {}
            _ = control.stopped() => {}
        }
    }

    /// Finalizes drained ranges, then heartbeats and progress notes for the rest.
    async fn upkeep(&self, state: &mut ScanState) -> Result<(), ScanError> {
        self.finalize_ready(state).await?;

        let now = self.coordinator.now_ms();
        let heartbeat_ms = duration_ms(self.config.range_heartbeat);
        let progress_ms = duration_ms(self.config.range_progress_interval);
        for (range, active) in state.active.iter_mut() {
            if !active.leased || active.lost {
                continue;
            }
            if now.saturating_sub(active.last_heartbeat_ms) >= heartbeat_ms {
                match self.coordinator.renew_range(range).await? {
                    RenewOutcome::Renewed => active.last_heartbeat_ms = now,
                    RenewOutcome::Deferred => {
                        debug!(event = "range_heartbeat_deferred", range = %range, "heartbeat skipped")
                    }
                    RenewOutcome::Lost => {
                        active.lost = true;
                        warn!(
                            event = "range_lease_lost",
                            range = %range,
                            "range lease no longer ours; it will not be marked done"
                        );
                    }
                }
            }
            if now.saturating_sub(active.last_progress_ms) >= progress_ms {
                let record = RangeProgressRecord {
                    owner: self.coordinator.owner().to_string(),
                    updated_at_ms: now,
                    frontier: state.progress.frontier().clamp(range.start, range.end),
                    holes: state
                        .progress
                        .holes()
                        .range(range.start..range.end)
                        .copied()
                        .collect(),
                    published: active.published,
                    skipped_done: active.skipped_done,
                };
                self.coordinator.write_range_progress(range, &record).await?;
                active.last_progress_ms = now;
            }
        }

        if state.progress_dirty {
            self.save_progress(state).await?;
        }
        Ok(())
    }

    async fn finalize_ready(&self, state: &mut ScanState) -> Result<(), ScanError> {
        let ready: Vec<Range> = state
            .active
            .iter()
            .filter(|(_, active)| !active.submitting && active.pending.is_empty())
            .map(|(range, _)| *range)
            .collect();

        for range in ready {
            let Some(active) = state.active.remove(&range) else {
                continue;
            };
            if !active.leased {
                continue;
            }
            if active.lost {
                continue;
            }
            if active.incomplete > 0 {
                self.release_unfinished(range, "incomplete_items", state)
                    .await?;
                continue;
            }

            self.coordinator.mark_range_done(&range).await?;
            state.summary.ranges_done += 1;
            state.record_known_done(range);
            info!(
                event = "range_completed",
                range = %range,
                published = active.published,
                skipped_done = active.skipped_done,
                "range marked done"
            );
            self.publish_done_prefix(state).await?;
        }
        Ok(())
    }

    async fn release_unfinished(
        &self,
        range: Range,
        reason: &str,
        state: &mut ScanState,
    ) -> Result<(), ScanError> {
        self.coordinator.mark_range_abandoned(&range, reason).await?;
        self.coordinator.release_range(&range).await?;
        state.summary.ranges_released += 1;
        info!(
            event = "range_released",
            range = %range,
            reason,
            "released range without marking it done"
        );
        Ok(())
    }

    async fn release_remaining(
        &self,
        state: &mut ScanState,
        reason: StopReason,
    ) -> Result<(), ScanError> {
        let remaining = std::mem::take(&mut state.active);
        for (range, active) in remaining {
            if active.leased && !active.lost {
                self.release_unfinished(range, reason.as_str(), state)
                    .await?;
            }
        }
        Ok(())
    }

    /// Extends the shared done prefix across contiguous done ranges.
    async fn publish_done_prefix(&self, state: &mut ScanState) -> Result<(), ScanError> {
        let range_size = self.range_size();
        let mut next = state.shared_prefix;
        loop {
            let range = Range::containing(next, range_size);
            if range.start != next || !state.known_done.contains(&range) {
                break;
            }
            next = range.end;
        }
        if next > state.shared_prefix {
            self.coordinator.advance_done_prefix(next).await?;
            debug!(event = "done_prefix_advanced", next_start = next, "done prefix moved");
            state.shared_prefix = next;
        }
        Ok(())
    }

    async fn save_progress(&self, state: &mut ScanState) -> Result<(), ScanError> {
        self.progress_store.save(&state.progress).await?;
        state.progress_dirty = false;
        if let Some(sender) = &self.progress_watch {
            sender.send_replace(Some(state.progress.snapshot()));
        }
        if let Some(metrics) = COORDINATION_METRICS.get() {
            metrics.frontier.set(state.progress.frontier() as i64);
            metrics.holes.set(state.progress.holes().len() as i64);
        }
        Ok(())
    }
}
