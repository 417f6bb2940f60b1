use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use super::lock_coordinator::{AcquireOutcome, CoordinationError, LockCoordinator, RangeStatus};
use super::Range;
use crate::clock::duration_ms;
use crate::server::monitoring::COORDINATION_METRICS;

const MINUTE_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SelectorConfig {
    pub candidates: usize,
    pub epsilon: f64,
    pub fresh_window: Duration,
    pub max_attempts: u32,
    pub range_size: u64,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            candidates: 6,
            epsilon: 0.2,
            fresh_window: Duration::from_secs(90),
            max_attempts: 3,
            range_size: 300,
        }
    }
}

impl SelectorConfig {
    pub fn clamped(self) -> Self {
        Self {
            candidates: self.candidates.clamp(1, 20),
            epsilon: if self.epsilon.is_nan() {
                0.0
            } else {
                self.epsilon.clamp(0.0, 1.0)
            },
            fresh_window: self.fresh_window.max(Duration::from_secs(1)),
            max_attempts: self.max_attempts.max(1),
            range_size: self.range_size.max(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionOutcome {
    Acquired(Range),
    /// No range lock could be taken; scan `window` with per-item leases instead.
    Fallback { window: Range },
    /// Every candidate was already done. Empty when nothing is left before the limit.
    AllDone { done: Vec<Range> },
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredRange {
    pub range: Range,
    pub score: f64,
}

/// Higher is better. `None` for done ranges.
///
/// Free and expired ranges score 1.0. Live locks score in `[-1, 0)`, rising with the time since
/// the holder last touched the lease, so a freshly claimed range is the least attractive.
pub fn freshness_score(status: &RangeStatus, now_ms: u64, fresh_window: Duration) -> Option<f64> {
    match status {
        RangeStatus::Done => None,
        RangeStatus::Free => Some(1.0),
        RangeStatus::Locked {
            acquired_at_ms,
            expires_at_ms,
            ..
        } => {
            if now_ms > *expires_at_ms {
                return Some(1.0);
            }
            let age = now_ms.saturating_sub(*acquired_at_ms) as f64;
            let fresh = duration_ms(fresh_window).max(1) as f64;
            Some(age / (age + fresh) - 1.0)
        }
    }
}

/// Epsilon-greedy pick. Greedy takes the best score, ties going to the earlier candidate.
pub fn choose<R: Rng + ?Sized>(
    candidates: &[ScoredRange],
    epsilon: f64,
    rng: &mut R,
) -> Option<Range> {
    if candidates.is_empty() {
        return None;
    }
    if rng.gen::<f64>() < epsilon {
        return candidates.choose(rng).map(|candidate| candidate.range);
    }
    let mut best = candidates[0];
    for candidate in &candidates[1..] {
        if candidate.score > best.score {
            best = *candidate;
        }
    }
    Some(best.range)
}

/// FNV-1a, stable across processes so each owner keeps the same stride.
pub(crate) fn owner_hash(owner: &str) -> u64 {
    owner.bytes().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

/// Spreads uncoordinated clients over ranges at or after their frontier.
pub struct RangeSelector {
    coordinator: Arc<LockCoordinator>,
    config: SelectorConfig,
    stride: u64,
    rng: Mutex<StdRng>,
}

impl RangeSelector {
    pub fn new(coordinator: Arc<LockCoordinator>, config: SelectorConfig) -> Self {
        let seed = owner_hash(coordinator.owner()).wrapping_add(coordinator.now_ms() / MINUTE_MS);
        Self::with_rng(coordinator, config, StdRng::seed_from_u64(seed))
    }

    pub fn with_rng(coordinator: Arc<LockCoordinator>, config: SelectorConfig, rng: StdRng) -> Self {
        let stride = 1 + owner_hash(coordinator.owner()) % 3;
        Self {
            coordinator,
            config: config.clamped(),
            stride,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &SelectorConfig {
        &self.config
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Candidate ranges starting at the range containing `frontier`, `stride` indices apart,
    /// skipping `exclude` and anything starting at or past `limit_end`.
    pub fn candidates(
        &self,
        frontier: u64,
        limit_end: Option<u64>,
        exclude: &HashSet<Range>,
    ) -> Vec<Range> {
        let size = self.config.range_size;
        let base = frontier / size;
        let mut out = Vec::with_capacity(self.config.candidates);
        let mut step = 0u64;
        while out.len() < self.config.candidates {
            let range = Range::at_index(base.saturating_add(step * self.stride), size);
            step += 1;
            if limit_end.is_some_and(|limit| range.start >= limit) {
                break;
            }
            if !exclude.contains(&range) {
                out.push(range);
            }
            if step > (self.config.candidates + exclude.len()) as u64 {
                break;
            }
        }
        out
    }

    /// Tries to lock a range at or after `frontier`.
    pub async fn select(
        &self,
        frontier: u64,
        limit_end: Option<u64>,
    ) -> Result<SelectionOutcome, CoordinationError> {
        self.select_excluding(frontier, limit_end, &HashSet::new()).await
    }

    /// Like `select`, but never proposes a range in `exclude` (ranges this client already
    /// scanned during the current run).
    pub async fn select_excluding(
        &self,
        frontier: u64,
        limit_end: Option<u64>,
        exclude: &HashSet<Range>,
    ) -> Result<SelectionOutcome, CoordinationError> {
        let mut tried = exclude.clone();
        let mut done = Vec::new();
        let mut contended = false;

        for attempt in 1..=self.config.max_attempts {
            let candidates = self.candidates(frontier, limit_end, &tried);
            if candidates.is_empty() {
                break;
            }

            let now = self.coordinator.now_ms();
            let mut eligible = Vec::with_capacity(candidates.len());
            for range in candidates {
                let status = self.coordinator.range_status(&range).await?;
                match freshness_score(&status, now, self.config.fresh_window) {
                    Some(score) => eligible.push(ScoredRange { range, score }),
                    None => {
                        tried.insert(range);
                        done.push(range);
                    }
                }
            }

            let picked = {
                let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                choose(&eligible, self.config.epsilon, &mut *rng)
            };
            let Some(range) = picked else {
                done.sort();
                return Ok(SelectionOutcome::AllDone { done });
            };
            tried.insert(range);

            match self.coordinator.acquire_range(&range).await? {
                AcquireOutcome::Acquired => {
                    info!(
                        event = "range_selected",
                        range = %range,
                        attempt,
                        owner = %self.coordinator.owner(),
                        "acquired range lease"
                    );
                    return Ok(SelectionOutcome::Acquired(range));
                }
                AcquireOutcome::AlreadyDone => done.push(range),
                AcquireOutcome::AlreadyLocked { owner, .. } => {
                    contended = true;
                    debug!(
                        event = "range_contended",
                        range = %range,
                        holder = %owner,
                        attempt,
                        "range already locked; picking again"
                    );
                }
            }
        }

        if !contended && self.candidates(frontier, limit_end, &tried).is_empty() {
            done.sort();
            return Ok(SelectionOutcome::AllDone { done });
        }

        let window = Range::containing(frontier, self.config.range_size);
        info!(
            event = "range_selection_fallback",
            window = %window,
            attempts = self.config.max_attempts,
            "no range lease acquired; falling back to per-item leases"
        );
        if let Some(metrics) = COORDINATION_METRICS.get() {
            metrics.selector_fallbacks_total.inc();
        }
        Ok(SelectionOutcome::Fallback { window })
    }
}

#[cfg(test)]
#[path = "range_selector_tests.rs"]
mod tests;
