use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use super::keys::KeyLayout;
use super::lease::{DoneRecord, LeasePayload};
use super::Range;
use crate::clock::{duration_ms, SharedClock};
use crate::commit_governor::{CommitGovernor, CommitOutcome, GovernorError, WriteRequest};
use crate::lease_store::{CreateOutcome, SharedLeaseStore, StoreError, StoreFile};
use crate::server::monitoring::COORDINATION_METRICS;
use crate::work::WorkId;

/// Bounded delete-then-create rounds before giving up on a contested lease.
const MAX_ACQUIRE_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeasePolicy {
    pub item_ttl: Duration,
    pub range_ttl: Duration,
}

impl Default for LeasePolicy {
    fn default() -> Self {
        Self {
            item_ttl: Duration::from_secs(21_600),
            range_ttl: Duration::from_secs(21_600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired,
    AlreadyLocked { owner: String, expires_at_ms: u64 },
    AlreadyDone,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RangeStatus {
    Free,
    Locked {
        owner: String,
        acquired_at_ms: u64,
        expires_at_ms: u64,
    },
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released,
    /// Missing, unreadable, or owned by someone else. Never force-deleted.
    NotHeld,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenewOutcome {
    Renewed,
    /// Skipped by the governor; the lease keeps its previous timestamp.
    Deferred,
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkDoneOutcome {
    Marked,
    AlreadyMarked,
}

#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error(transparent)]
    Write(#[from] GovernorError),
    #[error("store read failed: {0}")]
    Read(#[from] StoreError),
}

/// Shared progress note for a leased range, read by other clients for triage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeProgressRecord {
    pub owner: String,
    pub updated_at_ms: u64,
    pub frontier: u64,
    pub holes: Vec<u64>,
    pub published: u64,
    pub skipped_done: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct AbandonRecord {
    owner: String,
    reason: String,
    abandoned_at_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct DonePrefixRecord {
    next_start: u64,
    updated_at_ms: u64,
}

struct LeaseTarget {
    kind: &'static str,
    label: String,
    lock_key: String,
    done_key: String,
    ttl: Duration,
}

/// Item and range leases plus permanent done markers, on top of a `LeaseStore`.
///
/// Every mutation is routed through the `CommitGovernor`. Acquire, release and done markers are
/// critical writes; renewals and progress notes are non-critical.
pub struct LockCoordinator {
    store: SharedLeaseStore,
    governor: Arc<CommitGovernor>,
    keys: KeyLayout,
    clock: SharedClock,
    owner: String,
    policy: LeasePolicy,
}

impl LockCoordinator {
    pub fn new(
        store: SharedLeaseStore,
        governor: Arc<CommitGovernor>,
        keys: KeyLayout,
        clock: SharedClock,
        owner: impl Into<String>,
        policy: LeasePolicy,
    ) -> Self {
        Self {
            store,
            governor,
            keys,
            clock,
            owner: owner.into(),
            policy,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    pub fn keys(&self) -> &KeyLayout {
        &self.keys
    }

    pub fn governor(&self) -> &Arc<CommitGovernor> {
        &self.governor
    }

    pub fn store(&self) -> &SharedLeaseStore {
        &self.store
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }

    pub async fn acquire_item(&self, id: &WorkId) -> Result<AcquireOutcome, CoordinationError> {
        self.acquire(&self.item_target(id)).await
    }

    pub async fn release_item(&self, id: &WorkId) -> Result<ReleaseOutcome, CoordinationError> {
        self.release(&self.item_target(id)).await
    }

    pub async fn renew_item(&self, id: &WorkId) -> Result<RenewOutcome, CoordinationError> {
        self.renew(&self.item_target(id)).await
    }

    pub async fn mark_item_done(&self, id: &WorkId) -> Result<MarkDoneOutcome, CoordinationError> {
        self.mark_done(&self.item_target(id)).await
    }

    pub async fn is_done(&self, id: &WorkId) -> Result<bool, CoordinationError> {
        self.exists(&self.keys.item_done(id)).await
    }

    pub async fn acquire_range(&self, range: &Range) -> Result<AcquireOutcome, CoordinationError> {
        self.acquire(&self.range_target(range)).await
    }

    pub async fn release_range(&self, range: &Range) -> Result<ReleaseOutcome, CoordinationError> {
        self.release(&self.range_target(range)).await
    }

    pub async fn renew_range(&self, range: &Range) -> Result<RenewOutcome, CoordinationError> {
        self.renew(&self.range_target(range)).await
    }

    pub async fn mark_range_done(
        &self,
        range: &Range,
    ) -> Result<MarkDoneOutcome, CoordinationError> {
        let outcome = self.mark_done(&self.range_target(range)).await?;
        if let Some(metrics) = COORDINATION_METRICS.get() {
            metrics.ranges_done_total.inc();
        }
        Ok(outcome)
    }

    /// Done marker first, then lock, otherwise free. Unreadable locks count as free.
    pub async fn range_status(&self, range: &Range) -> Result<RangeStatus, CoordinationError> {
        if self.exists(&self.keys.range_done(range)).await? {
            return Ok(RangeStatus::Done);
        }
        let lock_key = self.keys.range_lock(range);
        let Some(bytes) = self.read(&lock_key).await? else {
            return Ok(RangeStatus::Free);
        };
        Ok(match LeasePayload::decode(&bytes) {
            Some(lease) => RangeStatus::Locked {
                expires_at_ms: lease.expires_at_ms(),
                acquired_at_ms: lease.acquired_at_ms,
                owner: lease.owner,
            },
            None => RangeStatus::Free,
        })
    }

    /// Publishes a progress note for `range`. Non-critical and throttled per range.
    pub async fn write_range_progress(
        &self,
        range: &Range,
        record: &RangeProgressRecord,
    ) -> Result<bool, CoordinationError> {
        let key = self.keys.range_progress(range);
        let files = [StoreFile::new(key.clone(), encode_json(record))];
        let outcome = self
            .governor
            .execute(
                WriteRequest::non_critical("range_progress").throttled(&key),
                || self.store.commit_batch(&files, "range progress"),
            )
            .await?;
        Ok(outcome.is_applied())
    }

    /// Leaves a note that this owner walked away from `range` before finishing it.
    pub async fn mark_range_abandoned(
        &self,
        range: &Range,
        reason: &str,
    ) -> Result<bool, CoordinationError> {
        let record = AbandonRecord {
            owner: self.owner.clone(),
            reason: reason.to_string(),
            abandoned_at_ms: self.clock.now_ms(),
        };
        let files = [StoreFile::new(
            self.keys.range_abandoned(range),
            encode_json(&record),
        )];
        let outcome = self
            .governor
            .execute(WriteRequest::non_critical("range_abandoned"), || {
                self.store.commit_batch(&files, "range abandoned")
            })
            .await?;
        if let Some(metrics) = COORDINATION_METRICS.get() {
            metrics.ranges_abandoned_total.inc();
        }
        Ok(outcome.is_applied())
    }

    /// Shared position below which every range is known done, if anyone has published one.
    pub async fn read_done_prefix(&self) -> Result<Option<u64>, CoordinationError> {
        let Some(bytes) = self.read(&self.keys.done_prefix()).await? else {
            return Ok(None);
        };
        Ok(serde_json::from_slice::<DonePrefixRecord>(&bytes)
            .ok()
            .map(|record| record.next_start))
    }

    /// Moves the shared done prefix forward. Never moves it backward.
    pub async fn advance_done_prefix(&self, next_start: u64) -> Result<bool, CoordinationError> {
        if let Some(current) = self.read_done_prefix().await? {
            if current >= next_start {
                return Ok(false);
            }
        }
        let record = DonePrefixRecord {
            next_start,
            updated_at_ms: self.clock.now_ms(),
        };
        let files = [StoreFile::new(self.keys.done_prefix(), encode_json(&record))];
        let outcome = self
            .governor
            .execute(WriteRequest::non_critical("done_prefix"), || {
                self.store.commit_batch(&files, "done prefix")
            })
            .await?;
        Ok(outcome.is_applied())
    }

    fn item_target(&self, id: &WorkId) -> LeaseTarget {
        LeaseTarget {
            kind: "item",
            label: id.to_string(),
            lock_key: self.keys.item_lock(id),
            done_key: self.keys.item_done(id),
            ttl: self.policy.item_ttl,
        }
    }

    fn range_target(&self, range: &Range) -> LeaseTarget {
        LeaseTarget {
            kind: "range",
            label: range.label(),
            lock_key: self.keys.range_lock(range),
            done_key: self.keys.range_done(range),
            ttl: self.policy.range_ttl,
        }
    }

    async fn acquire(&self, target: &LeaseTarget) -> Result<AcquireOutcome, CoordinationError> {
        if self.exists(&target.done_key).await? {
            return Ok(AcquireOutcome::AlreadyDone);
        }

        for _ in 0..MAX_ACQUIRE_ROUNDS {
            let payload =
                LeasePayload::new(&self.owner, self.clock.now_ms(), duration_ms(target.ttl))
                    .encode();
            let created = self
                .governor
                .execute_critical("acquire_lease", || {
                    self.store.create_if_absent(&target.lock_key, &payload)
                })
                .await?;
            if created == CreateOutcome::Created {
                self.record_acquired(target);
                return Ok(AcquireOutcome::Acquired);
            }

            let Some(current_bytes) = self.read(&target.lock_key).await? else {
                // Released between our create and read; try again.
                continue;
            };
            let now = self.clock.now_ms();
            match LeasePayload::decode(&current_bytes) {
                Some(current) if !current.is_stale(now) => {
                    if current.owner == self.owner {
                        return Ok(AcquireOutcome::Acquired);
                    }
                    self.record_conflict(target);
                    return Ok(AcquireOutcome::AlreadyLocked {
                        expires_at_ms: current.expires_at_ms(),
                        owner: current.owner,
                    });
                }
                _ => {}
            }

            // Only reclaim the exact lease we judged stale; a changed body means someone else
            // already reclaimed or renewed it.
            if self.read(&target.lock_key).await?.as_deref() != Some(current_bytes.as_slice()) {
                continue;
            }
            self.governor
                .execute_critical("reclaim_stale_lease", || self.store.delete(&target.lock_key))
                .await?;
            info!(
                event = "stale_lease_reclaimed",
                kind = target.kind,
                resource = %target.label,
                owner = %self.owner,
                "deleted stale lease before re-acquiring"
            );
            if let Some(metrics) = COORDINATION_METRICS.get() {
                metrics.stale_leases_reclaimed_total.inc();
            }
        }

        self.record_conflict(target);
        let holder = match self.read(&target.lock_key).await? {
            Some(bytes) => LeasePayload::decode(&bytes),
            None => None,
        };
        Ok(match holder {
            Some(lease) => AcquireOutcome::AlreadyLocked {
                expires_at_ms: lease.expires_at_ms(),
                owner: lease.owner,
            },
            None => AcquireOutcome::AlreadyLocked {
                owner: String::new(),
                expires_at_ms: self.clock.now_ms(),
            },
        })
    }

    async fn release(&self, target: &LeaseTarget) -> Result<ReleaseOutcome, CoordinationError> {
        let Some(bytes) = self.read(&target.lock_key).await? else {
            return Ok(ReleaseOutcome::NotHeld);
        };
        match LeasePayload::decode(&bytes) {
            Some(lease) if lease.owner == self.owner => {
                self.governor
                    .execute_critical("release_lease", || self.store.delete(&target.lock_key))
                    .await?;
                debug!(
                    event = "lease_released",
                    kind = target.kind,
                    resource = %target.label,
                    "released lease"
                );
                Ok(ReleaseOutcome::Released)
            }
            Some(lease) => {
                debug!(
                    event = "lease_release_skipped",
                    kind = target.kind,
                    resource = %target.label,
                    holder = %lease.owner,
                    "lease held by another owner; leaving it in place"
                );
                Ok(ReleaseOutcome::NotHeld)
            }
            None => Ok(ReleaseOutcome::NotHeld),
        }
    }

    async fn renew(&self, target: &LeaseTarget) -> Result<RenewOutcome, CoordinationError> {
        let Some(bytes) = self.read(&target.lock_key).await? else {
            return Ok(RenewOutcome::Lost);
        };
        let Some(mut lease) = LeasePayload::decode(&bytes) else {
            return Ok(RenewOutcome::Lost);
        };
        if lease.owner != self.owner {
            return Ok(RenewOutcome::Lost);
        }

        lease.acquired_at_ms = self.clock.now_ms();
        lease.ttl_ms = duration_ms(target.ttl);
        let files = [StoreFile::new(target.lock_key.clone(), lease.encode())];
        let outcome = self
            .governor
            .execute(
                WriteRequest::non_critical("renew_lease").throttled(&target.lock_key),
                || self.store.commit_batch(&files, "lease heartbeat"),
            )
            .await?;
        Ok(match outcome {
            CommitOutcome::Applied(()) => RenewOutcome::Renewed,
            CommitOutcome::ShortCircuited => RenewOutcome::Deferred,
        })
    }

    async fn mark_done(&self, target: &LeaseTarget) -> Result<MarkDoneOutcome, CoordinationError> {
        let record = DoneRecord {
            owner: self.owner.clone(),
            done_at_ms: self.clock.now_ms(),
        }
        .encode();
        let created = self
            .governor
            .execute_critical("mark_done", || {
                self.store.create_if_absent(&target.done_key, &record)
            })
            .await?;
        self.governor
            .execute_critical("release_after_done", || self.store.delete(&target.lock_key))
            .await?;

        Ok(match created {
            CreateOutcome::Created => MarkDoneOutcome::Marked,
            CreateOutcome::AlreadyExists => MarkDoneOutcome::AlreadyMarked,
        })
    }

    async fn exists(&self, key: &str) -> Result<bool, CoordinationError> {
        Ok(self.read(key).await?.is_some())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, CoordinationError> {
        Ok(self.governor.read("read", || self.store.read(key)).await?)
    }

    fn record_acquired(&self, target: &LeaseTarget) {
        debug!(
            event = "lease_acquired",
            kind = target.kind,
            resource = %target.label,
            owner = %self.owner,
            "acquired lease"
        );
        if let Some(metrics) = COORDINATION_METRICS.get() {
            match target.kind {
                "range" => metrics.ranges_acquired_total.inc(),
                _ => metrics.item_leases_acquired_total.inc(),
            };
        }
    }

    fn record_conflict(&self, target: &LeaseTarget) {
        if let Some(metrics) = COORDINATION_METRICS.get() {
            match target.kind {
                "range" => metrics.range_lock_conflicts_total.inc(),
                _ => metrics.item_lease_conflicts_total.inc(),
            };
        }
    }
}

fn encode_json<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}
