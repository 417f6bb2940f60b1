use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use crate::clock::ManualClock;
use crate::commit_governor::{BackoffPolicy, BreakerConfig, CommitGovernor, GovernorConfig};
use crate::coordination::{KeyLayout, LeasePolicy, LockCoordinator};
use crate::lease_store::MemoryLeaseStore;

pub(crate) const START_MS: u64 = 1_700_000_000_000;

pub(crate) fn test_governor(clock: &Arc<ManualClock>) -> Arc<CommitGovernor> {
    Arc::new(CommitGovernor::with_rng(
        GovernorConfig {
            breaker: BreakerConfig {
                failure_threshold: 5,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(30),
            },
            backoff: BackoffPolicy::immediate(4),
            non_critical_min_interval: Duration::ZERO,
        },
        clock.clone(),
        StdRng::seed_from_u64(11),
    ))
}

/// One simulated client against a shared in-memory store.
pub(crate) struct TestClient {
    pub store: Arc<MemoryLeaseStore>,
    pub clock: Arc<ManualClock>,
    pub coordinator: Arc<LockCoordinator>,
}

impl TestClient {
    pub(crate) fn new(store: &Arc<MemoryLeaseStore>, clock: &Arc<ManualClock>, owner: &str) -> Self {
        Self::with_policy(
            store,
            clock,
            owner,
            LeasePolicy {
                item_ttl: Duration::from_secs(60),
                range_ttl: Duration::from_secs(600),
            },
        )
    }

    pub(crate) fn with_policy(
        store: &Arc<MemoryLeaseStore>,
        clock: &Arc<ManualClock>,
        owner: &str,
        policy: LeasePolicy,
    ) -> Self {
        let coordinator = LockCoordinator::new(
            store.clone(),
            test_governor(clock),
            KeyLayout::new("ns"),
            clock.clone(),
            owner,
            policy,
        );
        Self {
            store: store.clone(),
            clock: clock.clone(),
            coordinator: Arc::new(coordinator),
        }
    }
}

pub(crate) fn shared_world() -> (Arc<MemoryLeaseStore>, Arc<ManualClock>) {
    (
        Arc::new(MemoryLeaseStore::new()),
        Arc::new(ManualClock::starting_at(START_MS)),
    )
}
