use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;

use super::{
    BackoffPolicy, BreakerConfig, CircuitState, CommitGovernor, CommitOutcome, GovernorConfig,
    GovernorError, WriteRequest,
};
use crate::clock::ManualClock;
use crate::lease_store::{CreateOutcome, LeaseStore, MemoryLeaseStore, StoreError, StoreFile, StoreOp};

fn governor(clock: Arc<ManualClock>, max_attempts: u32) -> CommitGovernor {
    CommitGovernor::with_rng(
        GovernorConfig {
            breaker: BreakerConfig {
                failure_threshold: 3,
                failure_window: Duration::from_secs(60),
                cooldown: Duration::from_secs(5),
            },
            backoff: BackoffPolicy::immediate(max_attempts),
            non_critical_min_interval: Duration::from_secs(10),
        },
        clock,
        StdRng::seed_from_u64(7),
    )
}

fn progress_file() -> Vec<StoreFile> {
    vec![StoreFile::new("ranges/progress/0-10.json", b"{}".to_vec())]
}

#[tokio::test]
async fn critical_write_retries_through_transient_failures() {
    let store = MemoryLeaseStore::new();
    store.fail_next(
        StoreOp::Create,
        vec![
            StoreError::transient("create", "reset"),
            StoreError::transient("create", "timeout"),
        ],
    );
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 5);

    let outcome = governor
        .execute(WriteRequest::critical("mark_done"), || {
            store.create_if_absent("done/a", b"")
        })
        .await
        .expect("third attempt succeeds");

    assert_eq!(outcome, CommitOutcome::Applied(CreateOutcome::Created));
    assert_eq!(store.calls(StoreOp::Create), 3);
    assert_eq!(governor.circuit().state, CircuitState::Closed);
}

#[tokio::test]
async fn exhausted_critical_write_is_a_hard_failure() {
    let store = MemoryLeaseStore::new();
    store.set_outage(true);
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 2);

    let err = governor
        .execute(WriteRequest::critical("mark_done"), || {
            store.create_if_absent("done/a", b"")
        })
        .await
        .expect_err("outage outlasts the retry budget");

    match err {
        GovernorError::Exhausted {
            attempts, class, ..
        } => {
            assert_eq!(attempts, 2);
            assert_eq!(class, "critical");
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert!(!store.contains("done/a"));
}

#[tokio::test]
async fn fatal_store_errors_are_not_retried() {
    let store = MemoryLeaseStore::new();
    store.fail_next(StoreOp::Delete, vec![StoreError::fatal("delete", "forbidden")]);
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 5);

    let err = governor
        .execute(WriteRequest::critical("release"), || store.delete("locks/a.json"))
        .await
        .expect_err("fatal errors surface immediately");

    assert!(matches!(err, GovernorError::Rejected { .. }));
    assert_eq!(store.calls(StoreOp::Delete), 1);
    assert_eq!(governor.circuit().failure_count, 0);
}

#[tokio::test]
async fn open_circuit_short_circuits_non_critical_writes_until_trial() {
    let clock = Arc::new(ManualClock::starting_at(0));
    let store = MemoryLeaseStore::new();
    let governor = governor(clock.clone(), 3);

    store.set_outage(true);
    let err = governor
        .execute(WriteRequest::critical("mark_done"), || {
            store.create_if_absent("done/a", b"")
        })
        .await;
    assert!(err.is_err());
    assert_eq!(governor.circuit().state, CircuitState::Open);
    store.set_outage(false);

    let calls_before = store.mutation_calls();
    let files = progress_file();
    let skipped = governor
        .execute(WriteRequest::non_critical("range_progress"), || {
            store.commit_batch(&files, "progress")
        })
        .await
        .expect("short circuit is not an error");
    assert_eq!(skipped, CommitOutcome::ShortCircuited);
    assert_eq!(store.mutation_calls(), calls_before);

    let critical = governor
        .execute(WriteRequest::critical("release"), || store.delete("locks/a.json"))
        .await
        .expect("critical writes still go through");
    assert!(critical.is_applied());
    assert_eq!(governor.circuit().state, CircuitState::Open);

    clock.advance(Duration::from_secs(5));
    let trial = governor
        .execute(WriteRequest::non_critical("range_progress"), || {
            store.commit_batch(&files, "progress")
        })
        .await
        .expect("trial write");
    assert_eq!(trial, CommitOutcome::Applied(()));
    assert_eq!(store.calls(StoreOp::Commit), 1);
    assert_eq!(governor.circuit().state, CircuitState::Closed);
}

#[tokio::test]
async fn failing_non_critical_write_stops_retrying_once_circuit_opens() {
    let store = MemoryLeaseStore::new();
    store.set_outage(true);
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 10);
    let files = progress_file();

    let outcome = governor
        .execute(WriteRequest::non_critical("heartbeat"), || {
            store.commit_batch(&files, "heartbeat")
        })
        .await
        .expect("non-critical failure degrades to a skip");

    assert_eq!(outcome, CommitOutcome::ShortCircuited);
    assert_eq!(store.calls(StoreOp::Commit), 3);
}

#[tokio::test]
async fn throttled_non_critical_writes_are_spaced_per_key() {
    let clock = Arc::new(ManualClock::starting_at(0));
    let store = MemoryLeaseStore::new();
    let governor = governor(clock.clone(), 3);
    let files = progress_file();

    let request = WriteRequest::non_critical("range_progress").throttled("0-10");
    let first = governor
        .execute(request, || store.commit_batch(&files, "p"))
        .await
        .expect("first");
    let second = governor
        .execute(request, || store.commit_batch(&files, "p"))
        .await
        .expect("second");
    let other_key = governor
        .execute(
            WriteRequest::non_critical("range_progress").throttled("10-20"),
            || store.commit_batch(&files, "p"),
        )
        .await
        .expect("other key");
    clock.advance(Duration::from_secs(10));
    let third = governor
        .execute(request, || store.commit_batch(&files, "p"))
        .await
        .expect("third");

    assert!(first.is_applied());
    assert_eq!(second, CommitOutcome::ShortCircuited);
    assert!(other_key.is_applied());
    assert!(third.is_applied());
    assert_eq!(store.calls(StoreOp::Commit), 3);
}

#[tokio::test]
async fn rejected_non_critical_write_degrades_to_a_skip() {
    let store = MemoryLeaseStore::new();
    store.fail_next(StoreOp::Commit, vec![StoreError::fatal("commit", "forbidden")]);
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 5);
    let files = progress_file();

    let outcome = governor
        .execute(WriteRequest::non_critical("done_prefix"), || {
            store.commit_batch(&files, "prefix")
        })
        .await
        .expect("non-critical rejection is not an error");

    assert_eq!(outcome, CommitOutcome::ShortCircuited);
    assert_eq!(store.calls(StoreOp::Commit), 1);
    assert_eq!(governor.circuit().state, CircuitState::Closed);
}

#[tokio::test]
async fn exhausted_non_critical_write_degrades_to_a_skip() {
    let store = MemoryLeaseStore::new();
    store.fail_next(
        StoreOp::Commit,
        vec![
            StoreError::transient("commit", "reset"),
            StoreError::transient("commit", "reset"),
        ],
    );
    // Two attempts stay below the breaker threshold, so the budget runs out first.
    let governor = governor(Arc::new(ManualClock::starting_at(0)), 2);
    let files = progress_file();

    let outcome = governor
        .execute(WriteRequest::non_critical("heartbeat"), || {
            store.commit_batch(&files, "heartbeat")
        })
        .await
        .expect("non-critical exhaustion is not an error");

    assert_eq!(outcome, CommitOutcome::ShortCircuited);
    assert_eq!(store.calls(StoreOp::Commit), 2);
}
