use std::time::Duration;

use super::{
    AcquireOutcome, LeasePayload, MarkDoneOutcome, Range, RangeProgressRecord, RangeStatus,
    ReleaseOutcome, RenewOutcome,
};
use crate::lease_store::{StoreError, StoreOp};
use crate::test_support::{shared_world, TestClient, START_MS};
use crate::work::WorkId;

fn id(raw: &str) -> WorkId {
    WorkId::parse(raw).expect("valid id")
}

#[tokio::test]
async fn concurrent_acquires_grant_exactly_one_lease() {
    let (store, clock) = shared_world();
    let clients: Vec<_> = (0..8)
        .map(|n| TestClient::new(&store, &clock, &format!("client-{n}")))
        .collect();
    let item = id("photo-1");

    let outcomes = futures::future::join_all(
        clients
            .iter()
            .map(|client| client.coordinator.acquire_item(&item)),
    )
    .await;

    let acquired = outcomes
        .iter()
        .filter(|outcome| matches!(outcome, Ok(AcquireOutcome::Acquired)))
        .count();
    assert_eq!(acquired, 1);
    assert!(outcomes
        .iter()
        .all(|outcome| matches!(outcome, Ok(AcquireOutcome::Acquired | AcquireOutcome::AlreadyLocked { .. }))));
}

#[tokio::test]
async fn live_lease_blocks_other_owner_until_ttl_expires() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let b = TestClient::new(&store, &clock, "b");
    let item = id("photo-2");

    assert_eq!(a.coordinator.acquire_item(&item).await.expect("acquire"), AcquireOutcome::Acquired);
    assert_eq!(
        b.coordinator.acquire_item(&item).await.expect("acquire"),
        AcquireOutcome::AlreadyLocked {
            owner: "a".to_string(),
            expires_at_ms: START_MS + 60_000,
        }
    );

    // Exactly at the TTL the lease is still held.
    clock.advance(Duration::from_secs(60));
    assert!(matches!(
        b.coordinator.acquire_item(&item).await.expect("acquire"),
        AcquireOutcome::AlreadyLocked { .. }
    ));

    clock.advance(Duration::from_millis(1));
    assert_eq!(b.coordinator.acquire_item(&item).await.expect("acquire"), AcquireOutcome::Acquired);
    let lease = LeasePayload::decode(&store.get("ns/locks/photo-2.json").expect("lock")).expect("lease");
    assert_eq!(lease.owner, "b");
    assert_eq!(lease.acquired_at_ms, START_MS + 60_001);
}

#[tokio::test]
async fn unreadable_lease_is_reclaimed() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    store.insert_raw("ns/locks/photo-3.json", b"{truncated".to_vec());

    assert_eq!(
        a.coordinator.acquire_item(&id("photo-3")).await.expect("acquire"),
        AcquireOutcome::Acquired
    );
}

#[tokio::test]
async fn done_marker_wins_over_lock() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let b = TestClient::new(&store, &clock, "b");
    let item = id("photo-4");

    a.coordinator.acquire_item(&item).await.expect("acquire");
    store.insert_raw("ns/done/photo-4", b"{}".to_vec());
    let creates_before = store.calls(StoreOp::Create);

    assert_eq!(b.coordinator.acquire_item(&item).await.expect("acquire"), AcquireOutcome::AlreadyDone);
    assert_eq!(store.calls(StoreOp::Create), creates_before);
    assert!(store.contains("ns/locks/photo-4.json"));
}

#[tokio::test]
async fn mark_done_is_idempotent_and_releases_any_lock() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let b = TestClient::new(&store, &clock, "b");
    let item = id("photo-5");

    b.coordinator.acquire_item(&item).await.expect("acquire");
    assert_eq!(a.coordinator.mark_item_done(&item).await.expect("mark"), MarkDoneOutcome::Marked);
    assert_eq!(
        a.coordinator.mark_item_done(&item).await.expect("mark again"),
        MarkDoneOutcome::AlreadyMarked
    );

    assert_eq!(store.keys_with_prefix("ns/done/"), vec!["ns/done/photo-5".to_string()]);
    assert!(!store.contains("ns/locks/photo-5.json"));
    assert!(a.coordinator.is_done(&item).await.expect("is_done"));
}

#[tokio::test]
async fn mark_done_retries_transient_failures() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    store.fail_next(
        StoreOp::Create,
        vec![StoreError::transient("create", "503"), StoreError::transient("create", "reset")],
    );

    a.coordinator.mark_item_done(&id("photo-6")).await.expect("mark");
    assert!(store.contains("ns/done/photo-6"));
    assert_eq!(store.calls(StoreOp::Create), 3);
}

#[tokio::test]
async fn release_only_deletes_own_lease() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let b = TestClient::new(&store, &clock, "b");
    let item = id("photo-7");

    a.coordinator.acquire_item(&item).await.expect("acquire");
    assert_eq!(b.coordinator.release_item(&item).await.expect("release"), ReleaseOutcome::NotHeld);
    assert!(store.contains("ns/locks/photo-7.json"));

    assert_eq!(a.coordinator.release_item(&item).await.expect("release"), ReleaseOutcome::Released);
    assert_eq!(a.coordinator.release_item(&item).await.expect("release"), ReleaseOutcome::NotHeld);
}

#[tokio::test]
async fn renew_refreshes_only_owned_leases() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let b = TestClient::new(&store, &clock, "b");
    let range = Range::at_index(0, 300);

    a.coordinator.acquire_range(&range).await.expect("acquire");
    clock.advance(Duration::from_secs(500));
    assert_eq!(a.coordinator.renew_range(&range).await.expect("renew"), RenewOutcome::Renewed);
    assert_eq!(b.coordinator.renew_range(&range).await.expect("renew"), RenewOutcome::Lost);

    // Past the original expiry, but the heartbeat kept it live.
    clock.advance(Duration::from_secs(500));
    assert!(matches!(
        b.coordinator.acquire_range(&range).await.expect("acquire"),
        AcquireOutcome::AlreadyLocked { .. }
    ));
}

#[tokio::test]
async fn range_status_resolves_done_then_lock() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let range = Range::at_index(2, 300);

    assert_eq!(a.coordinator.range_status(&range).await.expect("status"), RangeStatus::Free);
    a.coordinator.acquire_range(&range).await.expect("acquire");
    assert_eq!(
        a.coordinator.range_status(&range).await.expect("status"),
        RangeStatus::Locked {
            owner: "a".to_string(),
            acquired_at_ms: START_MS,
            expires_at_ms: START_MS + 600_000,
        }
    );

    a.coordinator.mark_range_done(&range).await.expect("done");
    assert_eq!(a.coordinator.range_status(&range).await.expect("status"), RangeStatus::Done);
    assert!(!store.contains("ns/ranges/locks/600-900.json"));
}

#[tokio::test]
async fn done_prefix_only_moves_forward() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");

    assert_eq!(a.coordinator.read_done_prefix().await.expect("read"), None);
    assert!(a.coordinator.advance_done_prefix(900).await.expect("advance"));
    assert!(!a.coordinator.advance_done_prefix(600).await.expect("advance"));
    assert_eq!(a.coordinator.read_done_prefix().await.expect("read"), Some(900));
}

#[tokio::test]
async fn progress_and_abandon_notes_are_written() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let range = Range::at_index(1, 300);
    let record = RangeProgressRecord {
        owner: "a".to_string(),
        updated_at_ms: START_MS,
        frontier: 317,
        holes: vec![320],
        published: 16,
        skipped_done: 1,
    };

    assert!(a.coordinator.write_range_progress(&range, &record).await.expect("progress"));
    let stored: RangeProgressRecord =
        serde_json::from_slice(&store.get("ns/ranges/progress/300-600.json").expect("progress"))
            .expect("decode");
    assert_eq!(stored, record);

    assert!(a.coordinator.mark_range_abandoned(&range, "shutdown").await.expect("abandon"));
    assert!(store.contains("ns/ranges/abandoned/300-600.json"));
}

#[tokio::test]
async fn non_critical_notes_are_skipped_during_outage() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    store.set_outage(true);

    // Five failures open the breaker; later notes never reach the store.
    for _ in 0..5 {
        let _ = a.coordinator.advance_done_prefix(300).await;
    }
    let calls = store.mutation_calls();
    assert!(!a.coordinator.advance_done_prefix(600).await.expect("short-circuited"));
    assert_eq!(store.mutation_calls(), calls);
}

#[tokio::test]
async fn rejected_notes_are_skipped_not_fatal() {
    let (store, clock) = shared_world();
    let a = TestClient::new(&store, &clock, "a");
    let range = Range::at_index(0, 10);
    store.fail_next(
        StoreOp::Commit,
        vec![
            StoreError::fatal("commit", "forbidden"),
            StoreError::fatal("commit", "forbidden"),
            StoreError::fatal("commit", "forbidden"),
        ],
    );
    let record = RangeProgressRecord {
        owner: "a".to_string(),
        updated_at_ms: START_MS,
        frontier: 4,
        holes: vec![],
        published: 4,
        skipped_done: 0,
    };

    assert!(!a.coordinator.write_range_progress(&range, &record).await.expect("progress"));
    assert!(!a.coordinator.mark_range_abandoned(&range, "shutdown").await.expect("abandon"));
    assert!(!a.coordinator.advance_done_prefix(10).await.expect("prefix"));
    assert_eq!(a.coordinator.read_done_prefix().await.expect("read"), None);
}
