//! Crash and reclaim scenarios driven by explicit timestamps
//!
//! No test sleeps: heartbeats are written with chosen times and the reclaim
//! sweep is evaluated at a chosen `now`.

use chrono::{Duration, Utc};

use bucket_loader::models::{BundleId, BundleState, ProducedRecord};
use bucket_loader::prelude::*;

use crate::common::{seed_bundles, SharedDb};

#[tokio::test]
async fn test_abandoned_bundle_moves_to_survivor() {
    let db = SharedDb::new();
    let seed = db.handle();
    let (_, ids) = seed_bundles(&seed, 42).await;
    let timeout = Duration::seconds(60);
    let t1 = Utc::now();

    // Finish the first 41 bundles so the next claim picks bundle 42
    let finisher = seed.register("finisher", 100).await.unwrap().id;
    for bundle in seed.claim_batch(finisher, 41).await.unwrap() {
        seed.mark_completed(bundle, finisher, &[]).await.unwrap();
    }

    let a = db.handle();
    let b = db.handle();
    let ia = a.register("host-a", 1).await.unwrap().id;
    let ib = b.register("host-b", 2).await.unwrap().id;

    // A claims bundle 42 at t1, starts it, then stops heart-beating
    a.heartbeat(ia, t1).await.unwrap();
    let claimed = a.claim_batch(ia, 1).await.unwrap();
    assert_eq!(claimed, vec![ids[41]]);
    let bundle_42 = claimed[0];
    a.mark_started(bundle_42, ia).await.unwrap();

    // B is alive at t1 + timeout + epsilon and sweeps
    let now = t1 + timeout + Duration::seconds(1);
    b.heartbeat(ib, now).await.unwrap();
    assert!(!b.is_live(ia, now, timeout).await.unwrap());
    assert!(b.is_live(ib, now, timeout).await.unwrap());

    assert_eq!(b.reclaim_abandoned(timeout, now).await.unwrap(), 1);
    let row = b.get_bundle(bundle_42).await.unwrap().unwrap();
    assert_eq!(row.state(), BundleState::Unclaimed);
    assert_eq!(row.owner, None);
    assert_eq!(row.load_started, None);

    // B takes it over
    assert_eq!(b.claim_batch(ib, 10).await.unwrap(), vec![bundle_42]);

    // A wakes up: every further transition is refused
    let err = a.mark_started(bundle_42, ia).await.unwrap_err();
    assert!(matches!(
        err.precondition(),
        Some(PreconditionViolation::NotOwner { .. })
    ));
    let err = a
        .mark_completed(bundle_42, ia, &[ProducedRecord::new("Patient", "late")])
        .await
        .unwrap_err();
    assert!(matches!(
        err.precondition(),
        Some(PreconditionViolation::NotOwner { .. })
    ));
    assert!(a.release(bundle_42, ia).await.is_err());
    assert_eq!(a.count_records().await.unwrap(), 0);

    // B finishes the bundle
    b.mark_started(bundle_42, ib).await.unwrap();
    let summary = b
        .mark_completed(bundle_42, ib, &[ProducedRecord::new("Patient", "p42")])
        .await
        .unwrap();
    assert_eq!(summary.inserted, 1);
    assert_eq!(b.catalog_stats().await.unwrap().done, 42);
}

#[tokio::test]
async fn test_reclaim_respects_liveness_boundary() {
    let db = SharedDb::new();
    let store = db.handle();
    seed_bundles(&store, 1).await;
    let timeout = Duration::seconds(30);
    let t0 = Utc::now();

    let owner = store.register("edge", 1).await.unwrap().id;
    store.heartbeat(owner, t0).await.unwrap();
    store.claim_batch(owner, 1).await.unwrap();

    // Still live one second before the timeout elapses
    assert_eq!(
        store
            .reclaim_abandoned(timeout, t0 + timeout - Duration::seconds(1))
            .await
            .unwrap(),
        0
    );

    // Dead exactly at the timeout
    assert_eq!(store.reclaim_abandoned(timeout, t0 + timeout).await.unwrap(), 1);
}

#[tokio::test]
async fn test_reclaim_never_touches_done_or_live_work() {
    let db = SharedDb::new();
    let store = db.handle();
    let (_, ids) = seed_bundles(&store, 3).await;
    let timeout = Duration::seconds(60);
    let t0 = Utc::now();

    let dead = store.register("dead", 1).await.unwrap().id;
    let live = store.register("live", 2).await.unwrap().id;
    store.heartbeat(dead, t0).await.unwrap();

    // dead: one done, one in progress; live: one claimed
    let dead_batch = store.claim_batch(dead, 2).await.unwrap();
    store.mark_completed(dead_batch[0], dead, &[]).await.unwrap();
    store.mark_started(dead_batch[1], dead).await.unwrap();
    store.claim_batch(live, 1).await.unwrap();

    let now = t0 + Duration::minutes(10);
    store.heartbeat(live, now).await.unwrap();

    assert_eq!(store.reclaim_abandoned(timeout, now).await.unwrap(), 1);

    let states: Vec<BundleState> = {
        let mut states = Vec::new();
        for id in &ids {
            states.push(store.get_bundle(*id).await.unwrap().unwrap().state());
        }
        states
    };
    assert_eq!(
        states,
        vec![BundleState::Done, BundleState::Unclaimed, BundleState::Claimed]
    );
}

#[tokio::test]
async fn test_heartbeat_keeps_work_owned() {
    let db = SharedDb::new();
    let store = db.handle();
    seed_bundles(&store, 1).await;
    let timeout = Duration::seconds(60);
    let t0 = Utc::now();

    let owner = store.register("steady", 1).await.unwrap().id;
    store.heartbeat(owner, t0).await.unwrap();
    store.claim_batch(owner, 1).await.unwrap();

    // Regular heartbeats keep the owner live across many sweeps
    for minute in 1..=5 {
        let now = t0 + Duration::minutes(minute);
        store.heartbeat(owner, now).await.unwrap();
        assert_eq!(store.reclaim_abandoned(timeout, now).await.unwrap(), 0);
    }

    let row = store.get_bundle(BundleId::new(1)).await.unwrap().unwrap();
    assert_eq!(row.owner, Some(owner));
}

#[tokio::test]
async fn test_unknown_instance_cannot_heartbeat() {
    let db = SharedDb::new();
    let store = db.handle();

    let err = store
        .heartbeat(InstanceId::new(404), Utc::now())
        .await
        .unwrap_err();
    assert!(matches!(
        err.precondition(),
        Some(PreconditionViolation::UnknownInstance(_))
    ));
    assert!(!err.is_recoverable());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reclaim_sweeps_reset_each_bundle_once() {
    let db = SharedDb::new();
    let seed = db.handle();
    let (_, ids) = seed_bundles(&seed, 60).await;
    let timeout = Duration::seconds(60);
    let t0 = Utc::now();
    let now = t0 + timeout + Duration::seconds(1);

    // Two dead owners hold 40 bundles, one live owner holds the other 20
    let mut abandoned = 0;
    for pid in [1, 2] {
        let dead = seed.register("dead-host", pid).await.unwrap().id;
        seed.heartbeat(dead, t0).await.unwrap();
        let claimed = seed.claim_batch(dead, 20).await.unwrap();
        seed.mark_started(claimed[0], dead).await.unwrap();
        abandoned += claimed.len() as u64;
    }
    let live = seed.register("live-host", 3).await.unwrap().id;
    seed.heartbeat(live, now).await.unwrap();
    let kept = seed.claim_batch(live, 20).await.unwrap();
    seed.mark_started(kept[0], live).await.unwrap();
    assert_eq!(abandoned + kept.len() as u64, ids.len() as u64);

    let mut tasks = Vec::new();
    for _ in 0..6 {
        let store = db.handle();
        tasks.push(tokio::spawn(async move {
            let mut total = 0;
            for _ in 0..3 {
                total += store.reclaim_abandoned(timeout, now).await.unwrap();
            }
            total
        }));
    }

    let mut reclaimed = 0;
    for task in tasks {
        reclaimed += task.await.unwrap();
    }
    assert_eq!(reclaimed, abandoned);

    let stats = seed.catalog_stats().await.unwrap();
    assert_eq!(stats.unclaimed, abandoned);
    for bundle in &kept {
        let row = seed.get_bundle(*bundle).await.unwrap().unwrap();
        assert_eq!(row.owner, Some(live));
        assert!(matches!(row.state(), BundleState::Claimed | BundleState::InProgress));
    }
    assert_eq!(
        seed.get_bundle(kept[0]).await.unwrap().unwrap().state(),
        BundleState::InProgress
    );
}
