//! Races between store handles on one database file
//!
//! 1. Concurrent catalog inserts converge on one row
//! 2. Concurrent claims never hand a bundle to two instances
//! 3. Every claimed bundle can be completed exactly once
//! 4. Reloading records is idempotent
//! 5. Allocation ids stay unique and increasing per handle

use std::collections::{HashMap, HashSet};

use bucket_loader::models::{BundleId, BundleState, ProducedRecord, RecordOutcome};
use bucket_loader::prelude::*;

use crate::common::{seed_bundles, SharedDb, TEST_KINDS};

// ============================================================================
// Catalog
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_discovery_converges() {
    let db = SharedDb::new();
    let mut tasks = Vec::new();

    for _ in 0..6 {
        let store = db.handle();
        tasks.push(tokio::spawn(async move {
            let mut seen = Vec::new();
            for i in 0..20 {
                let location = store
                    .ensure_location("bkt", &format!("/p{}/", i % 3))
                    .await
                    .unwrap();
                let ensured = store
                    .ensure_bundle(location, &format!("obj-{i}.json"), 10, "json")
                    .await
                    .unwrap();
                seen.push((i, ensured));
            }
            seen
        }));
    }

    let mut ids: HashMap<usize, HashSet<BundleId>> = HashMap::new();
    let mut creators: HashMap<usize, usize> = HashMap::new();
    for task in tasks {
        for (i, ensured) in task.await.unwrap() {
            ids.entry(i).or_default().insert(ensured.id);
            if ensured.is_new {
                *creators.entry(i).or_default() += 1;
            }
        }
    }

    // Every caller got the same id, and exactly one caller created it
    assert_eq!(ids.len(), 20);
    assert!(ids.values().all(|set| set.len() == 1));
    assert!(creators.values().all(|&count| count == 1));
    assert_eq!(creators.len(), 20);

    let stats = db.handle().catalog_stats().await.unwrap();
    assert_eq!(stats.locations, 3);
    assert_eq!(stats.unclaimed, 20);
}

// ============================================================================
// Claims
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_disjoint() {
    let db = SharedDb::new();
    let seed = db.handle();
    let (_, all_ids) = seed_bundles(&seed, 100).await;

    let mut tasks = Vec::new();
    for worker in 0..5u32 {
        let store = db.handle();
        tasks.push(tokio::spawn(async move {
            let me = store.register("race-host", worker).await.unwrap().id;
            let mut mine = Vec::new();
            loop {
                let batch = store.claim_batch(me, 7).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                mine.extend(batch);
            }
            (me, mine)
        }));
    }

    let mut owner_of: HashMap<BundleId, InstanceId> = HashMap::new();
    for task in tasks {
        let (me, mine) = task.await.unwrap();
        for bundle in mine {
            assert!(
                owner_of.insert(bundle, me).is_none(),
                "bundle {bundle} was claimed twice"
            );
        }
    }

    assert_eq!(owner_of.len(), all_ids.len());
    for (bundle, owner) in &owner_of {
        let row = seed.get_bundle(*bundle).await.unwrap().unwrap();
        assert_eq!(row.owner, Some(*owner));
        assert_eq!(row.state(), BundleState::Claimed);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_batch_shares_one_allocation_id() {
    let db = SharedDb::new();
    let seed = db.handle();
    seed_bundles(&seed, 10).await;

    let a = db.handle();
    let b = db.handle();
    let ia = a.register("host-a", 1).await.unwrap().id;
    let ib = b.register("host-b", 2).await.unwrap().id;

    let batch_a = a.claim_batch(ia, 4).await.unwrap();
    let batch_b = b.claim_batch(ib, 4).await.unwrap();

    let mut allocs_a = HashSet::new();
    for id in &batch_a {
        allocs_a.insert(seed.get_bundle(*id).await.unwrap().unwrap().allocation_id);
    }
    let mut allocs_b = HashSet::new();
    for id in &batch_b {
        allocs_b.insert(seed.get_bundle(*id).await.unwrap().unwrap().allocation_id);
    }

    assert_eq!(batch_a.len(), 4);
    assert_eq!(allocs_a.len(), 1);
    assert_eq!(allocs_b.len(), 1);
    assert!(allocs_a.is_disjoint(&allocs_b));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_completion_is_lost() {
    let db = SharedDb::new();
    let seed = db.handle();
    seed_bundles(&seed, 60).await;

    let mut tasks = Vec::new();
    for worker in 0..4u32 {
        let store = db.handle();
        tasks.push(tokio::spawn(async move {
            let me = store.register("done-host", worker).await.unwrap().id;
            let mut completed = 0usize;
            loop {
                let batch = store.claim_batch(me, 5).await.unwrap();
                if batch.is_empty() {
                    break;
                }
                for bundle in batch {
                    store.mark_started(bundle, me).await.unwrap();
                    let records = vec![ProducedRecord::new("Patient", format!("p-{bundle}"))];
                    store.mark_completed(bundle, me, &records).await.unwrap();
                    completed += 1;
                }
            }
            completed
        }));
    }

    let mut total = 0;
    for task in tasks {
        total += task.await.unwrap();
    }

    assert_eq!(total, 60);
    let stats = seed.catalog_stats().await.unwrap();
    assert_eq!(stats.done, 60);
    assert_eq!(stats.total_bundles(), 60);
    assert_eq!(seed.count_records().await.unwrap(), 60);
}

// ============================================================================
// Ledger
// ============================================================================

#[tokio::test]
async fn test_reload_is_idempotent() {
    let db = SharedDb::new();
    let store = db.handle();
    let (_, ids) = seed_bundles(&store, 2).await;
    let me = store.register("reload-host", 1).await.unwrap().id;

    // A crashed first attempt already wrote part of the records
    assert_eq!(
        store.record_if_absent("Patient", "p1", ids[0]).await.unwrap(),
        RecordOutcome::Inserted
    );

    store.claim_batch(me, 2).await.unwrap();
    let records = vec![
        ProducedRecord::new("Patient", "p1"),
        ProducedRecord::new("Patient", "p2"),
        ProducedRecord::new("Encounter", "e1"),
    ];
    let first = store.mark_completed(ids[0], me, &records).await.unwrap();
    assert_eq!(first.inserted, 2);
    assert_eq!(first.already_present, 1);

    // A second bundle carrying the same records stores nothing new
    let second = store.mark_completed(ids[1], me, &records).await.unwrap();
    assert_eq!(second.inserted, 0);
    assert_eq!(second.already_present, 3);

    assert_eq!(store.count_records().await.unwrap(), 3);
}

#[tokio::test]
async fn test_record_kinds_populated_from_many_handles() {
    let db = SharedDb::new();
    let a = db.handle();
    let b = db.handle();

    let first = a.populate_record_kinds(TEST_KINDS).await.unwrap();
    let second = b.populate_record_kinds(TEST_KINDS).await.unwrap();
    assert_eq!(first, TEST_KINDS.len());
    assert_eq!(second, 0);
}

// ============================================================================
// Allocation counter
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_allocation_ids_unique_across_handles() {
    let db = SharedDb::new();
    let mut tasks = Vec::new();

    for _ in 0..4 {
        let store = db.handle_with_cache(7);
        tasks.push(tokio::spawn(async move {
            let mut drawn = Vec::new();
            for _ in 0..50 {
                drawn.push(store.next_allocation_id().await.unwrap().get());
            }
            drawn
        }));
    }

    let mut all = HashSet::new();
    for task in tasks {
        let drawn = task.await.unwrap();
        assert!(drawn.windows(2).all(|w| w[0] < w[1]), "ids must increase per handle");
        for id in drawn {
            assert!(all.insert(id), "allocation id {id} issued twice");
        }
    }
    assert_eq!(all.len(), 200);
}

#[tokio::test]
async fn test_allocation_ids_survive_reopen() {
    let db = SharedDb::new();

    let before = {
        let store = db.handle_with_cache(5);
        let mut last = 0;
        for _ in 0..3 {
            last = store.next_allocation_id().await.unwrap().get();
        }
        last
    };

    // Unused cached values are lost; the counter itself never goes back
    let store = db.handle_with_cache(5);
    let after = store.next_allocation_id().await.unwrap().get();
    assert!(after > before);
}
