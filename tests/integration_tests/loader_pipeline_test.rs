//! End-to-end loading from a local directory
//!
//! Loader services share one database file and drain a catalog built by
//! scanning a temporary bucket directory.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tempfile::TempDir;

use bucket_loader::loader::{
    release_held, scan_once, JsonBundleProcessor, LoaderSettings, LocalDirLister,
};
use bucket_loader::models::BundleState;
use bucket_loader::prelude::*;
use bucket_loader::utils::retry::RetryConfig;

use super::fixtures::{write_bucket, SAMPLE_DISTINCT_RECORDS};
use crate::common::{SharedDb, TEST_KINDS};

fn fast_settings() -> LoaderSettings {
    LoaderSettings {
        heartbeat_interval: Duration::from_millis(50),
        heartbeat_timeout: chrono::Duration::seconds(2),
        claim_batch_size: 3,
        poll_interval: Duration::from_millis(20),
        reclaim_interval: Duration::from_millis(100),
        scan_interval: None,
        retry: RetryConfig::with_delays(3, 10, 50),
    }
}

async fn wait_until_done(store: &SqliteStore, expected: u64) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let stats = store.catalog_stats().await.unwrap();
        if stats.done == expected {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for completion: {stats:?}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn test_scan_local_bucket() {
    let bucket = TempDir::new().unwrap();
    let files = write_bucket(bucket.path(), 6);
    let db = SharedDb::new();
    let store = db.handle();

    let lister = LocalDirLister::new("local", bucket.path());
    let first = scan_once(store.as_ref(), &lister).await.unwrap();
    assert_eq!(first.seen, files);
    assert_eq!(first.new_bundles, files);

    // A second instance scanning the same bucket adds nothing
    let other = db.handle();
    let second = scan_once(other.as_ref(), &lister).await.unwrap();
    assert_eq!(second.new_bundles, 0);

    let stats = store.catalog_stats().await.unwrap();
    assert_eq!(stats.locations, 2);
    assert_eq!(stats.unclaimed, files as u64);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_two_services_drain_bucket() {
    let bucket = TempDir::new().unwrap();
    let files = write_bucket(bucket.path(), 12);
    let db = SharedDb::new();
    let observer = db.handle();
    observer.populate_record_kinds(TEST_KINDS).await.unwrap();
    scan_once(observer.as_ref(), &LocalDirLister::new("local", bucket.path()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for pid in [11, 12] {
        let store: SharedStore = db.handle();
        let service = LoaderService::new(
            store,
            Arc::new(JsonBundleProcessor::new(bucket.path())),
            fast_settings(),
        );
        handles.push(
            service
                .start(&InstanceIdentity::new("pipeline-host", pid))
                .await
                .unwrap(),
        );
    }

    wait_until_done(&observer, files as u64).await;
    for handle in handles {
        handle.shutdown().await;
    }

    // Overlapping files produce each logical record once
    assert_eq!(observer.count_records().await.unwrap(), SAMPLE_DISTINCT_RECORDS);
    assert_eq!(observer.list_instances().await.unwrap().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_service_recovers_work_of_crashed_instance() {
    let bucket = TempDir::new().unwrap();
    let files = write_bucket(bucket.path(), 4);
    let db = SharedDb::new();
    let crashed = db.handle();
    crashed.populate_record_kinds(TEST_KINDS).await.unwrap();
    scan_once(crashed.as_ref(), &LocalDirLister::new("local", bucket.path()))
        .await
        .unwrap();

    // The crashed instance grabbed everything an hour ago and died mid-load
    let ghost = crashed.register("ghost", 99).await.unwrap().id;
    crashed
        .heartbeat(ghost, Utc::now() - chrono::Duration::hours(1))
        .await
        .unwrap();
    let grabbed = crashed.claim_batch(ghost, 100).await.unwrap();
    assert_eq!(grabbed.len(), files);
    crashed.mark_started(grabbed[0], ghost).await.unwrap();

    let survivor = LoaderService::new(
        db.handle(),
        Arc::new(JsonBundleProcessor::new(bucket.path())),
        fast_settings(),
    );
    let handle = survivor
        .start(&InstanceIdentity::new("survivor", 1))
        .await
        .unwrap();
    let survivor_id = handle.instance_id();

    wait_until_done(&crashed, files as u64).await;
    handle.shutdown().await;

    for bundle in grabbed {
        let row = crashed.get_bundle(bundle).await.unwrap().unwrap();
        assert_eq!(row.state(), BundleState::Done);
        assert_eq!(row.owner, Some(survivor_id));
    }
}

#[tokio::test]
async fn test_unreadable_bundle_is_held_then_released() {
    let bucket = TempDir::new().unwrap();
    std::fs::write(bucket.path().join("broken.json"), "{ not json").unwrap();
    let db = SharedDb::new();
    let store = db.handle();
    store.populate_record_kinds(TEST_KINDS).await.unwrap();
    scan_once(store.as_ref(), &LocalDirLister::new("local", bucket.path()))
        .await
        .unwrap();

    let me = store.register("reader", 1).await.unwrap().id;
    let report = bucket_loader::loader::process_batch(
        store.as_ref(),
        &JsonBundleProcessor::new(bucket.path()),
        me,
        5,
        &RetryConfig::none(),
    )
    .await
    .unwrap();

    assert_eq!(report.claimed, 1);
    assert_eq!(report.failed, 1);
    assert_eq!(report.held.len(), 1);

    // Held by the instance that failed it, so nobody else retries it yet
    let stats = store.catalog_stats().await.unwrap();
    assert_eq!(stats.unclaimed, 0);
    assert_eq!(stats.in_progress, 1);

    let released = release_held(store.as_ref(), me, &report.held, &RetryConfig::none()).await;
    assert_eq!(released, 1);
    assert_eq!(store.catalog_stats().await.unwrap().unclaimed, 1);
}
