//! Common test utilities

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bucket_loader::models::{BundleId, LocationId};
use bucket_loader::prelude::*;
use tempfile::TempDir;

/// Record kinds used by the fixtures
pub const TEST_KINDS: &[&str] = &["Patient", "Observation", "Encounter"];

/// A database file shared by several store handles, one per simulated process
pub struct SharedDb {
    _dir: TempDir,
    path: PathBuf,
}

impl SharedDb {
    pub fn new() -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("coordination.db");
        Self { _dir: dir, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a new handle, as a separate loader process would
    pub fn handle(&self) -> Arc<SqliteStore> {
        Arc::new(open_store(&self.path, 1000))
    }

    /// Open a handle with a small allocation cache
    pub fn handle_with_cache(&self, cache_size: i64) -> Arc<SqliteStore> {
        Arc::new(open_store(&self.path, cache_size))
    }
}

fn open_store(path: &Path, cache_size: i64) -> SqliteStore {
    SqliteStore::open_with(path, Duration::from_secs(10), cache_size).expect("open sqlite store")
}

/// Populate record kinds and catalog `count` bundles under one location
pub async fn seed_bundles(store: &SqliteStore, count: usize) -> (LocationId, Vec<BundleId>) {
    store.populate_record_kinds(TEST_KINDS).await.unwrap();
    let location = store.ensure_location("test-bucket", "/batch/").await.unwrap();

    let mut ids = Vec::with_capacity(count);
    for i in 0..count {
        let ensured = store
            .ensure_bundle(location, &format!("bundle-{i:04}.ndjson"), 128, "ndjson")
            .await
            .unwrap();
        ids.push(ensured.id);
    }
    (location, ids)
}
