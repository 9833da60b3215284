//! Work catalog of discovered bucket locations and bundle files
//!
//! Discovery is driven by a storage lister and may be repeated by several
//! instances at once. Both inserts are insert-if-absent on their natural key,
//! so concurrent discoveries of the same object converge on one row and the
//! first discovery's size and file type are kept.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{
    BucketLocation, BundleId, CatalogStats, DiscoveredBundle, EnsuredBundle, LocationId,
};

/// Column limits of the catalog tables
pub const BUCKET_NAME_MAX_LEN: usize = 64;
pub const BUCKET_PATH_MAX_LEN: usize = 256;
pub const OBJECT_NAME_MAX_LEN: usize = 64;
pub const FILE_TYPE_MAX_LEN: usize = 12;

/// One object reported by a storage listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketObject {
    pub bucket_name: String,
    pub path: String,
    pub object_name: String,
    pub size: i64,
    pub file_type: String,
}

impl BucketObject {
    /// Reason this object cannot be stored in the catalog, if any
    pub fn rejection_reason(&self) -> Option<&'static str> {
        if self.bucket_name.is_empty() || self.object_name.is_empty() {
            Some("empty bucket or object name")
        } else if self.bucket_name.len() > BUCKET_NAME_MAX_LEN {
            Some("bucket name too long")
        } else if self.path.len() > BUCKET_PATH_MAX_LEN {
            Some("path too long")
        } else if self.object_name.len() > OBJECT_NAME_MAX_LEN {
            Some("object name too long")
        } else if self.file_type.len() > FILE_TYPE_MAX_LEN {
            Some("file type too long")
        } else if self.size < 0 {
            Some("negative object size")
        } else {
            None
        }
    }
}

/// Producer of bucket listings (object storage client or equivalent)
#[async_trait]
pub trait BucketLister: Send + Sync {
    /// List every object currently visible; entries may repeat across calls
    async fn list(&self) -> anyhow::Result<Vec<BucketObject>>;
}

/// Durable catalog of locations and bundles
#[async_trait]
pub trait WorkCatalog: Send + Sync {
    /// Insert the (bucket, path) location if absent and return its id
    async fn ensure_location(&self, bucket_name: &str, path: &str) -> Result<LocationId>;

    /// Insert the bundle if absent; an existing row is never modified
    async fn ensure_bundle(
        &self,
        location: LocationId,
        object_name: &str,
        size: i64,
        file_type: &str,
    ) -> Result<EnsuredBundle>;

    async fn get_location(&self, location: LocationId) -> Result<Option<BucketLocation>>;

    async fn get_bundle(&self, bundle: BundleId) -> Result<Option<DiscoveredBundle>>;

    /// Count locations and bundles per lifecycle state
    async fn catalog_stats(&self) -> Result<CatalogStats>;
}

/// Summary of one discovery pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    /// Objects reported by the lister
    pub seen: usize,

    /// Bundles created by this pass
    pub new_bundles: usize,

    /// Already-known bundles whose reported size differs from the stored one
    pub size_changes: usize,

    /// Objects that could not be cataloged
    pub rejected: usize,
}

/// Feed listed objects into the catalog
pub async fn discover<C>(
    catalog: &C,
    objects: impl IntoIterator<Item = BucketObject>,
) -> Result<ScanSummary>
where
    C: WorkCatalog + ?Sized,
{
    let mut summary = ScanSummary::default();
    let mut locations: HashMap<(String, String), LocationId> = HashMap::new();

    for object in objects {
        summary.seen += 1;

        if let Some(reason) = object.rejection_reason() {
            tracing::warn!(
                bucket = %object.bucket_name,
                path = %object.path,
                object = %object.object_name,
                reason,
                "Skipping object"
            );
            summary.rejected += 1;
            continue;
        }

        let key = (object.bucket_name.clone(), object.path.clone());
        let location = match locations.get(&key) {
            Some(id) => *id,
            None => {
                let id = catalog.ensure_location(&key.0, &key.1).await?;
                locations.insert(key, id);
                id
            }
        };

        let ensured = catalog
            .ensure_bundle(location, &object.object_name, object.size, &object.file_type)
            .await?;

        if ensured.is_new {
            summary.new_bundles += 1;
            tracing::debug!(
                bundle = %ensured.id,
                object = %object.object_name,
                "Discovered bundle"
            );
        } else if ensured.size_changed {
            summary.size_changes += 1;
            tracing::warn!(
                bundle = %ensured.id,
                object = %object.object_name,
                reported_size = object.size,
                "Known bundle reported with a different size"
            );
        }
    }

    tracing::info!(
        seen = summary.seen,
        new_bundles = summary.new_bundles,
        size_changes = summary.size_changes,
        rejected = summary.rejected,
        "Discovery pass finished"
    );

    Ok(summary)
}
