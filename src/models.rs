//! Core data structures shared by the coordination components
//!
//! Row identities are wrapped in transparent newtypes so that a bundle id can
//! never be passed where an instance id is expected.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

macro_rules! row_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wrap a raw database id
            pub const fn new(id: i64) -> Self {
                Self(id)
            }

            /// Get the raw database id
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(
    /// `loader_instances.loader_instance_id`
    InstanceId
);
row_id!(
    /// `bucket_paths.bucket_path_id`
    LocationId
);
row_id!(
    /// `resource_bundles.resource_bundle_id`
    BundleId
);
row_id!(
    /// Value drawn from the allocation counter, stamped on every bundle of one claim
    AllocationId
);

// ============================================================================
// Instances
// ============================================================================

/// A loader process as recorded in the registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoaderInstance {
    pub id: InstanceId,

    /// Random token unique to one process lifetime
    pub key: String,

    pub hostname: String,

    pub pid: i64,

    pub last_heartbeat: DateTime<Utc>,
}

/// Identity handed back by a successful registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub id: InstanceId,
    pub key: String,
}

// ============================================================================
// Catalog
// ============================================================================

/// A (bucket, path) pair under which bundles were discovered
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLocation {
    pub id: LocationId,
    pub bucket_name: String,
    pub path: String,
}

/// Lifecycle of a discovered bundle, derived from its nullable columns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleState {
    Unclaimed,
    Claimed,
    InProgress,
    Done,
}

impl BundleState {
    /// Derive the state from the allocation columns of a bundle row
    pub fn from_columns(
        allocation_id: Option<AllocationId>,
        load_started: Option<DateTime<Utc>>,
        load_completed: Option<DateTime<Utc>>,
    ) -> Self {
        match (allocation_id, load_started, load_completed) {
            (_, _, Some(_)) => Self::Done,
            (None, _, None) => Self::Unclaimed,
            (Some(_), Some(_), None) => Self::InProgress,
            (Some(_), None, None) => Self::Claimed,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unclaimed => "unclaimed",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for BundleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bundle file discovered in a bucket location
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredBundle {
    pub id: BundleId,
    pub location_id: LocationId,

    /// Object name relative to the location path
    pub object_name: String,

    pub object_size: i64,

    /// Short file type tag, e.g. `json` or `ndjson`
    pub file_type: String,

    pub allocation_id: Option<AllocationId>,
    pub owner: Option<InstanceId>,
    pub load_started: Option<DateTime<Utc>>,
    pub load_completed: Option<DateTime<Utc>>,
}

impl DiscoveredBundle {
    pub fn state(&self) -> BundleState {
        BundleState::from_columns(self.allocation_id, self.load_started, self.load_completed)
    }
}

/// Outcome of an insert-if-absent bundle registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnsuredBundle {
    pub id: BundleId,

    /// Whether this call created the row
    pub is_new: bool,

    /// The stored size differs from the size reported by this discovery.
    /// The stored row is left untouched.
    pub size_changed: bool,
}

/// Bundle counts per lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogStats {
    pub locations: u64,
    pub unclaimed: u64,
    pub claimed: u64,
    pub in_progress: u64,
    pub done: u64,
}

impl CatalogStats {
    pub fn total_bundles(&self) -> u64 {
        self.unclaimed + self.claimed + self.in_progress + self.done
    }

    /// Fraction of bundles that are done (0.0 - 1.0)
    pub fn completion_rate(&self) -> f64 {
        let total = self.total_bundles();
        if total == 0 {
            return 1.0;
        }
        self.done as f64 / total as f64
    }

    /// Format as display string
    pub fn display(&self) -> String {
        format!(
            "Catalog Stats\n\
             {:-<30}\n\
             Locations: {}\n\
             Bundles: {}\n\
             - Unclaimed: {}\n\
             - Claimed: {}\n\
             - In progress: {}\n\
             - Done: {}\n\
             Completion: {:.1}%",
            "",
            self.locations,
            self.total_bundles(),
            self.unclaimed,
            self.claimed,
            self.in_progress,
            self.done,
            self.completion_rate() * 100.0
        )
    }
}

// ============================================================================
// Ledger
// ============================================================================

/// A logical record produced by loading a bundle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProducedRecord {
    /// Record kind name, e.g. `Patient`
    pub kind: String,
    pub logical_id: String,
}

impl ProducedRecord {
    pub fn new(kind: impl Into<String>, logical_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            logical_id: logical_id.into(),
        }
    }
}

/// Result of registering one logical record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Inserted,
    AlreadyPresent,
}

/// Ledger writes performed while completing one bundle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompletionSummary {
    pub inserted: usize,
    pub already_present: usize,
}

impl CompletionSummary {
    pub fn record(&mut self, outcome: RecordOutcome) {
        match outcome {
            RecordOutcome::Inserted => self.inserted += 1,
            RecordOutcome::AlreadyPresent => self.already_present += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.inserted + self.already_present
    }
}
