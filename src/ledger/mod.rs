//! Resource ledger
//!
//! Records the logical records produced by each loaded bundle. The pair
//! (record kind, logical id) is globally unique, so a reload of the same
//! bundle after a crash finds its records already present instead of
//! failing.

pub mod kinds;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{BundleId, RecordOutcome};

pub use kinds::FHIR_R4_RESOURCE_TYPES;

/// Maximum stored logical id length
pub const LOGICAL_ID_MAX_LEN: usize = 255;

#[async_trait]
pub trait ResourceLedger: Send + Sync {
    /// Insert-if-absent the given record kinds; returns how many were new
    async fn populate_record_kinds(&self, kinds: &[&str]) -> Result<usize>;

    /// Register a logical record produced by `bundle`
    ///
    /// A duplicate (kind, logical id) yields `AlreadyPresent`, never an
    /// error. An unknown kind is a precondition violation.
    async fn record_if_absent(
        &self,
        kind: &str,
        logical_id: &str,
        bundle: BundleId,
    ) -> Result<RecordOutcome>;

    /// Number of logical records stored
    async fn count_records(&self) -> Result<u64>;
}
