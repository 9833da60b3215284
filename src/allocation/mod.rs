//! Allocation engine
//!
//! Bundles move through a small state machine encoded in four nullable
//! columns `(allocation_id, owner, load_started, load_completed)`:
//!
//! ```text
//!   UNCLAIMED ──claim_batch──▶ CLAIMED ──mark_started──▶ IN_PROGRESS ──mark_completed──▶ DONE
//!       ▲                         │                          │
//!       └────── reclaim_abandoned / release ─────────────────┘
//! ```
//!
//! Every transition is one conditional write whose predicate re-checks the
//! expected prior state, so two instances can never both own a bundle. DONE
//! is terminal.

pub mod counter;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::{PreconditionViolation, Result};
use crate::models::{BundleId, CompletionSummary, DiscoveredBundle, InstanceId, ProducedRecord};

pub use counter::{AllocationCounter, CounterBlock};

#[async_trait]
pub trait AllocationEngine: Send + Sync {
    /// Claim up to `max_count` unclaimed bundles, oldest first
    ///
    /// All claimed bundles share one fresh allocation id. Returns an empty
    /// list when no work is available.
    async fn claim_batch(&self, instance: InstanceId, max_count: usize) -> Result<Vec<BundleId>>;

    /// Record that the owner started loading the bundle; no-op if already started
    async fn mark_started(&self, bundle: BundleId, instance: InstanceId) -> Result<()>;

    /// Record the produced logical records and the completion time atomically
    async fn mark_completed(
        &self,
        bundle: BundleId,
        instance: InstanceId,
        records: &[ProducedRecord],
    ) -> Result<CompletionSummary>;

    /// Return every incomplete bundle owned by a non-live instance to UNCLAIMED
    async fn reclaim_abandoned(&self, timeout: Duration, now: DateTime<Utc>) -> Result<u64>;

    /// Give an owned, incomplete bundle back to the pool
    async fn release(&self, bundle: BundleId, instance: InstanceId) -> Result<()>;
}

/// Explain why a conditional ownership write matched no row
///
/// `current` is the bundle as re-read after the write failed.
pub fn diagnose_ownership(
    bundle: BundleId,
    instance: InstanceId,
    current: Option<&DiscoveredBundle>,
) -> PreconditionViolation {
    match current {
        None => PreconditionViolation::UnknownBundle(bundle),
        Some(row) if row.load_completed.is_some() => {
            PreconditionViolation::AlreadyCompleted(bundle)
        }
        Some(_) => PreconditionViolation::NotOwner { bundle, instance },
    }
}

/// Cutoff timestamp for the reclaim sweep: owners whose heartbeat is at or
/// before it are not live
pub fn liveness_cutoff(now: DateTime<Utc>, timeout: Duration) -> DateTime<Utc> {
    now - timeout
}
