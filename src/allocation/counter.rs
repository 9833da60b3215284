//! Allocation counter
//!
//! A shared, crash-safe source of allocation ids. Values are unique and
//! increase in issuance order for any single caller; gaps are allowed.
//! Backends that cannot cache server-side reserve a block of values per
//! round trip and hand them out from a [`CounterBlock`].

use async_trait::async_trait;

use crate::error::Result;
use crate::models::AllocationId;

/// Name of the shared allocation sequence
pub const ALLOCATION_SEQUENCE: &str = "job_allocation_seq";

/// Default number of values reserved per round trip
pub const DEFAULT_CACHE_SIZE: i64 = 1000;

#[async_trait]
pub trait AllocationCounter: Send + Sync {
    /// Draw the next allocation id
    async fn next_allocation_id(&self) -> Result<AllocationId>;
}

/// A locally held range of reserved counter values
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CounterBlock {
    next: i64,
    /// Inclusive upper bound of the reserved range
    last: i64,
}

impl CounterBlock {
    /// An exhausted block; the first `take` will need a refill
    pub fn empty() -> Self {
        Self::default()
    }

    /// Hand out the next reserved value, if any remain
    pub fn take(&mut self) -> Option<i64> {
        if self.next == 0 || self.next > self.last {
            return None;
        }
        let value = self.next;
        self.next += 1;
        Some(value)
    }

    /// Install the range `(high - size, high]` just reserved from the store
    pub fn refill(&mut self, high: i64, size: i64) {
        self.next = high - size + 1;
        self.last = high;
    }
}
