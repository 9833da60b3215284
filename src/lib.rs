//! bucket-loader - coordinated bulk loading from object storage buckets
//!
//! Several independent loader processes share one relational store and use it
//! to divide a catalog of bundle files between themselves. No process talks to
//! another directly; every ownership change is a conditional write against the
//! store, and work held by a process whose heartbeat lapses is handed back.
//!
//! # Architecture
//!
//! - [`registry`] - Instance registration, heartbeats, liveness
//! - [`catalog`] - Discovered bucket locations and bundle files
//! - [`allocation`] - Claiming, completing and reclaiming bundles
//! - [`ledger`] - Logical records produced by each bundle
//! - [`storage`] - SQLite and PostgreSQL implementations of the store
//! - [`loader`] - The per-process service driving the loop
//! - [`config`] - Configuration management and settings
//! - [`utils`] - Retry with backoff
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use bucket_loader::config::Config;
//! use bucket_loader::loader::{JsonBundleProcessor, LoaderService, LoaderSettings};
//! use bucket_loader::registry::InstanceIdentity;
//!
//! #[tokio::main]
//! async fn main() -> bucket_loader::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = bucket_loader::storage::open(&config).await?;
//!     let service = LoaderService::new(
//!         store,
//!         Arc::new(JsonBundleProcessor::new("/data/bucket")),
//!         LoaderSettings::from_config(&config),
//!     );
//!     let handle = service.start(&InstanceIdentity::current()).await?;
//!     handle.wait().await;
//!     Ok(())
//! }
//! ```

pub mod allocation;
pub mod catalog;
pub mod config;
pub mod error;
pub mod ledger;
pub mod loader;
pub mod models;
pub mod registry;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::allocation::{AllocationCounter, AllocationEngine};
    pub use crate::catalog::{BucketLister, BucketObject, WorkCatalog};
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, PreconditionViolation, Result};
    pub use crate::ledger::ResourceLedger;
    pub use crate::loader::{BundleProcessor, BundleWorkItem, LoaderService, LoaderSettings};
    pub use crate::models::{BundleId, BundleState, InstanceId, LocationId, ProducedRecord};
    pub use crate::registry::{InstanceIdentity, InstanceRegistry};
    pub use crate::storage::{CoordinationStore, PgStore, SharedStore, SqliteStore};
}

// Direct re-exports for convenience
pub use error::{Error, Result};
pub use models::{BundleId, BundleState, InstanceId};
