//! Shared coordination store
//!
//! The store is the only channel between loader instances. Two backends are
//! provided:
//!
//! - [`SqliteStore`]: a single database file shared by the processes of one
//!   host (and by the tests)
//! - [`PgStore`]: a PostgreSQL database shared by a fleet of hosts

pub mod postgres;
pub mod schema;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

use crate::allocation::{AllocationCounter, AllocationEngine};
use crate::catalog::WorkCatalog;
use crate::config::{Backend, Config};
use crate::error::Result;
use crate::ledger::ResourceLedger;
use crate::registry::InstanceRegistry;

pub use postgres::PgStore;
pub use sqlite::SqliteStore;

/// Everything a loader instance needs from the shared store
#[async_trait]
pub trait CoordinationStore:
    InstanceRegistry + WorkCatalog + AllocationEngine + ResourceLedger + AllocationCounter
{
    /// Create the coordination tables if they do not exist
    async fn init_schema(&self) -> Result<()>;

    /// Short backend name for logs
    fn backend_name(&self) -> &'static str;
}

/// Store handle shared between the tasks of one process
pub type SharedStore = Arc<dyn CoordinationStore>;

/// Open the configured backend and make sure its schema exists
pub async fn open(config: &Config) -> Result<SharedStore> {
    let store: SharedStore = match config.database.backend {
        Backend::Sqlite => Arc::new(SqliteStore::open_with(
            &config.database.sqlite_path,
            config.busy_timeout(),
            config.loader.allocation_cache_size,
        )?),
        Backend::Postgres => Arc::new(
            PgStore::connect(&config.database.postgres_url, config.database.pool_size).await?,
        ),
    };

    store.init_schema().await?;
    tracing::info!(backend = store.backend_name(), "Coordination store ready");
    Ok(store)
}
