//! SQLite implementation of the coordination store
//!
//! Every process (or every simulated process in tests) opens its own
//! [`SqliteStore`] on the same database file. Each handle owns one
//! connection; cross-handle exclusion comes from SQLite's own write lock,
//! `BEGIN IMMEDIATE` transactions and conditional `UPDATE`s.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use super::schema::SQLITE_SCHEMA;
use super::CoordinationStore;
use crate::allocation::counter::{
    AllocationCounter, CounterBlock, ALLOCATION_SEQUENCE, DEFAULT_CACHE_SIZE,
};
use crate::allocation::{diagnose_ownership, liveness_cutoff, AllocationEngine};
use crate::catalog::WorkCatalog;
use crate::error::{Error, PreconditionViolation, Result};
use crate::ledger::ResourceLedger;
use crate::models::{
    AllocationId, BucketLocation, BundleId, CatalogStats, CompletionSummary, DiscoveredBundle,
    EnsuredBundle, InstanceId, LoaderInstance, LocationId, ProducedRecord, RecordOutcome,
    Registration,
};
use crate::registry::{new_instance_key, InstanceRegistry};

const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const BUNDLE_COLUMNS: &str = "resource_bundle_id, bucket_path_id, object_name, object_size, \
     file_type, allocation_id, loader_instance_id, load_started, load_completed";

fn to_sql_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn opt_ts_column(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => ts_column(row, idx).map(Some),
    }
}

fn instance_from_row(row: &Row<'_>) -> rusqlite::Result<LoaderInstance> {
    Ok(LoaderInstance {
        id: InstanceId::new(row.get(0)?),
        key: row.get(1)?,
        hostname: row.get(2)?,
        pid: row.get(3)?,
        last_heartbeat: ts_column(row, 4)?,
    })
}

fn bundle_from_row(row: &Row<'_>) -> rusqlite::Result<DiscoveredBundle> {
    Ok(DiscoveredBundle {
        id: BundleId::new(row.get(0)?),
        location_id: LocationId::new(row.get(1)?),
        object_name: row.get(2)?,
        object_size: row.get(3)?,
        file_type: row.get(4)?,
        allocation_id: row.get::<_, Option<i64>>(5)?.map(AllocationId::new),
        owner: row.get::<_, Option<i64>>(6)?.map(InstanceId::new),
        load_started: opt_ts_column(row, 7)?,
        load_completed: opt_ts_column(row, 8)?,
    })
}

fn select_bundle(conn: &Connection, bundle: BundleId) -> Result<Option<DiscoveredBundle>> {
    let query =
        format!("SELECT {BUNDLE_COLUMNS} FROM resource_bundles WHERE resource_bundle_id = ?1");
    Ok(conn
        .query_row(&query, params![bundle.get()], bundle_from_row)
        .optional()?)
}

/// Insert one logical record unless its (kind, logical id) already exists
fn insert_logical_resource(
    conn: &Connection,
    kind: &str,
    logical_id: &str,
    bundle: BundleId,
) -> Result<RecordOutcome> {
    let kind_id: Option<i64> = conn
        .query_row(
            "SELECT resource_type_id FROM resource_types WHERE resource_type = ?1",
            params![kind],
            |row| row.get(0),
        )
        .optional()?;
    let kind_id =
        kind_id.ok_or_else(|| PreconditionViolation::UnknownRecordKind(kind.to_string()))?;

    let inserted = conn.execute(
        r#"
            INSERT INTO logical_resources (resource_type_id, logical_id, resource_bundle_id)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (resource_type_id, logical_id) DO NOTHING
            "#,
        params![kind_id, logical_id, bundle.get()],
    )?;

    Ok(if inserted == 1 {
        RecordOutcome::Inserted
    } else {
        RecordOutcome::AlreadyPresent
    })
}

/// SQLite-backed coordination store
pub struct SqliteStore {
    conn: Mutex<Connection>,
    counter: Mutex<CounterBlock>,
    cache_size: i64,
}

impl SqliteStore {
    /// Open (and create if needed) the shared database file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(path, DEFAULT_BUSY_TIMEOUT, DEFAULT_CACHE_SIZE)
    }

    /// Open with an explicit busy timeout and allocation cache size
    pub fn open_with(
        path: impl AsRef<Path>,
        busy_timeout: Duration,
        cache_size: i64,
    ) -> Result<Self> {
        let path = path.as_ref();

        // Create parent directory if needed
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        // WAL lets readers proceed while one handle writes
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;

        let store = Self::from_connection(conn, cache_size);
        store.create_schema()?;

        tracing::info!(path = %path.display(), "SQLite store opened");
        Ok(store)
    }

    /// Create in-memory store (for testing)
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        let store = Self::from_connection(conn, DEFAULT_CACHE_SIZE);
        store.create_schema()?;
        Ok(store)
    }

    fn from_connection(conn: Connection, cache_size: i64) -> Self {
        Self {
            conn: Mutex::new(conn),
            counter: Mutex::new(CounterBlock::empty()),
            cache_size: cache_size.max(1),
        }
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::other("SQLite connection mutex poisoned"))
    }

    fn create_schema(&self) -> Result<()> {
        self.conn()?.execute_batch(SQLITE_SCHEMA)?;
        Ok(())
    }

    fn next_allocation_id_blocking(&self) -> Result<AllocationId> {
        let mut block = self
            .counter
            .lock()
            .map_err(|_| Error::other("allocation counter mutex poisoned"))?;

        if let Some(value) = block.take() {
            return Ok(AllocationId::new(value));
        }

        let high: i64 = self.conn()?.query_row(
            "UPDATE allocation_counter SET value = value + ?1 WHERE name = ?2 RETURNING value",
            params![self.cache_size, ALLOCATION_SEQUENCE],
            |row| row.get(0),
        )?;
        block.refill(high, self.cache_size);
        tracing::debug!(high, size = self.cache_size, "Reserved allocation id block");

        block
            .take()
            .map(AllocationId::new)
            .ok_or_else(|| Error::other("allocation counter block is empty after refill"))
    }

    /// Run a conditional single-row update and turn "no row matched" into
    /// the precondition that failed
    fn guarded_update(
        conn: &Connection,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
        bundle: BundleId,
        instance: InstanceId,
    ) -> Result<()> {
        if conn.execute(sql, params)? == 1 {
            return Ok(());
        }
        let current = select_bundle(conn, bundle)?;
        Err(diagnose_ownership(bundle, instance, current.as_ref()).into())
    }
}

#[async_trait]
impl InstanceRegistry for SqliteStore {
    async fn register(&self, hostname: &str, pid: u32) -> Result<Registration> {
        let key = new_instance_key();
        let conn = self.conn()?;
        conn.execute(
            r#"
                INSERT INTO loader_instances (loader_instance_key, hostname, pid, heartbeat_tstamp)
                VALUES (?1, ?2, ?3, ?4)
                "#,
            params![key, hostname, pid, to_sql_ts(Utc::now())],
        )?;
        let id = InstanceId::new(conn.last_insert_rowid());

        tracing::info!(instance = %id, key = %key, hostname, pid, "Loader instance registered");
        Ok(Registration { id, key })
    }

    async fn heartbeat(&self, instance: InstanceId, now: DateTime<Utc>) -> Result<()> {
        let updated = self.conn()?.execute(
            "UPDATE loader_instances SET heartbeat_tstamp = ?1 WHERE loader_instance_id = ?2",
            params![to_sql_ts(now), instance.get()],
        )?;
        if updated == 0 {
            return Err(PreconditionViolation::UnknownInstance(instance).into());
        }
        Ok(())
    }

    async fn get_instance(&self, instance: InstanceId) -> Result<Option<LoaderInstance>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT loader_instance_id, loader_instance_key, hostname, pid, heartbeat_tstamp
                 FROM loader_instances WHERE loader_instance_id = ?1",
                params![instance.get()],
                instance_from_row,
            )
            .optional()?)
    }

    async fn list_instances(&self) -> Result<Vec<LoaderInstance>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT loader_instance_id, loader_instance_key, hostname, pid, heartbeat_tstamp
             FROM loader_instances ORDER BY loader_instance_id",
        )?;
        let instances = stmt
            .query_map([], instance_from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(instances)
    }
}

#[async_trait]
impl WorkCatalog for SqliteStore {
    async fn ensure_location(&self, bucket_name: &str, path: &str) -> Result<LocationId> {
        let conn = self.conn()?;
        conn.execute(
            r#"
                INSERT INTO bucket_paths (bucket_name, bucket_path) VALUES (?1, ?2)
                ON CONFLICT (bucket_name, bucket_path) DO NOTHING
                "#,
            params![bucket_name, path],
        )?;
        let id: i64 = conn.query_row(
            "SELECT bucket_path_id FROM bucket_paths WHERE bucket_name = ?1 AND bucket_path = ?2",
            params![bucket_name, path],
            |row| row.get(0),
        )?;
        Ok(LocationId::new(id))
    }

    async fn ensure_bundle(
        &self,
        location: LocationId,
        object_name: &str,
        size: i64,
        file_type: &str,
    ) -> Result<EnsuredBundle> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            r#"
                INSERT INTO resource_bundles (bucket_path_id, object_name, object_size, file_type)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (bucket_path_id, object_name) DO NOTHING
                "#,
            params![location.get(), object_name, size, file_type],
        )?;
        let (id, stored_size): (i64, i64) = conn.query_row(
            "SELECT resource_bundle_id, object_size FROM resource_bundles
             WHERE bucket_path_id = ?1 AND object_name = ?2",
            params![location.get(), object_name],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        Ok(EnsuredBundle {
            id: BundleId::new(id),
            is_new: inserted == 1,
            size_changed: stored_size != size,
        })
    }

    async fn get_location(&self, location: LocationId) -> Result<Option<BucketLocation>> {
        Ok(self
            .conn()?
            .query_row(
                "SELECT bucket_path_id, bucket_name, bucket_path FROM bucket_paths \
                 WHERE bucket_path_id = ?1",
                params![location.get()],
                |row| {
                    Ok(BucketLocation {
                        id: LocationId::new(row.get(0)?),
                        bucket_name: row.get(1)?,
                        path: row.get(2)?,
                    })
                },
            )
            .optional()?)
    }

    async fn get_bundle(&self, bundle: BundleId) -> Result<Option<DiscoveredBundle>> {
        select_bundle(&*self.conn()?, bundle)
    }

    async fn catalog_stats(&self) -> Result<CatalogStats> {
        let conn = self.conn()?;
        let locations: i64 =
            conn.query_row("SELECT COUNT(*) FROM bucket_paths", [], |row| row.get(0))?;
        let (unclaimed, claimed, in_progress, done): (i64, i64, i64, i64) = conn.query_row(
            r#"
                SELECT
                    COALESCE(SUM(CASE WHEN allocation_id IS NULL AND load_completed IS NULL
                        THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN allocation_id IS NOT NULL AND load_started IS NULL
                        AND load_completed IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN allocation_id IS NOT NULL AND load_started IS NOT NULL
                        AND load_completed IS NULL THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN load_completed IS NOT NULL THEN 1 ELSE 0 END), 0)
                FROM resource_bundles
                "#,
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;

        Ok(CatalogStats {
            locations: locations as u64,
            unclaimed: unclaimed as u64,
            claimed: claimed as u64,
            in_progress: in_progress as u64,
            done: done as u64,
        })
    }
}

#[async_trait]
impl AllocationCounter for SqliteStore {
    async fn next_allocation_id(&self) -> Result<AllocationId> {
        self.next_allocation_id_blocking()
    }
}

#[async_trait]
impl AllocationEngine for SqliteStore {
    async fn claim_batch(&self, instance: InstanceId, max_count: usize) -> Result<Vec<BundleId>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let allocation = self.next_allocation_id_blocking()?;

        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let claimed = tx.execute(
            r#"
                UPDATE resource_bundles
                SET allocation_id = ?1, loader_instance_id = ?2
                WHERE resource_bundle_id IN (
                    SELECT resource_bundle_id FROM resource_bundles
                    WHERE allocation_id IS NULL AND load_completed IS NULL
                    ORDER BY resource_bundle_id
                    LIMIT ?3
                )
                AND allocation_id IS NULL
                "#,
            params![allocation.get(), instance.get(), max_count as i64],
        )?;

        let ids = if claimed == 0 {
            Vec::new()
        } else {
            let mut stmt = tx.prepare(
                "SELECT resource_bundle_id FROM resource_bundles
                 WHERE allocation_id = ?1 ORDER BY resource_bundle_id",
            )?;
            let ids = stmt
                .query_map(params![allocation.get()], |row| row.get::<_, i64>(0))?
                .map(|id| id.map(BundleId::new))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            ids
        };
        tx.commit()?;

        if !ids.is_empty() {
            tracing::info!(
                instance = %instance,
                allocation = %allocation,
                count = ids.len(),
                "Claimed bundle batch"
            );
        }
        Ok(ids)
    }

    async fn mark_started(&self, bundle: BundleId, instance: InstanceId) -> Result<()> {
        let conn = self.conn()?;
        Self::guarded_update(
            &conn,
            r#"
                UPDATE resource_bundles
                SET load_started = COALESCE(load_started, ?1)
                WHERE resource_bundle_id = ?2
                  AND loader_instance_id = ?3
                  AND allocation_id IS NOT NULL
                  AND load_completed IS NULL
                "#,
            params![to_sql_ts(Utc::now()), bundle.get(), instance.get()],
            bundle,
            instance,
        )?;
        tracing::debug!(bundle = %bundle, instance = %instance, "Bundle load started");
        Ok(())
    }

    async fn mark_completed(
        &self,
        bundle: BundleId,
        instance: InstanceId,
        records: &[ProducedRecord],
    ) -> Result<CompletionSummary> {
        let now = to_sql_ts(Utc::now());
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Any early return drops `tx`, which rolls everything back
        Self::guarded_update(
            &tx,
            r#"
                UPDATE resource_bundles
                SET load_started = COALESCE(load_started, ?1), load_completed = ?1
                WHERE resource_bundle_id = ?2
                  AND loader_instance_id = ?3
                  AND allocation_id IS NOT NULL
                  AND load_completed IS NULL
                "#,
            params![now, bundle.get(), instance.get()],
            bundle,
            instance,
        )?;

        let mut summary = CompletionSummary::default();
        for record in records {
            summary.record(insert_logical_resource(&tx, &record.kind, &record.logical_id, bundle)?);
        }
        tx.commit()?;

        tracing::info!(
            bundle = %bundle,
            instance = %instance,
            inserted = summary.inserted,
            already_present = summary.already_present,
            "Bundle load completed"
        );
        Ok(summary)
    }

    async fn reclaim_abandoned(
        &self,
        timeout: chrono::Duration,
        now: DateTime<Utc>,
    ) -> Result<u64> {
        let cutoff = to_sql_ts(liveness_cutoff(now, timeout));
        let reclaimed = self.conn()?.execute(
            r#"
                UPDATE resource_bundles
                SET allocation_id = NULL, loader_instance_id = NULL, load_started = NULL
                WHERE allocation_id IS NOT NULL
                  AND load_completed IS NULL
                  AND loader_instance_id IN (
                      SELECT loader_instance_id FROM loader_instances
                      WHERE heartbeat_tstamp <= ?1
                  )
                "#,
            params![cutoff],
        )?;

        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, cutoff = %cutoff, "Reclaimed abandoned bundles");
        }
        Ok(reclaimed as u64)
    }

    async fn release(&self, bundle: BundleId, instance: InstanceId) -> Result<()> {
        let conn = self.conn()?;
        Self::guarded_update(
            &conn,
            r#"
                UPDATE resource_bundles
                SET allocation_id = NULL, loader_instance_id = NULL, load_started = NULL
                WHERE resource_bundle_id = ?1
                  AND loader_instance_id = ?2
                  AND load_completed IS NULL
                "#,
            params![bundle.get(), instance.get()],
            bundle,
            instance,
        )?;
        tracing::info!(bundle = %bundle, instance = %instance, "Bundle released");
        Ok(())
    }
}

#[async_trait]
impl ResourceLedger for SqliteStore {
    async fn populate_record_kinds(&self, kinds: &[&str]) -> Result<usize> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let mut inserted = 0;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO resource_types (resource_type) VALUES (?1)
                 ON CONFLICT (resource_type) DO NOTHING",
            )?;
            for kind in kinds {
                inserted += stmt.execute(params![kind])?;
            }
        }
        tx.commit()?;

        tracing::debug!(inserted, total = kinds.len(), "Record kinds populated");
        Ok(inserted)
    }

    async fn record_if_absent(
        &self,
        kind: &str,
        logical_id: &str,
        bundle: BundleId,
    ) -> Result<RecordOutcome> {
        insert_logical_resource(&*self.conn()?, kind, logical_id, bundle)
    }

    async fn count_records(&self) -> Result<u64> {
        let count: i64 = self
            .conn()?
            .query_row("SELECT COUNT(*) FROM logical_resources", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[async_trait]
impl CoordinationStore for SqliteStore {
    async fn init_schema(&self) -> Result<()> {
        self.create_schema()
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
