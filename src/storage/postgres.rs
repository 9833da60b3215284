//! PostgreSQL implementation of the coordination store
//!
//! Claims use `FOR UPDATE SKIP LOCKED` so concurrent claimers pick disjoint
//! rows instead of queueing behind each other. Allocation ids come from the
//! `job_allocation_seq` sequence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{
    Config as PgPoolConfig, ManagerConfig, Pool, PoolConfig, RecyclingMethod, Runtime,
};
use tokio_postgres::{GenericClient, NoTls, Row};

use super::schema::POSTGRES_SCHEMA;
use super::CoordinationStore;
use crate::allocation::counter::{AllocationCounter, ALLOCATION_SEQUENCE};
use crate::allocation::{diagnose_ownership, liveness_cutoff, AllocationEngine};
use crate::catalog::WorkCatalog;
use crate::error::{PreconditionViolation, Result};
use crate::ledger::ResourceLedger;
use crate::models::{
    AllocationId, BucketLocation, BundleId, CatalogStats, CompletionSummary, DiscoveredBundle,
    EnsuredBundle, InstanceId, LoaderInstance, LocationId, ProducedRecord, RecordOutcome,
    Registration,
};
use crate::registry::{new_instance_key, InstanceRegistry};

const BUNDLE_COLUMNS: &str = "resource_bundle_id, bucket_path_id, object_name, object_size, \
     file_type, allocation_id, loader_instance_id, load_started, load_completed";

fn instance_from_row(row: &Row) -> LoaderInstance {
    LoaderInstance {
        id: InstanceId::new(row.get(0)),
        key: row.get(1),
        hostname: row.get(2),
        pid: row.get(3),
        last_heartbeat: row.get(4),
    }
}

fn bundle_from_row(row: &Row) -> DiscoveredBundle {
    DiscoveredBundle {
        id: BundleId::new(row.get(0)),
        location_id: LocationId::new(row.get(1)),
        object_name: row.get(2),
        object_size: row.get(3),
        file_type: row.get(4),
        allocation_id: row.get::<_, Option<i64>>(5).map(AllocationId::new),
        owner: row.get::<_, Option<i64>>(6).map(InstanceId::new),
        load_started: row.get(7),
        load_completed: row.get(8),
    }
}

async fn select_bundle<C: GenericClient + Sync>(
    client: &C,
    bundle: BundleId,
) -> Result<Option<DiscoveredBundle>> {
    let query =
        format!("SELECT {BUNDLE_COLUMNS} FROM resource_bundles WHERE resource_bundle_id = $1");
    let row = client.query_opt(query.as_str(), &[&bundle.get()]).await?;
    Ok(row.as_ref().map(bundle_from_row))
}

/// Turn a conditional update that matched `updated` rows into a result
async fn check_guarded<C: GenericClient + Sync>(
    client: &C,
    updated: u64,
    bundle: BundleId,
    instance: InstanceId,
) -> Result<()> {
    if updated == 1 {
        return Ok(());
    }
    let current = select_bundle(client, bundle).await?;
    Err(diagnose_ownership(bundle, instance, current.as_ref()).into())
}

async fn insert_logical_resource<C: GenericClient + Sync>(
    client: &C,
    kind: &str,
    logical_id: &str,
    bundle: BundleId,
) -> Result<RecordOutcome> {
    let kind_id: i32 = client
        .query_opt(
            "SELECT resource_type_id FROM resource_types WHERE resource_type = $1",
            &[&kind],
        )
        .await?
        .map(|row| row.get(0))
        .ok_or_else(|| PreconditionViolation::UnknownRecordKind(kind.to_string()))?;

    let inserted = client
        .execute(
            r#"
            INSERT INTO logical_resources (resource_type_id, logical_id, resource_bundle_id)
            VALUES ($1, $2, $3)
            ON CONFLICT ON CONSTRAINT unq_logical_resources DO NOTHING
            "#,
            &[&kind_id, &logical_id, &bundle.get()],
        )
        .await?;

    Ok(if inserted == 1 {
        RecordOutcome::Inserted
    } else {
        RecordOutcome::AlreadyPresent
    })
}

/// PostgreSQL-backed coordination store
pub struct PgStore {
    pool: Pool,
}

impl PgStore {
    /// Build a connection pool and verify the database is reachable
    pub async fn connect(url: &str, pool_size: usize) -> Result<Self> {
        let mut cfg = PgPoolConfig::new();
        cfg.url = Some(url.to_string());
        cfg.manager = Some(ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        });
        cfg.pool = Some(PoolConfig::new(pool_size.max(1)));

        let pool = cfg.create_pool(Some(Runtime::Tokio1), NoTls)?;

        // Test connection
        let client = pool.get().await?;
        client.simple_query("SELECT 1").await?;

        tracing::info!(pool_size, "PostgreSQL store connected");
        Ok(Self { pool })
    }
}

#[async_trait]
impl InstanceRegistry for PgStore {
    async fn register(&self, hostname: &str, pid: u32) -> Result<Registration> {
        let key = new_instance_key();
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                INSERT INTO loader_instances (loader_instance_key, hostname, pid, heartbeat_tstamp)
                VALUES ($1, $2, $3, $4)
                RETURNING loader_instance_id
                "#,
                &[&key, &hostname, &i64::from(pid), &Utc::now()],
            )
            .await?;
        let id = InstanceId::new(row.get(0));

        tracing::info!(instance = %id, key = %key, hostname, pid, "Loader instance registered");
        Ok(Registration { id, key })
    }

    async fn heartbeat(&self, instance: InstanceId, now: DateTime<Utc>) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                "UPDATE loader_instances SET heartbeat_tstamp = $1 WHERE loader_instance_id = $2",
                &[&now, &instance.get()],
            )
            .await?;
        if updated == 0 {
            return Err(PreconditionViolation::UnknownInstance(instance).into());
        }
        Ok(())
    }

    async fn get_instance(&self, instance: InstanceId) -> Result<Option<LoaderInstance>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT loader_instance_id, loader_instance_key, hostname, pid, heartbeat_tstamp
                 FROM loader_instances WHERE loader_instance_id = $1",
                &[&instance.get()],
            )
            .await?;
        Ok(row.as_ref().map(instance_from_row))
    }

    async fn list_instances(&self) -> Result<Vec<LoaderInstance>> {
        let client = self.pool.get().await?;
        let rows = client
            .query(
                "SELECT loader_instance_id, loader_instance_key, hostname, pid, heartbeat_tstamp
                 FROM loader_instances ORDER BY loader_instance_id",
                &[],
            )
            .await?;
        Ok(rows.iter().map(instance_from_row).collect())
    }
}

#[async_trait]
impl WorkCatalog for PgStore {
    async fn ensure_location(&self, bucket_name: &str, path: &str) -> Result<LocationId> {
        let client = self.pool.get().await?;
        let inserted = client
            .query_opt(
                r#"
                INSERT INTO bucket_paths (bucket_name, bucket_path) VALUES ($1, $2)
                ON CONFLICT ON CONSTRAINT unq_bucket_paths_nmpth DO NOTHING
                RETURNING bucket_path_id
                "#,
                &[&bucket_name, &path],
            )
            .await?;

        let id: i64 = match inserted {
            Some(row) => row.get(0),
            None => client
                .query_one(
                    "SELECT bucket_path_id FROM bucket_paths \
                     WHERE bucket_name = $1 AND bucket_path = $2",
                    &[&bucket_name, &path],
                )
                .await?
                .get(0),
        };
        Ok(LocationId::new(id))
    }

    async fn ensure_bundle(
        &self,
        location: LocationId,
        object_name: &str,
        size: i64,
        file_type: &str,
    ) -> Result<EnsuredBundle> {
        let client = self.pool.get().await?;
        let inserted = client
            .query_opt(
                r#"
                INSERT INTO resource_bundles (bucket_path_id, object_name, object_size, file_type)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT ON CONSTRAINT unq_resource_bundle_bktnm DO NOTHING
                RETURNING resource_bundle_id
                "#,
                &[&location.get(), &object_name, &size, &file_type],
            )
            .await?;

        if let Some(row) = inserted {
            return Ok(EnsuredBundle {
                id: BundleId::new(row.get(0)),
                is_new: true,
                size_changed: false,
            });
        }

        let row = client
            .query_one(
                "SELECT resource_bundle_id, object_size FROM resource_bundles
                 WHERE bucket_path_id = $1 AND object_name = $2",
                &[&location.get(), &object_name],
            )
            .await?;
        let stored_size: i64 = row.get(1);

        Ok(EnsuredBundle {
            id: BundleId::new(row.get(0)),
            is_new: false,
            size_changed: stored_size != size,
        })
    }

    async fn get_location(&self, location: LocationId) -> Result<Option<BucketLocation>> {
        let client = self.pool.get().await?;
        let row = client
            .query_opt(
                "SELECT bucket_path_id, bucket_name, bucket_path FROM bucket_paths \
                 WHERE bucket_path_id = $1",
                &[&location.get()],
            )
            .await?;
        Ok(row.map(|row| BucketLocation {
            id: LocationId::new(row.get(0)),
            bucket_name: row.get(1),
            path: row.get(2),
        }))
    }

    async fn get_bundle(&self, bundle: BundleId) -> Result<Option<DiscoveredBundle>> {
        let client = self.pool.get().await?;
        select_bundle(&**client, bundle).await
    }

    async fn catalog_stats(&self) -> Result<CatalogStats> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(
                r#"
                SELECT
                    (SELECT COUNT(*) FROM bucket_paths),
                    COUNT(*) FILTER (WHERE allocation_id IS NULL AND load_completed IS NULL),
                    COUNT(*) FILTER (WHERE allocation_id IS NOT NULL AND load_started IS NULL
                        AND load_completed IS NULL),
                    COUNT(*) FILTER (WHERE allocation_id IS NOT NULL AND load_started IS NOT NULL
                        AND load_completed IS NULL),
                    COUNT(*) FILTER (WHERE load_completed IS NOT NULL)
                FROM resource_bundles
                "#,
                &[],
            )
            .await?;

        Ok(CatalogStats {
            locations: row.get::<_, i64>(0) as u64,
            unclaimed: row.get::<_, i64>(1) as u64,
            claimed: row.get::<_, i64>(2) as u64,
            in_progress: row.get::<_, i64>(3) as u64,
            done: row.get::<_, i64>(4) as u64,
        })
    }
}

#[async_trait]
impl AllocationCounter for PgStore {
    async fn next_allocation_id(&self) -> Result<AllocationId> {
        let client = self.pool.get().await?;
        let row = client
            .query_one(format!("SELECT nextval('{ALLOCATION_SEQUENCE}')").as_str(), &[])
            .await?;
        Ok(AllocationId::new(row.get(0)))
    }
}

#[async_trait]
impl AllocationEngine for PgStore {
    async fn claim_batch(&self, instance: InstanceId, max_count: usize) -> Result<Vec<BundleId>> {
        if max_count == 0 {
            return Ok(Vec::new());
        }
        let allocation = self.next_allocation_id().await?;

        let client = self.pool.get().await?;
        let rows = client
            .query(
                r#"
                UPDATE resource_bundles
                SET allocation_id = $1, loader_instance_id = $2
                WHERE resource_bundle_id IN (
                    SELECT resource_bundle_id FROM resource_bundles
                    WHERE allocation_id IS NULL AND load_completed IS NULL
                    ORDER BY resource_bundle_id
                    LIMIT $3
                    FOR UPDATE SKIP LOCKED
                )
                AND allocation_id IS NULL
                RETURNING resource_bundle_id
                "#,
                &[&allocation.get(), &instance.get(), &(max_count as i64)],
            )
            .await?;

        let mut ids: Vec<BundleId> = rows.iter().map(|row| BundleId::new(row.get(0))).collect();
        ids.sort();

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
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE resource_bundles
                SET load_started = COALESCE(load_started, $1)
                WHERE resource_bundle_id = $2
                  AND loader_instance_id = $3
                  AND allocation_id IS NOT NULL
                  AND load_completed IS NULL
                "#,
                &[&Utc::now(), &bundle.get(), &instance.get()],
            )
            .await?;
        check_guarded(&**client, updated, bundle, instance).await?;

        tracing::debug!(bundle = %bundle, instance = %instance, "Bundle load started");
        Ok(())
    }

    async fn mark_completed(
        &self,
        bundle: BundleId,
        instance: InstanceId,
        records: &[ProducedRecord],
    ) -> Result<CompletionSummary> {
        let now = Utc::now();
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;

        // Dropping `tx` on an early return rolls everything back
        let updated = tx
            .execute(
                r#"
                UPDATE resource_bundles
                SET load_started = COALESCE(load_started, $1), load_completed = $1
                WHERE resource_bundle_id = $2
                  AND loader_instance_id = $3
                  AND allocation_id IS NOT NULL
                  AND load_completed IS NULL
                "#,
                &[&now, &bundle.get(), &instance.get()],
            )
            .await?;
        check_guarded(&*tx, updated, bundle, instance).await?;

        let mut summary = CompletionSummary::default();
        for record in records {
            let outcome =
                insert_logical_resource(&*tx, &record.kind, &record.logical_id, bundle).await?;
            summary.record(outcome);
        }
        tx.commit().await?;

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
        let cutoff = liveness_cutoff(now, timeout);
        let client = self.pool.get().await?;
        let reclaimed = client
            .execute(
                r#"
                UPDATE resource_bundles
                SET allocation_id = NULL, loader_instance_id = NULL, load_started = NULL
                WHERE allocation_id IS NOT NULL
                  AND load_completed IS NULL
                  AND loader_instance_id IN (
                      SELECT loader_instance_id FROM loader_instances
                      WHERE heartbeat_tstamp <= $1
                  )
                "#,
                &[&cutoff],
            )
            .await?;

        if reclaimed > 0 {
            tracing::warn!(count = reclaimed, cutoff = %cutoff, "Reclaimed abandoned bundles");
        }
        Ok(reclaimed)
    }

    async fn release(&self, bundle: BundleId, instance: InstanceId) -> Result<()> {
        let client = self.pool.get().await?;
        let updated = client
            .execute(
                r#"
                UPDATE resource_bundles
                SET allocation_id = NULL, loader_instance_id = NULL, load_started = NULL
                WHERE resource_bundle_id = $1
                  AND loader_instance_id = $2
                  AND load_completed IS NULL
                "#,
                &[&bundle.get(), &instance.get()],
            )
            .await?;
        check_guarded(&**client, updated, bundle, instance).await?;

        tracing::info!(bundle = %bundle, instance = %instance, "Bundle released");
        Ok(())
    }
}

#[async_trait]
impl ResourceLedger for PgStore {
    async fn populate_record_kinds(&self, kinds: &[&str]) -> Result<usize> {
        let mut client = self.pool.get().await?;
        let tx = client.transaction().await?;
        let stmt = tx
            .prepare(
                "INSERT INTO resource_types (resource_type) VALUES ($1)
                 ON CONFLICT ON CONSTRAINT unq_resource_types_rt DO NOTHING",
            )
            .await?;

        let mut inserted = 0;
        for kind in kinds {
            inserted += tx.execute(&stmt, &[kind]).await? as usize;
        }
        tx.commit().await?;

        tracing::debug!(inserted, total = kinds.len(), "Record kinds populated");
        Ok(inserted)
    }

    async fn record_if_absent(
        &self,
        kind: &str,
        logical_id: &str,
        bundle: BundleId,
    ) -> Result<RecordOutcome> {
        let client = self.pool.get().await?;
        insert_logical_resource(&**client, kind, logical_id, bundle).await
    }

    async fn count_records(&self) -> Result<u64> {
        let client = self.pool.get().await?;
        let row = client
            .query_one("SELECT COUNT(*) FROM logical_resources", &[])
            .await?;
        Ok(row.get::<_, i64>(0) as u64)
    }
}

#[async_trait]
impl CoordinationStore for PgStore {
    async fn init_schema(&self) -> Result<()> {
        let client = self.pool.get().await?;
        client.batch_execute(POSTGRES_SCHEMA).await?;

        tracing::info!("Coordination schema initialized");
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "postgres"
    }
}
