//! Loader service
//!
//! Wires the coordination components together for one process:
//!
//! 1. register in the instance registry
//! 2. keep the heartbeat fresh
//! 3. periodically reclaim bundles of dead instances
//! 4. optionally rescan the bucket listing into the catalog
//! 5. claim batches and load each bundle through a [`BundleProcessor`]
//!
//! All tasks stop when the shutdown channel fires. A batch that is already
//! being processed finishes first.
//!
//! A bundle that fails to load stays claimed by this instance so the next
//! claim moves on to fresh work. The work loop hands those bundles back on
//! shutdown; after a crash they are reclaimed once the heartbeat lapses.

pub mod local;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

use crate::catalog::{discover, BucketLister, ScanSummary};
use crate::config::Config;
use crate::error::{Error, PreconditionViolation, Result};
use crate::models::{
    BucketLocation, BundleId, CompletionSummary, DiscoveredBundle, InstanceId, ProducedRecord,
};
use crate::registry::InstanceIdentity;
use crate::storage::{CoordinationStore, SharedStore};
use crate::utils::retry::{with_retry, RetryConfig};

pub use local::{JsonBundleProcessor, LocalDirLister};

/// A claimed bundle together with where it lives
#[derive(Debug, Clone)]
pub struct BundleWorkItem {
    pub bundle: DiscoveredBundle,
    pub location: BucketLocation,
}

impl BundleWorkItem {
    /// Object key relative to the bucket root, e.g. `/2024/01/b1.ndjson`
    pub fn object_key(&self) -> String {
        format!("{}{}", self.location.path, self.bundle.object_name)
    }
}

/// Turns one bundle into the logical records it contains
#[async_trait]
pub trait BundleProcessor: Send + Sync {
    async fn process(&self, work: &BundleWorkItem) -> anyhow::Result<Vec<ProducedRecord>>;
}

/// Timing and batching knobs of the loader service
#[derive(Debug, Clone)]
pub struct LoaderSettings {
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: chrono::Duration,
    pub claim_batch_size: usize,
    pub poll_interval: Duration,
    pub reclaim_interval: Duration,

    /// `None` disables periodic scanning
    pub scan_interval: Option<Duration>,

    pub retry: RetryConfig,
}

impl LoaderSettings {
    pub fn from_config(config: &Config) -> Self {
        let loader = &config.loader;
        Self {
            heartbeat_interval: config.heartbeat_interval(),
            heartbeat_timeout: config.heartbeat_timeout(),
            claim_batch_size: loader.claim_batch_size,
            poll_interval: Duration::from_secs(loader.poll_interval_secs),
            reclaim_interval: Duration::from_secs(loader.reclaim_interval_secs),
            scan_interval: (loader.scan_interval_secs > 0)
                .then(|| Duration::from_secs(loader.scan_interval_secs)),
            retry: RetryConfig::from(&config.retry),
        }
    }
}

impl Default for LoaderSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// What happened to the bundles of one claimed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub claimed: usize,
    pub completed: usize,

    /// Processing or store failure; the bundle stays claimed
    pub failed: usize,

    /// Precondition violation; the bundle was left alone
    pub skipped: usize,

    pub records_inserted: usize,
    pub records_already_present: usize,

    /// Bundles that failed and are still owned by the caller
    pub held: Vec<BundleId>,
}

impl BatchReport {
    pub fn is_idle(&self) -> bool {
        self.claimed == 0
    }

    fn add_completion(&mut self, summary: CompletionSummary) {
        self.completed += 1;
        self.records_inserted += summary.inserted;
        self.records_already_present += summary.already_present;
    }
}

enum BundleFailure {
    /// Ownership or lifecycle conflict; nothing to undo
    Precondition(PreconditionViolation),
    /// Processing or store failure; the bundle is held until release
    Failed(Error),
}

impl From<Error> for BundleFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Precondition(violation) => Self::Precondition(violation),
            other => Self::Failed(other),
        }
    }
}

async fn load_bundle(
    store: &dyn CoordinationStore,
    processor: &dyn BundleProcessor,
    instance: InstanceId,
    bundle: BundleId,
    retry: &RetryConfig,
) -> std::result::Result<CompletionSummary, BundleFailure> {
    with_retry(retry, || store.mark_started(bundle, instance)).await?;

    let row = with_retry(retry, || store.get_bundle(bundle))
        .await?
        .ok_or(PreconditionViolation::UnknownBundle(bundle))
        .map_err(Error::from)?;
    let location = with_retry(retry, || store.get_location(row.location_id))
        .await?
        .ok_or_else(|| {
            Error::other(format!(
                "location {} of bundle {bundle} is missing",
                row.location_id
            ))
        })?;

    let work = BundleWorkItem { bundle: row, location };
    let records = processor.process(&work).await.map_err(Error::from)?;

    tracing::debug!(
        bundle = %bundle,
        object = %work.object_key(),
        records = records.len(),
        "Bundle processed"
    );
    Ok(with_retry(retry, || store.mark_completed(bundle, instance, &records)).await?)
}

/// Claim one batch and load every bundle in it
///
/// Errors only when the claim itself fails; per-bundle failures are counted
/// in the report.
pub async fn process_batch(
    store: &dyn CoordinationStore,
    processor: &dyn BundleProcessor,
    instance: InstanceId,
    batch_size: usize,
    retry: &RetryConfig,
) -> Result<BatchReport> {
    let claimed = with_retry(retry, || store.claim_batch(instance, batch_size)).await?;
    let mut report = BatchReport {
        claimed: claimed.len(),
        ..Default::default()
    };

    for bundle in claimed {
        match load_bundle(store, processor, instance, bundle, retry).await {
            Ok(summary) => {
                tracing::debug!(bundle = %bundle, records = summary.total(), "Bundle loaded");
                report.add_completion(summary);
            }
            Err(BundleFailure::Precondition(violation)) => {
                tracing::error!(
                    bundle = %bundle,
                    instance = %instance,
                    error = %violation,
                    "Skipping bundle"
                );
                report.skipped += 1;
            }
            Err(BundleFailure::Failed(err)) => {
                tracing::warn!(bundle = %bundle, error = %err, "Bundle load failed, holding");
                report.failed += 1;
                report.held.push(bundle);
            }
        }
    }

    if !report.is_idle() {
        tracing::info!(
            instance = %instance,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            inserted = report.records_inserted,
            "Batch finished"
        );
    }
    Ok(report)
}

/// Hand held bundles back to the pool
///
/// Best effort: a bundle that cannot be released stays claimed until the
/// owner's heartbeat lapses. Returns how many were released.
pub async fn release_held(
    store: &dyn CoordinationStore,
    instance: InstanceId,
    held: &[BundleId],
    retry: &RetryConfig,
) -> usize {
    let mut released = 0;
    for &bundle in held {
        match with_retry(retry, || store.release(bundle, instance)).await {
            Ok(()) => released += 1,
            Err(e) => tracing::error!(bundle = %bundle, error = %e, "Failed to release bundle"),
        }
    }
    if released > 0 {
        tracing::info!(instance = %instance, released, "Released failed bundles");
    }
    released
}

/// One reclaim sweep at the current time
pub async fn reclaim_sweep(
    store: &dyn CoordinationStore,
    timeout: chrono::Duration,
    retry: &RetryConfig,
) -> Result<u64> {
    with_retry(retry, || store.reclaim_abandoned(timeout, Utc::now())).await
}

/// One discovery pass over a bucket listing
pub async fn scan_once(
    store: &dyn CoordinationStore,
    lister: &dyn BucketLister,
) -> Result<ScanSummary> {
    let objects = lister.list().await?;
    discover(store, objects).await
}

/// Loader service for one process
pub struct LoaderService {
    store: SharedStore,
    processor: Arc<dyn BundleProcessor>,
    lister: Option<Arc<dyn BucketLister>>,
    settings: LoaderSettings,
}

impl LoaderService {
    pub fn new(
        store: SharedStore,
        processor: Arc<dyn BundleProcessor>,
        settings: LoaderSettings,
    ) -> Self {
        Self {
            store,
            processor,
            lister: None,
            settings,
        }
    }

    /// Rescan this listing on the configured scan interval
    pub fn with_lister(mut self, lister: Arc<dyn BucketLister>) -> Self {
        self.lister = Some(lister);
        self
    }

    /// Register this process and spawn the background tasks
    pub async fn start(&self, identity: &InstanceIdentity) -> Result<LoaderHandle> {
        let registration = with_retry(&self.settings.retry, || {
            self.store.register(&identity.hostname, identity.pid)
        })
        .await?;
        let instance = registration.id;

        let (shutdown, shutdown_rx) = watch::channel(false);
        let mut tasks = vec![
            self.spawn_heartbeat_task(instance, shutdown_rx.clone()),
            self.spawn_reclaim_task(shutdown_rx.clone()),
            self.spawn_work_loop(instance, shutdown_rx.clone()),
        ];
        if let Some(task) = self.spawn_scan_task(shutdown_rx) {
            tasks.push(task);
        }

        tracing::info!(
            instance = %instance,
            backend = self.store.backend_name(),
            batch_size = self.settings.claim_batch_size,
            "Loader service started"
        );

        Ok(LoaderHandle {
            instance,
            tasks,
            shutdown,
        })
    }

    fn spawn_heartbeat_task(
        &self,
        instance: InstanceId,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.settings.heartbeat_interval;

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match store.heartbeat(instance, Utc::now()).await {
                            Ok(()) => tracing::trace!(instance = %instance, "Heartbeat sent"),
                            Err(e) => {
                                tracing::warn!(instance = %instance, error = %e, "Heartbeat failed")
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Heartbeat task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_reclaim_task(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let period = self.settings.reclaim_interval;
        let timeout = self.settings.heartbeat_timeout;
        let retry = self.settings.retry.clone();

        tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = reclaim_sweep(store.as_ref(), timeout, &retry).await {
                            tracing::warn!(error = %e, "Reclaim sweep failed");
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Reclaim task shutting down");
                        break;
                    }
                }
            }
        })
    }

    fn spawn_scan_task(&self, mut shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let lister = Arc::clone(self.lister.as_ref()?);
        let period = self.settings.scan_interval?;
        let store = Arc::clone(&self.store);

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match scan_once(store.as_ref(), lister.as_ref()).await {
                            Ok(summary) => tracing::debug!(
                                seen = summary.seen,
                                new_bundles = summary.new_bundles,
                                "Scan pass finished"
                            ),
                            Err(e) => tracing::warn!(error = %e, "Scan pass failed"),
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        tracing::info!("Scan task shutting down");
                        break;
                    }
                }
            }
        }))
    }

    fn spawn_work_loop(
        &self,
        instance: InstanceId,
        mut shutdown_rx: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let processor = Arc::clone(&self.processor);
        let settings = self.settings.clone();

        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                let report = process_batch(
                    store.as_ref(),
                    processor.as_ref(),
                    instance,
                    settings.claim_batch_size,
                    &settings.retry,
                )
                .await
                .unwrap_or_else(|e| {
                    tracing::error!(instance = %instance, error = %e, "Claim failed");
                    BatchReport::default()
                });
                let idle = report.is_idle();
                held.extend(report.held);

                if idle {
                    tokio::select! {
                        _ = tokio::time::sleep(settings.poll_interval) => {}
                        _ = shutdown_rx.changed() => break,
                    }
                }
            }
            release_held(store.as_ref(), instance, &held, &settings.retry).await;
            tracing::info!(instance = %instance, "Work loop shutting down");
        })
    }
}

/// Handle to a running loader service
pub struct LoaderHandle {
    instance: InstanceId,
    tasks: Vec<JoinHandle<()>>,
    shutdown: watch::Sender<bool>,
}

impl LoaderHandle {
    /// Registry id of this process
    pub fn instance_id(&self) -> InstanceId {
        self.instance
    }

    /// Wait for all tasks to complete
    pub async fn wait(self) {
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!(error = %e, "Loader task panicked");
            }
        }
    }

    /// Trigger shutdown and wait
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        self.wait().await;
    }

    /// Check if every task is still running
    pub fn is_running(&self) -> bool {
        self.tasks.iter().all(|task| !task.is_finished())
    }
}
