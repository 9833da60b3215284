use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};

use bucket_loader::config::Config;
use bucket_loader::ledger::FHIR_R4_RESOURCE_TYPES;
use bucket_loader::loader::{
    scan_once, JsonBundleProcessor, LoaderService, LoaderSettings, LocalDirLister,
};
use bucket_loader::registry::InstanceIdentity;
use bucket_loader::storage;

/// One discovery pass over a local directory
pub async fn scan(config: Config, bucket: String, root: PathBuf) -> Result<()> {
    let store = storage::open(&config)
        .await
        .context("Failed to open coordination store")?;

    let lister = LocalDirLister::new(&bucket, &root);
    let summary = scan_once(store.as_ref(), &lister).await?;

    println!("Scanned {} ({})", bucket, root.display());
    println!("  Objects seen: {}", summary.seen);
    println!("  New bundles: {}", summary.new_bundles);
    println!("  Size changes: {}", summary.size_changes);
    println!("  Rejected: {}", summary.rejected);
    Ok(())
}

/// Run the loader service against a local directory until Ctrl-C
pub async fn run(config: Config, bucket: String, root: PathBuf) -> Result<()> {
    let store = storage::open(&config)
        .await
        .context("Failed to open coordination store")?;
    store.populate_record_kinds(FHIR_R4_RESOURCE_TYPES).await?;

    let service = LoaderService::new(
        Arc::clone(&store),
        Arc::new(JsonBundleProcessor::new(&root)),
        LoaderSettings::from_config(&config),
    )
    .with_lister(Arc::new(LocalDirLister::new(&bucket, &root)));

    let identity = InstanceIdentity::current();
    let handle = service.start(&identity).await?;
    println!(
        "Loader instance {} running on {} (pid {}); press Ctrl-C to stop",
        handle.instance_id(),
        identity.hostname,
        identity.pid
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!(instance = %handle.instance_id(), "Shutdown requested");
    handle.shutdown().await;

    let stats = store.catalog_stats().await?;
    println!("{}", stats.display());
    Ok(())
}
