use anyhow::{Context, Result};
use chrono::Utc;

use bucket_loader::config::Config;
use bucket_loader::ledger::FHIR_R4_RESOURCE_TYPES;
use bucket_loader::loader::reclaim_sweep;
use bucket_loader::registry::is_live;
use bucket_loader::storage;
use bucket_loader::utils::retry::RetryConfig;

/// Create the schema and fill the record kind dictionary
pub async fn init(config: Config) -> Result<()> {
    let store = storage::open(&config)
        .await
        .context("Failed to open coordination store")?;

    let added = store.populate_record_kinds(FHIR_R4_RESOURCE_TYPES).await?;

    println!("Coordination store initialized ({})", store.backend_name());
    println!("  Record kinds added: {added} of {}", FHIR_R4_RESOURCE_TYPES.len());
    Ok(())
}

/// Run one reclaim sweep now
pub async fn reclaim(config: Config) -> Result<()> {
    let store = storage::open(&config)
        .await
        .context("Failed to open coordination store")?;

    let reclaimed = reclaim_sweep(
        store.as_ref(),
        config.heartbeat_timeout(),
        &RetryConfig::from(&config.retry),
    )
    .await?;

    println!("Reclaimed {reclaimed} abandoned bundle(s)");
    Ok(())
}

/// Print catalog progress and the registered instances
pub async fn status(config: Config) -> Result<()> {
    let store = storage::open(&config)
        .await
        .context("Failed to open coordination store")?;

    let stats = store.catalog_stats().await?;
    let records = store.count_records().await?;
    let instances = store.list_instances().await?;

    println!("{}", stats.display());
    println!("Records: {records}");
    println!();
    println!("Instances");
    println!("{:-<30}", "");

    let now = Utc::now();
    let timeout = config.heartbeat_timeout();
    for instance in instances {
        let state = if is_live(instance.last_heartbeat, now, timeout) {
            "live"
        } else {
            "dead"
        };
        println!(
            "{:>6}  {:<24} pid {:<8} {:<5} last heartbeat {}",
            instance.id,
            instance.hostname,
            instance.pid,
            state,
            instance.last_heartbeat.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}
