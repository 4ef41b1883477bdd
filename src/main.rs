use anyhow::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;

use no_call::config::Config;
use no_call::init::{init_store, seed_providers, setup_logging};
use no_call::sync::{HttpFetcher, SyncScheduler};
use no_call::SuppressionService;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load Config
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or("no-call.toml".to_string());
    let config_found = std::path::Path::new(&config_path).exists();
    let config = if config_found {
        Config::load(&config_path).await?
    } else {
        Config::default()
    };

    // 2. Setup Logging
    setup_logging(&config);
    info!("Starting no-call...");
    if !config_found {
        info!("Config file {} not found, using defaults.", config_path);
    }

    // 3. Validate. A missing fail policy stops startup here.
    config.validate()?;

    // 4. Init Store & Seed Providers
    let store = init_store(&config)?;
    seed_providers(&config, store.as_ref()).await?;

    // 5. Build Service
    let fetcher = Arc::new(HttpFetcher::new()?);
    let service = SuppressionService::from_config(&config, store, fetcher).await?;

    let shutdown = CancellationToken::new();

    // 6. Stats Logger
    if let Some(stats) = service.stats() {
        stats.spawn_logger(shutdown.clone());
    }

    // 7. Sync Scheduler
    let scheduler = if config.sync.enable {
        let scheduler = SyncScheduler::new(
            service.worker().clone(),
            Duration::from_secs(config.sync.tick_interval_sec),
            config.sync.concurrent_syncs,
        );
        Some(scheduler.spawn(shutdown.child_token()))
    } else {
        info!("Provider sync disabled.");
        None
    };

    // 8. Graceful Shutdown
    signal::ctrl_c().await?;
    info!("Shutdown signal received.");
    shutdown.cancel();
    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    if let Some(stats) = service.stats() {
        stats.dump_stats();
    }

    Ok(())
}
