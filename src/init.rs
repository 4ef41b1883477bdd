//! Initialization helpers for the application startup.

use crate::config::{Config, StoreBackend};
use crate::model::ProviderStatus;
use crate::store::{MemoryStore, SqliteStore, SuppressionStore};
use anyhow::{Context, Result};
use std::sync::Arc;
use tracing::info;

/// Sets up the tracing subscriber. `RUST_LOG` overrides `logging.level`.
pub fn setup_logging(config: &Config) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        let mut filter = config.logging.level.clone();

        // Keep HTTP client internals quiet unless asked for.
        for noisy in ["hyper", "reqwest"] {
            if !filter.contains(noisy) {
                filter.push_str(&format!(",{}=warn", noisy));
            }
        }

        tracing_subscriber::EnvFilter::new(filter)
    });

    let builder = tracing_subscriber::fmt().with_env_filter(env_filter);
    if config.logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Opens the configured store and bootstraps its schema.
pub fn init_store(config: &Config) -> Result<Arc<dyn SuppressionStore>> {
    match config.store.backend {
        StoreBackend::Sqlite => {
            info!("Opening SQLite store at {}", config.store.sqlite_path);
            let store = SqliteStore::open(&config.store.sqlite_path)
                .with_context(|| format!("Failed to open {}", config.store.sqlite_path))?;
            Ok(Arc::new(store))
        }
        StoreBackend::Memory => {
            info!("Using in-memory store; suppression data will not survive a restart.");
            Ok(Arc::new(MemoryStore::new()))
        }
    }
}

/// Upserts the configured providers. Runtime bookkeeping of providers that
/// already exist (counters, sync token, schedule) is kept; configuration
/// fields are taken from the file.
pub async fn seed_providers(config: &Config, store: &dyn SuppressionStore) -> Result<usize> {
    let providers = config.get_providers_sorted();
    let count = providers.len();

    for mut provider in providers {
        if let Some(existing) = store
            .get_provider(&provider.id)
            .await
            .with_context(|| format!("Failed to read provider '{}'", provider.id))?
        {
            provider.last_sync_at = existing.last_sync_at;
            provider.next_sync_at = existing.next_sync_at;
            provider.success_count = existing.success_count;
            provider.error_count = existing.error_count;
            provider.last_error = existing.last_error;
            provider.sync_token = existing.sync_token;
            if provider.enabled && existing.status == ProviderStatus::Error {
                provider.status = existing.status;
            }
        }
        store
            .upsert_provider(&provider)
            .await
            .with_context(|| format!("Failed to store provider '{}'", provider.id))?;
    }

    info!("Seeded {} configured provider(s)", count);
    Ok(count)
}
