//! The public surface of the engine: one facade wiring checks,
//! administration, provider sync, cache control and reporting together.

use crate::config::Config;
use crate::engine::{
    AddSuppression, BreakerRegistry, BreakerSettings, BreakerStats, BulkEvaluator, BulkResult,
    BulkSettings, CacheStats, CheckOptions, DecisionCache, DecisionEngine, EngineSettings,
    ProviderRegistry, RemoveSuppression, SuppressionAdmin, UpdateSuppression,
};
use crate::error::{Error, Result};
use crate::logger::DecisionLogger;
use crate::model::{Provider, ProviderStatusReport, SuppressionEntry, Verdict};
use crate::report::{ComplianceReport, ComplianceReporter, ReportCriteria};
use crate::stats::StatsCollector;
use crate::store::{EntryFilter, SuppressionStore};
use crate::sync::{ProviderFetcher, SyncOptions, SyncReport, SyncSettings, SyncWorker};
use anyhow::Context;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub struct SuppressionService {
    store: Arc<dyn SuppressionStore>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<DecisionCache>,
    engine: Arc<DecisionEngine>,
    bulk: BulkEvaluator,
    admin: SuppressionAdmin,
    worker: Arc<SyncWorker>,
    reporter: ComplianceReporter,
    stats: Option<Arc<StatsCollector>>,
    logger: Option<Arc<DecisionLogger>>,
}

impl SuppressionService {
    /// Builds every component from `config` on top of an initialised store.
    /// Providers are read from the store, so seed them first.
    pub async fn from_config(
        config: &Config,
        store: Arc<dyn SuppressionStore>,
        fetcher: Arc<dyn ProviderFetcher>,
    ) -> anyhow::Result<Self> {
        let settings = EngineSettings::from_config(config)?;
        let registry = Arc::new(
            ProviderRegistry::load(store.as_ref())
                .await
                .context("Failed to load providers")?,
        );
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings::from(&config.breaker)));
        let cache = Arc::new(DecisionCache::from_config(&config.cache));

        let stats = config
            .stats
            .enable
            .then(|| StatsCollector::new(config.stats.log_interval_seconds));
        let logger = config
            .logging
            .enable
            .then(|| DecisionLogger::new(config.logging.clone(), Vec::new()));

        let mut engine = DecisionEngine::new(
            store.clone(),
            registry.clone(),
            breakers.clone(),
            cache.clone(),
            settings,
        );
        if let Some(stats) = &stats {
            engine = engine.with_stats(stats.clone());
        }
        if let Some(logger) = &logger {
            engine = engine.with_logger(logger.clone());
        }
        let engine = Arc::new(engine);

        let mut worker = SyncWorker::new(
            store.clone(),
            registry.clone(),
            breakers.clone(),
            cache.clone(),
            fetcher,
            SyncSettings::from_config(config),
        );
        if let Some(stats) = &stats {
            worker = worker.with_stats(stats.clone());
        }

        let reporter = ComplianceReporter::new(
            store.clone(),
            registry.clone(),
            logger.as_ref().and_then(|l| l.memory_sink().cloned()),
            stats.clone(),
        );

        info!(
            providers = registry.snapshot().len(),
            fail_policy = ?settings.fail_policy,
            compliance_level = ?settings.compliance_level,
            "Suppression service ready"
        );

        Ok(Self {
            bulk: BulkEvaluator::new(engine.clone(), BulkSettings::from(&config.bulk)),
            admin: SuppressionAdmin::new(store.clone(), cache.clone()),
            worker: Arc::new(worker),
            store,
            registry,
            breakers,
            cache,
            engine,
            reporter,
            stats,
            logger,
        })
    }

    pub fn engine(&self) -> &Arc<DecisionEngine> {
        &self.engine
    }

    pub fn worker(&self) -> &Arc<SyncWorker> {
        &self.worker
    }

    pub fn stats(&self) -> Option<&Arc<StatsCollector>> {
        self.stats.as_ref()
    }

    pub fn logger(&self) -> Option<&Arc<DecisionLogger>> {
        self.logger.as_ref()
    }

    pub async fn check(&self, phone_number: &str, options: CheckOptions) -> Result<Verdict> {
        self.engine.check_str(phone_number, options).await
    }

    pub async fn check_bulk(
        &self,
        phone_numbers: &[String],
        as_of: Option<DateTime<Utc>>,
        cancel: Option<CancellationToken>,
    ) -> Result<BulkResult> {
        let result = self.bulk.check_bulk(phone_numbers, as_of, cancel).await?;
        if let Some(stats) = &self.stats {
            stats.inc_bulk_batch();
        }
        Ok(result)
    }

    pub async fn add_suppression(&self, request: AddSuppression) -> Result<SuppressionEntry> {
        self.admin.add(request).await
    }

    pub async fn update_suppression(
        &self,
        id: &str,
        patch: UpdateSuppression,
    ) -> Result<SuppressionEntry> {
        self.admin.update(id, patch).await
    }

    pub async fn remove_suppression(
        &self,
        id: &str,
        request: RemoveSuppression,
    ) -> Result<SuppressionEntry> {
        self.admin.remove(id, request).await
    }

    pub async fn get_suppression(&self, id: &str) -> Result<SuppressionEntry> {
        self.admin.get(id).await
    }

    pub async fn list_suppressions(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
        self.admin.list(filter).await
    }

    /// Providers in evaluation order, with the live breaker state.
    pub fn list_providers(&self) -> Vec<Provider> {
        self.registry
            .snapshot()
            .iter()
            .map(|p| {
                let mut provider = (**p).clone();
                provider.circuit_state = self.breakers.state(&provider.id);
                provider
            })
            .collect()
    }

    pub async fn sync_provider(&self, provider_id: &str, options: SyncOptions) -> Result<SyncReport> {
        self.worker.sync(provider_id, options).await
    }

    pub fn get_provider_status(&self, provider_id: &str) -> Result<ProviderStatusReport> {
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| Error::not_found("provider", provider_id))?;
        let mut report = provider.status_report();
        report.circuit_state = self.breakers.state(provider_id);
        Ok(report)
    }

    pub fn breaker_stats(&self) -> Vec<(String, BreakerStats)> {
        self.breakers.snapshot()
    }

    pub async fn reset_breaker(&self, provider_id: &str) -> Result<ProviderStatusReport> {
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| Error::not_found("provider", provider_id))?;
        self.breakers.reset(provider_id);

        let mut updated = (*provider).clone();
        updated.circuit_state = self.breakers.state(provider_id);
        self.store.upsert_provider(&updated).await?;
        let report = updated.status_report();
        self.registry.upsert(updated);
        Ok(report)
    }

    /// Clears cached verdicts matching `pattern` (`*` or a number prefix).
    pub async fn clear_cache(&self, pattern: &str) -> Result<u64> {
        let removed = self.cache.clear(pattern).await?;
        info!(pattern, removed, "Decision cache cleared");
        Ok(removed)
    }

    pub async fn get_cache_stats(&self) -> CacheStats {
        self.cache.stats().await
    }

    pub async fn generate_compliance_report(
        &self,
        criteria: &ReportCriteria,
    ) -> Result<ComplianceReport> {
        self.reporter.generate(criteria).await
    }
}
