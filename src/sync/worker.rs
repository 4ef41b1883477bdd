//! Pulls provider feeds into the local store.
//!
//! A sync fetches every page first and only then applies the resulting change
//! set in one store transaction. A failed or cancelled sync leaves suppression
//! data untouched; only the provider's bookkeeping fields change.

use super::fetcher::{FetchBatch, FetchRequest, ProviderFetcher, RemoteRecord};
use crate::config::Config;
use crate::engine::{BreakerRegistry, CircuitBreaker, DecisionCache, ProviderRegistry};
use crate::error::{Error, Result};
use crate::model::{
    AuthType, PhoneNumber, Provider, ProviderStatus, SuppressReason, SuppressionEntry, SyncType,
};
use crate::stats::StatsCollector;
use crate::store::{SuppressionStore, SyncChangeSet};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on pages per sync; a feed that never completes is an upstream fault.
const MAX_PAGES: usize = 10_000;

#[derive(Debug, Clone, Copy)]
pub struct SyncSettings {
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Above this many touched numbers the whole decision cache is cleared.
    pub invalidate_all_threshold: usize,
    /// Delay before the scheduler retries a provider whose sync failed.
    pub failure_retry: Duration,
}

impl SyncSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            backoff_base: Duration::from_millis(config.sync.backoff_base_ms),
            backoff_max: Duration::from_millis(config.sync.backoff_max_ms),
            invalidate_all_threshold: config.sync.invalidate_all_threshold,
            failure_retry: config.breaker.open_timeout(),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.min(16)).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_max)
    }
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Overrides the provider's configured sync type.
    pub sync_type: Option<SyncType>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncReport {
    pub provider_id: String,
    pub sync_type: SyncType,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration: Duration,
    pub fetched: usize,
    pub added: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    /// Records dropped because their phone number did not validate.
    pub skipped: usize,
    /// Fetch attempts across all pages, retries included.
    pub attempts: u32,
    pub cache_cleared: bool,
    pub sync_token: Option<String>,
}

struct Fetched {
    records: Vec<RemoteRecord>,
    token: Option<String>,
    attempts: u32,
}

struct Diff {
    changes: SyncChangeSet,
    touched: Vec<PhoneNumber>,
    unchanged: usize,
    skipped: usize,
}

/// Held while a sync owns the breaker trial and the `Syncing` status. If the
/// sync future is dropped before an outcome is recorded, the trial is handed
/// back and the provider's previous record restored.
struct InFlight {
    breaker: Arc<CircuitBreaker>,
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn SuppressionStore>,
    previous: Option<Provider>,
}

impl InFlight {
    fn settle(&mut self) {
        self.previous = None;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        let Some(previous) = self.previous.take() else {
            return;
        };
        warn!(provider = %previous.id, "Provider sync abandoned before completion");
        self.breaker.release_trial();
        self.registry.upsert(previous.clone());
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let store = self.store.clone();
            handle.spawn(async move {
                if let Err(e) = store.upsert_provider(&previous).await {
                    warn!(provider = %previous.id, error = %e, "Failed to restore provider record");
                }
            });
        }
    }
}

pub struct SyncWorker {
    store: Arc<dyn SuppressionStore>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<DecisionCache>,
    fetcher: Arc<dyn ProviderFetcher>,
    settings: SyncSettings,
    stats: Option<Arc<StatsCollector>>,
    in_flight: Mutex<FxHashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncWorker {
    pub fn new(
        store: Arc<dyn SuppressionStore>,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<DecisionCache>,
        fetcher: Arc<dyn ProviderFetcher>,
        settings: SyncSettings,
    ) -> Self {
        Self {
            store,
            registry,
            breakers,
            cache,
            fetcher,
            settings,
            stats: None,
            in_flight: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    /// Providers with a remote feed whose next sync is due at `now`.
    pub fn due_providers(&self, now: DateTime<Utc>) -> Vec<Arc<Provider>> {
        self.registry
            .enabled()
            .into_iter()
            .filter(|p| p.has_remote_feed())
            .filter(|p| p.next_sync_at.map_or(true, |at| at <= now))
            .collect()
    }

    fn provider_lock(&self, provider_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.in_flight
            .lock()
            .entry(provider_id.to_string())
            .or_default()
            .clone()
    }

    pub async fn sync(&self, provider_id: &str, options: SyncOptions) -> Result<SyncReport> {
        let provider = self
            .registry
            .get(provider_id)
            .ok_or_else(|| Error::not_found("provider", provider_id))?;
        if !provider.enabled {
            return Err(Error::validation(format!(
                "provider '{}' is disabled",
                provider_id
            )));
        }
        if !provider.has_remote_feed() {
            return Err(Error::validation(format!(
                "provider '{}' has no remote feed",
                provider_id
            )));
        }
        let credential = resolve_credential(&provider)?;

        let lock = self.provider_lock(provider_id);
        let _guard = lock
            .try_lock_owned()
            .map_err(|_| Error::conflict(format!("sync already in progress for '{}'", provider_id)))?;

        let breaker = self.breakers.get(provider_id);
        if !breaker.try_acquire() {
            let retry_in = breaker.stats().retry_in_ms.unwrap_or(0);
            debug!(provider = provider_id, retry_in_ms = retry_in, "Sync rejected by open breaker");
            return Err(Error::upstream(
                provider_id,
                format!("circuit breaker open, retry in {}ms", retry_in),
            ));
        }

        let sync_type = options
            .sync_type
            .unwrap_or_else(|| provider.effective_sync_type());
        let started_at = Utc::now();
        let started = Instant::now();
        info!(provider = provider_id, ?sync_type, "Starting provider sync");

        let mut in_flight = InFlight {
            breaker: breaker.clone(),
            registry: self.registry.clone(),
            store: self.store.clone(),
            previous: Some((*provider).clone()),
        };
        let mut syncing = (*provider).clone();
        syncing.status = ProviderStatus::Syncing;
        self.persist(syncing.clone()).await?;

        let cancel = options.cancel.unwrap_or_default();
        let outcome = self.run(&syncing, sync_type, credential, &cancel).await;

        match outcome {
            Ok((fetched, diff)) => {
                let cache_cleared = self.invalidate(&diff.touched).await;
                let finished_at = Utc::now();
                let mut done = syncing;
                done.status = ProviderStatus::Active;
                done.success_count += 1;
                done.last_sync_at = Some(finished_at);
                done.next_sync_at = Some(finished_at + chrono_duration(done.update_frequency()));
                done.last_error = None;
                if fetched.token.is_some() || sync_type == SyncType::Full {
                    done.sync_token = fetched.token.clone();
                }
                breaker.record_success();
                in_flight.settle();
                done.circuit_state = breaker.state();
                self.persist(done).await?;
                if let Some(stats) = &self.stats {
                    stats.record_sync(true);
                }

                let report = SyncReport {
                    provider_id: provider_id.to_string(),
                    sync_type,
                    started_at,
                    finished_at,
                    duration: started.elapsed(),
                    fetched: fetched.records.len(),
                    added: diff.changes.added.len(),
                    updated: diff.changes.updated.len(),
                    removed: diff.changes.removed.len(),
                    unchanged: diff.unchanged,
                    skipped: diff.skipped,
                    attempts: fetched.attempts,
                    cache_cleared,
                    sync_token: fetched.token,
                };
                info!(
                    provider = provider_id,
                    fetched = report.fetched,
                    added = report.added,
                    updated = report.updated,
                    removed = report.removed,
                    skipped = report.skipped,
                    duration_ms = report.duration.as_millis() as u64,
                    "Provider sync complete"
                );
                Ok(report)
            }
            Err(Error::Cancelled(op)) => {
                warn!(provider = provider_id, "Provider sync cancelled");
                breaker.release_trial();
                in_flight.settle();
                let mut restored = syncing;
                restored.status = provider.status;
                self.persist(restored).await?;
                Err(Error::Cancelled(op))
            }
            Err(e) => {
                error!(provider = provider_id, error = %e, "Provider sync failed");
                breaker.record_failure();
                in_flight.settle();
                self.record_failure(syncing, &breaker, &e).await?;
                Err(e)
            }
        }
    }

    async fn record_failure(
        &self,
        mut provider: Provider,
        breaker: &CircuitBreaker,
        err: &Error,
    ) -> Result<()> {
        provider.status = ProviderStatus::Error;
        provider.error_count += 1;
        provider.last_error = Some(err.public_message());
        provider.next_sync_at = Some(Utc::now() + chrono_duration(self.settings.failure_retry));
        provider.circuit_state = breaker.state();
        if let Some(stats) = &self.stats {
            stats.record_sync(false);
        }
        self.persist(provider).await
    }

    async fn run(
        &self,
        provider: &Provider,
        sync_type: SyncType,
        credential: Option<String>,
        cancel: &CancellationToken,
    ) -> Result<(Fetched, Diff)> {
        // Cancellation is honoured until the fetch completes; the store write is not interrupted.
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(Error::Cancelled("sync")),
            res = self.fetch_all(provider, sync_type, credential) => res?,
        };
        let local = self.store.provider_entries(&provider.id).await?;
        let diff = diff_records(provider, sync_type, &fetched.records, local, Utc::now());
        if !diff.changes.is_empty() {
            self.store.apply_sync(&provider.id, &diff.changes).await?;
        }
        Ok((fetched, diff))
    }

    async fn fetch_all(
        &self,
        provider: &Provider,
        sync_type: SyncType,
        credential: Option<String>,
    ) -> Result<Fetched> {
        let mut request = FetchRequest {
            provider: provider.clone(),
            sync_type,
            token: match sync_type {
                SyncType::Incremental => provider.sync_token.clone(),
                SyncType::Full => None,
            },
            credential,
        };
        let mut records = Vec::new();
        let mut attempts = 0;

        for page in 0..MAX_PAGES {
            let batch = self.fetch_page(&request, &mut attempts).await?;
            debug!(
                provider = %provider.id,
                page,
                records = batch.records.len(),
                complete = batch.complete,
                "Fetched page"
            );
            records.extend(batch.records);
            if batch.complete {
                return Ok(Fetched {
                    records,
                    token: batch.next_token,
                    attempts,
                });
            }
            match batch.next_token {
                Some(token) => request.token = Some(token),
                None => {
                    return Err(Error::upstream(
                        &provider.id,
                        "incomplete page without continuation token",
                    ))
                }
            }
        }
        Err(Error::upstream(
            &provider.id,
            format!("feed did not complete within {} pages", MAX_PAGES),
        ))
    }

    async fn fetch_page(&self, request: &FetchRequest, attempts: &mut u32) -> Result<FetchBatch> {
        let max_attempts = request.provider.retry_attempts + 1;
        let mut attempt = 0;
        loop {
            attempt += 1;
            *attempts += 1;
            match self.fetcher.fetch(request).await {
                Ok(batch) => return Ok(batch),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.settings.backoff(attempt - 1);
                    warn!(
                        provider = %request.provider.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient fetch failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Returns whether the whole cache was cleared.
    async fn invalidate(&self, touched: &[PhoneNumber]) -> bool {
        if touched.is_empty() {
            return false;
        }
        if touched.len() > self.settings.invalidate_all_threshold {
            match self.cache.clear("*").await {
                Ok(_) => return true,
                Err(e) => warn!(error = %e, "Cache clear failed, invalidating per number"),
            }
        }
        for phone in touched {
            self.cache.invalidate(phone).await;
        }
        false
    }

    /// The registry is updated first so a failed store write never leaves
    /// the live snapshot behind.
    async fn persist(&self, provider: Provider) -> Result<()> {
        self.registry.upsert(provider.clone());
        self.store.upsert_provider(&provider).await
    }
}

fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or_else(|_| chrono::Duration::days(365))
}

fn resolve_credential(provider: &Provider) -> Result<Option<String>> {
    if provider.auth_type == AuthType::None {
        if provider.source.is_regulatory() {
            return Err(Error::policy(format!(
                "regulatory provider '{}' must be configured with authentication",
                provider.id
            )));
        }
        return Ok(None);
    }
    let credential = provider
        .credential_env
        .as_deref()
        .and_then(|name| std::env::var(name).ok())
        .filter(|value| !value.is_empty());
    match credential {
        Some(value) => Ok(Some(value)),
        None if provider.source.is_regulatory() => Err(Error::policy(format!(
            "credential for regulatory provider '{}' could not be resolved",
            provider.id
        ))),
        None => Ok(None),
    }
}

fn differs(entry: &SuppressionEntry, record: &RemoteRecord, reason: SuppressReason) -> bool {
    entry.reason != reason
        || entry.expires_at != record.expires_at
        || entry.source_reference != record.source_reference
        || entry.metadata != record.metadata
}

/// Turns fetched records into a change set against the provider's local entries.
///
/// `Full` removes every local entry absent from the feed; `Incremental` only
/// removes numbers the feed tombstoned. The last record for a number wins.
fn diff_records(
    provider: &Provider,
    sync_type: SyncType,
    records: &[RemoteRecord],
    local: Vec<SuppressionEntry>,
    now: DateTime<Utc>,
) -> Diff {
    let removed_by = format!("sync:{}", provider.id);
    let mut changes = SyncChangeSet {
        removed_at: Some(now),
        removed_by: removed_by.clone(),
        removal_reason: format!("no longer listed by provider '{}'", provider.id),
        ..Default::default()
    };
    let mut skipped = 0;

    let mut remote: FxHashMap<PhoneNumber, &RemoteRecord> = FxHashMap::default();
    for record in records {
        match PhoneNumber::parse(&record.phone_number) {
            Ok(phone) => {
                remote.insert(phone, record);
            }
            Err(e) => {
                debug!(provider = %provider.id, error = %e, "Skipping invalid feed record");
                skipped += 1;
            }
        }
    }

    let mut by_phone: FxHashMap<PhoneNumber, SuppressionEntry> = FxHashMap::default();
    for entry in local {
        if by_phone.contains_key(&entry.phone_number) {
            // Duplicate local rows for one number collapse to the first.
            changes.removed.push(entry.id);
        } else {
            by_phone.insert(entry.phone_number.clone(), entry);
        }
    }

    let mut touched: FxHashSet<PhoneNumber> = FxHashSet::default();
    let mut unchanged = 0;

    for (phone, record) in &remote {
        let existing = by_phone.get(phone);
        if record.deleted {
            if let Some(entry) = existing {
                changes.removed.push(entry.id.clone());
                touched.insert(phone.clone());
            }
            continue;
        }
        let reason = record.reason.unwrap_or_else(|| provider.source.default_reason());
        match existing {
            Some(entry) if !differs(entry, record, reason) => unchanged += 1,
            Some(entry) => {
                let mut updated = entry.clone();
                updated.reason = reason;
                updated.expires_at = record.expires_at;
                updated.source_reference = record.source_reference.clone();
                updated.metadata = record.metadata.clone();
                updated.updated_at = now;
                changes.updated.push(updated);
                touched.insert(phone.clone());
            }
            None => {
                changes.added.push(SuppressionEntry {
                    id: SuppressionEntry::new_id(),
                    phone_number: phone.clone(),
                    source: provider.source,
                    provider_id: provider.id.clone(),
                    reason,
                    added_at: now,
                    expires_at: record.expires_at,
                    source_reference: record.source_reference.clone(),
                    notes: String::new(),
                    metadata: record.metadata.clone(),
                    added_by: removed_by.clone(),
                    updated_at: now,
                    removed_at: None,
                    removed_by: None,
                    removal_reason: None,
                });
                touched.insert(phone.clone());
            }
        }
    }

    if sync_type == SyncType::Full {
        for (phone, entry) in &by_phone {
            if !remote.contains_key(phone) {
                changes.removed.push(entry.id.clone());
                touched.insert(phone.clone());
            }
        }
    }

    Diff {
        changes,
        touched: touched.into_iter().collect(),
        unchanged,
        skipped,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::BreakerSettings;
    use crate::model::{CircuitState, ListSource};
    use crate::store::{EntryFilter, MemoryStore};
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Serves scripted responses in order; once exhausted it repeats the last one.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<Result<FetchBatch>>>,
        calls: AtomicU32,
        tokens: Mutex<Vec<Option<String>>>,
    }

    impl ScriptedFetcher {
        fn new(script: Vec<Result<FetchBatch>>) -> Arc<Self> {
            Arc::new(Self {
                script: Mutex::new(script.into()),
                calls: AtomicU32::new(0),
                tokens: Mutex::new(Vec::new()),
            })
        }
    }

    fn clone_result(r: &Result<FetchBatch>) -> Result<FetchBatch> {
        match r {
            Ok(batch) => Ok(batch.clone()),
            Err(e) if e.is_transient() => Err(Error::upstream("test", e.to_string())),
            Err(e) => Err(Error::validation(e.to_string())),
        }
    }

    #[async_trait]
    impl ProviderFetcher for ScriptedFetcher {
        async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.tokens.lock().push(request.token.clone());
            let mut script = self.script.lock();
            if script.len() > 1 {
                script.pop_front().unwrap_or_else(|| Ok(FetchBatch::default()))
            } else {
                script
                    .front()
                    .map(clone_result)
                    .unwrap_or_else(|| Ok(FetchBatch::default()))
            }
        }
    }

    fn batch(numbers: &[&str]) -> FetchBatch {
        FetchBatch {
            records: numbers.iter().map(|n| RemoteRecord::number(*n)).collect(),
            next_token: None,
            complete: true,
        }
    }

    fn partner() -> Provider {
        let mut p = Provider::builtin(ListSource::Custom);
        p.id = "partner".to_string();
        p.name = "Partner list".to_string();
        p.base_url = Some("http://127.0.0.1:1/feed".to_string());
        p.retry_attempts = 2;
        p.update_frequency_minutes = 60;
        p.sync_type = Some(SyncType::Full);
        p
    }

    struct Harness {
        worker: SyncWorker,
        store: Arc<MemoryStore>,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<BreakerRegistry>,
    }

    fn harness(provider: Provider, fetcher: Arc<ScriptedFetcher>) -> Harness {
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(ProviderRegistry::new(vec![provider]));
        let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
            enabled: true,
            failure_threshold: 2,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(60),
        }));
        let cache = Arc::new(DecisionCache::new(true, 100, Duration::from_secs(60)));
        let settings = SyncSettings {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(2),
            invalidate_all_threshold: 100,
            failure_retry: Duration::from_secs(60),
        };
        let worker = SyncWorker::new(
            store.clone(),
            registry.clone(),
            breakers.clone(),
            cache,
            fetcher,
            settings,
        );
        Harness {
            worker,
            store,
            registry,
            breakers,
        }
    }

    async fn active_numbers(store: &MemoryStore) -> Vec<String> {
        let mut out: Vec<String> = store
            .list_entries(&EntryFilter {
                provider_id: Some("partner".to_string()),
                active_at: Some(Utc::now()),
                ..Default::default()
            })
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.phone_number.to_string())
            .collect();
        out.sort();
        out
    }

    #[tokio::test]
    async fn test_full_sync_adds_then_diffs() {
        let fetcher = ScriptedFetcher::new(vec![
            Ok(batch(&["+14155550001", "+14155550002", "bogus"])),
            Ok(batch(&["+14155550002", "+14155550003"])),
        ]);
        let h = harness(partner(), fetcher);

        let report = h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        assert_eq!(report.added, 2);
        assert_eq!(report.skipped, 1);
        assert_eq!(active_numbers(&h.store).await, vec!["+14155550001", "+14155550002"]);

        let report = h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        assert_eq!((report.added, report.removed, report.unchanged), (1, 1, 1));
        assert_eq!(active_numbers(&h.store).await, vec!["+14155550002", "+14155550003"]);

        let provider = h.registry.get("partner").unwrap();
        assert_eq!(provider.status, ProviderStatus::Active);
        assert_eq!(provider.success_count, 2);
        assert!(provider.next_sync_at.unwrap() > Utc::now());
        let stored = h.store.get_provider("partner").await.unwrap().unwrap();
        assert_eq!(stored.success_count, 2);
    }

    #[tokio::test]
    async fn test_default_reason_follows_source() {
        let fetcher = ScriptedFetcher::new(vec![Ok(batch(&["+14155550001"]))]);
        let h = harness(partner(), fetcher);
        h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        let entries = h.store.provider_entries("partner").await.unwrap();
        assert_eq!(entries[0].reason, SuppressReason::CompanyPolicy);
        assert_eq!(entries[0].added_by, "sync:partner");
    }

    #[tokio::test]
    async fn test_incremental_applies_tombstones_and_token() {
        let mut provider = partner();
        provider.sync_type = Some(SyncType::Incremental);
        let first = FetchBatch {
            records: vec![RemoteRecord::number("+14155550001"), RemoteRecord::number("+14155550002")],
            next_token: Some("t1".to_string()),
            complete: true,
        };
        let second = FetchBatch {
            records: vec![RemoteRecord::tombstone("+14155550001"), RemoteRecord::number("+14155550009")],
            next_token: Some("t2".to_string()),
            complete: true,
        };
        let fetcher = ScriptedFetcher::new(vec![Ok(first), Ok(second)]);
        let h = harness(provider, fetcher.clone());

        h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        let report = h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        assert_eq!((report.added, report.removed), (1, 1));
        assert_eq!(active_numbers(&h.store).await, vec!["+14155550002", "+14155550009"]);
        assert_eq!(*fetcher.tokens.lock(), vec![None, Some("t1".to_string())]);
        assert_eq!(h.registry.get("partner").unwrap().sync_token.as_deref(), Some("t2"));
    }

    #[tokio::test]
    async fn test_paging_follows_tokens() {
        let page1 = FetchBatch {
            records: vec![RemoteRecord::number("+14155550001")],
            next_token: Some("p2".to_string()),
            complete: false,
        };
        let fetcher = ScriptedFetcher::new(vec![Ok(page1), Ok(batch(&["+14155550002"]))]);
        let h = harness(partner(), fetcher.clone());
        let report = h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        assert_eq!(report.fetched, 2);
        assert_eq!(fetcher.tokens.lock()[1].as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn test_transient_errors_retried_then_fail() {
        let fetcher = ScriptedFetcher::new(vec![Err(Error::upstream("partner", "HTTP 503"))]);
        let h = harness(partner(), fetcher.clone());

        let err = h.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 3);

        let provider = h.registry.get("partner").unwrap();
        assert_eq!(provider.status, ProviderStatus::Error);
        assert_eq!(provider.error_count, 1);
        assert!(provider.last_error.is_some());
        assert_eq!(h.store.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_non_transient_error_not_retried() {
        let fetcher = ScriptedFetcher::new(vec![Err(Error::validation("malformed feed"))]);
        let h = harness(partner(), fetcher.clone());
        h.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_breaker_opens_after_threshold() {
        let mut provider = partner();
        provider.retry_attempts = 0;
        let fetcher = ScriptedFetcher::new(vec![Err(Error::upstream("partner", "down"))]);
        let h = harness(provider, fetcher.clone());

        for _ in 0..2 {
            h.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        }
        assert_eq!(h.breakers.state("partner"), CircuitState::Open);
        assert_eq!(h.registry.get("partner").unwrap().circuit_state, CircuitState::Open);

        let err = h.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_preconditions() {
        let fetcher = ScriptedFetcher::new(vec![Ok(batch(&[]))]);
        let h = harness(partner(), fetcher);
        assert_eq!(
            h.worker.sync("nope", SyncOptions::default()).await.unwrap_err().code(),
            "not_found"
        );
        assert_eq!(
            h.worker.sync("internal", SyncOptions::default()).await.unwrap_err().code(),
            "validation_error"
        );

        let mut federal = partner();
        federal.id = "ftc".to_string();
        federal.source = ListSource::Federal;
        h.registry.upsert(federal.clone());
        assert_eq!(
            h.worker.sync("ftc", SyncOptions::default()).await.unwrap_err().code(),
            "policy_violation"
        );

        federal.auth_type = AuthType::ApiKey;
        federal.credential_env = Some("NO_CALL_TEST_UNSET_CREDENTIAL".to_string());
        h.registry.upsert(federal);
        assert_eq!(
            h.worker.sync("ftc", SyncOptions::default()).await.unwrap_err().code(),
            "policy_violation"
        );
    }

    #[tokio::test]
    async fn test_concurrent_sync_conflicts() {
        let fetcher = ScriptedFetcher::new(vec![Ok(batch(&[]))]);
        let h = harness(partner(), fetcher);
        let lock = h.worker.provider_lock("partner");
        let _held = lock.try_lock().unwrap();
        assert_eq!(
            h.worker.sync("partner", SyncOptions::default()).await.unwrap_err().code(),
            "conflict"
        );
    }

    #[tokio::test]
    async fn test_cancelled_sync_leaves_data_untouched() {
        let fetcher = ScriptedFetcher::new(vec![Ok(batch(&["+14155550001"]))]);
        let h = harness(partner(), fetcher);
        let token = CancellationToken::new();
        token.cancel();
        let err = h
            .worker
            .sync(
                "partner",
                SyncOptions {
                    cancel: Some(token),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "cancelled");
        assert_eq!(h.store.entry_count(), 0);
        assert_eq!(h.registry.get("partner").unwrap().status, ProviderStatus::Active);
    }

    #[test]
    fn test_backoff_is_capped() {
        let settings = SyncSettings {
            backoff_base: Duration::from_millis(500),
            backoff_max: Duration::from_millis(3000),
            invalidate_all_threshold: 10,
            failure_retry: Duration::from_secs(1),
        };
        assert_eq!(settings.backoff(0), Duration::from_millis(500));
        assert_eq!(settings.backoff(2), Duration::from_millis(2000));
        assert_eq!(settings.backoff(10), Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_due_providers() {
        let fetcher = ScriptedFetcher::new(vec![Ok(batch(&[]))]);
        let h = harness(partner(), fetcher);
        let due = h.worker.due_providers(Utc::now());
        assert_eq!(due.len(), 1);
        h.worker.sync("partner", SyncOptions::default()).await.unwrap();
        assert!(h.worker.due_providers(Utc::now()).is_empty());
    }

    /// Memory store whose provider writes start failing after `ok_writes` calls.
    struct FlakyProviderWrites {
        inner: MemoryStore,
        ok_writes: u32,
        writes: AtomicU32,
    }

    #[async_trait]
    impl SuppressionStore for FlakyProviderWrites {
        async fn active_entries(
            &self,
            phone: &PhoneNumber,
            provider_id: &str,
            as_of: DateTime<Utc>,
        ) -> Result<Vec<SuppressionEntry>> {
            self.inner.active_entries(phone, provider_id, as_of).await
        }
        async fn get_entry(&self, id: &str) -> Result<Option<SuppressionEntry>> {
            self.inner.get_entry(id).await
        }
        async fn insert_entry(&self, entry: &SuppressionEntry) -> Result<()> {
            self.inner.insert_entry(entry).await
        }
        async fn update_entry(&self, entry: &SuppressionEntry) -> Result<()> {
            self.inner.update_entry(entry).await
        }
        async fn delete_entry(&self, id: &str) -> Result<bool> {
            self.inner.delete_entry(id).await
        }
        async fn provider_entries(&self, provider_id: &str) -> Result<Vec<SuppressionEntry>> {
            self.inner.provider_entries(provider_id).await
        }
        async fn apply_sync(&self, provider_id: &str, changes: &SyncChangeSet) -> Result<()> {
            self.inner.apply_sync(provider_id, changes).await
        }
        async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
            self.inner.list_entries(filter).await
        }
        async fn list_providers(&self) -> Result<Vec<Provider>> {
            self.inner.list_providers().await
        }
        async fn get_provider(&self, id: &str) -> Result<Option<Provider>> {
            self.inner.get_provider(id).await
        }
        async fn upsert_provider(&self, provider: &Provider) -> Result<()> {
            if self.writes.fetch_add(1, Ordering::SeqCst) >= self.ok_writes {
                return Err(Error::storage("disk full"));
            }
            self.inner.upsert_provider(provider).await
        }
    }

    fn worker_over(store: Arc<FlakyProviderWrites>) -> (SyncWorker, Arc<ProviderRegistry>) {
        let registry = Arc::new(ProviderRegistry::new(vec![partner()]));
        let worker = SyncWorker::new(
            store,
            registry.clone(),
            Arc::new(BreakerRegistry::new(BreakerSettings::default())),
            Arc::new(DecisionCache::new(true, 100, Duration::from_secs(60))),
            ScriptedFetcher::new(vec![Ok(batch(&["+14155550001"]))]),
            SyncSettings::default(),
        );
        (worker, registry)
    }

    #[tokio::test]
    async fn test_failed_status_write_does_not_leave_provider_syncing() {
        // The final bookkeeping write fails after the change set was applied.
        let store = Arc::new(FlakyProviderWrites {
            inner: MemoryStore::new(),
            ok_writes: 1,
            writes: AtomicU32::new(0),
        });
        let (worker, registry) = worker_over(store.clone());
        let err = worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "storage_error");
        let provider = registry.get("partner").unwrap();
        assert_eq!(provider.status, ProviderStatus::Active);
        assert_eq!(provider.success_count, 1);
        assert_eq!(store.inner.entry_count(), 1);

        // The opening write fails: nothing is fetched and the record is restored.
        let store = Arc::new(FlakyProviderWrites {
            inner: MemoryStore::new(),
            ok_writes: 0,
            writes: AtomicU32::new(0),
        });
        let (worker, registry) = worker_over(store.clone());
        worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        let provider = registry.get("partner").unwrap();
        assert_eq!(provider.status, ProviderStatus::Active);
        assert_eq!(provider.success_count, 0);
        assert_eq!(store.inner.entry_count(), 0);
        assert_eq!(worker.due_providers(Utc::now()).len(), 1);
    }
}
