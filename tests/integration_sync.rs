use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use no_call::config::FailPolicy;
use no_call::engine::{
    BreakerRegistry, BreakerSettings, CheckOptions, DecisionCache, DecisionEngine, EngineSettings,
    ProviderRegistry,
};
use no_call::model::{
    CircuitState, ComplianceLevel, DecisionCode, ListSource, Provider, ProviderHealth,
    ProviderStatus, SyncType,
};
use no_call::store::{MemoryStore, SuppressionStore};
use no_call::sync::{
    FetchBatch, FetchRequest, ProviderFetcher, RemoteRecord, SyncOptions, SyncScheduler,
    SyncSettings, SyncWorker,
};
use no_call::{Error, Result};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Upstream double: fails while `failing` is set, otherwise serves `numbers`.
struct FlakyFetcher {
    failing: AtomicBool,
    calls: AtomicU32,
    delay_ms: AtomicU64,
    numbers: Vec<&'static str>,
}

impl FlakyFetcher {
    fn new(numbers: Vec<&'static str>) -> Arc<Self> {
        Self::with_delay(numbers, Duration::ZERO)
    }

    fn with_delay(numbers: Vec<&'static str>, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            failing: AtomicBool::new(false),
            calls: AtomicU32::new(0),
            delay_ms: AtomicU64::new(delay.as_millis() as u64),
            numbers,
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

#[async_trait]
impl ProviderFetcher for FlakyFetcher {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::upstream(&request.provider.id, "HTTP 503"));
        }
        Ok(FetchBatch {
            records: self.numbers.iter().map(|n| RemoteRecord::number(*n)).collect(),
            next_token: None,
            complete: true,
        })
    }
}

fn partner() -> Provider {
    let mut p = Provider::builtin(ListSource::Custom);
    p.id = "partner".to_string();
    p.name = "Partner suppression feed".to_string();
    p.base_url = Some("https://partner.example.com/feed".to_string());
    p.priority = 40;
    p.retry_attempts = 0;
    p.update_frequency_minutes = 60;
    p.sync_type = Some(SyncType::Full);
    p
}

struct Setup {
    store: Arc<MemoryStore>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<DecisionCache>,
    worker: Arc<SyncWorker>,
}

fn setup(fetcher: Arc<FlakyFetcher>, open_timeout: Duration) -> Setup {
    let store = Arc::new(MemoryStore::new());
    let registry = Arc::new(ProviderRegistry::new(vec![partner()]));
    let breakers = Arc::new(BreakerRegistry::new(BreakerSettings {
        enabled: true,
        failure_threshold: 3,
        failure_window: Duration::from_secs(60),
        open_timeout,
    }));
    let cache = Arc::new(DecisionCache::new(true, 1000, Duration::from_secs(300)));
    let worker = Arc::new(SyncWorker::new(
        store.clone(),
        registry.clone(),
        breakers.clone(),
        cache.clone(),
        fetcher,
        SyncSettings {
            backoff_base: Duration::from_millis(1),
            backoff_max: Duration::from_millis(5),
            invalidate_all_threshold: 1000,
            failure_retry: open_timeout,
        },
    ));
    Setup {
        store,
        registry,
        breakers,
        cache,
        worker,
    }
}

fn engine(s: &Setup) -> DecisionEngine {
    DecisionEngine::new(
        s.store.clone(),
        s.registry.clone(),
        s.breakers.clone(),
        s.cache.clone(),
        EngineSettings {
            compliance_level: ComplianceLevel::Standard,
            fail_policy: FailPolicy::Closed,
            check_timeout: Duration::from_secs(2),
        },
    )
}

#[tokio::test]
async fn test_breaker_lifecycle_around_sync() {
    let fetcher = FlakyFetcher::with_delay(vec!["+14155550001"], Duration::from_millis(20));
    fetcher.failing.store(true, Ordering::SeqCst);
    let s = setup(fetcher.clone(), Duration::from_millis(300));

    for _ in 0..3 {
        let err = s.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
        assert_eq!(err.code(), "upstream_unavailable");
    }
    assert_eq!(fetcher.calls(), 3);
    assert_eq!(s.breakers.state("partner"), CircuitState::Open);

    // While open, attempts are rejected without touching the upstream.
    for _ in 0..5 {
        assert!(s.worker.sync("partner", SyncOptions::default()).await.is_err());
    }
    assert_eq!(fetcher.calls(), 3);

    // Past the timeout exactly one trial goes out, even under concurrency.
    tokio::time::sleep(Duration::from_millis(350)).await;
    let attempts = join_all((0..5).map(|_| s.worker.sync("partner", SyncOptions::default()))).await;
    assert!(attempts.iter().all(|r| r.is_err()));
    assert_eq!(fetcher.calls(), 4);
    assert_eq!(s.breakers.state("partner"), CircuitState::Open);

    // A successful trial closes the breaker and applies the feed.
    tokio::time::sleep(Duration::from_millis(350)).await;
    fetcher.failing.store(false, Ordering::SeqCst);
    let report = s.worker.sync("partner", SyncOptions::default()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(s.breakers.state("partner"), CircuitState::Closed);

    let provider = s.registry.get("partner").unwrap();
    assert_eq!(provider.status, ProviderStatus::Active);
    assert_eq!(provider.success_count, 1);
    assert_eq!(provider.error_count, 4);
    assert_eq!(provider.health(), ProviderHealth::Unhealthy);
    assert_eq!(provider.circuit_state, CircuitState::Closed);
}

#[tokio::test]
async fn test_abandoned_trial_sync_is_released() {
    let fetcher = FlakyFetcher::new(vec!["+14155550001"]);
    fetcher.failing.store(true, Ordering::SeqCst);
    let s = setup(fetcher.clone(), Duration::from_millis(100));
    for _ in 0..3 {
        s.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
    }
    assert_eq!(s.breakers.state("partner"), CircuitState::Open);
    tokio::time::sleep(Duration::from_millis(150)).await;

    // The trial sync is dropped mid-fetch, as a caller-side timeout would do.
    fetcher.set_delay(Duration::from_secs(5));
    let dropped = tokio::time::timeout(
        Duration::from_millis(50),
        s.worker.sync("partner", SyncOptions::default()),
    )
    .await;
    assert!(dropped.is_err());
    assert_eq!(fetcher.calls(), 4);

    let provider = s.registry.get("partner").unwrap();
    assert_eq!(provider.status, ProviderStatus::Error);
    assert_eq!(
        s.worker
            .due_providers(Utc::now() + chrono::Duration::days(1))
            .len(),
        1
    );

    // The trial is free again and a healthy upstream closes the breaker.
    fetcher.set_delay(Duration::ZERO);
    fetcher.failing.store(false, Ordering::SeqCst);
    let report = s.worker.sync("partner", SyncOptions::default()).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(s.breakers.state("partner"), CircuitState::Closed);
    assert_eq!(s.registry.get("partner").unwrap().status, ProviderStatus::Active);
}

#[tokio::test]
async fn test_open_breaker_degrades_but_does_not_fail_checks() {
    let fetcher = FlakyFetcher::new(vec!["+14155550001"]);
    let s = setup(fetcher.clone(), Duration::from_secs(60));
    s.worker.sync("partner", SyncOptions::default()).await.unwrap();

    fetcher.failing.store(true, Ordering::SeqCst);
    for _ in 0..3 {
        s.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
    }
    assert_eq!(s.breakers.state("partner"), CircuitState::Open);

    // Last synced data still blocks.
    let verdict = engine(&s)
        .check_str("+14155550001", CheckOptions::default())
        .await
        .unwrap();
    assert_eq!(verdict.decision, DecisionCode::Blocked);
    assert!(verdict.is_degraded());
    assert!(verdict.warnings.iter().any(|w| w.contains("partner")));
    assert_eq!(s.store.entry_count(), 1);
}

#[tokio::test]
async fn test_sync_invalidates_cached_verdicts() {
    let fetcher = FlakyFetcher::new(vec!["+14155550009"]);
    let s = setup(fetcher, Duration::from_secs(60));
    let engine = engine(&s);

    let before = engine.check_str("+14155550009", CheckOptions::default()).await.unwrap();
    assert_eq!(before.decision, DecisionCode::NotBlocked);

    let report = s.worker.sync("partner", SyncOptions::default()).await.unwrap();
    assert!(!report.cache_cleared);

    let after = engine.check_str("+14155550009", CheckOptions::default()).await.unwrap();
    assert!(!after.cache_hit);
    assert_eq!(after.decision, DecisionCode::Blocked);
    assert_eq!(after.reasons[0].provider_id, "partner");
}

#[tokio::test]
async fn test_failed_sync_keeps_existing_data() {
    let fetcher = FlakyFetcher::new(vec!["+14155550001", "+14155550002"]);
    let s = setup(fetcher.clone(), Duration::from_secs(60));
    s.worker.sync("partner", SyncOptions::default()).await.unwrap();
    assert_eq!(s.store.provider_entries("partner").await.unwrap().len(), 2);

    fetcher.failing.store(true, Ordering::SeqCst);
    s.worker.sync("partner", SyncOptions::default()).await.unwrap_err();
    assert_eq!(s.store.provider_entries("partner").await.unwrap().len(), 2);

    let provider = s.registry.get("partner").unwrap();
    assert_eq!(provider.status, ProviderStatus::Error);
    assert!(provider.last_error.is_some());
    assert!(provider.next_sync_at.unwrap() > Utc::now());
}

#[tokio::test]
async fn test_scheduler_syncs_due_providers() {
    let fetcher = FlakyFetcher::new(vec!["+14155550001"]);
    let s = setup(fetcher.clone(), Duration::from_secs(60));

    let scheduler = SyncScheduler::new(s.worker.clone(), Duration::from_secs(3600), 2);
    let handle = scheduler.spawn(CancellationToken::new());

    // The first interval tick fires immediately.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetcher.calls(), 1);
    assert_eq!(s.store.entry_count(), 1);

    // Nothing is due until the next update window.
    handle.trigger();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(fetcher.calls(), 1);

    handle.shutdown().await;
}
