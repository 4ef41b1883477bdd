use crate::model::{DecisionCode, ListSource, Verdict};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::{self, Duration};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug)]
pub struct StatsCollector {
    total_checks: AtomicU64,
    blocked: AtomicU64,
    allowed: AtomicU64,
    uncertain: AtomicU64,
    cache_hits: AtomicU64,
    check_errors: AtomicU64,

    // One slot per ListSource, indexed by position in ListSource::ALL.
    blocks_by_source: [AtomicU64; 4],

    // Latency of non-cached checks only.
    lookup_total_us: AtomicU64,
    lookup_count: AtomicU64,

    syncs_ok: AtomicU64,
    syncs_failed: AtomicU64,
    bulk_batches: AtomicU64,

    log_interval: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_checks: u64,
    pub blocked: u64,
    pub allowed: u64,
    pub uncertain: u64,
    pub cache_hits: u64,
    pub check_errors: u64,
    pub blocks_by_source: Vec<(ListSource, u64)>,
    pub avg_lookup_us: f64,
    pub syncs_ok: u64,
    pub syncs_failed: u64,
    pub bulk_batches: u64,
}

fn source_index(source: ListSource) -> usize {
    ListSource::ALL
        .iter()
        .position(|s| *s == source)
        .unwrap_or(0)
}

impl StatsCollector {
    pub fn new(log_interval_sec: u64) -> Arc<Self> {
        Arc::new(Self {
            total_checks: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            allowed: AtomicU64::new(0),
            uncertain: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            check_errors: AtomicU64::new(0),
            blocks_by_source: [0; 4].map(|_| AtomicU64::new(0)),
            lookup_total_us: AtomicU64::new(0),
            lookup_count: AtomicU64::new(0),
            syncs_ok: AtomicU64::new(0),
            syncs_failed: AtomicU64::new(0),
            bulk_batches: AtomicU64::new(0),
            log_interval: Duration::from_secs(log_interval_sec.max(1)),
        })
    }

    /// Spawns the periodic dump task. It stops when `shutdown` fires.
    pub fn spawn_logger(self: &Arc<Self>, shutdown: CancellationToken) {
        let stats = self.clone();
        tokio::spawn(async move {
            let mut interval = time::interval(stats.log_interval);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => stats.dump_stats(),
                }
            }
        });
    }

    pub fn record_verdict(&self, verdict: &Verdict) {
        self.total_checks.fetch_add(1, Ordering::Relaxed);
        match verdict.decision {
            DecisionCode::Blocked => {
                self.blocked.fetch_add(1, Ordering::Relaxed);
                let mut seen = [false; 4];
                for reason in &verdict.reasons {
                    let idx = source_index(reason.source);
                    if !seen[idx] {
                        seen[idx] = true;
                        self.blocks_by_source[idx].fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            DecisionCode::NotBlocked => {
                self.allowed.fetch_add(1, Ordering::Relaxed);
            }
            DecisionCode::Uncertain => {
                self.uncertain.fetch_add(1, Ordering::Relaxed);
            }
        }
        if verdict.cache_hit {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.lookup_total_us
                .fetch_add(verdict.check_duration.as_micros() as u64, Ordering::Relaxed);
            self.lookup_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_check_error(&self) {
        self.check_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync(&self, ok: bool) {
        if ok {
            self.syncs_ok.fetch_add(1, Ordering::Relaxed);
        } else {
            self.syncs_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn inc_bulk_batch(&self) {
        self.bulk_batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let lookups = self.lookup_count.load(Ordering::Relaxed);
        StatsSnapshot {
            total_checks: self.total_checks.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            allowed: self.allowed.load(Ordering::Relaxed),
            uncertain: self.uncertain.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            check_errors: self.check_errors.load(Ordering::Relaxed),
            blocks_by_source: ListSource::ALL
                .iter()
                .zip(self.blocks_by_source.iter())
                .map(|(s, c)| (*s, c.load(Ordering::Relaxed)))
                .collect(),
            avg_lookup_us: if lookups > 0 {
                self.lookup_total_us.load(Ordering::Relaxed) as f64 / lookups as f64
            } else {
                0.0
            },
            syncs_ok: self.syncs_ok.load(Ordering::Relaxed),
            syncs_failed: self.syncs_failed.load(Ordering::Relaxed),
            bulk_batches: self.bulk_batches.load(Ordering::Relaxed),
        }
    }

    pub fn dump_stats(&self) {
        let snap = self.snapshot();
        let pct = |n: u64| {
            if snap.total_checks > 0 {
                (n as f64 / snap.total_checks as f64) * 100.0
            } else {
                0.0
            }
        };

        let mut block_stats = String::new();
        if snap.blocked > 0 {
            block_stats.push_str(" BlockStats: ");
            for (source, count) in &snap.blocks_by_source {
                if *count > 0 {
                    block_stats.push_str(&format!(
                        "[{}: {} ({:.1}%)] ",
                        source,
                        count,
                        (*count as f64 / snap.blocked as f64) * 100.0
                    ));
                }
            }
        }

        info!(
            "STATS DUMP: Checks: {}, Blocked: {} ({:.1}%), Uncertain: {} ({:.1}%), CacheHits: {} ({:.1}%), Errors: {}, AvgLookup: {:.0}us, Syncs: {} ok / {} failed{}",
            snap.total_checks,
            snap.blocked,
            pct(snap.blocked),
            snap.uncertain,
            pct(snap.uncertain),
            snap.cache_hits,
            pct(snap.cache_hits),
            snap.check_errors,
            snap.avg_lookup_us,
            snap.syncs_ok,
            snap.syncs_failed,
            block_stats
        );
    }
}
