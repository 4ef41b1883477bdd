//! Short-lived verdict cache.
//!
//! Entries carry their own validity window `[checked_at, expires_at)` and the
//! generation of the phone number's shard at the moment the store was read.
//! `invalidate` bumps the shard generation before removing the key, so a
//! check that read the store before an administrative write can never put a
//! verdict that outlives that write.

use crate::error::{Error, Result};
use crate::model::{PhoneNumber, Verdict};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use rustc_hash::FxHasher;
use serde::Serialize;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

const GENERATION_SHARDS: usize = 256;

const TTL_BUCKETS: [(&str, u64); 5] = [
    ("<1m", 60),
    ("1-5m", 300),
    ("5-15m", 900),
    ("15-60m", 3600),
    (">1h", u64::MAX),
];

#[derive(Clone)]
struct CachedVerdict {
    verdict: Arc<Verdict>,
    expires_at: DateTime<Utc>,
    generation: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub miss_rate: f64,
    pub total_keys: u64,
    pub evictions: u64,
    /// Number of puts per TTL bucket since start.
    pub ttl_distribution: BTreeMap<String, u64>,
}

pub struct DecisionCache {
    enabled: bool,
    max_ttl: Duration,
    entries: Cache<PhoneNumber, CachedVerdict>,
    generations: Box<[AtomicU64]>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: Arc<AtomicU64>,
    ttl_buckets: [AtomicU64; 5],
}

impl DecisionCache {
    pub fn new(enabled: bool, capacity: u64, max_ttl: Duration) -> Self {
        let evictions = Arc::new(AtomicU64::new(0));
        let listener_evictions = evictions.clone();
        let entries = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(max_ttl.max(Duration::from_millis(1)))
            .eviction_listener(move |_key, _value, cause| {
                if cause.was_evicted() {
                    listener_evictions.fetch_add(1, Ordering::Relaxed);
                }
            })
            .build();

        Self {
            enabled,
            max_ttl,
            entries,
            generations: (0..GENERATION_SHARDS).map(|_| AtomicU64::new(0)).collect(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions,
            ttl_buckets: [0; 5].map(|_| AtomicU64::new(0)),
        }
    }

    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self::new(config.enable, config.capacity, config.max_ttl())
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn max_ttl(&self) -> Duration {
        self.max_ttl
    }

    fn shard(phone: &PhoneNumber) -> usize {
        let mut hasher = FxHasher::default();
        phone.hash(&mut hasher);
        (hasher.finish() as usize) % GENERATION_SHARDS
    }

    /// Token to pass to [`put`](Self::put). Read it before reading the store.
    pub fn generation(&self, phone: &PhoneNumber) -> u64 {
        self.generations[Self::shard(phone)].load(Ordering::Acquire)
    }

    /// Returns a verdict valid at `as_of`, or `None`. Entries that expired or
    /// were superseded by an invalidation are dropped on the way.
    pub async fn get(&self, phone: &PhoneNumber, as_of: DateTime<Utc>) -> Option<Arc<Verdict>> {
        if !self.enabled {
            return None;
        }
        let Some(cached) = self.entries.get(phone).await else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if cached.generation != self.generation(phone) {
            self.entries.invalidate(phone).await;
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if Utc::now() >= cached.expires_at {
            debug!(phone = %phone, "Evicting expired cached verdict");
            self.entries.invalidate(phone).await;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }
        if as_of < cached.verdict.checked_at || as_of >= cached.expires_at {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(cached.verdict)
    }

    /// Stores a verdict for `ttl` (capped at the configured maximum). Returns
    /// false when nothing was stored: caching disabled, zero TTL, or the
    /// number was invalidated after `generation` was taken.
    pub async fn put(&self, verdict: Arc<Verdict>, ttl: Duration, generation: u64) -> bool {
        if !self.enabled {
            return false;
        }
        let ttl = ttl.min(self.max_ttl);
        if ttl.is_zero() {
            return false;
        }
        let phone = verdict.phone_number.clone();
        if generation != self.generation(&phone) {
            debug!(phone = %phone, "Skipping cache write for superseded verdict");
            return false;
        }
        let Ok(ttl_chrono) = chrono::Duration::from_std(ttl) else {
            return false;
        };
        let expires_at = verdict.checked_at + ttl_chrono;

        self.record_ttl(ttl);
        self.entries
            .insert(
                phone,
                CachedVerdict {
                    verdict,
                    expires_at,
                    generation,
                },
            )
            .await;
        true
    }

    pub async fn invalidate(&self, phone: &PhoneNumber) {
        self.generations[Self::shard(phone)].fetch_add(1, Ordering::AcqRel);
        self.entries.invalidate(phone).await;
    }

    /// `"*"` clears everything; otherwise the pattern is a number prefix,
    /// optionally ending in `*`. Returns how many keys were removed.
    pub async fn clear(&self, pattern: &str) -> Result<u64> {
        let pattern = pattern.trim();
        if pattern.is_empty() {
            return Err(Error::validation("cache clear pattern is empty"));
        }

        if pattern == "*" {
            for generation in self.generations.iter() {
                generation.fetch_add(1, Ordering::AcqRel);
            }
            self.entries.run_pending_tasks().await;
            let removed = self.entries.entry_count();
            self.entries.invalidate_all();
            self.entries.run_pending_tasks().await;
            return Ok(removed);
        }

        let prefix = pattern.trim_end_matches('*');
        let keys: Vec<PhoneNumber> = self
            .entries
            .iter()
            .filter(|(key, _)| key.as_str().starts_with(prefix))
            .map(|(key, _)| (*key).clone())
            .collect();
        for key in &keys {
            self.invalidate(key).await;
        }
        self.entries.run_pending_tasks().await;
        Ok(keys.len() as u64)
    }

    pub async fn stats(&self) -> CacheStats {
        self.entries.run_pending_tasks().await;
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;
        let (hit_rate, miss_rate) = if total > 0 {
            (hits as f64 / total as f64, misses as f64 / total as f64)
        } else {
            (0.0, 0.0)
        };
        let ttl_distribution = TTL_BUCKETS
            .iter()
            .zip(self.ttl_buckets.iter())
            .map(|((label, _), count)| (label.to_string(), count.load(Ordering::Relaxed)))
            .collect();

        CacheStats {
            hits,
            misses,
            hit_rate,
            miss_rate,
            total_keys: self.entries.entry_count(),
            evictions: self.evictions.load(Ordering::Relaxed),
            ttl_distribution,
        }
    }

    fn record_ttl(&self, ttl: Duration) {
        let secs = ttl.as_secs();
        let idx = TTL_BUCKETS
            .iter()
            .position(|(_, upper)| secs < *upper)
            .unwrap_or(TTL_BUCKETS.len() - 1);
        self.ttl_buckets[idx].fetch_add(1, Ordering::Relaxed);
    }
}
