//! Per-provider circuit breakers gating sync attempts.
//!
//! ```text
//!   closed ──(threshold failures within window)──► open
//!     ▲                                             │
//!     │ trial succeeds                 open_timeout │
//!     │                                             ▼
//!     └──────────────────────────────────────── half-open
//!                  trial fails: back to open, timeout restarted
//! ```
//!
//! Only sync attempts go through the breaker. The decision engine reads the
//! breaker state to annotate verdicts but never fails a check because of it.

use crate::config::BreakerConfig;
use crate::model::CircuitState;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct BreakerSettings {
    pub enabled: bool,
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub open_timeout: Duration,
}

impl From<&BreakerConfig> for BreakerSettings {
    fn from(config: &BreakerConfig) -> Self {
        Self {
            enabled: config.enabled,
            failure_threshold: config.failure_threshold.max(1),
            failure_window: config.failure_window(),
            open_timeout: config.open_timeout(),
        }
    }
}

impl Default for BreakerSettings {
    fn default() -> Self {
        (&BreakerConfig::default()).into()
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    /// Failure instants inside the rolling window (closed state only).
    failures: VecDeque<Instant>,
    opened_at: Option<Instant>,
    /// Set while the single half-open trial is running.
    trial_in_flight: bool,
    last_transition: Instant,
    total_successes: u64,
    total_failures: u64,
    total_rejections: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: CircuitState,
    pub recent_failures: usize,
    pub total_successes: u64,
    pub total_failures: u64,
    pub total_rejections: u64,
    /// Time left before an open breaker admits a trial.
    pub retry_in_ms: Option<u64>,
    pub since_transition_ms: u64,
}

pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    /// Mirror of `inner.state` for lock-free reads on the check path.
    published: AtomicU8,
    inner: Mutex<BreakerInner>,
}

fn encode(state: CircuitState) -> u8 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::Open => 1,
        CircuitState::HalfOpen => 2,
    }
}

fn decode(raw: u8) -> CircuitState {
    match raw {
        1 => CircuitState::Open,
        2 => CircuitState::HalfOpen,
        _ => CircuitState::Closed,
    }
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        Self {
            name: name.into(),
            settings,
            published: AtomicU8::new(encode(CircuitState::Closed)),
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: VecDeque::new(),
                opened_at: None,
                trial_in_flight: false,
                last_transition: Instant::now(),
                total_successes: 0,
                total_failures: 0,
                total_rejections: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state. An open breaker whose timeout has elapsed still reports
    /// `Open` until an attempt actually claims the trial.
    pub fn state(&self) -> CircuitState {
        decode(self.published.load(Ordering::Acquire))
    }

    fn transition(&self, inner: &mut BreakerInner, state: CircuitState, now: Instant) {
        inner.state = state;
        inner.last_transition = now;
        self.published.store(encode(state), Ordering::Release);
    }

    /// Asks permission for one attempt. In half-open exactly one caller gets
    /// `true` until its outcome is recorded.
    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(Instant::now())
    }

    pub(crate) fn try_acquire_at(&self, now: Instant) -> bool {
        if !self.settings.enabled {
            return true;
        }
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|t| now.saturating_duration_since(t))
                    .unwrap_or(self.settings.open_timeout);
                if elapsed >= self.settings.open_timeout {
                    info!(provider = %self.name, "Circuit breaker half-open, admitting trial");
                    inner.trial_in_flight = true;
                    self.transition(&mut inner, CircuitState::HalfOpen, now);
                    true
                } else {
                    inner.total_rejections += 1;
                    debug!(
                        provider = %self.name,
                        remaining_ms = (self.settings.open_timeout - elapsed).as_millis() as u64,
                        "Circuit breaker open, rejecting attempt"
                    );
                    false
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    false
                } else {
                    inner.trial_in_flight = true;
                    true
                }
            }
        }
    }

    pub fn record_success(&self) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.total_successes += 1;
        inner.failures.clear();
        if inner.state != CircuitState::Closed {
            info!(provider = %self.name, from = %inner.state, "Circuit breaker closed");
            inner.opened_at = None;
            inner.trial_in_flight = false;
            self.transition(&mut inner, CircuitState::Closed, Instant::now());
        }
    }

    pub fn record_failure(&self) {
        self.record_failure_at(Instant::now())
    }

    pub(crate) fn record_failure_at(&self, now: Instant) {
        if !self.settings.enabled {
            return;
        }
        let mut inner = self.inner.lock();
        inner.total_failures += 1;
        match inner.state {
            CircuitState::HalfOpen => {
                warn!(provider = %self.name, "Trial failed, circuit breaker re-opened");
                self.open(&mut inner, now);
            }
            CircuitState::Open => {
                // Late outcome from an attempt admitted before opening.
            }
            CircuitState::Closed => {
                let window = self.settings.failure_window;
                while let Some(&oldest) = inner.failures.front() {
                    if now.saturating_duration_since(oldest) > window {
                        inner.failures.pop_front();
                    } else {
                        break;
                    }
                }
                inner.failures.push_back(now);
                if inner.failures.len() >= self.settings.failure_threshold as usize {
                    warn!(
                        provider = %self.name,
                        failures = inner.failures.len(),
                        "Failure threshold reached, circuit breaker opened"
                    );
                    self.open(&mut inner, now);
                }
            }
        }
    }

    /// Gives back a half-open trial that ended without an outcome, e.g. a
    /// cancelled sync. The next attempt may claim it.
    pub fn release_trial(&self) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen {
            inner.trial_in_flight = false;
        }
    }

    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        info!(provider = %self.name, from = %inner.state, "Circuit breaker manually reset");
        inner.failures.clear();
        inner.opened_at = None;
        inner.trial_in_flight = false;
        self.transition(&mut inner, CircuitState::Closed, Instant::now());
    }

    pub fn stats(&self) -> BreakerStats {
        let inner = self.inner.lock();
        let retry_in_ms = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened_at)) => Some(
                self.settings
                    .open_timeout
                    .saturating_sub(opened_at.elapsed())
                    .as_millis() as u64,
            ),
            _ => None,
        };
        BreakerStats {
            state: inner.state,
            recent_failures: inner.failures.len(),
            total_successes: inner.total_successes,
            total_failures: inner.total_failures,
            total_rejections: inner.total_rejections,
            retry_in_ms,
            since_transition_ms: inner.last_transition.elapsed().as_millis() as u64,
        }
    }

    fn open(&self, inner: &mut BreakerInner, now: Instant) {
        inner.opened_at = Some(now);
        inner.trial_in_flight = false;
        inner.failures.clear();
        self.transition(inner, CircuitState::Open, now);
    }
}

/// Breakers keyed by provider id, created on first use.
pub struct BreakerRegistry {
    settings: BreakerSettings,
    breakers: RwLock<FxHashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    pub fn new(settings: BreakerSettings) -> Self {
        Self {
            settings,
            breakers: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, provider_id: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(provider_id) {
            return breaker.clone();
        }
        self.breakers
            .write()
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(provider_id, self.settings)))
            .clone()
    }

    /// State without creating a breaker for unknown providers.
    pub fn state(&self, provider_id: &str) -> CircuitState {
        self.breakers
            .read()
            .get(provider_id)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    pub fn reset(&self, provider_id: &str) {
        self.get(provider_id).reset();
    }

    pub fn snapshot(&self) -> Vec<(String, BreakerStats)> {
        let mut out: Vec<_> = self
            .breakers
            .read()
            .iter()
            .map(|(id, b)| (id.clone(), b.stats()))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings(threshold: u32) -> BreakerSettings {
        BreakerSettings {
            enabled: true,
            failure_threshold: threshold,
            failure_window: Duration::from_secs(60),
            open_timeout: Duration::from_secs(30),
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let cb = CircuitBreaker::new("ftc", settings(3));
        let now = Instant::now();
        cb.record_failure_at(now);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure_at(now);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire_at(now + Duration::from_secs(1)));
    }

    #[test]
    fn test_success_resets_failure_count() {
        let cb = CircuitBreaker::new("ftc", settings(2));
        cb.record_failure();
        cb.record_success();
        cb.record_failure();
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_failures_outside_window_do_not_count() {
        let cb = CircuitBreaker::new("ftc", settings(2));
        let start = Instant::now();
        cb.record_failure_at(start);
        cb.record_failure_at(start + Duration::from_secs(61));
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_exactly_one_half_open_trial() {
        let cb = CircuitBreaker::new("ftc", settings(1));
        let start = Instant::now();
        cb.record_failure_at(start);
        assert_eq!(cb.state(), CircuitState::Open);

        let later = start + Duration::from_secs(31);
        assert!(cb.try_acquire_at(later));
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(!cb.try_acquire_at(later));

        cb.record_success();
        assert_eq!(cb.state(), CircuitState::Closed);
        assert!(cb.try_acquire_at(later));
    }

    #[test]
    fn test_failed_trial_restarts_timeout() {
        let cb = CircuitBreaker::new("ftc", settings(1));
        let start = Instant::now();
        cb.record_failure_at(start);
        let trial = start + Duration::from_secs(31);
        assert!(cb.try_acquire_at(trial));
        cb.record_failure_at(trial);
        assert_eq!(cb.state(), CircuitState::Open);
        assert!(!cb.try_acquire_at(trial + Duration::from_secs(29)));
        assert!(cb.try_acquire_at(trial + Duration::from_secs(30)));
    }

    #[test]
    fn test_state_read_matches_locked_state() {
        let cb = CircuitBreaker::new("ftc", settings(1));
        let start = Instant::now();
        let agrees = |cb: &CircuitBreaker| assert_eq!(cb.state(), cb.stats().state);

        cb.record_failure_at(start);
        agrees(&cb);
        cb.try_acquire_at(start + Duration::from_secs(31));
        agrees(&cb);
        cb.release_trial();
        agrees(&cb);
        cb.record_success();
        agrees(&cb);
        cb.record_failure();
        agrees(&cb);
        assert_eq!(cb.state(), CircuitState::Open);
        cb.reset();
        agrees(&cb);
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_released_trial_can_be_claimed_again() {
        let cb = CircuitBreaker::new("ftc", settings(1));
        let start = Instant::now();
        cb.record_failure_at(start);
        let later = start + Duration::from_secs(31);
        assert!(cb.try_acquire_at(later));
        assert!(!cb.try_acquire_at(later));
        cb.release_trial();
        assert_eq!(cb.state(), CircuitState::HalfOpen);
        assert!(cb.try_acquire_at(later));
    }

    #[test]
    fn test_disabled_breaker_always_allows() {
        let mut s = settings(1);
        s.enabled = false;
        let cb = CircuitBreaker::new("ftc", s);
        cb.record_failure();
        cb.record_failure();
        assert!(cb.try_acquire());
        assert_eq!(cb.state(), CircuitState::Closed);
    }

    #[test]
    fn test_registry_reset() {
        let registry = BreakerRegistry::new(settings(1));
        registry.get("ftc").record_failure();
        assert_eq!(registry.state("ftc"), CircuitState::Open);
        registry.reset("ftc");
        assert_eq!(registry.state("ftc"), CircuitState::Closed);
        assert_eq!(registry.state("unknown"), CircuitState::Closed);
    }
}
