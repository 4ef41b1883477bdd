//! Single-number suppression checks.

use super::aggregate;
use super::breaker::BreakerRegistry;
use super::cache::DecisionCache;
use super::registry::ProviderRegistry;
use crate::config::{Config, FailPolicy};
use crate::error::{Error, Result};
use crate::logger::DecisionLogger;
use crate::model::{
    CircuitState, ComplianceLevel, DecisionCode, ListSource, PhoneNumber, Provider, Verdict,
};
use crate::stats::StatsCollector;
use crate::store::SuppressionStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    pub compliance_level: ComplianceLevel,
    pub fail_policy: FailPolicy,
    pub check_timeout: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self {
            compliance_level: config.engine.compliance_level,
            fail_policy: config.fail_policy()?,
            check_timeout: Duration::from_millis(config.engine.check_timeout_ms.max(1)),
        })
    }
}

/// Per-call knobs. The default is a present-time check across every enabled
/// provider with the engine's timeout.
#[derive(Debug, Clone, Default)]
pub struct CheckOptions {
    /// Evaluate as of this instant instead of now.
    pub as_of: Option<DateTime<Utc>>,
    /// Restrict the check to these sources. Partial checks bypass the cache.
    pub sources: Option<Vec<ListSource>>,
    /// Overrides the engine timeout; the shorter of the two applies.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl CheckOptions {
    pub fn as_of(mut self, as_of: DateTime<Utc>) -> Self {
        self.as_of = Some(as_of);
        self
    }

    pub fn sources(mut self, sources: Vec<ListSource>) -> Self {
        self.sources = Some(sources);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_partial(&self) -> bool {
        self.sources.is_some()
    }
}

pub struct DecisionEngine {
    store: Arc<dyn SuppressionStore>,
    registry: Arc<ProviderRegistry>,
    breakers: Arc<BreakerRegistry>,
    cache: Arc<DecisionCache>,
    settings: EngineSettings,
    stats: Option<Arc<StatsCollector>>,
    logger: Option<Arc<DecisionLogger>>,
}

impl DecisionEngine {
    pub fn new(
        store: Arc<dyn SuppressionStore>,
        registry: Arc<ProviderRegistry>,
        breakers: Arc<BreakerRegistry>,
        cache: Arc<DecisionCache>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            registry,
            breakers,
            cache,
            settings,
            stats: None,
            logger: None,
        }
    }

    pub fn with_stats(mut self, stats: Arc<StatsCollector>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn with_logger(mut self, logger: Arc<DecisionLogger>) -> Self {
        self.logger = Some(logger);
        self
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    /// Parses `input` and checks it. Malformed numbers fail with `Validation`.
    pub async fn check_str(&self, input: &str, options: CheckOptions) -> Result<Verdict> {
        let phone = PhoneNumber::parse(input)?;
        self.check(&phone, options).await
    }

    pub async fn check(&self, phone: &PhoneNumber, options: CheckOptions) -> Result<Verdict> {
        let start = Instant::now();
        let timeout = options
            .timeout
            .map(|t| t.min(self.settings.check_timeout))
            .unwrap_or(self.settings.check_timeout);
        let cancel = options.cancel.clone().unwrap_or_default();

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(Error::Cancelled("check")),
            outcome = tokio::time::timeout(timeout, self.evaluate(phone, &options, start)) => {
                match outcome {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        operation: "check",
                        elapsed_ms: start.elapsed().as_millis() as u64,
                    }),
                }
            }
        };

        match &result {
            Ok(verdict) => {
                if let Some(stats) = &self.stats {
                    stats.record_verdict(verdict);
                }
                if let Some(logger) = &self.logger {
                    logger.log_verdict(verdict);
                }
            }
            Err(e) => {
                if let Some(stats) = &self.stats {
                    stats.inc_check_error();
                }
                warn!(phone = %phone, code = e.code(), "Check failed: {}", e);
            }
        }
        result
    }

    async fn evaluate(
        &self,
        phone: &PhoneNumber,
        options: &CheckOptions,
        start: Instant,
    ) -> Result<Verdict> {
        let now = Utc::now();
        let as_of = options.as_of.unwrap_or(now);
        let use_cache = !options.is_partial();

        if use_cache {
            if let Some(cached) = self.cache.get(phone, as_of).await {
                let mut verdict = (*cached).clone();
                verdict.cache_hit = true;
                verdict.check_duration = start.elapsed();
                return Ok(verdict);
            }
        }

        // Taken before any store read: an invalidation racing with this
        // check makes the later cache write a no-op.
        let generation = self.cache.generation(phone);

        let providers: Vec<Arc<Provider>> = self
            .registry
            .enabled()
            .into_iter()
            .filter(|p| match &options.sources {
                Some(sources) => sources.contains(&p.source),
                None => true,
            })
            .collect();

        let reads = join_all(providers.iter().map(|provider| async move {
            let result = self.store.active_entries(phone, &provider.id, as_of).await;
            (provider.clone(), result)
        }))
        .await;

        let mut reasons = Vec::new();
        let mut sources_checked = Vec::with_capacity(providers.len());
        let mut warnings = Vec::new();
        let mut unreadable = 0usize;

        for (provider, result) in reads {
            match result {
                Ok(entries) => {
                    let circuit = self.breakers.state(&provider.id);
                    if circuit != CircuitState::Closed {
                        warnings.push(format!(
                            "provider '{}' circuit {}; using last synced data",
                            provider.id, circuit
                        ));
                    }
                    sources_checked.push(provider.id.clone());
                    reasons.extend(
                        entries
                            .iter()
                            .filter(|e| match &options.sources {
                                Some(sources) => sources.contains(&e.source),
                                None => true,
                            })
                            .map(|e| aggregate::blocking_reason(&provider, e)),
                    );
                }
                Err(e) => {
                    warn!(provider = %provider.id, phone = %phone, "Provider read failed: {}", e);
                    warnings.push(format!("provider '{}' unavailable: {}", provider.id, e.code()));
                    unreadable += 1;
                }
            }
        }

        aggregate::order_reasons(&mut reasons);

        let decision = if !reasons.is_empty() {
            DecisionCode::Blocked
        } else if unreadable > 0 {
            DecisionCode::Uncertain
        } else {
            DecisionCode::NotBlocked
        };
        let is_blocked = match decision {
            DecisionCode::Blocked => true,
            DecisionCode::NotBlocked => false,
            DecisionCode::Uncertain => self.settings.fail_policy == FailPolicy::Closed,
        };

        let ttl = match decision {
            DecisionCode::Uncertain => Duration::ZERO,
            _ => aggregate::verdict_ttl(self.cache.max_ttl(), &reasons, as_of),
        };

        let mut verdict = Verdict {
            phone_number: phone.clone(),
            is_blocked,
            can_call: !is_blocked,
            decision,
            compliance_level: aggregate::compliance_level(self.settings.compliance_level, &reasons),
            risk_score: aggregate::risk_score(&reasons),
            highest_severity: aggregate::highest_severity(&reasons),
            recommendation: aggregate::recommendation(decision),
            compliance_codes: aggregate::compliance_codes(&reasons),
            reasons,
            sources_checked,
            warnings,
            cache_hit: false,
            checked_at: now,
            as_of,
            ttl,
            check_duration: Duration::ZERO,
        };

        // Only full, present-time, definitive answers are cached.
        if use_cache && options.as_of.is_none() && decision != DecisionCode::Uncertain {
            let stored = self
                .cache
                .put(Arc::new(verdict.clone()), ttl, generation)
                .await;
            debug!(phone = %phone, cached = stored, ttl_ms = ttl.as_millis() as u64, "Verdict computed");
        }

        verdict.check_duration = start.elapsed();
        Ok(verdict)
    }
}
