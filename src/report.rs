//! Compliance reporting over stored entries and recent decisions.

use crate::engine::ProviderRegistry;
use crate::error::{Error, Result};
use crate::logger::{DecisionLogEntry, MemoryLogSink};
use crate::model::{DecisionCode, ListSource, ProviderStatusReport, SuppressReason};
use crate::stats::{StatsCollector, StatsSnapshot};
use crate::store::{EntryFilter, SuppressionStore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone)]
pub struct ReportCriteria {
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    /// Restrict entry aggregates to these sources.
    pub sources: Option<Vec<ListSource>>,
    /// Window for the "expiring soon" count, measured from `period_end`.
    pub expiring_within: Duration,
}

impl ReportCriteria {
    /// The last `days` days up to now.
    pub fn last_days(days: i64) -> Self {
        let now = Utc::now();
        Self {
            period_start: now - Duration::days(days),
            period_end: now,
            sources: None,
            expiring_within: Duration::days(7),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct EntrySummary {
    pub active: usize,
    pub by_source: BTreeMap<ListSource, usize>,
    pub by_reason: BTreeMap<SuppressReason, usize>,
    pub added_in_period: usize,
    pub removed_in_period: usize,
    pub expiring_soon: usize,
    pub permanent: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DecisionSummary {
    pub total: usize,
    pub blocked: usize,
    pub allowed: usize,
    pub uncertain: usize,
    pub cache_hit_rate: f64,
    pub average_risk: f64,
    pub blocks_by_source: BTreeMap<ListSource, usize>,
    /// False when the memory decision log is disabled; the counts are then zero.
    pub available: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
    pub entries: EntrySummary,
    pub decisions: DecisionSummary,
    pub providers: Vec<ProviderStatusReport>,
    pub stats: Option<StatsSnapshot>,
}

pub struct ComplianceReporter {
    store: Arc<dyn SuppressionStore>,
    registry: Arc<ProviderRegistry>,
    decisions: Option<MemoryLogSink>,
    stats: Option<Arc<StatsCollector>>,
}

impl ComplianceReporter {
    pub fn new(
        store: Arc<dyn SuppressionStore>,
        registry: Arc<ProviderRegistry>,
        decisions: Option<MemoryLogSink>,
        stats: Option<Arc<StatsCollector>>,
    ) -> Self {
        Self {
            store,
            registry,
            decisions,
            stats,
        }
    }

    pub async fn generate(&self, criteria: &ReportCriteria) -> Result<ComplianceReport> {
        if criteria.period_start >= criteria.period_end {
            return Err(Error::validation("report period_start must precede period_end"));
        }
        if criteria.expiring_within < Duration::zero() {
            return Err(Error::validation("expiring_within must not be negative"));
        }

        let entries = self
            .store
            .list_entries(&EntryFilter {
                sources: criteria.sources.clone(),
                include_removed: true,
                ..Default::default()
            })
            .await?;

        let end = criteria.period_end;
        let mut summary = EntrySummary::default();
        for entry in &entries {
            let in_period = |t: DateTime<Utc>| t >= criteria.period_start && t < end;
            if in_period(entry.added_at) {
                summary.added_in_period += 1;
            }
            if entry.removed_at.is_some_and(in_period) {
                summary.removed_in_period += 1;
            }
            if entry.added_at > end || !entry.is_active(end) {
                continue;
            }
            summary.active += 1;
            *summary.by_source.entry(entry.source).or_default() += 1;
            *summary.by_reason.entry(entry.reason).or_default() += 1;
            match entry.expires_at {
                None => summary.permanent += 1,
                Some(expires) if expires <= end + criteria.expiring_within => {
                    summary.expiring_soon += 1
                }
                Some(_) => {}
            }
        }

        let decisions = match &self.decisions {
            Some(sink) => summarize_decisions(
                sink.since(criteria.period_start)
                    .iter()
                    .filter(|e| e.timestamp < end),
            ),
            None => DecisionSummary::default(),
        };

        let providers = self
            .registry
            .snapshot()
            .iter()
            .map(|p| p.status_report())
            .collect();

        let report = ComplianceReport {
            generated_at: Utc::now(),
            period_start: criteria.period_start,
            period_end: end,
            entries: summary,
            decisions,
            providers,
            stats: self.stats.as_ref().map(|s| s.snapshot()),
        };
        info!(
            active = report.entries.active,
            decisions = report.decisions.total,
            "Compliance report generated"
        );
        Ok(report)
    }
}

fn summarize_decisions<'a>(entries: impl Iterator<Item = &'a DecisionLogEntry>) -> DecisionSummary {
    let mut summary = DecisionSummary {
        available: true,
        ..Default::default()
    };
    let mut hits = 0usize;
    let mut risk = 0.0;
    for entry in entries {
        summary.total += 1;
        risk += entry.risk_score;
        if entry.cache_hit {
            hits += 1;
        }
        match entry.decision {
            DecisionCode::Blocked => {
                summary.blocked += 1;
                for source in &entry.sources {
                    *summary.blocks_by_source.entry(*source).or_default() += 1;
                }
            }
            DecisionCode::NotBlocked => summary.allowed += 1,
            DecisionCode::Uncertain => summary.uncertain += 1,
        }
    }
    if summary.total > 0 {
        summary.cache_hit_rate = hits as f64 / summary.total as f64;
        summary.average_risk = risk / summary.total as f64;
    }
    summary
}
