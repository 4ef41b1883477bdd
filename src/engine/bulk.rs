//! Batch evaluation with bounded parallelism.

use super::decision::{CheckOptions, DecisionEngine};
use crate::config::BulkConfig;
use crate::error::{Error, Result};
use crate::model::{DecisionCode, ListSource, PhoneNumber, Severity, Verdict};
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::info;

#[derive(Debug, Clone, Copy)]
pub struct BulkSettings {
    pub max_batch: usize,
    pub workers: usize,
    pub deadline: Duration,
}

impl From<&BulkConfig> for BulkSettings {
    fn from(config: &BulkConfig) -> Self {
        Self {
            max_batch: config.max_batch.max(1),
            workers: config.workers.max(1),
            deadline: Duration::from_millis(config.timeout_ms.max(1)),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemResult {
    pub index: usize,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkItemError {
    pub index: usize,
    pub input: String,
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BulkSummary {
    pub total: usize,
    pub evaluated: usize,
    pub failed: usize,
    pub blocked: usize,
    pub allowed: usize,
    pub uncertain: usize,
    pub average_risk: f64,
    pub by_source: BTreeMap<ListSource, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub cache_hits: usize,
    pub total_duration: Duration,
    pub average_check_duration: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct BulkResult {
    /// Successful verdicts ordered by input position.
    pub results: Vec<BulkItemResult>,
    /// Per-item failures ordered by input position.
    pub errors: Vec<BulkItemError>,
    pub summary: BulkSummary,
}

pub struct BulkEvaluator {
    engine: Arc<DecisionEngine>,
    settings: BulkSettings,
}

impl BulkEvaluator {
    pub fn new(engine: Arc<DecisionEngine>, settings: BulkSettings) -> Self {
        Self { engine, settings }
    }

    pub async fn check_bulk(
        &self,
        numbers: &[String],
        as_of: Option<DateTime<Utc>>,
        cancel: Option<CancellationToken>,
    ) -> Result<BulkResult> {
        if numbers.is_empty() || numbers.len() > self.settings.max_batch {
            return Err(Error::validation(format!(
                "batch size must be between 1 and {}, got {}",
                self.settings.max_batch,
                numbers.len()
            )));
        }

        let start = Instant::now();
        let deadline = start + self.settings.deadline;
        let cancel = cancel.unwrap_or_default();

        let mut errors = Vec::new();
        let mut parsed = Vec::with_capacity(numbers.len());
        for (index, input) in numbers.iter().enumerate() {
            match PhoneNumber::parse(input) {
                Ok(phone) => parsed.push((index, phone)),
                Err(e) => errors.push(item_error(index, input, &e)),
            }
        }

        let engine = &self.engine;
        let outcomes: Vec<(usize, Result<Verdict>)> = stream::iter(parsed)
            .map(|(index, phone)| {
                let cancel = cancel.clone();
                async move {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return (
                            index,
                            Err(Error::Timeout {
                                operation: "bulk check",
                                elapsed_ms: start.elapsed().as_millis() as u64,
                            }),
                        );
                    }
                    let mut options = CheckOptions::default().timeout(remaining).cancel(cancel);
                    options.as_of = as_of;
                    (index, engine.check(&phone, options).await)
                }
            })
            .buffer_unordered(self.settings.workers)
            .collect()
            .await;

        let mut results = Vec::with_capacity(outcomes.len());
        for (index, outcome) in outcomes {
            match outcome {
                Ok(verdict) => results.push(BulkItemResult { index, verdict }),
                Err(e) => errors.push(item_error(index, &numbers[index], &e)),
            }
        }
        results.sort_by_key(|r| r.index);
        errors.sort_by_key(|e| e.index);

        let summary = summarize(numbers.len(), &results, errors.len(), start.elapsed());
        info!(
            total = summary.total,
            blocked = summary.blocked,
            uncertain = summary.uncertain,
            failed = summary.failed,
            duration_ms = summary.total_duration.as_millis() as u64,
            "Bulk check complete"
        );

        Ok(BulkResult {
            results,
            errors,
            summary,
        })
    }
}

fn item_error(index: usize, input: &str, error: &Error) -> BulkItemError {
    BulkItemError {
        index,
        input: input.to_string(),
        code: error.code(),
        message: error.public_message(),
    }
}

fn summarize(
    total: usize,
    results: &[BulkItemResult],
    failed: usize,
    elapsed: Duration,
) -> BulkSummary {
    let mut summary = BulkSummary {
        total,
        evaluated: results.len(),
        failed,
        total_duration: elapsed,
        ..Default::default()
    };

    let mut risk_sum = 0.0;
    let mut check_time = Duration::ZERO;
    for item in results {
        let verdict = &item.verdict;
        match verdict.decision {
            DecisionCode::Blocked => summary.blocked += 1,
            DecisionCode::NotBlocked => summary.allowed += 1,
            DecisionCode::Uncertain => summary.uncertain += 1,
        }
        if verdict.cache_hit {
            summary.cache_hits += 1;
        }
        risk_sum += verdict.risk_score;
        check_time += verdict.check_duration;

        let mut sources: Vec<ListSource> = verdict.reasons.iter().map(|r| r.source).collect();
        sources.sort();
        sources.dedup();
        for source in sources {
            *summary.by_source.entry(source).or_default() += 1;
        }
        if let Some(severity) = verdict.highest_severity {
            *summary.by_severity.entry(severity).or_default() += 1;
        }
    }

    if !results.is_empty() {
        summary.average_risk = risk_sum / results.len() as f64;
        summary.average_check_duration = check_time / results.len() as u32;
    }
    summary
}
