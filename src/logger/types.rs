use crate::model::{DecisionCode, ListSource, Severity, Verdict};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct DecisionLogEntry {
    pub timestamp: DateTime<Utc>,
    pub phone_number: String,
    pub decision: DecisionCode,
    pub is_blocked: bool,
    pub risk_score: f64,
    pub highest_severity: Option<Severity>,
    pub sources: Vec<ListSource>,
    pub compliance_codes: Vec<String>,
    pub cache_hit: bool,
    pub latency_us: u64,
    pub warnings: usize,
}

impl DecisionLogEntry {
    pub fn from_verdict(verdict: &Verdict) -> Self {
        let mut sources: Vec<ListSource> = verdict.reasons.iter().map(|r| r.source).collect();
        sources.sort();
        sources.dedup();
        Self {
            timestamp: Utc::now(),
            phone_number: verdict.phone_number.to_string(),
            decision: verdict.decision,
            is_blocked: verdict.is_blocked,
            risk_score: verdict.risk_score,
            highest_severity: verdict.highest_severity,
            sources,
            compliance_codes: verdict.compliance_codes.clone(),
            cache_hit: verdict.cache_hit,
            latency_us: verdict.check_duration.as_micros() as u64,
            warnings: verdict.warnings.len(),
        }
    }
}

pub trait DecisionLogSink: Send + Sync {
    fn log(&self, entry: &DecisionLogEntry);
}
