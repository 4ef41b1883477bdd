//! Pure aggregation of matched entries into verdict fields.

use crate::model::{
    BlockingReason, ComplianceLevel, DecisionCode, Provider, Recommendation, Severity,
    SuppressionEntry,
};
use chrono::{DateTime, Utc};
use std::time::Duration;

pub fn blocking_reason(provider: &Provider, entry: &SuppressionEntry) -> BlockingReason {
    let mut description = entry.reason.description().to_string();
    if !entry.notes.trim().is_empty() {
        description.push_str(": ");
        description.push_str(entry.notes.trim());
    }
    BlockingReason {
        source: entry.source,
        reason: entry.reason,
        description,
        provider_id: provider.id.clone(),
        entry_id: entry.id.clone(),
        priority: provider.priority,
        severity: entry.severity(),
        compliance_code: entry.compliance_code(),
        added_at: entry.added_at,
        expires_at: entry.expires_at,
    }
}

/// Priority desc, severity desc, added_at asc, entry id. Total, so the order
/// is the same no matter which provider answered first.
pub fn order_reasons(reasons: &mut [BlockingReason]) {
    reasons.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| a.added_at.cmp(&b.added_at))
            .then_with(|| a.entry_id.cmp(&b.entry_id))
    });
}

/// `1 - prod(1 - w(severity))`, clamped to `[0, 1]`. Zero for no matches.
pub fn risk_score(reasons: &[BlockingReason]) -> f64 {
    let survive: f64 = reasons
        .iter()
        .map(|r| 1.0 - r.severity.weight())
        .product();
    (1.0 - survive).clamp(0.0, 1.0)
}

pub fn compliance_level(configured: ComplianceLevel, reasons: &[BlockingReason]) -> ComplianceLevel {
    reasons
        .iter()
        .map(|r| r.source.compliance_level())
        .fold(configured, Ord::max)
}

pub fn highest_severity(reasons: &[BlockingReason]) -> Option<Severity> {
    reasons.iter().map(|r| r.severity).max()
}

/// Distinct codes in reason order.
pub fn compliance_codes(reasons: &[BlockingReason]) -> Vec<String> {
    let mut codes: Vec<String> = Vec::with_capacity(reasons.len());
    for reason in reasons {
        if !codes.contains(&reason.compliance_code) {
            codes.push(reason.compliance_code.clone());
        }
    }
    codes
}

pub fn recommendation(decision: DecisionCode) -> Recommendation {
    match decision {
        DecisionCode::Blocked => Recommendation::DoNotCall,
        DecisionCode::Uncertain => Recommendation::ManualReview,
        DecisionCode::NotBlocked => Recommendation::Proceed,
    }
}

/// How long a verdict computed at `as_of` may be served: never past the
/// configured maximum, never past the first expiry among its entries.
pub fn verdict_ttl(max_ttl: Duration, reasons: &[BlockingReason], as_of: DateTime<Utc>) -> Duration {
    let Some(earliest) = reasons.iter().filter_map(|r| r.expires_at).min() else {
        return max_ttl;
    };
    match (earliest - as_of).to_std() {
        Ok(remaining) => remaining.min(max_ttl),
        Err(_) => Duration::ZERO,
    }
}
