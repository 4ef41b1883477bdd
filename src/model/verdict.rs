use super::entry::{ComplianceLevel, ListSource, Severity, SuppressReason};
use super::phone::PhoneNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Machine-readable outcome. Callers must treat `Uncertain` distinctly from
/// `NotBlocked`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionCode {
    NotBlocked,
    Blocked,
    Uncertain,
}

impl DecisionCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionCode::NotBlocked => "not_blocked",
            DecisionCode::Blocked => "blocked",
            DecisionCode::Uncertain => "uncertain",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Recommendation {
    Proceed,
    DoNotCall,
    ManualReview,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockingReason {
    pub source: ListSource,
    pub reason: SuppressReason,
    pub description: String,
    pub provider_id: String,
    pub entry_id: String,
    pub priority: u32,
    pub severity: Severity,
    pub compliance_code: String,
    pub added_at: DateTime<Utc>,
    /// `None` means permanent.
    pub expires_at: Option<DateTime<Utc>>,
}

impl BlockingReason {
    pub fn is_permanent(&self) -> bool {
        self.expires_at.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub phone_number: PhoneNumber,
    pub is_blocked: bool,
    pub can_call: bool,
    pub decision: DecisionCode,
    pub compliance_level: ComplianceLevel,
    pub risk_score: f64,
    pub reasons: Vec<BlockingReason>,
    pub highest_severity: Option<Severity>,
    pub recommendation: Recommendation,
    pub compliance_codes: Vec<String>,
    /// Provider ids whose local data was read successfully.
    pub sources_checked: Vec<String>,
    pub warnings: Vec<String>,
    pub cache_hit: bool,
    pub checked_at: DateTime<Utc>,
    pub as_of: DateTime<Utc>,
    pub ttl: Duration,
    pub check_duration: Duration,
}

impl Verdict {
    pub fn is_degraded(&self) -> bool {
        !self.warnings.is_empty()
    }

    /// Earliest expiry among the entries that produced this verdict.
    pub fn earliest_expiry(&self) -> Option<DateTime<Utc>> {
        self.reasons.iter().filter_map(|r| r.expires_at).min()
    }
}
