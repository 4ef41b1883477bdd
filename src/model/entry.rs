use super::phone::PhoneNumber;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Where a suppression fact comes from.
///
/// The set is closed: behaviour that differs per source (mutability, sync
/// mode, default priority) hangs off the methods below instead of a trait
/// object hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListSource {
    Federal,
    State,
    Internal,
    Custom,
}

/// How a provider's feed is applied to the local store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncType {
    /// Fetch the complete remote set and diff it against local entries.
    Full,
    /// Apply changes since the stored continuation token.
    #[serde(alias = "delta")]
    Incremental,
}

impl ListSource {
    pub const ALL: [ListSource; 4] = [
        ListSource::Federal,
        ListSource::State,
        ListSource::Internal,
        ListSource::Custom,
    ];

    /// Regulatory data is a mirror of an upstream registry, never user-editable.
    pub fn is_regulatory(self) -> bool {
        matches!(self, ListSource::Federal | ListSource::State)
    }

    pub fn is_mutable(self) -> bool {
        !self.is_regulatory()
    }

    pub fn default_priority(self) -> u32 {
        match self {
            ListSource::Federal => 100,
            ListSource::State => 90,
            ListSource::Internal => 50,
            ListSource::Custom => 30,
        }
    }

    /// Default sync type for a provider of this kind, `None` when the source
    /// is only ever written locally.
    pub fn default_sync_type(self) -> Option<SyncType> {
        match self {
            ListSource::Federal | ListSource::State => Some(SyncType::Full),
            ListSource::Custom => Some(SyncType::Incremental),
            ListSource::Internal => None,
        }
    }

    pub fn compliance_level(self) -> ComplianceLevel {
        match self {
            ListSource::Federal | ListSource::State => ComplianceLevel::Strict,
            ListSource::Internal => ComplianceLevel::Standard,
            ListSource::Custom => ComplianceLevel::Relaxed,
        }
    }

    pub fn base_severity(self) -> Severity {
        match self {
            ListSource::Federal => Severity::Critical,
            ListSource::State => Severity::High,
            ListSource::Internal => Severity::Medium,
            ListSource::Custom => Severity::Low,
        }
    }

    /// Reason recorded for synced records whose feed does not carry one.
    pub fn default_reason(self) -> SuppressReason {
        match self {
            ListSource::Federal => SuppressReason::TcpaViolation,
            ListSource::State => SuppressReason::LegalRequirement,
            ListSource::Internal => SuppressReason::UserRequest,
            ListSource::Custom => SuppressReason::CompanyPolicy,
        }
    }

    pub fn code_prefix(self) -> &'static str {
        match self {
            ListSource::Federal => "DNC-FED",
            ListSource::State => "DNC-STATE",
            ListSource::Internal => "DNC-INT",
            ListSource::Custom => "DNC-CUSTOM",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ListSource::Federal => "federal",
            ListSource::State => "state",
            ListSource::Internal => "internal",
            ListSource::Custom => "custom",
        }
    }
}

impl fmt::Display for ListSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ListSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "federal" => Ok(ListSource::Federal),
            "state" => Ok(ListSource::State),
            "internal" => Ok(ListSource::Internal),
            "custom" => Ok(ListSource::Custom),
            other => Err(format!("unknown list source '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuppressReason {
    UserRequest,
    LegalRequirement,
    FraudPrevention,
    CompanyPolicy,
    TcpaViolation,
    GdprErasure,
}

impl SuppressReason {
    pub fn severity(self) -> Severity {
        match self {
            SuppressReason::TcpaViolation => Severity::Critical,
            SuppressReason::LegalRequirement
            | SuppressReason::GdprErasure
            | SuppressReason::FraudPrevention => Severity::High,
            SuppressReason::UserRequest => Severity::Medium,
            SuppressReason::CompanyPolicy => Severity::Low,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            SuppressReason::UserRequest => "USER-OPT-OUT",
            SuppressReason::LegalRequirement => "LEGAL",
            SuppressReason::FraudPrevention => "FRAUD",
            SuppressReason::CompanyPolicy => "POLICY",
            SuppressReason::TcpaViolation => "TCPA-227",
            SuppressReason::GdprErasure => "GDPR-ART17",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            SuppressReason::UserRequest => "consumer requested no further calls",
            SuppressReason::LegalRequirement => "suppression required by law or court order",
            SuppressReason::FraudPrevention => "number flagged for fraud prevention",
            SuppressReason::CompanyPolicy => "suppressed by company policy",
            SuppressReason::TcpaViolation => "TCPA do-not-call restriction",
            SuppressReason::GdprErasure => "GDPR erasure request",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SuppressReason::UserRequest => "user_request",
            SuppressReason::LegalRequirement => "legal_requirement",
            SuppressReason::FraudPrevention => "fraud_prevention",
            SuppressReason::CompanyPolicy => "company_policy",
            SuppressReason::TcpaViolation => "tcpa_violation",
            SuppressReason::GdprErasure => "gdpr_erasure",
        }
    }
}

impl FromStr for SuppressReason {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_request" => Ok(SuppressReason::UserRequest),
            "legal_requirement" => Ok(SuppressReason::LegalRequirement),
            "fraud_prevention" => Ok(SuppressReason::FraudPrevention),
            "company_policy" => Ok(SuppressReason::CompanyPolicy),
            "tcpa_violation" => Ok(SuppressReason::TcpaViolation),
            "gdpr_erasure" => Ok(SuppressReason::GdprErasure),
            other => Err(format!("unknown suppress reason '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Contribution of one matching entry to the risk score.
    pub fn weight(self) -> f64 {
        match self {
            Severity::Low => 0.10,
            Severity::Medium => 0.25,
            Severity::High => 0.45,
            Severity::Critical => 0.70,
        }
    }
}

/// Policy under which a check runs. Ordered from least to most conservative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceLevel {
    Relaxed,
    Standard,
    Strict,
}

impl Default for ComplianceLevel {
    fn default() -> Self {
        ComplianceLevel::Standard
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuppressionEntry {
    pub id: String,
    pub phone_number: PhoneNumber,
    pub source: ListSource,
    pub provider_id: String,
    pub reason: SuppressReason,
    pub added_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub source_reference: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub added_by: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub removed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub removed_by: Option<String>,
    #[serde(default)]
    pub removal_reason: Option<String>,
}

impl SuppressionEntry {
    pub fn new_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    pub fn is_expired(&self, as_of: DateTime<Utc>) -> bool {
        matches!(self.expires_at, Some(expires) if expires <= as_of)
    }

    pub fn is_removed(&self) -> bool {
        self.removed_at.is_some()
    }

    /// Only active entries contribute to a blocking decision.
    pub fn is_active(&self, as_of: DateTime<Utc>) -> bool {
        !self.is_removed() && !self.is_expired(as_of)
    }

    pub fn severity(&self) -> Severity {
        self.source.base_severity().max(self.reason.severity())
    }

    pub fn compliance_code(&self) -> String {
        format!("{}:{}", self.source.code_prefix(), self.reason.code())
    }
}
