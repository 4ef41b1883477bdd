use super::entry::{ListSource, SyncType};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

pub const INTERNAL_PROVIDER_ID: &str = "internal";
pub const CUSTOM_PROVIDER_ID: &str = "custom";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    None,
    ApiKey,
    Oauth,
    Basic,
}

/// Wire shape of a provider feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedFormat {
    /// `{"records": [...], "next_token": "...", "complete": true}`
    Json,
    /// One E.164 number per line, `#` comments allowed.
    Lines,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderStatus {
    Active,
    Syncing,
    Error,
    Inactive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderHealth {
    Healthy,
    Degraded,
    Unhealthy,
    Disabled,
    Syncing,
    Error,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Provider {
    pub id: String,
    pub name: String,
    pub source: ListSource,
    pub base_url: Option<String>,
    pub auth_type: AuthType,
    /// Name of the environment variable holding the credential.
    pub credential_env: Option<String>,
    pub priority: u32,
    pub retry_attempts: u32,
    pub timeout_seconds: u64,
    pub rate_limit_per_min: u32,
    pub update_frequency_minutes: u64,
    pub sync_type: Option<SyncType>,
    pub feed_format: FeedFormat,
    pub enabled: bool,
    pub status: ProviderStatus,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub error_count: u64,
    pub last_error: Option<String>,
    pub circuit_state: CircuitState,
    /// Continuation token for incremental syncs.
    pub sync_token: Option<String>,
}

impl Provider {
    /// The always-on locally managed lists (`internal`, `custom`).
    pub fn builtin(source: ListSource) -> Self {
        let (id, source) = match source {
            ListSource::Custom => (CUSTOM_PROVIDER_ID, ListSource::Custom),
            _ => (INTERNAL_PROVIDER_ID, ListSource::Internal),
        };
        Self {
            id: id.to_string(),
            name: format!("{} suppression list", id),
            source,
            base_url: None,
            auth_type: AuthType::None,
            credential_env: None,
            priority: source.default_priority(),
            retry_attempts: 0,
            timeout_seconds: 0,
            rate_limit_per_min: 0,
            update_frequency_minutes: 0,
            sync_type: None,
            feed_format: FeedFormat::Json,
            enabled: true,
            status: ProviderStatus::Active,
            last_sync_at: None,
            next_sync_at: None,
            success_count: 0,
            error_count: 0,
            last_error: None,
            circuit_state: CircuitState::Closed,
            sync_token: None,
        }
    }

    pub fn is_builtin(&self) -> bool {
        self.id == INTERNAL_PROVIDER_ID || self.id == CUSTOM_PROVIDER_ID
    }

    pub fn has_remote_feed(&self) -> bool {
        self.base_url.is_some()
    }

    pub fn effective_sync_type(&self) -> SyncType {
        self.sync_type
            .or(self.source.default_sync_type())
            .unwrap_or(SyncType::Full)
    }

    pub fn update_frequency(&self) -> Duration {
        Duration::from_secs(self.update_frequency_minutes * 60)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }

    /// Fraction of successful syncs. A provider that never synced counts as healthy.
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.error_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn health(&self) -> ProviderHealth {
        if !self.enabled {
            return ProviderHealth::Disabled;
        }
        match self.status {
            ProviderStatus::Syncing => ProviderHealth::Syncing,
            ProviderStatus::Error => ProviderHealth::Error,
            ProviderStatus::Inactive => ProviderHealth::Inactive,
            ProviderStatus::Active => {
                let rate = self.success_rate();
                if rate >= 0.95 {
                    ProviderHealth::Healthy
                } else if rate >= 0.80 {
                    ProviderHealth::Degraded
                } else {
                    ProviderHealth::Unhealthy
                }
            }
        }
    }

    pub fn status_report(&self) -> ProviderStatusReport {
        ProviderStatusReport {
            provider_id: self.id.clone(),
            name: self.name.clone(),
            source: self.source,
            health: self.health(),
            status: self.status,
            circuit_state: self.circuit_state,
            success_rate: self.success_rate(),
            success_count: self.success_count,
            error_count: self.error_count,
            last_sync_at: self.last_sync_at,
            next_sync_at: self.next_sync_at,
            last_error: self.last_error.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ProviderStatusReport {
    pub provider_id: String,
    pub name: String,
    pub source: ListSource,
    pub health: ProviderHealth,
    pub status: ProviderStatus,
    pub circuit_state: CircuitState,
    pub success_rate: f64,
    pub success_count: u64,
    pub error_count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub next_sync_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}
