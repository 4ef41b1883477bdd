use crate::model::{
    AuthType, CircuitState, ComplianceLevel, FeedFormat, ListSource, Provider, ProviderStatus,
    SyncType, CUSTOM_PROVIDER_ID, INTERNAL_PROVIDER_ID,
};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub breaker: BreakerConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub bulk: BulkConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub providers: Vec<ProviderConfig>,
}

/// What a check answers when it could not consult every source and found no match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailPolicy {
    /// Permit the call (`is_blocked = false`, decision `uncertain`).
    Open,
    /// Block the call (`is_blocked = true`, decision `uncertain`).
    Closed,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct EngineConfig {
    #[serde(default)]
    pub compliance_level: ComplianceLevel,
    /// No default; startup fails when unset.
    #[serde(default)]
    pub fail_policy: Option<FailPolicy>,
    #[serde(default = "default_check_timeout_ms")]
    pub check_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_enable")]
    pub enable: bool,
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_max_ttl")]
    pub max_ttl_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_enable")]
    pub enabled: bool,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_failure_window")]
    pub failure_window_sec: u64,
    #[serde(default = "default_open_timeout")]
    pub open_timeout_sec: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_enable")]
    pub enable: bool,
    #[serde(default = "default_tick_interval")]
    pub tick_interval_sec: u64,
    #[serde(default = "default_concurrent_syncs")]
    pub concurrent_syncs: usize,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    /// Above this many touched numbers a sync clears the whole decision cache.
    #[serde(default = "default_invalidate_all_threshold")]
    pub invalidate_all_threshold: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BulkConfig {
    #[serde(default = "default_max_batch")]
    pub max_batch: usize,
    #[serde(default = "default_bulk_workers")]
    pub workers: usize,
    #[serde(default = "default_bulk_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_enable")]
    pub enable: bool,
    #[serde(default = "default_log_blocked")]
    pub log_blocked: bool,
    #[serde(default = "default_log_all_checks")]
    pub log_all_checks: bool,
    #[serde(default = "default_log_format")]
    pub format: String,
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default = "default_decision_log_sinks")]
    pub decision_log_sinks: Vec<String>,
    #[serde(default = "default_memory_log_capacity")]
    pub memory_log_capacity: usize,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct StatsConfig {
    #[serde(default = "default_stats_enable")]
    pub enable: bool,
    #[serde(default = "default_log_interval")]
    pub log_interval_seconds: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProviderConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub source: ListSource,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default = "default_auth_type")]
    pub auth_type: AuthType,
    #[serde(default)]
    pub credential_env: Option<String>,
    #[serde(default)]
    pub priority: Option<u32>,
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_provider_timeout")]
    pub timeout_seconds: u64,
    #[serde(default = "default_rate_limit")]
    pub rate_limit_per_min: u32,
    #[serde(default = "default_update_frequency")]
    pub update_frequency_minutes: u64,
    #[serde(default)]
    pub sync_type: Option<SyncType>,
    #[serde(default = "default_feed_format")]
    pub feed_format: FeedFormat,
    #[serde(default = "default_provider_enabled")]
    pub enabled: bool,
}

// Defaults
fn default_check_timeout_ms() -> u64 {
    3000
}
fn default_cache_enable() -> bool {
    true
}
fn default_cache_capacity() -> u64 {
    100_000
}
fn default_max_ttl() -> u64 {
    300
}
fn default_breaker_enable() -> bool {
    true
}
fn default_failure_threshold() -> u32 {
    5
}
fn default_failure_window() -> u64 {
    600
}
fn default_open_timeout() -> u64 {
    300
}
fn default_sync_enable() -> bool {
    true
}
fn default_tick_interval() -> u64 {
    60
}
fn default_concurrent_syncs() -> usize {
    2
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_backoff_max_ms() -> u64 {
    15_000
}
fn default_invalidate_all_threshold() -> usize {
    1000
}
fn default_max_batch() -> usize {
    1000
}
fn default_bulk_workers() -> usize {
    16
}
fn default_bulk_timeout_ms() -> u64 {
    30_000
}
fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}
fn default_sqlite_path() -> String {
    "no-call.db".to_string()
}
fn default_log_enable() -> bool {
    true
}
fn default_log_blocked() -> bool {
    true
}
fn default_log_all_checks() -> bool {
    false
}
fn default_log_format() -> String {
    "text".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_decision_log_sinks() -> Vec<String> {
    vec!["console".to_string(), "memory".to_string()]
}
fn default_memory_log_capacity() -> usize {
    10_000
}
fn default_stats_enable() -> bool {
    true
}
fn default_log_interval() -> u64 {
    300
}
fn default_auth_type() -> AuthType {
    AuthType::None
}
fn default_retry_attempts() -> u32 {
    3
}
fn default_provider_timeout() -> u64 {
    30
}
fn default_rate_limit() -> u32 {
    60
}
fn default_update_frequency() -> u64 {
    24 * 60
}
fn default_feed_format() -> FeedFormat {
    FeedFormat::Json
}
fn default_provider_enabled() -> bool {
    true
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            compliance_level: ComplianceLevel::default(),
            fail_policy: None,
            check_timeout_ms: default_check_timeout_ms(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enable: default_cache_enable(),
            capacity: default_cache_capacity(),
            max_ttl_sec: default_max_ttl(),
        }
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            enabled: default_breaker_enable(),
            failure_threshold: default_failure_threshold(),
            failure_window_sec: default_failure_window(),
            open_timeout_sec: default_open_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            enable: default_sync_enable(),
            tick_interval_sec: default_tick_interval(),
            concurrent_syncs: default_concurrent_syncs(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            invalidate_all_threshold: default_invalidate_all_threshold(),
        }
    }
}

impl Default for BulkConfig {
    fn default() -> Self {
        Self {
            max_batch: default_max_batch(),
            workers: default_bulk_workers(),
            timeout_ms: default_bulk_timeout_ms(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            sqlite_path: default_sqlite_path(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enable: default_log_enable(),
            log_blocked: default_log_blocked(),
            log_all_checks: default_log_all_checks(),
            format: default_log_format(),
            level: default_log_level(),
            decision_log_sinks: default_decision_log_sinks(),
            memory_log_capacity: default_memory_log_capacity(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            enable: default_stats_enable(),
            log_interval_seconds: default_log_interval(),
        }
    }
}

impl BreakerConfig {
    pub fn failure_window(&self) -> Duration {
        Duration::from_secs(self.failure_window_sec)
    }

    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_sec)
    }
}

impl CacheConfig {
    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_sec)
    }
}

impl ProviderConfig {
    pub fn to_provider(&self) -> Provider {
        Provider {
            id: self.id.clone(),
            name: self.name.clone().unwrap_or_else(|| self.id.clone()),
            source: self.source,
            base_url: self.base_url.clone(),
            auth_type: self.auth_type,
            credential_env: self.credential_env.clone(),
            priority: self.priority.unwrap_or(self.source.default_priority()),
            retry_attempts: self.retry_attempts,
            timeout_seconds: self.timeout_seconds,
            rate_limit_per_min: self.rate_limit_per_min,
            update_frequency_minutes: self.update_frequency_minutes,
            sync_type: self.sync_type,
            feed_format: self.feed_format,
            enabled: self.enabled,
            status: if self.enabled {
                ProviderStatus::Active
            } else {
                ProviderStatus::Inactive
            },
            last_sync_at: None,
            next_sync_at: None,
            success_count: 0,
            error_count: 0,
            last_error: None,
            circuit_state: CircuitState::Closed,
            sync_token: None,
        }
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .await
            .context("Failed to read config file")?;
        let config: Config = toml::from_str(&contents).context("Failed to parse config TOML")?;
        Ok(config)
    }

    pub fn fail_policy(&self) -> Result<FailPolicy> {
        self.engine.fail_policy.context(
            "engine.fail_policy must be set explicitly to \"open\" or \"closed\"; \
             there is no default for this regulatory decision",
        )
    }

    pub fn validate(&self) -> Result<()> {
        self.fail_policy()?;

        if self.cache.enable && self.cache.capacity == 0 {
            bail!("cache.capacity must be greater than zero");
        }
        if self.bulk.max_batch == 0 || self.bulk.workers == 0 {
            bail!("bulk.max_batch and bulk.workers must be greater than zero");
        }
        if self.breaker.failure_threshold == 0 {
            bail!("breaker.failure_threshold must be greater than zero");
        }

        let mut seen = HashSet::new();
        for p in &self.providers {
            if p.id.trim().is_empty() {
                bail!("provider id must not be blank");
            }
            if p.id == INTERNAL_PROVIDER_ID || p.id == CUSTOM_PROVIDER_ID {
                bail!("provider id '{}' is reserved for the built-in list", p.id);
            }
            if !seen.insert(p.id.as_str()) {
                bail!("duplicate provider id '{}'", p.id);
            }
            if p.source == ListSource::Internal {
                bail!("provider '{}': internal lists are managed locally only", p.id);
            }
            if p.source.is_regulatory() && p.auth_type == AuthType::None {
                bail!(
                    "provider '{}': regulatory providers require an auth_type",
                    p.id
                );
            }
            if p.auth_type != AuthType::None && p.credential_env.is_none() {
                bail!("provider '{}': auth_type requires credential_env", p.id);
            }
            if let Some(url) = &p.base_url {
                url::Url::parse(url)
                    .with_context(|| format!("provider '{}': invalid base_url", p.id))?;
            }
        }
        Ok(())
    }

    /// Configured providers ordered by id, so registration order is deterministic.
    pub fn get_providers_sorted(&self) -> Vec<Provider> {
        let mut list: Vec<_> = self.providers.iter().map(|p| p.to_provider()).collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_require_fail_policy() {
        let config = Config::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.engine.fail_policy = Some(FailPolicy::Closed);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            [engine]
            fail_policy = "closed"
            compliance_level = "strict"

            [cache]
            max_ttl_sec = 120

            [[providers]]
            id = "ftc"
            source = "federal"
            base_url = "https://dnc.example.gov/v1/registry"
            auth_type = "api_key"
            credential_env = "FTC_API_KEY"
            sync_type = "full"

            [[providers]]
            id = "partner"
            source = "custom"
            base_url = "https://partner.example.com/suppressions.txt"
            feed_format = "lines"
            sync_type = "delta"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.engine.fail_policy, Some(FailPolicy::Closed));
        assert_eq!(config.engine.compliance_level, ComplianceLevel::Strict);
        assert_eq!(config.cache.max_ttl_sec, 120);
        assert_eq!(config.cache.capacity, 100_000);
        config.validate().unwrap();

        let providers = config.get_providers_sorted();
        assert_eq!(providers[0].id, "ftc");
        assert_eq!(providers[0].priority, 100);
        assert_eq!(providers[1].sync_type, Some(SyncType::Incremental));
        assert_eq!(providers[1].feed_format, FeedFormat::Lines);
    }

    #[test]
    fn test_rejects_regulatory_without_auth() {
        let toml_str = r#"
            [engine]
            fail_policy = "open"

            [[providers]]
            id = "state-tx"
            source = "state"
            base_url = "https://tx.example.gov/dnc"
        "#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_duplicate_and_reserved_ids() {
        let mut config = Config::default();
        config.engine.fail_policy = Some(FailPolicy::Open);
        let p: ProviderConfig =
            toml::from_str("id = \"internal\"\nsource = \"custom\"").unwrap();
        config.providers = vec![p];
        assert!(config.validate().is_err());

        let p: ProviderConfig = toml::from_str("id = \"a\"\nsource = \"custom\"").unwrap();
        config.providers = vec![p.clone(), p];
        assert!(config.validate().is_err());
    }
}
