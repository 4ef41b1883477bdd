//! Persistence boundary for suppression entries and provider configuration.
//!
//! The engine only depends on the [`SuppressionStore`] contract:
//! - `insert_entry` is atomic with its duplicate check,
//! - `apply_sync` applies a whole change set or nothing,
//! - a write is visible to every read that starts after it returns.

mod memory;
mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{ListSource, PhoneNumber, Provider, SuppressionEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Default)]
pub struct EntryFilter {
    pub phone_number: Option<PhoneNumber>,
    pub sources: Option<Vec<ListSource>>,
    pub provider_id: Option<String>,
    /// Only entries added at or after this instant.
    pub added_since: Option<DateTime<Utc>>,
    /// When set, entries inactive at this instant are dropped.
    pub active_at: Option<DateTime<Utc>>,
    pub include_removed: bool,
    pub limit: Option<usize>,
}

impl EntryFilter {
    pub fn matches(&self, entry: &SuppressionEntry) -> bool {
        if let Some(phone) = &self.phone_number {
            if &entry.phone_number != phone {
                return false;
            }
        }
        if let Some(sources) = &self.sources {
            if !sources.contains(&entry.source) {
                return false;
            }
        }
        if let Some(provider_id) = &self.provider_id {
            if &entry.provider_id != provider_id {
                return false;
            }
        }
        if let Some(since) = self.added_since {
            if entry.added_at < since {
                return false;
            }
        }
        if !self.include_removed && entry.is_removed() {
            return false;
        }
        if let Some(as_of) = self.active_at {
            if !entry.is_active(as_of) {
                return false;
            }
        }
        true
    }
}

/// Changes produced by one provider sync, applied atomically.
#[derive(Debug, Clone, Default)]
pub struct SyncChangeSet {
    pub added: Vec<SuppressionEntry>,
    pub updated: Vec<SuppressionEntry>,
    /// Entry ids to soft-remove.
    pub removed: Vec<String>,
    pub removed_at: Option<DateTime<Utc>>,
    pub removed_by: String,
    pub removal_reason: String,
}

impl SyncChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty()
    }

    pub fn len(&self) -> usize {
        self.added.len() + self.updated.len() + self.removed.len()
    }
}

#[async_trait]
pub trait SuppressionStore: Send + Sync {
    /// Entries owned by `provider_id` for `phone` that are active at `as_of`.
    async fn active_entries(
        &self,
        phone: &PhoneNumber,
        provider_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SuppressionEntry>>;

    async fn get_entry(&self, id: &str) -> Result<Option<SuppressionEntry>>;

    /// Persists a new entry. Fails with `Conflict` when an entry for the same
    /// (phone number, source) is already active at `entry.added_at`.
    async fn insert_entry(&self, entry: &SuppressionEntry) -> Result<()>;

    /// Replaces a stored entry. Fails with `Conflict` when the change makes an
    /// inactive entry active while another entry for the same (phone number,
    /// source) is active.
    async fn update_entry(&self, entry: &SuppressionEntry) -> Result<()>;

    /// Hard delete. Returns whether a row existed.
    async fn delete_entry(&self, id: &str) -> Result<bool>;

    /// Every non-removed entry owned by a provider, used for sync diffs.
    async fn provider_entries(&self, provider_id: &str) -> Result<Vec<SuppressionEntry>>;

    async fn apply_sync(&self, provider_id: &str, changes: &SyncChangeSet) -> Result<()>;

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>>;

    async fn list_providers(&self) -> Result<Vec<Provider>>;

    async fn get_provider(&self, id: &str) -> Result<Option<Provider>>;

    async fn upsert_provider(&self, provider: &Provider) -> Result<()>;
}
