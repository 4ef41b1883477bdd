//! In-memory implementation of the suppression store.
//!
//! Used for tests and for deployments configured with `store.backend = "memory"`.
//! Entries live in an `FxHashMap` keyed by id, with a secondary index by
//! phone number so the hot read path never scans the whole table.

use super::{EntryFilter, SuppressionStore, SyncChangeSet};
use crate::error::{Error, Result};
use crate::model::{PhoneNumber, Provider, SuppressionEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;

#[derive(Default)]
struct Tables {
    entries: FxHashMap<String, SuppressionEntry>,
    by_phone: FxHashMap<PhoneNumber, Vec<String>>,
}

impl Tables {
    fn insert(&mut self, entry: SuppressionEntry) {
        let ids = self.by_phone.entry(entry.phone_number.clone()).or_default();
        if !ids.contains(&entry.id) {
            ids.push(entry.id.clone());
        }
        self.entries.insert(entry.id.clone(), entry);
    }

    fn remove(&mut self, id: &str) -> Option<SuppressionEntry> {
        let entry = self.entries.remove(id)?;
        if let Some(ids) = self.by_phone.get_mut(&entry.phone_number) {
            ids.retain(|i| i != id);
            if ids.is_empty() {
                self.by_phone.remove(&entry.phone_number);
            }
        }
        Some(entry)
    }

    fn for_phone<'a>(&'a self, phone: &PhoneNumber) -> impl Iterator<Item = &'a SuppressionEntry> {
        self.by_phone
            .get(phone)
            .into_iter()
            .flatten()
            .filter_map(|id| self.entries.get(id))
    }
}

/// A suppression store that keeps everything in process memory.
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
    providers: RwLock<FxHashMap<String, Provider>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entry_count(&self) -> usize {
        self.tables.read().entries.len()
    }
}

#[async_trait]
impl SuppressionStore for MemoryStore {
    async fn active_entries(
        &self,
        phone: &PhoneNumber,
        provider_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SuppressionEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .for_phone(phone)
            .filter(|e| e.provider_id == provider_id && e.is_active(as_of))
            .cloned()
            .collect())
    }

    async fn get_entry(&self, id: &str) -> Result<Option<SuppressionEntry>> {
        Ok(self.tables.read().entries.get(id).cloned())
    }

    async fn insert_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let mut tables = self.tables.write();
        if tables.entries.contains_key(&entry.id) {
            return Err(Error::conflict(format!("entry {} already exists", entry.id)));
        }
        if let Some(existing) = tables
            .for_phone(&entry.phone_number)
            .find(|e| e.source == entry.source && e.is_active(entry.added_at))
        {
            return Err(Error::conflict(format!(
                "{} already has an active {} suppression ({})",
                entry.phone_number, entry.source, existing.id
            )));
        }
        tables.insert(entry.clone());
        Ok(())
    }

    async fn update_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let mut tables = self.tables.write();
        let at = entry.updated_at;
        let reactivated = match tables.entries.get(&entry.id) {
            Some(stored) => !stored.is_active(at) && entry.is_active(at),
            None => return Err(Error::not_found("suppression entry", &entry.id)),
        };
        if reactivated {
            if let Some(existing) = tables.for_phone(&entry.phone_number).find(|e| {
                e.id != entry.id && e.source == entry.source && e.is_active(at)
            }) {
                return Err(Error::conflict(format!(
                    "{} already has an active {} suppression ({})",
                    entry.phone_number, entry.source, existing.id
                )));
            }
        }
        tables.insert(entry.clone());
        Ok(())
    }

    async fn delete_entry(&self, id: &str) -> Result<bool> {
        Ok(self.tables.write().remove(id).is_some())
    }

    async fn provider_entries(&self, provider_id: &str) -> Result<Vec<SuppressionEntry>> {
        let tables = self.tables.read();
        Ok(tables
            .entries
            .values()
            .filter(|e| e.provider_id == provider_id && !e.is_removed())
            .cloned()
            .collect())
    }

    async fn apply_sync(&self, provider_id: &str, changes: &SyncChangeSet) -> Result<()> {
        let mut tables = self.tables.write();

        // Validate everything before touching the tables so a bad change set
        // leaves the store as it was.
        for entry in changes.updated.iter() {
            match tables.entries.get(&entry.id) {
                Some(existing) if existing.provider_id == provider_id => {}
                _ => return Err(Error::not_found("suppression entry", &entry.id)),
            }
        }
        for id in &changes.removed {
            match tables.entries.get(id) {
                Some(existing) if existing.provider_id == provider_id => {}
                _ => return Err(Error::not_found("suppression entry", id)),
            }
        }

        for entry in changes.added.iter().chain(changes.updated.iter()) {
            tables.insert(entry.clone());
        }
        let removed_at = changes.removed_at.unwrap_or_else(Utc::now);
        for id in &changes.removed {
            if let Some(entry) = tables.entries.get_mut(id) {
                entry.removed_at = Some(removed_at);
                entry.removed_by = Some(changes.removed_by.clone());
                entry.removal_reason = Some(changes.removal_reason.clone());
                entry.updated_at = removed_at;
            }
        }
        Ok(())
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
        let tables = self.tables.read();
        let mut out: Vec<SuppressionEntry> = match &filter.phone_number {
            Some(phone) => tables
                .for_phone(phone)
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
            None => tables
                .entries
                .values()
                .filter(|e| filter.matches(e))
                .cloned()
                .collect(),
        };
        out.sort_by(|a, b| a.added_at.cmp(&b.added_at).then_with(|| a.id.cmp(&b.id)));
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        let mut list: Vec<Provider> = self.providers.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(list)
    }

    async fn get_provider(&self, id: &str) -> Result<Option<Provider>> {
        Ok(self.providers.read().get(id).cloned())
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<()> {
        self.providers
            .write()
            .insert(provider.id.clone(), provider.clone());
        Ok(())
    }
}
