//! Administrative writes to the locally managed lists.
//!
//! Every successful write invalidates the number in the decision cache
//! before returning, so a check issued after the call observes it.

use super::cache::DecisionCache;
use crate::error::{Error, Result};
use crate::model::{
    ListSource, Metadata, PhoneNumber, Provider, SuppressReason, SuppressionEntry,
};
use crate::store::{EntryFilter, SuppressionStore};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct AddSuppression {
    pub phone_number: String,
    pub source: ListSource,
    pub reason: SuppressReason,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub source_reference: Option<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub metadata: Metadata,
    pub added_by: String,
}

/// Patch for an existing entry. `None` leaves a field untouched; for the
/// optional fields `Some(None)` clears the value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSuppression {
    #[serde(default)]
    pub expires_at: Option<Option<DateTime<Utc>>>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub source_reference: Option<Option<String>>,
    #[serde(default)]
    pub metadata: Option<Metadata>,
}

impl UpdateSuppression {
    fn is_empty(&self) -> bool {
        self.expires_at.is_none()
            && self.notes.is_none()
            && self.source_reference.is_none()
            && self.metadata.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoveSuppression {
    pub reason: String,
    pub removed_by: String,
    /// Delete the row instead of marking it removed.
    #[serde(default)]
    pub hard: bool,
}

pub struct SuppressionAdmin {
    store: Arc<dyn SuppressionStore>,
    cache: Arc<DecisionCache>,
}

fn ensure_mutable(source: ListSource) -> Result<()> {
    if source.is_regulatory() {
        return Err(Error::policy(format!(
            "{} entries are managed by provider sync only",
            source
        )));
    }
    Ok(())
}

impl SuppressionAdmin {
    pub fn new(store: Arc<dyn SuppressionStore>, cache: Arc<DecisionCache>) -> Self {
        Self { store, cache }
    }

    pub async fn add(&self, request: AddSuppression) -> Result<SuppressionEntry> {
        ensure_mutable(request.source)?;
        let phone_number = PhoneNumber::parse(&request.phone_number)?;
        let now = Utc::now();
        if let Some(expires_at) = request.expires_at {
            if expires_at <= now {
                return Err(Error::validation("expires_at must be in the future"));
            }
        }
        let added_by = request.added_by.trim();
        if added_by.is_empty() {
            return Err(Error::validation("added_by is required"));
        }

        let entry = SuppressionEntry {
            id: SuppressionEntry::new_id(),
            phone_number,
            source: request.source,
            provider_id: Provider::builtin(request.source).id,
            reason: request.reason,
            added_at: now,
            expires_at: request.expires_at,
            source_reference: request.source_reference,
            notes: request.notes,
            metadata: request.metadata,
            added_by: added_by.to_string(),
            updated_at: now,
            removed_at: None,
            removed_by: None,
            removal_reason: None,
        };

        self.store.insert_entry(&entry).await?;
        self.cache.invalidate(&entry.phone_number).await;
        info!(
            id = %entry.id,
            phone = %entry.phone_number,
            source = %entry.source,
            reason = entry.reason.as_str(),
            by = %entry.added_by,
            "Suppression added"
        );
        Ok(entry)
    }

    pub async fn update(&self, id: &str, patch: UpdateSuppression) -> Result<SuppressionEntry> {
        if patch.is_empty() {
            return Err(Error::validation("update contains no changes"));
        }
        let mut entry = self.load_mutable(id).await?;
        if entry.is_removed() {
            return Err(Error::conflict(format!("entry {} has been removed", id)));
        }

        let now = Utc::now();
        if let Some(Some(expires_at)) = patch.expires_at {
            if expires_at <= now {
                return Err(Error::validation("expires_at must be in the future"));
            }
        }

        let before = entry.clone();
        if let Some(expires_at) = patch.expires_at {
            entry.expires_at = expires_at;
        }
        if let Some(notes) = patch.notes {
            entry.notes = notes;
        }
        if let Some(source_reference) = patch.source_reference {
            entry.source_reference = source_reference;
        }
        if let Some(metadata) = patch.metadata {
            entry.metadata = metadata;
        }
        if entry == before {
            return Ok(entry);
        }

        entry.updated_at = now;
        self.store.update_entry(&entry).await?;
        self.cache.invalidate(&entry.phone_number).await;
        info!(id = %entry.id, phone = %entry.phone_number, "Suppression updated");
        Ok(entry)
    }

    /// Returns the entry as it was left: marked removed, or as it was before
    /// a hard delete.
    pub async fn remove(&self, id: &str, request: RemoveSuppression) -> Result<SuppressionEntry> {
        let reason = request.reason.trim();
        if reason.is_empty() {
            return Err(Error::validation("a removal reason is required"));
        }
        let mut entry = self.load_mutable(id).await?;

        if request.hard {
            self.store.delete_entry(&entry.id).await?;
        } else if !entry.is_removed() {
            let now = Utc::now();
            entry.removed_at = Some(now);
            entry.removed_by = Some(request.removed_by.clone());
            entry.removal_reason = Some(reason.to_string());
            entry.updated_at = now;
            self.store.update_entry(&entry).await?;
        }

        self.cache.invalidate(&entry.phone_number).await;
        info!(
            id = %entry.id,
            phone = %entry.phone_number,
            hard = request.hard,
            by = %request.removed_by,
            reason = reason,
            "Suppression removed"
        );
        Ok(entry)
    }

    pub async fn get(&self, id: &str) -> Result<SuppressionEntry> {
        self.store
            .get_entry(id)
            .await?
            .ok_or_else(|| Error::not_found("suppression entry", id))
    }

    pub async fn list(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
        self.store.list_entries(filter).await
    }

    async fn load_mutable(&self, id: &str) -> Result<SuppressionEntry> {
        let entry = self.get(id).await?;
        ensure_mutable(entry.source)?;
        Ok(entry)
    }
}
