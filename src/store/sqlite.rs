use super::{EntryFilter, SuppressionStore, SyncChangeSet};
use crate::db::DbClient;
use crate::error::Result;
use crate::model::{PhoneNumber, Provider, SuppressionEntry};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// SQLite-backed store. Every call runs on tokio's blocking pool because
/// rusqlite is synchronous.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<DbClient>,
}

impl SqliteStore {
    pub fn new(db: Arc<DbClient>) -> Self {
        Self { db }
    }

    pub fn open(path: &str) -> Result<Self> {
        let db = DbClient::new(path)?;
        db.initialize()?;
        Ok(Self::new(Arc::new(db)))
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&DbClient) -> Result<T> + Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db)).await?
    }
}

#[async_trait]
impl SuppressionStore for SqliteStore {
    async fn active_entries(
        &self,
        phone: &PhoneNumber,
        provider_id: &str,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<SuppressionEntry>> {
        let phone = phone.clone();
        let provider_id = provider_id.to_string();
        self.blocking(move |db| db.active_entries(&phone, &provider_id, as_of))
            .await
    }

    async fn get_entry(&self, id: &str) -> Result<Option<SuppressionEntry>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_entry(&id)).await
    }

    async fn insert_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking(move |db| db.insert_entry(&entry)).await
    }

    async fn update_entry(&self, entry: &SuppressionEntry) -> Result<()> {
        let entry = entry.clone();
        self.blocking(move |db| db.update_entry(&entry)).await
    }

    async fn delete_entry(&self, id: &str) -> Result<bool> {
        let id = id.to_string();
        self.blocking(move |db| db.delete_entry(&id)).await
    }

    async fn provider_entries(&self, provider_id: &str) -> Result<Vec<SuppressionEntry>> {
        let provider_id = provider_id.to_string();
        self.blocking(move |db| db.provider_entries(&provider_id))
            .await
    }

    async fn apply_sync(&self, provider_id: &str, changes: &SyncChangeSet) -> Result<()> {
        let provider_id = provider_id.to_string();
        let changes = changes.clone();
        self.blocking(move |db| db.apply_sync(&provider_id, &changes))
            .await
    }

    async fn list_entries(&self, filter: &EntryFilter) -> Result<Vec<SuppressionEntry>> {
        let filter = filter.clone();
        self.blocking(move |db| db.list_entries(&filter)).await
    }

    async fn list_providers(&self) -> Result<Vec<Provider>> {
        self.blocking(|db| db.list_providers()).await
    }

    async fn get_provider(&self, id: &str) -> Result<Option<Provider>> {
        let id = id.to_string();
        self.blocking(move |db| db.get_provider(&id)).await
    }

    async fn upsert_provider(&self, provider: &Provider) -> Result<()> {
        let provider = provider.clone();
        self.blocking(move |db| db.upsert_provider(&provider)).await
    }
}
