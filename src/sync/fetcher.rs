use crate::error::Result;
use crate::model::{Metadata, Provider, SuppressReason, SyncType};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record as delivered by an upstream feed, before validation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub phone_number: String,
    #[serde(default)]
    pub reason: Option<SuppressReason>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default, alias = "reference")]
    pub source_reference: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
    /// Tombstone. Only meaningful in incremental feeds.
    #[serde(default)]
    pub deleted: bool,
}

impl RemoteRecord {
    pub fn number(phone_number: impl Into<String>) -> Self {
        Self {
            phone_number: phone_number.into(),
            reason: None,
            expires_at: None,
            source_reference: None,
            metadata: Metadata::new(),
            deleted: false,
        }
    }

    pub fn tombstone(phone_number: impl Into<String>) -> Self {
        Self {
            deleted: true,
            ..Self::number(phone_number)
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchRequest {
    pub provider: Provider,
    pub sync_type: SyncType,
    /// Page cursor, or the stored continuation token on the first
    /// incremental page.
    pub token: Option<String>,
    pub credential: Option<String>,
}

/// One page of a feed.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct FetchBatch {
    #[serde(default)]
    pub records: Vec<RemoteRecord>,
    /// Cursor for the next page, or on the last page the token to resume
    /// the next incremental sync from.
    #[serde(default)]
    pub next_token: Option<String>,
    #[serde(default = "default_complete")]
    pub complete: bool,
}

fn default_complete() -> bool {
    true
}

/// Pulls pages from an upstream provider. The wire format behind it is
/// pluggable; [`super::HttpFetcher`] is the bundled implementation.
#[async_trait]
pub trait ProviderFetcher: Send + Sync {
    async fn fetch(&self, request: &FetchRequest) -> Result<FetchBatch>;
}
