//! Provider feed synchronisation: fetchers, the per-provider worker and the
//! background scheduler.

mod fetcher;
mod http;
mod scheduler;
mod worker;

pub use fetcher::{FetchBatch, FetchRequest, ProviderFetcher, RemoteRecord};
pub use http::HttpFetcher;
pub use scheduler::{SchedulerHandle, SyncScheduler};
pub use worker::{SyncOptions, SyncReport, SyncSettings, SyncWorker};
