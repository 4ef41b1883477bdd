use super::worker::{SyncOptions, SyncWorker};
use crate::error::Error;
use chrono::Utc;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background loop syncing due providers on a fixed tick.
pub struct SyncScheduler {
    worker: Arc<SyncWorker>,
    tick: Duration,
    concurrency: usize,
}

/// Handle to a running scheduler.
pub struct SchedulerHandle {
    refresh_tx: mpsc::Sender<()>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Asks for an immediate pass. Coalesces with a pending request.
    pub fn trigger(&self) {
        let _ = self.refresh_tx.try_send(());
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        if let Err(e) = self.task.await {
            warn!("Sync scheduler task ended abnormally: {}", e);
        }
    }
}

impl SyncScheduler {
    pub fn new(worker: Arc<SyncWorker>, tick: Duration, concurrency: usize) -> Self {
        Self {
            worker,
            tick: tick.max(Duration::from_millis(10)),
            concurrency: concurrency.max(1),
        }
    }

    pub fn spawn(self, shutdown: CancellationToken) -> SchedulerHandle {
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<()>(1);
        let token = shutdown.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.tick);
            info!(
                tick_ms = self.tick.as_millis() as u64,
                concurrency = self.concurrency,
                "Sync scheduler started"
            );

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {
                        debug!("Scheduled sync pass");
                    }
                    Some(()) = refresh_rx.recv() => {
                        info!("Forced sync pass triggered");
                        interval.reset();
                    }
                }
                self.run_due(&token).await;
            }
            info!("Sync scheduler stopped");
        });

        SchedulerHandle {
            refresh_tx,
            shutdown,
            task,
        }
    }

    /// Syncs every due provider once. Returns how many syncs succeeded.
    pub async fn run_due(&self, cancel: &CancellationToken) -> usize {
        let due = self.worker.due_providers(Utc::now());
        if due.is_empty() {
            return 0;
        }
        debug!("{} provider(s) due for sync", due.len());

        stream::iter(due)
            .map(|provider| {
                let worker = self.worker.clone();
                let options = SyncOptions {
                    sync_type: None,
                    cancel: Some(cancel.child_token()),
                };
                async move {
                    match worker.sync(&provider.id, options).await {
                        Ok(_) => true,
                        Err(e @ (Error::Conflict(_) | Error::Cancelled(_))) => {
                            debug!(provider = %provider.id, "Sync skipped: {}", e);
                            false
                        }
                        Err(e) => {
                            warn!(provider = %provider.id, "Scheduled sync failed: {}", e);
                            false
                        }
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .filter(|ok| futures::future::ready(*ok))
            .count()
            .await
    }
}
