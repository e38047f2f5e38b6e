//! Poll-and-apply driver.
//!
//! The [`Syncer`] pulls changes from the server through a [`SyncClient`]
//! and hands them to the host's [`LocalReplica`]. A failure to load or
//! apply one title does not stop the rest of the batch.

use crate::client::SyncClient;
use crate::config::WatermarkPolicy;
use crate::error::SyncResult;
use async_trait::async_trait;
use multiwiki_types::{Tiddler, TiddlerId};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// The host-side copy of the wiki that server changes are applied to.
#[async_trait]
pub trait LocalReplica: Send + Sync {
    /// Stores a tiddler received from the server, replacing any local copy.
    async fn store_tiddler(&self, tiddler: Tiddler) -> SyncResult<()>;

    /// Removes a tiddler the server reported deleted.
    async fn remove_tiddler(&self, title: &str) -> SyncResult<()>;
}

/// What one sync cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Titles stored into the replica.
    pub modified: Vec<String>,
    /// Titles removed from the replica.
    pub deleted: Vec<String>,
    /// Titles that could not be loaded or applied.
    pub failed: Vec<String>,
    /// Watermark after the cycle.
    pub watermark: TiddlerId,
}

/// Drives sync cycles between a client and a local replica.
pub struct Syncer {
    client: Arc<SyncClient>,
    replica: Arc<dyn LocalReplica>,
}

impl Syncer {
    pub fn new(client: Arc<SyncClient>, replica: Arc<dyn LocalReplica>) -> Self {
        Self { client, replica }
    }

    pub fn client(&self) -> &SyncClient {
        &self.client
    }

    /// Runs one cycle: poll, load every modified title, apply the batch.
    pub async fn sync_once(&self) -> SyncResult<SyncReport> {
        let updates = self.client.get_updated_tiddlers().await?;
        let mut report = SyncReport::default();

        for title in &updates.modifications {
            match self.client.load_tiddler(title).await {
                Ok(Some(tiddler)) => match self.replica.store_tiddler(tiddler).await {
                    Ok(()) => report.modified.push(title.clone()),
                    Err(e) => {
                        warn!("Failed to store {:?} locally: {}", title, e);
                        report.failed.push(title.clone());
                    }
                },
                // Gone again between the poll and the load.
                Ok(None) => self.apply_deletion(title, &mut report).await,
                Err(e) => {
                    warn!("Failed to load {:?}: {}", title, e);
                    report.failed.push(title.clone());
                }
            }
        }
        for title in &updates.deletions {
            self.apply_deletion(title, &mut report).await;
        }

        let policy = self.client.config().watermark_policy;
        report.watermark = if policy == WatermarkPolicy::AdvanceAfterApply && report.failed.is_empty() {
            let applied = updates.last_tiddler_id;
            self.client.with_state(move |s| s.advance_watermark(applied)).await?
        } else {
            self.client.with_state(|s| s.last_tiddler_id()).await?
        };
        if !report.failed.is_empty() {
            warn!(
                "{} titles failed to sync; watermark at {}",
                report.failed.len(),
                report.watermark
            );
        }
        debug!("Sync cycle done: {:?}", report);
        Ok(report)
    }

    async fn apply_deletion(&self, title: &str, report: &mut SyncReport) {
        let forgotten = title.to_string();
        let result = match self.client.with_state(move |s| s.remove_remote_info(&forgotten)).await {
            Ok(_) => self.replica.remove_tiddler(title).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => report.deleted.push(title.to_string()),
            Err(e) => {
                warn!("Failed to remove {:?} locally: {}", title, e);
                report.failed.push(title.to_string());
            }
        }
    }

    /// Repeats [`sync_once`](Self::sync_once) every poll interval until
    /// `shutdown` turns true or its sender is dropped. Failed cycles are
    /// logged and retried at the next tick.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.client.config().poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "Syncing recipe {:?} every {:?}",
            self.client.config().recipe,
            self.client.config().poll_interval()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.sync_once().await {
                        warn!("Sync cycle failed: {}", e);
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("Sync loop stopped");
    }
}
