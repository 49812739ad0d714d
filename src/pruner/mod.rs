//! The Data Pruner/Archiver: a timer-driven background task that walks every
//! deployed channel's eligible messages, optionally archives them, then
//! deletes them. See `archiver` for the file-writing half.

pub mod archiver;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::domain::channel::StorageMode;
use crate::domain::pruning::{ConnectorMessageStatusDto, PrunerConfig};
use crate::domain_types::{ChannelId, ConnectorMessageStatus, RetentionDays};
use crate::storage::MessageStore;

const ID_RETRIEVE_LIMIT: u32 = 100_000;
const MAX_TASK_RETRIES: u32 = 3;

/// One channel's worth of pruning context, as the engine's channel registry
/// reports it. The pruner has no other dependency on the engine.
#[derive(Debug, Clone)]
pub struct PrunableChannel {
    /// Channel identity.
    pub id: ChannelId,
    /// Storage mode; `Disabled` channels are skipped entirely.
    pub storage_mode: StorageMode,
    /// Full metadata+content retention, if configured.
    pub prune_metadata_days: Option<RetentionDays>,
    /// Content-only retention, if configured.
    pub prune_content_days: Option<RetentionDays>,
}

/// Source of the channel list the pruner iterates. Implemented by
/// [`crate::engine::EngineController`]; kept as a trait so the pruner doesn't
/// depend on the engine's full type.
pub trait ChannelSource: Send + Sync {
    /// Snapshot of every currently deployed channel's pruning-relevant config.
    fn prunable_channels(&self) -> Vec<PrunableChannel>;
}

/// Summary of one scheduler tick, for logging/metrics.
#[derive(Debug, Clone, Default)]
pub struct PruneRunSummary {
    /// Channels visited.
    pub channels_visited: u32,
    /// Channels skipped (disabled storage mode or no retention configured).
    pub channels_skipped: u32,
    /// Total messages deleted across all channels.
    pub messages_deleted: u64,
    /// Total messages archived across all channels.
    pub messages_archived: u64,
    /// Channels whose task failed after retries.
    pub channels_failed: u32,
}

/// Builds the ordered task queue for one run: every channel that isn't
/// `StorageMode::Disabled` and has at least one retention setting configured.
#[must_use]
pub fn build_task_queue(channels: &[PrunableChannel]) -> Vec<&PrunableChannel> {
    channels
        .iter()
        .filter(|c| c.storage_mode != StorageMode::Disabled)
        .filter(|c| c.prune_metadata_days.is_some() || c.prune_content_days.is_some())
        .collect()
}

/// Timer-driven scheduler. `run_forever` never returns except on shutdown
/// signal; `run_once` is exposed separately so tests and an admin-triggered
/// "run now" endpoint can drive a single pass without waiting for the timer.
pub struct PrunerScheduler<S: MessageStore> {
    store: Arc<S>,
    channel_source: Arc<dyn ChannelSource>,
    config: PrunerConfig,
    in_progress: AtomicBool,
}

impl<S: MessageStore> PrunerScheduler<S> {
    /// Builds a scheduler. Does not start the timer; call `run_forever`.
    pub fn new(store: Arc<S>, channel_source: Arc<dyn ChannelSource>, config: PrunerConfig) -> Self {
        Self { store, channel_source, config, in_progress: AtomicBool::new(false) }
    }

    /// The scheduler's current configuration, for the admin status/config endpoints.
    #[must_use]
    pub fn config(&self) -> &PrunerConfig {
        &self.config
    }

    /// Whether a run is currently in progress.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    /// Runs the scheduler loop until `shutdown` resolves. Each tick is skipped
    /// (with a warning) if the previous run is still in progress.
    pub async fn run_forever(&self, shutdown: tokio_util::sync::CancellationToken) {
        if !self.config.enabled {
            info!("pruner disabled, scheduler not started");
            return;
        }
        let mut ticker = tokio::time::interval(Duration::from_secs(u64::from(self.config.polling_interval_hours) * 3600));
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("pruner scheduler shutting down");
                    return;
                }
                _ = ticker.tick() => {
                    let summary = self.run_once().await;
                    info!(?summary, "pruner tick complete");
                }
            }
        }
    }

    /// Runs one full pass over every prunable channel. Skips the run entirely
    /// (returning a zeroed summary) if a previous run is still in progress.
    #[instrument(skip(self))]
    pub async fn run_once(&self) -> PruneRunSummary {
        if self.in_progress.swap(true, Ordering::SeqCst) {
            warn!("pruner run skipped: previous run still in progress");
            return PruneRunSummary::default();
        }
        let summary = self.run_inner().await;
        self.in_progress.store(false, Ordering::SeqCst);
        summary
    }

    async fn run_inner(&self) -> PruneRunSummary {
        let channels = self.channel_source.prunable_channels();
        let queue = build_task_queue(&channels);

        let mut summary = PruneRunSummary {
            channels_visited: u32::try_from(channels.len()).unwrap_or(u32::MAX),
            channels_skipped: u32::try_from(channels.len() - queue.len()).unwrap_or(0),
            ..Default::default()
        };

        for channel in queue {
            match self.run_channel_with_retries(channel).await {
                Ok((deleted, archived)) => {
                    summary.messages_deleted += deleted;
                    summary.messages_archived += archived;
                }
                Err(e) => {
                    warn!(channel = %channel.id.as_ref(), error = %e, "pruner task failed after retries");
                    summary.channels_failed += 1;
                }
            }
        }
        summary
    }

    async fn run_channel_with_retries(&self, channel: &PrunableChannel) -> Result<(u64, u64), crate::error::StorageError> {
        let mut attempt = 0;
        loop {
            match self.run_channel(channel).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_retryable() && attempt < MAX_TASK_RETRIES => {
                    attempt += 1;
                    warn!(channel = %channel.id.as_ref(), attempt, "retrying pruner task");
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn run_channel(&self, channel: &PrunableChannel) -> Result<(u64, u64), crate::error::StorageError> {
        let skip_statuses = skip_status_list(&self.config.skip_statuses);
        let mut deleted = 0u64;
        let mut archived = 0u64;

        if let Some(retention) = channel.prune_metadata_days {
            let before = Utc::now() - chrono::Duration::days(i64::from(retention.into_inner()));
            let ids = self
                .store
                .get_messages_to_prune(&channel.id, before, ID_RETRIEVE_LIMIT.min(self.config.pruning_block_size), &skip_statuses, self.config.skip_incomplete)
                .await?;

            if self.config.archive_enabled {
                for batch in ids.chunks(self.config.archiving_block_size as usize) {
                    let bundles = self.fetch_bundles(&channel.id, batch).await?;
                    if archiver::write_archive_batch(&channel.id, &bundles, Utc::now(), &self.config.archiver_options).is_ok() {
                        archived += self.store.prune_messages(&channel.id, batch).await?;
                    }
                }
            } else {
                deleted += self.store.prune_messages(&channel.id, &ids).await?;
            }
        }

        if let Some(retention) = channel.prune_content_days {
            let before = Utc::now() - chrono::Duration::days(i64::from(retention.into_inner()));
            let ids = self
                .store
                .get_messages_to_prune(&channel.id, before, ID_RETRIEVE_LIMIT.min(self.config.pruning_block_size), &skip_statuses, self.config.skip_incomplete)
                .await?;
            self.store.prune_message_content(&channel.id, &ids).await?;
        }

        Ok((deleted, archived))
    }

    async fn fetch_bundles(
        &self,
        channel: &ChannelId,
        ids: &[crate::domain_types::MessageId],
    ) -> Result<Vec<crate::storage::MessageBundle>, crate::error::StorageError> {
        let mut bundles = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(bundle) = self.store.fetch_message(channel, *id, true).await? {
                bundles.push(bundle);
            }
        }
        Ok(bundles)
    }
}

fn skip_status_list(skip: &std::collections::HashSet<ConnectorMessageStatusDto>) -> Vec<ConnectorMessageStatus> {
    [
        ConnectorMessageStatus::Received,
        ConnectorMessageStatus::Filtered,
        ConnectorMessageStatus::Transformed,
        ConnectorMessageStatus::Pending,
        ConnectorMessageStatus::Queued,
        ConnectorMessageStatus::Sent,
        ConnectorMessageStatus::Error,
    ]
    .into_iter()
    .filter(|s| skip.contains(&ConnectorMessageStatusDto::from(*s)))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(storage_mode: StorageMode, metadata: Option<u32>, content: Option<u32>) -> PrunableChannel {
        PrunableChannel {
            id: ChannelId::try_new("c1").unwrap(),
            storage_mode,
            prune_metadata_days: metadata.map(|d| RetentionDays::try_new(d).unwrap()),
            prune_content_days: content.map(|d| RetentionDays::try_new(d).unwrap()),
        }
    }

    #[test]
    fn build_task_queue_skips_disabled_storage_mode() {
        let channels = vec![channel(StorageMode::Disabled, Some(30), None)];
        assert!(build_task_queue(&channels).is_empty());
    }

    #[test]
    fn build_task_queue_skips_channels_without_retention() {
        let channels = vec![channel(StorageMode::Production, None, None)];
        assert!(build_task_queue(&channels).is_empty());
    }

    #[test]
    fn build_task_queue_keeps_configured_channels() {
        let channels = vec![channel(StorageMode::Production, Some(30), None)];
        assert_eq!(build_task_queue(&channels).len(), 1);
    }
}
