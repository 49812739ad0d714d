//! Process-wide pruner configuration and per-channel retention settings.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::domain_types::{ConnectorMessageStatus, RetentionDays};

/// Per-channel retention knobs. Both are optional; a channel with neither set is
/// skipped by the pruner's task-queue builder entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PruneSettings {
    /// Retention for full metadata + content.
    pub prune_metadata_days: Option<RetentionDays>,
    /// Retention for content only (metadata rows are kept).
    pub prune_content_days: Option<RetentionDays>,
}

/// Single process-wide pruner configuration, persisted as a JSON blob under
/// `("Data Pruner", "pruner.config")` in the generic configuration table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrunerConfig {
    /// Master on/off switch for the scheduler.
    pub enabled: bool,
    /// Hours between scheduler ticks.
    pub polling_interval_hours: u32,
    /// Messages deleted per transaction batch.
    pub pruning_block_size: u32,
    /// Messages archived per transaction batch.
    pub archiving_block_size: u32,
    /// Whether to archive before deleting.
    pub archive_enabled: bool,
    /// Archiver-specific options (root folder, format, compression, encryption).
    pub archiver_options: ArchiverOptions,
    /// Whether to prune old dashboard/status events before channel tasks run.
    pub prune_events: bool,
    /// Maximum age in days of events retained when `prune_events` is set.
    pub max_event_age_days: u32,
    /// `ConnectorMessageStatus` values that must NOT be pruned regardless of age.
    pub skip_statuses: HashSet<ConnectorMessageStatusDto>,
    /// Require `Message.processed == true` before a message is prune-eligible.
    pub skip_incomplete: bool,
}

impl Default for PrunerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            polling_interval_hours: 1,
            pruning_block_size: 1000,
            archiving_block_size: 50,
            archive_enabled: false,
            archiver_options: ArchiverOptions::default(),
            prune_events: false,
            max_event_age_days: 30,
            skip_statuses: [
                ConnectorMessageStatusDto::Error,
                ConnectorMessageStatusDto::Queued,
                ConnectorMessageStatusDto::Pending,
            ]
            .into_iter()
            .collect(),
            skip_incomplete: true,
        }
    }
}

/// `ConnectorMessageStatus` variant used as a `HashSet`/`Serialize` key. Kept
/// distinct from [`ConnectorMessageStatus`] so the status lattice's transition
/// logic doesn't need `Hash`/`Eq` derives it otherwise wouldn't need.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorMessageStatusDto {
    /// See [`ConnectorMessageStatus::Received`].
    Received,
    /// See [`ConnectorMessageStatus::Filtered`].
    Filtered,
    /// See [`ConnectorMessageStatus::Transformed`].
    Transformed,
    /// See [`ConnectorMessageStatus::Pending`].
    Pending,
    /// See [`ConnectorMessageStatus::Queued`].
    Queued,
    /// See [`ConnectorMessageStatus::Sent`].
    Sent,
    /// See [`ConnectorMessageStatus::Error`].
    Error,
}

impl From<ConnectorMessageStatus> for ConnectorMessageStatusDto {
    fn from(value: ConnectorMessageStatus) -> Self {
        match value {
            ConnectorMessageStatus::Received => Self::Received,
            ConnectorMessageStatus::Filtered => Self::Filtered,
            ConnectorMessageStatus::Transformed => Self::Transformed,
            ConnectorMessageStatus::Pending => Self::Pending,
            ConnectorMessageStatus::Queued => Self::Queued,
            ConnectorMessageStatus::Sent => Self::Sent,
            ConnectorMessageStatus::Error => Self::Error,
        }
    }
}

/// Archiver-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiverOptions {
    /// Root folder under which `<channelId>/<date>/messages_*.ext` files are written.
    pub root_folder: String,
    /// `json` or `xml`.
    pub format: ArchiveFormat,
    /// Gzip the output before (optional) encryption.
    pub gzip: bool,
    /// Encrypt the output with AES-256-GCM, PBKDF2-derived key.
    pub encrypt: bool,
    /// Password used to derive the AES key when `encrypt` is set. Never logged.
    pub password: Option<String>,
    /// Messages per archive file before rolling to a new one.
    pub messages_per_file: u32,
}

impl Default for ArchiverOptions {
    fn default() -> Self {
        Self {
            root_folder: "archive".to_string(),
            format: ArchiveFormat::Json,
            gzip: false,
            encrypt: false,
            password: None,
            messages_per_file: 1000,
        }
    }
}

/// On-disk archive serialization format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    /// One JSON object per line.
    Json,
    /// One `<message>` XML element per line.
    Xml,
}

impl ArchiveFormat {
    /// File extension (without the leading dot) for this format.
    #[must_use]
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Json => "json",
            ArchiveFormat::Xml => "xml",
        }
    }
}
