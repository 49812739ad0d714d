//! The Message Store: a durable, channel-sharded record of every message and
//! every stage of its processing.
//!
//! [`MessageStore`] is the trait the pipeline, router, and pruner depend on;
//! [`sqlite_store::SqliteMessageStore`] is the only implementation. Keeping the
//! trait separate from the SQLite backend mirrors the teacher's
//! `message_router::traits::MessageStorage` / `storage::message_storage` split.

pub mod sqlite_store;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

pub use crate::error::StorageError;
use crate::domain::message::{Attachment, ConnectorMessage, Message, MessageContent};
use crate::domain_types::{ChannelId, ConnectorMessageStatus, MessageId, MetaDataId};

/// A fetched message bundled with its connector messages, for the `GET
/// /channels/:id/messages/:msgId` collaborator endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct MessageBundle {
    /// The message row.
    pub message: Message,
    /// One connector message per source/destination that has been allocated.
    pub connector_messages: Vec<ConnectorMessage>,
    /// Content rows, present only when fetched with `include_content`.
    pub content: Vec<MessageContent>,
}

/// Durable record of every message and every stage of processing, per `spec.md`
/// §4.A. All operations are scoped to a single channel's sharded tables.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Creates the channel's sharded tables (`M`, `MM`, `MC`, `MA`, `MCM`, `MS`)
    /// if they do not already exist. Idempotent; called at deploy time.
    async fn ensure_channel_tables(&self, channel: &ChannelId) -> Result<(), StorageError>;

    /// Allocates the next strictly increasing message id for `channel`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::MissingTables`] if the channel has not been
    /// deployed (its tables don't exist).
    async fn next_message_id(&self, channel: &ChannelId) -> Result<MessageId, StorageError>;

    /// Inserts a freshly received [`Message`] row.
    async fn insert_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Inserts a freshly allocated [`ConnectorMessage`] row.
    async fn insert_connector_message(&self, cm: &ConnectorMessage) -> Result<(), StorageError>;

    /// Inserts or replaces one [`MessageContent`] row. At most one row exists
    /// per `(message_id, meta_data_id, content_type)`.
    async fn insert_content(
        &self,
        channel: &ChannelId,
        content: &MessageContent,
    ) -> Result<(), StorageError>;

    /// Inserts an [`Attachment`] segment row.
    async fn insert_attachment(
        &self,
        channel: &ChannelId,
        attachment: &Attachment,
    ) -> Result<(), StorageError>;

    /// Conditionally updates a `ConnectorMessage`'s status, attempt count, and
    /// timestamps. Callers must not call this with a status the lattice
    /// forbids (see [`crate::domain_types::ConnectorMessageStatus::can_transition_to`]);
    /// a concurrent writer racing the same row surfaces as
    /// [`StorageError::Conflict`].
    async fn update_connector_message_status(
        &self,
        channel: &ChannelId,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        new_status: ConnectorMessageStatus,
        send_attempts: Option<u32>,
        error: Option<(crate::domain_types::ErrorCode, String)>,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StorageError>;

    /// Sets `Message.processed = true`. Once set, the row becomes eligible for
    /// the Pruner.
    async fn mark_processed(&self, channel: &ChannelId, message_id: MessageId) -> Result<(), StorageError>;

    /// Increments the `MS<C>` aggregate counter for `meta_data_id`/`status`.
    /// Best-effort: see Open Question 2 in `spec.md` §9 for the failure policy.
    async fn increment_statistic(
        &self,
        channel: &ChannelId,
        meta_data_id: MetaDataId,
        status: ConnectorMessageStatus,
    ) -> Result<(), StorageError>;

    /// Fetches a message and its connector messages, optionally with content.
    async fn fetch_message(
        &self,
        channel: &ChannelId,
        message_id: MessageId,
        include_content: bool,
    ) -> Result<Option<MessageBundle>, StorageError>;

    /// Returns up to `limit` message ids eligible for pruning: every
    /// `ConnectorMessage` status is outside `skip_statuses`, the message was
    /// received before `before`, and (if `skip_incomplete`) `processed = true`.
    async fn get_messages_to_prune(
        &self,
        channel: &ChannelId,
        before: DateTime<Utc>,
        limit: u32,
        skip_statuses: &[ConnectorMessageStatus],
        skip_incomplete: bool,
    ) -> Result<Vec<MessageId>, StorageError>;

    /// Deletes `ids` from `MC`, `MA`, `MM`, `MCM`, `M` (in that order) within one
    /// transaction. Returns the number of `Message` rows removed. Idempotent:
    /// calling twice with the same ids returns `0` the second time.
    async fn prune_messages(&self, channel: &ChannelId, ids: &[MessageId]) -> Result<u64, StorageError>;

    /// Deletes only `MC` and `MA` rows for `ids`, retaining `MM`/`M` metadata.
    async fn prune_message_content(
        &self,
        channel: &ChannelId,
        ids: &[MessageId],
    ) -> Result<u64, StorageError>;
}

/// Sanitizes a channel id into the table-name suffix used by `M<C>`, `MM<C>`,
/// etc. [`ChannelId`]'s own validation already restricts it to
/// `[A-Za-z0-9_]+`, so this is a defense-in-depth assertion, not the primary
/// guard against SQL injection via table names.
#[must_use]
pub fn table_suffix(channel: &ChannelId) -> &str {
    channel.as_ref()
}
