//! Message, `ConnectorMessage`, content, attachment, and response entities.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain_types::{
    ChannelId, ConnectorMessageStatus, ContentType, ErrorCode, MessageId, MetaDataId, ServerId,
};

/// One logical inbound message. Owns one [`ConnectorMessage`] per enabled
/// destination plus one for the source. Destroyed only by the Pruner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Channel-scoped monotonic id, allocated at receive.
    pub id: MessageId,
    /// Channel this message belongs to.
    pub channel_id: ChannelId,
    /// Engine instance that received the message.
    pub server_id: ServerId,
    /// When the message was received.
    pub received_date: DateTime<Utc>,
    /// Set once every destination has reached a terminal status and the
    /// channel/global postprocessors have run.
    pub processed: bool,
    /// Id of the original message this one was reprocessed from, if any.
    pub original_id: Option<MessageId>,
    /// Id assigned by a bulk import, if this message arrived via import.
    pub import_id: Option<i64>,
    /// Channel the import originated from, if any.
    pub import_channel_id: Option<ChannelId>,
}

impl Message {
    /// Builds a freshly received message with no reprocess/import lineage.
    #[must_use]
    pub fn received(
        id: MessageId,
        channel_id: ChannelId,
        server_id: ServerId,
        received_date: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            channel_id,
            server_id,
            received_date,
            processed: false,
            original_id: None,
            import_id: None,
            import_channel_id: None,
        }
    }
}

/// The four scoped key-value maps attached to a `ConnectorMessage` and visible to
/// user scripts. Mutations are durable only once the pipeline writes their
/// content rows; until then they live in these in-memory maps.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Maps {
    /// Populated by the source connector and the VM Router (reserved keys in
    /// `spec.md` §6.4 are never overridden by user variables).
    pub source_map: HashMap<String, String>,
    /// Populated by the connector's own filter/transform scripts.
    pub connector_map: HashMap<String, String>,
    /// Shared across every connector of the owning message.
    pub channel_map: HashMap<String, String>,
    /// Populated by the response transformer.
    pub response_map: HashMap<String, String>,
}

impl Maps {
    /// Resolves `key` by searching the scopes in the exact order `spec.md` §4.D
    /// and §4.E specify for both VM source-chain propagation and
    /// `replaceConnectorProperties`: response map, connector map, channel map,
    /// source map, then the two caller-supplied global scopes.
    #[must_use]
    pub fn resolve<'a>(
        &'a self,
        key: &str,
        global_channel_map: &'a HashMap<String, String>,
        global_map: &'a HashMap<String, String>,
        configuration_map: &'a HashMap<String, String>,
    ) -> Option<&'a str> {
        self.response_map
            .get(key)
            .or_else(|| self.connector_map.get(key))
            .or_else(|| self.channel_map.get(key))
            .or_else(|| self.source_map.get(key))
            .or_else(|| global_channel_map.get(key))
            .or_else(|| global_map.get(key))
            .or_else(|| configuration_map.get(key))
            .map(String::as_str)
    }
}

/// One connector's view of one [`Message`]. Meta-data-id `0` is the source,
/// `1..N` are destinations in deploy order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectorMessage {
    /// Owning message's id.
    pub message_id: MessageId,
    /// Channel this connector message belongs to.
    pub channel_id: ChannelId,
    /// `0` for the source, `1..N` for destinations.
    pub meta_data_id: MetaDataId,
    /// Connector's display name at the time this row was written.
    pub connector_name: String,
    /// Current lattice position; see [`ConnectorMessageStatus`].
    pub status: ConnectorMessageStatus,
    /// Number of send attempts made so far (destinations only).
    pub send_attempts: u32,
    /// When the row was received/created.
    pub received_date: DateTime<Utc>,
    /// When the last send attempt was made.
    pub send_date: Option<DateTime<Utc>>,
    /// When a response was last received.
    pub response_date: Option<DateTime<Utc>>,
    /// Bitmask of which stages have errored.
    pub error_code: ErrorCode,
    /// Error detail for the bit set in `error_code`, if any.
    pub error_detail: Option<String>,
    /// Source-chain identifier propagated by the VM Router, if this connector
    /// message's message arrived via a VM hop.
    pub chain_id: Option<String>,
    /// Order within the chain (destination dispatch order for destinations).
    pub order_id: i32,
    /// The four scoped maps.
    pub maps: Maps,
}

impl ConnectorMessage {
    /// Builds a freshly allocated `ConnectorMessage` in `Received` status.
    #[must_use]
    pub fn new(
        message_id: MessageId,
        channel_id: ChannelId,
        meta_data_id: MetaDataId,
        connector_name: String,
        received_date: DateTime<Utc>,
        order_id: i32,
    ) -> Self {
        Self {
            message_id,
            channel_id,
            meta_data_id,
            connector_name,
            status: ConnectorMessageStatus::Received,
            send_attempts: 0,
            received_date,
            send_date: None,
            response_date: None,
            error_code: ErrorCode::NONE,
            error_detail: None,
            chain_id: None,
            order_id,
            maps: Maps::default(),
        }
    }

    /// Attempts the transition, returning `false` (and leaving status
    /// unchanged) if the lattice forbids it.
    #[must_use]
    pub fn try_transition(&mut self, next: ConnectorMessageStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}

/// (`ConnectorMessage`, content-type) -> payload. At most one row per pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageContent {
    /// Owning message id.
    pub message_id: MessageId,
    /// Owning connector's meta-data-id.
    pub meta_data_id: MetaDataId,
    /// Which stage this content represents.
    pub content_type: ContentType,
    /// The payload, possibly encrypted (see `is_encrypted`).
    pub content: String,
    /// User/connector-declared data-type tag (e.g. `"XML"`, `"JSON"`, `"RAW"`).
    pub data_type: String,
    /// Whether `content` is ciphertext rather than plaintext.
    pub is_encrypted: bool,
}

/// (id, message-id, mime-type, segmented binary payload). Stored separately from
/// `MessageContent` so large blobs don't bloat message queries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment id, unique within the channel.
    pub id: i64,
    /// Owning message id.
    pub message_id: MessageId,
    /// MIME type of the reconstructed attachment.
    pub mime_type: String,
    /// Segment number; segments are concatenated in order to reconstruct.
    pub segment_id: i32,
    /// This segment's binary payload.
    pub data: Vec<u8>,
}

/// Closed status set for a [`Response`], per `spec.md` §3. Distinct from
/// [`ConnectorMessageStatus`]: a `Response` reports what the destination said,
/// while the `ConnectorMessageStatus` records the pipeline's own state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// Not yet acted on.
    Received,
    /// Rejected by a filter.
    Filtered,
    /// Passed through a transformer.
    Transformed,
    /// Delivered successfully.
    Sent,
    /// Queued for a retry by the connector itself.
    Queued,
    /// Failed.
    Error,
    /// Waiting on a dependency.
    Pending,
}

/// The value returned by a destination dispatch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Closed status set the destination connector (or response transformer) set.
    pub status: ResponseStatus,
    /// Response payload, if any.
    pub message: Option<String>,
    /// Short human-readable status message.
    pub status_message: Option<String>,
    /// Error detail, present when `status == Error`.
    pub error_detail: Option<String>,
}

impl Response {
    /// A successful, empty response.
    #[must_use]
    pub fn sent() -> Self {
        Self {
            status: ResponseStatus::Sent,
            message: None,
            status_message: None,
            error_detail: None,
        }
    }

    /// An error response with the given detail.
    #[must_use]
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            message: None,
            status_message: None,
            error_detail: Some(detail.into()),
        }
    }
}
