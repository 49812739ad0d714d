//! Validated primitives shared across the engine.
//!
//! Every persisted or config-facing primitive that carries a validity constraint gets
//! its own `nutype` wrapper here, rather than a bare `String`/`i64`/`usize`, so two
//! differently-scoped ids (e.g. a [`MessageId`] and a [`MetaDataId`]) can never be
//! swapped at a call site.

use nutype::nutype;
#[allow(unused_imports)]
use serde::{Deserialize, Serialize};

/// Identifies a deployed channel. Channel ids are used verbatim as SQL identifier
/// suffixes for per-channel tables, so they are restricted to characters that are
/// safe to splice into `CREATE TABLE` without quoting ambiguity.
#[nutype(
    sanitize(trim),
    validate(
        len_char_min = 1,
        len_char_max = 64,
        regex = r"^[A-Za-z0-9_]+$"
    ),
    derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, AsRef)
)]
pub struct ChannelId(String);

/// Monotonically increasing id of a [`crate::domain::message::Message`] within a
/// single channel. Scoped per channel, not globally unique.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize
    )
)]
pub struct MessageId(i64);

/// Identifies one connector within a message (`0` is the source connector, positive
/// values are destinations in configured order).
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Hash,
        Serialize,
        Deserialize,
        Default
    ),
    default = 0
)]
pub struct MetaDataId(i32);

/// Identifies the engine instance that produced a message, so a multi-node
/// deployment can tell which node wrote which row.
#[nutype(
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)
)]
pub struct ServerId(String);

/// Kind of content stored against a [`crate::domain::message::ConnectorMessage`].
///
/// Mirrors the content-type lattice every connector message's content rows are
/// keyed by: each connector message can carry at most one row per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    /// Bytes exactly as received from the source connector.
    Raw,
    /// Raw content after the source preprocessor script ran.
    ProcessedRaw,
    /// Source filter/transform output handed to the router.
    Transformed,
    /// Destination-specific encoded payload ready to send.
    Encoded,
    /// Bytes actually written to the destination transport.
    Sent,
    /// Raw response received back from a destination.
    Response,
    /// Response after the destination's response-transformer ran.
    ResponseTransformed,
    /// Response after the channel-level postprocessor ran.
    ProcessedResponse,
    /// Snapshot of the source map scope at dispatch time.
    SourceMap,
    /// Snapshot of the connector map scope at dispatch time.
    ConnectorMap,
    /// Snapshot of the channel map scope at dispatch time.
    ChannelMap,
    /// Snapshot of the response map scope at dispatch time.
    ResponseMap,
}

/// Lifecycle status of a single [`crate::domain::message::ConnectorMessage`].
///
/// The lattice is monotone except for the documented `Queued -> Queued` retry
/// cycle: a message may be requeued onto itself any number of times while a
/// destination is being retried, but it can never regress to an earlier phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectorMessageStatus {
    /// Accepted by the connector, not yet filtered or transformed.
    Received,
    /// Rejected by a filter step; the pipeline stops here for this connector.
    Filtered,
    /// Filter/transform stage completed successfully.
    Transformed,
    /// Waiting for a destination worker slot or an upstream dependency.
    Pending,
    /// Handed to a destination connector for delivery, awaiting completion.
    Queued,
    /// Delivered and, if applicable, response-transformed and postprocessed.
    Sent,
    /// Delivery or processing failed terminally (retries exhausted).
    Error,
}

impl ConnectorMessageStatus {
    /// Whether transitioning from `self` to `next` respects the status lattice.
    #[must_use]
    pub fn can_transition_to(self, next: Self) -> bool {
        use ConnectorMessageStatus::{Error, Filtered, Pending, Queued, Received, Sent, Transformed};
        matches!(
            (self, next),
            (Received, Filtered)
                | (Received, Transformed)
                | (Received, Error)
                | (Transformed, Pending)
                | (Transformed, Queued)
                | (Transformed, Error)
                | (Pending, Queued)
                | (Pending, Error)
                | (Queued, Queued)
                | (Queued, Sent)
                | (Queued, Error)
        )
    }
}

/// Bitflags-shaped error code for a [`crate::domain::message::ConnectorMessage`].
/// `PROCESSING` and `POSTPROCESSOR` errors can both be set on the same message (a
/// destination can fail delivery and then its postprocessor can also fail);
/// `RESPONSE` is independent of the other two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ErrorCode(u8);

impl ErrorCode {
    /// No error recorded.
    pub const NONE: Self = Self(0);
    /// Filter, transform, or dispatch failed.
    pub const PROCESSING: Self = Self(1);
    /// The postprocessor script failed after dispatch otherwise succeeded.
    pub const POSTPROCESSOR: Self = Self(2);
    /// Response handling (response transform or response postprocessor) failed.
    pub const RESPONSE: Self = Self(4);

    /// Sets the processing error bit.
    #[must_use]
    pub fn with_processing(self) -> Self {
        Self(self.0 | Self::PROCESSING.0)
    }

    /// Sets the postprocessor error bit.
    #[must_use]
    pub fn with_postprocessor(self) -> Self {
        Self(self.0 | Self::POSTPROCESSOR.0)
    }

    /// Sets the response error bit.
    #[must_use]
    pub fn with_response(self) -> Self {
        Self(self.0 | Self::RESPONSE.0)
    }

    /// Whether any error bit is set.
    #[must_use]
    pub fn is_error(self) -> bool {
        self.0 != 0
    }

    /// Whether the processing bit is set.
    #[must_use]
    pub fn has_processing(self) -> bool {
        self.0 & Self::PROCESSING.0 != 0
    }

    /// Whether the postprocessor bit is set.
    #[must_use]
    pub fn has_postprocessor(self) -> bool {
        self.0 & Self::POSTPROCESSOR.0 != 0
    }

    /// Whether the response bit is set.
    #[must_use]
    pub fn has_response(self) -> bool {
        self.0 & Self::RESPONSE.0 != 0
    }

    /// Raw bit pattern, for persistence.
    #[must_use]
    pub fn bits(self) -> u8 {
        self.0
    }

    /// Reconstructs an `ErrorCode` from a persisted bit pattern.
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Byte-size budget used for in-memory content and attachment caps. `less_or_equal`
/// is generous (64MiB) because attachments (e.g. imaging payloads) can be large.
#[nutype(
    validate(less_or_equal = 67_108_864),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 0
)]
pub struct ContentBytes(usize);

/// Number of worker tasks a channel may run concurrently for its destinations.
#[nutype(
    validate(greater = 0, less_or_equal = 256),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct WorkerCount(u16);

/// Script execution wall-clock budget in milliseconds.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 60_000
)]
pub struct ScriptTimeoutMs(u64);

/// Maximum number of fuel units a single script invocation may consume before the
/// sandbox kills it, independent of the wall-clock timeout.
#[nutype(
    validate(greater = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 10_000_000
)]
pub struct ScriptFuelBudget(u64);

/// SQLite connection pool size.
#[nutype(
    validate(greater = 0, less_or_equal = 100),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize, Default),
    default = 10
)]
pub struct ConnectionPoolSize(usize);

impl ConnectionPoolSize {
    /// Returns the pool size as a plain `usize`, for handing to `sqlx` pool options.
    #[must_use]
    pub fn as_usize(self) -> usize {
        self.into_inner()
    }
}

/// Name of a host function exposed to sandboxed scripts (`log`, `getTime`, ...).
#[nutype(
    sanitize(trim),
    validate(len_char_min = 1, len_char_max = 64),
    derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)
)]
pub struct HostFunctionName(String);

/// Cap on how many host import functions a sandbox's security policy may expose.
#[nutype(
    validate(greater = 0, less_or_equal = 64),
    derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)
)]
pub struct MaxImportFunctions(u32);

/// Number of days of processed messages a pruner keeps before archiving/deleting.
#[nutype(
    validate(greater_or_equal = 0),
    derive(
        Debug,
        Clone,
        Copy,
        PartialEq,
        Eq,
        PartialOrd,
        Ord,
        Serialize,
        Deserialize,
        Default
    ),
    default = 0
)]
pub struct RetentionDays(u32);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_id_rejects_path_unsafe_characters() {
        assert!(ChannelId::try_new("lab-results").is_err());
        assert!(ChannelId::try_new("lab results").is_err());
        assert!(ChannelId::try_new("lab_results_1").is_ok());
    }

    #[test]
    fn status_lattice_allows_documented_retry_cycle() {
        assert!(ConnectorMessageStatus::Queued.can_transition_to(ConnectorMessageStatus::Queued));
    }

    #[test]
    fn status_lattice_rejects_regression() {
        assert!(!ConnectorMessageStatus::Sent.can_transition_to(ConnectorMessageStatus::Pending));
        assert!(!ConnectorMessageStatus::Error.can_transition_to(ConnectorMessageStatus::Queued));
    }

    #[test]
    fn error_code_bits_are_independent() {
        let code = ErrorCode::NONE.with_processing().with_response();
        assert!(code.has_processing());
        assert!(code.has_response());
        assert!(!code.has_postprocessor());
        assert!(code.is_error());
    }
}
