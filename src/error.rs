//! Error taxonomy for the engine.
//!
//! Each module owns a leaf `thiserror` enum; [`EngineError`] wraps them with
//! `#[from]` so callers at the engine boundary can use `?` uniformly, the same
//! layering the teacher uses between its per-module errors and `CaxtonError`.

use thiserror::Error;

use crate::domain_types::{ChannelId, MessageId, MetaDataId};

/// Bad input: filter, config, or expression validation failure. Not retried.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// A configuration value failed its domain-type validation.
    #[error("invalid configuration for {field}: {reason}")]
    InvalidConfig {
        /// Name of the offending field.
        field: String,
        /// Human-readable reason.
        reason: String,
    },
    /// A rule-builder field expression contains a rejected code-injection vector.
    #[error("unsafe field expression: {0}")]
    UnsafeExpression(String),
    /// A rule-builder field expression is empty.
    #[error("empty field expression")]
    EmptyExpression,
}

/// Script compile or execution failure, tagged with which error bit it sets on
/// the owning `ConnectorMessage` (processing / postprocessor / response).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ScriptError {
    /// The script failed to compile into the internal IR.
    #[error("script compile error: {0}")]
    Compile(String),
    /// The script ran but raised an error or trapped.
    #[error("script execution error: {0}")]
    Execution(String),
    /// The script exceeded its configured wall-clock timeout.
    #[error("script timed out")]
    Timeout,
    /// The script exceeded its configured fuel budget.
    #[error("script exhausted its fuel budget")]
    FuelExhausted,
}

/// Failure kinds returned by the Message Store.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// The channel's sharded tables do not exist (never deployed, or dropped).
    #[error("channel {0:?} has no message tables")]
    MissingTables(ChannelId),
    /// A row-level logical lock conflict; safe to retry.
    #[error("concurrent update conflict on channel {channel:?} message {message:?}")]
    Conflict {
        /// Channel the conflicting row belongs to.
        channel: ChannelId,
        /// Message the conflicting row belongs to.
        message: MessageId,
    },
    /// A transient I/O failure (pool exhaustion, lock timeout); safe to retry.
    #[error("transient storage failure: {0}")]
    Transient(String),
    /// An unrecoverable storage failure; the channel should stop.
    #[error("fatal storage failure: {0}")]
    Fatal(String),
}

impl StorageError {
    /// Whether the pipeline should retry this error as a transient failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Transient(_) | StorageError::Conflict { .. })
    }
}

/// Failure kinds returned by source/destination connector I/O.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectorError {
    /// Transient I/O failure; consumes a retry slot.
    #[error("retryable connector error: {0}")]
    Retryable(String),
    /// Permanent failure; surfaces as `ERROR` immediately.
    #[error("permanent connector error: {0}")]
    Permanent(String),
}

/// A deploy operation failed; the registry is left unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to deploy channel {channel:?}: {reason}")]
pub struct DeployFailure {
    /// Channel that failed to deploy.
    pub channel: ChannelId,
    /// Human-readable reason (usually a wrapped `ScriptError`/`ValidationError`).
    pub reason: String,
}

/// Top-level error uniting every module's leaf error. Mirrors the layering the
/// teacher uses between `CaxtonError` and `DatabaseError`/runtime-specific errors.
#[derive(Debug, Error)]
pub enum EngineError {
    /// See [`ValidationError`].
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// See [`ScriptError`].
    #[error(transparent)]
    Script(#[from] ScriptError),
    /// See [`StorageError`].
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// See [`ConnectorError`].
    #[error(transparent)]
    Connector(#[from] ConnectorError),
    /// See [`DeployFailure`].
    #[error(transparent)]
    Deploy(#[from] DeployFailure),
    /// A script's wall-clock or a connector send's timeout elapsed.
    #[error("operation timed out")]
    Timeout,
    /// The operation was cancelled (pruner abort token, channel stop).
    #[error("operation aborted")]
    Abort,
    /// No channel is deployed (or running, without `force`) for the given id.
    #[error("channel {0:?} is not deployed")]
    ChannelNotDeployed(ChannelId),
    /// A status transition was attempted that the lattice forbids.
    #[error("invalid status transition on channel {channel:?} message {message:?} meta {meta:?}")]
    InvalidStatusTransition {
        /// Offending channel.
        channel: ChannelId,
        /// Offending message.
        message: MessageId,
        /// Offending connector meta-data-id.
        meta: MetaDataId,
    },
    /// Wraps a lower-level I/O error (filesystem, archive writer).
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// Wraps a `sqlx` error not otherwise classified by [`StorageError`].
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
}
