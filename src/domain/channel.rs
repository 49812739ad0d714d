//! Channel configuration: the static, externally-authored shape of a message
//! processor. Runtime state (deployed/running, worker pool, script cache) lives in
//! [`crate::engine`], mirroring the split between this struct and its deployed
//! wrapper the same way the teacher splits `domain::deployment` config from
//! `runtime::Agent` runtime state.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::domain_types::{ChannelId, RetentionDays, WorkerCount};

/// How aggressively a channel persists stage content.
///
/// `Production` is the default: every stage's content is persisted. `Development`
/// additionally keeps intermediate debug content that `Production` may omit.
/// `Raw` persists only the raw/response content, skipping intermediate stages.
/// `Metadata` persists no content at all, only `ConnectorMessage` rows and
/// statistics. `Disabled` means the channel is excluded from the Pruner entirely.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StorageMode {
    /// Persist everything, including intermediate debug content.
    Development,
    /// Persist every stage's content (the default).
    Production,
    /// Persist only raw and response content.
    Raw,
    /// Persist no content, only `ConnectorMessage` rows and statistics.
    Metadata,
    /// Channel is not subject to the pruner and is skipped by its run algorithm.
    Disabled,
}

/// Transport kind tag for a connector, per `spec.md` §9's "small capability set
/// plus a tagged variant" design note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// File drop (local or mounted directory).
    File,
    /// SFTP poll/drop.
    Sftp,
    /// FTP poll/drop.
    Ftp,
    /// SMB share poll/drop.
    Smb,
    /// S3-compatible object store poll/drop.
    S3,
    /// In-process VM hop to another channel.
    Vm,
    /// HTTP listener or client.
    Http,
    /// A user script acting as source or destination (e.g. a webhook handler).
    Script,
}

/// A single filter rule: a compiled field expression plus the boolean operator
/// used to combine it with the rules before it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRule {
    /// Whether this rule currently participates in evaluation.
    pub enabled: bool,
    /// The field expression source, validated by the rule-builder before compile.
    pub expression: String,
    /// How this rule's result combines with the accumulated result so far.
    pub operator: BooleanOperator,
}

/// Combinator for [`FilterRule`] results, evaluated left to right in declared order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BooleanOperator {
    /// Logical AND with the accumulated result.
    And,
    /// Logical OR with the accumulated result.
    Or,
}

/// A single transformer step: a script fragment or a structured mapper/rule-builder
/// configuration compiled to the same internal IR (`spec.md` §4.C).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransformerStep {
    /// Whether this step currently participates in the transform.
    pub enabled: bool,
    /// Script source, or a compiled-at-deploy-time mapper/rule-builder expression.
    pub source: String,
}

/// Shared connector shape: name, transport kind, connection properties, and the
/// filter/transform units evaluated for this connector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectorConfig {
    /// Operator-facing connector name, persisted as `MM.CONNECTOR_NAME`.
    pub name: String,
    /// Transport this connector speaks.
    pub transport: TransportKind,
    /// Connector properties; values may contain `${variable}` placeholders
    /// resolved by `replace_connector_properties` at send time.
    pub properties: HashMap<String, String>,
    /// Filter rules evaluated in declared order.
    pub filter_rules: Vec<FilterRule>,
    /// Transformer steps evaluated in declared order after filtering accepts.
    pub transformer_steps: Vec<TransformerStep>,
}

/// Source-only behavior: whether `dispatchRawMessage` blocks until every
/// destination reaches a terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SourceOptions {
    /// Block the caller until all destinations are terminal.
    pub wait_for_destinations: bool,
}

/// Destination-only behavior: response transform, retry ceiling, and queue policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationConfig {
    /// The shared connector shape.
    pub connector: ConnectorConfig,
    /// Script run against the `Response`, may mutate status/message/error.
    pub response_transformer: Option<String>,
    /// Number of retry attempts on a retryable send failure.
    pub retry_count: u32,
    /// Whether the connector is allowed to requeue itself (`QUEUED -> QUEUED`).
    pub queue_enabled: bool,
    /// Delay between retry attempts.
    pub retry_delay_ms: u64,
}

/// Channel-level script hooks outside the per-connector filter/transform units.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScriptSet {
    /// Runs once after the global preprocessor, before source filter/transform.
    pub preprocessor: Option<String>,
    /// Runs once after every destination reaches a terminal status.
    pub postprocessor: Option<String>,
    /// Runs at deploy time, before the channel accepts messages.
    pub deploy: Option<String>,
    /// Runs at undeploy time, after in-flight messages drain.
    pub undeploy: Option<String>,
}

/// The externally-authored, static shape of a message processor.
///
/// Invariant: at most one deployed runtime instance exists per [`ChannelId`] at a
/// time; enforced by [`crate::engine::EngineController`]'s registry, not here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Stable identifier; also the SQL table-name suffix (sanitized).
    pub id: ChannelId,
    /// Operator-facing display name.
    pub name: String,
    /// Whether the channel is eligible for deploy at all.
    pub enabled: bool,
    /// How aggressively this channel persists stage content.
    pub storage_mode: StorageMode,
    /// The single source connector.
    pub source: ConnectorConfig,
    /// Source-only dispatch behavior.
    pub source_options: SourceOptions,
    /// Destinations in configured dispatch order.
    pub destinations: Vec<DestinationConfig>,
    /// Whether destinations dispatch in parallel (still serialized per destination).
    pub dispatch_parallel: bool,
    /// Channel-level script hooks.
    pub scripts: ScriptSet,
    /// Number of messages this channel may process concurrently.
    pub worker_count: WorkerCount,
    /// Metadata + content retention in days; `None` disables metadata pruning.
    pub prune_metadata_days: Option<RetentionDays>,
    /// Content-only retention in days; `None` disables content-only pruning.
    pub prune_content_days: Option<RetentionDays>,
}

/// Convenience alias: a fully configured [`ChannelConfig`] is what `deploy()` and
/// the registry key on; re-exported as `Channel` since it's the user-facing noun.
pub type Channel = ChannelConfig;
