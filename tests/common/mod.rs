//! Shared test-support helpers: a fresh per-test SQLite database, minimal
//! channel configs, and stub destination connectors with configurable
//! failure/response behavior. Mirrors the patterns already established in
//! `engine.rs`'s and `connector.rs`'s own `#[cfg(test)]` modules — every test
//! builds its own tempdir-backed database so tests stay parallel-safe without
//! a serial-test harness.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use tempfile::TempDir;

use conduit::connector::{ConnectorStatusEvent, DestinationConnector};
use conduit::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
use conduit::domain::channel::{
    ChannelConfig, ConnectorConfig, FilterRule, ScriptSet, SourceOptions, StorageMode, TransportKind,
};
use conduit::domain::message::{Response, ResponseStatus};
use conduit::domain_types::{ChannelId, MessageId, WorkerCount};
use conduit::error::ConnectorError;
use conduit::router::SourceChain;
use conduit::storage::sqlite_store::SqliteMessageStore;

/// Opens a fresh on-disk SQLite database under its own tempdir. The `TempDir`
/// must be kept alive by the caller for as long as the connection is used.
pub async fn test_db() -> (TempDir, DatabaseConnection) {
    let dir = tempfile::tempdir().unwrap();
    let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
    let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.unwrap();
    (dir, conn)
}

/// A minimal channel: `Production` storage, an HTTP source with no filter or
/// transform rules, no destinations. Callers mutate the returned config to
/// add filter rules/destinations for their scenario.
pub fn minimal_channel_config(id: &str) -> ChannelConfig {
    ChannelConfig {
        id: ChannelId::try_new(id).unwrap(),
        name: id.to_string(),
        enabled: true,
        storage_mode: StorageMode::Production,
        source: ConnectorConfig {
            name: "source".to_string(),
            transport: TransportKind::Http,
            properties: HashMap::new(),
            filter_rules: vec![],
            transformer_steps: vec![],
        },
        source_options: SourceOptions::default(),
        destinations: vec![],
        dispatch_parallel: false,
        scripts: ScriptSet::default(),
        worker_count: WorkerCount::try_new(1).unwrap(),
        prune_metadata_days: None,
        prune_content_days: None,
    }
}

/// A single enabled filter rule with the `And` operator (the only operator
/// that matters for a chain of length one).
pub fn enabled_rule(expression: &str) -> FilterRule {
    FilterRule { enabled: true, expression: expression.to_string(), operator: conduit::domain::channel::BooleanOperator::And }
}

pub fn store_from(conn: DatabaseConnection) -> Arc<SqliteMessageStore> {
    Arc::new(SqliteMessageStore::new(conn))
}

/// Always returns a successful response with the given body.
pub struct RespondingDestination {
    pub body: String,
}

#[async_trait]
impl DestinationConnector for RespondingDestination {
    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }
    async fn start(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn send(&self, _payload: &[u8], _message_id: MessageId, _chain: &SourceChain) -> Result<Response, ConnectorError> {
        Ok(Response { status: ResponseStatus::Sent, message: Some(self.body.clone()), status_message: None, error_detail: None })
    }
    fn status(&self) -> ConnectorStatusEvent {
        ConnectorStatusEvent::Idle
    }
}

/// Fails with a retryable error on the first `fail_count` calls, then
/// succeeds. Tracks total calls made so a test can assert `SEND_ATTEMPTS`.
pub struct FlakyDestination {
    pub fail_count: u32,
    calls: AtomicU32,
}

impl FlakyDestination {
    #[must_use]
    pub fn new(fail_count: u32) -> Self {
        Self { fail_count, calls: AtomicU32::new(0) }
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DestinationConnector for FlakyDestination {
    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }
    async fn start(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn send(&self, _payload: &[u8], _message_id: MessageId, _chain: &SourceChain) -> Result<Response, ConnectorError> {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst);
        if attempt < self.fail_count {
            return Err(ConnectorError::Retryable(format!("transient failure {attempt}")));
        }
        Ok(Response::sent())
    }
    fn status(&self) -> ConnectorStatusEvent {
        ConnectorStatusEvent::Idle
    }
}

/// Always fails with a retryable error.
pub struct AlwaysFailDestination;

#[async_trait]
impl DestinationConnector for AlwaysFailDestination {
    fn transport(&self) -> TransportKind {
        TransportKind::Http
    }
    async fn start(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn stop(&self) -> Result<(), ConnectorError> {
        Ok(())
    }
    async fn send(&self, _payload: &[u8], _message_id: MessageId, _chain: &SourceChain) -> Result<Response, ConnectorError> {
        Err(ConnectorError::Retryable("destination unreachable".to_string()))
    }
    fn status(&self) -> ConnectorStatusEvent {
        ConnectorStatusEvent::Idle
    }
}
