//! The Engine Controller: owns the registry of deployed channels, enforces
//! the "at most one deployed instance per channel id" invariant, and is the
//! top-level entry point `dispatch_raw_message` and the REST surface call
//! into.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{info, instrument};

use crate::domain::channel::{ChannelConfig, StorageMode};
use crate::domain::message::Maps;
use crate::domain_types::{ChannelId, MessageId, ScriptFuelBudget, ScriptTimeoutMs};
use crate::error::{DeployFailure, EngineError};
use crate::pipeline::ChannelPipeline;
use crate::pruner::{ChannelSource, PrunableChannel};
use crate::router::{PipelineDispatch, SourceChain};
use crate::script::{ScriptIr, ScriptKind, ScriptRuntime, ScriptScope, SecurityPolicy};
use crate::storage::MessageStore;

/// Deploy/run state of one registry entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Tables exist, pipeline is compiled, but connectors haven't started.
    Deployed,
    /// Source connector is accepting messages.
    Running,
    /// `stop()` was called; in-flight messages are draining.
    Stopping,
}

struct DeployedChannel {
    config: ChannelConfig,
    state: RunState,
}

/// Owns the channel registry. Generic over the store so tests can swap in an
/// in-memory fake without touching SQLite.
pub struct EngineController<S: MessageStore> {
    store: Arc<S>,
    registry: DashMap<ChannelId, DeployedChannel>,
    pipelines: DashMap<ChannelId, Arc<ChannelPipeline<S>>>,
    scripts: Arc<ScriptRuntime>,
    global_deploy_script: Option<String>,
    global_undeploy_script: Option<String>,
}

impl<S: MessageStore> EngineController<S> {
    /// Builds a controller around a shared store, with no global deploy/undeploy
    /// scripts. Use [`Self::with_global_scripts`] to attach them.
    #[must_use]
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            registry: DashMap::new(),
            pipelines: DashMap::new(),
            scripts: Arc::new(ScriptRuntime::new().expect("wasmtime engine configures from a hardcoded, always-valid config")),
            global_deploy_script: None,
            global_undeploy_script: None,
        }
    }

    /// Attaches global deploy/undeploy script sources, run before every
    /// channel's own hook of the same kind (`spec.md` §4.G: "global then
    /// channel").
    #[must_use]
    pub fn with_global_scripts(mut self, deploy: Option<String>, undeploy: Option<String>) -> Self {
        self.global_deploy_script = deploy;
        self.global_undeploy_script = undeploy;
        self
    }

    /// Compiles and runs one deploy/undeploy script to completion.
    ///
    /// # Errors
    ///
    /// Returns [`DeployFailure`] if the script fails to compile or execute.
    async fn run_lifecycle_script(&self, channel: &ChannelId, source: &str, kind: ScriptKind) -> Result<(), DeployFailure> {
        let ir = ScriptIr::compile_script(kind, source)
            .map_err(|e| DeployFailure { channel: channel.clone(), reason: e.to_string() })?;
        let scope = ScriptScope::compose(kind, None, &Maps::default(), HashMap::new(), HashMap::new(), HashMap::new());
        self.scripts
            .evaluate_step(&ir, scope, SecurityPolicy::lifecycle_script(), ScriptFuelBudget::default(), ScriptTimeoutMs::default())
            .await
            .map_err(|e| DeployFailure { channel: channel.clone(), reason: e.to_string() })?;
        Ok(())
    }

    /// Registers the compiled pipeline for an already-deployed channel. The
    /// composition root (`main.rs`/CLI) builds the pipeline once it has
    /// constructed live destination connectors; the engine only needs the
    /// result to serve `dispatch_raw_message`.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChannelNotDeployed`] if `channel` isn't
    /// deployed.
    pub fn register_pipeline(&self, channel: &ChannelId, pipeline: Arc<ChannelPipeline<S>>) -> Result<(), EngineError> {
        if !self.registry.contains_key(channel) {
            return Err(EngineError::ChannelNotDeployed(channel.clone()));
        }
        self.pipelines.insert(channel.clone(), pipeline);
        Ok(())
    }

    /// Deploys `config`: creates its sharded tables and registers it as
    /// `Deployed` (not yet `Running`). Fails the whole operation, leaving the
    /// registry unchanged, if any step fails.
    ///
    /// # Errors
    ///
    /// Returns [`DeployFailure`] if the channel is already deployed, or if
    /// table creation fails.
    #[instrument(skip(self, config), fields(channel = %config.id.as_ref()))]
    pub async fn deploy(&self, config: ChannelConfig) -> Result<(), EngineError> {
        if self.registry.contains_key(&config.id) {
            return Err(DeployFailure { channel: config.id.clone(), reason: "already deployed".to_string() }.into());
        }

        self.store.ensure_channel_tables(&config.id).await.map_err(|e| DeployFailure {
            channel: config.id.clone(),
            reason: e.to_string(),
        })?;

        if let Some(source) = &self.global_deploy_script {
            self.run_lifecycle_script(&config.id, source, ScriptKind::Deploy).await?;
        }
        if let Some(source) = &config.scripts.deploy {
            self.run_lifecycle_script(&config.id, source, ScriptKind::Deploy).await?;
        }

        let id = config.id.clone();
        self.registry.insert(id.clone(), DeployedChannel { config, state: RunState::Deployed });
        info!(channel = %id.as_ref(), "channel deployed");
        Ok(())
    }

    /// Marks a deployed channel `Running`, allowing its source connector to
    /// accept messages.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChannelNotDeployed`] if `channel` isn't
    /// deployed.
    pub fn start(&self, channel: &ChannelId) -> Result<(), EngineError> {
        let mut entry = self.registry.get_mut(channel).ok_or_else(|| EngineError::ChannelNotDeployed(channel.clone()))?;
        entry.state = RunState::Running;
        Ok(())
    }

    /// Marks a running channel `Stopping`. Does not itself wait for in-flight
    /// messages; callers awaiting drain should track outstanding
    /// [`crate::pipeline::ChannelPipeline::process`] futures themselves.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChannelNotDeployed`] if `channel` isn't
    /// deployed.
    pub fn stop(&self, channel: &ChannelId) -> Result<(), EngineError> {
        let mut entry = self.registry.get_mut(channel).ok_or_else(|| EngineError::ChannelNotDeployed(channel.clone()))?;
        entry.state = RunState::Stopping;
        Ok(())
    }

    /// Removes a channel from the registry. Its sharded tables are left in
    /// place; only `deploy` creates tables, and only an explicit prune
    /// removes rows.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChannelNotDeployed`] if `channel` isn't
    /// deployed.
    pub async fn undeploy(&self, channel: &ChannelId) -> Result<(), EngineError> {
        if !self.registry.contains_key(channel) {
            return Err(EngineError::ChannelNotDeployed(channel.clone()));
        }

        if let Some(source) = &self.global_undeploy_script {
            self.run_lifecycle_script(channel, source, ScriptKind::Undeploy).await?;
        }
        if let Some(source) = self.registry.get(channel).and_then(|entry| entry.config.scripts.undeploy.clone()) {
            self.run_lifecycle_script(channel, &source, ScriptKind::Undeploy).await?;
        }

        self.registry.remove(channel);
        self.pipelines.remove(channel);
        info!(channel = %channel.as_ref(), "channel undeployed");
        Ok(())
    }

    /// Whether `channel` is deployed at all (any [`RunState`]).
    #[must_use]
    pub fn is_deployed(&self, channel: &ChannelId) -> bool {
        self.registry.contains_key(channel)
    }

    /// Whether a dispatch should be allowed: the channel is `Running`, or
    /// `force` was set and it's at least `Deployed`.
    #[must_use]
    pub fn dispatch_allowed(&self, channel: &ChannelId, force: bool) -> bool {
        self.registry.get(channel).is_some_and(|entry| force || entry.state == RunState::Running)
    }

    /// Snapshot of a deployed channel's config, for building its pipeline.
    #[must_use]
    pub fn channel_config(&self, channel: &ChannelId) -> Option<ChannelConfig> {
        self.registry.get(channel).map(|entry| entry.config.clone())
    }

    /// Every deployed channel id, for admin listing endpoints.
    #[must_use]
    pub fn deployed_channel_ids(&self) -> Vec<ChannelId> {
        self.registry.iter().map(|entry| entry.key().clone()).collect()
    }
}

/// Implements the VM Router's dispatch callback. `chain` is expected to
/// already include the dispatching hop as its last element (the router
/// pushes it before calling here); we drop that element to recover the
/// ancestor chain `SourceChain::propagate_into` expects, matching the
/// convention documented in `SourceChain`'s own tests.
#[async_trait]
impl<S: MessageStore + 'static> PipelineDispatch for EngineController<S> {
    async fn dispatch_raw_message(
        &self,
        channel: &ChannelId,
        raw_message: Vec<u8>,
        chain: SourceChain,
        force: bool,
        _wait_for_completion: bool,
    ) -> Result<MessageId, EngineError> {
        if !self.dispatch_allowed(channel, force) {
            return Err(EngineError::ChannelNotDeployed(channel.clone()));
        }
        let pipeline = self
            .pipelines
            .get(channel)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| EngineError::ChannelNotDeployed(channel.clone()))?;

        let mut maps = Maps::default();
        if let (Some(hop_channel), Some(hop_message)) = (chain.source_channel_ids.last(), chain.source_message_ids.last()) {
            let ancestor = SourceChain {
                source_channel_ids: chain.source_channel_ids[..chain.source_channel_ids.len() - 1].to_vec(),
                source_message_ids: chain.source_message_ids[..chain.source_message_ids.len() - 1].to_vec(),
            };
            ancestor.propagate_into(hop_channel.clone(), *hop_message, &mut maps);
        }

        pipeline.process(raw_message, maps, chain).await
    }
}

impl<S: MessageStore> ChannelSource for EngineController<S> {
    fn prunable_channels(&self) -> Vec<PrunableChannel> {
        self.registry
            .iter()
            .map(|entry| PrunableChannel {
                id: entry.key().clone(),
                storage_mode: entry.config.storage_mode,
                prune_metadata_days: entry.config.prune_metadata_days,
                prune_content_days: entry.config.prune_content_days,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
    use crate::domain::channel::{ConnectorConfig, ScriptSet, SourceOptions, TransportKind};
    use crate::domain_types::WorkerCount;
    use crate::storage::sqlite_store::SqliteMessageStore;
    use std::collections::HashMap;
    use tempfile::tempdir;

    fn sample_config(id: &str) -> ChannelConfig {
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

    const TRIVIAL_SCRIPT: &str = r#"
        (module
            (func (export "run") (result i32)
                i32.const 0))
    "#;

    async fn test_engine() -> EngineController<SqliteMessageStore> {
        let dir = tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("test.db")).unwrap();
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.unwrap();
        EngineController::new(Arc::new(SqliteMessageStore::new(conn)))
    }

    #[tokio::test]
    async fn deploy_then_start_allows_dispatch() {
        let engine = test_engine().await;
        let config = sample_config("c1");
        engine.deploy(config).await.unwrap();
        let channel = ChannelId::try_new("c1").unwrap();

        assert!(!engine.dispatch_allowed(&channel, false));
        engine.start(&channel).unwrap();
        assert!(engine.dispatch_allowed(&channel, false));
    }

    #[tokio::test]
    async fn double_deploy_fails() {
        let engine = test_engine().await;
        engine.deploy(sample_config("c1")).await.unwrap();
        let result = engine.deploy(sample_config("c1")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn force_dispatch_allowed_without_running() {
        let engine = test_engine().await;
        engine.deploy(sample_config("c1")).await.unwrap();
        let channel = ChannelId::try_new("c1").unwrap();
        assert!(engine.dispatch_allowed(&channel, true));
    }

    #[tokio::test]
    async fn undeploy_removes_from_registry() {
        let engine = test_engine().await;
        engine.deploy(sample_config("c1")).await.unwrap();
        let channel = ChannelId::try_new("c1").unwrap();
        engine.undeploy(&channel).await.unwrap();
        assert!(!engine.is_deployed(&channel));
    }

    #[tokio::test]
    async fn deploy_runs_the_channels_own_deploy_script() {
        let engine = test_engine().await;
        let mut config = sample_config("c1");
        config.scripts.deploy = Some(TRIVIAL_SCRIPT.to_string());
        engine.deploy(config).await.unwrap();
        assert!(engine.is_deployed(&ChannelId::try_new("c1").unwrap()));
    }

    #[tokio::test]
    async fn deploy_fails_and_leaves_registry_unchanged_when_the_deploy_script_does_not_compile() {
        let engine = test_engine().await;
        let mut config = sample_config("c1");
        config.scripts.deploy = Some("this is not valid wat".to_string());
        let result = engine.deploy(config).await;
        assert!(matches!(result, Err(EngineError::Deploy(_))));
        assert!(!engine.is_deployed(&ChannelId::try_new("c1").unwrap()));
    }

    #[tokio::test]
    async fn global_deploy_script_runs_alongside_the_channels_own() {
        let engine = test_engine().await.with_global_scripts(Some(TRIVIAL_SCRIPT.to_string()), Some(TRIVIAL_SCRIPT.to_string()));
        let mut config = sample_config("c1");
        config.scripts.deploy = Some(TRIVIAL_SCRIPT.to_string());
        config.scripts.undeploy = Some(TRIVIAL_SCRIPT.to_string());
        engine.deploy(config).await.unwrap();
        let channel = ChannelId::try_new("c1").unwrap();
        assert!(engine.is_deployed(&channel));
        engine.undeploy(&channel).await.unwrap();
        assert!(!engine.is_deployed(&channel));
    }

    #[tokio::test]
    async fn register_pipeline_fails_for_undeployed_channel() {
        let engine = test_engine().await;
        let channel = ChannelId::try_new("c1").unwrap();
        let pipeline = Arc::new(trivial_pipeline("c1").await);
        let result = engine.register_pipeline(&channel, pipeline);
        assert!(result.is_err());
    }

    async fn trivial_pipeline(id: &str) -> ChannelPipeline<SqliteMessageStore> {
        use crate::domain_types::ServerId;
        use crate::pipeline::CompiledConnector;
        use crate::script::ScriptRuntime;

        let dir = tempdir().unwrap();
        let path = DatabasePath::new(dir.path().join("pipeline.db")).unwrap();
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.unwrap();
        let store = Arc::new(SqliteMessageStore::new(conn));
        store.ensure_channel_tables(&ChannelId::try_new(id).unwrap()).await.unwrap();

        let source = CompiledConnector {
            name: "source".to_string(),
            filter_chain: vec![],
            transform_chain: vec![],
            destination: None,
            response_transformer: None,
            retry_count: 0,
            retry_delay_ms: 0,
        };
        ChannelPipeline::new(
            sample_config(id),
            store,
            Arc::new(ScriptRuntime::new().unwrap()),
            source,
            vec![],
            None,
            None,
            Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            Arc::new(tokio::sync::RwLock::new(HashMap::new())),
            HashMap::new(),
            ServerId::try_new("test-server").unwrap(),
        )
    }

    #[tokio::test]
    async fn dispatch_raw_message_runs_registered_pipeline_and_propagates_chain() {
        let engine = test_engine().await;
        let channel = ChannelId::try_new("c1").unwrap();
        engine.deploy(sample_config("c1")).await.unwrap();
        engine.start(&channel).unwrap();

        let pipeline = Arc::new(trivial_pipeline("c1").await);
        engine.register_pipeline(&channel, pipeline).unwrap();

        let upstream_channel = ChannelId::try_new("upstream").unwrap();
        let upstream_message = MessageId::try_new(7).unwrap();
        let chain =
            SourceChain { source_channel_ids: vec![upstream_channel], source_message_ids: vec![upstream_message] };

        let result = engine.dispatch_raw_message(&channel, b"hello".to_vec(), chain, false, false).await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn dispatch_raw_message_rejects_when_not_running() {
        let engine = test_engine().await;
        let channel = ChannelId::try_new("c1").unwrap();
        engine.deploy(sample_config("c1")).await.unwrap();

        let pipeline = Arc::new(trivial_pipeline("c1").await);
        engine.register_pipeline(&channel, pipeline).unwrap();

        let result = engine.dispatch_raw_message(&channel, b"hello".to_vec(), SourceChain::default(), false, false).await;
        assert!(result.is_err());
    }
}
