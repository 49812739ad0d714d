//! The Channel Pipeline: runs one message through preprocess, source
//! filter/transform, destination fan-out, dispatch (with retry), response
//! transform, and postprocess, per `spec.md` §4.B.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::connector::DestinationConnector;
use crate::domain::channel::{ChannelConfig, StorageMode};
use crate::domain::message::{ConnectorMessage, Maps, Message, MessageContent, ResponseStatus};
use crate::domain_types::{ContentType, ConnectorMessageStatus, ErrorCode, MessageId, MetaDataId, ScriptFuelBudget, ScriptTimeoutMs, ServerId};
use crate::error::EngineError;
use crate::router::SourceChain;
use crate::script::compose::fold_filter_results;
use crate::script::ir::ScriptIr;
use crate::script::{ScriptKind, ScriptRuntime, ScriptScope, SecurityPolicy};
use crate::storage::MessageStore;

/// Which stages' content a channel's [`StorageMode`] persists to `MC`.
/// `Production`/`Development`/`Disabled` persist every stage (this
/// implementation does not model `Development`'s extra debug content beyond
/// what `Production` already keeps); `Raw` keeps only the raw and response
/// bytes; `Metadata` persists none.
struct ContentPolicy {
    raw: bool,
    intermediate: bool,
    response: bool,
}

impl From<StorageMode> for ContentPolicy {
    fn from(mode: StorageMode) -> Self {
        match mode {
            StorageMode::Metadata => Self { raw: false, intermediate: false, response: false },
            StorageMode::Raw => Self { raw: true, intermediate: false, response: true },
            StorageMode::Production | StorageMode::Development | StorageMode::Disabled => {
                Self { raw: true, intermediate: true, response: true }
            }
        }
    }
}

/// Renders a scoped map to the same JSON object shape used everywhere else a
/// map snapshot is persisted, so `MC` rows for the four map content types can
/// be read back into a `HashMap<String, String>` without a bespoke format.
fn maps_to_json(map: &HashMap<String, String>) -> String {
    serde_json::to_string(map).unwrap_or_default()
}

/// A compiled connector: its filter/transform chains plus, for destinations,
/// the live connector handle and retry policy.
pub struct CompiledConnector {
    /// Display name persisted to `MM.CONNECTOR_NAME`.
    pub name: String,
    /// Compiled filter chain, paired with each rule's combining operator.
    pub filter_chain: Vec<(ScriptIr, crate::domain::channel::BooleanOperator)>,
    /// Compiled transform chain, applied in order after filtering accepts.
    pub transform_chain: Vec<ScriptIr>,
    /// Live connector handle; `None` for the source (the source never sends).
    pub destination: Option<Arc<dyn DestinationConnector>>,
    /// Compiled response transformer, if any.
    pub response_transformer: Option<ScriptIr>,
    /// Retry ceiling for retryable send failures.
    pub retry_count: u32,
    /// Delay between retries.
    pub retry_delay_ms: u64,
}

/// Runs one channel's full message lifecycle.
pub struct ChannelPipeline<S: MessageStore> {
    config: ChannelConfig,
    store: Arc<S>,
    scripts: Arc<ScriptRuntime>,
    source: CompiledConnector,
    destinations: Vec<CompiledConnector>,
    preprocessor: Option<ScriptIr>,
    postprocessor: Option<ScriptIr>,
    global_map: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
    global_channel_map: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
    configuration_map: HashMap<String, String>,
    server_id: ServerId,
}

impl<S: MessageStore> ChannelPipeline<S> {
    /// Builds a pipeline for an already-compiled channel.
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: ChannelConfig,
        store: Arc<S>,
        scripts: Arc<ScriptRuntime>,
        source: CompiledConnector,
        destinations: Vec<CompiledConnector>,
        preprocessor: Option<ScriptIr>,
        postprocessor: Option<ScriptIr>,
        global_map: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
        global_channel_map: Arc<tokio::sync::RwLock<HashMap<String, String>>>,
        configuration_map: HashMap<String, String>,
        server_id: ServerId,
    ) -> Self {
        Self {
            config,
            store,
            scripts,
            source,
            destinations,
            preprocessor,
            postprocessor,
            global_map,
            global_channel_map,
            configuration_map,
            server_id,
        }
    }

    /// Runs `raw_message` through the full pipeline and returns the allocated
    /// message id once every destination has reached a terminal status and the
    /// postprocessor has run.
    ///
    /// # Errors
    ///
    /// Propagates [`crate::error::StorageError`] from the message store, or a
    /// script compile/execution error from any hook.
    #[instrument(skip(self, raw_message, source_maps, chain), fields(channel = %self.config.id.as_ref()))]
    pub async fn process(&self, raw_message: Vec<u8>, source_maps: Maps, chain: SourceChain) -> Result<MessageId, EngineError> {
        let message_id = self.store.next_message_id(&self.config.id).await?;
        let received_date = Utc::now();
        let message = Message::received(message_id, self.config.id.clone(), self.server_id.clone(), received_date);
        self.store.insert_message(&message).await?;

        let policy: ContentPolicy = self.config.storage_mode.into();
        let mut content = String::from_utf8_lossy(&raw_message).into_owned();
        if policy.raw {
            self.store_content(message_id, MetaDataId::default(), ContentType::Raw, &content).await?;
        }
        if let Some(preprocessor) = &self.preprocessor {
            content = self.run_content_script(preprocessor, &content, &source_maps, ScriptKind::Preprocessor).await?;
            if policy.intermediate {
                self.store_content(message_id, MetaDataId::default(), ContentType::ProcessedRaw, &content).await?;
            }
        }

        let mut source_cm = ConnectorMessage::new(
            message_id,
            self.config.id.clone(),
            MetaDataId::default(),
            self.source.name.clone(),
            received_date,
            0,
        );
        source_cm.maps = source_maps;
        self.store.insert_connector_message(&source_cm).await?;
        if policy.intermediate {
            self.store_source_map(message_id, MetaDataId::default(), &source_cm.maps).await?;
        }

        let accepted = self.evaluate_filter_chain(&self.source.filter_chain, &content, &source_cm.maps).await?;
        if !accepted {
            self.transition(&mut source_cm, ConnectorMessageStatus::Filtered, None, None).await?;
            self.store.mark_processed(&self.config.id, message_id).await?;
            info!("message rejected by source filter");
            return Ok(message_id);
        }

        content = self.run_transform_chain(&self.source.transform_chain, &content, &source_cm.maps).await?;
        self.transition(&mut source_cm, ConnectorMessageStatus::Transformed, None, None).await?;
        if policy.intermediate {
            self.store_content(message_id, MetaDataId::default(), ContentType::Transformed, &content).await?;
        }

        for (index, destination) in self.destinations.iter().enumerate() {
            self.run_destination(destination, index, message_id, &content, &source_cm.maps, &policy, &chain).await?;
        }

        if let Some(postprocessor) = &self.postprocessor {
            self.run_content_script(postprocessor, &content, &source_cm.maps, ScriptKind::Postprocessor).await?;
        }
        self.store.mark_processed(&self.config.id, message_id).await?;

        Ok(message_id)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_destination(
        &self,
        destination: &CompiledConnector,
        index: usize,
        message_id: MessageId,
        content: &str,
        source_maps: &Maps,
        policy: &ContentPolicy,
        chain: &SourceChain,
    ) -> Result<(), EngineError> {
        let meta_data_id = MetaDataId::try_new(i32::try_from(index + 1).unwrap_or(i32::MAX))
            .expect("destination index is always non-negative");

        let mut cm = ConnectorMessage::new(message_id, self.config.id.clone(), meta_data_id, destination.name.clone(), Utc::now(), 0);
        cm.maps.source_map = source_maps.source_map.clone();
        self.store.insert_connector_message(&cm).await?;
        if policy.intermediate {
            self.store_source_map(message_id, meta_data_id, &cm.maps).await?;
        }

        let accepted = self.evaluate_filter_chain(&destination.filter_chain, content, &cm.maps).await?;
        if !accepted {
            self.transition(&mut cm, ConnectorMessageStatus::Filtered, None, None).await?;
            return Ok(());
        }

        let transformed = self.run_transform_chain(&destination.transform_chain, content, &cm.maps).await?;
        self.transition(&mut cm, ConnectorMessageStatus::Transformed, None, None).await?;
        if policy.intermediate {
            self.store_content(message_id, meta_data_id, ContentType::Transformed, &transformed).await?;
            self.store_content(message_id, meta_data_id, ContentType::ConnectorMap, &maps_to_json(&cm.maps.connector_map)).await?;
            self.store_content(message_id, meta_data_id, ContentType::ChannelMap, &maps_to_json(&cm.maps.channel_map)).await?;
        }
        self.transition(&mut cm, ConnectorMessageStatus::Pending, None, None).await?;

        let Some(connector) = &destination.destination else {
            return Ok(());
        };

        let mut attempts = 0u32;
        loop {
            self.transition(&mut cm, ConnectorMessageStatus::Queued, Some(attempts + 1), None).await?;
            match connector.send(transformed.as_bytes(), message_id, chain).await {
                Ok(response) => {
                    let raw_response = response.message.clone().unwrap_or_default();
                    if policy.response {
                        self.store_content(message_id, meta_data_id, ContentType::Response, &raw_response).await?;
                    }
                    match response.status {
                        ResponseStatus::Queued if attempts < destination.retry_count => {
                            attempts += 1;
                            warn!(attempt = attempts, "destination returned QUEUED, retrying");
                            tokio::time::sleep(std::time::Duration::from_millis(destination.retry_delay_ms)).await;
                        }
                        ResponseStatus::Queued => {
                            let detail = "destination left message QUEUED after exhausting retries".to_string();
                            self.transition(
                                &mut cm,
                                ConnectorMessageStatus::Error,
                                Some(attempts + 1),
                                Some((ErrorCode::NONE.with_processing(), detail)),
                            )
                            .await?;
                            return Ok(());
                        }
                        ResponseStatus::Error => {
                            let detail = response.error_detail.clone().unwrap_or(raw_response);
                            self.transition(
                                &mut cm,
                                ConnectorMessageStatus::Error,
                                Some(attempts + 1),
                                Some((ErrorCode::NONE.with_processing(), detail)),
                            )
                            .await?;
                            return Ok(());
                        }
                        _ => {
                            if policy.response {
                                if let Some(response_transformer) = &destination.response_transformer {
                                    let transformed_response = self
                                        .run_content_script(response_transformer, &raw_response, &cm.maps, ScriptKind::ResponseTransform)
                                        .await?;
                                    self.store_content(
                                        message_id,
                                        meta_data_id,
                                        ContentType::ResponseTransformed,
                                        &transformed_response,
                                    )
                                    .await?;
                                    self.store_content(
                                        message_id,
                                        meta_data_id,
                                        ContentType::ResponseMap,
                                        &maps_to_json(&cm.maps.response_map),
                                    )
                                    .await?;
                                }
                            }
                            self.transition(&mut cm, ConnectorMessageStatus::Sent, None, None).await?;
                            return Ok(());
                        }
                    }
                }
                Err(crate::error::ConnectorError::Retryable(reason)) if attempts < destination.retry_count => {
                    attempts += 1;
                    warn!(attempt = attempts, %reason, "retrying destination send");
                    tokio::time::sleep(std::time::Duration::from_millis(destination.retry_delay_ms)).await;
                }
                Err(e) => {
                    let detail = e.to_string();
                    self.transition(&mut cm, ConnectorMessageStatus::Error, Some(attempts + 1), Some((ErrorCode::NONE.with_processing(), detail)))
                        .await?;
                    return Ok(());
                }
            }
        }
    }

    async fn store_content(
        &self,
        message_id: MessageId,
        meta_data_id: MetaDataId,
        content_type: ContentType,
        content: &str,
    ) -> Result<(), EngineError> {
        self.store
            .insert_content(
                &self.config.id,
                &MessageContent {
                    message_id,
                    meta_data_id,
                    content_type,
                    content: content.to_string(),
                    data_type: "text".to_string(),
                    is_encrypted: false,
                },
            )
            .await?;
        Ok(())
    }

    async fn store_source_map(&self, message_id: MessageId, meta_data_id: MetaDataId, maps: &Maps) -> Result<(), EngineError> {
        self.store_content(message_id, meta_data_id, ContentType::SourceMap, &maps_to_json(&maps.source_map)).await
    }

    async fn transition(
        &self,
        cm: &mut ConnectorMessage,
        next: ConnectorMessageStatus,
        send_attempts: Option<u32>,
        error: Option<(ErrorCode, String)>,
    ) -> Result<(), EngineError> {
        if !cm.try_transition(next) {
            return Err(EngineError::InvalidStatusTransition {
                channel: self.config.id.clone(),
                message: cm.message_id,
                meta: cm.meta_data_id,
            });
        }
        self.store
            .update_connector_message_status(&self.config.id, cm.message_id, cm.meta_data_id, next, send_attempts, error, Utc::now())
            .await?;
        Ok(())
    }

    async fn evaluate_filter_chain(
        &self,
        chain: &[(ScriptIr, crate::domain::channel::BooleanOperator)],
        content: &str,
        maps: &Maps,
    ) -> Result<bool, EngineError> {
        let mut results = Vec::with_capacity(chain.len());
        for (step, operator) in chain {
            let scope = self.build_scope(ScriptKind::FilterTransform, Some(content.to_string()), maps).await;
            let result = self
                .scripts
                .evaluate_step(step, scope, SecurityPolicy::message_script(), ScriptFuelBudget::default(), ScriptTimeoutMs::default())
                .await
                .map_err(crate::error::EngineError::from)?;
            results.push((result.accepted, *operator));
        }
        Ok(fold_filter_results(results))
    }

    async fn run_transform_chain(&self, chain: &[ScriptIr], content: &str, maps: &Maps) -> Result<String, EngineError> {
        let mut current = content.to_string();
        for step in chain {
            current = self.run_content_script(step, &current, maps, ScriptKind::FilterTransform).await?;
        }
        Ok(current)
    }

    async fn run_content_script(&self, step: &ScriptIr, content: &str, maps: &Maps, kind: ScriptKind) -> Result<String, EngineError> {
        let scope = self.build_scope(kind, Some(content.to_string()), maps).await;
        let result = self
            .scripts
            .evaluate_step(step, scope, SecurityPolicy::message_script(), ScriptFuelBudget::default(), ScriptTimeoutMs::default())
            .await
            .map_err(crate::error::EngineError::from)?;
        Ok(result.content.unwrap_or_else(|| content.to_string()))
    }

    async fn build_scope(&self, kind: ScriptKind, content: Option<String>, maps: &Maps) -> ScriptScope {
        let global_map = self.global_map.read().await.clone();
        let global_channel_map = self.global_channel_map.read().await.clone();
        ScriptScope::compose(kind, content, maps, global_map, global_channel_map, self.configuration_map.clone())
    }
}
