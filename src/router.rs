//! The VM Router: dispatches a raw message into a channel from either an
//! external connector or another channel's `Vm`-transport destination,
//! propagating the source chain across hops.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::instrument;

use crate::domain::message::Maps;
use crate::domain_types::{ChannelId, MessageId};
use crate::error::EngineError;

/// Identifiers propagated across a VM hop so a destination channel's
/// processing can be traced back to the channel/message that dispatched it.
#[derive(Debug, Clone, Default)]
pub struct SourceChain {
    /// Every channel id in the hop chain, oldest first.
    pub source_channel_ids: Vec<ChannelId>,
    /// Every message id in the hop chain, oldest first, aligned with
    /// `source_channel_ids`.
    pub source_message_ids: Vec<MessageId>,
}

impl SourceChain {
    /// Reserved source-map keys this chain populates. These are never
    /// overridden by user-declared source-map variables.
    #[must_use]
    pub fn reserved_keys() -> &'static [&'static str] {
        &["sourceChannelId", "sourceMessageId", "sourceChannelIds", "sourceMessageIds"]
    }

    /// Extends the chain with the current hop (`channel`/`message_id`, the
    /// channel and message presently dispatching into the target channel) and
    /// writes the reserved keys into `maps.source_map`, overwriting anything
    /// already there. `sourceChannelId`/`sourceMessageId` are always the
    /// current hop; `sourceChannelIds`/`sourceMessageIds` are `self`'s chain
    /// with the current hop appended.
    pub fn propagate_into(&self, channel: ChannelId, message_id: MessageId, maps: &mut Maps) {
        maps.source_map.insert("sourceChannelId".to_string(), channel.as_ref().to_string());
        maps.source_map.insert("sourceMessageId".to_string(), message_id.into_inner().to_string());

        let mut channel_ids = self.source_channel_ids.clone();
        let mut message_ids = self.source_message_ids.clone();
        channel_ids.push(channel);
        message_ids.push(message_id);

        maps.source_map.insert(
            "sourceChannelIds".to_string(),
            channel_ids.iter().map(|c| c.as_ref().to_string()).collect::<Vec<_>>().join(","),
        );
        maps.source_map.insert(
            "sourceMessageIds".to_string(),
            message_ids.iter().map(|m| m.into_inner().to_string()).collect::<Vec<_>>().join(","),
        );
    }

    /// Returns the chain extended with the current hop, for handing to a VM
    /// destination so the next hop's ancestor chain includes this one.
    #[must_use]
    pub fn extended(&self, channel: ChannelId, message_id: MessageId) -> Self {
        let mut channel_ids = self.source_channel_ids.clone();
        let mut message_ids = self.source_message_ids.clone();
        channel_ids.push(channel);
        message_ids.push(message_id);
        Self { source_channel_ids: channel_ids, source_message_ids: message_ids }
    }
}

/// Dispatch outcome: either the call blocked until completion (`waitForCompletion`)
/// and returns the dispatched message id, or it returned immediately after
/// queuing.
#[derive(Debug, Clone, Copy)]
pub enum DispatchOutcome {
    /// Dispatched and, if `wait_for_completion` was set, fully processed.
    Dispatched(MessageId),
    /// The target channel is not deployed (or not running, without `force`).
    NotDeployed,
}

/// Callback the router uses to actually hand a raw message to a channel's
/// pipeline, kept as a trait object so `router` doesn't depend on `engine`'s
/// concrete type.
#[async_trait::async_trait]
pub trait PipelineDispatch: Send + Sync {
    /// Runs `raw_message` through `channel`'s full pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::ChannelNotDeployed`] if `channel` isn't
    /// deployed, or not running unless `force` is set.
    async fn dispatch_raw_message(
        &self,
        channel: &ChannelId,
        raw_message: Vec<u8>,
        chain: SourceChain,
        force: bool,
        wait_for_completion: bool,
    ) -> Result<MessageId, EngineError>;
}

/// Resolves `${variable}` placeholders in connector properties and routes raw
/// messages to deployed channels, propagating the source chain.
pub struct VmRouter {
    dispatcher: Arc<dyn PipelineDispatch>,
}

impl VmRouter {
    /// Builds a router around a dispatch callback.
    #[must_use]
    pub fn new(dispatcher: Arc<dyn PipelineDispatch>) -> Self {
        Self { dispatcher }
    }

    /// Routes a raw message into `channel`, extending `chain` with the new hop.
    ///
    /// # Errors
    ///
    /// Propagates [`EngineError::ChannelNotDeployed`] from the dispatcher.
    #[instrument(skip(self, raw_message, chain), fields(channel = %channel.as_ref()))]
    pub async fn dispatch_raw_message(
        &self,
        channel: &ChannelId,
        raw_message: Vec<u8>,
        chain: SourceChain,
        force: bool,
        wait_for_completion: bool,
    ) -> Result<MessageId, EngineError> {
        self.dispatcher.dispatch_raw_message(channel, raw_message, chain, force, wait_for_completion).await
    }

    /// Resolves `${key}` placeholders in `template` using the exact scope
    /// order the VM Router and `replaceConnectorProperties` share: response
    /// map, connector map, channel map, source map, global-channel map,
    /// global map, then configuration-map parameters.
    #[must_use]
    pub fn replace_connector_properties(
        template: &str,
        maps: &Maps,
        global_channel_map: &HashMap<String, String>,
        global_map: &HashMap<String, String>,
        configuration_map: &HashMap<String, String>,
    ) -> String {
        let mut result = String::with_capacity(template.len());
        let mut rest = template;
        while let Some(start) = rest.find("${") {
            result.push_str(&rest[..start]);
            let Some(end) = rest[start..].find('}') else {
                result.push_str(&rest[start..]);
                return result;
            };
            let key = &rest[start + 2..start + end];
            if let Some(value) = maps.resolve(key, global_channel_map, global_map, configuration_map) {
                result.push_str(value);
            }
            rest = &rest[start + end + 1..];
        }
        result.push_str(rest);
        result
    }
}

/// Adapts [`VmRouter`] to the generic [`crate::connector::DestinationConnector`]
/// surface so a `Vm`-transport destination fans out through `send` like any
/// other transport. `send` extends the dispatching message's own chain with
/// `source_channel` (the channel this destination belongs to) before handing
/// it to `target`, so the chain of custody survives the hop.
pub struct VmDestinationConnector {
    router: Arc<VmRouter>,
    source_channel: ChannelId,
    target: ChannelId,
}

impl VmDestinationConnector {
    /// Builds a destination on `source_channel` that routes sent payloads to
    /// `target` via `router`.
    #[must_use]
    pub fn new(router: Arc<VmRouter>, source_channel: ChannelId, target: ChannelId) -> Self {
        Self { router, source_channel, target }
    }
}

#[async_trait::async_trait]
impl crate::connector::DestinationConnector for VmDestinationConnector {
    fn transport(&self) -> crate::domain::channel::TransportKind {
        crate::domain::channel::TransportKind::Vm
    }

    async fn start(&self) -> Result<(), crate::error::ConnectorError> {
        Ok(())
    }

    async fn stop(&self) -> Result<(), crate::error::ConnectorError> {
        Ok(())
    }

    async fn send(
        &self,
        payload: &[u8],
        message_id: MessageId,
        chain: &SourceChain,
    ) -> Result<crate::domain::message::Response, crate::error::ConnectorError> {
        let extended = chain.extended(self.source_channel.clone(), message_id);
        self.router
            .dispatch_raw_message(&self.target, payload.to_vec(), extended, false, false)
            .await
            .map(|_| crate::domain::message::Response::sent())
            .map_err(|e| crate::error::ConnectorError::Permanent(e.to_string()))
    }

    fn status(&self) -> crate::connector::ConnectorStatusEvent {
        crate::connector::ConnectorStatusEvent::Idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn propagate_into_sets_reserved_keys_and_extends_chain() {
        let chain = SourceChain::default();
        let mut maps = Maps::default();
        let first_channel = ChannelId::try_new("inbound").unwrap();
        let first_message = MessageId::try_new(1).unwrap();
        chain.propagate_into(first_channel, first_message, &mut maps);

        assert_eq!(maps.source_map.get("sourceChannelId"), Some(&"inbound".to_string()));
        assert_eq!(maps.source_map.get("sourceMessageId"), Some(&"1".to_string()));
        assert_eq!(maps.source_map.get("sourceChannelIds"), Some(&"inbound".to_string()));
    }

    #[test]
    fn propagate_into_extends_an_existing_chain() {
        let chain = SourceChain {
            source_channel_ids: vec![ChannelId::try_new("z").unwrap()],
            source_message_ids: vec![MessageId::try_new(9).unwrap()],
        };
        let mut maps = Maps::default();
        let channel_a = ChannelId::try_new("a").unwrap();
        let message_a = MessageId::try_new(5).unwrap();
        chain.propagate_into(channel_a, message_a, &mut maps);

        assert_eq!(maps.source_map.get("sourceChannelId"), Some(&"a".to_string()));
        assert_eq!(maps.source_map.get("sourceMessageId"), Some(&"5".to_string()));
        assert_eq!(maps.source_map.get("sourceChannelIds"), Some(&"z,a".to_string()));
    }

    #[test]
    fn replace_connector_properties_resolves_from_channel_map() {
        let mut maps = Maps::default();
        maps.channel_map.insert("host".to_string(), "10.0.0.1".to_string());
        let result = VmRouter::replace_connector_properties(
            "tcp://${host}:2575",
            &maps,
            &HashMap::new(),
            &HashMap::new(),
            &HashMap::new(),
        );
        assert_eq!(result, "tcp://10.0.0.1:2575");
    }

    #[test]
    fn replace_connector_properties_leaves_unresolved_placeholder_empty() {
        let maps = Maps::default();
        let result =
            VmRouter::replace_connector_properties("${missing}", &maps, &HashMap::new(), &HashMap::new(), &HashMap::new());
        assert_eq!(result, "");
    }
}
