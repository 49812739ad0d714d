//! Composes the set of variables visible to a script, per lifecycle point.
//!
//! Every script sees `channelMap` and `globalMap`/`globalChannelMap`, but only
//! per-message script kinds see `sourceMap`/`connectorMap`, and only response
//! transformers see `responseMap`. Getting this wrong would let a deploy
//! script read per-message data that doesn't exist yet, or let a filter
//! script see a response that hasn't arrived.

use std::collections::HashMap;

use crate::domain::message::Maps;
use crate::script::ir::ScriptKind;

/// The flattened variable scope handed to one script invocation.
#[derive(Debug, Clone, Default)]
pub struct ScriptScope {
    /// `msg`: the content being transformed, if this kind operates on content.
    pub message_content: Option<String>,
    /// Per-connector-message maps, filtered to what `kind` may see.
    pub maps: Maps,
    /// Shared across every channel instance.
    pub global_map: HashMap<String, String>,
    /// Shared across every connector of this channel.
    pub global_channel_map: HashMap<String, String>,
    /// Read-only key/value pairs from the `configuration` table.
    pub configuration_map: HashMap<String, String>,
}

impl ScriptScope {
    /// Builds the scope for `kind`, zeroing out maps that lifecycle point must
    /// not observe.
    #[must_use]
    pub fn compose(
        kind: ScriptKind,
        content: Option<String>,
        maps: &Maps,
        global_map: HashMap<String, String>,
        global_channel_map: HashMap<String, String>,
        configuration_map: HashMap<String, String>,
    ) -> Self {
        let mut scoped = maps.clone();
        match kind {
            ScriptKind::Deploy | ScriptKind::Undeploy => {
                scoped.source_map.clear();
                scoped.connector_map.clear();
                scoped.response_map.clear();
                Self {
                    message_content: None,
                    maps: scoped,
                    global_map,
                    global_channel_map,
                    configuration_map,
                }
            }
            ScriptKind::Preprocessor => {
                scoped.response_map.clear();
                Self { message_content: content, maps: scoped, global_map, global_channel_map, configuration_map }
            }
            ScriptKind::FilterTransform => {
                scoped.response_map.clear();
                Self { message_content: content, maps: scoped, global_map, global_channel_map, configuration_map }
            }
            ScriptKind::ResponseTransform => {
                Self { message_content: content, maps: scoped, global_map, global_channel_map, configuration_map }
            }
            ScriptKind::Postprocessor => {
                Self { message_content: content, maps: scoped, global_map, global_channel_map, configuration_map }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deploy_scope_clears_per_message_maps() {
        let mut maps = Maps::default();
        maps.source_map.insert("k".to_string(), "v".to_string());
        let scope = ScriptScope::compose(
            ScriptKind::Deploy,
            None,
            &maps,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        assert!(scope.maps.source_map.is_empty());
    }

    #[test]
    fn filter_transform_scope_clears_response_map() {
        let mut maps = Maps::default();
        maps.response_map.insert("k".to_string(), "v".to_string());
        let scope = ScriptScope::compose(
            ScriptKind::FilterTransform,
            Some("body".to_string()),
            &maps,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        assert!(scope.maps.response_map.is_empty());
        assert_eq!(scope.message_content.as_deref(), Some("body"));
    }

    #[test]
    fn response_transform_scope_keeps_response_map() {
        let mut maps = Maps::default();
        maps.response_map.insert("k".to_string(), "v".to_string());
        let scope = ScriptScope::compose(
            ScriptKind::ResponseTransform,
            None,
            &maps,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
        );
        assert_eq!(scope.maps.response_map.get("k"), Some(&"v".to_string()));
    }
}
