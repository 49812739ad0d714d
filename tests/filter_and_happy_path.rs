//! Source filter rejection and the two-destination happy path, per the
//! channel pipeline's documented concrete scenarios.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use conduit::domain::message::Maps;
use conduit::domain_types::{ContentType, ConnectorMessageStatus, MetaDataId, ServerId};
use conduit::pipeline::{ChannelPipeline, CompiledConnector};
use conduit::router::SourceChain;
use conduit::script::ScriptRuntime;
use conduit::storage::MessageStore;

use common::{RespondingDestination, enabled_rule, minimal_channel_config, store_from, test_db};

fn empty_maps() -> tokio::sync::RwLock<HashMap<String, String>> {
    tokio::sync::RwLock::new(HashMap::new())
}

#[tokio::test]
async fn filter_reject_stops_before_any_destination() {
    let (_dir, conn) = test_db().await;
    let raw_conn = conn.clone();
    let store = store_from(conn);
    let channel_id = conduit::domain_types::ChannelId::try_new("chan_filter").unwrap();
    store.ensure_channel_tables(&channel_id).await.unwrap();

    let mut config = minimal_channel_config("chan_filter");
    config.source.filter_rules = vec![enabled_rule("msg == BLOCK")];

    let source = CompiledConnector {
        name: "source".to_string(),
        filter_chain: conduit::script::compose::compile_filter_chain(&config.source.filter_rules).unwrap(),
        transform_chain: vec![],
        destination: None,
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };

    let pipeline = ChannelPipeline::new(
        config,
        Arc::clone(&store),
        Arc::new(ScriptRuntime::new().unwrap()),
        source,
        vec![],
        None,
        None,
        Arc::new(empty_maps()),
        Arc::new(empty_maps()),
        HashMap::new(),
        ServerId::try_new("test-server").unwrap(),
    );

    let message_id = pipeline.process(b"BLOCK".to_vec(), Maps::default(), SourceChain::default()).await.unwrap();

    let bundle = store.fetch_message(&channel_id, message_id, false).await.unwrap().unwrap();
    assert_eq!(bundle.connector_messages.len(), 1, "only the source connector message should exist");
    assert_eq!(bundle.connector_messages[0].status, ConnectorMessageStatus::Filtered);
    assert_eq!(bundle.connector_messages[0].meta_data_id, MetaDataId::default());

    let ms_filtered: i64 = sqlx::query_scalar(&format!(
        "SELECT FILTERED FROM MS{} WHERE METADATA_ID = 0",
        conduit::storage::table_suffix(&channel_id)
    ))
    .fetch_one(raw_conn.pool())
    .await
    .unwrap();
    assert_eq!(ms_filtered, 1);
}

#[tokio::test]
async fn happy_path_with_two_destinations_sends_and_persists_responses() {
    let (_dir, conn) = test_db().await;
    let store = store_from(conn);
    let channel_id = conduit::domain_types::ChannelId::try_new("chan_happy").unwrap();
    store.ensure_channel_tables(&channel_id).await.unwrap();

    let config = minimal_channel_config("chan_happy");

    let source = CompiledConnector {
        name: "source".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: None,
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };

    let dest_a = CompiledConnector {
        name: "dest_a".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: Some(Arc::new(RespondingDestination { body: "ack-a".to_string() })),
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };
    let dest_b = CompiledConnector {
        name: "dest_b".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: Some(Arc::new(RespondingDestination { body: "ack-b".to_string() })),
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };

    let pipeline = ChannelPipeline::new(
        config,
        Arc::clone(&store),
        Arc::new(ScriptRuntime::new().unwrap()),
        source,
        vec![dest_a, dest_b],
        None,
        None,
        Arc::new(empty_maps()),
        Arc::new(empty_maps()),
        HashMap::new(),
        ServerId::try_new("test-server").unwrap(),
    );

    let message_id = pipeline.process(b"<v>ok</v>".to_vec(), Maps::default(), SourceChain::default()).await.unwrap();

    let bundle = store.fetch_message(&channel_id, message_id, true).await.unwrap().unwrap();
    assert!(bundle.message.processed);
    assert_eq!(bundle.connector_messages.len(), 3, "source + two destinations");

    assert_eq!(bundle.connector_messages[0].status, ConnectorMessageStatus::Transformed);
    assert_eq!(bundle.connector_messages[1].status, ConnectorMessageStatus::Sent);
    assert_eq!(bundle.connector_messages[2].status, ConnectorMessageStatus::Sent);

    let response_rows: Vec<_> =
        bundle.content.iter().filter(|c| c.content_type == ContentType::Response).collect();
    assert_eq!(response_rows.len(), 2);
    let bodies: Vec<&str> = response_rows.iter().map(|c| c.content.as_str()).collect();
    assert!(bodies.contains(&"ack-a"));
    assert!(bodies.contains(&"ack-b"));
}
