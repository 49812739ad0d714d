//! A source channel routes into a destination channel over a `Vm` hop; the
//! data pruner then removes the source channel's aged message while leaving
//! the destination channel untouched. The second test adds archiving.

mod common;

use std::collections::HashMap;
use std::sync::Arc;

use conduit::domain_types::{ChannelId, MessageId, RetentionDays};
use conduit::domain::pruning::{ArchiverOptions, PrunerConfig};
use conduit::engine::EngineController;
use conduit::pipeline::{ChannelPipeline, CompiledConnector};
use conduit::pruner::PrunerScheduler;
use conduit::router::{PipelineDispatch, SourceChain, VmDestinationConnector, VmRouter};
use conduit::script::ScriptRuntime;
use conduit::storage::MessageStore;
use conduit::storage::sqlite_store::SqliteMessageStore;

use common::{minimal_channel_config, test_db};

fn empty_maps() -> tokio::sync::RwLock<HashMap<String, String>> {
    tokio::sync::RwLock::new(HashMap::new())
}

async fn latest_message_id(raw_conn: &conduit::database::DatabaseConnection, channel: &ChannelId) -> MessageId {
    let id: i64 = sqlx::query_scalar(&format!("SELECT MAX(ID) FROM M{}", conduit::storage::table_suffix(channel)))
        .fetch_one(raw_conn.pool())
        .await
        .unwrap();
    MessageId::try_new(id).unwrap()
}

async fn backdate_received(raw_conn: &conduit::database::DatabaseConnection, channel: &ChannelId, message_id: MessageId, days_ago: i64) {
    let backdated = (chrono::Utc::now() - chrono::Duration::days(days_ago)).timestamp();
    sqlx::query(&format!("UPDATE M{} SET RECEIVED_DATE = ? WHERE ID = ?", conduit::storage::table_suffix(channel)))
        .bind(backdated)
        .bind(message_id.into_inner())
        .execute(raw_conn.pool())
        .await
        .unwrap();
}

/// Builds two deployed, running channels (`a` -> VM -> `b`) sharing one
/// engine and store, `a` configured with the given metadata retention.
async fn build_two_channel_topology(
    store: Arc<SqliteMessageStore>,
    retention_days: Option<u32>,
) -> (Arc<EngineController<SqliteMessageStore>>, ChannelId, ChannelId) {
    let a_id = ChannelId::try_new("chan_vm_a").unwrap();
    let b_id = ChannelId::try_new("chan_vm_b").unwrap();

    let mut config_a = minimal_channel_config("chan_vm_a");
    config_a.prune_metadata_days = retention_days.map(|d| RetentionDays::try_new(d).unwrap());
    let config_b = minimal_channel_config("chan_vm_b");

    let controller = Arc::new(EngineController::new(Arc::clone(&store)));
    controller.deploy(config_a.clone()).await.unwrap();
    controller.deploy(config_b.clone()).await.unwrap();
    controller.start(&a_id).unwrap();
    controller.start(&b_id).unwrap();

    let router = Arc::new(VmRouter::new(Arc::clone(&controller) as Arc<dyn PipelineDispatch>));

    let source_a = CompiledConnector {
        name: "source".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: None,
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };
    let vm_dest = CompiledConnector {
        name: "to_b".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: Some(Arc::new(VmDestinationConnector::new(Arc::clone(&router), a_id.clone(), b_id.clone()))),
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };
    let pipeline_a = Arc::new(ChannelPipeline::new(
        config_a,
        Arc::clone(&store),
        Arc::new(ScriptRuntime::new().unwrap()),
        source_a,
        vec![vm_dest],
        None,
        None,
        Arc::new(empty_maps()),
        Arc::new(empty_maps()),
        HashMap::new(),
        conduit::domain_types::ServerId::try_new("test-server").unwrap(),
    ));
    controller.register_pipeline(&a_id, pipeline_a).unwrap();

    let source_b = CompiledConnector {
        name: "source".to_string(),
        filter_chain: vec![],
        transform_chain: vec![],
        destination: None,
        response_transformer: None,
        retry_count: 0,
        retry_delay_ms: 0,
    };
    let pipeline_b = Arc::new(ChannelPipeline::new(
        config_b,
        Arc::clone(&store),
        Arc::new(ScriptRuntime::new().unwrap()),
        source_b,
        vec![],
        None,
        None,
        Arc::new(empty_maps()),
        Arc::new(empty_maps()),
        HashMap::new(),
        conduit::domain_types::ServerId::try_new("test-server").unwrap(),
    ));
    controller.register_pipeline(&b_id, pipeline_b).unwrap();

    (controller, a_id, b_id)
}

#[tokio::test]
async fn vm_route_delivers_and_prune_removes_only_the_source_channel() {
    let (_dir, conn) = test_db().await;
    let raw_conn = conn.clone();
    let store = Arc::new(SqliteMessageStore::new(conn));

    let (controller, a_id, b_id) = build_two_channel_topology(Arc::clone(&store), Some(30)).await;

    let dispatcher: &dyn PipelineDispatch = &*controller;
    let message_id_a =
        dispatcher.dispatch_raw_message(&a_id, b"routed payload".to_vec(), SourceChain::default(), false, false).await.unwrap();

    let bundle_a = store.fetch_message(&a_id, message_id_a, false).await.unwrap().unwrap();
    assert!(bundle_a.message.processed);
    assert_eq!(bundle_a.connector_messages[1].status, conduit::domain_types::ConnectorMessageStatus::Sent);

    let message_id_b = latest_message_id(&raw_conn, &b_id).await;
    let bundle_b = store.fetch_message(&b_id, message_id_b, false).await.unwrap().unwrap();
    assert!(bundle_b.message.processed);

    let source_map_row = bundle_b
        .content
        .iter()
        .find(|c| c.content_type == conduit::domain_types::ContentType::SourceMap && c.meta_data_id == conduit::domain_types::MetaDataId::default())
        .expect("b's source connector message should carry a source-map snapshot");
    let source_map: serde_json::Value = serde_json::from_str(&source_map_row.content).unwrap();
    assert_eq!(source_map["sourceChannelId"], a_id.as_ref());
    assert_eq!(source_map["sourceMessageId"], message_id_a.into_inner().to_string());

    backdate_received(&raw_conn, &a_id, message_id_a, 40).await;

    let scheduler = PrunerScheduler::new(Arc::clone(&store), Arc::clone(&controller) as Arc<dyn conduit::pruner::ChannelSource>, PrunerConfig {
        archive_enabled: false,
        ..PrunerConfig::default()
    });
    let summary = scheduler.run_once().await;
    assert_eq!(summary.messages_deleted, 1);

    assert!(store.fetch_message(&a_id, message_id_a, false).await.unwrap().is_none());
    assert!(store.fetch_message(&b_id, message_id_b, false).await.unwrap().is_some());
}

#[tokio::test]
async fn archiving_writes_a_file_before_pruning() {
    let (_dir, conn) = test_db().await;
    let raw_conn = conn.clone();
    let store = Arc::new(SqliteMessageStore::new(conn));

    let (controller, a_id, _b_id) = build_two_channel_topology(Arc::clone(&store), Some(30)).await;

    let dispatcher: &dyn PipelineDispatch = &*controller;
    let message_id_a =
        dispatcher.dispatch_raw_message(&a_id, b"archive me".to_vec(), SourceChain::default(), false, false).await.unwrap();

    backdate_received(&raw_conn, &a_id, message_id_a, 40).await;

    let archive_dir = tempfile::tempdir().unwrap();
    let archiver_options = ArchiverOptions {
        root_folder: archive_dir.path().to_string_lossy().to_string(),
        gzip: true,
        ..ArchiverOptions::default()
    };

    let scheduler = PrunerScheduler::new(Arc::clone(&store), Arc::clone(&controller) as Arc<dyn conduit::pruner::ChannelSource>, PrunerConfig {
        archive_enabled: true,
        archiver_options,
        ..PrunerConfig::default()
    });
    let summary = scheduler.run_once().await;
    assert_eq!(summary.messages_archived, 1);
    assert_eq!(summary.messages_deleted, 0);

    assert!(store.fetch_message(&a_id, message_id_a, false).await.unwrap().is_none());

    let channel_dir = archive_dir.path().join(a_id.as_ref());
    let mut found = None;
    for day_entry in std::fs::read_dir(&channel_dir).unwrap() {
        let day_entry = day_entry.unwrap();
        for file_entry in std::fs::read_dir(day_entry.path()).unwrap() {
            let path = file_entry.unwrap().path();
            if path.extension().is_some_and(|ext| ext == "gz") {
                found = Some(path);
            }
        }
    }
    let archive_file = found.expect("an archive file should have been written");

    let options = ArchiverOptions { root_folder: archive_dir.path().to_string_lossy().to_string(), gzip: true, ..ArchiverOptions::default() };
    let raw = conduit::pruner::archiver::read_archive_batch(&archive_file, &options).unwrap();
    let line = String::from_utf8(raw).unwrap();
    let row: serde_json::Value = serde_json::from_str(line.trim()).unwrap();
    assert_eq!(row["message"]["id"].as_i64().unwrap(), message_id_a.into_inner());
    assert_eq!(row["connector_messages"].as_array().unwrap().len(), 2);

    // idempotent: a second run over the same (now-empty) window prunes nothing more.
    let second = scheduler.run_once().await;
    assert_eq!(second.messages_archived, 0);
}
