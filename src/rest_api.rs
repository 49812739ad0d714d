//! The management HTTP surface: channel lifecycle, message lookup, and Data
//! Pruner/Archiver control, per `spec.md` §6.1. A thin JSON-over-HTTP layer
//! around [`crate::engine::EngineController`] and [`crate::pruner::PrunerScheduler`],
//! mirroring the teacher's axum module split of routes/handlers/state.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::{Deserialize, Serialize};

use crate::domain::channel::ChannelConfig;
use crate::domain_types::{ChannelId, MessageId};
use crate::engine::EngineController;
use crate::error::EngineError;
use crate::pruner::PrunerScheduler;
use crate::router::{PipelineDispatch, SourceChain};
use crate::storage::{MessageStore, sqlite_store::SqliteMessageStore};

/// Shared state every handler reads from. Built once at startup (or, for
/// tests, by [`ApiState::for_testing`]) and wrapped in an `Arc`.
pub struct ApiState {
    engine: Arc<EngineController<SqliteMessageStore>>,
    store: Arc<SqliteMessageStore>,
    pruner: Arc<PrunerScheduler<SqliteMessageStore>>,
}

impl ApiState {
    /// Builds the production state around already-constructed collaborators.
    #[must_use]
    pub fn new(
        engine: Arc<EngineController<SqliteMessageStore>>,
        store: Arc<SqliteMessageStore>,
        pruner: Arc<PrunerScheduler<SqliteMessageStore>>,
    ) -> Self {
        Self { engine, store, pruner }
    }

    /// Builds a state around a fresh temp-file-backed store, for tests.
    #[cfg(test)]
    pub async fn for_testing() -> Self {
        use crate::database::{DatabaseConfig, DatabaseConnection, DatabasePath};
        use crate::domain::pruning::PrunerConfig;
        use crate::pruner::ChannelSource;

        let dir = tempfile::tempdir().expect("create temp dir");
        let path = DatabasePath::new(dir.path().join("test.db")).expect("valid path");
        // Leak the tempdir so the database file outlives this function; tests
        // only run for the process lifetime.
        std::mem::forget(dir);
        let conn = DatabaseConnection::initialize(DatabaseConfig::for_testing(path)).await.expect("init database");
        let store = Arc::new(SqliteMessageStore::new(conn));
        let engine = Arc::new(EngineController::new(Arc::clone(&store)));
        let channel_source: Arc<dyn ChannelSource> = Arc::clone(&engine);
        let pruner = Arc::new(PrunerScheduler::new(Arc::clone(&store), channel_source, PrunerConfig::default()));
        Self { engine, store, pruner }
    }
}

/// Builds the axum router. Split from [`ApiState`] construction so
/// integration tests can stand up the router without a real server.
#[must_use]
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/api/v1/health", get(health_check))
        .route("/api/v1/channels", get(list_channels))
        .route("/api/v1/channels/{id}/deploy", post(deploy_channel))
        .route("/api/v1/channels/{id}", delete(undeploy_channel))
        .route("/api/v1/channels/{id}/start", post(start_channel))
        .route("/api/v1/channels/{id}/stop", post(stop_channel))
        .route("/api/v1/channels/{id}/messages/_dispatch", post(dispatch_raw_message))
        .route("/api/v1/channels/{id}/messages/{message_id}", get(fetch_message))
        .route("/api/v1/extensions/datapruner/status", get(pruner_status))
        .route("/api/v1/extensions/datapruner/config", get(pruner_config))
        .route("/api/v1/extensions/datapruner/_start", post(pruner_start))
        .with_state(state)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct HealthCheckResponse {
    status: &'static str,
}

async fn health_check() -> Json<HealthCheckResponse> {
    Json(HealthCheckResponse { status: "healthy" })
}

#[derive(Debug, Clone, Serialize)]
struct ErrorResponse {
    error: String,
}

impl IntoResponse for EngineError {
    fn into_response(self) -> axum::response::Response {
        let status = match &self {
            EngineError::ChannelNotDeployed(_) => StatusCode::NOT_FOUND,
            EngineError::Validation(_) | EngineError::InvalidStatusTransition { .. } => StatusCode::BAD_REQUEST,
            EngineError::Deploy(_) => StatusCode::CONFLICT,
            EngineError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            EngineError::Abort => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::Script(_) | EngineError::Storage(_) | EngineError::Connector(_) | EngineError::Io(_) | EngineError::Sqlx(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(ErrorResponse { error: self.to_string() })).into_response()
    }
}

fn parse_channel_id(raw: &str) -> Result<ChannelId, EngineError> {
    ChannelId::try_new(raw.to_string())
        .map_err(|e| EngineError::Validation(crate::error::ValidationError::InvalidConfig { field: "id".to_string(), reason: e.to_string() }))
}

#[derive(Debug, Serialize)]
struct ChannelListResponse {
    channels: Vec<String>,
}

async fn list_channels(State(state): State<Arc<ApiState>>) -> Json<ChannelListResponse> {
    let channels = state.engine.deployed_channel_ids().into_iter().map(|id| id.as_ref().to_string()).collect();
    Json(ChannelListResponse { channels })
}

async fn deploy_channel(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(mut config): Json<ChannelConfig>,
) -> Result<StatusCode, EngineError> {
    config.id = parse_channel_id(&id)?;
    state.engine.deploy(config).await?;
    Ok(StatusCode::CREATED)
}

async fn undeploy_channel(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    let channel = parse_channel_id(&id)?;
    state.engine.undeploy(&channel).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_channel(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    let channel = parse_channel_id(&id)?;
    state.engine.start(&channel)?;
    Ok(StatusCode::OK)
}

async fn stop_channel(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Result<StatusCode, EngineError> {
    let channel = parse_channel_id(&id)?;
    state.engine.stop(&channel)?;
    Ok(StatusCode::OK)
}

#[derive(Debug, Deserialize)]
struct DispatchRequest {
    #[serde(with = "base64_body")]
    raw_message: Vec<u8>,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    wait_for_completion: bool,
}

#[derive(Debug, Serialize)]
struct DispatchResponse {
    message_id: i64,
}

async fn dispatch_raw_message(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<DispatchRequest>,
) -> Result<Json<DispatchResponse>, EngineError> {
    let channel = parse_channel_id(&id)?;
    let message_id = state
        .engine
        .dispatch_raw_message(&channel, request.raw_message, SourceChain::default(), request.force, request.wait_for_completion)
        .await?;
    Ok(Json(DispatchResponse { message_id: message_id.into_inner() }))
}

#[derive(Debug, Deserialize)]
struct FetchMessageQuery {
    #[serde(default, rename = "includeContent")]
    include_content: bool,
}

async fn fetch_message(
    State(state): State<Arc<ApiState>>,
    Path((id, message_id)): Path<(String, i64)>,
    Query(query): Query<FetchMessageQuery>,
) -> Result<Json<crate::storage::MessageBundle>, EngineError> {
    let channel = parse_channel_id(&id)?;
    let message_id = MessageId::try_new(message_id)
        .map_err(|e| EngineError::Validation(crate::error::ValidationError::InvalidConfig { field: "messageId".to_string(), reason: e.to_string() }))?;

    let bundle = state.store.fetch_message(&channel, message_id, query.include_content).await?;
    bundle.map(Json).ok_or_else(|| EngineError::ChannelNotDeployed(channel))
}

#[derive(Debug, Serialize)]
struct PrunerStatusResponse {
    running: bool,
}

async fn pruner_status(State(state): State<Arc<ApiState>>) -> Json<PrunerStatusResponse> {
    Json(PrunerStatusResponse { running: state.pruner.is_running() })
}

async fn pruner_config(State(state): State<Arc<ApiState>>) -> Json<crate::domain::pruning::PrunerConfig> {
    Json(state.pruner.config().clone())
}

#[derive(Debug, Serialize)]
struct PrunerRunResponse {
    channels_visited: u32,
    messages_deleted: u64,
    messages_archived: u64,
    channels_failed: u32,
}

async fn pruner_start(State(state): State<Arc<ApiState>>) -> Json<PrunerRunResponse> {
    let summary = state.pruner.run_once().await;
    Json(PrunerRunResponse {
        channels_visited: summary.channels_visited,
        messages_deleted: summary.messages_deleted,
        messages_archived: summary.messages_archived,
        channels_failed: summary.channels_failed,
    })
}

/// Base64 (standard, padded) encoding for the raw message bytes carried in a
/// dispatch request body, since JSON has no native byte-string type.
mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        STANDARD.decode(raw).map_err(serde::de::Error::custom)
    }
}
