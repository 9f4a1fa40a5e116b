//! HTTP API Server
//!
//! Sync endpoints for remote nodes (`/sync/pull`, `/sync/push`,
//! `/sync/ack`) and a REST API for operators: status, batch listings,
//! batch overrides, reloads, SQL and schema events, and on-demand jobs.

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::config::ApiConfig;
use crate::engine::SyncEngine;
use crate::error::{Error, Result};
use crate::model::{IncomingBatchStatus, OutgoingBatchStatus};
use crate::transport::http::{FORBIDDEN, SERVICE_BUSY, SYNC_DISABLED};
use crate::transport::{encode_acks, parse_acks, Credentials, SyncEndpoint};

/// Default number of batches returned by the listing endpoints
const DEFAULT_LIMIT: i64 = 100;

/// HTTP API server
pub struct HttpServer {
    config: ApiConfig,
    engine: Arc<SyncEngine>,
}

impl HttpServer {
    pub fn new(config: ApiConfig, engine: Arc<SyncEngine>) -> Self {
        Self { config, engine }
    }

    /// Create the router
    pub fn router(engine: Arc<SyncEngine>) -> Router {
        Router::new()
            // Sync protocol
            .route("/sync/pull", get(handle_pull))
            .route("/sync/push", post(handle_push).put(handle_push))
            .route("/sync/ack", post(handle_ack))
            // Status and info
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/batches/outgoing", get(handle_outgoing_batches))
            .route("/batches/incoming", get(handle_incoming_batches))
            // Admin operations
            .route(
                "/batches/outgoing/:node_id/:batch_id/ignore",
                post(handle_ignore_batch),
            )
            .route("/batches/outgoing/:node_id/:batch_id/ok", post(handle_ok_batch))
            .route("/reload/:node_id/:trigger_id", post(handle_reload))
            .route("/sql/:node_id/:trigger_id", post(handle_send_sql))
            .route("/schema/:node_id/:trigger_id", post(handle_send_schema))
            .route("/jobs/:job", post(handle_job))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(engine)
    }

    /// Serve until the engine shuts down
    pub async fn start(&self) -> Result<()> {
        if !self.config.enabled {
            tracing::info!("HTTP API disabled");
            return Ok(());
        }

        let listener = tokio::net::TcpListener::bind(&self.config.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.config.bind_address);
        Self::serve(listener, Arc::clone(&self.engine)).await
    }

    /// Serve on an already bound listener
    pub async fn serve(listener: tokio::net::TcpListener, engine: Arc<SyncEngine>) -> Result<()> {
        let mut shutdown = engine.subscribe_shutdown();
        let app = Self::router(engine);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stopping| *stopping).await;
            })
            .await?;
        Ok(())
    }
}

// ============ Request/Response Types ============

/// Query string every sync request carries
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncQuery {
    pub node_id: String,
    #[serde(default)]
    pub security_token: String,
    #[serde(default)]
    pub host_name: Option<String>,
}

impl SyncQuery {
    fn credentials(&self) -> Credentials {
        Credentials::new(self.node_id.clone(), self.security_token.clone())
    }
}

#[derive(Debug, Deserialize)]
pub struct BatchQuery {
    pub status: Option<String>,
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct ReloadQuery {
    #[serde(rename = "where")]
    pub where_clause: Option<String>,
}

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub node_id: String,
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

/// Error rendered as a status code and JSON body
struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            Error::AuthenticationFailed(_) => (custom_status(FORBIDDEN), "FORBIDDEN"),
            Error::SyncDisabled(_) => (custom_status(SYNC_DISABLED), "SYNC_DISABLED"),
            Error::ConnectionRejected(_) => (custom_status(SERVICE_BUSY), "BUSY"),
            Error::ShuttingDown => (StatusCode::SERVICE_UNAVAILABLE, "SHUTTING_DOWN"),
            Error::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            Error::Config(_) | Error::Protocol { .. } => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };
        if status.is_server_error() {
            tracing::error!("Request failed: {}", self.0);
        } else {
            tracing::debug!("Request rejected: {}", self.0);
        }
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
                code: code.to_string(),
            }),
        )
            .into_response()
    }
}

fn custom_status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::FORBIDDEN)
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// ============ Sync Handlers ============

async fn handle_pull(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<SyncQuery>,
) -> ApiResult<impl IntoResponse> {
    tracing::debug!(
        "Pull from node {} on {}",
        query.node_id,
        query.host_name.as_deref().unwrap_or("unknown host")
    );
    let payload = engine.handle_pull(&query.credentials()).await?;
    Ok(([(axum::http::header::CONTENT_TYPE, "text/plain")], payload))
}

async fn handle_push(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<SyncQuery>,
    body: Bytes,
) -> ApiResult<String> {
    let acks = engine.handle_push(&query.credentials(), body).await?;
    Ok(format!("{}\n", encode_acks(&acks)))
}

async fn handle_ack(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<SyncQuery>,
    body: String,
) -> ApiResult<StatusCode> {
    let acks = parse_acks(body.trim())?;
    engine.handle_ack(&query.credentials(), acks).await?;
    Ok(StatusCode::OK)
}

// ============ Operator Handlers ============

async fn handle_health(State(engine): State<Arc<SyncEngine>>) -> impl IntoResponse {
    Json(HealthResponse {
        healthy: !engine.is_shutting_down(),
        node_id: engine.config().node_id().to_string(),
    })
}

async fn handle_status(State(engine): State<Arc<SyncEngine>>) -> ApiResult<impl IntoResponse> {
    Ok(Json(engine.status().await?))
}

async fn handle_outgoing_batches(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<BatchQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        Some(code) => Some(OutgoingBatchStatus::from_code(code).ok_or_else(|| {
            Error::Config(format!("unknown outgoing batch status '{}'", code))
        })?),
        None => None,
    };
    let conn = engine.database().lock().await;
    let batches = engine.services().outgoing_batches.find_outgoing_batches_by_status(
        &conn,
        status,
        query.limit.unwrap_or(DEFAULT_LIMIT),
    )?;
    Ok(Json(batches))
}

async fn handle_incoming_batches(
    State(engine): State<Arc<SyncEngine>>,
    Query(query): Query<BatchQuery>,
) -> ApiResult<impl IntoResponse> {
    let status = match query.status.as_deref() {
        Some(code) => Some(IncomingBatchStatus::from_code(code).ok_or_else(|| {
            Error::Config(format!("unknown incoming batch status '{}'", code))
        })?),
        None => None,
    };
    let conn = engine.database().lock().await;
    let batches = engine.services().incoming_batches.list_incoming_batches(
        &conn,
        status,
        query.limit.unwrap_or(DEFAULT_LIMIT),
    )?;
    Ok(Json(batches))
}

async fn handle_ignore_batch(
    State(engine): State<Arc<SyncEngine>>,
    Path((node_id, batch_id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    engine
        .mark_outgoing_batch(&node_id, batch_id, OutgoingBatchStatus::Ignored)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_ok_batch(
    State(engine): State<Arc<SyncEngine>>,
    Path((node_id, batch_id)): Path<(String, i64)>,
) -> ApiResult<StatusCode> {
    engine
        .mark_outgoing_batch(&node_id, batch_id, OutgoingBatchStatus::Ok)
        .await?;
    Ok(StatusCode::OK)
}

async fn handle_reload(
    State(engine): State<Arc<SyncEngine>>,
    Path((node_id, trigger_id)): Path<(String, String)>,
    Query(query): Query<ReloadQuery>,
) -> ApiResult<impl IntoResponse> {
    let batch_ids = engine
        .reload_table(&node_id, &trigger_id, query.where_clause.as_deref())
        .await?;
    Ok(Json(serde_json::json!({ "batch_ids": batch_ids })))
}

async fn handle_send_sql(
    State(engine): State<Arc<SyncEngine>>,
    Path((node_id, trigger_id)): Path<(String, String)>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let batch_id = engine.send_sql(&node_id, &trigger_id, &body).await?;
    Ok(Json(serde_json::json!({ "batch_id": batch_id })))
}

async fn handle_send_schema(
    State(engine): State<Arc<SyncEngine>>,
    Path((node_id, trigger_id)): Path<(String, String)>,
    body: String,
) -> ApiResult<impl IntoResponse> {
    let batch_id = engine.send_schema(&node_id, &trigger_id, &body).await?;
    Ok(Json(serde_json::json!({ "batch_id": batch_id })))
}

async fn handle_job(
    State(engine): State<Arc<SyncEngine>>,
    Path(job): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let body = match job.as_str() {
        "sync-triggers" => serde_json::to_value(engine.sync_triggers(true).await?),
        "route" => Ok(serde_json::json!({ "routed": engine.route().await? })),
        "push" => serde_json::to_value(engine.push().await?),
        "pull" => serde_json::to_value(engine.pull().await?),
        other => return Err(Error::NotFound(format!("job {}", other)).into()),
    }
    .map_err(|e| Error::Internal(e.to_string()))?;
    Ok(Json(body))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::SyncConfig;
    use crate::db::Database;
    use crate::model::{Node, NodeGroupLink, NodeGroupLinkAction, RemoteStatus, Router, Trigger, TriggerRouter};
    use crate::transport::{HttpTransportManager, TransportManager};

    const ITEM_DDL: &str = "CREATE TABLE item (id INTEGER PRIMARY KEY, name TEXT);";

    async fn engine(toml: &str, transport: Arc<dyn TransportManager>) -> Arc<SyncEngine> {
        let database = Arc::new(Database::open_in_memory().unwrap());
        database.lock().await.execute_batch(ITEM_DDL).unwrap();
        let config = SyncConfig::from_str(toml).unwrap();
        Arc::new(SyncEngine::new(config, database, transport).await.unwrap())
    }

    fn http() -> Arc<dyn TransportManager> {
        Arc::new(HttpTransportManager::new(Duration::from_secs(5)).unwrap())
    }

    /// Corp node `000` serving the API, with store `001` allowed to pull `item`
    async fn serve_corp() -> (Arc<SyncEngine>, String) {
        let corp = engine(
            r#"
[node]
group_id = "corp"
external_id = "000"
registration_url = "http://localhost/sync"

[database]
path = "unused.sqlite"

[[peers]]
node_id = "001"
group_id = "store"
password = "store-secret"

[[links]]
source_group_id = "corp"
target_group_id = "store"
"#,
            http(),
        )
        .await;
        {
            let conn = corp.database().lock().await;
            let link = NodeGroupLink::new("corp", "store", NodeGroupLinkAction::WaitForPull);
            corp.services()
                .trigger_routers
                .save_trigger_router(
                    &conn,
                    &TriggerRouter::new(
                        Trigger::new("item", "item", "default"),
                        Router::new("corp_2_store", link),
                    ),
                )
                .unwrap();
        }
        corp.sync_triggers(false).await.unwrap();

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let served = Arc::clone(&corp);
        tokio::spawn(async move {
            HttpServer::serve(listener, served).await.unwrap();
        });
        (corp, format!("http://{}", address))
    }

    #[tokio::test]
    async fn test_health_and_status() {
        let (corp, base) = serve_corp().await;
        let client = reqwest::Client::new();

        let health: serde_json::Value = client
            .get(format!("{}/health", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["healthy"], true);
        assert_eq!(health["node_id"], "000");

        let status: serde_json::Value = client
            .get(format!("{}/status", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(status["node"]["node_group_id"], "corp");

        let bad = client
            .get(format!("{}/batches/outgoing?status=ZZ", base))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status().as_u16(), 400);
        corp.shutdown();
    }

    #[tokio::test]
    async fn test_store_pulls_over_http() {
        let (corp, base) = serve_corp().await;
        corp.database()
            .lock()
            .await
            .execute("INSERT INTO item (id, name) VALUES (3, 'desk')", [])
            .unwrap();
        corp.route().await.unwrap();

        let store = engine(
            &format!(
                r#"
[node]
group_id = "store"
external_id = "001"
registration_url = "{base}/sync"
node_password = "store-secret"

[database]
path = "unused.sqlite"

[[peers]]
node_id = "000"
group_id = "corp"
sync_url = "{base}/sync"

[[links]]
source_group_id = "corp"
target_group_id = "store"
"#
            ),
            http(),
        )
        .await;

        let statuses = store.pull().await.unwrap();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].status, RemoteStatus::DataProcessed);
        let name: String = store
            .database()
            .lock()
            .await
            .query_row("SELECT name FROM item WHERE id = 3", [], |row| row.get(0))
            .unwrap();
        assert_eq!(name, "desk");

        let client = reqwest::Client::new();
        let batches: Vec<serde_json::Value> = client
            .get(format!("{}/batches/outgoing?status=OK", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0]["node_id"], "001");
        corp.shutdown();
    }

    #[tokio::test]
    async fn test_sync_requests_need_credentials() {
        let (corp, base) = serve_corp().await;
        let remote = Node::new("000", "corp", "000").with_sync_url(format!("{}/sync", base));
        let transport = HttpTransportManager::new(Duration::from_secs(5)).unwrap();

        let result = transport
            .pull(&remote, &Credentials::new("001", "wrong"))
            .await;
        assert!(matches!(result, Err(Error::AuthenticationFailed(_))));
        corp.shutdown();
    }

    #[tokio::test]
    async fn test_ignore_batch_override() {
        let (corp, base) = serve_corp().await;
        corp.database()
            .lock()
            .await
            .execute("INSERT INTO item (id, name) VALUES (4, 'chair')", [])
            .unwrap();
        corp.route().await.unwrap();
        let batch_id = {
            let conn = corp.database().lock().await;
            corp.services()
                .outgoing_batches
                .get_outgoing_batches(&conn, "001")
                .unwrap()[0]
                .batch_id
        };

        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/batches/outgoing/001/{}/ignore", base, batch_id))
            .send()
            .await
            .unwrap();
        assert!(response.status().is_success());

        let missing = client
            .post(format!("{}/batches/outgoing/001/999999/ok", base))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let conn = corp.database().lock().await;
        let batch = corp
            .services()
            .outgoing_batches
            .find_outgoing_batch(&conn, batch_id, Some("001"))
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, OutgoingBatchStatus::Ignored);
        assert_eq!(batch.ignore_count, 1);
        drop(conn);
        corp.shutdown();
    }

    #[tokio::test]
    async fn test_send_sql_queues_batch() {
        let (corp, base) = serve_corp().await;
        let client = reqwest::Client::new();
        let queued: serde_json::Value = client
            .post(format!("{}/sql/001/item", base))
            .body("UPDATE item SET name = 'sold' WHERE id = 4")
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let batch_id = queued["batch_id"].as_i64().unwrap();

        let empty = client
            .post(format!("{}/schema/001/item", base))
            .send()
            .await
            .unwrap();
        assert_eq!(empty.status().as_u16(), 400);
        let unknown = client
            .post(format!("{}/schema/042/item", base))
            .body("CREATE TABLE t (id INTEGER)")
            .send()
            .await
            .unwrap();
        assert_eq!(unknown.status().as_u16(), 404);

        let conn = corp.database().lock().await;
        let batch = corp
            .services()
            .outgoing_batches
            .find_outgoing_batch(&conn, batch_id, Some("001"))
            .unwrap()
            .unwrap();
        assert_eq!(batch.status, OutgoingBatchStatus::New);
        assert_eq!(batch.other_event_count, 1);
        drop(conn);
        corp.shutdown();
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (corp, base) = serve_corp().await;
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/jobs/purge", base))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status().as_u16(), 404);

        let routed: serde_json::Value = client
            .post(format!("{}/jobs/route", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(routed["routed"], 0);
        corp.shutdown();
    }
}
