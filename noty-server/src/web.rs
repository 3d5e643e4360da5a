//! HTTP/WS bootstrap (§4.8, §6): the client session protocol rides a
//! websocket upgrade; everything else is a small read/write REST surface
//! over the catalog, directory, pub/sub plane and workflow engine.
//!
//! Modeled on the teacher's `web.rs` upgrade-then-bridge pattern for the
//! websocket route, and on the original's `public_api.go`/`private_api.go`
//! split: the client-facing surface and the admin surface are two distinct
//! routers sharing one `AppState`, bound to separate addresses.

use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::{get, post};
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;

use crate::catalog::Catalog;
use crate::directory::PeerDirectory;
use crate::pubsub::PubSub;
use crate::session::{Acl, Session};
use crate::template::Templates;
use crate::workflow::WorkflowEngine;

pub struct AppState {
    pub catalog: Arc<Catalog>,
    pub directory: Arc<PeerDirectory>,
    pub pubsub: Arc<PubSub>,
    pub workflow: Arc<WorkflowEngine>,
    pub templates: Arc<Templates>,
    pub health: Arc<crate::health::Checker>,
    pub acl: Arc<dyn Acl>,
}

/// The client-facing surface: the session websocket plus the publish
/// convenience endpoint deployments put behind their own auth.
pub fn public_router(context_path: &str, state: Arc<AppState>) -> Router {
    let ws_path = format!("{}api/ws", normalize_context_path(context_path));
    Router::new()
        .route(&ws_path, get(ws_upgrade))
        .route("/pubsub/publish", post(publish_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// The admin/private surface: health, peer introspection, workflow
/// management, and i18n reload. Deployments bind this to an address that
/// isn't exposed to end users.
pub fn private_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/peers", get(peers_handler))
        .route("/workflow/-/", post(create_workflow_handler))
        .route("/workflow/{name}", get(fetch_workflow_handler).post(fetch_workflow_handler))
        .route("/workflow/{name}/trigger", post(trigger_workflow_handler))
        .route("/reload/i18n", get(reload_i18n_handler))
        .with_state(state)
}

fn normalize_context_path(context_path: &str) -> String {
    if context_path.ends_with('/') {
        context_path.to_string()
    } else {
        format!("{context_path}/")
    }
}

// ── session websocket ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct WsQuery {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    #[serde(rename = "accountId")]
    account_id: String,
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws(socket, query, state))
}

async fn handle_ws(socket: WebSocket, query: WsQuery, state: Arc<AppState>) {
    let (session, mut out_rx) = Session::new(
        query.tenant_id,
        query.account_id,
        state.catalog.clone(),
        state.pubsub.clone(),
        state.acl.clone(),
    );
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(bytes) = out_rx.recv().await {
            if sink.send(WsMessage::Binary(bytes.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(WsMessage::Binary(bytes)) => session.handle_frame(&bytes).await,
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!("session websocket read error: {e}");
                break;
            }
        }
    }

    session.close();
    writer.abort();
}

// ── REST handlers ───────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let response = state.health.check().await;
    let code = if response.status == crate::health::Status::Up {
        StatusCode::OK
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    (code, Json(response))
}

#[derive(Serialize)]
struct PeersResponse {
    id: String,
    state: &'static str,
    #[serde(skip_serializing_if = "Option::is_none", rename = "remoteAddress")]
    remote_address: Option<String>,
}

async fn peers_handler(State(state): State<Arc<AppState>>) -> Json<Vec<PeersResponse>> {
    let peers = state
        .directory
        .list()
        .into_iter()
        .map(|p| PeersResponse { id: p.id, state: p.state, remote_address: p.remote_address })
        .collect();
    Json(peers)
}

#[derive(Deserialize)]
struct PublishQuery {
    topic: String,
}

async fn publish_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<PublishQuery>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Result<StatusCode, (StatusCode, String)> {
    let tenant_id = headers
        .get("X-Tenant-Id")
        .and_then(|v| v.to_str().ok())
        .ok_or((StatusCode::BAD_REQUEST, "missing X-Tenant-Id header".to_string()))?;
    state
        .pubsub
        .publish(tenant_id, &query.topic, body.to_vec())
        .await
        .map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct WorkflowResponse {
    name: String,
    revision: i64,
    flow: serde_json::Value,
}

async fn create_workflow_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, (StatusCode, String)> {
    let record = state
        .workflow
        .create_workflow(&body.name, body.flow)
        .map_err(error_response)?;
    Ok(Json(WorkflowResponse { name: record.name, revision: record.revision, flow: record.flow }))
}

#[derive(Deserialize)]
struct CreateWorkflowRequest {
    name: String,
    flow: serde_json::Value,
}

async fn fetch_workflow_handler(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
) -> Result<Json<WorkflowResponse>, (StatusCode, String)> {
    let record = state.workflow.latest_workflow(&name).map_err(error_response)?;
    Ok(Json(WorkflowResponse { name: record.name, revision: record.revision, flow: record.flow }))
}

#[derive(Deserialize)]
struct TriggerWorkflowRequest {
    tenant: serde_json::Value,
    subscriber: serde_json::Value,
    event: serde_json::Value,
}

#[derive(Serialize)]
struct TriggerWorkflowResponse {
    #[serde(rename = "eventId")]
    event_id: String,
}

async fn trigger_workflow_handler(
    Path(name): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<TriggerWorkflowRequest>,
) -> Result<Json<TriggerWorkflowResponse>, (StatusCode, String)> {
    let event_id = state
        .workflow
        .trigger(&name, body.tenant, body.subscriber, body.event)
        .await
        .map_err(error_response)?;
    Ok(Json(TriggerWorkflowResponse { event_id }))
}

async fn reload_i18n_handler(State(state): State<Arc<AppState>>) -> Result<StatusCode, (StatusCode, String)> {
    state.templates.reload().map_err(error_response)?;
    Ok(StatusCode::NO_CONTENT)
}

fn error_response(e: crate::error::Error) -> (StatusCode, String) {
    let code = match &e {
        crate::error::Error::NotFound(_) => StatusCode::NOT_FOUND,
        crate::error::Error::Validation(_) => StatusCode::BAD_REQUEST,
        crate::error::Error::Conflict(_) => StatusCode::CONFLICT,
        crate::error::Error::Transport(_) | crate::error::Error::External(_) => StatusCode::BAD_GATEWAY,
        crate::error::Error::Fatal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, e.to_string())
}
