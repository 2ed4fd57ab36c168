//! HTTP and WebSocket control plane.
//!
//! REST endpoints drive the workflow engine; two WebSocket endpoints
//! carry live traffic: `/ws/sync` speaks the replicated-document
//! protocol (`sync-init` then bidirectional `sync-update` frames with
//! numeric byte arrays), and `/ws/sessions` streams session updates for
//! one subscription channel. Local-only: the listener binds 127.0.0.1.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

use crate::broadcast::{ChannelKey, ChannelScope, SessionBroadcaster};
use crate::coordinator::Coordinator;
use crate::engine::{CreateWorkflowRequest, EngineError, WorkflowEngine};
use crate::storage::{Storage, StorageError, WorkflowFilter};
use crate::wakeup::WakeupService;
use flow_core::events::WorkflowEventType;
use flow_core::{Id, Workflow, WorkflowStatus};

/// Shared state for HTTP handlers.
#[derive(Debug)]
pub struct AppState {
    pub engine: Arc<WorkflowEngine>,
    pub coordinator: Arc<Coordinator>,
    pub broadcaster: Arc<SessionBroadcaster>,
    pub storage: Arc<Storage>,
    pub wakeup: Arc<WakeupService>,
    pub project_id: String,
}

/// Create the router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/workflows", post(create_workflow).get(list_workflows))
        .route("/workflows/{id}", get(get_workflow))
        .route("/workflows/{id}/start", post(start_workflow))
        .route("/workflows/{id}/pause", post(pause_workflow))
        .route("/workflows/{id}/resume", post(resume_workflow))
        .route("/workflows/{id}/cancel", post(cancel_workflow))
        .route("/workflows/{id}/events", get(list_events).post(record_event))
        .route("/workflows/{id}/await", post(register_await))
        .route("/workflows/{id}/ready-steps", get(ready_steps))
        .route("/steps/{id}/retry", post(retry_step))
        .route("/steps/{id}/skip", post(skip_step))
        .route("/ws/sync", get(ws_sync))
        .route("/ws/sessions", get(ws_sessions))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the HTTP server, bound to localhost only.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;
    Ok(())
}

// --- Request/Response types ---

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn engine_error(e: EngineError) -> ApiError {
    let status = match &e {
        EngineError::Storage(StorageError::WorkflowNotFound(_))
        | EngineError::Storage(StorageError::StepNotFound(_))
        | EngineError::Storage(StorageError::ExecutionNotFound(_)) => StatusCode::NOT_FOUND,
        EngineError::InvalidState { .. } | EngineError::InvalidStepState { .. } => {
            StatusCode::CONFLICT
        }
        EngineError::DependencyCycle(_) => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!("request failed: {e}");
    }
    (
        status,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
}

#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub workflow: Workflow,
}

#[derive(Debug, Deserialize, Default)]
pub struct ListWorkflowsQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub offset: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct ListWorkflowsResponse {
    pub workflows: Vec<Workflow>,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResumeRequest {
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub struct RetryStepRequest {
    #[serde(default)]
    pub fresh_start: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct SkipStepRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

// --- REST handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok" }))
}

async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CreateWorkflowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = state
        .engine
        .create_workflow(request)
        .await
        .map_err(engine_error)?;
    info!(workflow_id = %workflow.id, "created workflow");
    Ok((StatusCode::CREATED, Json(WorkflowResponse { workflow })))
}

async fn list_workflows(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ListWorkflowsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(WorkflowStatus::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown status filter: {raw}"),
                }),
            )
        })?),
        None => None,
    };

    let workflows = state
        .engine
        .list_workflows(&WorkflowFilter {
            status,
            limit: query.limit,
            offset: query.offset,
        })
        .await
        .map_err(engine_error)?;
    Ok(Json(ListWorkflowsResponse { workflows }))
}

async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow = state
        .engine
        .get_workflow(&Id::from_string(id))
        .await
        .map_err(engine_error)?;
    Ok(Json(WorkflowResponse { workflow }))
}

async fn start_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .start_workflow(&Id::from_string(id))
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn pause_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .pause_workflow(&Id::from_string(id))
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn resume_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: ResumeRequest = parse_optional_body(&body)?;
    state
        .engine
        .resume_workflow(&Id::from_string(id), request.message)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state
        .engine
        .cancel_workflow(&Id::from_string(id))
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = Id::from_string(id);
    // 404 for unknown workflows rather than an empty list.
    state
        .engine
        .get_workflow(&workflow_id)
        .await
        .map_err(engine_error)?;
    let events = state
        .storage
        .list_events(&workflow_id)
        .await
        .map_err(|e| engine_error(EngineError::Storage(e)))?;
    Ok(Json(serde_json::json!({ "events": events })))
}

/// Body for POST /workflows/{id}/events. Used by orchestrator agents to
/// record escalations and user responses.
#[derive(Debug, Deserialize)]
pub struct RecordEventRequest {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub execution_id: Option<String>,
    #[serde(default)]
    pub step_id: Option<String>,
    #[serde(default)]
    pub payload: serde_json::Value,
}

async fn record_event(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RecordEventRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = Id::from_string(id);
    state
        .engine
        .get_workflow(&workflow_id)
        .await
        .map_err(engine_error)?;

    let event_type = WorkflowEventType::parse(&request.event_type).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown event type: {}", request.event_type),
            }),
        )
    })?;

    let event = state
        .wakeup
        .record_event(
            &workflow_id,
            event_type,
            request.execution_id.map(Id::from_string).as_ref(),
            request.step_id.map(Id::from_string).as_ref(),
            request.payload,
        )
        .await
        .map_err(|e| engine_error(EngineError::Wakeup(e)))?;

    Ok((StatusCode::CREATED, Json(serde_json::json!({ "event": event }))))
}

/// Body for POST /workflows/{id}/await.
#[derive(Debug, Deserialize)]
pub struct RegisterAwaitRequest {
    pub event_types: Vec<String>,
    #[serde(default)]
    pub execution_ids: Option<Vec<String>>,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub message: Option<String>,
}

async fn register_await(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(request): Json<RegisterAwaitRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let workflow_id = Id::from_string(id);
    state
        .engine
        .get_workflow(&workflow_id)
        .await
        .map_err(engine_error)?;

    let mut event_types = Vec::with_capacity(request.event_types.len());
    for raw in &request.event_types {
        event_types.push(WorkflowEventType::parse(raw).ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                Json(ErrorResponse {
                    error: format!("unknown event type: {raw}"),
                }),
            )
        })?);
    }

    let pending = state
        .wakeup
        .register_await(
            &workflow_id,
            event_types,
            request
                .execution_ids
                .map(|ids| ids.into_iter().map(Id::from_string).collect()),
            request.timeout_seconds,
            request.message,
        )
        .await;

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "await_id": pending.id })),
    ))
}

async fn ready_steps(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let steps = state
        .engine
        .get_ready_steps(&Id::from_string(id))
        .await
        .map_err(engine_error)?;
    Ok(Json(serde_json::json!({ "steps": steps })))
}

async fn retry_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: RetryStepRequest = parse_optional_body(&body)?;
    state
        .engine
        .retry_step(&Id::from_string(id), request.fresh_start)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn skip_step(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let request: SkipStepRequest = parse_optional_body(&body)?;
    state
        .engine
        .skip_step(&Id::from_string(id), request.reason)
        .await
        .map_err(engine_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Parse an optional JSON body: an empty body yields the default.
fn parse_optional_body<T: Default + serde::de::DeserializeOwned>(
    body: &[u8],
) -> Result<T, ApiError> {
    if body.is_empty() {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("invalid request body: {e}"),
            }),
        )
    })
}

// --- WebSocket: replicated document sync ---

/// Wire frame for the sync protocol. The payload is an opaque byte
/// array, JSON-framed as numbers.
#[derive(Debug, Serialize, Deserialize)]
struct SyncFrame {
    #[serde(rename = "type")]
    frame_type: String,
    data: Vec<u8>,
}

async fn ws_sync(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_sync_socket(socket, state))
}

async fn handle_sync_socket(socket: WebSocket, state: Arc<AppState>) {
    let (client_id, initial_state, mut updates_rx) = match state.coordinator.connect().await {
        Ok(connection) => connection,
        Err(e) => {
            error!(error = %e, "sync connect failed");
            return;
        }
    };
    let (mut sender, mut receiver) = socket.split();

    let init_frame = SyncFrame {
        frame_type: "sync-init".to_string(),
        data: initial_state,
    };
    match serde_json::to_string(&init_frame) {
        Ok(json) => {
            if sender.send(Message::Text(json.into())).await.is_err() {
                state.coordinator.disconnect(client_id);
                return;
            }
        }
        Err(e) => {
            error!(error = %e, "sync-init encode failed");
            state.coordinator.disconnect(client_id);
            return;
        }
    }

    loop {
        tokio::select! {
            update = updates_rx.recv() => {
                match update {
                    Some(bytes) => {
                        let frame = SyncFrame {
                            frame_type: "sync-update".to_string(),
                            data: bytes,
                        };
                        let Ok(json) = serde_json::to_string(&frame) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Coordinator dropped us (shutdown or slow consumer).
                    None => break,
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        let frame: SyncFrame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!(error = %e, "ignoring malformed sync frame");
                                continue;
                            }
                        };
                        if frame.frame_type == "sync-update" {
                            if let Err(e) = state
                                .coordinator
                                .apply_update(Some(client_id), &frame.data)
                                .await
                            {
                                warn!(error = %e, "sync update rejected");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(error = %e, "sync socket error");
                        break;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.coordinator.disconnect(client_id);
}

// --- WebSocket: session updates ---

#[derive(Debug, Deserialize)]
struct SessionChannelQuery {
    #[serde(default)]
    project_id: Option<String>,
    scope: String,
    id: String,
}

async fn ws_sessions(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionChannelQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let scope = ChannelScope::parse(&query.scope).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: format!("unknown scope: {}", query.scope),
            }),
        )
    })?;

    let key = ChannelKey {
        project_id: query
            .project_id
            .unwrap_or_else(|| state.project_id.clone()),
        scope,
        id: query.id,
    };
    Ok(ws.on_upgrade(move |socket| handle_session_socket(socket, state, key)))
}

async fn handle_session_socket(socket: WebSocket, state: Arc<AppState>, key: ChannelKey) {
    let (subscriber_id, mut rx) = state.broadcaster.subscribe(key.clone());
    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            message = rx.recv() => {
                match message {
                    Some(json) => {
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    // Disconnected by the broadcaster (slow consumer).
                    None => break,
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    // The session channel is one-way; drop client frames.
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.broadcaster.unsubscribe(&key, subscriber_id);
}
