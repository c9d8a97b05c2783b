//! REST API server for the agent rule engine
//!
//! Agent management, manual runs, execution history, and the signal
//! endpoints the trigger watcher listens on.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;
use uuid::Uuid;

use crate::agent::{AgentManager, Orchestrator};
use crate::error::EngineError;
use crate::models::{AgentDefinition, TriggerEvent};
use crate::triggers::{Fired, TriggerWatcher};
use crate::Result;

const DEFAULT_EXECUTION_LIMIT: usize = 20;
const MAX_EXECUTION_LIMIT: usize = 500;

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Deserialize)]
pub struct CreateAgentRequest {
    pub owner_id: Uuid,
    #[serde(flatten)]
    pub definition: AgentDefinition,
}

#[derive(Debug, Deserialize)]
pub struct OwnerQuery {
    pub owner_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct EventRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
    pub occurrence_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MetricRequest {
    pub metric: String,
    pub value: f64,
}

#[derive(Debug, Deserialize)]
pub struct DetectionRequest {
    pub description: String,
    pub confidence: f64,
    pub occurrence_id: Option<String>,
}

/// =============================
/// Response Wrapper
/// =============================

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse {
    pub success: bool,
    pub data: Option<Value>,
    pub error: Option<String>,
    pub timestamp: String,
}

impl ApiResponse {
    pub fn success<T: Serialize>(data: T) -> Self {
        Self {
            success: true,
            data: serde_json::to_value(data).ok(),
            error: None,
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(message),
            timestamp: chrono::Utc::now().to_rfc3339(),
        }
    }
}

type ApiReply = (StatusCode, Json<ApiResponse>);

fn status_for(error: &EngineError) -> StatusCode {
    match error {
        EngineError::AgentNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AgentNotActive { .. }
        | EngineError::InvalidTransition { .. }
        | EngineError::VersionConflict(_) => StatusCode::CONFLICT,
        EngineError::InvalidAgent(_)
        | EngineError::EmptyCompoundCondition(_)
        | EngineError::ConditionDepthExceeded(_)
        | EngineError::InvalidAction(_)
        | EngineError::Expression(_) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn reply<T: Serialize>(result: Result<T>, ok: StatusCode) -> ApiReply {
    match result {
        Ok(data) => (ok, Json(ApiResponse::success(data))),
        Err(e) => (status_for(&e), Json(ApiResponse::error(e.to_string()))),
    }
}

fn fired_summary(fired: &[Fired]) -> Value {
    serde_json::json!({
        "dispatched": fired.len(),
        "agents": fired.iter().map(|f| f.agent_id).collect::<Vec<_>>(),
    })
}

/// =============================
/// API State
/// =============================

#[derive(Clone)]
pub struct ApiState {
    pub manager: Arc<AgentManager>,
    pub orchestrator: Arc<Orchestrator>,
    pub watcher: Arc<TriggerWatcher>,
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Agent Endpoints
/// =============================

async fn create_agent(
    State(state): State<ApiState>,
    Json(req): Json<CreateAgentRequest>,
) -> ApiReply {
    info!(owner_id = %req.owner_id, name = %req.definition.name, "Create agent request");
    reply(
        state.manager.create(req.owner_id, req.definition).await,
        StatusCode::CREATED,
    )
}

async fn list_agents(State(state): State<ApiState>, Query(q): Query<OwnerQuery>) -> ApiReply {
    reply(state.manager.list(q.owner_id).await, StatusCode::OK)
}

async fn get_agent(State(state): State<ApiState>, Path(agent_id): Path<Uuid>) -> ApiReply {
    reply(state.manager.get(agent_id).await, StatusCode::OK)
}

async fn update_agent(
    State(state): State<ApiState>,
    Path(agent_id): Path<Uuid>,
    Json(definition): Json<AgentDefinition>,
) -> ApiReply {
    reply(state.manager.update(agent_id, definition).await, StatusCode::OK)
}

async fn activate_agent(State(state): State<ApiState>, Path(agent_id): Path<Uuid>) -> ApiReply {
    reply(state.manager.activate(agent_id).await, StatusCode::OK)
}

async fn pause_agent(State(state): State<ApiState>, Path(agent_id): Path<Uuid>) -> ApiReply {
    reply(state.manager.pause(agent_id).await, StatusCode::OK)
}

async fn archive_agent(State(state): State<ApiState>, Path(agent_id): Path<Uuid>) -> ApiReply {
    reply(state.manager.archive(agent_id).await, StatusCode::OK)
}

/// Manual run; bypasses the watcher and its queues.
async fn execute_agent(
    State(state): State<ApiState>,
    Path(agent_id): Path<Uuid>,
    body: Option<Json<ExecuteRequest>>,
) -> ApiReply {
    let Json(req) = body.unwrap_or_default();
    info!(agent_id = %agent_id, "Manual execution request");
    reply(
        state
            .orchestrator
            .execute(agent_id, TriggerEvent::manual(req.payload))
            .await,
        StatusCode::OK,
    )
}

async fn list_executions(
    State(state): State<ApiState>,
    Path(agent_id): Path<Uuid>,
    Query(q): Query<LimitQuery>,
) -> ApiReply {
    let limit = q
        .limit
        .unwrap_or(DEFAULT_EXECUTION_LIMIT)
        .clamp(1, MAX_EXECUTION_LIMIT);
    reply(state.manager.executions(agent_id, limit).await, StatusCode::OK)
}

/// =============================
/// Signal Endpoints
/// =============================

async fn post_event(State(state): State<ApiState>, Json(req): Json<EventRequest>) -> ApiReply {
    let fired = state
        .watcher
        .event(&req.event_type, req.payload, req.occurrence_id)
        .await;
    (StatusCode::ACCEPTED, Json(ApiResponse::success(fired_summary(&fired))))
}

async fn post_metric(State(state): State<ApiState>, Json(req): Json<MetricRequest>) -> ApiReply {
    let fired = state.watcher.metric(&req.metric, req.value).await;
    (StatusCode::ACCEPTED, Json(ApiResponse::success(fired_summary(&fired))))
}

async fn post_detection(
    State(state): State<ApiState>,
    Json(req): Json<DetectionRequest>,
) -> ApiReply {
    let fired = state
        .watcher
        .detection(&req.description, req.confidence, req.occurrence_id)
        .await;
    (StatusCode::ACCEPTED, Json(ApiResponse::success(fired_summary(&fired))))
}

/// =============================
/// Router
/// =============================

pub fn create_router(state: ApiState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/agents", post(create_agent).get(list_agents))
        .route("/api/agents/:id", get(get_agent).put(update_agent))
        .route("/api/agents/:id/activate", post(activate_agent))
        .route("/api/agents/:id/pause", post(pause_agent))
        .route("/api/agents/:id/archive", post(archive_agent))
        .route("/api/agents/:id/execute", post(execute_agent))
        .route("/api/agents/:id/executions", get(list_executions))
        .route("/api/events", post(post_event))
        .route("/api/metrics", post(post_metric))
        .route("/api/detections", post(post_detection))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(
    state: ApiState,
    port: u16,
) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", port)).await?;

    info!("API Server listening on http://0.0.0.0:{}", port);

    axum::serve(listener, router).await?;

    Ok(())
}
