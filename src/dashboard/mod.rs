use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::operations::{ExecutionStage, Operation, OperationRegistry};

#[derive(Clone)]
pub struct DashboardState {
    pub registry: Arc<OperationRegistry>,
    /// `"execution"` or `"cache-only"`.
    pub mode: &'static str,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub mode: String,
    pub operations: usize,
    pub queued: usize,
    pub executing: usize,
    pub completed: usize,
    pub error: usize,
}

#[derive(Debug, Serialize)]
pub struct OperationResponse {
    pub id: String,
    pub action_digest: String,
    pub stage: String,
    pub cached_result: bool,
    pub queued_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub exit_code: Option<i32>,
    pub error: Option<String>,
}

impl From<&Operation> for OperationResponse {
    fn from(op: &Operation) -> Self {
        let exit_code = match (op.result(), op.error()) {
            (Some(result), _) => Some(result.exit_code),
            (None, Some(error)) => error.exit_code,
            (None, None) => None,
        };
        Self {
            id: op.id.to_string(),
            action_digest: op.action_digest.to_string(),
            stage: op.stage().to_string(),
            cached_result: op.metadata.cached_result,
            queued_at: op.metadata.queued_at,
            started_at: op.metadata.started_at,
            completed_at: op.metadata.completed_at,
            exit_code,
            error: op.error().map(|e| e.to_string()),
        }
    }
}

/// Read-only HTTP view of the worker.
pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/status", get(status_handler))
        .route("/api/operations", get(list_operations_handler))
        .route("/api/operations/:id", get(get_operation_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState, shutdown: CancellationToken) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
    {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn status_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let counts = state.registry.stage_counts();
    let count = |stage| counts.get(&stage).copied().unwrap_or(0);

    Json(StatusResponse {
        mode: state.mode.to_string(),
        operations: state.registry.len(),
        queued: count(ExecutionStage::Queued),
        executing: count(ExecutionStage::Executing),
        completed: count(ExecutionStage::Completed),
        error: count(ExecutionStage::Error),
    })
}

async fn list_operations_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let operations: Vec<OperationResponse> = state
        .registry
        .snapshots()
        .iter()
        .map(OperationResponse::from)
        .collect();
    Json(operations)
}

async fn get_operation_handler(
    State(state): State<DashboardState>,
    Path(id): Path<String>,
) -> Result<Json<OperationResponse>, StatusCode> {
    let id = Uuid::parse_str(&id).map_err(|_| StatusCode::NOT_FOUND)?;
    let op = state.registry.get(&id).map_err(|_| StatusCode::NOT_FOUND)?;
    Ok(Json(OperationResponse::from(&op)))
}
