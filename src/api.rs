//! Worker HTTP API. The CLI submits and controls workflows through this
//! surface; bodies are the plain serde models from [`crate::types`].

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::engine::registry::{WorkflowRegistry, WorkflowSummary};
use crate::engine::signals::SignalRequest;
use crate::engine::{self, CancelToken};
use crate::policy;
use crate::types::{ClusterDiscoveryInput, ClusterDiscoveryResult, MultiRestartInput};

pub struct ApiState {
    pub registry: Arc<WorkflowRegistry>,
    pub activities: Arc<dyn crate::activities::Activities>,
    pub identity: String,
}

pub fn create_app(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/discover", post(discover))
        .route("/workflows/restart", post(start_restart))
        .route("/workflows", get(list_workflows))
        .route("/workflows/:id", get(get_workflow))
        .route("/workflows/:id/signal", post(signal_workflow))
        .route("/workflows/:id/terminate", post(terminate_workflow))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Serialize)]
struct HealthzResponse {
    identity: String,
    running_workflows: usize,
    total_workflows: usize,
}

async fn healthz(State(state): State<Arc<ApiState>>) -> Json<HealthzResponse> {
    Json(HealthzResponse {
        identity: state.identity.clone(),
        running_workflows: state.registry.running_count(),
        total_workflows: state.registry.total_count(),
    })
}

/// One-shot discovery, outside any workflow.
async fn discover(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<ClusterDiscoveryInput>,
) -> Response {
    let opts = policy::discovery_options();
    let activities = state.activities.clone();
    let cancel = CancelToken::never();
    let result: Result<ClusterDiscoveryResult, _> =
        engine::execute(&cancel, &opts, "discover_clusters", move |actx| {
            let activities = activities.clone();
            let input = input.clone();
            async move { activities.discover_clusters(actx, input).await }
        })
        .await;

    match result {
        Ok(result) => (StatusCode::OK, Json(result)).into_response(),
        Err(err) => error_response(StatusCode::BAD_GATEWAY, format!("discovery failed: {err}")),
    }
}

async fn start_restart(
    State(state): State<Arc<ApiState>>,
    Json(input): Json<MultiRestartInput>,
) -> (StatusCode, Json<WorkflowSummary>) {
    let summary = state.registry.spawn_restart(input);
    (StatusCode::ACCEPTED, Json(summary))
}

#[derive(Deserialize)]
struct ListParams {
    #[serde(default = "default_list_limit")]
    limit: usize,
}

fn default_list_limit() -> usize {
    20
}

async fn list_workflows(
    State(state): State<Arc<ApiState>>,
    Query(params): Query<ListParams>,
) -> Json<Vec<WorkflowSummary>> {
    Json(state.registry.list(params.limit))
}

async fn get_workflow(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    match state.registry.get(&id) {
        Some(detail) => (StatusCode::OK, Json(detail)).into_response(),
        None => not_found(&id),
    }
}

async fn signal_workflow(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(request): Json<SignalRequest>,
) -> Response {
    if state.registry.signal(&id, request) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&id)
    }
}

async fn terminate_workflow(State(state): State<Arc<ApiState>>, Path(id): Path<String>) -> Response {
    if state.registry.terminate(&id) {
        StatusCode::NO_CONTENT.into_response()
    } else {
        not_found(&id)
    }
}

#[derive(Serialize)]
struct ApiError {
    error: String,
}

fn error_response(code: StatusCode, message: String) -> Response {
    (code, Json(ApiError { error: message })).into_response()
}

fn not_found(id: &str) -> Response {
    error_response(
        StatusCode::NOT_FOUND,
        format!("no workflow with id {id}"),
    )
}
