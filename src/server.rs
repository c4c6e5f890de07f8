use axum::{
    extract::{Json, Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Router,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::error::FriendError;
use crate::memory::Turn;
use crate::orchestrator::{JobId, JobStatus, TaskRunner};
use crate::utils::track_requests;

/// Maps library errors onto HTTP status codes
struct ServerError(FriendError);

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            FriendError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            FriendError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.0.to_string() }))).into_response()
    }
}

impl From<FriendError> for ServerError {
    fn from(err: FriendError) -> Self {
        Self(err)
    }
}

#[derive(Clone)]
pub struct AppState {
    pub runner: Arc<TaskRunner>,
    pub metrics: PrometheusHandle,
}

#[derive(Deserialize)]
struct TalkRequest {
    message: String,
    #[serde(default)]
    history: Vec<Turn>,
}

#[derive(Serialize)]
struct TalkResponse {
    job_id: JobId,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(health))
        .route("/talk", post(talk))
        .route("/status/{job_id}", get(status))
        .route("/{job_id}", delete(forget))
        .route("/metrics", get(render_metrics))
        .route_layer(middleware::from_fn(track_requests))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run_server(state: AppState, addr: &str) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("Listening at http://{}", addr);
    axum::serve(listener, app).await?;
    Ok(())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "OK" }))
}

async fn render_metrics(State(state): State<AppState>) -> String {
    state.metrics.render()
}

async fn talk(
    State(state): State<AppState>,
    Json(req): Json<TalkRequest>,
) -> Result<impl IntoResponse, ServerError> {
    let job_id = state.runner.submit(req.message, req.history).await?;
    Ok((StatusCode::ACCEPTED, Json(TalkResponse { job_id })))
}

async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatus>, ServerError> {
    let id = JobId::parse(&job_id)?;
    Ok(Json(state.runner.poll(id).await?))
}

async fn forget(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<serde_json::Value>, ServerError> {
    let id = JobId::parse(&job_id)?;
    state.runner.forget_or_cancel(id).await?;
    Ok(Json(serde_json::json!({ "ok": true })))
}
