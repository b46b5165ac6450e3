//! JSON control surface for the render queue, served by the studio server.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use crate::error::QueueError;
use crate::gateway::FrameDecodeGateway;
use crate::job::{JobSnapshot, RenderRequest};
use crate::queue::{QueueEvent, RenderJobQueue};

#[derive(Clone)]
pub struct ApiState {
    pub queue: RenderJobQueue,
    pub gateway: Option<Arc<FrameDecodeGateway>>,
}

#[derive(Serialize)]
pub struct CreateRenderResponse {
    pub id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobIdRequest {
    pub job_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyRequest {
    pub max_concurrency: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConcurrencyResponse {
    pub max_concurrency: usize,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub running_jobs: usize,
    pub max_concurrency: usize,
    pub decoder_available: Option<bool>,
}

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/render", post(add_render))
        .route("/api/cancel", post(cancel_render))
        .route("/api/remove-render", post(remove_render))
        .route("/api/jobs", get(list_jobs))
        .route("/api/jobs/ws", any(jobs_ws))
        .route("/api/jobs/{id}", get(get_job))
        .route("/api/queue/concurrency", put(set_concurrency))
        .route("/api/decoder/restart", post(restart_decoder))
        .route("/api/{*path}", any(api_route_not_found))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<ApiState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        running_jobs: state.queue.running_count(),
        max_concurrency: state.queue.max_concurrency(),
        decoder_available: state.gateway.as_ref().map(|gateway| gateway.is_available()),
    })
}

async fn add_render(
    State(state): State<ApiState>,
    Json(request): Json<RenderRequest>,
) -> Result<(StatusCode, Json<CreateRenderResponse>), AppError> {
    let id = state.queue.add_job(request)?;
    Ok((StatusCode::CREATED, Json(CreateRenderResponse { id })))
}

async fn cancel_render(
    State(state): State<ApiState>,
    Json(body): Json<JobIdRequest>,
) -> Result<StatusCode, AppError> {
    state.queue.cancel_job(&body.job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn remove_render(
    State(state): State<ApiState>,
    Json(body): Json<JobIdRequest>,
) -> Result<StatusCode, AppError> {
    state.queue.remove_job(&body.job_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs(State(state): State<ApiState>) -> Json<Vec<JobSnapshot>> {
    Json(state.queue.list_jobs())
}

async fn get_job(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> Result<Json<JobSnapshot>, AppError> {
    state
        .queue
        .get_job(&id)
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("job not found: {id}")))
}

async fn set_concurrency(
    State(state): State<ApiState>,
    Json(body): Json<ConcurrencyRequest>,
) -> Result<Json<ConcurrencyResponse>, AppError> {
    if body.max_concurrency == 0 {
        return Err(AppError::BadRequest(
            "maxConcurrency must be at least 1".to_string(),
        ));
    }
    state.queue.set_max_concurrency(body.max_concurrency);
    info!(max_concurrency = body.max_concurrency, "Render concurrency updated");
    Ok(Json(ConcurrencyResponse {
        max_concurrency: state.queue.max_concurrency(),
    }))
}

async fn restart_decoder(State(state): State<ApiState>) -> Result<StatusCode, AppError> {
    let gateway = state
        .gateway
        .as_ref()
        .ok_or_else(|| AppError::NotFound("no frame decoder is configured".to_string()))?;
    if gateway.restart() {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::Internal(
            "frame decoder has been shut down".to_string(),
        ))
    }
}

async fn api_route_not_found(Path(path): Path<String>) -> AppError {
    AppError::NotFound(format!("api endpoint not found: /api/{path}"))
}

async fn jobs_ws(ws: WebSocketUpgrade, State(state): State<ApiState>) -> Response {
    let rx = state.queue.subscribe();
    ws.on_upgrade(move |socket| handle_ws(socket, rx))
}

async fn handle_ws(mut socket: WebSocket, mut rx: broadcast::Receiver<QueueEvent>) {
    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        let json = match serde_json::to_string(&event) {
                            Ok(json) => json,
                            Err(_) => break,
                        };
                        if socket.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Queue event subscriber lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    _ => {}
                }
            }
        }
    }
}

#[derive(Debug)]
pub enum AppError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            AppError::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
        };

        (status, Json(ErrorResponse { error: message })).into_response()
    }
}

impl From<QueueError> for AppError {
    fn from(err: QueueError) -> Self {
        match err {
            QueueError::JobNotFound(_) => AppError::NotFound(err.to_string()),
            QueueError::InvalidRequest(_) => AppError::BadRequest(err.to_string()),
            QueueError::DuplicateId(_) | QueueError::CleanupFailure { .. } => {
                AppError::Internal(err.to_string())
            }
        }
    }
}
