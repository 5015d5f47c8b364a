use axum::{
    Json,
    extract::{
        Query, State,
        rejection::{JsonRejection, QueryRejection},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use super::WebState;
use super::stream::sse_response;
use crate::core::UserConfig;
use crate::error::{AdmissionError, BridgeError, ErrorKind, NotFoundError, SpawnError};

/// Error body shared by every endpoint: `{detail, kind}` with a matching status.
#[derive(Debug)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ApiError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.kind.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "detail": self.detail, "kind": self.kind }))).into_response()
    }
}

impl From<BridgeError> for ApiError {
    fn from(err: BridgeError) -> Self {
        Self::new(ErrorKind::from(&err), err.to_string())
    }
}

impl From<SpawnError> for ApiError {
    fn from(err: SpawnError) -> Self {
        Self::new(ErrorKind::SpawnFailed, err.to_string())
    }
}

impl From<AdmissionError> for ApiError {
    fn from(err: AdmissionError) -> Self {
        Self::new(ErrorKind::from(&err), err.to_string())
    }
}

impl From<NotFoundError> for ApiError {
    fn from(err: NotFoundError) -> Self {
        Self::new(ErrorKind::NotFound, err.to_string())
    }
}

impl From<JsonRejection> for ApiError {
    fn from(err: JsonRejection) -> Self {
        Self::new(ErrorKind::BadRequest, err.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(err: QueryRejection) -> Self {
        Self::new(ErrorKind::BadRequest, err.body_text())
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Deserialize)]
pub struct JobQuery {
    #[serde(rename = "jobId")]
    pub job_id: String,
}

#[derive(Debug, Deserialize)]
pub struct StartRequest {
    pub config: UserConfig,
}

pub async fn connect(State(state): State<WebState>) -> ApiResult<Json<Value>> {
    let ctx = &state.ctx;

    if !ctx.config.simulation {
        match ctx.supervisor.connect().await {
            Ok(port) => debug!(port, "Bridge daemon already running"),
            Err(BridgeError::Unreachable(reason)) if ctx.supervisor.config().auto_start => {
                info!(reason = %reason, "Starting bridge daemon");
                ctx.supervisor.ensure_started().await?;
            }
            Err(e) => return Err(e.into()),
        }
    }

    ctx.bridge.probe().await?;
    Ok(Json(json!({})))
}

pub async fn devices(State(state): State<WebState>) -> ApiResult<Json<Value>> {
    let devices = state.ctx.devices.list_devices().await?;
    Ok(Json(json!({ "devices": devices })))
}

pub async fn start_backup(
    State(state): State<WebState>,
    body: Result<Json<StartRequest>, JsonRejection>,
) -> ApiResult<Json<Value>> {
    let Json(request) = body?;
    match state.ctx.jobs.start(request.config).await {
        Ok(job_id) => Ok(Json(json!({ "jobId": job_id }))),
        Err(e) => {
            warn!(error = %e, "Backup start rejected");
            Err(e.into())
        }
    }
}

pub async fn backup_stream(
    State(state): State<WebState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> ApiResult<Response> {
    let Query(query) = query?;
    let events = state.ctx.jobs.attach(&query.job_id).await?;
    debug!(job_id = %query.job_id, "Event stream attached");
    Ok(sse_response(events).into_response())
}

pub async fn cancel_backup(
    State(state): State<WebState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    state.ctx.jobs.cancel(&query.job_id).await?;
    Ok(Json(json!({})))
}

pub async fn backup_status(
    State(state): State<WebState>,
    query: Result<Query<JobQuery>, QueryRejection>,
) -> ApiResult<Json<Value>> {
    let Query(query) = query?;
    let snapshot = state.ctx.jobs.status(&query.job_id).await?;
    Ok(Json(json!(snapshot)))
}

pub async fn restart_bridge(State(state): State<WebState>) -> ApiResult<Json<Value>> {
    if state.ctx.config.simulation {
        debug!("Simulation mode, nothing to restart");
        return Ok(Json(json!({})));
    }
    let port = state.ctx.supervisor.restart().await?;
    info!(port, "Bridge daemon restarted");
    Ok(Json(json!({})))
}

pub async fn health(State(state): State<WebState>) -> Json<Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "bridge": state.ctx.supervisor.state(),
        "simulation": state.ctx.config.simulation,
    }))
}
