//! Exchange submission, inspection and control endpoints.

use std::collections::HashMap;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::engine::routes::validate_payload;
use crate::error::EngineError;
use crate::logging::OpTimer;
use crate::store::{CheckpointRecord, ExchangeRecord, ExchangeStatus};
use crate::AppState;

use super::error::ApiError;

/// Header namespace reserved for the engine; stripped before persisting.
const INTERNAL_HEADER_PREFIX: &str = "courier-";

/// Exchange routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/exchanges", post(create_exchange))
        .route("/api/exchanges", get(list_exchanges))
        .route("/api/exchanges/{id}", get(get_exchange))
        .route("/api/exchanges/{id}/pause", post(pause_exchange))
        .route("/api/exchanges/{id}/resume", post(resume_exchange))
        .route("/api/exchanges/{id}/cancel", post(cancel_exchange))
        .route("/api/exchanges/{id}/checkpoints", get(list_checkpoints))
}

/// Exchange submission request.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExchangeRequest {
    pub route_id: String,
    pub payload: String,
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
}

/// 202 body for a submission.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateExchangeResponse {
    pub exchange_id: String,
    pub route_id: String,
    pub message: String,
}

/// Full exchange view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeResponse {
    pub exchange_id: String,
    pub route_id: String,
    pub status: ExchangeStatus,
    pub current_step: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step_name: Option<String>,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub last_checkpoint: String,
}

fn rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl From<ExchangeRecord> for ExchangeResponse {
    fn from(record: ExchangeRecord) -> Self {
        Self {
            exchange_id: record.exchange_id,
            route_id: record.route_id,
            status: record.status,
            current_step: record.current_step,
            current_step_name: record.current_step_name,
            payload: record.payload,
            context: record.context,
            created_at: rfc3339(record.created_at),
            started_at: record.started_at.map(rfc3339),
            completed_at: record.completed_at.map(rfc3339),
            last_checkpoint: rfc3339(record.last_checkpoint),
        }
    }
}

/// Checkpoint view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckpointResponse {
    pub step_index: i64,
    pub step_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_data: Option<String>,
    pub timestamp: String,
}

impl From<CheckpointRecord> for CheckpointResponse {
    fn from(record: CheckpointRecord) -> Self {
        Self {
            step_index: record.step_index,
            step_name: record.step_name,
            step_data: record.step_data,
            timestamp: rfc3339(record.created_at),
        }
    }
}

/// Query parameters for the exchange list.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListExchangesQuery {
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub route_id: Option<String>,
    #[serde(default = "default_limit")]
    pub limit: usize,
    #[serde(default)]
    pub offset: usize,
}

fn default_limit() -> usize {
    100
}

/// Exchange list response.
#[derive(Debug, Serialize)]
pub struct ListExchangesResponse {
    pub exchanges: Vec<ExchangeResponse>,
    pub total: usize,
    pub limit: usize,
    pub offset: usize,
}

/// Control response for pause/resume/cancel.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ControlResponse {
    pub exchange_id: String,
    pub status: ExchangeStatus,
    pub message: String,
}

/// Accept an exchange and begin execution asynchronously.
async fn create_exchange(
    State(state): State<AppState>,
    Json(request): Json<CreateExchangeRequest>,
) -> Result<(StatusCode, Json<CreateExchangeResponse>), ApiError> {
    let timer = OpTimer::new("api", "create_exchange");

    if state.engine.route(&request.route_id).is_none() {
        return Err(EngineError::RouteNotFound(request.route_id).into());
    }
    validate_payload(&request.payload, state.config.engine.max_payload_chars)?;

    let headers: HashMap<String, String> = request
        .headers
        .unwrap_or_default()
        .into_iter()
        .filter(|(key, _)| !key.to_ascii_lowercase().starts_with(INTERNAL_HEADER_PREFIX))
        .collect();

    let exchange = state
        .state
        .create_exchange(&request.route_id, &request.payload, &headers)
        .await?;
    state
        .store
        .record_exchange_total(&request.route_id)
        .await
        .map_err(EngineError::from)?;

    state.engine.submit(&exchange.exchange_id, false);

    timer.finish();
    Ok((
        StatusCode::ACCEPTED,
        Json(CreateExchangeResponse {
            exchange_id: exchange.exchange_id,
            route_id: exchange.route_id,
            message: "Exchange accepted for execution".to_string(),
        }),
    ))
}

/// List exchanges with filtering and pagination.
async fn list_exchanges(
    State(state): State<AppState>,
    Query(query): Query<ListExchangesQuery>,
) -> Result<Json<ListExchangesResponse>, ApiError> {
    let status = match query.status.as_deref() {
        Some(raw) => Some(
            ExchangeStatus::parse(raw)
                .map_err(|_| EngineError::BadInput(format!("unknown status filter '{raw}'")))?,
        ),
        None => None,
    };

    let exchanges = state
        .store
        .list_exchanges(status, query.route_id.clone(), query.limit, query.offset)
        .await
        .map_err(EngineError::from)?;
    let total = state
        .store
        .count_exchanges(status, query.route_id)
        .await
        .map_err(EngineError::from)?;

    Ok(Json(ListExchangesResponse {
        exchanges: exchanges.into_iter().map(ExchangeResponse::from).collect(),
        total,
        limit: query.limit,
        offset: query.offset,
    }))
}

/// Fetch one exchange.
async fn get_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<ExchangeResponse>, ApiError> {
    let exchange = state.state.require(&exchange_id).await?;
    Ok(Json(exchange.into()))
}

/// Pause a RUNNING exchange.
async fn pause_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    state.state.pause(&exchange_id).await?;
    Ok(Json(ControlResponse {
        exchange_id,
        status: ExchangeStatus::Paused,
        message: "Exchange paused".to_string(),
    }))
}

/// Resume a PAUSED exchange through the recovery path.
async fn resume_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    state.state.resume(&exchange_id).await?;
    state.engine.submit(&exchange_id, true);
    Ok(Json(ControlResponse {
        exchange_id,
        status: ExchangeStatus::Running,
        message: "Exchange resumed".to_string(),
    }))
}

/// Cancel a non-terminal exchange.
async fn cancel_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<ControlResponse>, ApiError> {
    state.state.cancel(&exchange_id).await?;
    Ok(Json(ControlResponse {
        exchange_id,
        status: ExchangeStatus::Cancelled,
        message: "Exchange cancelled".to_string(),
    }))
}

/// Checkpoints for an exchange, ordered by step index.
async fn list_checkpoints(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<Vec<CheckpointResponse>>, ApiError> {
    // 404 for an unknown exchange rather than an empty list.
    state.state.require(&exchange_id).await?;
    let checkpoints = state
        .store
        .list_checkpoints(&exchange_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(
        checkpoints.into_iter().map(CheckpointResponse::from).collect(),
    ))
}
