//! Route observability endpoints: status, metrics, logs, recovery stats.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::recovery::RecoveryStatsSnapshot;
use crate::store::{RouteLogRecord, RouteMetricRecord};
use crate::AppState;

use super::error::ApiError;

/// Route observability routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/routes", get(list_routes))
        .route("/api/routes/metrics", get(all_metrics))
        .route("/api/routes/recovery-stats", get(recovery_stats))
        .route("/api/routes/logs/exchange/{exchange_id}", get(logs_by_exchange))
        .route("/api/routes/{id}/status", get(route_status))
        .route("/api/routes/{id}/metrics", get(route_metrics))
        .route("/api/routes/{id}/logs", get(route_logs))
}

/// One step of a registered route.
#[derive(Debug, Serialize)]
pub struct StepView {
    pub name: String,
    pub kind: &'static str,
}

/// Registered route summary.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteView {
    pub route_id: String,
    pub steps: Vec<StepView>,
}

/// Route status view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteStatusResponse {
    pub route_id: String,
    pub status: &'static str,
    pub steps: Vec<String>,
}

/// Metric view; zeroed when no exchange ever ran on the route.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteMetricResponse {
    pub route_id: String,
    pub total: i64,
    pub success: i64,
    pub failure: i64,
}

impl From<RouteMetricRecord> for RouteMetricResponse {
    fn from(record: RouteMetricRecord) -> Self {
        Self {
            route_id: record.route_id,
            total: record.total,
            success: record.success,
            failure: record.failure,
        }
    }
}

/// Audit log line view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteLogResponse {
    pub exchange_id: String,
    pub route_id: String,
    pub step_name: String,
    pub message: String,
    pub timestamp: String,
}

impl From<RouteLogRecord> for RouteLogResponse {
    fn from(record: RouteLogRecord) -> Self {
        Self {
            exchange_id: record.exchange_id,
            route_id: record.route_id,
            step_name: record.step_name,
            message: record.message,
            timestamp: chrono::DateTime::from_timestamp(record.created_at, 0)
                .map(|t| t.to_rfc3339())
                .unwrap_or_default(),
        }
    }
}

/// Query parameters for route logs.
#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: usize,
}

fn default_log_limit() -> usize {
    100
}

/// List registered routes.
async fn list_routes(State(state): State<AppState>) -> Json<Vec<RouteView>> {
    let views = state
        .engine
        .route_ids()
        .into_iter()
        .filter_map(|id| state.engine.route(&id))
        .map(|route| RouteView {
            route_id: route.id().to_string(),
            steps: route
                .steps()
                .iter()
                .map(|step| StepView {
                    name: step.name.clone(),
                    kind: step.action.kind(),
                })
                .collect(),
        })
        .collect();
    Json(views)
}

/// Status of one registered route.
async fn route_status(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> Result<Json<RouteStatusResponse>, ApiError> {
    let route = state
        .engine
        .route(&route_id)
        .ok_or(EngineError::RouteNotFound(route_id))?;
    Ok(Json(RouteStatusResponse {
        route_id: route.id().to_string(),
        status: "Started",
        steps: route.step_names().iter().map(ToString::to_string).collect(),
    }))
}

/// Counters for one route.
async fn route_metrics(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
) -> Result<Json<RouteMetricResponse>, ApiError> {
    if state.engine.route(&route_id).is_none() {
        return Err(EngineError::RouteNotFound(route_id).into());
    }
    let metric = state
        .store
        .get_metric(&route_id)
        .await
        .map_err(EngineError::from)?
        .map_or(
            RouteMetricResponse {
                route_id: route_id.clone(),
                total: 0,
                success: 0,
                failure: 0,
            },
            RouteMetricResponse::from,
        );
    Ok(Json(metric))
}

/// Counters for all routes.
async fn all_metrics(
    State(state): State<AppState>,
) -> Result<Json<Vec<RouteMetricResponse>>, ApiError> {
    let metrics = state.store.list_metrics().await.map_err(EngineError::from)?;
    Ok(Json(
        metrics.into_iter().map(RouteMetricResponse::from).collect(),
    ))
}

/// Recovery counters.
async fn recovery_stats(State(state): State<AppState>) -> Json<RecoveryStatsSnapshot> {
    Json(state.recovery.stats())
}

/// Audit lines for one route, newest first.
async fn route_logs(
    State(state): State<AppState>,
    Path(route_id): Path<String>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<RouteLogResponse>>, ApiError> {
    let logs = state
        .store
        .list_logs_for_route(&route_id, query.limit)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(logs.into_iter().map(RouteLogResponse::from).collect()))
}

/// Audit lines for one exchange, in emission order.
async fn logs_by_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<Vec<RouteLogResponse>>, ApiError> {
    let logs = state
        .store
        .list_logs_for_exchange(&exchange_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(logs.into_iter().map(RouteLogResponse::from).collect()))
}
