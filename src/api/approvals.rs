//! Approval decision endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::store::{ApprovalRecord, ApprovalStatus};
use crate::AppState;

use super::error::ApiError;

/// Approval routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/approvals", get(list_pending))
        .route("/api/approvals/{id}", get(get_approval))
        .route(
            "/api/approvals/by-exchange/{exchange_id}",
            get(list_by_exchange),
        )
        .route("/api/approvals/{id}/approve", post(approve))
        .route("/api/approvals/{id}/reject", post(reject))
}

/// Approval view.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalResponse {
    pub id: String,
    pub exchange_id: String,
    pub route_id: String,
    pub payload: String,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<String>,
    pub created_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
}

fn rfc3339(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

impl From<ApprovalRecord> for ApprovalResponse {
    fn from(record: ApprovalRecord) -> Self {
        Self {
            id: record.id,
            exchange_id: record.exchange_id,
            route_id: record.route_id,
            payload: record.payload,
            status: record.status,
            response: record.response,
            created_at: rfc3339(record.created_at),
            completed_at: record.completed_at.map(rfc3339),
        }
    }
}

/// Approve request body.
#[derive(Debug, Default, Deserialize)]
pub struct ApproveRequest {
    #[serde(default)]
    pub response: Option<String>,
}

/// Reject request body.
#[derive(Debug, Default, Deserialize)]
pub struct RejectRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// PENDING approvals, oldest first.
async fn list_pending(
    State(state): State<AppState>,
) -> Result<Json<Vec<ApprovalResponse>>, ApiError> {
    let pending = state
        .store
        .list_pending_approvals()
        .await
        .map_err(EngineError::from)?;
    Ok(Json(pending.into_iter().map(ApprovalResponse::from).collect()))
}

/// Fetch one approval.
async fn get_approval(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let approval = state
        .store
        .get_approval(&approval_id)
        .await
        .map_err(EngineError::from)?
        .ok_or(EngineError::ApprovalNotFound(approval_id))?;
    Ok(Json(approval.into()))
}

/// All approvals for an exchange, newest first.
async fn list_by_exchange(
    State(state): State<AppState>,
    Path(exchange_id): Path<String>,
) -> Result<Json<Vec<ApprovalResponse>>, ApiError> {
    let approvals = state
        .store
        .list_approvals_by_exchange(&exchange_id)
        .await
        .map_err(EngineError::from)?;
    Ok(Json(
        approvals.into_iter().map(ApprovalResponse::from).collect(),
    ))
}

/// Grant a PENDING approval.
async fn approve(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(request): Json<ApproveRequest>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let approval = state.approval.approve(&approval_id, request.response).await?;
    Ok(Json(approval.into()))
}

/// Reject a PENDING approval.
async fn reject(
    State(state): State<AppState>,
    Path(approval_id): Path<String>,
    Json(request): Json<RejectRequest>,
) -> Result<Json<ApprovalResponse>, ApiError> {
    let approval = state.approval.reject(&approval_id, request.reason).await?;
    Ok(Json(approval.into()))
}
