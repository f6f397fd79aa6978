//! HTTP mapping for [`EngineError`].

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::error::EngineError;

/// JSON error body.
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: &'static str,
    pub message: String,
}

/// Wrapper turning engine errors into HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match &self.0 {
            EngineError::ExchangeNotFound(_)
            | EngineError::ApprovalNotFound(_)
            | EngineError::RouteNotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            EngineError::InvalidState(_) => (StatusCode::BAD_REQUEST, "invalid_state"),
            EngineError::BadInput(_) => (StatusCode::BAD_REQUEST, "bad_input"),
            EngineError::Transient(_) => (StatusCode::INTERNAL_SERVER_ERROR, "transient"),
            // Approval outcomes and LLM failures are handled inside the
            // engine; reaching HTTP means a programming error.
            EngineError::ApprovalRejected(_)
            | EngineError::ApprovalTimeout { .. }
            | EngineError::External(_)
            | EngineError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };

        if status.is_server_error() {
            tracing::error!(error = %self.0, "Request failed");
        }

        (
            status,
            Json(ErrorBody {
                error,
                message: self.0.to_string(),
            }),
        )
            .into_response()
    }
}
