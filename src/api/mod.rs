//! HTTP API endpoints.

pub mod approvals;
pub mod error;
pub mod events;
pub mod exchanges;
pub mod routes;

use axum::Router;

use crate::AppState;

/// Assemble the full API router.
pub fn router() -> Router<AppState> {
    Router::new()
        .merge(exchanges::router())
        .merge(approvals::router())
        .merge(routes::router())
        .merge(events::router())
}
