//! Server-Sent Events endpoint.
//!
//! Each connected client gets its own sink on the event bus. The first frame
//! is a `connected` event carrying the assigned client id; buffered
//! pre-connect events follow in their original emission order.

use std::convert::Infallible;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use uuid::Uuid;

use crate::AppState;

/// Event stream routes.
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/events/stream", get(stream_events))
        .route("/api/events/health", get(events_health))
        .route("/api/events/clients/count", get(client_count))
}

/// Stream all domain events to the client.
async fn stream_events(State(state): State<AppState>) -> impl IntoResponse {
    let client_id = Uuid::new_v4().to_string();
    let mut rx = state.bus.register(&client_id);
    tracing::info!(client_id = %client_id, "SSE client connected");

    let stream = async_stream::stream! {
        yield Ok::<_, Infallible>(
            Event::default().event("connected").data(
                serde_json::json!({
                    "message": "Connected to event stream",
                    "clientId": client_id,
                })
                .to_string(),
            ),
        );

        while let Some(event) = rx.recv().await {
            let data = match serde_json::to_string(&event) {
                Ok(data) => data,
                Err(e) => {
                    tracing::warn!(error = %e, "Could not serialize event");
                    continue;
                }
            };
            yield Ok(Event::default().event(event.event_type.as_str()).data(data));
        }
    };

    Sse::new(stream).keep_alive(KeepAlive::default())
}

/// Event stream health.
#[derive(Debug, Serialize)]
pub struct EventsHealthResponse {
    pub status: &'static str,
    pub clients: usize,
}

async fn events_health(State(state): State<AppState>) -> Json<EventsHealthResponse> {
    Json(EventsHealthResponse {
        status: "ok",
        clients: state.bus.client_count(),
    })
}

/// Connected client count.
#[derive(Debug, Serialize)]
pub struct ClientCountResponse {
    pub count: usize,
}

async fn client_count(State(state): State<AppState>) -> Json<ClientCountResponse> {
    Json(ClientCountResponse {
        count: state.bus.client_count(),
    })
}
