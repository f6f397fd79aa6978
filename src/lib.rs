//! Courier - Durable Route Execution Engine
//!
//! A single-process workflow engine for multi-step pipelines that integrate
//! with an external LLM chat service. Every invocation (an "exchange") is
//! persisted step-by-step, so a crash, restart or operator pause resumes
//! from the last successful checkpoint instead of from the top. Routes may
//! carry human-in-the-loop approval gates that suspend an exchange until an
//! operator decides over REST, surviving process restarts while they wait.
//!
//! # Architecture
//!
//! - [`store`]: sqlite persistence (exchanges, checkpoints, approvals, logs,
//!   metrics)
//! - [`events`]: in-process event fan-out to SSE sinks
//! - [`state`]: the exchange state machine and checkpoint contract
//! - [`approval`]: approval gates and the blocking/unblocking protocol
//! - [`engine`]: the durable step runner and the declared routes
//! - [`recovery`]: startup crash recovery and periodic maintenance
//! - [`llm`]: the Gemini chat client behind the [`llm::ChatClient`] seam
//! - [`api`]: the REST surface
//!
//! # Example
//!
//! ```rust,ignore
//! use courier::{config::AppConfig, server::create_app};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = AppConfig::load()?;
//!     let app = create_app(config).await?;
//!
//!     let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//!     axum::serve(listener, app).await?;
//!     Ok(())
//! }
//! ```

#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod api;
pub mod approval;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod llm;
pub mod logging;
pub mod recovery;
pub mod server;
pub mod state;
pub mod store;

use std::sync::Arc;

use approval::ApprovalService;
use config::AppConfig;
use engine::RouteEngine;
use events::EventBus;
use recovery::CrashRecoveryService;
use state::ExchangeStateManager;
use store::Store;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    /// Application configuration.
    pub config: Arc<AppConfig>,
    /// Relational persistence.
    pub store: Arc<Store>,
    /// Event fan-out to SSE clients.
    pub bus: Arc<EventBus>,
    /// Exchange lifecycle state machine.
    pub state: Arc<ExchangeStateManager>,
    /// Approval gate service.
    pub approval: Arc<ApprovalService>,
    /// Route execution engine.
    pub engine: Arc<RouteEngine>,
    /// Crash recovery service.
    pub recovery: Arc<CrashRecoveryService>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("routes", &self.engine.route_ids())
            .field("sse_clients", &self.bus.client_count())
            .finish()
    }
}
