//! Application wiring.
//!
//! All engine components are leaf-owned singletons constructed here and
//! shared through [`AppState`]. The event bus is a passive sink, so the
//! references only ever point one way: engine → approval → state → store.

use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::api;
use crate::approval::ApprovalService;
use crate::config::AppConfig;
use crate::engine::{routes, RouteEngine};
use crate::events::EventBus;
use crate::llm::{ChatClient, GeminiClient};
use crate::logging::OpTimer;
use crate::recovery::CrashRecoveryService;
use crate::state::ExchangeStateManager;
use crate::store::Store;
use crate::AppState;

/// Construct the shared application state.
///
/// `llm` lets tests inject a scripted client; `None` builds the Gemini
/// client from configuration.
pub async fn build_state(
    config: AppConfig,
    llm: Option<Arc<dyn ChatClient>>,
) -> anyhow::Result<AppState> {
    let timer = OpTimer::new("server", "build_state");

    let store = Arc::new(Store::new(config.database.path.clone()).await?);
    tracing::info!(path = %config.database.path, "Store ready");

    let bus = Arc::new(EventBus::new());
    let state_manager = Arc::new(ExchangeStateManager::new(store.clone(), bus.clone()));
    let approval = Arc::new(ApprovalService::new(
        store.clone(),
        state_manager.clone(),
        bus.clone(),
    ));

    let llm = llm.unwrap_or_else(|| {
        let client = GeminiClient::new(&config.gemini);
        if config.gemini.api.key.is_none() {
            tracing::warn!("No Gemini API key configured; LLM steps will fail");
        }
        tracing::info!(model = client.model(), "LLM client ready");
        Arc::new(client) as Arc<dyn ChatClient>
    });

    let mut engine = RouteEngine::new(
        state_manager.clone(),
        approval.clone(),
        store.clone(),
        llm,
    );
    engine.register_route(routes::chat_durable(&config.engine));
    engine.register_route(routes::chat_simple(&config.engine));
    let engine = Arc::new(engine);
    tracing::info!(routes = ?engine.route_ids(), "Routes registered");

    let recovery = Arc::new(CrashRecoveryService::new(
        store.clone(),
        state_manager.clone(),
        approval.clone(),
        engine.clone(),
        bus.clone(),
    ));

    timer.finish();
    Ok(AppState {
        config: Arc::new(config),
        store,
        bus,
        state: state_manager,
        approval,
        engine,
        recovery,
    })
}

/// Router over a fully built state, with HTTP middleware applied.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    api::router()
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Build the application, run startup recovery and start the maintenance
/// timers.
pub async fn create_app(config: AppConfig) -> anyhow::Result<Router> {
    let state = build_state(config, None).await?;

    let recovered = state.recovery.on_startup().await?;
    if recovered > 0 {
        tracing::info!(recovered, "Re-submitted abandoned exchanges");
    }
    state.recovery.spawn_timers();

    Ok(build_router(state))
}
