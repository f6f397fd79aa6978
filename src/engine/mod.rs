//! Durable route execution.
//!
//! The engine runs each exchange in its own worker task, with at most one
//! worker per exchange at any time. For each step it consults
//! `should_continue`, executes the step body, then records a checkpoint.
//! A recovery submission re-runs from step 0: steps that already hold a
//! checkpoint are short-circuited by loading their recorded output into the
//! body, so no external call is repeated and no audit line or counter is
//! duplicated.

mod route;
pub mod routes;

pub use route::{Route, RouteBuilder, Step, StepAction, StepInput};

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;

use crate::approval::ApprovalService;
use crate::error::{EngineError, EngineResult};
use crate::llm::ChatClient;
use crate::state::ExchangeStateManager;
use crate::store::{ApprovalStatus, ExchangeRecord, ExchangeStatus, Store};

/// Maximum redeliveries for a failing step.
const MAX_REDELIVERIES: u32 = 3;

/// Delay between redeliveries.
const REDELIVERY_DELAY: Duration = Duration::from_secs(1);

/// Header key that overrides the approval gate timeout per exchange.
const TIMEOUT_MINUTES_HEADER: &str = "timeoutMinutes";

/// Outcome of driving a route.
enum RouteOutcome {
    /// Every step ran; carries the final body.
    Completed(String),
    /// `should_continue` turned false (pause, cancel); the worker exits
    /// cleanly without a FAILED transition.
    Suspended,
}

/// Executes registered routes step-by-step with durable checkpoints.
///
/// Cheap to clone: workers hold their own handle while the shared in-flight
/// set keeps the one-worker-per-exchange guarantee across clones.
#[derive(Clone)]
pub struct RouteEngine {
    routes: HashMap<String, Arc<Route>>,
    state: Arc<ExchangeStateManager>,
    approval: Arc<ApprovalService>,
    store: Arc<Store>,
    llm: Arc<dyn ChatClient>,
    /// Exchanges currently owned by a worker task.
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl RouteEngine {
    pub fn new(
        state: Arc<ExchangeStateManager>,
        approval: Arc<ApprovalService>,
        store: Arc<Store>,
        llm: Arc<dyn ChatClient>,
    ) -> Self {
        Self {
            routes: HashMap::new(),
            state,
            approval,
            store,
            llm,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Register a route. Routes are fixed before the engine starts serving.
    pub fn register_route(&mut self, route: Route) {
        self.routes.insert(route.id().to_string(), Arc::new(route));
    }

    /// Look up a registered route.
    #[must_use]
    pub fn route(&self, route_id: &str) -> Option<Arc<Route>> {
        self.routes.get(route_id).cloned()
    }

    /// Registered route ids, sorted.
    #[must_use]
    pub fn route_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.routes.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of exchanges currently owned by a worker.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.in_flight.lock().len()
    }

    /// Submit an exchange for asynchronous execution (fire-and-forget).
    ///
    /// With `recovery` set, already-checkpointed steps are skipped. An
    /// exchange already owned by a worker is left alone, preserving the
    /// one-worker-per-exchange guarantee.
    pub fn submit(&self, exchange_id: &str, recovery: bool) {
        if !self.in_flight.lock().insert(exchange_id.to_string()) {
            tracing::debug!(exchange_id, "Exchange already in flight, skipping submission");
            return;
        }

        let engine = self.clone();
        let exchange_id = exchange_id.to_string();
        tokio::spawn(async move {
            engine.run_exchange(&exchange_id, recovery).await;
            engine.in_flight.lock().remove(&exchange_id);
        });
    }

    async fn run_exchange(&self, exchange_id: &str, recovery: bool) {
        let exchange = match self.state.require(exchange_id).await {
            Ok(exchange) => exchange,
            Err(e) => {
                tracing::warn!(exchange_id, error = %e, "Cannot load submitted exchange");
                return;
            }
        };

        let Some(route) = self.route(&exchange.route_id) else {
            tracing::error!(
                exchange_id,
                route_id = %exchange.route_id,
                "Submitted exchange references an unregistered route"
            );
            let _ = self
                .state
                .fail(exchange_id, &format!("Route '{}' not found", exchange.route_id))
                .await;
            let _ = self.store.record_exchange_failure(&exchange.route_id).await;
            return;
        };

        // A resume racing a worker that is just winding down may leave a
        // RUNNING exchange without an owner; re-drive until genuinely idle.
        let mut recovery = recovery;
        loop {
            match self.drive(&exchange, &route, recovery).await {
                Ok(RouteOutcome::Completed(result)) => {
                    if let Err(e) = self.state.complete(exchange_id, &result).await {
                        tracing::warn!(exchange_id, error = %e, "Could not complete exchange");
                    }
                    return;
                }
                Ok(RouteOutcome::Suspended) => {
                    match self.state.require(exchange_id).await {
                        Ok(current) if current.status == ExchangeStatus::Running => {
                            tracing::debug!(exchange_id, "Resumed while winding down, re-driving");
                            recovery = true;
                        }
                        _ => {
                            tracing::info!(exchange_id, "Worker exiting cleanly");
                            return;
                        }
                    }
                }
                Err(e) => {
                    let message = e.to_string();
                    tracing::error!(exchange_id, error = %message, "Exchange failed");
                    if self.state.fail(exchange_id, &message).await.is_ok() {
                        let _ = self.store.record_exchange_failure(&exchange.route_id).await;
                    }
                    return;
                }
            }
        }
    }

    async fn drive(
        &self,
        exchange: &ExchangeRecord,
        route: &Route,
        recovery: bool,
    ) -> EngineResult<RouteOutcome> {
        let exchange_id = exchange.exchange_id.as_str();

        // A fresh submission starts the exchange; a recovered one is already
        // RUNNING unless it never left PENDING before the crash.
        let status = self.state.require(exchange_id).await?.status;
        if status == ExchangeStatus::Pending {
            self.state.start_exchange(exchange_id).await?;
        } else if !recovery {
            return Err(EngineError::InvalidState(format!(
                "exchange '{exchange_id}' was already started"
            )));
        }

        let mut body = exchange.payload.clone();

        for (index, step) in route.steps().iter().enumerate() {
            if !self.state.should_continue(exchange_id).await? {
                tracing::info!(
                    exchange_id,
                    step = %step.name,
                    "Exchange no longer active, abandoning route"
                );
                return Ok(RouteOutcome::Suspended);
            }

            if recovery {
                if let Some(prior) = self.state.find_checkpoint(exchange_id, &step.name).await? {
                    if let Some(data) = prior.step_data {
                        body = data;
                    }
                    tracing::info!(
                        exchange_id,
                        step = %step.name,
                        "Skipping already-checkpointed step"
                    );
                    continue;
                }
            }

            body = self
                .execute_with_redelivery(exchange, step, &body)
                .await?;

            let created = self
                .state
                .checkpoint(exchange_id, index as i64, &step.name, Some(body.clone()))
                .await?;
            if !created {
                tracing::debug!(exchange_id, step = %step.name, "Step was already checkpointed");
            }
        }

        Ok(RouteOutcome::Completed(body))
    }

    async fn execute_with_redelivery(
        &self,
        exchange: &ExchangeRecord,
        step: &Step,
        body: &str,
    ) -> EngineResult<String> {
        let mut attempt = 0;
        loop {
            match self.execute_step(exchange, step, body).await {
                Ok(output) => return Ok(output),
                Err(e) if e.is_redeliverable() && attempt < MAX_REDELIVERIES => {
                    attempt += 1;
                    tracing::warn!(
                        exchange_id = %exchange.exchange_id,
                        step = %step.name,
                        attempt,
                        error = %e,
                        "Step failed, redelivering"
                    );
                    tokio::time::sleep(REDELIVERY_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn execute_step(
        &self,
        exchange: &ExchangeRecord,
        step: &Step,
        body: &str,
    ) -> EngineResult<String> {
        let exchange_id = exchange.exchange_id.as_str();
        let route_id = exchange.route_id.as_str();

        match &step.action {
            StepAction::Transform(f) => f(&StepInput {
                exchange_id,
                route_id,
                body,
            }),
            StepAction::AuditLog => {
                self.store
                    .append_route_log(
                        exchange_id,
                        route_id,
                        &step.name,
                        &format!("payload of {} characters", body.chars().count()),
                    )
                    .await?;
                Ok(body.to_string())
            }
            StepAction::LlmChat { streaming } => {
                if *streaming {
                    let mut stream = self.llm.stream_chat(body).await?;
                    let mut response = String::new();
                    while let Some(fragment) = stream.next().await {
                        response.push_str(&fragment?);
                    }
                    Ok(response)
                } else {
                    self.llm.chat(body).await
                }
            }
            StepAction::ApprovalGate { timeout } => {
                // A grant from a previous incarnation satisfies the gate: the
                // executor may have died while waiting, leaving the approval
                // row APPROVED but the gate step un-checkpointed.
                let prior = self.store.list_approvals_by_exchange(exchange_id).await?;
                if let Some(latest) = prior.first() {
                    if latest.status == ApprovalStatus::Approved {
                        tracing::info!(
                            exchange_id,
                            approval_id = %latest.id,
                            "Approval gate already granted"
                        );
                        return Ok(body.to_string());
                    }
                }

                let timeout = gate_timeout(exchange, *timeout);
                self.approval
                    .request_approval(exchange_id, route_id, body, timeout)
                    .await?;
                Ok(body.to_string())
            }
            StepAction::MetricUpdate => {
                self.store.record_exchange_success(route_id).await?;
                Ok(body.to_string())
            }
        }
    }
}

/// Gate timeout for one exchange: the route default, overridable through the
/// `timeoutMinutes` header captured at submission.
fn gate_timeout(exchange: &ExchangeRecord, default: Duration) -> Duration {
    let Some(context) = exchange.context.as_deref() else {
        return default;
    };
    let Ok(headers) = serde_json::from_str::<HashMap<String, String>>(context) else {
        return default;
    };
    headers
        .get(TIMEOUT_MINUTES_HEADER)
        .and_then(|v| v.parse::<f64>().ok())
        .filter(|minutes| *minutes > 0.0)
        .map_or(default, |minutes| Duration::from_secs_f64(minutes * 60.0))
}

impl std::fmt::Debug for RouteEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteEngine")
            .field("routes", &self.route_ids())
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}
