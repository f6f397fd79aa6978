//! Human-in-the-loop approval gates.
//!
//! An approval gate suspends the executing step on an in-memory oneshot
//! signal keyed by approval id, while the exchange row sits in
//! WAITING_APPROVAL. The committed database transition always happens before
//! the signal fires, which always happens before the executor observes the
//! outcome. Signals are rebuilt from PENDING rows on startup so a decision
//! made after a restart still lands.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventType, RouteEvent};
use crate::state::ExchangeStateManager;
use crate::store::{
    ApprovalRecord, ApprovalStatus, CompleteApprovalOutcome, CreateApprovalOutcome, Store,
};

/// Operator decision delivered to a waiting executor.
#[derive(Debug, Clone)]
pub enum ApprovalDecision {
    Granted { response: Option<String> },
    Rejected { reason: Option<String> },
}

/// Creates approval requests and blocks/unblocks executors on decisions.
pub struct ApprovalService {
    store: Arc<Store>,
    state: Arc<ExchangeStateManager>,
    bus: Arc<EventBus>,
    /// Completion signals keyed by approval id.
    signals: Mutex<HashMap<String, oneshot::Sender<ApprovalDecision>>>,
}

impl ApprovalService {
    pub fn new(store: Arc<Store>, state: Arc<ExchangeStateManager>, bus: Arc<EventBus>) -> Self {
        Self {
            store,
            state,
            bus,
            signals: Mutex::new(HashMap::new()),
        }
    }

    /// Create a PENDING approval and block until the operator decides.
    ///
    /// Returns the approver's optional response text on grant. Fails with
    /// `ApprovalRejected` on rejection and `ApprovalTimeout` when `timeout`
    /// expires, in which case the row is auto-rejected in a separate
    /// transaction.
    pub async fn request_approval(
        &self,
        exchange_id: &str,
        route_id: &str,
        payload: &str,
        timeout: Duration,
    ) -> EngineResult<Option<String>> {
        let (approval_id, rx) = self
            .open_request(exchange_id, route_id, payload)
            .await?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(ApprovalDecision::Granted { response })) => Ok(response),
            Ok(Ok(ApprovalDecision::Rejected { reason })) => Err(EngineError::ApprovalRejected(
                reason.unwrap_or_else(|| "rejected by operator".to_string()),
            )),
            Ok(Err(_closed)) => Err(EngineError::Internal(anyhow::anyhow!(
                "approval signal dropped without a decision"
            ))),
            Err(_elapsed) => {
                self.signals.lock().remove(&approval_id);
                // Best effort: the operator may have decided in the same
                // instant; a terminal row is left alone.
                if let CompleteApprovalOutcome::Completed(_) = self
                    .store
                    .complete_approval(
                        &approval_id,
                        ApprovalStatus::Rejected,
                        Some("Approval timed out".to_string()),
                    )
                    .await?
                {
                    self.bus.broadcast(
                        RouteEvent::exchange(EventType::ApprovalRejected, route_id, exchange_id)
                            .with("approvalId", approval_id.clone())
                            .with("reason", "Approval timed out"),
                    );
                }
                Err(EngineError::ApprovalTimeout {
                    minutes: timeout.as_secs_f64() / 60.0,
                })
            }
        }
    }

    /// Non-blocking variant: create the PENDING approval and return its id.
    ///
    /// The executing route stops cleanly in WAITING_APPROVAL; the recovery
    /// service re-submits the exchange once the approval is granted.
    pub async fn create_approval_request(
        &self,
        exchange_id: &str,
        route_id: &str,
        payload: &str,
    ) -> EngineResult<String> {
        let (approval_id, _rx) = self.open_request(exchange_id, route_id, payload).await?;
        Ok(approval_id)
    }

    /// Grant a PENDING approval.
    ///
    /// The approval row and the exchange transition commit before the
    /// in-memory signal completes. With no live waiter (crashed executor or
    /// non-blocking gate) the exchange is left in WAITING_APPROVAL for the
    /// recovery tick to re-submit.
    pub async fn approve(
        &self,
        approval_id: &str,
        response: Option<String>,
    ) -> EngineResult<ApprovalRecord> {
        let approval = self
            .complete(approval_id, ApprovalStatus::Approved, response.clone())
            .await?;

        let waiter = self.signals.lock().remove(approval_id);
        if let Some(tx) = waiter.filter(|tx| !tx.is_closed()) {
            // Commit the exchange transition, then wake the executor.
            self.state.resume_after_approval(&approval.exchange_id).await?;
            let _ = tx.send(ApprovalDecision::Granted { response });
        } else {
            tracing::info!(
                approval_id,
                exchange_id = %approval.exchange_id,
                "Approval granted with no live waiter; recovery will resume the exchange"
            );
        }

        self.bus.broadcast(
            RouteEvent::exchange(
                EventType::ApprovalGranted,
                &approval.route_id,
                &approval.exchange_id,
            )
            .with("approvalId", approval_id),
        );

        Ok(approval)
    }

    /// Reject a PENDING approval.
    ///
    /// A live waiter observes `ApprovalRejected` and the route transitions
    /// the exchange to FAILED; with no waiter the exchange is failed here.
    pub async fn reject(
        &self,
        approval_id: &str,
        reason: Option<String>,
    ) -> EngineResult<ApprovalRecord> {
        let approval = self
            .complete(approval_id, ApprovalStatus::Rejected, reason.clone())
            .await?;

        let message = format!(
            "Approval rejected: {}",
            reason.clone().unwrap_or_else(|| "no reason given".to_string())
        );

        let waiter = self.signals.lock().remove(approval_id);
        if let Some(tx) = waiter.filter(|tx| !tx.is_closed()) {
            let _ = tx.send(ApprovalDecision::Rejected { reason });
        } else if let Err(e) = self.state.fail(&approval.exchange_id, &message).await {
            tracing::warn!(
                approval_id,
                exchange_id = %approval.exchange_id,
                error = %e,
                "Could not fail exchange after rejection"
            );
        }

        self.bus.broadcast(
            RouteEvent::exchange(
                EventType::ApprovalRejected,
                &approval.route_id,
                &approval.exchange_id,
            )
            .with("approvalId", approval_id)
            .with("reason", message),
        );

        Ok(approval)
    }

    /// Reinstall a signal for every PENDING row so that a later decision can
    /// unblock a future executor. Called once on startup.
    pub async fn restore_pending_approvals(&self) -> EngineResult<usize> {
        let pending = self.store.list_pending_approvals().await?;
        let mut signals = self.signals.lock();
        for approval in &pending {
            // The receiving half is dropped: decisions for these rows follow
            // the no-live-waiter path until a recovered executor re-requests.
            let (tx, _rx) = oneshot::channel();
            signals.insert(approval.id.clone(), tx);
        }
        Ok(pending.len())
    }

    /// Number of registered signals (for observability).
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signals.lock().len()
    }

    async fn open_request(
        &self,
        exchange_id: &str,
        route_id: &str,
        payload: &str,
    ) -> EngineResult<(String, oneshot::Receiver<ApprovalDecision>)> {
        let approval_id = Uuid::new_v4().to_string();

        match self
            .store
            .create_approval_waiting(&approval_id, exchange_id, route_id, payload)
            .await?
        {
            CreateApprovalOutcome::Created(_) => {}
            CreateApprovalOutcome::ExchangeNotRunning => {
                return Err(EngineError::InvalidState(format!(
                    "exchange '{exchange_id}' is not running; cannot open an approval"
                )));
            }
            CreateApprovalOutcome::AlreadyPending => {
                return Err(EngineError::InvalidState(format!(
                    "exchange '{exchange_id}' already has a pending approval"
                )));
            }
        }

        let (tx, rx) = oneshot::channel();
        self.signals.lock().insert(approval_id.clone(), tx);

        self.bus.broadcast(
            RouteEvent::exchange(EventType::ExchangeWaitingApproval, route_id, exchange_id)
                .with("approvalId", approval_id.clone()),
        );
        self.bus.broadcast(
            RouteEvent::exchange(EventType::ApprovalRequested, route_id, exchange_id)
                .with("approvalId", approval_id.clone()),
        );

        Ok((approval_id, rx))
    }

    async fn complete(
        &self,
        approval_id: &str,
        to: ApprovalStatus,
        response: Option<String>,
    ) -> EngineResult<ApprovalRecord> {
        match self.store.complete_approval(approval_id, to, response).await? {
            CompleteApprovalOutcome::Completed(approval) => Ok(approval),
            CompleteApprovalOutcome::NotFound => {
                Err(EngineError::ApprovalNotFound(approval_id.to_string()))
            }
            CompleteApprovalOutcome::NotPending => Err(EngineError::InvalidState(format!(
                "approval '{approval_id}' is not pending"
            ))),
        }
    }
}

impl std::fmt::Debug for ApprovalService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApprovalService")
            .field("signals", &self.signal_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ExchangeStatus;
    use tempfile::NamedTempFile;

    struct Fixture {
        service: Arc<ApprovalService>,
        state: Arc<ExchangeStateManager>,
        store: Arc<Store>,
        _temp: NamedTempFile,
    }

    async fn fixture() -> Fixture {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(temp.path()).await.unwrap());
        let bus = Arc::new(EventBus::new());
        let state = Arc::new(ExchangeStateManager::new(store.clone(), bus.clone()));
        let service = Arc::new(ApprovalService::new(store.clone(), state.clone(), bus));
        Fixture {
            service,
            state,
            store,
            _temp: temp,
        }
    }

    async fn running_exchange(fx: &Fixture) -> String {
        let exchange = fx
            .state
            .create_exchange("chat-durable", "Hi", &HashMap::new())
            .await
            .unwrap();
        fx.state.start_exchange(&exchange.exchange_id).await.unwrap();
        exchange.exchange_id
    }

    #[tokio::test]
    async fn test_blocking_approve_flow() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let service = fx.service.clone();
        let waiter_exchange = exchange_id.clone();
        let waiter = tokio::spawn(async move {
            service
                .request_approval(&waiter_exchange, "chat-durable", "Hi", Duration::from_secs(5))
                .await
        });

        // Wait for the pending row to appear.
        let approval = loop {
            let pending = fx.store.list_pending_approvals().await.unwrap();
            if let Some(approval) = pending.first() {
                break approval.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };
        assert_eq!(
            fx.state.require(&exchange_id).await.unwrap().status,
            ExchangeStatus::WaitingApproval
        );

        fx.service
            .approve(&approval.id, Some("ok".to_string()))
            .await
            .unwrap();

        let response = waiter.await.unwrap().unwrap();
        assert_eq!(response.as_deref(), Some("ok"));

        // Approval causality: the exchange row is RUNNING once the waiter
        // observed the grant.
        assert_eq!(
            fx.state.require(&exchange_id).await.unwrap().status,
            ExchangeStatus::Running
        );
    }

    #[tokio::test]
    async fn test_blocking_reject_flow() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let service = fx.service.clone();
        let waiter_exchange = exchange_id.clone();
        let waiter = tokio::spawn(async move {
            service
                .request_approval(&waiter_exchange, "chat-durable", "Hi", Duration::from_secs(5))
                .await
        });

        let approval = loop {
            let pending = fx.store.list_pending_approvals().await.unwrap();
            if let Some(approval) = pending.first() {
                break approval.clone();
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        fx.service
            .reject(&approval.id, Some("no".to_string()))
            .await
            .unwrap();

        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, EngineError::ApprovalRejected(ref r) if r == "no"));
    }

    #[tokio::test]
    async fn test_timeout_auto_rejects_row() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let err = fx
            .service
            .request_approval(&exchange_id, "chat-durable", "Hi", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ApprovalTimeout { .. }));

        let approvals = fx.store.list_approvals_by_exchange(&exchange_id).await.unwrap();
        assert_eq!(approvals.len(), 1);
        assert_eq!(approvals[0].status, ApprovalStatus::Rejected);
        assert!(approvals[0].response.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_double_approve_is_invalid_state() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let approval_id = fx
            .service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap();

        fx.service.approve(&approval_id, None).await.unwrap();
        let err = fx.service.approve(&approval_id, None).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_unknown_approval_is_not_found() {
        let fx = fixture().await;
        let err = fx.service.approve("ghost", None).await.unwrap_err();
        assert!(matches!(err, EngineError::ApprovalNotFound(_)));
    }

    #[tokio::test]
    async fn test_approve_without_waiter_leaves_waiting_approval() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let approval_id = fx
            .service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap();
        fx.service.approve(&approval_id, None).await.unwrap();

        // No live waiter: recovery owns the resume.
        assert_eq!(
            fx.state.require(&exchange_id).await.unwrap().status,
            ExchangeStatus::WaitingApproval
        );
        let waiting = fx.store.list_approved_waiting_exchanges().await.unwrap();
        assert_eq!(waiting.len(), 1);
    }

    #[tokio::test]
    async fn test_reject_without_waiter_fails_exchange() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        let approval_id = fx
            .service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap();
        fx.service
            .reject(&approval_id, Some("no".to_string()))
            .await
            .unwrap();

        let exchange = fx.state.require(&exchange_id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Failed);
        assert_eq!(exchange.context.as_deref(), Some("Approval rejected: no"));
    }

    #[tokio::test]
    async fn test_restore_pending_approvals() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;
        fx.service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap();

        // Simulate a restart: a fresh service over the same store.
        let bus = Arc::new(EventBus::new());
        let restarted =
            ApprovalService::new(fx.store.clone(), fx.state.clone(), bus);
        assert_eq!(restarted.signal_count(), 0);

        let restored = restarted.restore_pending_approvals().await.unwrap();
        assert_eq!(restored, 1);
        assert_eq!(restarted.signal_count(), 1);
    }

    #[tokio::test]
    async fn test_second_pending_approval_refused() {
        let fx = fixture().await;
        let exchange_id = running_exchange(&fx).await;

        fx.service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap();
        let err = fx
            .service
            .create_approval_request(&exchange_id, "chat-durable", "Hi")
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
    }
}
