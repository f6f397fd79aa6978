//! Exchange lifecycle state machine and checkpoint contract.
//!
//! The state manager is the only writer of exchange status. Every transition
//! is validated against the allowed edges, committed, and then published on
//! the event bus. Checkpoints are idempotent on `(exchange_id, step_name)`,
//! which is what lets a recovered exchange re-run from step 0 without
//! duplicating work.

use std::collections::HashMap;
use std::sync::Arc;

use uuid::Uuid;

use crate::error::{EngineError, EngineResult};
use crate::events::{EventBus, EventType, RouteEvent};
use crate::store::{CheckpointRecord, ExchangeRecord, ExchangeStatus, Store};

/// Owns exchange lifecycle transitions and the checkpoint log.
#[derive(Clone)]
pub struct ExchangeStateManager {
    store: Arc<Store>,
    bus: Arc<EventBus>,
}

impl ExchangeStateManager {
    pub fn new(store: Arc<Store>, bus: Arc<EventBus>) -> Self {
        Self { store, bus }
    }

    /// Create a new PENDING exchange and publish `EXCHANGE_CREATED`.
    ///
    /// `headers` are the caller's original non-internal headers, persisted as
    /// the initial context JSON.
    pub async fn create_exchange(
        &self,
        route_id: &str,
        payload: &str,
        headers: &HashMap<String, String>,
    ) -> EngineResult<ExchangeRecord> {
        let exchange_id = Uuid::new_v4().to_string();
        let context = if headers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(headers).map_err(anyhow::Error::from)?)
        };

        let exchange = self
            .store
            .create_exchange(&exchange_id, route_id, payload, context)
            .await?;

        self.bus.broadcast(RouteEvent::exchange(
            EventType::ExchangeCreated,
            route_id,
            &exchange_id,
        ));

        Ok(exchange)
    }

    /// PENDING → RUNNING when the engine picks the exchange up.
    pub async fn start_exchange(&self, exchange_id: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Running,
            &[ExchangeStatus::Pending],
            None,
            EventType::ExchangeStarted,
        )
        .await
    }

    /// RUNNING → PAUSED on operator request.
    pub async fn pause(&self, exchange_id: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Paused,
            &[ExchangeStatus::Running],
            None,
            EventType::ExchangePaused,
        )
        .await
    }

    /// PAUSED → RUNNING on operator request; the caller re-submits the
    /// exchange through the recovery path.
    pub async fn resume(&self, exchange_id: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Running,
            &[ExchangeStatus::Paused],
            None,
            EventType::ExchangeResumed,
        )
        .await
    }

    /// WAITING_APPROVAL → RUNNING after an approval was granted.
    pub async fn resume_after_approval(&self, exchange_id: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Running,
            &[ExchangeStatus::WaitingApproval],
            None,
            EventType::ExchangeResumed,
        )
        .await
    }

    /// RUNNING / PAUSED / WAITING_APPROVAL → CANCELLED.
    pub async fn cancel(&self, exchange_id: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Cancelled,
            &[
                ExchangeStatus::Running,
                ExchangeStatus::Paused,
                ExchangeStatus::WaitingApproval,
            ],
            None,
            EventType::ExchangeCancelled,
        )
        .await
    }

    /// RUNNING → COMPLETED; the context is overwritten with the final result.
    pub async fn complete(&self, exchange_id: &str, result: &str) -> EngineResult<()> {
        self.transition(
            exchange_id,
            ExchangeStatus::Completed,
            &[ExchangeStatus::Running],
            Some(result.to_string()),
            EventType::ExchangeCompleted,
        )
        .await
    }

    /// Any non-terminal status → FAILED; the context records the message.
    pub async fn fail(&self, exchange_id: &str, message: &str) -> EngineResult<()> {
        let result = self
            .transition_with_data(
                exchange_id,
                ExchangeStatus::Failed,
                &[
                    ExchangeStatus::Pending,
                    ExchangeStatus::Running,
                    ExchangeStatus::Paused,
                    ExchangeStatus::WaitingApproval,
                ],
                Some(message.to_string()),
                EventType::ExchangeFailed,
                &[("error", message)],
            )
            .await;
        if let Err(ref e) = result {
            tracing::warn!(exchange_id, error = %e, "Could not mark exchange failed");
        }
        result
    }

    /// Record a step checkpoint.
    ///
    /// Returns `true` when the step was newly checkpointed. Returns `false`
    /// without mutating `current_step` / `last_checkpoint` when
    /// `(exchange_id, step_name)` already exists, which is what makes
    /// recovery re-runs idempotent.
    pub async fn checkpoint(
        &self,
        exchange_id: &str,
        step_index: i64,
        step_name: &str,
        step_data: Option<String>,
    ) -> EngineResult<bool> {
        let created = self
            .store
            .insert_checkpoint(exchange_id, step_index, step_name, step_data)
            .await
            .map_err(|e| EngineError::Transient(format!("checkpoint insert: {e:#}")))?;

        if created {
            let exchange = self.require(exchange_id).await?;
            self.bus.broadcast(
                RouteEvent::exchange(
                    EventType::ExchangeCheckpoint,
                    &exchange.route_id,
                    exchange_id,
                )
                .with("step", step_name)
                .with("stepIndex", step_index.to_string()),
            );
        }

        Ok(created)
    }

    /// Whether the engine may execute the next step.
    ///
    /// True only for RUNNING and WAITING_APPROVAL; on anything else the
    /// worker abandons the rest of the route cleanly.
    pub async fn should_continue(&self, exchange_id: &str) -> EngineResult<bool> {
        let exchange = self.require(exchange_id).await?;
        Ok(matches!(
            exchange.status,
            ExchangeStatus::Running | ExchangeStatus::WaitingApproval
        ))
    }

    /// Fetch an exchange, or fail with `ExchangeNotFound`.
    pub async fn require(&self, exchange_id: &str) -> EngineResult<ExchangeRecord> {
        self.store
            .get_exchange(exchange_id)
            .await?
            .ok_or_else(|| EngineError::ExchangeNotFound(exchange_id.to_string()))
    }

    /// Prior checkpoint for a named step, if the step already ran.
    pub async fn find_checkpoint(
        &self,
        exchange_id: &str,
        step_name: &str,
    ) -> EngineResult<Option<CheckpointRecord>> {
        Ok(self.store.get_checkpoint(exchange_id, step_name).await?)
    }

    async fn transition(
        &self,
        exchange_id: &str,
        to: ExchangeStatus,
        allowed_from: &[ExchangeStatus],
        context: Option<String>,
        event_type: EventType,
    ) -> EngineResult<()> {
        self.transition_with_data(exchange_id, to, allowed_from, context, event_type, &[])
            .await
    }

    async fn transition_with_data(
        &self,
        exchange_id: &str,
        to: ExchangeStatus,
        allowed_from: &[ExchangeStatus],
        context: Option<String>,
        event_type: EventType,
        data: &[(&str, &str)],
    ) -> EngineResult<()> {
        let changed = self
            .store
            .transition_exchange(exchange_id, to, allowed_from, context)
            .await?;

        if !changed {
            // Distinguish a missing exchange from an illegal edge.
            let exchange = self.require(exchange_id).await?;
            return Err(EngineError::InvalidState(format!(
                "cannot move exchange '{exchange_id}' from {} to {}",
                exchange.status.as_str(),
                to.as_str()
            )));
        }

        let exchange = self.require(exchange_id).await?;
        let mut event = RouteEvent::exchange(event_type, &exchange.route_id, exchange_id)
            .with("status", to.as_str().to_uppercase());
        for (key, value) in data {
            event = event.with(key, *value);
        }
        self.bus.broadcast(event);

        Ok(())
    }
}

impl std::fmt::Debug for ExchangeStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeStateManager").finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn create_test_manager() -> (ExchangeStateManager, Arc<Store>, Arc<EventBus>, NamedTempFile)
    {
        let temp = NamedTempFile::new().unwrap();
        let store = Arc::new(Store::new(temp.path()).await.unwrap());
        let bus = Arc::new(EventBus::new());
        (
            ExchangeStateManager::new(store.clone(), bus.clone()),
            store,
            bus,
            temp,
        )
    }

    async fn running_exchange(manager: &ExchangeStateManager) -> String {
        let exchange = manager
            .create_exchange("chat-durable", "Hi", &HashMap::new())
            .await
            .unwrap();
        manager.start_exchange(&exchange.exchange_id).await.unwrap();
        exchange.exchange_id
    }

    #[tokio::test]
    async fn test_lifecycle_happy_path() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let id = running_exchange(&manager).await;

        let exchange = manager.require(&id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Running);
        assert!(exchange.started_at.is_some());

        manager.complete(&id, "final result").await.unwrap();
        let exchange = manager.require(&id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Completed);
        assert_eq!(exchange.context.as_deref(), Some("final result"));
        assert!(exchange.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_illegal_transitions_are_typed_errors() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let exchange = manager
            .create_exchange("chat-durable", "Hi", &HashMap::new())
            .await
            .unwrap();
        let id = exchange.exchange_id;

        // Pause before the exchange ever ran.
        let err = manager.pause(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        // Cancel of a PENDING exchange is not an allowed edge.
        let err = manager.cancel(&id).await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        // Complete of a terminal exchange is a no-op-with-error.
        manager.start_exchange(&id).await.unwrap();
        manager.complete(&id, "done").await.unwrap();
        let err = manager.complete(&id, "again").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));
        let err = manager.fail(&id, "late failure").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidState(_)));

        // Context was not clobbered by the refused transitions.
        let exchange = manager.require(&id).await.unwrap();
        assert_eq!(exchange.context.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_unknown_exchange_is_not_found() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let err = manager.pause("ghost").await.unwrap_err();
        assert!(matches!(err, EngineError::ExchangeNotFound(_)));
    }

    #[tokio::test]
    async fn test_pause_resume_cycle() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let id = running_exchange(&manager).await;

        manager.pause(&id).await.unwrap();
        assert!(!manager.should_continue(&id).await.unwrap());

        manager.resume(&id).await.unwrap();
        assert!(manager.should_continue(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_should_continue_during_approval_wait() {
        let (manager, store, _bus, _temp) = create_test_manager().await;
        let id = running_exchange(&manager).await;

        store
            .create_approval_waiting("ap-1", &id, "chat-durable", "Hi")
            .await
            .unwrap();

        assert!(manager.should_continue(&id).await.unwrap());
        manager.resume_after_approval(&id).await.unwrap();
        assert!(manager.should_continue(&id).await.unwrap());
    }

    #[tokio::test]
    async fn test_checkpoint_contract() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let id = running_exchange(&manager).await;

        assert!(manager
            .checkpoint(&id, 0, "validate-input", Some("Hi".into()))
            .await
            .unwrap());
        assert!(manager.checkpoint(&id, 1, "log-request", None).await.unwrap());

        // Duplicate name: false, current_step untouched.
        assert!(!manager
            .checkpoint(&id, 9, "validate-input", None)
            .await
            .unwrap());
        let exchange = manager.require(&id).await.unwrap();
        assert_eq!(exchange.current_step, 1);

        let found = manager.find_checkpoint(&id, "validate-input").await.unwrap();
        assert_eq!(found.unwrap().step_data.as_deref(), Some("Hi"));
        assert!(manager.find_checkpoint(&id, "call-llm").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transitions_publish_events_in_order() {
        let (manager, _store, bus, _temp) = create_test_manager().await;
        let mut rx = bus.register("observer");

        let id = running_exchange(&manager).await;
        manager.checkpoint(&id, 0, "validate-input", None).await.unwrap();
        manager.complete(&id, "done").await.unwrap();

        let types: Vec<EventType> = [
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
            rx.recv().await.unwrap(),
        ]
        .iter()
        .map(|e| e.event_type)
        .collect();

        assert_eq!(
            types,
            vec![
                EventType::ExchangeCreated,
                EventType::ExchangeStarted,
                EventType::ExchangeCheckpoint,
                EventType::ExchangeCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_fail_records_message() {
        let (manager, _store, _bus, _temp) = create_test_manager().await;
        let id = running_exchange(&manager).await;

        manager.fail(&id, "Approval rejected: no").await.unwrap();
        let exchange = manager.require(&id).await.unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Failed);
        assert_eq!(exchange.context.as_deref(), Some("Approval rejected: no"));
    }
}
