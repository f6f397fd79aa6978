//! Crash recovery and periodic maintenance.
//!
//! On startup, abandoned RUNNING exchanges are re-submitted through the
//! engine's recovery path and approval signals are rebuilt from PENDING
//! rows. While running, three timers keep the system converging: approved
//! exchanges that lost their executor are resumed, stalled exchanges are
//! flagged for the operator, and forgotten approvals are auto-rejected.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::approval::ApprovalService;
use crate::engine::RouteEngine;
use crate::error::EngineResult;
use crate::events::{EventBus, EventType, RouteEvent};
use crate::state::ExchangeStateManager;
use crate::store::{now_ts, ExchangeStatus, Store};

/// How often approved-but-unowned exchanges are resumed.
const RESUME_INTERVAL: Duration = Duration::from_secs(30);

/// How often the stalled-exchange scan runs.
const STALLED_SCAN_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// How often the approval timeout scan runs.
const TIMEOUT_SCAN_INTERVAL: Duration = Duration::from_secs(10 * 60);

/// A RUNNING exchange without a checkpoint for this long is stalled.
const STALLED_THRESHOLD: Duration = Duration::from_secs(30 * 60);

/// A PENDING approval older than this is auto-rejected.
const APPROVAL_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Counters exposed at `/api/routes/recovery-stats`.
#[derive(Debug, Default)]
pub struct RecoveryStats {
    exchanges_recovered: AtomicU64,
    approvals_restored: AtomicU64,
    approved_resumes: AtomicU64,
    stalled_detected: AtomicU64,
    approvals_timed_out: AtomicU64,
}

/// Serializable view of [`RecoveryStats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecoveryStatsSnapshot {
    pub exchanges_recovered: u64,
    pub approvals_restored: u64,
    pub approved_resumes: u64,
    pub stalled_detected: u64,
    pub approvals_timed_out: u64,
}

impl RecoveryStats {
    fn snapshot(&self) -> RecoveryStatsSnapshot {
        RecoveryStatsSnapshot {
            exchanges_recovered: self.exchanges_recovered.load(Ordering::Relaxed),
            approvals_restored: self.approvals_restored.load(Ordering::Relaxed),
            approved_resumes: self.approved_resumes.load(Ordering::Relaxed),
            stalled_detected: self.stalled_detected.load(Ordering::Relaxed),
            approvals_timed_out: self.approvals_timed_out.load(Ordering::Relaxed),
        }
    }
}

/// Finds abandoned work and puts it back on the engine.
///
/// Cheap to clone; the timer tasks each hold their own handle.
#[derive(Clone)]
pub struct CrashRecoveryService {
    store: Arc<Store>,
    state: Arc<ExchangeStateManager>,
    approval: Arc<ApprovalService>,
    engine: Arc<RouteEngine>,
    bus: Arc<EventBus>,
    stats: Arc<RecoveryStats>,
}

impl CrashRecoveryService {
    pub fn new(
        store: Arc<Store>,
        state: Arc<ExchangeStateManager>,
        approval: Arc<ApprovalService>,
        engine: Arc<RouteEngine>,
        bus: Arc<EventBus>,
    ) -> Self {
        Self {
            store,
            state,
            approval,
            engine,
            bus,
            stats: Arc::new(RecoveryStats::default()),
        }
    }

    /// Startup recovery: re-submit every RUNNING exchange with the recovery
    /// marker, then rebuild approval signals from PENDING rows.
    pub async fn on_startup(&self) -> EngineResult<usize> {
        let running = self
            .store
            .list_exchanges_by_status(ExchangeStatus::Running)
            .await?;

        let recovered = running.len();
        for exchange in running {
            tracing::info!(
                exchange_id = %exchange.exchange_id,
                route_id = %exchange.route_id,
                current_step = exchange.current_step,
                "Recovering abandoned exchange"
            );
            self.bus.broadcast(
                RouteEvent::exchange(
                    EventType::ExchangeRecovering,
                    &exchange.route_id,
                    &exchange.exchange_id,
                )
                .with("currentStep", exchange.current_step.to_string()),
            );
            self.engine.submit(&exchange.exchange_id, true);
            self.stats.exchanges_recovered.fetch_add(1, Ordering::Relaxed);
        }

        let restored = self.approval.restore_pending_approvals().await?;
        self.stats
            .approvals_restored
            .fetch_add(restored as u64, Ordering::Relaxed);

        tracing::info!(recovered, restored, "Startup recovery complete");
        Ok(recovered)
    }

    /// Spawn the periodic maintenance timers.
    pub fn spawn_timers(&self) {
        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(RESUME_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = service.resume_approved().await {
                    tracing::error!(error = %e, "Approved-resume tick failed");
                }
            }
        });

        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STALLED_SCAN_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = service.stalled_scan().await {
                    tracing::error!(error = %e, "Stalled scan failed");
                }
            }
        });

        let service = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(TIMEOUT_SCAN_INTERVAL);
            interval.tick().await;
            loop {
                interval.tick().await;
                if let Err(e) = service.timeout_scan().await {
                    tracing::error!(error = %e, "Approval timeout scan failed");
                }
            }
        });
    }

    /// Resume WAITING_APPROVAL exchanges whose approval was granted but
    /// whose executor is gone (crash, or a non-blocking gate).
    pub async fn resume_approved(&self) -> EngineResult<usize> {
        let waiting = self.store.list_approved_waiting_exchanges().await?;
        let count = waiting.len();

        for exchange in waiting {
            tracing::info!(
                exchange_id = %exchange.exchange_id,
                "Resuming approved exchange without an executor"
            );
            self.state
                .resume_after_approval(&exchange.exchange_id)
                .await?;
            self.engine.submit(&exchange.exchange_id, true);
            self.stats.approved_resumes.fetch_add(1, Ordering::Relaxed);
        }

        Ok(count)
    }

    /// Flag RUNNING exchanges without recent checkpoints. No automatic
    /// transition; the operator decides.
    pub async fn stalled_scan(&self) -> EngineResult<usize> {
        let cutoff = now_ts() - STALLED_THRESHOLD.as_secs() as i64;
        let stalled = self.store.list_stalled_running(cutoff).await?;
        let count = stalled.len();

        for exchange in stalled {
            tracing::warn!(
                exchange_id = %exchange.exchange_id,
                route_id = %exchange.route_id,
                last_checkpoint = exchange.last_checkpoint,
                "Exchange appears stalled"
            );
            self.bus.broadcast(
                RouteEvent::exchange(
                    EventType::ExchangeStalled,
                    &exchange.route_id,
                    &exchange.exchange_id,
                )
                .with("lastCheckpoint", exchange.last_checkpoint.to_string()),
            );
            self.stats.stalled_detected.fetch_add(1, Ordering::Relaxed);
        }

        Ok(count)
    }

    /// Auto-reject PENDING approvals past the maximum age.
    pub async fn timeout_scan(&self) -> EngineResult<usize> {
        let cutoff = now_ts() - APPROVAL_MAX_AGE.as_secs() as i64;
        let expired = self.store.list_pending_approvals_older_than(cutoff).await?;
        let count = expired.len();

        for approval in expired {
            tracing::warn!(
                approval_id = %approval.id,
                exchange_id = %approval.exchange_id,
                "Auto-rejecting timed-out approval"
            );
            if let Err(e) = self
                .approval
                .reject(&approval.id, Some("Approval timed out".to_string()))
                .await
            {
                tracing::warn!(approval_id = %approval.id, error = %e, "Auto-reject failed");
                continue;
            }
            self.stats.approvals_timed_out.fetch_add(1, Ordering::Relaxed);
        }

        Ok(count)
    }

    /// Current counters.
    #[must_use]
    pub fn stats(&self) -> RecoveryStatsSnapshot {
        self.stats.snapshot()
    }
}

impl std::fmt::Debug for CrashRecoveryService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CrashRecoveryService")
            .field("stats", &self.stats)
            .finish()
    }
}
