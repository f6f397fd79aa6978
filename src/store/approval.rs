//! Approval request rows.
//!
//! At most one PENDING approval may exist per exchange at any time, enforced
//! by a partial unique index. Terminal statuses are immutable.

use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::exchange::{ExchangeRecord, ExchangeStatus};
use super::{now_ts, Store};
use anyhow::Result;

/// Approval request status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
}

impl ApprovalStatus {
    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Parse a database value.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => anyhow::bail!("Invalid approval status: {s}"),
        }
    }
}

/// One operator decision request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRecord {
    pub id: String,
    pub exchange_id: String,
    pub route_id: String,
    pub payload: String,
    pub status: ApprovalStatus,
    /// Approver response text, or rejection reason.
    pub response: Option<String>,
    pub created_at: i64,
    pub completed_at: Option<i64>,
}

/// Outcome of [`Store::create_approval_waiting`].
#[derive(Debug, Clone)]
pub enum CreateApprovalOutcome {
    /// Row inserted and exchange moved to WAITING_APPROVAL.
    Created(ApprovalRecord),
    /// The exchange was not RUNNING; nothing was written.
    ExchangeNotRunning,
    /// A PENDING approval already exists for the exchange.
    AlreadyPending,
}

/// Outcome of [`Store::complete_approval`].
#[derive(Debug, Clone)]
pub enum CompleteApprovalOutcome {
    /// Row moved to the terminal status.
    Completed(ApprovalRecord),
    /// No approval with the given id.
    NotFound,
    /// The approval was already decided.
    NotPending,
}

const APPROVAL_COLUMNS: &str =
    "id, exchange_id, route_id, payload, status, response, created_at, completed_at";

fn row_to_approval(row: &rusqlite::Row<'_>) -> rusqlite::Result<ApprovalRecord> {
    let status: String = row.get(4)?;
    Ok(ApprovalRecord {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        route_id: row.get(2)?,
        payload: row.get(3)?,
        status: ApprovalStatus::parse(&status).unwrap_or(ApprovalStatus::Rejected),
        response: row.get(5)?,
        created_at: row.get(6)?,
        completed_at: row.get(7)?,
    })
}

impl Store {
    /// In one transaction: insert a PENDING approval and move the exchange
    /// from RUNNING to WAITING_APPROVAL.
    pub async fn create_approval_waiting(
        &self,
        approval_id: &str,
        exchange_id: &str,
        route_id: &str,
        payload: &str,
    ) -> Result<CreateApprovalOutcome> {
        let approval_id = approval_id.to_string();
        let exchange_id = exchange_id.to_string();
        let route_id = route_id.to_string();
        let payload = payload.to_string();

        self.exec("create_approval_waiting", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();

            let pending: i64 = tx.query_row(
                "SELECT COUNT(*) FROM approval_requests WHERE exchange_id = ?1 AND status = 'pending'",
                params![&exchange_id],
                |row| row.get(0),
            )?;
            if pending > 0 {
                tx.commit()?;
                return Ok(CreateApprovalOutcome::AlreadyPending);
            }

            let moved = tx.execute(
                "UPDATE exchanges SET status = ?1 WHERE exchange_id = ?2 AND status = ?3",
                params![
                    ExchangeStatus::WaitingApproval.as_str(),
                    &exchange_id,
                    ExchangeStatus::Running.as_str()
                ],
            )?;
            if moved == 0 {
                tx.commit()?;
                return Ok(CreateApprovalOutcome::ExchangeNotRunning);
            }

            tx.execute(
                r"
                INSERT INTO approval_requests (id, exchange_id, route_id, payload, status, created_at)
                VALUES (?1, ?2, ?3, ?4, 'pending', ?5)
                ",
                params![&approval_id, &exchange_id, &route_id, &payload, now],
            )?;

            tx.commit()?;
            Ok(CreateApprovalOutcome::Created(ApprovalRecord {
                id: approval_id.clone(),
                exchange_id: exchange_id.clone(),
                route_id: route_id.clone(),
                payload: payload.clone(),
                status: ApprovalStatus::Pending,
                response: None,
                created_at: now,
                completed_at: None,
            }))
        })
        .await
    }

    /// Fetch an approval by id.
    pub async fn get_approval(&self, approval_id: &str) -> Result<Option<ApprovalRecord>> {
        let approval_id = approval_id.to_string();
        self.exec("get_approval", move |conn| {
            conn.query_row(
                &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"),
                params![&approval_id],
                row_to_approval,
            )
            .optional()
        })
        .await
    }

    /// List PENDING approvals, oldest first.
    pub async fn list_pending_approvals(&self) -> Result<Vec<ApprovalRecord>> {
        self.exec("list_pending_approvals", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
                 WHERE status = 'pending' ORDER BY created_at, id"
            ))?;
            let rows = stmt.query_map([], row_to_approval)?;
            rows.collect()
        })
        .await
    }

    /// List PENDING approvals created before `cutoff`.
    pub async fn list_pending_approvals_older_than(
        &self,
        cutoff: i64,
    ) -> Result<Vec<ApprovalRecord>> {
        self.exec("list_pending_approvals_older_than", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
                 WHERE status = 'pending' AND created_at < ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![cutoff], row_to_approval)?;
            rows.collect()
        })
        .await
    }

    /// List all approvals for an exchange, newest first.
    pub async fn list_approvals_by_exchange(
        &self,
        exchange_id: &str,
    ) -> Result<Vec<ApprovalRecord>> {
        let exchange_id = exchange_id.to_string();
        self.exec("list_approvals_by_exchange", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {APPROVAL_COLUMNS} FROM approval_requests \
                 WHERE exchange_id = ?1 ORDER BY created_at DESC, id DESC"
            ))?;
            let rows = stmt.query_map(params![&exchange_id], row_to_approval)?;
            rows.collect()
        })
        .await
    }

    /// Move a PENDING approval to a terminal status. Terminal rows are never
    /// mutated.
    pub async fn complete_approval(
        &self,
        approval_id: &str,
        to: ApprovalStatus,
        response: Option<String>,
    ) -> Result<CompleteApprovalOutcome> {
        let approval_id = approval_id.to_string();

        self.exec("complete_approval", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();

            let existing = tx
                .query_row(
                    &format!("SELECT {APPROVAL_COLUMNS} FROM approval_requests WHERE id = ?1"),
                    params![&approval_id],
                    row_to_approval,
                )
                .optional()?;

            let Some(existing) = existing else {
                tx.commit()?;
                return Ok(CompleteApprovalOutcome::NotFound);
            };
            if existing.status != ApprovalStatus::Pending {
                tx.commit()?;
                return Ok(CompleteApprovalOutcome::NotPending);
            }

            tx.execute(
                r"
                UPDATE approval_requests
                SET status = ?1, response = ?2, completed_at = ?3
                WHERE id = ?4
                ",
                params![to.as_str(), &response, now, &approval_id],
            )?;

            tx.commit()?;
            Ok(CompleteApprovalOutcome::Completed(ApprovalRecord {
                status: to,
                response: response.clone(),
                completed_at: Some(now),
                ..existing
            }))
        })
        .await
    }

    /// Exchanges sitting in WAITING_APPROVAL whose latest approval is
    /// APPROVED and which have no PENDING approval left. These lost their
    /// executor (crash, or a non-blocking gate) and need re-submission.
    pub async fn list_approved_waiting_exchanges(&self) -> Result<Vec<ExchangeRecord>> {
        self.exec("list_approved_waiting_exchanges", move |conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT e.exchange_id, e.route_id, e.status, e.current_step, e.current_step_name,
                       e.payload, e.context, e.created_at, e.started_at, e.completed_at,
                       e.last_checkpoint
                FROM exchanges e
                WHERE e.status = 'waiting_approval'
                  AND NOT EXISTS (
                      SELECT 1 FROM approval_requests a
                      WHERE a.exchange_id = e.exchange_id AND a.status = 'pending'
                  )
                  AND EXISTS (
                      SELECT 1 FROM approval_requests a
                      WHERE a.exchange_id = e.exchange_id AND a.status = 'approved'
                  )
                ORDER BY e.created_at
                ",
            )?;
            let rows = stmt.query_map([], super::exchange::row_to_exchange)?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn store_with_running_exchange() -> (Store, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::new(temp.path()).await.unwrap();
        store
            .create_exchange("ex-1", "chat-durable", "Hi", None)
            .await
            .unwrap();
        store
            .transition_exchange(
                "ex-1",
                ExchangeStatus::Running,
                &[ExchangeStatus::Pending],
                None,
            )
            .await
            .unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_create_approval_marks_exchange_waiting() {
        let (store, _temp) = store_with_running_exchange().await;

        let outcome = store
            .create_approval_waiting("ap-1", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();
        let approval = match outcome {
            CreateApprovalOutcome::Created(a) => a,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(approval.status, ApprovalStatus::Pending);

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.status, ExchangeStatus::WaitingApproval);
    }

    #[tokio::test]
    async fn test_create_approval_refused_when_not_running() {
        let (store, _temp) = store_with_running_exchange().await;
        store
            .transition_exchange(
                "ex-1",
                ExchangeStatus::Paused,
                &[ExchangeStatus::Running],
                None,
            )
            .await
            .unwrap();

        let outcome = store
            .create_approval_waiting("ap-1", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();
        assert!(matches!(outcome, CreateApprovalOutcome::ExchangeNotRunning));
    }

    #[tokio::test]
    async fn test_single_pending_approval_per_exchange() {
        let (store, _temp) = store_with_running_exchange().await;
        store
            .create_approval_waiting("ap-1", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();

        let outcome = store
            .create_approval_waiting("ap-2", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();
        assert!(matches!(outcome, CreateApprovalOutcome::AlreadyPending));
    }

    #[tokio::test]
    async fn test_complete_approval_and_immutability() {
        let (store, _temp) = store_with_running_exchange().await;
        store
            .create_approval_waiting("ap-1", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();

        let outcome = store
            .complete_approval("ap-1", ApprovalStatus::Approved, Some("ok".into()))
            .await
            .unwrap();
        let approval = match outcome {
            CompleteApprovalOutcome::Completed(a) => a,
            other => panic!("unexpected outcome: {other:?}"),
        };
        assert_eq!(approval.status, ApprovalStatus::Approved);
        assert!(approval.completed_at.is_some());

        // Second decision is refused.
        let outcome = store
            .complete_approval("ap-1", ApprovalStatus::Rejected, None)
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteApprovalOutcome::NotPending));

        let outcome = store
            .complete_approval("nope", ApprovalStatus::Approved, None)
            .await
            .unwrap();
        assert!(matches!(outcome, CompleteApprovalOutcome::NotFound));
    }

    #[tokio::test]
    async fn test_list_pending_oldest_first() {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::new(temp.path()).await.unwrap();
        for i in 0..3 {
            let id = format!("ex-{i}");
            store
                .create_exchange(&id, "chat-durable", "Hi", None)
                .await
                .unwrap();
            store
                .transition_exchange(&id, ExchangeStatus::Running, &[ExchangeStatus::Pending], None)
                .await
                .unwrap();
            store
                .create_approval_waiting(&format!("ap-{i}"), &id, "chat-durable", "Hi")
                .await
                .unwrap();
        }

        let pending = store.list_pending_approvals().await.unwrap();
        assert_eq!(pending.len(), 3);
        assert_eq!(pending[0].id, "ap-0");
    }

    #[tokio::test]
    async fn test_list_approved_waiting_exchanges() {
        let (store, _temp) = store_with_running_exchange().await;
        store
            .create_approval_waiting("ap-1", "ex-1", "chat-durable", "Hi")
            .await
            .unwrap();

        // Still pending: nothing to resume.
        let waiting = store.list_approved_waiting_exchanges().await.unwrap();
        assert!(waiting.is_empty());

        store
            .complete_approval("ap-1", ApprovalStatus::Approved, None)
            .await
            .unwrap();

        let waiting = store.list_approved_waiting_exchanges().await.unwrap();
        assert_eq!(waiting.len(), 1);
        assert_eq!(waiting[0].exchange_id, "ex-1");
    }
}
