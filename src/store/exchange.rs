//! Exchange rows and the append-only checkpoint log.

use rusqlite::types::ToSql;
use rusqlite::{params, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use super::{now_ts, Store};
use anyhow::Result;

/// Exchange lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExchangeStatus {
    /// Created but not yet picked up by a worker.
    Pending,
    /// A worker is executing route steps.
    Running,
    /// Suspended by an operator; resumable.
    Paused,
    /// Suspended at an approval gate.
    WaitingApproval,
    /// All steps ran to completion.
    Completed,
    /// A step failed after redelivery, or an approval was rejected.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl ExchangeStatus {
    /// Database representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::WaitingApproval => "waiting_approval",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    /// Parse a database or query-string value, case-insensitively.
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "waiting_approval" => Ok(Self::WaitingApproval),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => anyhow::bail!("Invalid exchange status: {s}"),
        }
    }

    /// Whether no further transition is allowed from this status.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// One invocation of a route.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRecord {
    pub exchange_id: String,
    pub route_id: String,
    pub status: ExchangeStatus,
    pub current_step: i64,
    pub current_step_name: Option<String>,
    pub payload: String,
    /// JSON of the original non-internal headers; overwritten with the final
    /// result on COMPLETED and the failure message on FAILED.
    pub context: Option<String>,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub completed_at: Option<i64>,
    pub last_checkpoint: i64,
}

/// Durable record that a named step succeeded for an exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub id: i64,
    pub exchange_id: String,
    pub step_index: i64,
    pub step_name: String,
    pub step_data: Option<String>,
    pub created_at: i64,
}

const EXCHANGE_COLUMNS: &str = "exchange_id, route_id, status, current_step, current_step_name, \
     payload, context, created_at, started_at, completed_at, last_checkpoint";

pub(super) fn row_to_exchange(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExchangeRecord> {
    let status: String = row.get(2)?;
    Ok(ExchangeRecord {
        exchange_id: row.get(0)?,
        route_id: row.get(1)?,
        status: ExchangeStatus::parse(&status).unwrap_or(ExchangeStatus::Failed),
        current_step: row.get(3)?,
        current_step_name: row.get(4)?,
        payload: row.get(5)?,
        context: row.get(6)?,
        created_at: row.get(7)?,
        started_at: row.get(8)?,
        completed_at: row.get(9)?,
        last_checkpoint: row.get(10)?,
    })
}

fn row_to_checkpoint(row: &rusqlite::Row<'_>) -> rusqlite::Result<CheckpointRecord> {
    Ok(CheckpointRecord {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        step_index: row.get(2)?,
        step_name: row.get(3)?,
        step_data: row.get(4)?,
        created_at: row.get(5)?,
    })
}

impl Store {
    /// Insert a new PENDING exchange.
    pub async fn create_exchange(
        &self,
        exchange_id: &str,
        route_id: &str,
        payload: &str,
        context: Option<String>,
    ) -> Result<ExchangeRecord> {
        let exchange_id = exchange_id.to_string();
        let route_id = route_id.to_string();
        let payload = payload.to_string();

        self.exec("create_exchange", move |conn| {
            let now = now_ts();
            conn.execute(
                r"
                INSERT INTO exchanges
                    (exchange_id, route_id, status, payload, context, created_at, last_checkpoint)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
                ",
                params![
                    &exchange_id,
                    &route_id,
                    ExchangeStatus::Pending.as_str(),
                    &payload,
                    &context,
                    now
                ],
            )?;

            Ok(ExchangeRecord {
                exchange_id: exchange_id.clone(),
                route_id: route_id.clone(),
                status: ExchangeStatus::Pending,
                current_step: 0,
                current_step_name: None,
                payload: payload.clone(),
                context: context.clone(),
                created_at: now,
                started_at: None,
                completed_at: None,
                last_checkpoint: now,
            })
        })
        .await
    }

    /// Fetch an exchange by id.
    pub async fn get_exchange(&self, exchange_id: &str) -> Result<Option<ExchangeRecord>> {
        let exchange_id = exchange_id.to_string();
        self.exec("get_exchange", move |conn| {
            conn.query_row(
                &format!("SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE exchange_id = ?1"),
                params![&exchange_id],
                row_to_exchange,
            )
            .optional()
        })
        .await
    }

    /// List exchanges with optional status / route filters, newest first.
    pub async fn list_exchanges(
        &self,
        status: Option<ExchangeStatus>,
        route_id: Option<String>,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<ExchangeRecord>> {
        self.exec("list_exchanges", move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut args: Vec<Box<dyn ToSql + Send>> = Vec::new();

            if let Some(status) = status {
                clauses.push("status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(ref route_id) = route_id {
                clauses.push("route_id = ?");
                args.push(Box::new(route_id.clone()));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };
            args.push(Box::new(limit as i64));
            args.push(Box::new(offset as i64));

            let sql = format!(
                "SELECT {EXCHANGE_COLUMNS} FROM exchanges{where_clause} \
                 ORDER BY created_at DESC, exchange_id LIMIT ? OFFSET ?"
            );

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(rusqlite::params_from_iter(args.iter()), row_to_exchange)?;
            rows.collect()
        })
        .await
    }

    /// Count exchanges matching the optional filters.
    pub async fn count_exchanges(
        &self,
        status: Option<ExchangeStatus>,
        route_id: Option<String>,
    ) -> Result<usize> {
        self.exec("count_exchanges", move |conn| {
            let mut clauses: Vec<&str> = Vec::new();
            let mut args: Vec<Box<dyn ToSql + Send>> = Vec::new();

            if let Some(status) = status {
                clauses.push("status = ?");
                args.push(Box::new(status.as_str().to_string()));
            }
            if let Some(ref route_id) = route_id {
                clauses.push("route_id = ?");
                args.push(Box::new(route_id.clone()));
            }

            let where_clause = if clauses.is_empty() {
                String::new()
            } else {
                format!(" WHERE {}", clauses.join(" AND "))
            };

            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM exchanges{where_clause}"),
                rusqlite::params_from_iter(args.iter()),
                |row| row.get(0),
            )?;
            Ok(count as usize)
        })
        .await
    }

    /// List all exchanges with the given status, oldest first.
    pub async fn list_exchanges_by_status(
        &self,
        status: ExchangeStatus,
    ) -> Result<Vec<ExchangeRecord>> {
        self.exec("list_exchanges_by_status", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXCHANGE_COLUMNS} FROM exchanges WHERE status = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![status.as_str()], row_to_exchange)?;
            rows.collect()
        })
        .await
    }

    /// List RUNNING exchanges whose last checkpoint predates `cutoff`.
    pub async fn list_stalled_running(&self, cutoff: i64) -> Result<Vec<ExchangeRecord>> {
        self.exec("list_stalled_running", move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {EXCHANGE_COLUMNS} FROM exchanges \
                 WHERE status = 'running' AND last_checkpoint < ?1 ORDER BY last_checkpoint"
            ))?;
            let rows = stmt.query_map(params![cutoff], row_to_exchange)?;
            rows.collect()
        })
        .await
    }

    /// Conditionally move an exchange to `to` if its current status is one of
    /// `allowed_from`. Returns whether a row changed.
    ///
    /// Sets `started_at` on the first departure from PENDING, `completed_at`
    /// on entry to a terminal status, and overwrites `context` when one is
    /// supplied.
    pub async fn transition_exchange(
        &self,
        exchange_id: &str,
        to: ExchangeStatus,
        allowed_from: &[ExchangeStatus],
        context: Option<String>,
    ) -> Result<bool> {
        let exchange_id = exchange_id.to_string();
        let from_list = allowed_from
            .iter()
            .map(|s| format!("'{}'", s.as_str()))
            .collect::<Vec<_>>()
            .join(", ");

        self.exec("transition_exchange", move |conn| {
            let now = now_ts();
            let completed_at = to.is_terminal().then_some(now);
            let changed = conn.execute(
                &format!(
                    r"
                    UPDATE exchanges
                    SET status = ?1,
                        started_at = COALESCE(started_at, ?2),
                        completed_at = COALESCE(?3, completed_at),
                        context = COALESCE(?4, context)
                    WHERE exchange_id = ?5 AND status IN ({from_list})
                    "
                ),
                params![to.as_str(), now, completed_at, &context, &exchange_id],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    /// Insert a checkpoint row, idempotently on `(exchange_id, step_name)`.
    ///
    /// Returns `true` when a new row was created; in that case `current_step`,
    /// `current_step_name` and `last_checkpoint` are updated atomically in the
    /// same transaction. Returns `false` when the step was already
    /// checkpointed, leaving the exchange row untouched.
    pub async fn insert_checkpoint(
        &self,
        exchange_id: &str,
        step_index: i64,
        step_name: &str,
        step_data: Option<String>,
    ) -> Result<bool> {
        let exchange_id = exchange_id.to_string();
        let step_name = step_name.to_string();

        self.exec("insert_checkpoint", move |conn| {
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let now = now_ts();

            let inserted = tx.execute(
                r"
                INSERT OR IGNORE INTO exchange_checkpoints
                    (exchange_id, step_index, step_name, step_data, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![&exchange_id, step_index, &step_name, &step_data, now],
            )?;

            if inserted == 0 {
                tx.commit()?;
                return Ok(false);
            }

            tx.execute(
                r"
                UPDATE exchanges
                SET current_step = ?2, current_step_name = ?3, last_checkpoint = ?4
                WHERE exchange_id = ?1
                ",
                params![&exchange_id, step_index, &step_name, now],
            )?;

            tx.commit()?;
            Ok(true)
        })
        .await
    }

    /// Look up a checkpoint by step name.
    pub async fn get_checkpoint(
        &self,
        exchange_id: &str,
        step_name: &str,
    ) -> Result<Option<CheckpointRecord>> {
        let exchange_id = exchange_id.to_string();
        let step_name = step_name.to_string();

        self.exec("get_checkpoint", move |conn| {
            conn.query_row(
                r"
                SELECT id, exchange_id, step_index, step_name, step_data, created_at
                FROM exchange_checkpoints
                WHERE exchange_id = ?1 AND step_name = ?2
                ",
                params![&exchange_id, &step_name],
                row_to_checkpoint,
            )
            .optional()
        })
        .await
    }

    /// List all checkpoints for an exchange, ordered by step index.
    pub async fn list_checkpoints(&self, exchange_id: &str) -> Result<Vec<CheckpointRecord>> {
        let exchange_id = exchange_id.to_string();

        self.exec("list_checkpoints", move |conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, exchange_id, step_index, step_name, step_data, created_at
                FROM exchange_checkpoints
                WHERE exchange_id = ?1
                ORDER BY step_index
                ",
            )?;
            let rows = stmt.query_map(params![&exchange_id], row_to_checkpoint)?;
            rows.collect()
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    async fn create_test_store() -> (Store, NamedTempFile) {
        let temp = NamedTempFile::new().unwrap();
        let store = Store::new(temp.path()).await.unwrap();
        (store, temp)
    }

    #[tokio::test]
    async fn test_create_and_get_exchange() {
        let (store, _temp) = create_test_store().await;

        let created = store
            .create_exchange("ex-1", "chat-durable", "Hi", Some("{}".into()))
            .await
            .unwrap();
        assert_eq!(created.status, ExchangeStatus::Pending);
        assert_eq!(created.last_checkpoint, created.created_at);

        let fetched = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(fetched.route_id, "chat-durable");
        assert_eq!(fetched.payload, "Hi");
        assert!(fetched.started_at.is_none());
    }

    #[tokio::test]
    async fn test_get_missing_exchange() {
        let (store, _temp) = create_test_store().await;
        assert!(store.get_exchange("nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_transition_sets_timestamps() {
        let (store, _temp) = create_test_store().await;
        store
            .create_exchange("ex-1", "chat-durable", "Hi", None)
            .await
            .unwrap();

        let changed = store
            .transition_exchange(
                "ex-1",
                ExchangeStatus::Running,
                &[ExchangeStatus::Pending],
                None,
            )
            .await
            .unwrap();
        assert!(changed);

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Running);
        assert!(exchange.started_at.is_some());
        assert!(exchange.completed_at.is_none());

        store
            .transition_exchange(
                "ex-1",
                ExchangeStatus::Completed,
                &[ExchangeStatus::Running],
                Some("result".into()),
            )
            .await
            .unwrap();

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Completed);
        assert!(exchange.completed_at.is_some());
        assert_eq!(exchange.context.as_deref(), Some("result"));
    }

    #[tokio::test]
    async fn test_transition_refused_from_wrong_status() {
        let (store, _temp) = create_test_store().await;
        store
            .create_exchange("ex-1", "chat-durable", "Hi", None)
            .await
            .unwrap();

        let changed = store
            .transition_exchange(
                "ex-1",
                ExchangeStatus::Paused,
                &[ExchangeStatus::Running],
                None,
            )
            .await
            .unwrap();
        assert!(!changed);

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.status, ExchangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_checkpoint_idempotence() {
        let (store, _temp) = create_test_store().await;
        store
            .create_exchange("ex-1", "chat-durable", "Hi", None)
            .await
            .unwrap();

        let created = store
            .insert_checkpoint("ex-1", 0, "validate-input", Some("Hi".into()))
            .await
            .unwrap();
        assert!(created);

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.current_step, 0);
        assert_eq!(exchange.current_step_name.as_deref(), Some("validate-input"));

        store
            .insert_checkpoint("ex-1", 1, "log-request", None)
            .await
            .unwrap();

        // Duplicate step name: no new row, exchange row untouched.
        let created = store
            .insert_checkpoint("ex-1", 7, "validate-input", Some("other".into()))
            .await
            .unwrap();
        assert!(!created);

        let exchange = store.get_exchange("ex-1").await.unwrap().unwrap();
        assert_eq!(exchange.current_step, 1);
        assert_eq!(exchange.current_step_name.as_deref(), Some("log-request"));

        let checkpoints = store.list_checkpoints("ex-1").await.unwrap();
        assert_eq!(checkpoints.len(), 2);
        assert_eq!(checkpoints[0].step_name, "validate-input");
        assert_eq!(checkpoints[0].step_data.as_deref(), Some("Hi"));
        assert_eq!(checkpoints[1].step_name, "log-request");
    }

    #[tokio::test]
    async fn test_list_exchanges_filters_and_paging() {
        let (store, _temp) = create_test_store().await;
        for i in 0..5 {
            store
                .create_exchange(&format!("ex-{i}"), "chat-durable", "Hi", None)
                .await
                .unwrap();
        }
        store
            .create_exchange("ex-other", "chat-simple", "Hi", None)
            .await
            .unwrap();
        store
            .transition_exchange(
                "ex-0",
                ExchangeStatus::Running,
                &[ExchangeStatus::Pending],
                None,
            )
            .await
            .unwrap();

        let running = store
            .list_exchanges(Some(ExchangeStatus::Running), None, 100, 0)
            .await
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].exchange_id, "ex-0");

        let durable = store
            .list_exchanges(None, Some("chat-durable".into()), 100, 0)
            .await
            .unwrap();
        assert_eq!(durable.len(), 5);

        let total = store.count_exchanges(None, None).await.unwrap();
        assert_eq!(total, 6);

        let page = store.list_exchanges(None, None, 2, 0).await.unwrap();
        assert_eq!(page.len(), 2);
        let page2 = store.list_exchanges(None, None, 2, 4).await.unwrap();
        assert_eq!(page2.len(), 2);
    }

    #[tokio::test]
    async fn test_list_stalled_running() {
        let (store, _temp) = create_test_store().await;
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

        // Nothing stalled against a cutoff in the past.
        let stalled = store.list_stalled_running(now_ts() - 3600).await.unwrap();
        assert!(stalled.is_empty());

        // Everything running is stalled against a future cutoff.
        let stalled = store.list_stalled_running(now_ts() + 3600).await.unwrap();
        assert_eq!(stalled.len(), 1);
    }

    #[tokio::test]
    async fn test_status_parse_round_trip() {
        for status in [
            ExchangeStatus::Pending,
            ExchangeStatus::Running,
            ExchangeStatus::Paused,
            ExchangeStatus::WaitingApproval,
            ExchangeStatus::Completed,
            ExchangeStatus::Failed,
            ExchangeStatus::Cancelled,
        ] {
            assert_eq!(ExchangeStatus::parse(status.as_str()).unwrap(), status);
        }
        assert_eq!(
            ExchangeStatus::parse("COMPLETED").unwrap(),
            ExchangeStatus::Completed
        );
        assert!(ExchangeStatus::parse("bogus").is_err());
    }
}
