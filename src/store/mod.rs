//! Relational persistence for exchanges, checkpoints, approvals, logs and
//! metrics.
//!
//! A single embedded sqlite database with write-ahead logging. All operations
//! run on the blocking thread pool via `tokio::task::spawn_blocking` and open
//! a short-lived connection, so no transaction is ever held across an await
//! point. Write paths tolerate a transient `SQLITE_BUSY` with bounded retry.

mod approval;
mod exchange;
mod observability;

pub use approval::{
    ApprovalRecord, ApprovalStatus, CompleteApprovalOutcome, CreateApprovalOutcome,
};
pub use exchange::{CheckpointRecord, ExchangeRecord, ExchangeStatus};
pub use observability::{RouteLogRecord, RouteMetricRecord};

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use rusqlite::Connection;
use tokio::task;

/// Maximum retries for a busy database.
const BUSY_RETRIES: u32 = 3;

/// Sleep between busy retries.
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

/// Embedded relational store.
///
/// # Thread Safety
///
/// All operations use `tokio::task::spawn_blocking` so database work runs on
/// a dedicated thread pool, making the store safe for concurrent async
/// access. sqlite serializes writers; the bounded busy retry absorbs the
/// resulting contention on hot write paths.
#[derive(Debug, Clone)]
pub struct Store {
    /// Path to the sqlite database file.
    db_path: PathBuf,
}

impl Store {
    /// Open (or create) the database and migrate the schema.
    pub async fn new<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let store = Self { db_path: path.into() };
        store.migrate_schema().await?;
        Ok(store)
    }

    /// Run a database operation with bounded retry on `SQLITE_BUSY`.
    pub(crate) async fn exec<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        F: Fn(&mut Connection) -> Result<T, rusqlite::Error> + Clone + Send + 'static,
        T: Send + 'static,
    {
        let mut attempt = 0;
        loop {
            let db_path = self.db_path.clone();
            let f = f.clone();
            let result = task::spawn_blocking(move || -> Result<T, rusqlite::Error> {
                let mut conn = Connection::open(&db_path)?;
                conn.busy_timeout(Duration::from_millis(250))?;
                f(&mut conn)
            })
            .await
            .context("Failed to spawn blocking task")?;

            match result {
                Ok(value) => return Ok(value),
                Err(e) if is_busy(&e) && attempt < BUSY_RETRIES => {
                    attempt += 1;
                    tracing::warn!(op, attempt, "Store busy, retrying");
                    tokio::time::sleep(BUSY_BACKOFF).await;
                }
                Err(e) if is_busy(&e) => {
                    return Err(anyhow::Error::new(e).context(format!("{op}: store busy")));
                }
                Err(e) => return Err(anyhow::Error::new(e).context(format!("{op} failed"))),
            }
        }
    }

    /// Create all tables and indexes.
    async fn migrate_schema(&self) -> Result<()> {
        self.exec("migrate_schema", |conn| {
            conn.pragma_update(None, "journal_mode", "WAL")?;

            conn.execute_batch(
                r"
                CREATE TABLE IF NOT EXISTS exchanges (
                    exchange_id TEXT PRIMARY KEY,
                    route_id TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    current_step INTEGER NOT NULL DEFAULT 0,
                    current_step_name TEXT,
                    payload TEXT NOT NULL,
                    context TEXT,
                    created_at INTEGER NOT NULL,
                    started_at INTEGER,
                    completed_at INTEGER,
                    last_checkpoint INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_exchanges_status ON exchanges(status);
                CREATE INDEX IF NOT EXISTS idx_exchanges_route ON exchanges(route_id);

                CREATE TABLE IF NOT EXISTS exchange_checkpoints (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    exchange_id TEXT NOT NULL,
                    step_index INTEGER NOT NULL,
                    step_name TEXT NOT NULL,
                    step_data TEXT,
                    created_at INTEGER NOT NULL,
                    UNIQUE(exchange_id, step_name)
                );
                CREATE INDEX IF NOT EXISTS idx_checkpoints_exchange
                    ON exchange_checkpoints(exchange_id);

                CREATE TABLE IF NOT EXISTS approval_requests (
                    id TEXT PRIMARY KEY,
                    exchange_id TEXT NOT NULL,
                    route_id TEXT NOT NULL,
                    payload TEXT NOT NULL,
                    status TEXT NOT NULL DEFAULT 'pending',
                    response TEXT,
                    created_at INTEGER NOT NULL,
                    completed_at INTEGER
                );
                CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_one_pending
                    ON approval_requests(exchange_id) WHERE status = 'pending';
                CREATE INDEX IF NOT EXISTS idx_approvals_status
                    ON approval_requests(status);

                CREATE TABLE IF NOT EXISTS route_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    exchange_id TEXT NOT NULL,
                    route_id TEXT NOT NULL,
                    step_name TEXT NOT NULL,
                    message TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE INDEX IF NOT EXISTS idx_route_logs_route ON route_logs(route_id);
                CREATE INDEX IF NOT EXISTS idx_route_logs_exchange ON route_logs(exchange_id);

                CREATE TABLE IF NOT EXISTS route_metrics (
                    route_id TEXT PRIMARY KEY,
                    total INTEGER NOT NULL DEFAULT 0,
                    success INTEGER NOT NULL DEFAULT 0,
                    failure INTEGER NOT NULL DEFAULT 0,
                    updated_at INTEGER NOT NULL
                );
                ",
            )?;

            Ok(())
        })
        .await
        .context("Schema migration failed")
    }
}

/// Whether an error is a transient busy/locked condition.
fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == rusqlite::ErrorCode::DatabaseBusy
                || e.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

/// Current time as Unix epoch seconds.
pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
