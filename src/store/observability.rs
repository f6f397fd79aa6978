//! Append-only route audit log and per-route counters.

use rusqlite::params;
use serde::{Deserialize, Serialize};

use super::{now_ts, Store};
use anyhow::Result;

/// One audit log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteLogRecord {
    pub id: i64,
    pub exchange_id: String,
    pub route_id: String,
    pub step_name: String,
    pub message: String,
    pub created_at: i64,
}

/// Per-route totals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteMetricRecord {
    pub route_id: String,
    pub total: i64,
    pub success: i64,
    pub failure: i64,
    pub updated_at: i64,
}

fn row_to_log(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouteLogRecord> {
    Ok(RouteLogRecord {
        id: row.get(0)?,
        exchange_id: row.get(1)?,
        route_id: row.get(2)?,
        step_name: row.get(3)?,
        message: row.get(4)?,
        created_at: row.get(5)?,
    })
}

fn row_to_metric(row: &rusqlite::Row<'_>) -> rusqlite::Result<RouteMetricRecord> {
    Ok(RouteMetricRecord {
        route_id: row.get(0)?,
        total: row.get(1)?,
        success: row.get(2)?,
        failure: row.get(3)?,
        updated_at: row.get(4)?,
    })
}

/// Which counter to bump.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MetricField {
    Total,
    Success,
    Failure,
}

impl MetricField {
    fn column(self) -> &'static str {
        match self {
            Self::Total => "total",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl Store {
    /// Append one audit line.
    pub async fn append_route_log(
        &self,
        exchange_id: &str,
        route_id: &str,
        step_name: &str,
        message: &str,
    ) -> Result<()> {
        let exchange_id = exchange_id.to_string();
        let route_id = route_id.to_string();
        let step_name = step_name.to_string();
        let message = message.to_string();

        self.exec("append_route_log", move |conn| {
            conn.execute(
                r"
                INSERT INTO route_logs (exchange_id, route_id, step_name, message, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ",
                params![&exchange_id, &route_id, &step_name, &message, now_ts()],
            )?;
            Ok(())
        })
        .await
    }

    /// Audit lines for one route, newest first.
    pub async fn list_logs_for_route(
        &self,
        route_id: &str,
        limit: usize,
    ) -> Result<Vec<RouteLogRecord>> {
        let route_id = route_id.to_string();
        self.exec("list_logs_for_route", move |conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, exchange_id, route_id, step_name, message, created_at
                FROM route_logs WHERE route_id = ?1
                ORDER BY id DESC LIMIT ?2
                ",
            )?;
            let rows = stmt.query_map(params![&route_id, limit as i64], row_to_log)?;
            rows.collect()
        })
        .await
    }

    /// Audit lines for one exchange, in emission order.
    pub async fn list_logs_for_exchange(&self, exchange_id: &str) -> Result<Vec<RouteLogRecord>> {
        let exchange_id = exchange_id.to_string();
        self.exec("list_logs_for_exchange", move |conn| {
            let mut stmt = conn.prepare(
                r"
                SELECT id, exchange_id, route_id, step_name, message, created_at
                FROM route_logs WHERE exchange_id = ?1
                ORDER BY id
                ",
            )?;
            let rows = stmt.query_map(params![&exchange_id], row_to_log)?;
            rows.collect()
        })
        .await
    }

    pub(crate) async fn bump_metric(&self, route_id: &str, field: MetricField) -> Result<()> {
        let route_id = route_id.to_string();
        self.exec("bump_metric", move |conn| {
            let column = field.column();
            conn.execute(
                &format!(
                    r"
                    INSERT INTO route_metrics (route_id, {column}, updated_at)
                    VALUES (?1, 1, ?2)
                    ON CONFLICT(route_id) DO UPDATE SET
                        {column} = {column} + 1,
                        updated_at = excluded.updated_at
                    "
                ),
                params![&route_id, now_ts()],
            )?;
            Ok(())
        })
        .await
    }

    /// Record a new submission for a route.
    pub async fn record_exchange_total(&self, route_id: &str) -> Result<()> {
        self.bump_metric(route_id, MetricField::Total).await
    }

    /// Record a successful completion for a route.
    pub async fn record_exchange_success(&self, route_id: &str) -> Result<()> {
        self.bump_metric(route_id, MetricField::Success).await
    }

    /// Record a failure for a route.
    pub async fn record_exchange_failure(&self, route_id: &str) -> Result<()> {
        self.bump_metric(route_id, MetricField::Failure).await
    }

    /// Counters for one route, if any exchange ever ran on it.
    pub async fn get_metric(&self, route_id: &str) -> Result<Option<RouteMetricRecord>> {
        use rusqlite::OptionalExtension;

        let route_id = route_id.to_string();
        self.exec("get_metric", move |conn| {
            conn.query_row(
                "SELECT route_id, total, success, failure, updated_at \
                 FROM route_metrics WHERE route_id = ?1",
                params![&route_id],
                row_to_metric,
            )
            .optional()
        })
        .await
    }

    /// Counters for all routes.
    pub async fn list_metrics(&self) -> Result<Vec<RouteMetricRecord>> {
        self.exec("list_metrics", move |conn| {
            let mut stmt = conn.prepare(
                "SELECT route_id, total, success, failure, updated_at \
                 FROM route_metrics ORDER BY route_id",
            )?;
            let rows = stmt.query_map([], row_to_metric)?;
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
    async fn test_route_logs() {
        let (store, _temp) = create_test_store().await;

        store
            .append_route_log("ex-1", "chat-durable", "log-request", "received 2 chars")
            .await
            .unwrap();
        store
            .append_route_log("ex-1", "chat-durable", "call-llm", "response 40 chars")
            .await
            .unwrap();
        store
            .append_route_log("ex-2", "chat-simple", "log-request", "received 5 chars")
            .await
            .unwrap();

        let by_exchange = store.list_logs_for_exchange("ex-1").await.unwrap();
        assert_eq!(by_exchange.len(), 2);
        assert_eq!(by_exchange[0].step_name, "log-request");

        let by_route = store.list_logs_for_route("chat-durable", 100).await.unwrap();
        assert_eq!(by_route.len(), 2);
        // Newest first for the route view.
        assert_eq!(by_route[0].step_name, "call-llm");
    }

    #[tokio::test]
    async fn test_metrics_upsert() {
        let (store, _temp) = create_test_store().await;

        store.record_exchange_total("chat-durable").await.unwrap();
        store.record_exchange_total("chat-durable").await.unwrap();
        store.record_exchange_success("chat-durable").await.unwrap();
        store.record_exchange_failure("chat-durable").await.unwrap();

        let metric = store.get_metric("chat-durable").await.unwrap().unwrap();
        assert_eq!(metric.total, 2);
        assert_eq!(metric.success, 1);
        assert_eq!(metric.failure, 1);

        assert!(store.get_metric("unknown").await.unwrap().is_none());

        store.record_exchange_total("chat-simple").await.unwrap();
        let all = store.list_metrics().await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
