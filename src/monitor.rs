//! Monitoring interception: every public database call books a record in an
//! in-memory table before delegating and completes it afterwards.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::json;

use crate::config::{MonitorConfig, TableConfig, TableKind};
use crate::error::Result;
use crate::query::{DeleteQuery, Filter, InsertQuery, UpdateQuery};
use crate::scheduler::{BackgroundTask, Context};
use crate::table::{MemoryTable, Table};

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Owns the monitoring table and the record lifecycle.
pub struct Monitor {
    table: Arc<MemoryTable>,
    config: MonitorConfig,
    next_id: AtomicI64,
    sweeping: AtomicBool,
}

impl Monitor {
    pub fn new(config: MonitorConfig) -> Self {
        let table = Arc::new(MemoryTable::new(
            &config.table,
            TableConfig::new(TableKind::Memory),
        ));
        Self {
            table,
            config,
            next_id: AtomicI64::new(1),
            sweeping: AtomicBool::new(false),
        }
    }

    pub fn table(&self) -> Arc<MemoryTable> {
        self.table.clone()
    }

    pub fn table_name(&self) -> &str {
        &self.config.table
    }

    /// Book the pre-execution record. Returns its id for completion.
    pub async fn begin(&self, method: &str, query: &str) -> Result<i64> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let query: String = query.chars().take(self.config.max_query_length).collect();
        self.table
            .insert(InsertQuery::rows([json!({
                "id": id,
                "method": method,
                "query": query,
                "error": "",
                "time_begin": now_millis(),
                "time_end": 0,
            })]))
            .await?;
        Ok(id)
    }

    /// Complete the record with the end time and any error message.
    pub async fn end(&self, id: i64, error: Option<String>) {
        let message = error.unwrap_or_default();
        let now = now_millis();
        let result = self
            .table
            .update(UpdateQuery::new(Filter::ids([id]), move |row| {
                let begin = row["time_begin"].as_i64().unwrap_or(0);
                row["time_end"] = json!(now.max(begin + 1));
                row["error"] = json!(message.clone());
            }))
            .await;
        if let Err(e) = result {
            tracing::warn!(record = id, error = %e, "failed to complete monitoring record");
        }
    }

    /// Delete completed records older than the retention window. At most one
    /// sweep runs at a time.
    pub async fn sweep(&self) -> Result<u64> {
        if self.sweeping.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        let cutoff = now_millis() - self.config.interval_minutes as i64 * 60_000;
        let result = self
            .table
            .delete(DeleteQuery::filter(Filter::wher(move |row| {
                let end = row["time_end"].as_i64().unwrap_or(0);
                end != 0 && end < cutoff
            })))
            .await;
        self.sweeping.store(false, Ordering::SeqCst);
        let deleted = result?;
        if deleted > 0 {
            tracing::debug!(deleted, "monitoring records swept");
        }
        Ok(deleted)
    }
}

/// Periodic sweeper registered on the database scheduler.
pub struct SweepTask {
    pub monitor: Arc<Monitor>,
}

#[async_trait::async_trait]
impl BackgroundTask for SweepTask {
    fn name(&self) -> &'static str {
        "monitor-sweep"
    }

    fn interval(&self) -> Duration {
        Duration::from_secs(60)
    }

    async fn execute(&self, _ctx: Context) -> Result<()> {
        self.monitor.sweep().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::SelectQuery;

    #[tokio::test]
    async fn test_record_lifecycle() -> Result<()> {
        let monitor = Monitor::new(MonitorConfig::enabled().max_query_length(10));

        let id = monitor.begin("select", "select where=@@all() limit=100").await?;
        monitor.end(id, None).await;

        let id2 = monitor.begin("insert", "insert rows=3").await?;
        monitor.end(id2, Some("table not found: nope".to_string())).await;

        let rows = monitor.table().select(SelectQuery::all()).await?;
        assert_eq!(rows.len(), 2);
        for row in &rows {
            // Captured query text is truncated to the configured length.
            assert!(row["query"].as_str().unwrap().chars().count() <= 10);
            assert!(row["time_end"].as_i64().unwrap() > row["time_begin"].as_i64().unwrap());
        }
        assert_eq!(rows[0]["error"], json!(""));
        assert_eq!(rows[1]["error"], json!("table not found: nope"));
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_deletes_old_completed_records() -> Result<()> {
        let monitor = Monitor::new(MonitorConfig::enabled().interval_minutes(15));

        // One stale completed record, one fresh, one still in flight.
        let stale = monitor.begin("select", "old").await?;
        monitor.end(stale, None).await;
        monitor
            .table()
            .update(UpdateQuery::new(Filter::ids([stale]), |row| {
                row["time_end"] = json!(1);
            }))
            .await?;
        let fresh = monitor.begin("select", "new").await?;
        monitor.end(fresh, None).await;
        monitor.begin("select", "running").await?;

        assert_eq!(monitor.sweep().await?, 1);
        assert_eq!(monitor.table().row_count().await?, 2);
        Ok(())
    }
}
