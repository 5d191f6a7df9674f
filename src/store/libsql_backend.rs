//! libSQL backend for the `ExecutionStore` trait.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::execution::record::ExecutionCategory;
use crate::store::migrations;
use crate::store::traits::{ExecutionRow, ExecutionStore, TargetStats};

/// Execution store on a local libSQL file or an in-memory database.
///
/// One connection serves every call; libSQL connections are safe to share
/// across tasks.
pub struct LibSqlStore {
    // Keeps the database alive for as long as the connection.
    _db: Arc<LibSqlDatabase>,
    conn: Connection,
    /// Serializes read-modify-write of `target_stats`.
    stats_lock: Mutex<()>,
}

impl LibSqlStore {
    /// Open `path`, creating parent directories and the schema as needed.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(dir) = path.parent().filter(|dir| !dir.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir).map_err(|e| {
                DatabaseError::Pool(format!("create {}: {e}", dir.display()))
            })?;
        }

        let db = libsql::Builder::new_local(path).build().await.map_err(|e| {
            DatabaseError::Pool(format!("open {}: {e}", path.display()))
        })?;
        let store = Self::connect(db).await?;
        info!(path = %path.display(), "Execution store opened");
        Ok(store)
    }

    /// Throwaway store, mainly for tests and demos.
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("open in-memory database: {e}")))?;
        Self::connect(db).await
    }

    async fn connect(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("connect: {e}")))?;
        let store = Self {
            _db: Arc::new(db),
            conn,
            stats_lock: Mutex::new(()),
        };
        store.run_migrations().await?;
        Ok(store)
    }
}

/// Timestamps are written as RFC 3339; SQLite's own `CURRENT_TIMESTAMP`
/// format is accepted too.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .or_else(|_| {
            chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S").map(|ts| ts.and_utc())
        })
        .map_err(|e| DatabaseError::Serialization(format!("timestamp {raw:?}: {e}")))
}

fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    raw.as_deref().map(parse_timestamp).transpose()
}

fn to_json<T: serde::Serialize>(value: &T, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str, what: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(raw).map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

const EXECUTION_COLUMNS: &str = "execution_id, category, target_id, user_id, status, progress, \
     current_step, submitted_at, started_at, completed_at, duration_secs, inputs, result, error, \
     logs, metadata";

/// Map a libsql Row to an ExecutionRow.
///
/// Column order matches EXECUTION_COLUMNS.
fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRow, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("read execution row: {e}"));

    let id_str: String = row.get(0).map_err(get_err)?;
    let category_str: String = row.get(1).map_err(get_err)?;
    let status_str: String = row.get(4).map_err(get_err)?;
    let submitted_str: String = row.get(7).map_err(get_err)?;
    let started_str: Option<String> = row.get::<String>(8).ok();
    let completed_str: Option<String> = row.get::<String>(9).ok();
    let inputs_str: String = row.get(11).map_err(get_err)?;
    let result_str: Option<String> = row.get::<String>(12).ok();
    let logs_str: String = row.get(14).map_err(get_err)?;
    let metadata_str: String = row.get(15).map_err(get_err)?;

    Ok(ExecutionRow {
        execution_id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("execution_id: {e}")))?,
        category: category_str.parse().map_err(DatabaseError::Serialization)?,
        target_id: row.get(2).map_err(get_err)?,
        user_id: row.get::<String>(3).ok(),
        status: status_str.parse().map_err(DatabaseError::Serialization)?,
        progress: row.get(5).map_err(get_err)?,
        current_step: row.get::<String>(6).ok(),
        submitted_at: parse_timestamp(&submitted_str)?,
        started_at: parse_optional_timestamp(started_str)?,
        completed_at: parse_optional_timestamp(completed_str)?,
        duration_secs: row.get::<i64>(10).ok(),
        inputs: from_json(&inputs_str, "inputs")?,
        result: result_str
            .map(|raw| from_json(&raw, "result"))
            .transpose()?,
        error: row.get::<String>(13).ok(),
        logs: from_json(&logs_str, "logs")?,
        metadata: from_json(&metadata_str, "metadata")?,
    })
}

/// Column order: category, target_id, execution_count, success_count,
/// failure_count, cancelled_count, average_execution_secs, last_execution_at,
/// last_error.
fn row_to_stats(row: &libsql::Row) -> Result<TargetStats, DatabaseError> {
    let get_err = |e: libsql::Error| DatabaseError::Query(format!("read target_stats row: {e}"));
    let category_str: String = row.get(0).map_err(get_err)?;
    let last_execution: Option<String> = row.get::<String>(7).ok();

    Ok(TargetStats {
        category: category_str.parse().map_err(DatabaseError::Serialization)?,
        target_id: row.get(1).map_err(get_err)?,
        execution_count: row.get(2).map_err(get_err)?,
        success_count: row.get(3).map_err(get_err)?,
        failure_count: row.get(4).map_err(get_err)?,
        cancelled_count: row.get(5).map_err(get_err)?,
        average_execution_secs: row.get::<f64>(6).ok(),
        last_execution_at: parse_optional_timestamp(last_execution)?,
        last_error: row.get::<String>(8).ok(),
    })
}

#[async_trait]
impl ExecutionStore for LibSqlStore {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(&self.conn).await
    }

    async fn save_execution(&self, row: &ExecutionRow) -> Result<(), DatabaseError> {
        let result_json = row
            .result
            .as_ref()
            .map(|r| to_json(r, "result"))
            .transpose()?;

        self.conn
            .execute(
                &format!(
                    "INSERT OR REPLACE INTO executions ({EXECUTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)"
                ),
                params![
                    row.execution_id.to_string(),
                    row.category.as_str(),
                    row.target_id,
                    row.user_id.clone(),
                    row.status.as_str(),
                    row.progress,
                    row.current_step.clone(),
                    row.submitted_at.to_rfc3339(),
                    row.started_at.map(|t| t.to_rfc3339()),
                    row.completed_at.map(|t| t.to_rfc3339()),
                    row.duration_secs,
                    to_json(&row.inputs, "inputs")?,
                    result_json,
                    row.error.clone(),
                    to_json(&row.logs, "logs")?,
                    to_json(&row.metadata, "metadata")?
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("save_execution: {e}")))?;

        debug!(execution_id = %row.execution_id, status = %row.status, "Execution saved");
        Ok(())
    }

    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM executions WHERE execution_id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?
        {
            Some(row) => Ok(Some(row_to_execution(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_executions(
        &self,
        category: Option<ExecutionCategory>,
        limit: usize,
    ) -> Result<Vec<ExecutionRow>, DatabaseError> {
        let limit = limit as i64;
        let mut rows = match category {
            Some(category) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {EXECUTION_COLUMNS} FROM executions WHERE category = ?1 \
                             ORDER BY completed_at DESC LIMIT ?2"
                        ),
                        params![category.as_str(), limit],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {EXECUTION_COLUMNS} FROM executions \
                             ORDER BY completed_at DESC LIMIT ?1"
                        ),
                        params![limit],
                    )
                    .await
            }
        }
        .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?;

        let mut executions = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?
        {
            executions.push(row_to_execution(&row)?);
        }
        Ok(executions)
    }

    async fn record_target_outcome(
        &self,
        row: &ExecutionRow,
    ) -> Result<TargetStats, DatabaseError> {
        let _guard = self.stats_lock.lock().await;

        let mut stats = self
            .get_target_stats(row.category, row.target_id)
            .await?
            .unwrap_or_else(|| TargetStats::new(row.category, row.target_id));
        stats.apply(row);

        self.conn
            .execute(
                "INSERT OR REPLACE INTO target_stats (category, target_id, execution_count, \
                 success_count, failure_count, cancelled_count, average_execution_secs, \
                 last_execution_at, last_error) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    stats.category.as_str(),
                    stats.target_id,
                    stats.execution_count,
                    stats.success_count,
                    stats.failure_count,
                    stats.cancelled_count,
                    stats.average_execution_secs,
                    stats.last_execution_at.map(|t| t.to_rfc3339()),
                    stats.last_error.clone()
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("record_target_outcome: {e}")))?;

        Ok(stats)
    }

    async fn get_target_stats(
        &self,
        category: ExecutionCategory,
        target_id: i64,
    ) -> Result<Option<TargetStats>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT category, target_id, execution_count, success_count, failure_count, \
                 cancelled_count, average_execution_secs, last_execution_at, last_error \
                 FROM target_stats WHERE category = ?1 AND target_id = ?2",
                params![category.as_str(), target_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target_stats: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("get_target_stats: {e}")))?
        {
            Some(row) => Ok(Some(row_to_stats(&row)?)),
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::execution::record::{ExecutionStatus, LogEntry};

    async fn test_db() -> LibSqlStore {
        LibSqlStore::new_memory().await.unwrap()
    }

    fn make_row(category: ExecutionCategory, target_id: i64, status: ExecutionStatus) -> ExecutionRow {
        let now = Utc::now();
        ExecutionRow {
            execution_id: Uuid::new_v4(),
            category,
            target_id,
            user_id: Some("user-1".to_string()),
            status,
            progress: 100.0,
            current_step: Some("Step 10/10".to_string()),
            submitted_at: now,
            started_at: Some(now),
            completed_at: Some(now),
            duration_secs: Some(3),
            inputs: json!({"topic": "markets"}),
            result: (status == ExecutionStatus::Completed).then(|| json!({"summary": "ok"})),
            error: (status == ExecutionStatus::Failed).then(|| "rate limited".to_string()),
            logs: vec![LogEntry {
                timestamp: now,
                message: "Execution started".to_string(),
            }],
            metadata: json!({"target_name": "research"})
                .as_object()
                .cloned()
                .unwrap_or_default(),
        }
    }

    #[tokio::test]
    async fn save_and_get_execution() {
        let db = test_db().await;
        let row = make_row(ExecutionCategory::Task, 1, ExecutionStatus::Completed);
        db.save_execution(&row).await.unwrap();

        let fetched = db.get_execution(row.execution_id).await.unwrap().unwrap();
        assert_eq!(fetched.execution_id, row.execution_id);
        assert_eq!(fetched.status, ExecutionStatus::Completed);
        assert_eq!(fetched.result, Some(json!({"summary": "ok"})));
        assert_eq!(fetched.logs.len(), 1);
        assert_eq!(fetched.metadata["target_name"], "research");
        assert_eq!(fetched.user_id.as_deref(), Some("user-1"));
    }

    #[tokio::test]
    async fn get_execution_not_found() {
        let db = test_db().await;
        assert!(db.get_execution(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn save_is_idempotent() {
        let db = test_db().await;
        let row = make_row(ExecutionCategory::Workflow, 2, ExecutionStatus::Failed);
        db.save_execution(&row).await.unwrap();
        db.save_execution(&row).await.unwrap();

        let all = db.list_executions(None, 10).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].error.as_deref(), Some("rate limited"));
        assert!(all[0].result.is_none());
    }

    #[tokio::test]
    async fn list_filters_by_category() {
        let db = test_db().await;
        db.save_execution(&make_row(ExecutionCategory::Task, 1, ExecutionStatus::Completed))
            .await
            .unwrap();
        db.save_execution(&make_row(ExecutionCategory::Agent, 5, ExecutionStatus::Cancelled))
            .await
            .unwrap();

        let agents = db
            .list_executions(Some(ExecutionCategory::Agent), 10)
            .await
            .unwrap();
        assert_eq!(agents.len(), 1);
        assert_eq!(agents[0].status, ExecutionStatus::Cancelled);
    }

    #[tokio::test]
    async fn target_stats_accumulate() {
        let db = test_db().await;
        assert!(
            db.get_target_stats(ExecutionCategory::Workflow, 3)
                .await
                .unwrap()
                .is_none()
        );

        db.record_target_outcome(&make_row(ExecutionCategory::Workflow, 3, ExecutionStatus::Completed))
            .await
            .unwrap();
        db.record_target_outcome(&make_row(ExecutionCategory::Workflow, 3, ExecutionStatus::Failed))
            .await
            .unwrap();

        let stats = db
            .get_target_stats(ExecutionCategory::Workflow, 3)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stats.execution_count, 2);
        assert_eq!(stats.success_count, 1);
        assert_eq!(stats.failure_count, 1);
        assert_eq!(stats.average_execution_secs, Some(3.0));
        assert_eq!(stats.last_error.as_deref(), Some("rate limited"));
        assert!(stats.last_execution_at.is_some());
    }

    #[tokio::test]
    async fn local_file_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("executions.db");
        let row = make_row(ExecutionCategory::Task, 8, ExecutionStatus::Completed);

        {
            let db = LibSqlStore::new_local(&path).await.unwrap();
            db.save_execution(&row).await.unwrap();
        }

        let reopened = LibSqlStore::new_local(&path).await.unwrap();
        let fetched = reopened.get_execution(row.execution_id).await.unwrap();
        assert!(fetched.is_some());
    }
}
