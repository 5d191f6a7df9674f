//! `ExecutionStore` trait, the async interface for durable execution state.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::execution::record::{ExecutionCategory, ExecutionStatus, LogEntry};

/// A persisted terminal execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub execution_id: Uuid,
    pub category: ExecutionCategory,
    pub target_id: i64,
    pub user_id: Option<String>,
    pub status: ExecutionStatus,
    pub progress: f64,
    pub current_step: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Whole seconds between start and completion.
    pub duration_secs: Option<i64>,
    pub inputs: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Rolled-up outcome counters for one task, workflow, or agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetStats {
    pub category: ExecutionCategory,
    pub target_id: i64,
    pub execution_count: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub cancelled_count: i64,
    /// Mean duration of successful runs.
    pub average_execution_secs: Option<f64>,
    pub last_execution_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl TargetStats {
    pub fn new(category: ExecutionCategory, target_id: i64) -> Self {
        Self {
            category,
            target_id,
            execution_count: 0,
            success_count: 0,
            failure_count: 0,
            cancelled_count: 0,
            average_execution_secs: None,
            last_execution_at: None,
            last_error: None,
        }
    }

    /// Fold one terminal execution into the counters.
    pub fn apply(&mut self, row: &ExecutionRow) {
        self.execution_count += 1;
        self.last_execution_at = row.completed_at.or(self.last_execution_at);

        match row.status {
            ExecutionStatus::Completed => {
                self.success_count += 1;
                if let Some(duration) = row.duration_secs {
                    let n = self.success_count as f64;
                    let previous = self.average_execution_secs.unwrap_or(0.0);
                    self.average_execution_secs =
                        Some(previous + (duration as f64 - previous) / n);
                }
            }
            ExecutionStatus::Failed => {
                self.failure_count += 1;
                self.last_error = row.error.clone();
            }
            ExecutionStatus::Cancelled => self.cancelled_count += 1,
            _ => {}
        }
    }
}

/// Backend-agnostic persistence for terminal execution state.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    /// Insert or replace an execution row.
    async fn save_execution(&self, row: &ExecutionRow) -> Result<(), DatabaseError>;

    /// Get an execution by ID.
    async fn get_execution(&self, id: Uuid) -> Result<Option<ExecutionRow>, DatabaseError>;

    /// Most recently completed executions, optionally for one category.
    async fn list_executions(
        &self,
        category: Option<ExecutionCategory>,
        limit: usize,
    ) -> Result<Vec<ExecutionRow>, DatabaseError>;

    /// Fold a terminal execution into its target's statistics and return them.
    async fn record_target_outcome(&self, row: &ExecutionRow)
    -> Result<TargetStats, DatabaseError>;

    async fn get_target_stats(
        &self,
        category: ExecutionCategory,
        target_id: i64,
    ) -> Result<Option<TargetStats>, DatabaseError>;
}
