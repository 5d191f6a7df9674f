//! Mirrors terminal executions into durable storage.
//!
//! In-memory state is authoritative for the lifecycle; a failed save is
//! logged and never reopens the execution.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::DatabaseError;
use crate::store::traits::{ExecutionRow, ExecutionStore, TargetStats};

use super::record::ExecutionRecord;

impl ExecutionRow {
    /// Map a terminal snapshot to its persisted shape.
    pub fn from_record(record: &ExecutionRecord) -> Self {
        Self {
            execution_id: record.execution_id,
            category: record.category,
            target_id: record.target_id,
            user_id: record.user_id.clone(),
            status: record.status,
            progress: record.progress,
            current_step: record.current_step.clone(),
            submitted_at: record.submitted_at,
            started_at: record.started_at,
            completed_at: record.completed_at,
            duration_secs: record.elapsed().map(|d| d.as_secs() as i64),
            inputs: record.inputs.clone(),
            result: record.result.clone(),
            error: record.error.clone(),
            logs: record.logs.clone(),
            metadata: record.metadata.clone(),
        }
    }
}

/// Saves terminal snapshots and folds them into per-target statistics.
#[derive(Clone)]
pub struct PersistenceReconciler {
    store: Arc<dyn ExecutionStore>,
}

impl PersistenceReconciler {
    pub fn new(store: Arc<dyn ExecutionStore>) -> Self {
        Self { store }
    }

    /// Persist one terminal execution. Non-terminal snapshots are skipped.
    pub async fn save_terminal_state(
        &self,
        snapshot: &ExecutionRecord,
    ) -> Result<Option<TargetStats>, DatabaseError> {
        if !snapshot.is_terminal() {
            debug!(
                execution_id = %snapshot.execution_id,
                status = %snapshot.status,
                "Skipping persistence of non-terminal execution"
            );
            return Ok(None);
        }

        let row = ExecutionRow::from_record(snapshot);
        self.store.save_execution(&row).await?;
        let stats = self.store.record_target_outcome(&row).await?;
        debug!(
            execution_id = %row.execution_id,
            category = %row.category,
            target_id = row.target_id,
            execution_count = stats.execution_count,
            "Terminal state persisted"
        );
        Ok(Some(stats))
    }

    /// Fire-and-forget save off the scheduling loop.
    pub fn spawn_save(&self, snapshot: ExecutionRecord) -> tokio::task::JoinHandle<()> {
        let reconciler = self.clone();
        tokio::spawn(async move {
            if let Err(e) = reconciler.save_terminal_state(&snapshot).await {
                warn!(
                    execution_id = %snapshot.execution_id,
                    category = %snapshot.category,
                    error = %e,
                    "Failed to persist terminal execution state"
                );
            }
        })
    }
}
