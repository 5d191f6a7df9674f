//! Domain lookup used to validate submissions before any state exists.

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::error::DatabaseError;

use super::record::ExecutionCategory;

/// What the scheduler needs to know about a task, workflow, or agent row.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetInfo {
    pub name: String,
    pub is_executable: bool,
    /// Why the target cannot run, when it cannot.
    pub reason: Option<String>,
    /// Extra context copied into the execution's metadata
    /// (`workflow_type`, `agent_role`, ...).
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl TargetInfo {
    pub fn executable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_executable: true,
            reason: None,
            metadata: serde_json::Map::new(),
        }
    }

    pub fn blocked(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_executable: false,
            reason: Some(reason.into()),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Read-only view over the task/workflow/agent tables.
#[async_trait]
pub trait TargetCatalog: Send + Sync {
    /// `Ok(None)` means the target does not exist.
    async fn get_target(
        &self,
        category: ExecutionCategory,
        target_id: i64,
    ) -> Result<Option<TargetInfo>, DatabaseError>;
}

/// Catalog backed by a map, for embedding and tests.
#[derive(Default)]
pub struct InMemoryCatalog {
    targets: RwLock<HashMap<(ExecutionCategory, i64), TargetInfo>>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, category: ExecutionCategory, target_id: i64, info: TargetInfo) {
        self.targets.write().await.insert((category, target_id), info);
    }
}

#[async_trait]
impl TargetCatalog for InMemoryCatalog {
    async fn get_target(
        &self,
        category: ExecutionCategory,
        target_id: i64,
    ) -> Result<Option<TargetInfo>, DatabaseError> {
        Ok(self.targets.read().await.get(&(category, target_id)).cloned())
    }
}
