//! Error types for the execution scheduler.

use crate::execution::record::ExecutionCategory;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Errors raised synchronously by scheduler operations.
///
/// Failures inside a unit of work never surface here; they are recorded on
/// the execution record as data.
#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    #[error("{category} target {target_id} not found")]
    TargetNotFound {
        category: ExecutionCategory,
        target_id: i64,
    },

    #[error("{category} target {target_id} is not executable: {reason}")]
    TargetNotExecutable {
        category: ExecutionCategory,
        target_id: i64,
        reason: String,
    },

    #[error("No work unit registered for category {category}")]
    CategoryNotConfigured { category: ExecutionCategory },

    #[error("Target lookup failed: {0}")]
    Lookup(String),

    #[error("Scheduler is shut down")]
    SchedulerClosed,
}

/// Error returned by a unit of work.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkError {
    #[error("{0}")]
    Failed(String),

    /// The work observed its cancellation token and stopped early.
    #[error("cancelled")]
    Cancelled,
}

impl WorkError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
