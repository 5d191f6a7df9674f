//! Persistence layer: libSQL-backed storage for terminal executions and
//! per-target statistics.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlStore;
pub use traits::{ExecutionRow, ExecutionStore, TargetStats};
