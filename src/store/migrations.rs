//! Versioned schema for the execution store.
//!
//! Applied steps are tracked in `schema_versions`. Each pending step runs in
//! its own transaction together with its version row, so a failed step leaves
//! the schema at the previous version.

use libsql::Connection;
use tracing::{debug, info};

use crate::error::DatabaseError;

struct SchemaStep {
    version: i64,
    label: &'static str,
    ddl: &'static str,
}

/// Ordered by version. Append only.
const SCHEMA: &[SchemaStep] = &[
    SchemaStep {
        version: 1,
        label: "executions",
        ddl: "
            CREATE TABLE IF NOT EXISTS executions (
                execution_id TEXT PRIMARY KEY,
                category TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                user_id TEXT,
                status TEXT NOT NULL,
                progress REAL NOT NULL DEFAULT 0,
                current_step TEXT,
                submitted_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                duration_secs INTEGER,
                inputs TEXT NOT NULL DEFAULT 'null',
                result TEXT,
                error TEXT,
                logs TEXT NOT NULL DEFAULT '[]',
                metadata TEXT NOT NULL DEFAULT '{}'
            );
            CREATE INDEX IF NOT EXISTS idx_executions_target ON executions(category, target_id);
            CREATE INDEX IF NOT EXISTS idx_executions_status ON executions(status);
            CREATE INDEX IF NOT EXISTS idx_executions_completed ON executions(completed_at);
        ",
    },
    SchemaStep {
        version: 2,
        label: "target_stats",
        ddl: "
            CREATE TABLE IF NOT EXISTS target_stats (
                category TEXT NOT NULL,
                target_id INTEGER NOT NULL,
                execution_count INTEGER NOT NULL DEFAULT 0,
                success_count INTEGER NOT NULL DEFAULT 0,
                failure_count INTEGER NOT NULL DEFAULT 0,
                cancelled_count INTEGER NOT NULL DEFAULT 0,
                average_execution_secs REAL,
                last_execution_at TEXT,
                last_error TEXT,
                PRIMARY KEY (category, target_id)
            );
        ",
    },
];

/// Bring the schema up to the latest version.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            version INTEGER PRIMARY KEY,
            label TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("create schema_versions: {e}")))?;

    let applied = schema_version(conn).await?;
    for step in SCHEMA.iter().filter(|step| step.version > applied) {
        info!(version = step.version, label = step.label, "Upgrading execution store schema");
        let batch = format!(
            "BEGIN;\n{}\nINSERT INTO schema_versions (version, label) VALUES ({}, '{}');\nCOMMIT;",
            step.ddl, step.version, step.label
        );
        if let Err(e) = conn.execute_batch(&batch).await {
            // Leave the connection usable for the caller.
            let _ = conn.execute("ROLLBACK", ()).await;
            return Err(DatabaseError::Migration(format!(
                "schema step {} ({}): {e}",
                step.version, step.label
            )));
        }
    }

    let version = schema_version(conn).await?;
    debug!(version, "Execution store schema ready");
    Ok(())
}

/// Highest applied schema version (0 for a fresh database).
async fn schema_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT IFNULL(MAX(version), 0) FROM schema_versions", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?;

    let Some(row) = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("read schema version: {e}")))?
    else {
        return Ok(0);
    };
    row.get::<i64>(0)
        .map_err(|e| DatabaseError::Migration(format!("decode schema version: {e}")))
}
