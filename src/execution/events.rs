//! Execution lifecycle events, broadcast to any interested subscriber
//! (webhook dispatchers, websocket fan-out, the demo binary).

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::record::{ExecutionCategory, ExecutionRecord, ExecutionStatus};

/// Maximum length of a result summary carried by [`ExecutionEvent::Completed`].
const SUMMARY_LEN: usize = 200;

/// Why running work was asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    Requested,
    Timeout,
    Shutdown,
}

/// A state change or liveness update of one execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExecutionEvent {
    /// Capacity was exhausted; the execution is waiting.
    Queued {
        execution_id: Uuid,
        category: ExecutionCategory,
        depth: usize,
    },
    /// Admitted and handed to the worker pool.
    Started {
        execution_id: Uuid,
        category: ExecutionCategory,
        target_id: i64,
    },
    Progress {
        execution_id: Uuid,
        progress: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        current_step: Option<String>,
    },
    /// Running work was signalled to stop. It may still finish normally.
    CancelRequested {
        execution_id: Uuid,
        reason: CancelReason,
    },
    Completed {
        execution_id: Uuid,
        category: ExecutionCategory,
        /// First 200 chars of the rendered result.
        summary: String,
    },
    Failed {
        execution_id: Uuid,
        category: ExecutionCategory,
        error: String,
    },
    Cancelled {
        execution_id: Uuid,
        category: ExecutionCategory,
    },
}

impl ExecutionEvent {
    /// Build the terminal event for a record, if it is terminal.
    pub fn terminal(record: &ExecutionRecord) -> Option<Self> {
        let execution_id = record.execution_id;
        let category = record.category;
        match record.status {
            ExecutionStatus::Completed => Some(Self::Completed {
                execution_id,
                category,
                summary: summarize(record.result.as_ref()),
            }),
            ExecutionStatus::Failed => Some(Self::Failed {
                execution_id,
                category,
                error: record.error.clone().unwrap_or_default(),
            }),
            ExecutionStatus::Cancelled => Some(Self::Cancelled {
                execution_id,
                category,
            }),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed { .. } | Self::Failed { .. } | Self::Cancelled { .. }
        )
    }
}

fn summarize(result: Option<&serde_json::Value>) -> String {
    let text = match result {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    text.chars().take(SUMMARY_LEN).collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn terminal_event_only_for_terminal_records() {
        let mut record =
            ExecutionRecord::new(ExecutionCategory::Workflow, 3, json!({}), Default::default());
        assert!(ExecutionEvent::terminal(&record).is_none());

        record.mark_running().unwrap();
        record.complete(json!("x".repeat(500))).unwrap();
        match ExecutionEvent::terminal(&record) {
            Some(ExecutionEvent::Completed { summary, category, .. }) => {
                assert_eq!(summary.len(), 200);
                assert_eq!(category, ExecutionCategory::Workflow);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn serializes_with_type_tag() {
        let event = ExecutionEvent::CancelRequested {
            execution_id: Uuid::nil(),
            reason: CancelReason::Timeout,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], "cancel_requested");
        assert_eq!(value["reason"], "timeout");
        assert!(!event.is_terminal());
    }
}
