//! Execution records and the execution state machine.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of domain entity an execution runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionCategory {
    Task,
    Workflow,
    Agent,
}

impl ExecutionCategory {
    pub const ALL: [ExecutionCategory; 3] = [Self::Task, Self::Workflow, Self::Agent];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Task => "task",
            Self::Workflow => "workflow",
            Self::Agent => "agent",
        }
    }
}

impl std::fmt::Display for ExecutionCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(Self::Task),
            "workflow" => Ok(Self::Workflow),
            "agent" => Ok(Self::Agent),
            other => Err(format!("unknown execution category: {other}")),
        }
    }
}

/// State of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    /// Created, admission not yet decided.
    Pending,
    /// Waiting in its category's queue for a free slot.
    Queued,
    /// Admitted and dispatched to the worker pool.
    Running,
    /// Work returned a result.
    Completed,
    /// Work returned an error or panicked.
    Failed,
    /// Cancelled while queued, or cancellation confirmed while running.
    Cancelled,
}

impl ExecutionStatus {
    pub const ALL: [ExecutionStatus; 6] = [
        Self::Pending,
        Self::Queued,
        Self::Running,
        Self::Completed,
        Self::Failed,
        Self::Cancelled,
    ];

    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionStatus) -> bool {
        use ExecutionStatus::*;

        matches!(
            (self, target),
            (Pending, Queued) | (Pending, Running) |
            (Queued, Running) | (Queued, Cancelled) |
            (Running, Completed) | (Running, Failed) | (Running, Cancelled)
        )
    }

    /// Terminal states are sticky.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| format!("unknown execution status: {s}"))
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Cannot transition from {from} to {to}")]
pub struct InvalidTransition {
    pub from: ExecutionStatus,
    pub to: ExecutionStatus,
}

/// One timestamped log line emitted during an execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub message: String,
}

/// A liveness update reported by running work.
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressUpdate {
    Log(String),
    Step(String),
    Percent(f64),
}

/// One admitted unit of work and everything observed about it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub category: ExecutionCategory,
    pub target_id: i64,
    pub user_id: Option<String>,
    pub inputs: serde_json::Value,
    pub status: ExecutionStatus,
    /// Percentage in `[0, 100]`.
    pub progress: f64,
    pub current_step: Option<String>,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
    pub error: Option<String>,
    pub logs: Vec<LogEntry>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub timeout: Option<Duration>,
    /// Set once a cancel (explicit or timeout) has been signalled to running work.
    pub cancel_requested: bool,
}

impl ExecutionRecord {
    /// Create a pending record with a fresh execution ID.
    pub fn new(
        category: ExecutionCategory,
        target_id: i64,
        inputs: serde_json::Value,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            execution_id: Uuid::new_v4(),
            category,
            target_id,
            user_id: None,
            inputs,
            status: ExecutionStatus::Pending,
            progress: 0.0,
            current_step: None,
            submitted_at: Utc::now(),
            started_at: None,
            completed_at: None,
            result: None,
            error: None,
            logs: Vec::new(),
            metadata,
            timeout: None,
            cancel_requested: false,
        }
    }

    pub fn with_user(mut self, user_id: Option<String>) -> Self {
        self.user_id = user_id;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move to a new state, stamping timestamps on the way.
    fn transition_to(&mut self, new_status: ExecutionStatus) -> Result<(), InvalidTransition> {
        if !self.status.can_transition_to(new_status) {
            return Err(InvalidTransition {
                from: self.status,
                to: new_status,
            });
        }

        self.status = new_status;
        let now = Utc::now();
        match new_status {
            ExecutionStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            ExecutionStatus::Completed | ExecutionStatus::Failed | ExecutionStatus::Cancelled => {
                // Clock skew between threads must not produce completed < started.
                let completed = match self.started_at {
                    Some(started) if started > now => started,
                    _ => now,
                };
                self.completed_at = Some(completed);
            }
            _ => {}
        }

        Ok(())
    }

    pub fn mark_queued(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionStatus::Queued)
    }

    pub fn mark_running(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionStatus::Running)
    }

    /// Record a successful result. Progress is pinned to 100.
    pub fn complete(&mut self, result: serde_json::Value) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionStatus::Completed)?;
        self.result = Some(result);
        self.error = None;
        self.progress = 100.0;
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionStatus::Failed)?;
        self.error = Some(error.into());
        self.result = None;
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(ExecutionStatus::Cancelled)
    }

    /// Append a log line. Terminal records are frozen, so this is a no-op there.
    pub fn push_log(&mut self, message: impl Into<String>) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.logs.push(LogEntry {
            timestamp: Utc::now(),
            message: message.into(),
        });
        true
    }

    /// Apply an update from running work. Anything arriving outside RUNNING is
    /// ignored, as is a progress value lower than the current one.
    pub fn apply_progress(&mut self, update: ProgressUpdate) -> bool {
        if self.status != ExecutionStatus::Running {
            return false;
        }
        match update {
            ProgressUpdate::Log(message) => self.push_log(message),
            ProgressUpdate::Step(step) => {
                self.current_step = Some(step);
                true
            }
            ProgressUpdate::Percent(percent) => {
                if !percent.is_finite() {
                    return false;
                }
                let percent = percent.clamp(0.0, 100.0);
                if percent < self.progress {
                    return false;
                }
                self.progress = percent;
                true
            }
        }
    }

    /// Wall-clock run time, if the execution ever started.
    pub fn elapsed(&self) -> Option<Duration> {
        self.started_at.map(|start| {
            let end = self.completed_at.unwrap_or_else(Utc::now);
            end.signed_duration_since(start)
                .to_std()
                .unwrap_or(Duration::ZERO)
        })
    }

    /// Human-readable target name captured at submission.
    pub fn target_name(&self) -> Option<&str> {
        self.metadata.get("target_name").and_then(|v| v.as_str())
    }
}
