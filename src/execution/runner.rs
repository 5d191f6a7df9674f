//! Work unit execution off the scheduling loop.
//!
//! A dispatched unit waits for a worker slot, then runs on the blocking
//! thread pool. Everything it reports (progress, the final outcome) travels
//! back to the scheduler loop as [`RunnerEvent`]s over one channel, so the
//! loop remains the only writer of execution state.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::WorkError;

use super::record::{ExecutionCategory, ProgressUpdate};

/// Everything a work unit gets to see about its execution.
#[derive(Debug, Clone)]
pub struct WorkRequest {
    pub execution_id: Uuid,
    pub category: ExecutionCategory,
    pub target_id: i64,
    pub inputs: serde_json::Value,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The opaque, blocking unit of work behind a category (an LLM crew run,
/// a single agent call, ...).
///
/// Implementations should poll [`ProgressReporter::is_cancelled`] between
/// steps and return [`WorkError::Cancelled`] when it flips; the scheduler
/// cannot interrupt a call in progress.
pub trait WorkUnit: Send + Sync + 'static {
    fn run(
        &self,
        request: WorkRequest,
        reporter: &ProgressReporter,
    ) -> Result<serde_json::Value, WorkError>;
}

impl<F> WorkUnit for F
where
    F: Fn(WorkRequest, &ProgressReporter) -> Result<serde_json::Value, WorkError>
        + Send
        + Sync
        + 'static,
{
    fn run(
        &self,
        request: WorkRequest,
        reporter: &ProgressReporter,
    ) -> Result<serde_json::Value, WorkError> {
        self(request, reporter)
    }
}

/// Wrap a closure as a shareable [`WorkUnit`].
pub fn work_fn<F>(f: F) -> Arc<dyn WorkUnit>
where
    F: Fn(WorkRequest, &ProgressReporter) -> Result<serde_json::Value, WorkError>
        + Send
        + Sync
        + 'static,
{
    Arc::new(f)
}

/// How a dispatched unit ended.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkOutcome {
    Succeeded(serde_json::Value),
    Failed(String),
    Cancelled,
}

/// Messages from running work back to the scheduler loop.
#[derive(Debug)]
pub(crate) enum RunnerEvent {
    /// The unit claimed a worker slot. Precedes any progress.
    Started { execution_id: Uuid },
    Progress {
        execution_id: Uuid,
        update: ProgressUpdate,
    },
    /// Sent exactly once per dispatched unit.
    Finished {
        execution_id: Uuid,
        outcome: WorkOutcome,
    },
}

/// Liveness channel handed to a running work unit.
///
/// Not `Clone`: only the unit dispatched for an execution may report on it.
pub struct ProgressReporter {
    execution_id: Uuid,
    events: mpsc::UnboundedSender<RunnerEvent>,
    cancel: CancellationToken,
}

impl ProgressReporter {
    /// Append a log line to the execution record.
    pub fn log(&self, message: impl Into<String>) {
        self.send(ProgressUpdate::Log(message.into()));
    }

    /// Replace the current step label.
    pub fn step(&self, step: impl Into<String>) {
        self.send(ProgressUpdate::Step(step.into()));
    }

    /// Report completion percentage. Values lower than the last accepted one
    /// are ignored by the scheduler.
    pub fn progress(&self, percent: f64) {
        self.send(ProgressUpdate::Percent(percent));
    }

    /// Whether cancellation (explicit or timeout) has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn send(&self, update: ProgressUpdate) {
        // Loop gone means the scheduler shut down; nobody is listening.
        let _ = self.events.send(RunnerEvent::Progress {
            execution_id: self.execution_id,
            update,
        });
    }
}

/// Handle to one dispatched unit.
#[derive(Debug)]
pub struct RunHandle {
    cancel: CancellationToken,
    started: Arc<AtomicBool>,
}

impl RunHandle {
    /// Signal cooperative cancellation. Work that has not yet claimed a
    /// worker slot is dropped immediately; running work must notice on its own.
    pub fn request_cancel(&self) {
        self.cancel.cancel();
    }

    /// Whether the unit has claimed a worker slot and begun running.
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }
}

/// Runs admitted work on a bounded pool of blocking workers.
pub struct WorkUnitRunner {
    pool: Arc<Semaphore>,
    events: mpsc::UnboundedSender<RunnerEvent>,
}

impl WorkUnitRunner {
    pub(crate) fn new(pool_size: usize, events: mpsc::UnboundedSender<RunnerEvent>) -> Self {
        Self {
            pool: Arc::new(Semaphore::new(pool_size)),
            events,
        }
    }

    /// Worker slots not currently held by running work.
    pub fn available_workers(&self) -> usize {
        self.pool.available_permits()
    }

    /// Submit `work` for `request`. Returns immediately; the outcome arrives
    /// later as a single [`RunnerEvent::Finished`].
    pub fn dispatch(&self, request: WorkRequest, work: Arc<dyn WorkUnit>) -> RunHandle {
        let execution_id = request.execution_id;
        let cancel = CancellationToken::new();
        let started = Arc::new(AtomicBool::new(false));

        let reporter = ProgressReporter {
            execution_id,
            events: self.events.clone(),
            cancel: cancel.clone(),
        };
        let pool = Arc::clone(&self.pool);
        let events = self.events.clone();
        let token = cancel.clone();
        let started_flag = Arc::clone(&started);

        tokio::spawn(async move {
            let outcome = run_unit(pool, work, request, reporter, token, started_flag).await;
            tracing::debug!(execution_id = %execution_id, ?outcome, "Work unit finished");
            let _ = events.send(RunnerEvent::Finished {
                execution_id,
                outcome,
            });
        });

        RunHandle { cancel, started }
    }
}

async fn run_unit(
    pool: Arc<Semaphore>,
    work: Arc<dyn WorkUnit>,
    request: WorkRequest,
    reporter: ProgressReporter,
    cancel: CancellationToken,
    started: Arc<AtomicBool>,
) -> WorkOutcome {
    let permit = tokio::select! {
        biased;
        _ = cancel.cancelled() => return WorkOutcome::Cancelled,
        permit = pool.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return WorkOutcome::Failed("worker pool closed".to_string()),
        },
    };
    started.store(true, Ordering::Release);
    let _ = reporter.events.send(RunnerEvent::Started {
        execution_id: reporter.execution_id,
    });

    let blocking = tokio::task::spawn_blocking(move || {
        let _permit = permit;
        work.run(request, &reporter)
    });

    match blocking.await {
        Ok(Ok(value)) => WorkOutcome::Succeeded(value),
        Ok(Err(WorkError::Cancelled)) => WorkOutcome::Cancelled,
        Ok(Err(WorkError::Failed(reason))) => WorkOutcome::Failed(reason),
        Err(e) => WorkOutcome::Failed(describe_join_error(e)),
    }
}

fn describe_join_error(e: JoinError) -> String {
    if e.is_panic() {
        let payload = e.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| (*s).to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        format!("work unit panicked: {message}")
    } else {
        "work unit was aborted".to_string()
    }
}
