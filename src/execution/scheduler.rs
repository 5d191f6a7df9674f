//! Execution scheduler: submission, admission, dispatch, cancellation and
//! cleanup for every execution category.
//!
//! [`ExecutionScheduler`] is a cloneable handle. All bookkeeping lives in a
//! single event-loop task that owns the in-flight table, the
//! [`ConcurrencyGate`] and the [`WorkUnitRunner`]. Handles reach it over a
//! command channel; running work reaches it over the runner channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::error::{ConfigError, ExecutionError};
use crate::store::traits::ExecutionStore;

use super::catalog::TargetCatalog;
use super::events::{CancelReason, ExecutionEvent};
use super::gate::{ConcurrencyGate, GateSnapshot, WaitQueue};
use super::reconciler::PersistenceReconciler;
use super::record::{ExecutionCategory, ExecutionRecord, ExecutionStatus, ProgressUpdate};
use super::runner::{RunHandle, RunnerEvent, WorkOutcome, WorkRequest, WorkUnit, WorkUnitRunner};

type Metadata = serde_json::Map<String, serde_json::Value>;
type WorkUnits = Arc<HashMap<ExecutionCategory, Arc<dyn WorkUnit>>>;

/// A request to run one task, workflow, or agent.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    pub category: ExecutionCategory,
    pub target_id: i64,
    pub inputs: serde_json::Value,
    pub user_id: Option<String>,
    /// Overrides the configured default timeout. The clock starts once the
    /// work claims a worker slot, not when the execution is admitted.
    pub timeout: Option<Duration>,
    pub metadata: Metadata,
}

impl SubmitRequest {
    pub fn new(category: ExecutionCategory, target_id: i64) -> Self {
        Self {
            category,
            target_id,
            inputs: serde_json::Value::Object(Metadata::new()),
            user_id: None,
            timeout: None,
            metadata: Metadata::new(),
        }
    }

    pub fn task(target_id: i64) -> Self {
        Self::new(ExecutionCategory::Task, target_id)
    }

    pub fn workflow(target_id: i64) -> Self {
        Self::new(ExecutionCategory::Workflow, target_id)
    }

    pub fn agent(target_id: i64) -> Self {
        Self::new(ExecutionCategory::Agent, target_id)
    }

    pub fn with_inputs(mut self, inputs: serde_json::Value) -> Self {
        self.inputs = inputs;
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a cancel request.
///
/// Cancelling running work is cooperative: `NotConfirmed` means the work was
/// signalled but did not stop within the grace period and may still finish
/// normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    NotConfirmed,
    /// The execution had already reached a terminal state.
    Rejected,
}

impl CancelOutcome {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Aggregate view of the in-flight table and the gates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStatistics {
    pub total: usize,
    pub by_status: BTreeMap<ExecutionStatus, usize>,
    pub by_category: BTreeMap<ExecutionCategory, usize>,
    pub gates: BTreeMap<ExecutionCategory, GateSnapshot>,
    pub available_workers: usize,
}

enum Command {
    Submit {
        record: ExecutionRecord,
        reply: oneshot::Sender<Result<Uuid, ExecutionError>>,
    },
    GetStatus {
        id: Uuid,
        reply: oneshot::Sender<Option<ExecutionRecord>>,
    },
    Cancel {
        id: Uuid,
        reply: oneshot::Sender<CancelOutcome>,
    },
    Cleanup {
        older_than: DateTime<Utc>,
        reply: oneshot::Sender<usize>,
    },
    Statistics {
        reply: oneshot::Sender<ExecutionStatistics>,
    },
    WaitForCompletion {
        id: Uuid,
        reply: oneshot::Sender<Option<ExecutionRecord>>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

enum TimerEvent {
    Timeout(Uuid),
    CancelGrace { execution_id: Uuid, waiter: u64 },
}

/// One entry of the in-flight table.
struct InFlight {
    record: ExecutionRecord,
    run: Option<RunHandle>,
    timeout: Option<JoinHandle<()>>,
    cancel_waiters: Vec<(u64, oneshot::Sender<CancelOutcome>)>,
    completion_waiters: Vec<oneshot::Sender<Option<ExecutionRecord>>>,
}

impl InFlight {
    fn new(record: ExecutionRecord) -> Self {
        Self {
            record,
            run: None,
            timeout: None,
            cancel_waiters: Vec::new(),
            completion_waiters: Vec::new(),
        }
    }
}

/// Builder for [`ExecutionScheduler`].
pub struct SchedulerBuilder {
    config: SchedulerConfig,
    catalog: Arc<dyn TargetCatalog>,
    work_units: HashMap<ExecutionCategory, Arc<dyn WorkUnit>>,
    wait_queues: HashMap<ExecutionCategory, Box<dyn WaitQueue>>,
    store: Option<Arc<dyn ExecutionStore>>,
}

impl SchedulerBuilder {
    /// Register the unit of work that runs executions of `category`.
    pub fn work_unit(mut self, category: ExecutionCategory, work: Arc<dyn WorkUnit>) -> Self {
        self.work_units.insert(category, work);
        self
    }

    /// Replace the FIFO promotion policy of one category.
    pub fn wait_queue(mut self, category: ExecutionCategory, queue: Box<dyn WaitQueue>) -> Self {
        self.wait_queues.insert(category, queue);
        self
    }

    /// Mirror terminal executions into `store`.
    pub fn store(mut self, store: Arc<dyn ExecutionStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Validate the configuration and start the event loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<ExecutionScheduler, ConfigError> {
        self.config.validate()?;

        let config = self.config;
        let mut gate =
            ConcurrencyGate::new(ExecutionCategory::ALL.map(|c| (c, config.capacity(c))));
        for (category, queue) in self.wait_queues {
            gate.set_policy(category, config.capacity(category), queue);
        }

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(config.event_buffer);
        let work_units: WorkUnits = Arc::new(self.work_units);

        info!(
            max_concurrent_tasks = config.max_concurrent_tasks,
            max_concurrent_workflows = config.max_concurrent_workflows,
            max_concurrent_agents = ?config.max_concurrent_agents,
            worker_pool_size = config.worker_pool_size,
            persistence = self.store.is_some(),
            "Execution scheduler started"
        );

        let handle = ExecutionScheduler {
            commands: command_tx,
            catalog: self.catalog,
            work_units: Arc::clone(&work_units),
            default_timeout: config.default_timeout,
            events: events.clone(),
        };

        let event_loop = SchedulerLoop {
            records: HashMap::new(),
            gate,
            runner: WorkUnitRunner::new(config.worker_pool_size, runner_tx),
            work_units,
            reconciler: self.store.map(PersistenceReconciler::new),
            persisting: Vec::new(),
            events,
            timers: timer_tx,
            next_waiter: 0,
            closing: None,
            config,
        };
        tokio::spawn(event_loop.run(command_rx, runner_rx, timer_rx));

        Ok(handle)
    }
}

/// Handle to the execution scheduler. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionScheduler {
    commands: mpsc::UnboundedSender<Command>,
    catalog: Arc<dyn TargetCatalog>,
    work_units: WorkUnits,
    default_timeout: Option<Duration>,
    events: broadcast::Sender<ExecutionEvent>,
}

impl ExecutionScheduler {
    pub fn builder(config: SchedulerConfig, catalog: Arc<dyn TargetCatalog>) -> SchedulerBuilder {
        SchedulerBuilder {
            config,
            catalog,
            work_units: HashMap::new(),
            wait_queues: HashMap::new(),
            store: None,
        }
    }

    /// Validate the target and admit or queue a new execution.
    ///
    /// Returns as soon as the execution is RUNNING or QUEUED. Validation
    /// failures leave no record behind.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Uuid, ExecutionError> {
        let SubmitRequest {
            category,
            target_id,
            inputs,
            user_id,
            timeout,
            mut metadata,
        } = request;

        if !self.work_units.contains_key(&category) {
            return Err(ExecutionError::CategoryNotConfigured { category });
        }

        let target = self
            .catalog
            .get_target(category, target_id)
            .await
            .map_err(|e| ExecutionError::Lookup(e.to_string()))?
            .ok_or(ExecutionError::TargetNotFound {
                category,
                target_id,
            })?;

        if !target.is_executable {
            return Err(ExecutionError::TargetNotExecutable {
                category,
                target_id,
                reason: target
                    .reason
                    .unwrap_or_else(|| "target is not executable".to_string()),
            });
        }

        for (key, value) in target.metadata {
            metadata.entry(key).or_insert(value);
        }
        metadata.insert("target_name".to_string(), target.name.into());

        let record = ExecutionRecord::new(category, target_id, inputs, metadata)
            .with_user(user_id)
            .with_timeout(timeout.or(self.default_timeout));

        self.call(|reply| Command::Submit { record, reply }).await?
    }

    /// Snapshot of an execution, or `None` if it is unknown or cleaned up.
    pub async fn get_status(&self, id: Uuid) -> Result<Option<ExecutionRecord>, ExecutionError> {
        self.call(|reply| Command::GetStatus { id, reply }).await
    }

    /// Cancel a queued execution, or ask running work to stop.
    ///
    /// For running work this waits up to the configured cancel grace for the
    /// work to confirm.
    pub async fn cancel(&self, id: Uuid) -> Result<CancelOutcome, ExecutionError> {
        self.call(|reply| Command::Cancel { id, reply }).await
    }

    /// Evict terminal executions completed before `older_than`. Returns how
    /// many were removed.
    pub async fn cleanup(&self, older_than: DateTime<Utc>) -> Result<usize, ExecutionError> {
        self.call(|reply| Command::Cleanup { older_than, reply }).await
    }

    pub async fn get_statistics(&self) -> Result<ExecutionStatistics, ExecutionError> {
        self.call(|reply| Command::Statistics { reply }).await
    }

    /// Resolve with the terminal snapshot of an execution.
    ///
    /// Returns immediately if it is already terminal, and `None` if unknown.
    pub async fn wait_for_completion(
        &self,
        id: Uuid,
    ) -> Result<Option<ExecutionRecord>, ExecutionError> {
        self.call(|reply| Command::WaitForCompletion { id, reply })
            .await
    }

    /// Subscribe to lifecycle events of all executions.
    pub fn subscribe(&self) -> broadcast::Receiver<ExecutionEvent> {
        self.events.subscribe()
    }

    /// Cancel queued work, signal running work, and stop the event loop once
    /// running work has finished or the cancel grace has elapsed.
    pub async fn shutdown(&self) -> Result<(), ExecutionError> {
        self.call(|reply| Command::Shutdown { reply }).await
    }

    async fn call<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> Command,
    ) -> Result<T, ExecutionError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(command(reply))
            .map_err(|_| ExecutionError::SchedulerClosed)?;
        response.await.map_err(|_| ExecutionError::SchedulerClosed)
    }
}

struct Closing {
    deadline: Instant,
    waiters: Vec<oneshot::Sender<()>>,
}

/// State owned by the event-loop task.
struct SchedulerLoop {
    config: SchedulerConfig,
    records: HashMap<Uuid, InFlight>,
    gate: ConcurrencyGate,
    runner: WorkUnitRunner,
    work_units: WorkUnits,
    reconciler: Option<PersistenceReconciler>,
    /// Outstanding persistence saves, awaited on shutdown.
    persisting: Vec<JoinHandle<()>>,
    events: broadcast::Sender<ExecutionEvent>,
    timers: mpsc::UnboundedSender<TimerEvent>,
    next_waiter: u64,
    closing: Option<Closing>,
}

impl SchedulerLoop {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut runner_events: mpsc::UnboundedReceiver<RunnerEvent>,
        mut timer_events: mpsc::UnboundedReceiver<TimerEvent>,
    ) {
        let mut sweep = self
            .config
            .cleanup_interval
            .map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            let deadline = self.closing.as_ref().map(|c| c.deadline);

            tokio::select! {
                biased;

                Some(event) = runner_events.recv() => self.on_runner_event(event),
                Some(timer) = timer_events.recv() => self.on_timer(timer),
                command = commands.recv() => match command {
                    Some(command) => self.on_command(command),
                    None => {
                        debug!("All scheduler handles dropped");
                        self.begin_shutdown(None);
                        break;
                    }
                },
                _ = wait_until(deadline) => {
                    warn!(
                        running = self.running_count(),
                        "Shutdown grace elapsed with work still running"
                    );
                    break;
                }
                _ = tick(&mut sweep) => self.sweep(),
            }

            if self.closing.is_some() && self.running_count() == 0 {
                break;
            }
            self.persisting.retain(|save| !save.is_finished());
        }

        self.finish_shutdown().await;
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Submit { record, reply } => {
                let _ = reply.send(self.submit(record));
            }
            Command::GetStatus { id, reply } => {
                let _ = reply.send(self.records.get(&id).map(|e| e.record.clone()));
            }
            Command::Cancel { id, reply } => self.cancel(id, reply),
            Command::Cleanup { older_than, reply } => {
                let _ = reply.send(self.cleanup(older_than));
            }
            Command::Statistics { reply } => {
                let _ = reply.send(self.statistics());
            }
            Command::WaitForCompletion { id, reply } => match self.records.get_mut(&id) {
                None => {
                    let _ = reply.send(None);
                }
                Some(entry) if entry.record.is_terminal() => {
                    let _ = reply.send(Some(entry.record.clone()));
                }
                Some(entry) => entry.completion_waiters.push(reply),
            },
            Command::Shutdown { reply } => self.begin_shutdown(Some(reply)),
        }
    }

    fn submit(&mut self, mut record: ExecutionRecord) -> Result<Uuid, ExecutionError> {
        if self.closing.is_some() {
            return Err(ExecutionError::SchedulerClosed);
        }

        let id = record.execution_id;
        let category = record.category;
        record.push_log("Execution submitted");
        info!(
            execution_id = %id,
            category = %category,
            target_id = record.target_id,
            target_name = record.target_name().unwrap_or_default(),
            "Execution submitted"
        );
        self.records.insert(id, InFlight::new(record));

        if self.gate.try_admit(category) {
            self.start(id);
        } else if let Some(entry) = self.records.get_mut(&id) {
            if let Err(e) = entry.record.mark_queued() {
                warn!(execution_id = %id, error = %e, "Could not queue execution");
            }
            self.gate.enqueue(category, id);
            let depth = self.gate.snapshot(category).queued;
            entry
                .record
                .push_log(format!("Queued: {category} capacity reached (position {depth})"));
            let _ = self.events.send(ExecutionEvent::Queued {
                execution_id: id,
                category,
                depth,
            });
        }

        Ok(id)
    }

    /// Move an admitted execution to RUNNING and dispatch its work. The
    /// caller must already hold a gate slot for it.
    fn start(&mut self, id: Uuid) -> bool {
        let Some(entry) = self.records.get_mut(&id) else {
            return false;
        };
        debug_assert!(
            entry.record.status.can_transition_to(ExecutionStatus::Running),
            "execution {id} cannot start from {}",
            entry.record.status
        );
        if let Err(e) = entry.record.mark_running() {
            warn!(execution_id = %id, error = %e, "Skipping dispatch");
            return false;
        }
        entry.record.push_log("Execution started");

        let category = entry.record.category;
        let Some(work) = self.work_units.get(&category) else {
            let _ = entry
                .record
                .fail(format!("No work unit registered for category {category}"));
            self.settle(id, true);
            return true;
        };

        let request = WorkRequest {
            execution_id: id,
            category,
            target_id: entry.record.target_id,
            inputs: entry.record.inputs.clone(),
            metadata: entry.record.metadata.clone(),
        };
        entry.run = Some(self.runner.dispatch(request, Arc::clone(work)));

        info!(
            execution_id = %id,
            category = %category,
            target_id = entry.record.target_id,
            "Execution started"
        );
        let _ = self.events.send(ExecutionEvent::Started {
            execution_id: id,
            category,
            target_id: entry.record.target_id,
        });
        true
    }

    /// Free a finished execution's slot and start whoever inherits it.
    fn release_slot(&mut self, category: ExecutionCategory) {
        let mut next = self.gate.release_and_promote(category);
        while let Some(id) = next {
            if self.start(id) {
                return;
            }
            // Stale waiter; hand the slot on.
            next = self.gate.release_and_promote(category);
        }
    }

    fn cancel(&mut self, id: Uuid, reply: oneshot::Sender<CancelOutcome>) {
        let Some(entry) = self.records.get_mut(&id) else {
            let _ = reply.send(CancelOutcome::NotFound);
            return;
        };

        match entry.record.status {
            ExecutionStatus::Queued => {
                let category = entry.record.category;
                let removed = self.gate.remove_queued(category, id);
                debug_assert!(removed, "queued execution {id} missing from the {category} queue");
                entry.record.push_log("Cancelled while queued");
                if let Err(e) = entry.record.cancel() {
                    warn!(execution_id = %id, error = %e, "Could not cancel queued execution");
                    let _ = reply.send(CancelOutcome::Rejected);
                    return;
                }
                self.settle(id, false);
                let _ = reply.send(CancelOutcome::Cancelled);
            }
            ExecutionStatus::Running => {
                if !entry.record.cancel_requested {
                    entry.record.cancel_requested = true;
                    entry.record.push_log("Cancellation requested");
                    if let Some(run) = &entry.run {
                        run.request_cancel();
                    }
                    info!(execution_id = %id, "Cancellation requested");
                    let _ = self.events.send(ExecutionEvent::CancelRequested {
                        execution_id: id,
                        reason: CancelReason::Requested,
                    });
                }

                if self.config.cancel_grace.is_zero() {
                    let _ = reply.send(CancelOutcome::NotConfirmed);
                    return;
                }

                let waiter = self.next_waiter;
                self.next_waiter += 1;
                entry.cancel_waiters.push((waiter, reply));

                let timers = self.timers.clone();
                let grace = self.config.cancel_grace;
                tokio::spawn(async move {
                    tokio::time::sleep(grace).await;
                    let _ = timers.send(TimerEvent::CancelGrace {
                        execution_id: id,
                        waiter,
                    });
                });
            }
            ExecutionStatus::Pending
            | ExecutionStatus::Completed
            | ExecutionStatus::Failed
            | ExecutionStatus::Cancelled => {
                let _ = reply.send(CancelOutcome::Rejected);
            }
        }
    }

    fn on_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Started { execution_id } => self.arm_timeout(execution_id),
            RunnerEvent::Progress {
                execution_id,
                update,
            } => self.on_progress(execution_id, update),
            RunnerEvent::Finished {
                execution_id,
                outcome,
            } => self.on_finished(execution_id, outcome),
        }
    }

    /// The timeout clock runs from the moment the work holds a worker slot.
    fn arm_timeout(&mut self, id: Uuid) {
        let Some(entry) = self.records.get_mut(&id) else {
            return;
        };
        if entry.record.status != ExecutionStatus::Running || entry.timeout.is_some() {
            return;
        }
        if let Some(timeout) = entry.record.timeout {
            let timers = self.timers.clone();
            entry.timeout = Some(tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                let _ = timers.send(TimerEvent::Timeout(id));
            }));
        }
    }

    fn on_progress(&mut self, id: Uuid, update: ProgressUpdate) {
        let Some(entry) = self.records.get_mut(&id) else {
            return;
        };
        let announce = !matches!(update, ProgressUpdate::Log(_));
        if entry.record.apply_progress(update) && announce {
            let _ = self.events.send(ExecutionEvent::Progress {
                execution_id: id,
                progress: entry.record.progress,
                current_step: entry.record.current_step.clone(),
            });
        }
    }

    fn on_finished(&mut self, id: Uuid, outcome: WorkOutcome) {
        let Some(entry) = self.records.get_mut(&id) else {
            return;
        };
        if entry.record.status != ExecutionStatus::Running {
            debug!(execution_id = %id, status = %entry.record.status, "Ignoring late completion");
            return;
        }

        let transition = match outcome {
            WorkOutcome::Succeeded(value) => {
                entry.record.push_log("Execution completed");
                entry.record.complete(value)
            }
            WorkOutcome::Failed(reason) => {
                error!(
                    execution_id = %id,
                    category = %entry.record.category,
                    error = %reason,
                    "Execution failed"
                );
                entry.record.push_log(format!("Execution failed: {reason}"));
                entry.record.fail(reason)
            }
            WorkOutcome::Cancelled => {
                entry.record.push_log("Execution cancelled");
                entry.record.cancel()
            }
        };

        match transition {
            Ok(()) => self.settle(id, true),
            Err(e) => warn!(execution_id = %id, error = %e, "Dropped completion"),
        }
    }

    fn on_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::Timeout(id) => {
                let Some(entry) = self.records.get_mut(&id) else {
                    return;
                };
                if entry.record.status != ExecutionStatus::Running {
                    return;
                }
                entry.timeout = None;
                let limit = entry.record.timeout.unwrap_or_default().as_secs_f64();
                warn!(execution_id = %id, timeout_secs = limit, "Execution timed out, requesting cancellation");
                entry
                    .record
                    .push_log(format!("Timed out after {limit:.1}s, cancellation requested"));
                entry.record.cancel_requested = true;
                if let Some(run) = &entry.run {
                    run.request_cancel();
                }
                let _ = self.events.send(ExecutionEvent::CancelRequested {
                    execution_id: id,
                    reason: CancelReason::Timeout,
                });
            }
            TimerEvent::CancelGrace {
                execution_id,
                waiter,
            } => {
                let Some(entry) = self.records.get_mut(&execution_id) else {
                    return;
                };
                if let Some(pos) = entry.cancel_waiters.iter().position(|(w, _)| *w == waiter) {
                    let (_, reply) = entry.cancel_waiters.swap_remove(pos);
                    debug!(%execution_id, "Cancellation not confirmed within grace period");
                    let _ = reply.send(CancelOutcome::NotConfirmed);
                }
            }
        }
    }

    /// Side effects of a terminal transition: answer waiters, notify,
    /// persist, and release the slot if the execution held one.
    fn settle(&mut self, id: Uuid, admitted: bool) {
        let Some(entry) = self.records.get_mut(&id) else {
            return;
        };
        if let Some(timer) = entry.timeout.take() {
            timer.abort();
        }
        entry.run = None;

        let snapshot = entry.record.clone();
        let cancel_outcome = if snapshot.status == ExecutionStatus::Cancelled {
            CancelOutcome::Cancelled
        } else {
            CancelOutcome::NotConfirmed
        };
        for (_, waiter) in entry.cancel_waiters.drain(..) {
            let _ = waiter.send(cancel_outcome);
        }
        for waiter in entry.completion_waiters.drain(..) {
            let _ = waiter.send(Some(snapshot.clone()));
        }

        info!(
            execution_id = %id,
            category = %snapshot.category,
            status = %snapshot.status,
            elapsed_ms = snapshot.elapsed().map(|d| d.as_millis() as u64),
            "Execution finished"
        );
        if let Some(event) = ExecutionEvent::terminal(&snapshot) {
            let _ = self.events.send(event);
        }

        let category = snapshot.category;
        if let Some(reconciler) = &self.reconciler {
            self.persisting.push(reconciler.spawn_save(snapshot));
        }
        if admitted {
            self.release_slot(category);
        }
    }

    fn cleanup(&mut self, older_than: DateTime<Utc>) -> usize {
        let before = self.records.len();
        self.records.retain(|_, entry| {
            let expired = entry.record.is_terminal()
                && entry.record.completed_at.is_some_and(|at| at < older_than);
            !expired
        });
        let removed = before - self.records.len();
        if removed > 0 {
            info!(removed, remaining = self.records.len(), "Cleaned up finished executions");
        }
        removed
    }

    fn sweep(&mut self) {
        let cutoff = TimeDelta::from_std(self.config.retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention));
        match cutoff {
            Some(cutoff) => {
                self.cleanup(cutoff);
            }
            None => warn!("Retention period out of range, skipping cleanup sweep"),
        }
    }

    fn statistics(&self) -> ExecutionStatistics {
        let mut by_status: BTreeMap<_, _> =
            ExecutionStatus::ALL.into_iter().map(|s| (s, 0)).collect();
        let mut by_category: BTreeMap<_, _> =
            ExecutionCategory::ALL.into_iter().map(|c| (c, 0)).collect();
        for entry in self.records.values() {
            *by_status.entry(entry.record.status).or_default() += 1;
            *by_category.entry(entry.record.category).or_default() += 1;
        }

        ExecutionStatistics {
            total: self.records.len(),
            by_status,
            by_category,
            gates: ExecutionCategory::ALL
                .into_iter()
                .map(|c| (c, self.gate.snapshot(c)))
                .collect(),
            available_workers: self.runner.available_workers(),
        }
    }

    fn running_count(&self) -> usize {
        self.records
            .values()
            .filter(|e| e.record.status == ExecutionStatus::Running)
            .count()
    }

    fn begin_shutdown(&mut self, reply: Option<oneshot::Sender<()>>) {
        if let Some(closing) = &mut self.closing {
            closing.waiters.extend(reply);
            return;
        }
        info!(in_flight = self.records.len(), "Execution scheduler shutting down");

        // Drain queues first so finishing work promotes nobody.
        for category in ExecutionCategory::ALL {
            for id in self.gate.drain_queue(category) {
                let Some(entry) = self.records.get_mut(&id) else {
                    continue;
                };
                entry.record.push_log("Cancelled by scheduler shutdown");
                if entry.record.cancel().is_ok() {
                    self.settle(id, false);
                }
            }
        }

        for (id, entry) in self.records.iter_mut() {
            if entry.record.status != ExecutionStatus::Running {
                continue;
            }
            entry.record.cancel_requested = true;
            entry.record.push_log("Cancellation requested by scheduler shutdown");
            if let Some(run) = &entry.run {
                run.request_cancel();
            }
            let _ = self.events.send(ExecutionEvent::CancelRequested {
                execution_id: *id,
                reason: CancelReason::Shutdown,
            });
        }

        self.closing = Some(Closing {
            deadline: Instant::now() + self.config.cancel_grace,
            waiters: reply.into_iter().collect(),
        });
    }

    async fn finish_shutdown(mut self) {
        for entry in self.records.values_mut() {
            for (_, waiter) in entry.cancel_waiters.drain(..) {
                let _ = waiter.send(CancelOutcome::NotConfirmed);
            }
            if let Some(timer) = entry.timeout.take() {
                timer.abort();
            }
        }
        for save in self.persisting.drain(..) {
            let _ = save.await;
        }

        info!(
            running = self.running_count(),
            "Execution scheduler stopped"
        );
        if let Some(closing) = self.closing.take() {
            for waiter in closing.waiters {
                let _ = waiter.send(());
            }
        }
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use serde_json::json;

    use super::*;
    use crate::error::WorkError;
    use crate::execution::catalog::{InMemoryCatalog, TargetInfo};
    use crate::execution::runner::{ProgressReporter, work_fn};

    fn test_config() -> SchedulerConfig {
        SchedulerConfig {
            max_concurrent_tasks: 1,
            max_concurrent_workflows: 1,
            worker_pool_size: 4,
            cancel_grace: Duration::from_millis(100),
            ..Default::default()
        }
    }

    async fn catalog() -> Arc<InMemoryCatalog> {
        let catalog = Arc::new(InMemoryCatalog::new());
        for id in 1..=5 {
            catalog
                .insert(ExecutionCategory::Task, id, TargetInfo::executable(format!("task-{id}")))
                .await;
            catalog
                .insert(
                    ExecutionCategory::Workflow,
                    id,
                    TargetInfo::executable(format!("workflow-{id}"))
                        .with_metadata("workflow_type", "sequential"),
                )
                .await;
        }
        catalog
            .insert(
                ExecutionCategory::Task,
                99,
                TargetInfo::blocked("broken", "task has no assigned agent"),
            )
            .await;
        catalog
    }

    /// Work that runs until `release` flips, optionally honoring cancellation.
    fn held_work(release: Arc<AtomicBool>, honor_cancel: bool) -> Arc<dyn WorkUnit> {
        work_fn(move |req: WorkRequest, reporter: &ProgressReporter| {
            reporter.step("Holding");
            reporter.progress(10.0);
            loop {
                if release.load(Ordering::SeqCst) {
                    return Ok(json!({"target_id": req.target_id}));
                }
                if honor_cancel && reporter.is_cancelled() {
                    return Err(WorkError::Cancelled);
                }
                std::thread::sleep(Duration::from_millis(5));
            }
        })
    }

    async fn status(scheduler: &ExecutionScheduler, id: Uuid) -> ExecutionStatus {
        scheduler.get_status(id).await.unwrap().unwrap().status
    }

    async fn wait_done(scheduler: &ExecutionScheduler, id: Uuid) -> ExecutionRecord {
        tokio::time::timeout(Duration::from_secs(5), scheduler.wait_for_completion(id))
            .await
            .expect("execution did not finish")
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn unknown_target_leaves_no_record() {
        let release = Arc::new(AtomicBool::new(true));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release, true))
            .build()
            .unwrap();

        let err = scheduler.submit(SubmitRequest::task(404)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::TargetNotFound { target_id: 404, .. }));

        let err = scheduler.submit(SubmitRequest::task(99)).await.unwrap_err();
        match err {
            ExecutionError::TargetNotExecutable { reason, .. } => {
                assert_eq!(reason, "task has no assigned agent")
            }
            other => panic!("unexpected error: {other:?}"),
        }

        let err = scheduler.submit(SubmitRequest::agent(1)).await.unwrap_err();
        assert!(matches!(err, ExecutionError::CategoryNotConfigured { .. }));

        assert_eq!(scheduler.get_statistics().await.unwrap().total, 0);
    }

    #[tokio::test]
    async fn metadata_merges_catalog_info() {
        let release = Arc::new(AtomicBool::new(true));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Workflow, held_work(release, true))
            .build()
            .unwrap();

        let id = scheduler
            .submit(
                SubmitRequest::workflow(2)
                    .with_user("alice")
                    .with_metadata("workflow_type", "parallel")
                    .with_metadata("source", "api"),
            )
            .await
            .unwrap();
        let record = wait_done(&scheduler, id).await;

        assert_eq!(record.target_name(), Some("workflow-2"));
        assert_eq!(record.metadata["workflow_type"], "parallel");
        assert_eq!(record.metadata["source"], "api");
        assert_eq!(record.user_id.as_deref(), Some("alice"));
        assert_eq!(record.result, Some(json!({"target_id": 2})));
    }

    #[tokio::test]
    async fn uncooperative_cancel_is_not_confirmed() {
        let release = Arc::new(AtomicBool::new(false));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release.clone(), false))
            .build()
            .unwrap();

        let id = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        assert_eq!(scheduler.cancel(id).await.unwrap(), CancelOutcome::NotConfirmed);

        let record = scheduler.get_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Running);
        assert!(record.cancel_requested);

        release.store(true, Ordering::SeqCst);
        assert_eq!(wait_done(&scheduler, id).await.status, ExecutionStatus::Completed);
        assert_eq!(scheduler.cancel(id).await.unwrap(), CancelOutcome::Rejected);
    }

    #[tokio::test]
    async fn cooperative_cancel_is_confirmed() {
        let release = Arc::new(AtomicBool::new(false));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release, true))
            .build()
            .unwrap();

        let id = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        let mut events = scheduler.subscribe();
        assert_eq!(scheduler.cancel(id).await.unwrap(), CancelOutcome::Cancelled);

        let record = scheduler.get_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.result.is_none() && record.error.is_none());

        let mut saw_request = false;
        while let Ok(event) = events.try_recv() {
            if let ExecutionEvent::CancelRequested { reason, .. } = event {
                assert_eq!(reason, CancelReason::Requested);
                saw_request = true;
            }
        }
        assert!(saw_request);
        assert_eq!(scheduler.get_statistics().await.unwrap().gates[&ExecutionCategory::Task].in_flight, 0);
    }

    #[tokio::test]
    async fn unknown_execution_is_not_found() {
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .build()
            .unwrap();
        let id = Uuid::new_v4();
        assert_eq!(scheduler.cancel(id).await.unwrap(), CancelOutcome::NotFound);
        assert!(scheduler.get_status(id).await.unwrap().is_none());
        assert!(scheduler.wait_for_completion(id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn statistics_come_from_gate_and_table() {
        let release = Arc::new(AtomicBool::new(false));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release.clone(), true))
            .build()
            .unwrap();

        let first = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        let second = scheduler.submit(SubmitRequest::task(2)).await.unwrap();

        let stats = scheduler.get_statistics().await.unwrap();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.by_status[&ExecutionStatus::Running], 1);
        assert_eq!(stats.by_status[&ExecutionStatus::Queued], 1);
        assert_eq!(stats.by_category[&ExecutionCategory::Task], 2);
        assert_eq!(
            stats.gates[&ExecutionCategory::Task],
            GateSnapshot {
                capacity: Some(1),
                in_flight: 1,
                queued: 1
            }
        );
        assert_eq!(stats.gates[&ExecutionCategory::Agent].capacity, None);

        release.store(true, Ordering::SeqCst);
        wait_done(&scheduler, first).await;
        wait_done(&scheduler, second).await;
        let stats = scheduler.get_statistics().await.unwrap();
        assert_eq!(stats.by_status[&ExecutionStatus::Completed], 2);
        assert_eq!(stats.gates[&ExecutionCategory::Task].in_flight, 0);
    }

    /// Last-in-first-out promotion.
    #[derive(Default)]
    struct StackQueue(Vec<Uuid>);

    impl WaitQueue for StackQueue {
        fn push(&mut self, id: Uuid) {
            self.0.push(id);
        }
        fn pop(&mut self) -> Option<Uuid> {
            self.0.pop()
        }
        fn remove(&mut self, id: Uuid) -> bool {
            let before = self.0.len();
            self.0.retain(|queued| *queued != id);
            before != self.0.len()
        }
        fn len(&self) -> usize {
            self.0.len()
        }
    }

    #[tokio::test]
    async fn custom_wait_queue_changes_promotion_order() {
        let release = Arc::new(AtomicBool::new(false));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release.clone(), true))
            .wait_queue(ExecutionCategory::Task, Box::new(StackQueue::default()))
            .build()
            .unwrap();

        let running = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        let older = scheduler.submit(SubmitRequest::task(2)).await.unwrap();
        let newer = scheduler.submit(SubmitRequest::task(3)).await.unwrap();

        assert!(scheduler.cancel(running).await.unwrap().is_cancelled());
        assert_eq!(status(&scheduler, newer).await, ExecutionStatus::Running);
        assert_eq!(status(&scheduler, older).await, ExecutionStatus::Queued);

        release.store(true, Ordering::SeqCst);
        wait_done(&scheduler, older).await;
    }

    #[tokio::test]
    async fn default_timeout_applies_when_request_has_none() {
        let release = Arc::new(AtomicBool::new(false));
        let config = SchedulerConfig {
            default_timeout: Some(Duration::from_millis(50)),
            ..test_config()
        };
        let scheduler = ExecutionScheduler::builder(config, catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release, true))
            .build()
            .unwrap();

        let id = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        let record = wait_done(&scheduler, id).await;
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert!(record.cancel_requested);
        assert!(record.logs.iter().any(|l| l.message.starts_with("Timed out")));
    }

    #[tokio::test]
    async fn periodic_sweep_evicts_old_records() {
        let release = Arc::new(AtomicBool::new(true));
        let config = SchedulerConfig {
            retention: Duration::ZERO,
            cleanup_interval: Some(Duration::from_millis(20)),
            ..test_config()
        };
        let scheduler = ExecutionScheduler::builder(config, catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release, true))
            .build()
            .unwrap();

        let id = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        wait_done(&scheduler, id).await;

        tokio::time::timeout(Duration::from_secs(5), async {
            while scheduler.get_status(id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("sweep never ran");
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_and_closes() {
        let release = Arc::new(AtomicBool::new(false));
        let scheduler = ExecutionScheduler::builder(test_config(), catalog().await)
            .work_unit(ExecutionCategory::Task, held_work(release, true))
            .build()
            .unwrap();

        let running = scheduler.submit(SubmitRequest::task(1)).await.unwrap();
        let queued = scheduler.submit(SubmitRequest::task(2)).await.unwrap();
        let mut events = scheduler.subscribe();

        scheduler.shutdown().await.unwrap();

        let mut cancelled = Vec::new();
        let mut shutdown_requests = 0;
        while let Ok(event) = events.try_recv() {
            match event {
                ExecutionEvent::Cancelled { execution_id, .. } => cancelled.push(execution_id),
                ExecutionEvent::CancelRequested { reason, .. } => {
                    assert_eq!(reason, CancelReason::Shutdown);
                    shutdown_requests += 1;
                }
                _ => {}
            }
        }
        assert_eq!(cancelled, vec![queued, running]);
        assert_eq!(shutdown_requests, 1);

        assert!(matches!(
            scheduler.submit(SubmitRequest::task(3)).await,
            Err(ExecutionError::SchedulerClosed)
        ));
        assert!(matches!(
            scheduler.get_status(running).await,
            Err(ExecutionError::SchedulerClosed)
        ));
        assert!(matches!(
            scheduler.shutdown().await,
            Err(ExecutionError::SchedulerClosed)
        ));
    }

    #[tokio::test]
    async fn invalid_config_is_rejected() {
        let config = SchedulerConfig {
            worker_pool_size: 1,
            ..Default::default()
        };
        assert!(
            ExecutionScheduler::builder(config, catalog().await)
                .build()
                .is_err()
        );
    }
}
