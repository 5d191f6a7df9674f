//! Execution scheduling: records, admission control, work dispatch,
//! persistence mirroring and the scheduler that ties them together.

pub mod catalog;
pub mod events;
pub mod gate;
pub mod reconciler;
pub mod record;
pub mod runner;
pub mod scheduler;

pub use catalog::{InMemoryCatalog, TargetCatalog, TargetInfo};
pub use events::{CancelReason, ExecutionEvent};
pub use gate::{ConcurrencyGate, FifoQueue, GateSnapshot, WaitQueue};
pub use reconciler::PersistenceReconciler;
pub use record::{ExecutionCategory, ExecutionRecord, ExecutionStatus, LogEntry, ProgressUpdate};
pub use runner::{ProgressReporter, WorkOutcome, WorkRequest, WorkUnit, WorkUnitRunner, work_fn};
pub use scheduler::{
    CancelOutcome, ExecutionScheduler, ExecutionStatistics, SchedulerBuilder, SubmitRequest,
};
