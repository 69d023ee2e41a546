//! Execution engine: turns queued executions into playbook runs.
//!
//! - [`catalog`]: resolves a configuration version into ordered steps
//! - [`runner`]: the contract between the controller and whatever executes steps
//! - [`executor`]: [`ShellRunner`], a runner that executes steps as shell commands
//! - [`pool`]: worker tasks that dequeue, drive a run, and record its outcome
//!
//! # Execution flow
//!
//! 1. A worker dequeues an entry together with the cluster lease
//! 2. The execution moves to `running`, the plan is resolved and recorded
//! 3. Runner events update steps; the first failed step halts the run
//! 4. Timeout, cancellation, or forced shutdown stop the runner
//! 5. The terminal state is recorded, then the lease is released

pub mod catalog;
pub mod executor;
pub mod pool;
pub mod runner;

pub use catalog::{PlaybookCatalog, StaticCatalog, StepAction, StepDescriptor};
pub use executor::ShellRunner;
pub use pool::{CancelRegistry, WorkerContext, WorkerPool};
pub use runner::{PlaybookRunner, RunRequest, RunVerdict, RunnerEvent, StepOutcome};
