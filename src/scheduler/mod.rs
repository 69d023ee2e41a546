//! Admission, mutual exclusion, and the record of every execution.
//!
//! - [`configuration`]: versioned playbook configurations
//! - [`execution`]: execution and step state machines
//! - [`ledger`]: execution records and terminal-state waits
//! - [`queue`]: bounded FIFO admission with per-cluster ordering
//! - [`lock`]: one active execution per cluster

pub mod configuration;
pub mod execution;
pub mod ledger;
pub mod lock;
pub mod queue;

pub use configuration::{Configuration, ConfigurationEdit, ConfigurationStore, NewConfiguration};
pub use execution::{
    Execution, ExecutionFailure, ExecutionState, FailureReason, Step, StepFailureKind, StepState,
};
pub use ledger::{ExecutionFilter, ExecutionLedger};
pub use lock::{ClusterLease, ClusterLockManager, LockAcquisition, LockHolder, LockStats};
pub use queue::{ExecutionQueue, QueuedEntry};
