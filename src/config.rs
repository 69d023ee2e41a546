use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

const DEFAULT_QUEUE_CAPACITY: usize = 64;

/// What happens to queued-but-not-started executions on shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueuedPolicy {
    /// Leave them `queued`; they are re-admitted when a snapshot is restored.
    Retain,
    /// Mark them `failed:shutdown`.
    Fail,
}

/// Configuration for the shell-backed playbook runner.
///
/// Every step command runs as `<shell> -c <command>`.
#[derive(Debug, Clone)]
pub struct ShellConfig {
    /// Shell used to interpret step commands
    pub shell: String,
    /// Working directory for step commands (inherits the controller's if unset)
    pub working_dir: Option<PathBuf>,
    /// Stdout line prefix that marks a fact record (`<marker> key=<json>`)
    pub fact_marker: String,
}

impl Default for ShellConfig {
    fn default() -> Self {
        Self {
            shell: "sh".to_string(),
            working_dir: None,
            fact_marker: "LCM_FACT".to_string(),
        }
    }
}

/// Process controls for the execution controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Number of concurrent workers. 0 derives the count from available CPUs.
    pub workers: usize,
    /// Default maximum duration of a single execution.
    pub execution_timeout: Duration,
    /// How long running executions may take to finish after a shutdown signal.
    pub shutdown_grace: Duration,
    /// How long a runner may take to confirm termination after being cancelled
    /// before its task is aborted.
    pub runner_kill_grace: Duration,
    /// Maximum number of queued-but-not-started executions.
    pub queue_capacity: usize,
    /// Age after which terminal executions may be purged by the retention sweep.
    pub retention: Duration,
    pub queued_policy: QueuedPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: 0,
            execution_timeout: Duration::from_secs(60 * 60),
            shutdown_grace: Duration::from_secs(30),
            runner_kill_grace: Duration::from_secs(5),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            retention: Duration::from_secs(90 * 24 * 60 * 60),
            queued_policy: QueuedPolicy::Retain,
        }
    }
}

impl ControllerConfig {
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub fn with_runner_kill_grace(mut self, grace: Duration) -> Self {
        self.runner_kill_grace = grace;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_retention(mut self, retention: Duration) -> Self {
        self.retention = retention;
        self
    }

    /// Retention in whole days. Saturates instead of overflowing.
    pub fn with_retention_days(self, days: u64) -> Self {
        self.with_retention(Duration::from_secs(days.saturating_mul(24 * 60 * 60)))
    }

    pub fn with_queued_policy(mut self, policy: QueuedPolicy) -> Self {
        self.queued_policy = policy;
        self
    }

    /// Worker count after resolving `0` to the number of available CPUs.
    pub fn effective_workers(&self) -> usize {
        if self.workers > 0 {
            return self.workers;
        }
        std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)
    }
}
