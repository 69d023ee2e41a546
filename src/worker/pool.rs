use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{LcmError, Result};
use crate::facts::{FactScope, FactStore};
use crate::scheduler::configuration::ConfigurationStore;
use crate::scheduler::execution::{
    ExecutionFailure, ExecutionState, FailureReason, StepFailureKind, StepState,
};
use crate::scheduler::ledger::ExecutionLedger;
use crate::scheduler::lock::{ClusterLease, ClusterLockManager};
use crate::scheduler::queue::{ExecutionQueue, QueuedEntry};
use crate::worker::catalog::PlaybookCatalog;
use crate::worker::runner::{PlaybookRunner, RunRequest, RunVerdict, RunnerEvent, StepOutcome};

const EVENT_BUFFER: usize = 64;
const FAILURE_TAIL_LINES: usize = 20;

/// Per-execution cancellation tokens, created at admission.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    tokens: Mutex<HashMap<Uuid, CancellationToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: Uuid) -> CancellationToken {
        self.lock()
            .entry(id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    pub fn get(&self, id: Uuid) -> Option<CancellationToken> {
        self.lock().get(&id).cloned()
    }

    /// Cancel the token of `id`. Returns false if none is registered.
    pub fn cancel(&self, id: Uuid) -> bool {
        match self.lock().get(&id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn remove(&self, id: Uuid) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, CancellationToken>> {
        self.tokens.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Shared state every worker reads from.
pub struct WorkerContext {
    pub config: ControllerConfig,
    pub configurations: Arc<ConfigurationStore>,
    pub ledger: Arc<ExecutionLedger>,
    pub queue: Arc<ExecutionQueue>,
    pub locks: Arc<ClusterLockManager>,
    pub facts: Arc<dyn FactStore>,
    pub catalog: Arc<dyn PlaybookCatalog>,
    pub runner: Arc<dyn PlaybookRunner>,
    pub cancels: Arc<CancelRegistry>,
    /// Stop taking new work
    pub stop: CancellationToken,
    /// Terminate in-flight runs as `failed:shutdown`
    pub force: CancellationToken,
}

/// Fixed set of worker tasks pulling from the queue.
pub struct WorkerPool {
    tasks: JoinSet<()>,
    size: usize,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>, size: usize) -> Self {
        let mut tasks = JoinSet::new();
        for worker_id in 0..size {
            let ctx = ctx.clone();
            tasks.spawn(async move { worker_loop(worker_id, ctx).await });
        }
        tracing::info!(workers = size, "Worker pool started");
        Self { tasks, size }
    }

    /// A pool without workers, for draining a controller that never started.
    pub fn empty() -> Self {
        Self {
            tasks: JoinSet::new(),
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Wait for every worker to exit, up to `limit`. Returns true if they all did.
    pub async fn join_within(&mut self, limit: Duration) -> bool {
        let tasks = &mut self.tasks;
        tokio::time::timeout(limit, async {
            while let Some(res) = tasks.join_next().await {
                if let Err(e) = res {
                    if e.is_panic() {
                        tracing::error!(error = %e, "Worker task panicked");
                    }
                }
            }
        })
        .await
        .is_ok()
    }

    /// Abort whatever is still running and wait for the aborts to land.
    pub async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }
}

async fn worker_loop(worker_id: usize, ctx: Arc<WorkerContext>) {
    tracing::debug!(worker_id, "Worker started");
    while let Some((entry, lease)) = ctx.queue.dequeue(&ctx.locks, &ctx.stop).await {
        run_execution(&ctx, worker_id, entry, lease).await;
    }
    tracing::debug!(worker_id, "Worker stopped");
}

async fn run_execution(ctx: &WorkerContext, worker_id: usize, entry: QueuedEntry, lease: ClusterLease) {
    let id = entry.execution_id;
    tracing::info!(
        worker_id,
        execution_id = %id,
        cluster_id = %entry.cluster_id,
        "Execution dequeued"
    );

    let cancel = ctx.cancels.register(id);
    if let Err(e) = drive(ctx, id, &cancel).await {
        tracing::error!(execution_id = %id, error = %e, "Execution aborted by controller error");
        let failure = ExecutionFailure {
            reason: FailureReason::Runner,
            step_index: None,
            message: e.to_string(),
        };
        if let Err(e) = ctx
            .ledger
            .finish(
                id,
                ExecutionState::Failed(FailureReason::Runner),
                Some(failure),
                StepFailureKind::Command,
            )
            .await
        {
            tracing::warn!(execution_id = %id, error = %e, "Could not record execution failure");
        }
    }
    ctx.cancels.remove(id);

    if let Err(e) = lease.release() {
        tracing::warn!(execution_id = %id, error = %e, "Cluster lock release failed");
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Canceled,
    Timeout,
    Shutdown,
}

async fn drive(ctx: &WorkerContext, id: Uuid, cancel: &CancellationToken) -> Result<()> {
    let exec = ctx.ledger.mark_running(id).await?;

    if cancel.is_cancelled() || exec.cancellation_requested {
        ctx.ledger
            .finish(id, ExecutionState::Canceled, None, StepFailureKind::Canceled)
            .await?;
        return Ok(());
    }

    let configuration = ctx
        .configurations
        .version(exec.configuration_id, exec.configuration_version)
        .await
        .ok_or_else(|| {
            LcmError::ConfigurationNotFound(format!(
                "{} v{}",
                exec.configuration_id, exec.configuration_version
            ))
        })?;

    let steps = match ctx.catalog.resolve(&configuration) {
        Ok(steps) => steps,
        Err(e) => {
            tracing::warn!(execution_id = %id, error = %e, "Playbook resolution failed");
            let failure = ExecutionFailure {
                reason: FailureReason::Runner,
                step_index: None,
                message: e.to_string(),
            };
            ctx.ledger
                .finish(
                    id,
                    ExecutionState::Failed(FailureReason::Runner),
                    Some(failure),
                    StepFailureKind::Command,
                )
                .await?;
            return Ok(());
        }
    };
    ctx.ledger
        .set_plan(id, steps.iter().map(|s| s.name.clone()).collect())
        .await?;

    // A timeout too large to represent means no deadline
    let deadline = Instant::now().checked_add(exec.timeout);
    if deadline.is_none() {
        tracing::warn!(execution_id = %id, timeout = ?exec.timeout, "Timeout out of range, running without deadline");
    }
    let run_token = cancel.child_token();
    let (tx, mut rx) = mpsc::channel(EVENT_BUFFER);
    let request = RunRequest {
        execution_id: id,
        cluster_id: configuration.cluster_id.clone(),
        hosts: configuration.hosts.clone(),
        steps,
        parameters: configuration.parameters.clone(),
        facts: FactScope::new(ctx.facts.clone(), &configuration.cluster_id, id),
        cancel: run_token.clone(),
    };
    let runner = ctx.runner.clone();
    let mut handle = tokio::spawn(async move { runner.run(request, tx).await });

    let mut verdict: Option<RunVerdict> = None;
    let mut events_open = true;
    let mut interrupt: Option<Interrupt> = None;
    // Once a step failed the runner has `runner_kill_grace` to wind down
    let mut halting = false;
    let mut halt_deadline: Option<Instant> = None;

    while events_open || verdict.is_none() {
        tokio::select! {
            event = rx.recv(), if events_open => match event {
                Some(event) => {
                    if apply_event(ctx, id, event, &run_token).await && !halting {
                        halting = true;
                        halt_deadline = Instant::now().checked_add(ctx.config.runner_kill_grace);
                    }
                }
                None => events_open = false,
            },
            joined = &mut handle, if verdict.is_none() => {
                verdict = Some(joined.unwrap_or_else(|e| {
                    tracing::error!(execution_id = %id, error = %e, "Runner task failed");
                    RunVerdict::Failed
                }));
            }
            _ = tokio::time::sleep_until(halt_deadline.unwrap_or_else(Instant::now)), if halt_deadline.is_some() && verdict.is_none() => {
                tracing::warn!(execution_id = %id, "Runner kept going after a failed step, aborting");
                handle.abort();
                verdict = Some(RunVerdict::Failed);
                break;
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                interrupt = Some(Interrupt::Timeout);
                break;
            }
            _ = ctx.force.cancelled() => {
                interrupt = Some(Interrupt::Shutdown);
                break;
            }
            _ = cancel.cancelled() => {
                interrupt = Some(Interrupt::Canceled);
                break;
            }
        }
    }

    if let Some(interrupt) = interrupt {
        run_token.cancel();
        tracing::info!(execution_id = %id, ?interrupt, "Stopping runner");
        if verdict.is_none() {
            // Events after this point are dropped: the interrupt decides the step outcome
            drop(rx);
            if tokio::time::timeout(ctx.config.runner_kill_grace, &mut handle)
                .await
                .is_err()
            {
                tracing::warn!(execution_id = %id, "Runner ignored cancellation, aborting");
                handle.abort();
            }
        }
    }

    if interrupt.is_none() && cancel.is_cancelled() {
        interrupt = Some(Interrupt::Canceled);
    }
    conclude(ctx, id, interrupt, verdict).await
}

/// Record one runner event. Returns true when it recorded a failed step.
async fn apply_event(
    ctx: &WorkerContext,
    id: Uuid,
    event: RunnerEvent,
    run_token: &CancellationToken,
) -> bool {
    let failed = matches!(
        event,
        RunnerEvent::StepFinished {
            outcome: StepOutcome::Failed { .. },
            ..
        }
    );
    let result = match &event {
        RunnerEvent::StepStarted { index } => ctx.ledger.step_started(id, *index).await.map(|_| ()),
        RunnerEvent::StepOutput { index, chunk } => {
            ctx.ledger.step_output(id, *index, chunk).await.map(|_| ())
        }
        RunnerEvent::StepSkipped { index } => ctx.ledger.step_skipped(id, *index).await.map(|_| ()),
        RunnerEvent::StepFinished { index, outcome } => match outcome {
            StepOutcome::Success => ctx.ledger.step_succeeded(id, *index).await.map(|_| ()),
            StepOutcome::Failed { kind, message } => {
                let recorded = ctx.ledger.step_failed(id, *index, *kind, message).await;
                // First failure halts the run
                run_token.cancel();
                tracing::warn!(execution_id = %id, step = index, kind = %kind, "Step failed");
                recorded.map(|_| ())
            }
        },
    };

    match result {
        Ok(()) => failed,
        Err(e) => {
            tracing::warn!(execution_id = %id, ?event, error = %e, "Ignoring runner event");
            false
        }
    }
}

async fn conclude(
    ctx: &WorkerContext,
    id: Uuid,
    interrupt: Option<Interrupt>,
    verdict: Option<RunVerdict>,
) -> Result<()> {
    let exec = ctx.ledger.get(id).await.ok_or(LcmError::ExecutionNotFound(id))?;
    let running_index = exec.running_step().map(|s| s.index);

    // A step failed only because the run was being stopped is not a step failure
    let failed_step = exec
        .steps
        .iter()
        .find(|s| s.state == StepState::Failed && s.failure != Some(StepFailureKind::Canceled));

    let (state, failure, interrupted) = match (interrupt, failed_step) {
        // A step that failed before the interrupt keeps its diagnosis
        (_, Some(step)) => {
            let kind = step.failure.unwrap_or(StepFailureKind::Command);
            let reason = kind.execution_reason();
            (
                ExecutionState::Failed(reason),
                Some(ExecutionFailure {
                    reason,
                    step_index: Some(step.index),
                    message: LcmError::StepFailure {
                        index: step.index,
                        message: tail_lines(&step.output, FAILURE_TAIL_LINES),
                    }
                    .to_string(),
                }),
                StepFailureKind::Canceled,
            )
        }
        (Some(Interrupt::Timeout), _) => (
            ExecutionState::Failed(FailureReason::Timeout),
            Some(ExecutionFailure {
                reason: FailureReason::Timeout,
                step_index: running_index,
                message: LcmError::Timeout(id).to_string(),
            }),
            StepFailureKind::Timeout,
        ),
        (Some(Interrupt::Shutdown), _) => (
            ExecutionState::Failed(FailureReason::Shutdown),
            Some(ExecutionFailure {
                reason: FailureReason::Shutdown,
                step_index: running_index,
                message: LcmError::ShutdownInterrupted(id).to_string(),
            }),
            StepFailureKind::Shutdown,
        ),
        (Some(Interrupt::Canceled), None) => {
            (ExecutionState::Canceled, None, StepFailureKind::Canceled)
        }
        (None, None) => match verdict {
            Some(RunVerdict::Success) if running_index.is_none() => {
                (ExecutionState::Success, None, StepFailureKind::Command)
            }
            other => (
                ExecutionState::Failed(FailureReason::Runner),
                Some(ExecutionFailure {
                    reason: FailureReason::Runner,
                    step_index: running_index,
                    message: format!("runner ended with {:?} and no failed step", other),
                }),
                StepFailureKind::Command,
            ),
        },
    };

    ctx.ledger.finish(id, state, failure, interrupted).await?;
    Ok(())
}

fn tail_lines(output: &str, lines: usize) -> String {
    let all: Vec<&str> = output.lines().collect();
    let start = all.len().saturating_sub(lines);
    all[start..].join("\n")
}
