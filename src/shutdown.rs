use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::QueuedPolicy;
use crate::scheduler::execution::{ExecutionFailure, ExecutionState, FailureReason, StepFailureKind};
use crate::scheduler::ledger::ExecutionFilter;
use crate::worker::{WorkerContext, WorkerPool};

/// Extra time granted to workers after a forced stop, on top of the runner
/// kill grace, to record outcomes and release locks.
const FORCE_MARGIN: Duration = Duration::from_secs(1);

/// Install a shutdown handler that listens for SIGTERM and SIGINT.
///
/// Returns a `CancellationToken` that is cancelled when either signal is received.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let token_clone = token.clone();

    tokio::spawn(async move {
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(term), Ok(int)) => (term, int),
                (Err(e), _) | (_, Err(e)) => {
                    tracing::error!(error = %e, "Failed to install signal handlers");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating graceful shutdown");
            }
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating graceful shutdown");
            }
        }

        token_clone.cancel();
    });

    token
}

/// What a drain did to every execution that was alive when it began.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ShutdownReport {
    /// Running executions that reached a terminal state on their own
    pub completed: Vec<Uuid>,
    /// Running executions terminated as `failed:shutdown`
    pub forced: Vec<Uuid>,
    /// Queued executions kept for the next start
    pub queued_retained: Vec<Uuid>,
    /// Queued executions failed because the controller stopped
    pub queued_failed: Vec<Uuid>,
    /// Locks still held after the workers exited and released here
    pub locks_reclaimed: usize,
    /// True when every in-flight execution finished inside the grace window
    pub graceful: bool,
    pub elapsed: Duration,
}

/// Drives the ordered stop of a running controller.
///
/// 1. Close admission and stop dequeuing
/// 2. Wait up to the grace window for in-flight executions
/// 3. Force the rest to `failed:shutdown`
/// 4. Apply the queued policy and make sure no lock survives
pub struct ShutdownCoordinator<'a> {
    ctx: &'a WorkerContext,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(ctx: &'a WorkerContext) -> Self {
        Self { ctx }
    }

    pub async fn drain(&self, pool: &mut WorkerPool) -> ShutdownReport {
        let ctx = self.ctx;
        let started = Instant::now();
        let grace = ctx.config.shutdown_grace;

        ctx.queue.close();
        ctx.stop.cancel();

        let alive: Vec<Uuid> = ctx
            .ledger
            .list(&ExecutionFilter::default())
            .await
            .into_iter()
            .filter(|e| !e.state.is_terminal())
            .map(|e| e.id)
            .collect();
        tracing::info!(
            alive = alive.len(),
            queued = ctx.queue.len(),
            grace = ?grace,
            "Draining controller"
        );

        let graceful = pool.join_within(grace).await;
        if !graceful {
            tracing::warn!("Shutdown grace elapsed, terminating in-flight executions");
            ctx.force.cancel();
            if !pool
                .join_within(ctx.config.runner_kill_grace + FORCE_MARGIN)
                .await
            {
                tracing::warn!("Workers did not exit after forced stop, aborting them");
                pool.abort().await;
            }
        }

        let mut report = ShutdownReport {
            graceful,
            ..Default::default()
        };

        // Executions whose worker was aborted are still marked running
        for exec in ctx
            .ledger
            .list(&ExecutionFilter {
                state: Some(ExecutionState::Running),
                ..Default::default()
            })
            .await
        {
            let failure = ExecutionFailure {
                reason: FailureReason::Shutdown,
                step_index: exec.running_step().map(|s| s.index),
                message: "worker stopped before the execution finished".to_string(),
            };
            if let Err(e) = ctx
                .ledger
                .finish(
                    exec.id,
                    ExecutionState::Failed(FailureReason::Shutdown),
                    Some(failure),
                    StepFailureKind::Shutdown,
                )
                .await
            {
                tracing::warn!(execution_id = %exec.id, error = %e, "Could not fail orphaned execution");
            }
        }

        let queued: HashSet<Uuid> = match ctx.config.queued_policy {
            QueuedPolicy::Retain => {
                let pending = ctx.queue.pending();
                report.queued_retained = pending.iter().map(|e| e.execution_id).collect();
                report.queued_retained.iter().copied().collect()
            }
            QueuedPolicy::Fail => {
                for entry in ctx.queue.drain_pending() {
                    let failure = ExecutionFailure {
                        reason: FailureReason::Shutdown,
                        step_index: None,
                        message: "controller shut down before the execution started".to_string(),
                    };
                    match ctx
                        .ledger
                        .finish(
                            entry.execution_id,
                            ExecutionState::Failed(FailureReason::Shutdown),
                            Some(failure),
                            StepFailureKind::Shutdown,
                        )
                        .await
                    {
                        Ok(_) => report.queued_failed.push(entry.execution_id),
                        Err(e) => tracing::warn!(
                            execution_id = %entry.execution_id,
                            error = %e,
                            "Could not fail queued execution"
                        ),
                    }
                }
                report.queued_failed.iter().copied().collect()
            }
        };

        for id in alive.into_iter().filter(|id| !queued.contains(id)) {
            match ctx.ledger.get(id).await.map(|e| e.state) {
                Some(ExecutionState::Failed(FailureReason::Shutdown)) => report.forced.push(id),
                Some(state) if state.is_terminal() => report.completed.push(id),
                _ => {}
            }
        }

        for (cluster_id, holder) in ctx.locks.held() {
            tracing::warn!(
                cluster_id = %cluster_id,
                execution_id = %holder.execution_id,
                "Reclaiming cluster lock after shutdown"
            );
            ctx.locks.force_release(&cluster_id);
            report.locks_reclaimed += 1;
        }

        report.elapsed = started.elapsed();
        tracing::info!(
            completed = report.completed.len(),
            forced = report.forced.len(),
            queued_retained = report.queued_retained.len(),
            queued_failed = report.queued_failed.len(),
            elapsed = ?report.elapsed,
            "Controller drained"
        );
        report
    }
}
