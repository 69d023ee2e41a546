use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::ControllerConfig;
use crate::error::{LcmError, Result};
use crate::facts::FactStore;
use crate::scheduler::{
    ClusterLockManager, Configuration, ConfigurationStore, Execution, ExecutionFailure,
    ExecutionFilter, ExecutionLedger, ExecutionQueue, ExecutionState, FailureReason, LockHolder,
    Step, StepFailureKind,
};
use crate::shutdown::{ShutdownCoordinator, ShutdownReport};
use crate::worker::{CancelRegistry, PlaybookCatalog, PlaybookRunner, WorkerContext, WorkerPool};

/// A request to run one configuration version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub configuration_id: Uuid,
    /// Defaults to the latest version
    #[serde(default)]
    pub version: Option<u64>,
    pub initiator: String,
    /// Defaults to the controller's execution timeout
    #[serde(default)]
    pub timeout: Option<Duration>,
}

impl SubmitRequest {
    pub fn latest(configuration_id: Uuid, initiator: &str) -> Self {
        Self {
            configuration_id,
            version: None,
            initiator: initiator.to_string(),
            timeout: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Durable state of a controller: configuration history and execution records.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ControllerSnapshot {
    pub configurations: Vec<Configuration>,
    pub executions: Vec<Execution>,
}

impl ControllerSnapshot {
    pub fn load(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let data = std::fs::read(path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn save(&self, path: impl AsRef<std::path::Path>) -> Result<()> {
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Idle,
    Running,
    Stopped,
}

/// Lifecycle execution controller.
///
/// Owns the admission queue, the per-cluster locks, the execution ledger and
/// the worker pool. Submissions are accepted before [`Controller::start`] and
/// wait in the queue until workers exist.
pub struct Controller {
    ctx: Arc<WorkerContext>,
    pool: tokio::sync::Mutex<Option<WorkerPool>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Controller {
    pub fn new(
        config: ControllerConfig,
        catalog: Arc<dyn PlaybookCatalog>,
        runner: Arc<dyn PlaybookRunner>,
        facts: Arc<dyn FactStore>,
    ) -> Self {
        Self::with_state(
            config,
            catalog,
            runner,
            facts,
            ConfigurationStore::new(),
            ExecutionLedger::new(),
        )
    }

    fn with_state(
        config: ControllerConfig,
        catalog: Arc<dyn PlaybookCatalog>,
        runner: Arc<dyn PlaybookRunner>,
        facts: Arc<dyn FactStore>,
        configurations: ConfigurationStore,
        ledger: ExecutionLedger,
    ) -> Self {
        let ctx = WorkerContext {
            queue: Arc::new(ExecutionQueue::with_capacity(config.queue_capacity)),
            config,
            configurations: Arc::new(configurations),
            ledger: Arc::new(ledger),
            locks: Arc::new(ClusterLockManager::new()),
            facts,
            catalog,
            runner,
            cancels: Arc::new(CancelRegistry::new()),
            stop: CancellationToken::new(),
            force: CancellationToken::new(),
        };
        Self {
            ctx: Arc::new(ctx),
            pool: tokio::sync::Mutex::new(None),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    /// Rebuild a controller from a snapshot taken by [`Controller::snapshot`].
    ///
    /// Queued executions are admitted again in submission order. Executions
    /// recorded as running lost their worker and become `failed:shutdown`.
    pub async fn restore(
        config: ControllerConfig,
        catalog: Arc<dyn PlaybookCatalog>,
        runner: Arc<dyn PlaybookRunner>,
        facts: Arc<dyn FactStore>,
        snapshot: ControllerSnapshot,
    ) -> Result<Self> {
        let controller = Self::with_state(
            config,
            catalog,
            runner,
            facts,
            ConfigurationStore::from_versions(snapshot.configurations),
            ExecutionLedger::new(),
        );

        let mut executions = snapshot.executions;
        executions.sort_by_key(|e| e.submitted_at);

        let ctx = &controller.ctx;
        let mut requeued = 0usize;
        let mut interrupted = 0usize;
        for exec in executions {
            let id = exec.id;
            match exec.state {
                ExecutionState::Queued => {
                    ctx.queue.restore(id, &exec.cluster_id);
                    ctx.cancels.register(id);
                    ctx.ledger.insert_record(exec).await;
                    requeued += 1;
                }
                ExecutionState::Running => {
                    let step_index = exec.running_step().map(|s| s.index);
                    ctx.ledger.insert_record(exec).await;
                    let failure = ExecutionFailure {
                        reason: FailureReason::Shutdown,
                        step_index,
                        message: "controller stopped while the execution was running".to_string(),
                    };
                    ctx.ledger
                        .finish(
                            id,
                            ExecutionState::Failed(FailureReason::Shutdown),
                            Some(failure),
                            StepFailureKind::Shutdown,
                        )
                        .await?;
                    interrupted += 1;
                }
                _ => ctx.ledger.insert_record(exec).await,
            }
        }

        tracing::info!(requeued, interrupted, "Controller state restored");
        Ok(controller)
    }

    /// Spawn the worker pool.
    pub async fn start(&self) -> Result<()> {
        let mut pool = self.pool.lock().await;
        {
            let mut lifecycle = self.lifecycle();
            if *lifecycle != Lifecycle::Idle {
                return Err(LcmError::AlreadyStarted);
            }
            *lifecycle = Lifecycle::Running;
        }

        let workers = self.ctx.config.effective_workers();
        *pool = Some(WorkerPool::spawn(self.ctx.clone(), workers));
        tracing::info!(
            workers,
            queue_capacity = self.ctx.queue.capacity(),
            "Controller started"
        );
        Ok(())
    }

    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.ctx.config
    }

    pub fn configurations(&self) -> &ConfigurationStore {
        &self.ctx.configurations
    }

    pub fn facts(&self) -> &Arc<dyn FactStore> {
        &self.ctx.facts
    }

    /// Admit a new execution of a configuration version.
    ///
    /// Fails with `AdmissionRejected` when the queue is full or shutting
    /// down; a rejected submission leaves no execution behind.
    pub async fn submit(&self, request: SubmitRequest) -> Result<Execution> {
        let ctx = &self.ctx;
        let configuration = match request.version {
            Some(v) => ctx.configurations.version(request.configuration_id, v).await,
            None => ctx.configurations.latest(request.configuration_id).await,
        }
        .ok_or_else(|| {
            LcmError::ConfigurationNotFound(match request.version {
                Some(v) => format!("{} v{}", request.configuration_id, v),
                None => request.configuration_id.to_string(),
            })
        })?;
        let deleted = configuration.is_deleted()
            || ctx
                .configurations
                .latest(configuration.id)
                .await
                .is_some_and(|latest| latest.is_deleted());
        if deleted {
            return Err(LcmError::ConfigurationDeleted(configuration.id));
        }

        let exec = Execution::new(
            configuration.id,
            configuration.version,
            configuration.cluster_id.clone(),
            configuration.playbook.clone(),
            request.initiator,
            request.timeout.unwrap_or(ctx.config.execution_timeout),
        );
        let id = exec.id;

        // Record first so a worker that dequeues immediately finds it
        ctx.ledger.insert_queued(exec.clone()).await?;
        ctx.cancels.register(id);
        if let Err(e) = ctx.queue.try_enqueue(id, &configuration.cluster_id) {
            ctx.ledger.remove(id).await;
            ctx.cancels.remove(id);
            tracing::warn!(
                configuration_id = %configuration.id,
                cluster_id = %configuration.cluster_id,
                error = %e,
                "Submission rejected"
            );
            return Err(e);
        }

        tracing::info!(
            execution_id = %id,
            configuration_id = %configuration.id,
            version = configuration.version,
            cluster_id = %configuration.cluster_id,
            initiator = %exec.initiator,
            "Execution queued"
        );
        Ok(exec)
    }

    /// Request cancellation. A queued execution is canceled at once; a running
    /// one is canceled when its runner confirms termination.
    pub async fn cancel(&self, id: Uuid) -> Result<Execution> {
        let ctx = &self.ctx;
        let exec = ctx.ledger.request_cancel(id).await?;

        if exec.state == ExecutionState::Queued && ctx.queue.remove(id) {
            ctx.cancels.remove(id);
            let exec = ctx
                .ledger
                .finish(id, ExecutionState::Canceled, None, StepFailureKind::Canceled)
                .await?;
            tracing::info!(execution_id = %id, "Queued execution canceled");
            return Ok(exec);
        }

        ctx.cancels.cancel(id);
        tracing::info!(execution_id = %id, "Cancellation requested");
        ctx.ledger.get(id).await.ok_or(LcmError::ExecutionNotFound(id))
    }

    pub async fn execution(&self, id: Uuid) -> Option<Execution> {
        self.ctx.ledger.get(id).await
    }

    pub async fn executions(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        self.ctx.ledger.list(filter).await
    }

    pub async fn steps(&self, id: Uuid) -> Option<Vec<Step>> {
        self.ctx.ledger.steps(id).await
    }

    /// Captured output of an execution, step by step
    pub async fn log(&self, id: Uuid) -> Option<String> {
        self.ctx.ledger.get(id).await.map(|e| e.log())
    }

    pub async fn wait_terminal(&self, id: Uuid) -> Result<Execution> {
        self.ctx.ledger.wait_terminal(id).await
    }

    /// Execution currently holding the lock of `cluster_id`
    pub fn lock_holder(&self, cluster_id: &str) -> Option<LockHolder> {
        self.ctx.locks.holder(cluster_id)
    }

    pub fn locks(&self) -> &Arc<ClusterLockManager> {
        &self.ctx.locks
    }

    pub fn queue_len(&self) -> usize {
        self.ctx.queue.len()
    }

    /// Drop terminal executions older than the retention window.
    pub async fn purge_expired(&self) -> usize {
        self.ctx
            .ledger
            .purge_terminal_older_than(self.ctx.config.retention, Utc::now())
            .await
    }

    pub async fn snapshot(&self) -> ControllerSnapshot {
        ControllerSnapshot {
            configurations: self.ctx.configurations.export().await,
            executions: self.ctx.ledger.list(&ExecutionFilter::default()).await,
        }
    }

    /// Stop admission, drain in-flight executions within the grace window,
    /// and force the rest. Calling it again returns an empty report.
    pub async fn shutdown(&self) -> ShutdownReport {
        let was = {
            let mut lifecycle = self.lifecycle();
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        };
        if was == Lifecycle::Stopped {
            return ShutdownReport {
                graceful: true,
                ..Default::default()
            };
        }

        let mut pool = self.pool.lock().await.take();
        match pool.as_mut() {
            Some(pool) => ShutdownCoordinator::new(&self.ctx).drain(pool).await,
            None => {
                // Never started: nothing is running, only the queued policy applies
                let mut empty = WorkerPool::empty();
                ShutdownCoordinator::new(&self.ctx).drain(&mut empty).await
            }
        }
    }
}
