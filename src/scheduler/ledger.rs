use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{watch, RwLock};
use uuid::Uuid;

use crate::error::{LcmError, Result};
use crate::scheduler::execution::{
    Execution, ExecutionFailure, ExecutionState, Step, StepFailureKind,
};

/// Filter for listing executions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionFilter {
    pub cluster_id: Option<String>,
    pub state: Option<ExecutionState>,
    pub configuration_id: Option<Uuid>,
}

impl ExecutionFilter {
    fn matches(&self, exec: &Execution) -> bool {
        self.cluster_id
            .as_ref()
            .is_none_or(|c| &exec.cluster_id == c)
            && self.state.is_none_or(|s| exec.state == s)
            && self
                .configuration_id
                .is_none_or(|id| exec.configuration_id == id)
    }
}

/// Execution records, retained for audit until the retention sweep purges them.
///
/// Every mutation bumps a `watch` revision so callers can wait for state
/// changes without polling.
#[derive(Debug)]
pub struct ExecutionLedger {
    executions: RwLock<HashMap<Uuid, Execution>>,
    revision: watch::Sender<u64>,
}

impl Default for ExecutionLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionLedger {
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            executions: RwLock::new(HashMap::new()),
            revision,
        }
    }

    fn bump(&self) {
        self.revision.send_modify(|r| *r += 1);
    }

    /// Subscribe to change notifications
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.revision.subscribe()
    }

    /// Store a freshly submitted execution. It must be `queued`.
    pub async fn insert_queued(&self, exec: Execution) -> Result<()> {
        if exec.state != ExecutionState::Queued {
            return Err(LcmError::InvalidTransition(format!(
                "execution {} inserted as {}",
                exec.id, exec.state
            )));
        }
        self.executions.write().await.insert(exec.id, exec);
        self.bump();
        Ok(())
    }

    /// Store a record as-is (snapshot restore).
    pub async fn insert_record(&self, exec: Execution) {
        self.executions.write().await.insert(exec.id, exec);
        self.bump();
    }

    pub async fn remove(&self, id: Uuid) -> Option<Execution> {
        let removed = self.executions.write().await.remove(&id);
        if removed.is_some() {
            self.bump();
        }
        removed
    }

    /// Get an execution by ID
    pub async fn get(&self, id: Uuid) -> Option<Execution> {
        self.executions.read().await.get(&id).cloned()
    }

    /// Ordered steps of an execution
    pub async fn steps(&self, id: Uuid) -> Option<Vec<Step>> {
        self.executions
            .read()
            .await
            .get(&id)
            .map(|e| e.steps.clone())
    }

    /// Matching executions sorted by submission time
    pub async fn list(&self, filter: &ExecutionFilter) -> Vec<Execution> {
        let mut list: Vec<Execution> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        list.sort_by_key(|e| e.submitted_at);
        list
    }

    /// Apply `f` to one execution under the write lock and return the result.
    pub async fn update<F>(&self, id: Uuid, f: F) -> Result<Execution>
    where
        F: FnOnce(&mut Execution) -> Result<()>,
    {
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(&id)
            .ok_or(LcmError::ExecutionNotFound(id))?;
        f(exec)?;
        let snapshot = exec.clone();
        drop(executions);
        self.bump();
        Ok(snapshot)
    }

    pub async fn mark_running(&self, id: Uuid) -> Result<Execution> {
        self.update(id, |e| e.mark_running()).await
    }

    pub async fn set_plan(&self, id: Uuid, names: Vec<String>) -> Result<Execution> {
        self.update(id, |e| e.set_plan(names)).await
    }

    pub async fn step_started(&self, id: Uuid, index: u32) -> Result<Execution> {
        self.update(id, |e| e.step_started(index)).await
    }

    pub async fn step_output(&self, id: Uuid, index: u32, chunk: &str) -> Result<Execution> {
        self.update(id, |e| e.step_output(index, chunk)).await
    }

    pub async fn step_succeeded(&self, id: Uuid, index: u32) -> Result<Execution> {
        self.update(id, |e| e.step_succeeded(index)).await
    }

    pub async fn step_failed(
        &self,
        id: Uuid,
        index: u32,
        kind: StepFailureKind,
        message: &str,
    ) -> Result<Execution> {
        self.update(id, |e| e.step_failed(index, kind, message))
            .await
    }

    pub async fn step_skipped(&self, id: Uuid, index: u32) -> Result<Execution> {
        self.update(id, |e| e.step_skipped(index)).await
    }

    /// Set the cancellation flag. Terminal executions refuse it.
    pub async fn request_cancel(&self, id: Uuid) -> Result<Execution> {
        self.update(id, |e| {
            if e.state.is_terminal() {
                return Err(LcmError::AlreadyTerminal(e.id));
            }
            e.cancellation_requested = true;
            Ok(())
        })
        .await
    }

    pub async fn finish(
        &self,
        id: Uuid,
        state: ExecutionState,
        failure: Option<ExecutionFailure>,
        interrupted: StepFailureKind,
    ) -> Result<Execution> {
        let exec = self
            .update(id, |e| e.finish(state, failure, interrupted))
            .await?;
        tracing::info!(
            execution_id = %id,
            cluster_id = %exec.cluster_id,
            state = %exec.state,
            "Execution finished"
        );
        Ok(exec)
    }

    /// Wait until the execution reaches a terminal state.
    pub async fn wait_terminal(&self, id: Uuid) -> Result<Execution> {
        let mut rx = self.subscribe();
        loop {
            let exec = self.get(id).await.ok_or(LcmError::ExecutionNotFound(id))?;
            if exec.state.is_terminal() {
                return Ok(exec);
            }
            if rx.changed().await.is_err() {
                return Err(LcmError::ExecutionNotFound(id));
            }
        }
    }

    /// Drop terminal executions that finished more than `retention` before `now`.
    /// Returns the number of records removed.
    pub async fn purge_terminal_older_than(
        &self,
        retention: Duration,
        now: DateTime<Utc>,
    ) -> usize {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(retention) else {
            return 0;
        };
        let mut executions = self.executions.write().await;
        let before = executions.len();
        executions.retain(|_, e| {
            !(e.state.is_terminal() && e.finished_at.is_some_and(|f| f < cutoff))
        });
        let removed = before - executions.len();
        drop(executions);
        if removed > 0 {
            self.bump();
            tracing::info!(removed, "Purged terminal executions past retention");
        }
        removed
    }

    pub async fn len(&self) -> usize {
        self.executions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.executions.read().await.is_empty()
    }
}
