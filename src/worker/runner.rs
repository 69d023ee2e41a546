use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::facts::FactScope;
use crate::scheduler::execution::StepFailureKind;
use crate::worker::catalog::StepDescriptor;

/// Everything a runner needs to drive one execution.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub execution_id: Uuid,
    pub cluster_id: String,
    pub hosts: Vec<String>,
    pub steps: Vec<StepDescriptor>,
    pub parameters: serde_json::Value,
    pub facts: FactScope,
    /// Cancelled when the run must stop: user cancel, timeout, shutdown, or
    /// a failed step. Runners check it between steps and abort the in-flight one.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StepOutcome {
    Success,
    Failed {
        kind: StepFailureKind,
        message: String,
    },
}

/// Progress reported by a runner. The controller records steps only from
/// these events.
#[derive(Debug, Clone, PartialEq)]
pub enum RunnerEvent {
    StepStarted { index: u32 },
    StepOutput { index: u32, chunk: String },
    StepFinished { index: u32, outcome: StepOutcome },
    StepSkipped { index: u32 },
}

/// Final word of a runner on the whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunVerdict {
    Success,
    Failed,
    Canceled,
}

/// External collaborator that executes resolved steps against real hosts.
#[async_trait]
pub trait PlaybookRunner: Send + Sync {
    async fn run(&self, request: RunRequest, events: mpsc::Sender<RunnerEvent>) -> RunVerdict;
}

/// Send an event, ignoring a controller that stopped listening.
pub async fn emit(events: &mpsc::Sender<RunnerEvent>, event: RunnerEvent) {
    if events.send(event).await.is_err() {
        tracing::debug!("Runner event dropped, controller no longer listening");
    }
}
