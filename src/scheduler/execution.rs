use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{LcmError, Result};

/// Reason tag carried by a failed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// A step reported failure.
    StepFailure,
    /// A step needed a fact that was absent or malformed.
    FactInconsistency,
    /// The run exceeded its allotted duration.
    Timeout,
    /// The run was still active when the shutdown grace window elapsed.
    Shutdown,
    /// The runner failed without attributing it to a step, or the plan
    /// could not be resolved.
    Runner,
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::StepFailure => write!(f, "step"),
            FailureReason::FactInconsistency => write!(f, "fact_inconsistency"),
            FailureReason::Timeout => write!(f, "timeout"),
            FailureReason::Shutdown => write!(f, "shutdown"),
            FailureReason::Runner => write!(f, "runner"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    Queued,
    Running,
    Success,
    Failed(FailureReason),
    Canceled,
}

impl ExecutionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutionState::Success | ExecutionState::Failed(_) | ExecutionState::Canceled
        )
    }
}

impl std::fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionState::Queued => write!(f, "queued"),
            ExecutionState::Running => write!(f, "running"),
            ExecutionState::Success => write!(f, "success"),
            ExecutionState::Failed(reason) => write!(f, "failed:{}", reason),
            ExecutionState::Canceled => write!(f, "canceled"),
        }
    }
}

/// Why a single step failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepFailureKind {
    Command,
    FactInconsistency,
    Canceled,
    Timeout,
    Shutdown,
}

impl std::fmt::Display for StepFailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepFailureKind::Command => write!(f, "command"),
            StepFailureKind::FactInconsistency => write!(f, "fact_inconsistency"),
            StepFailureKind::Canceled => write!(f, "canceled"),
            StepFailureKind::Timeout => write!(f, "timeout"),
            StepFailureKind::Shutdown => write!(f, "shutdown"),
        }
    }
}

impl StepFailureKind {
    /// Execution-level reason for a run halted by this step failure.
    pub fn execution_reason(&self) -> FailureReason {
        match self {
            StepFailureKind::FactInconsistency => FailureReason::FactInconsistency,
            StepFailureKind::Timeout => FailureReason::Timeout,
            StepFailureKind::Shutdown => FailureReason::Shutdown,
            StepFailureKind::Command | StepFailureKind::Canceled => FailureReason::StepFailure,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepState::Success | StepState::Failed | StepState::Skipped
        )
    }

    fn rank(&self) -> u8 {
        match self {
            StepState::Pending => 0,
            StepState::Running => 1,
            StepState::Success | StepState::Failed | StepState::Skipped => 2,
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepState::Pending => write!(f, "pending"),
            StepState::Running => write!(f, "running"),
            StepState::Success => write!(f, "success"),
            StepState::Failed => write!(f, "failed"),
            StepState::Skipped => write!(f, "skipped"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub index: u32,
    pub name: String,
    pub state: StepState,
    pub output: String,
    pub failure: Option<StepFailureKind>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Step {
    pub fn new(index: u32, name: String) -> Self {
        Self {
            index,
            name,
            state: StepState::Pending,
            output: String::new(),
            failure: None,
            started_at: None,
            finished_at: None,
        }
    }

    /// Move to `next`, refusing any regression or any exit from a terminal state.
    pub fn transition(&mut self, next: StepState) -> Result<()> {
        if self.state.is_terminal() || next.rank() <= self.state.rank() {
            return Err(LcmError::InvalidTransition(format!(
                "step {} cannot move from {} to {}",
                self.index, self.state, next
            )));
        }
        let now = Utc::now();
        if next == StepState::Running {
            self.started_at = Some(now);
        }
        if next.is_terminal() {
            self.finished_at = Some(now);
        }
        self.state = next;
        Ok(())
    }
}

/// Diagnosis attached to a failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionFailure {
    pub reason: FailureReason,
    pub step_index: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Execution {
    pub id: Uuid,
    pub configuration_id: Uuid,
    pub configuration_version: u64,
    pub cluster_id: String,
    pub playbook: String,
    pub state: ExecutionState,
    pub steps: Vec<Step>,
    pub initiator: String,
    pub timeout: Duration,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub cancellation_requested: bool,
    pub failure: Option<ExecutionFailure>,
}

impl Execution {
    pub fn new(
        configuration_id: Uuid,
        configuration_version: u64,
        cluster_id: String,
        playbook: String,
        initiator: String,
        timeout: Duration,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            configuration_id,
            configuration_version,
            cluster_id,
            playbook,
            state: ExecutionState::Queued,
            steps: Vec::new(),
            initiator,
            timeout,
            submitted_at: Utc::now(),
            started_at: None,
            finished_at: None,
            cancellation_requested: false,
            failure: None,
        }
    }

    fn ensure_state(&self, expected: ExecutionState, action: &str) -> Result<()> {
        if self.state != expected {
            return Err(LcmError::InvalidTransition(format!(
                "execution {} cannot {} while {}",
                self.id, action, self.state
            )));
        }
        Ok(())
    }

    fn step_mut(&mut self, index: u32) -> Result<&mut Step> {
        let id = self.id;
        self.steps.get_mut(index as usize).ok_or_else(|| {
            LcmError::InvalidTransition(format!("execution {} has no step {}", id, index))
        })
    }

    pub fn mark_running(&mut self) -> Result<()> {
        self.ensure_state(ExecutionState::Queued, "start")?;
        self.state = ExecutionState::Running;
        self.started_at = Some(Utc::now());
        Ok(())
    }

    /// Register the resolved step sequence, all `pending`, indices `0..n`.
    pub fn set_plan(&mut self, names: Vec<String>) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "set its plan")?;
        if !self.steps.is_empty() {
            return Err(LcmError::InvalidTransition(format!(
                "execution {} already has a plan",
                self.id
            )));
        }
        self.steps = names
            .into_iter()
            .enumerate()
            .map(|(i, name)| Step::new(i as u32, name))
            .collect();
        Ok(())
    }

    /// Start step `index`. Earlier steps the runner never started become
    /// `skipped`; an earlier step that is still running is a protocol error.
    pub fn step_started(&mut self, index: u32) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "start a step")?;
        if self.halted() {
            return Err(LcmError::InvalidTransition(format!(
                "execution {} halted after a failed step",
                self.id
            )));
        }
        if let Some(running) = self
            .steps
            .iter()
            .find(|s| s.index < index && s.state == StepState::Running)
        {
            return Err(LcmError::InvalidTransition(format!(
                "step {} started while step {} is still running",
                index, running.index
            )));
        }
        self.step_mut(index)?.transition(StepState::Running)?;
        for step in self.steps.iter_mut().filter(|s| s.index < index) {
            if step.state == StepState::Pending {
                step.transition(StepState::Skipped)?;
            }
        }
        Ok(())
    }

    pub fn step_output(&mut self, index: u32, chunk: &str) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "record output")?;
        let step = self.step_mut(index)?;
        if step.state != StepState::Running {
            return Err(LcmError::InvalidTransition(format!(
                "step {} is {}, not running",
                index, step.state
            )));
        }
        step.output.push_str(chunk);
        Ok(())
    }

    /// The running step `index`, refusing steps that never started and any
    /// step after the run halted.
    fn finishing_step(&mut self, index: u32) -> Result<&mut Step> {
        if self.halted() {
            return Err(LcmError::InvalidTransition(format!(
                "execution {} halted after a failed step",
                self.id
            )));
        }
        let step = self.step_mut(index)?;
        if step.state != StepState::Running {
            return Err(LcmError::InvalidTransition(format!(
                "step {} is {}, not running",
                index, step.state
            )));
        }
        Ok(step)
    }

    pub fn step_succeeded(&mut self, index: u32) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "finish a step")?;
        self.finishing_step(index)?.transition(StepState::Success)
    }

    pub fn step_failed(&mut self, index: u32, kind: StepFailureKind, message: &str) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "fail a step")?;
        let step = self.finishing_step(index)?;
        step.transition(StepState::Failed)?;
        step.failure = Some(kind);
        if !message.is_empty() {
            if !step.output.is_empty() && !step.output.ends_with('\n') {
                step.output.push('\n');
            }
            step.output.push_str(message);
        }
        Ok(())
    }

    pub fn step_skipped(&mut self, index: u32) -> Result<()> {
        self.ensure_state(ExecutionState::Running, "skip a step")?;
        self.step_mut(index)?.transition(StepState::Skipped)
    }

    /// True once any step has failed; no further step may start.
    pub fn halted(&self) -> bool {
        self.steps.iter().any(|s| s.state == StepState::Failed)
    }

    pub fn running_step(&self) -> Option<&Step> {
        self.steps.iter().find(|s| s.state == StepState::Running)
    }

    /// Move into a terminal state. The running step (if any) fails with
    /// `interrupted`, remaining pending steps are skipped.
    pub fn finish(
        &mut self,
        state: ExecutionState,
        failure: Option<ExecutionFailure>,
        interrupted: StepFailureKind,
    ) -> Result<()> {
        if !state.is_terminal() {
            return Err(LcmError::InvalidTransition(format!(
                "{} is not a terminal state",
                state
            )));
        }
        if self.state.is_terminal() {
            return Err(LcmError::AlreadyTerminal(self.id));
        }

        for step in self.steps.iter_mut() {
            match step.state {
                StepState::Running => {
                    step.transition(StepState::Failed)?;
                    step.failure = Some(interrupted);
                }
                StepState::Pending => step.transition(StepState::Skipped)?,
                _ => {}
            }
        }

        self.state = state;
        self.failure = failure;
        self.finished_at = Some(Utc::now());
        Ok(())
    }

    /// Captured output of every step that produced some, with step headers.
    pub fn log(&self) -> String {
        let mut log = String::new();
        for step in &self.steps {
            if step.output.is_empty() && step.state != StepState::Failed {
                continue;
            }
            log.push_str(&format!(
                "--- [{}] {} ({}) ---\n",
                step.index, step.name, step.state
            ));
            log.push_str(&step.output);
            if !step.output.ends_with('\n') {
                log.push('\n');
            }
        }
        log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_execution(steps: &[&str]) -> Execution {
        let mut exec = Execution::new(
            Uuid::new_v4(),
            1,
            "c1".to_string(),
            "cluster_deploy".to_string(),
            "alice".to_string(),
            Duration::from_secs(60),
        );
        exec.mark_running().unwrap();
        exec.set_plan(steps.iter().map(|s| s.to_string()).collect())
            .unwrap();
        exec
    }

    #[test]
    fn state_display_tags_failure_reason() {
        assert_eq!(ExecutionState::Queued.to_string(), "queued");
        assert_eq!(
            ExecutionState::Failed(FailureReason::Timeout).to_string(),
            "failed:timeout"
        );
        assert_eq!(
            ExecutionState::Failed(FailureReason::Shutdown).to_string(),
            "failed:shutdown"
        );
    }

    #[test]
    fn step_transitions_are_monotonic() {
        let mut step = Step::new(0, "prepare".to_string());
        step.transition(StepState::Running).unwrap();
        assert!(step.transition(StepState::Pending).is_err());
        step.transition(StepState::Success).unwrap();
        assert!(step.transition(StepState::Failed).is_err());
        assert!(step.started_at.is_some());
        assert!(step.finished_at.is_some());
    }

    #[test]
    fn plan_indices_are_contiguous() {
        let exec = running_execution(&["a", "b", "c"]);
        let indices: Vec<u32> = exec.steps.iter().map(|s| s.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert!(exec.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn starting_later_step_skips_unstarted_ones() {
        let mut exec = running_execution(&["a", "b", "c"]);
        exec.step_started(2).unwrap();
        assert_eq!(exec.steps[0].state, StepState::Skipped);
        assert_eq!(exec.steps[1].state, StepState::Skipped);
        assert_eq!(exec.steps[2].state, StepState::Running);
    }

    #[test]
    fn cannot_start_step_while_previous_runs() {
        let mut exec = running_execution(&["a", "b"]);
        exec.step_started(0).unwrap();
        assert!(exec.step_started(1).is_err());
    }

    #[test]
    fn failed_step_halts_run() {
        let mut exec = running_execution(&["a", "b"]);
        exec.step_started(0).unwrap();
        exec.step_failed(0, StepFailureKind::Command, "exit 1")
            .unwrap();
        assert!(exec.halted());
        assert!(exec.step_started(1).is_err());
    }

    #[test]
    fn no_step_finishes_after_halt() {
        let mut exec = running_execution(&["a", "b", "c"]);
        exec.step_started(0).unwrap();
        exec.step_failed(0, StepFailureKind::Command, "exit 1")
            .unwrap();

        assert!(exec.step_succeeded(1).is_err());
        assert!(exec
            .step_failed(2, StepFailureKind::Command, "late")
            .is_err());
        assert_eq!(exec.steps[1].state, StepState::Pending);
        exec.step_skipped(1).unwrap();
        assert_eq!(exec.steps[1].state, StepState::Skipped);
    }

    #[test]
    fn step_must_start_before_finishing() {
        let mut exec = running_execution(&["a", "b"]);
        assert!(exec.step_succeeded(0).is_err());
        assert!(exec
            .step_failed(1, StepFailureKind::Command, "exit 1")
            .is_err());
        assert!(exec.steps.iter().all(|s| s.state == StepState::Pending));
    }

    #[test]
    fn finish_fails_running_and_skips_pending() {
        let mut exec = running_execution(&["a", "b", "c"]);
        exec.step_started(0).unwrap();
        exec.step_succeeded(0).unwrap();
        exec.step_started(1).unwrap();
        exec.finish(
            ExecutionState::Failed(FailureReason::Timeout),
            None,
            StepFailureKind::Timeout,
        )
        .unwrap();

        assert_eq!(exec.steps[0].state, StepState::Success);
        assert_eq!(exec.steps[1].state, StepState::Failed);
        assert_eq!(exec.steps[1].failure, Some(StepFailureKind::Timeout));
        assert_eq!(exec.steps[2].state, StepState::Skipped);
        assert!(exec.finished_at.is_some());
    }

    #[test]
    fn terminal_execution_is_immutable() {
        let mut exec = running_execution(&["a"]);
        exec.finish(ExecutionState::Canceled, None, StepFailureKind::Canceled)
            .unwrap();
        assert!(matches!(
            exec.finish(ExecutionState::Success, None, StepFailureKind::Command),
            Err(LcmError::AlreadyTerminal(_))
        ));
        assert!(exec.step_started(0).is_err());
    }

    #[test]
    fn log_includes_failed_step_message() {
        let mut exec = running_execution(&["wipe"]);
        exec.step_started(0).unwrap();
        exec.step_output(0, "zapping /dev/sdb\n").unwrap();
        exec.step_failed(0, StepFailureKind::Command, "exit code 2")
            .unwrap();
        let log = exec.log();
        assert!(log.contains("[0] wipe (failed)"));
        assert!(log.contains("zapping /dev/sdb"));
        assert!(log.contains("exit code 2"));
    }
}
