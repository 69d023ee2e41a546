use std::collections::BTreeMap;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::config::ShellConfig;
use crate::error::Result;
use crate::facts::FactScope;
use crate::scheduler::execution::StepFailureKind;
use crate::worker::catalog::{StepAction, StepDescriptor};
use crate::worker::runner::{emit, PlaybookRunner, RunRequest, RunVerdict, RunnerEvent, StepOutcome};

/// Result of one command invocation
#[derive(Debug)]
struct CommandResult {
    exit_code: Option<i32>,
    stderr: String,
}

impl CommandResult {
    fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    fn error_message(&self) -> String {
        if self.stderr.trim().is_empty() {
            format!("Exit code: {:?}", self.exit_code)
        } else {
            self.stderr.clone()
        }
    }
}

enum StepResult {
    Done(StepOutcome),
    Canceled,
}

/// How the output loop of one command ended
enum CommandEnd {
    Exited(Option<i32>),
    Failed(StepFailureKind, String),
    Canceled,
}

/// Runs playbook steps as local shell commands.
///
/// Every invocation gets the environment:
/// - `LCM_CLUSTER`, `LCM_EXECUTION`, `LCM_HOSTS` (comma separated)
/// - `LCM_HOST` and one `LCM_FACT_<KEY>` per required fact, for per-host steps
///
/// Output is streamed as it is produced, one `StepOutput` per line, prefixed
/// with `[host] ` for per-host steps. Whatever a command printed before it was
/// killed is therefore already recorded.
///
/// A stdout line `<marker> <key>=<json>` records a fact for the step's host.
/// Steps that run once name the host explicitly: `<marker> <host> <key>=<json>`.
#[derive(Debug, Clone, Default)]
pub struct ShellRunner {
    config: ShellConfig,
}

impl ShellRunner {
    pub fn new(config: ShellConfig) -> Self {
        Self { config }
    }

    async fn run_step(
        &self,
        request: &RunRequest,
        step: &StepDescriptor,
        events: &mpsc::Sender<RunnerEvent>,
    ) -> StepResult {
        // Required facts are checked for every target host before anything runs
        let mut host_env: BTreeMap<&str, Vec<(String, String)>> = BTreeMap::new();
        for host in &request.hosts {
            let mut env = Vec::new();
            for key in &step.requires_facts {
                match request.facts.require(host, key) {
                    Ok(value) => env.push((fact_env_name(key), fact_env_value(&value))),
                    Err(e) => {
                        return StepResult::Done(StepOutcome::Failed {
                            kind: StepFailureKind::FactInconsistency,
                            message: e.to_string(),
                        })
                    }
                }
            }
            host_env.insert(host.as_str(), env);
        }

        let command = match &step.action {
            StepAction::Noop => return StepResult::Done(StepOutcome::Success),
            StepAction::Shell { command } => command,
        };

        let targets: Vec<Option<&str>> = if step.per_host {
            request.hosts.iter().map(|h| Some(h.as_str())).collect()
        } else {
            vec![None]
        };

        for target in targets {
            let env = target
                .and_then(|h| host_env.get(h))
                .cloned()
                .unwrap_or_default();

            let mut cmd = Command::new(&self.config.shell);
            cmd.arg("-c")
                .arg(command)
                .env("LCM_CLUSTER", &request.cluster_id)
                .env("LCM_EXECUTION", request.execution_id.to_string())
                .env("LCM_HOSTS", request.hosts.join(","))
                .envs(env)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if let Some(host) = target {
                cmd.env("LCM_HOST", host);
            }
            if let Some(dir) = &self.config.working_dir {
                cmd.current_dir(dir);
            }

            tracing::info!(
                execution_id = %request.execution_id,
                step = step.index,
                host = target.unwrap_or("*"),
                command,
                "Running step command"
            );

            let mut child = match cmd.spawn() {
                Ok(child) => child,
                Err(e) => {
                    tracing::error!(execution_id = %request.execution_id, error = %e, "Step command failed to start");
                    return StepResult::Done(StepOutcome::Failed {
                        kind: StepFailureKind::Command,
                        message: e.to_string(),
                    });
                }
            };
            let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
                return StepResult::Done(StepOutcome::Failed {
                    kind: StepFailureKind::Command,
                    message: "command output is not piped".to_string(),
                });
            };
            let mut stdout = BufReader::new(stdout).lines();
            let mut stderr = BufReader::new(stderr).lines();
            let (mut stdout_open, mut stderr_open) = (true, true);
            let mut stderr_text = String::new();
            let prefix = target.map(|h| format!("[{}] ", h)).unwrap_or_default();

            let end = loop {
                tokio::select! {
                    line = stdout.next_line(), if stdout_open => match line {
                        Ok(Some(line)) => {
                            output_line(events, step.index, &prefix, &line).await;
                            if let Err(e) = self.record_fact_line(&request.facts, target, &line).await {
                                break CommandEnd::Failed(StepFailureKind::FactInconsistency, e.to_string());
                            }
                        }
                        Ok(None) => stdout_open = false,
                        Err(e) => {
                            tracing::warn!(execution_id = %request.execution_id, error = %e, "Reading stdout failed");
                            stdout_open = false;
                        }
                    },
                    line = stderr.next_line(), if stderr_open => match line {
                        Ok(Some(line)) => {
                            output_line(events, step.index, &prefix, &line).await;
                            stderr_text.push_str(&line);
                            stderr_text.push('\n');
                        }
                        Ok(None) => stderr_open = false,
                        Err(e) => {
                            tracing::warn!(execution_id = %request.execution_id, error = %e, "Reading stderr failed");
                            stderr_open = false;
                        }
                    },
                    status = child.wait(), if !stdout_open && !stderr_open => break match status {
                        Ok(status) => CommandEnd::Exited(status.code()),
                        Err(e) => CommandEnd::Failed(StepFailureKind::Command, e.to_string()),
                    },
                    _ = request.cancel.cancelled() => break CommandEnd::Canceled,
                }
            };

            let result = match end {
                CommandEnd::Exited(exit_code) => CommandResult {
                    exit_code,
                    stderr: stderr_text,
                },
                CommandEnd::Canceled => {
                    kill(&mut child).await;
                    tracing::info!(execution_id = %request.execution_id, step = step.index, "Step command killed");
                    return StepResult::Canceled;
                }
                CommandEnd::Failed(kind, message) => {
                    kill(&mut child).await;
                    return StepResult::Done(StepOutcome::Failed { kind, message });
                }
            };

            tracing::info!(
                execution_id = %request.execution_id,
                step = step.index,
                exit_code = ?result.exit_code,
                "Step command completed"
            );

            if !result.success() {
                return StepResult::Done(StepOutcome::Failed {
                    kind: StepFailureKind::Command,
                    message: result.error_message(),
                });
            }
        }

        StepResult::Done(StepOutcome::Success)
    }

    /// Record the fact a stdout line carries, if it carries one.
    ///
    /// Store writes may block on file I/O and run on the blocking pool.
    async fn record_fact_line(&self, facts: &FactScope, host: Option<&str>, line: &str) -> Result<()> {
        let Some(rest) = line
            .strip_prefix(self.config.fact_marker.as_str())
            .and_then(|r| r.strip_prefix(' '))
        else {
            return Ok(());
        };
        let Some((host, key, value)) = parse_fact_line(rest, host) else {
            tracing::warn!(line, "Ignoring malformed fact line");
            return Ok(());
        };
        let (facts, host, key) = (facts.clone(), host.to_string(), key.to_string());
        tokio::task::spawn_blocking(move || facts.write(&host, &key, value))
            .await
            .map_err(std::io::Error::from)?
    }
}

async fn output_line(events: &mpsc::Sender<RunnerEvent>, index: u32, prefix: &str, line: &str) {
    emit(
        events,
        RunnerEvent::StepOutput {
            index,
            chunk: format!("{}{}\n", prefix, line),
        },
    )
    .await;
}

async fn kill(child: &mut tokio::process::Child) {
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Step command already gone");
    }
}

#[async_trait]
impl PlaybookRunner for ShellRunner {
    async fn run(&self, request: RunRequest, events: mpsc::Sender<RunnerEvent>) -> RunVerdict {
        for step in &request.steps {
            if request.cancel.is_cancelled() {
                return RunVerdict::Canceled;
            }

            emit(&events, RunnerEvent::StepStarted { index: step.index }).await;

            match self.run_step(&request, step, &events).await {
                StepResult::Canceled => {
                    emit(
                        &events,
                        RunnerEvent::StepFinished {
                            index: step.index,
                            outcome: StepOutcome::Failed {
                                kind: StepFailureKind::Canceled,
                                message: "step interrupted".to_string(),
                            },
                        },
                    )
                    .await;
                    return RunVerdict::Canceled;
                }
                StepResult::Done(outcome) => {
                    let failed = outcome != StepOutcome::Success;
                    emit(
                        &events,
                        RunnerEvent::StepFinished {
                            index: step.index,
                            outcome,
                        },
                    )
                    .await;
                    if failed {
                        return RunVerdict::Failed;
                    }
                }
            }
        }
        RunVerdict::Success
    }
}

/// `osd.3` becomes `LCM_FACT_OSD_3`
pub fn fact_env_name(key: &str) -> String {
    let sanitized: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("LCM_FACT_{}", sanitized)
}

fn fact_env_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Parse `<key>=<json>` (or `<host> <key>=<json>`). Values that are not
/// valid JSON are stored as strings.
fn parse_fact_line<'a>(
    rest: &'a str,
    default_host: Option<&'a str>,
) -> Option<(&'a str, &'a str, serde_json::Value)> {
    let rest = rest.trim();
    let (host, assignment) = match rest.split_once(' ') {
        Some((first, tail)) if !first.contains('=') => (first, tail.trim()),
        _ => (default_host?, rest),
    };
    let (key, raw) = assignment.split_once('=')?;
    let key = key.trim();
    if key.is_empty() || host.is_empty() {
        return None;
    }
    let raw = raw.trim();
    let value = serde_json::from_str(raw)
        .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
    Some((host, key, value))
}
