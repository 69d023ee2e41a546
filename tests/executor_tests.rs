//! Shell-backed playbook runner: commands, exit codes, fact exchange, and
//! cancellation of running processes.


use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use cluster_lcm::config::ShellConfig;
use cluster_lcm::facts::{FactScope, FactStore, JsonFileFactStore, MemoryFactStore};
use cluster_lcm::scheduler::execution::StepFailureKind;
use cluster_lcm::scheduler::{ExecutionState, FailureReason, NewConfiguration, StepState};
use cluster_lcm::worker::{
    PlaybookRunner, RunRequest, RunVerdict, RunnerEvent, ShellRunner, StaticCatalog, StepAction,
    StepDescriptor, StepOutcome,
};
use cluster_lcm::{Controller, SubmitRequest};
use test_harness::{test_config, wait_terminal};

fn shell_step(index: u32, command: &str) -> StepDescriptor {
    StepDescriptor {
        index,
        name: format!("step-{}", index),
        action: StepAction::Shell {
            command: command.to_string(),
        },
        requires_facts: Vec::new(),
        per_host: false,
    }
}

fn request(store: Arc<dyn FactStore>, steps: Vec<StepDescriptor>) -> RunRequest {
    let execution_id = Uuid::new_v4();
    RunRequest {
        execution_id,
        cluster_id: "ceph-1".to_string(),
        hosts: vec!["host-a".to_string(), "host-b".to_string()],
        steps,
        parameters: serde_json::json!({}),
        facts: FactScope::new(store, "ceph-1", execution_id),
        cancel: CancellationToken::new(),
    }
}

/// Run to completion and collect every event the runner emitted
async fn run(request: RunRequest) -> (RunVerdict, Vec<RunnerEvent>) {
    let (tx, mut rx) = mpsc::channel(256);
    let verdict = ShellRunner::default().run(request, tx).await;
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    (verdict, events)
}

fn output_of(events: &[RunnerEvent], index: u32) -> String {
    events
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::StepOutput { index: i, chunk } if *i == index => Some(chunk.as_str()),
            _ => None,
        })
        .collect()
}

fn outcome_of(events: &[RunnerEvent], index: u32) -> Option<StepOutcome> {
    events.iter().find_map(|e| match e {
        RunnerEvent::StepFinished { index: i, outcome } if *i == index => Some(outcome.clone()),
        _ => None,
    })
}

#[tokio::test]
async fn test_echo_step_succeeds() {
    let store = Arc::new(MemoryFactStore::new());
    let (verdict, events) = run(request(store, vec![shell_step(0, "echo hello")])).await;

    assert_eq!(verdict, RunVerdict::Success);
    assert_eq!(events[0], RunnerEvent::StepStarted { index: 0 });
    assert_eq!(output_of(&events, 0), "hello\n");
    assert_eq!(outcome_of(&events, 0), Some(StepOutcome::Success));
}

#[tokio::test]
async fn test_nonzero_exit_fails_and_halts() {
    let store = Arc::new(MemoryFactStore::new());
    let (verdict, events) = run(request(
        store,
        vec![
            shell_step(0, "echo 'disk busy' >&2; exit 3"),
            shell_step(1, "echo unreachable"),
        ],
    ))
    .await;

    assert_eq!(verdict, RunVerdict::Failed);
    match outcome_of(&events, 0) {
        Some(StepOutcome::Failed { kind, message }) => {
            assert_eq!(kind, StepFailureKind::Command);
            assert!(message.contains("disk busy"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!events
        .iter()
        .any(|e| *e == RunnerEvent::StepStarted { index: 1 }));
}

#[tokio::test]
async fn test_exit_code_without_stderr() {
    let store = Arc::new(MemoryFactStore::new());
    let (_, events) = run(request(store, vec![shell_step(0, "exit 7")])).await;
    match outcome_of(&events, 0) {
        Some(StepOutcome::Failed { message, .. }) => assert!(message.contains('7')),
        other => panic!("unexpected outcome {:?}", other),
    }
}

#[tokio::test]
async fn test_environment_describes_the_run() {
    let store = Arc::new(MemoryFactStore::new());
    let req = request(
        store,
        vec![shell_step(0, "echo \"$LCM_CLUSTER $LCM_HOSTS $LCM_EXECUTION\"")],
    );
    let id = req.execution_id;
    let (_, events) = run(req).await;
    assert_eq!(
        output_of(&events, 0),
        format!("ceph-1 host-a,host-b {}\n", id)
    );
}

#[tokio::test]
async fn test_fact_lines_are_recorded() {
    let store = Arc::new(MemoryFactStore::new());
    let req = request(
        store.clone(),
        vec![shell_step(
            0,
            r#"echo 'LCM_FACT host-b osd.4={"device":"/dev/sde","partition":1}'"#,
        )],
    );
    let id = req.execution_id;
    let (verdict, _) = run(req).await;

    assert_eq!(verdict, RunVerdict::Success);
    let fact = store.read("ceph-1", "host-b", "osd.4").unwrap().unwrap();
    assert_eq!(
        fact.value,
        serde_json::json!({"device": "/dev/sde", "partition": 1})
    );
    assert_eq!(fact.writer_execution, id);
    assert!(store.read("ceph-1", "host-a", "osd.4").unwrap().is_none());
}

#[tokio::test]
async fn test_per_host_step_sees_its_facts() {
    let store = Arc::new(MemoryFactStore::new());
    let seed = FactScope::new(store.clone() as Arc<dyn FactStore>, "ceph-1", Uuid::new_v4());
    seed.write("host-a", "osd.1", serde_json::json!("/dev/sdb")).unwrap();
    seed.write("host-b", "osd.1", serde_json::json!("/dev/sdc")).unwrap();

    let mut step = shell_step(0, "echo \"$LCM_HOST $LCM_FACT_OSD_1\"");
    step.per_host = true;
    step.requires_facts = vec!["osd.1".to_string()];
    let (verdict, events) = run(request(store, vec![step])).await;

    assert_eq!(verdict, RunVerdict::Success);
    let output = output_of(&events, 0);
    assert!(output.contains("host-a /dev/sdb"));
    assert!(output.contains("host-b /dev/sdc"));
}

/// A missing fact fails the step before any process is spawned.
#[tokio::test]
async fn test_missing_fact_prevents_command() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("ran");
    let store = Arc::new(MemoryFactStore::new());

    let mut step = shell_step(0, &format!("touch {}", marker.display()));
    step.per_host = true;
    step.requires_facts = vec!["osd.2".to_string()];
    let (verdict, events) = run(request(store, vec![step])).await;

    assert_eq!(verdict, RunVerdict::Failed);
    match outcome_of(&events, 0) {
        Some(StepOutcome::Failed { kind, message }) => {
            assert_eq!(kind, StepFailureKind::FactInconsistency);
            assert!(message.contains("osd.2"));
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert!(!marker.exists());
}

#[tokio::test]
async fn test_cancel_kills_running_command() {
    let store = Arc::new(MemoryFactStore::new());
    let req = request(store, vec![shell_step(0, "sleep 30"), shell_step(1, "true")]);
    let cancel = req.cancel.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
    });

    let started = Instant::now();
    let (verdict, events) = run(req).await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(verdict, RunVerdict::Canceled);
    assert!(matches!(
        outcome_of(&events, 0),
        Some(StepOutcome::Failed {
            kind: StepFailureKind::Canceled,
            ..
        })
    ));
}

/// Output is recorded as it is produced, so a killed command keeps what it
/// already printed.
#[tokio::test]
async fn test_output_streams_before_command_ends() {
    let store = Arc::new(MemoryFactStore::new());
    let req = request(store, vec![shell_step(0, "echo zapping /dev/sdb; sleep 30")]);
    let cancel = req.cancel.clone();
    let (tx, mut rx) = mpsc::channel(256);
    let handle = tokio::spawn(async move { ShellRunner::default().run(req, tx).await });

    let mut seen = String::new();
    let streamed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = rx.recv().await {
            if let RunnerEvent::StepOutput { chunk, .. } = event {
                seen.push_str(&chunk);
                return;
            }
        }
    })
    .await;
    assert!(streamed.is_ok(), "no output while the command was running");
    assert_eq!(seen, "zapping /dev/sdb\n");

    cancel.cancel();
    let verdict = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(verdict, RunVerdict::Canceled);
}

#[tokio::test]
async fn test_per_host_output_is_prefixed() {
    let store = Arc::new(MemoryFactStore::new());
    let mut step = shell_step(0, "echo out; echo err >&2");
    step.per_host = true;
    let (_, events) = run(request(store, vec![step])).await;

    let output = output_of(&events, 0);
    for line in ["[host-a] out\n", "[host-a] err\n", "[host-b] out\n", "[host-b] err\n"] {
        assert!(output.contains(line), "missing {:?} in {:?}", line, output);
    }
}

/// Facts reach a file-backed store and survive reopening it.
#[tokio::test]
async fn test_fact_lines_reach_file_store() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("facts.json");
    let store = Arc::new(JsonFileFactStore::open(&path).unwrap());

    let mut step = shell_step(0, "echo 'LCM_FACT osd.2=\"/dev/sdd\"'");
    step.per_host = true;
    let (verdict, _) = run(request(store, vec![step])).await;
    assert_eq!(verdict, RunVerdict::Success);

    let reopened = JsonFileFactStore::open(&path).unwrap();
    for host in ["host-a", "host-b"] {
        let fact = reopened.read("ceph-1", host, "osd.2").unwrap().unwrap();
        assert_eq!(fact.value, serde_json::json!("/dev/sdd"));
    }
}

#[tokio::test]
async fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let runner = ShellRunner::new(ShellConfig {
        working_dir: Some(dir.path().to_path_buf()),
        ..Default::default()
    });
    let store = Arc::new(MemoryFactStore::new());
    let (tx, mut rx) = mpsc::channel(16);
    let verdict = runner
        .run(request(store, vec![shell_step(0, "touch here")]), tx)
        .await;
    while rx.try_recv().is_ok() {}

    assert_eq!(verdict, RunVerdict::Success);
    assert!(dir.path().join("here").exists());
}

/// Deploy and remove through the controller with real shell commands.
#[tokio::test]
async fn test_controller_with_shell_runner() {
    let catalog = StaticCatalog::from_json(
        r#"[
        {
            "name": "deploy_osd",
            "steps": [
                {"name": "prepare", "action": {"type": "shell", "command": "echo 'LCM_FACT osd.{{ osd_id }}={{ device }}'"}, "per_host": true}
            ]
        },
        {
            "name": "remove_osd",
            "steps": [
                {
                    "name": "purge",
                    "action": {"type": "shell", "command": "echo \"zap $LCM_FACT_OSD_{{ osd_id }} on $LCM_HOST\""},
                    "requires_facts": ["osd.{{ osd_id }}"],
                    "per_host": true
                }
            ]
        }
    ]"#,
    )
    .unwrap();
    let facts: Arc<dyn FactStore> = Arc::new(MemoryFactStore::new());
    let controller = Controller::new(
        test_config(),
        Arc::new(catalog),
        Arc::new(ShellRunner::default()),
        facts,
    );
    controller.start().await.unwrap();

    let mut ids = Vec::new();
    for (playbook, params) in [
        ("deploy_osd", serde_json::json!({"osd_id": 6, "device": "/dev/sdf"})),
        ("remove_osd", serde_json::json!({"osd_id": 6})),
    ] {
        let cfg = controller
            .configurations()
            .create(NewConfiguration {
                name: playbook.to_string(),
                cluster_id: "ceph-1".to_string(),
                playbook: playbook.to_string(),
                hosts: vec!["host-a".to_string()],
                parameters: params,
                creator: "alice".to_string(),
            })
            .await
            .unwrap();
        let exec = controller
            .submit(SubmitRequest::latest(cfg.id, "alice"))
            .await
            .unwrap();
        ids.push(exec.id);
    }

    for id in &ids {
        let done = wait_terminal(&controller, *id).await;
        assert_eq!(done.state, ExecutionState::Success, "{}", done.log());
        assert!(done.steps.iter().all(|s| s.state == StepState::Success));
    }
    let log = controller.log(ids[1]).await.unwrap();
    assert!(log.contains("zap /dev/sdf on host-a"));

    controller.shutdown().await;
}

/// A timed-out command leaves what it printed in the step log.
#[tokio::test]
async fn test_timeout_keeps_partial_output() {
    let catalog = StaticCatalog::from_json(
        r#"[{"name": "zap", "steps": [{"name": "zap", "action": {"type": "shell", "command": "echo zapping /dev/sdb; sleep 5"}}]}]"#,
    )
    .unwrap();
    let controller = Controller::new(
        test_config(),
        Arc::new(catalog),
        Arc::new(ShellRunner::default()),
        Arc::new(MemoryFactStore::new()) as Arc<dyn FactStore>,
    );
    controller.start().await.unwrap();
    let cfg = controller
        .configurations()
        .create(NewConfiguration {
            name: "zap".to_string(),
            cluster_id: "ceph-1".to_string(),
            playbook: "zap".to_string(),
            hosts: vec!["host-a".to_string()],
            parameters: serde_json::json!({}),
            creator: "alice".to_string(),
        })
        .await
        .unwrap();
    let exec = controller
        .submit(SubmitRequest::latest(cfg.id, "alice").with_timeout(Duration::from_millis(700)))
        .await
        .unwrap();

    let done = wait_terminal(&controller, exec.id).await;
    assert_eq!(done.state, ExecutionState::Failed(FailureReason::Timeout));
    assert!(
        done.steps[0].output.contains("zapping /dev/sdb"),
        "output was {:?}",
        done.steps[0].output
    );

    controller.shutdown().await;
}
