//! Per-cluster mutual exclusion through the controller.


use std::time::Duration;

use futures::future::join_all;

use cluster_lcm::scheduler::ExecutionState;
use test_harness::{test_config, TestController};

/// Two executions on one cluster never overlap; the second waits in the queue.
#[tokio::test]
async fn test_same_cluster_runs_serially() {
    let tc = TestController::started(test_config()).await;
    let first = tc.submit_script("ceph-1", "sleep 300").await;
    tc.wait_state(first.id, ExecutionState::Running).await;
    let second = tc.submit_script("ceph-1", "sleep 10").await;

    tokio::time::sleep(Duration::from_millis(100)).await;
    let waiting = tc.controller.execution(second.id).await.unwrap();
    assert_eq!(waiting.state, ExecutionState::Queued);
    assert_eq!(
        tc.controller.lock_holder("ceph-1").map(|h| h.execution_id),
        Some(first.id)
    );

    let first_done = tc.wait_terminal(first.id).await;
    let second_done = tc.wait_terminal(second.id).await;
    assert_eq!(first_done.state, ExecutionState::Success);
    assert_eq!(second_done.state, ExecutionState::Success);
    assert!(second_done.started_at.unwrap() >= first_done.finished_at.unwrap());

    let first_run = tc.runner.run_of(first.id).unwrap();
    let second_run = tc.runner.run_of(second.id).unwrap();
    assert!(second_run.started >= first_run.finished.unwrap());
    assert_eq!(tc.runner.max_concurrent("ceph-1"), 1);
}

/// A long run on one cluster does not hold back other clusters, even with
/// more work queued behind it.
#[tokio::test]
async fn test_busy_cluster_does_not_block_others() {
    let tc = TestController::started(test_config().with_workers(2)).await;
    let long = tc.submit_script("ceph-a", "sleep 800").await;
    tc.wait_state(long.id, ExecutionState::Running).await;
    let behind = tc.submit_script("ceph-a", "ok").await;
    let other = tc.submit_script("ceph-b", "sleep 20").await;

    let other_done = tc.wait_terminal(other.id).await;
    assert_eq!(other_done.state, ExecutionState::Success);

    let long_now = tc.controller.execution(long.id).await.unwrap();
    assert_eq!(long_now.state, ExecutionState::Running);
    assert_eq!(
        tc.controller.execution(behind.id).await.unwrap().state,
        ExecutionState::Queued
    );

    assert_eq!(tc.wait_terminal(long.id).await.state, ExecutionState::Success);
    assert_eq!(tc.wait_terminal(behind.id).await.state, ExecutionState::Success);
}

/// Queued executions of one cluster start in submission order.
#[tokio::test]
async fn test_cluster_fifo_order() {
    let tc = TestController::new(test_config());
    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(tc.submit_script("ceph-1", "sleep 10").await.id);
    }
    tc.controller.start().await.unwrap();

    let mut starts = Vec::new();
    for id in &ids {
        let done = tc.wait_terminal(*id).await;
        assert_eq!(done.state, ExecutionState::Success);
        starts.push(done.started_at.unwrap());
    }
    assert!(starts.windows(2).all(|w| w[0] <= w[1]));
}

/// Many concurrent submissions across a few clusters: at most one run per
/// cluster at any time, and no lock survives.
#[tokio::test]
async fn test_mutual_exclusion_under_load() {
    let tc = TestController::started(test_config().with_workers(8)).await;
    let clusters = ["ceph-1", "ceph-2", "ceph-3"];

    let mut cfgs = Vec::new();
    for cluster in clusters {
        cfgs.push(
            tc.configure(cluster, "single", serde_json::json!({"script": "sleep 15"}))
                .await,
        );
    }

    let submissions = join_all((0..24).map(|i| {
        let cfg = &cfgs[i % cfgs.len()];
        tc.controller
            .submit(cluster_lcm::SubmitRequest::latest(cfg.id, "load"))
    }))
    .await;

    let ids: Vec<_> = submissions.into_iter().map(|r| r.unwrap().id).collect();
    for id in &ids {
        assert_eq!(tc.wait_terminal(*id).await.state, ExecutionState::Success);
    }

    for cluster in clusters {
        assert_eq!(tc.runner.max_concurrent(cluster), 1);
        tc.assert_unlocked(cluster).await;
    }
    assert!(tc.controller.locks().held().is_empty());

    let stats = tc.controller.locks().stats();
    assert_eq!(stats.grants, 24);
    assert_eq!(stats.releases, 24);
}

/// A failed run still releases its cluster for the next one.
#[tokio::test]
async fn test_failure_releases_lock() {
    let tc = TestController::started(test_config()).await;
    let failing = tc.submit_script("ceph-1", "fail broken").await;
    let next = tc.submit_script("ceph-1", "ok").await;

    tc.wait_terminal(failing.id).await;
    assert_eq!(tc.wait_terminal(next.id).await.state, ExecutionState::Success);
    tc.assert_unlocked("ceph-1").await;
}
