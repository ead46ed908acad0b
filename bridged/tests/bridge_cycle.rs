//! End-to-end poll-cycle tests with a stubbed executor.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tempfile::tempdir;
use tokio::time::sleep;

use bridge_common::fs::atomic_write_json;
use bridge_store::{
    ChannelStore, HeartbeatStatus, HeartbeatStore, OutboxMessage, StorePaths, TaskStatus, TaskStore,
};
use bridged::config::BridgeConfig;
use bridged::daemon::{BridgeDaemon, CycleOutcome};
use bridged::executor::{ExecHandle, ExecRequest, Execution, Executor};

#[derive(Clone)]
enum StubBehavior {
    Succeed(String),
    Fail(String),
    RunForever,
}

struct StubExecutor {
    behavior: StubBehavior,
}

#[async_trait]
impl Executor for StubExecutor {
    async fn start(&self, request: ExecRequest) -> Result<Execution> {
        let behavior = self.behavior.clone();
        let timeout = request.timeout;
        let result = tokio::spawn(async move {
            match behavior {
                StubBehavior::Succeed(output) => Ok(output),
                StubBehavior::Fail(message) => Err(anyhow!(message)),
                StubBehavior::RunForever => {
                    sleep(timeout).await;
                    Err(anyhow!("executor timed out after {}ms", timeout.as_millis()))
                }
            }
        });
        Ok(Execution {
            handle: ExecHandle::detached(),
            result,
        })
    }
}

fn test_config(root: &Path, workdir: &Path) -> BridgeConfig {
    serde_json::from_value(serde_json::json!({
        "teamName": "alpha",
        "workerName": "w1",
        "executor": "codex",
        "workingDirectory": workdir.to_str().unwrap(),
        "root": root.to_str().unwrap(),
        "pollIntervalMs": 1,
        "taskTimeoutMs": 50,
        "maxConsecutiveErrors": 2,
    }))
    .unwrap()
}

fn daemon_with(config: BridgeConfig, behavior: StubBehavior) -> BridgeDaemon {
    BridgeDaemon::with_executor(config, Arc::new(StubExecutor { behavior }))
}

fn write_task(root: &Path, id: &str, status: &str, owner: &str) {
    let path = StorePaths::new(root).task_file("alpha", id).unwrap();
    atomic_write_json(
        &path,
        &serde_json::json!({
            "id": id,
            "subject": format!("subject {id}"),
            "description": "do the thing",
            "status": status,
            "owner": owner,
            "blocks": [],
            "blockedBy": [],
        }),
    )
    .unwrap();
}

fn outbox(root: &Path) -> Vec<OutboxMessage> {
    ChannelStore::new(StorePaths::new(root)).read_outbox("alpha", "w1")
}

#[tokio::test]
async fn idle_worker_reports_once() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    let mut daemon = daemon_with(test_config(&root, &work), StubBehavior::Succeed("ok".into()));

    for _ in 0..3 {
        assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);
    }

    let idle_count = outbox(&root)
        .iter()
        .filter(|m| matches!(m, OutboxMessage::Idle { .. }))
        .count();
    assert_eq!(idle_count, 1);

    let heartbeat = HeartbeatStore::new(&work).read("alpha", "w1").unwrap();
    assert_eq!(heartbeat.status, HeartbeatStatus::Polling);
}

#[tokio::test]
async fn successful_task_completes_and_reports() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");
    let mut daemon = daemon_with(
        test_config(&root, &work),
        StubBehavior::Succeed("all done".into()),
    );

    assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);

    let task = TaskStore::new(StorePaths::new(&root))
        .read("alpha", "1")
        .unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(daemon.consecutive_errors(), 0);

    let messages = outbox(&root);
    assert!(messages.iter().any(|m| matches!(
        m,
        OutboxMessage::TaskComplete { task_id, summary, .. }
            if task_id == "1" && summary == "all done"
    )));

    // Prompt and output audit files exist under the working directory.
    assert_eq!(work.join("prompts").read_dir().unwrap().count(), 1);
    assert_eq!(work.join("outputs").read_dir().unwrap().count(), 1);
}

#[tokio::test]
async fn failed_task_requeues_with_attempt_count() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");
    let mut daemon = daemon_with(
        test_config(&root, &work),
        StubBehavior::Fail("model exploded".into()),
    );

    assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);

    let store = TaskStore::new(StorePaths::new(&root));
    assert_eq!(store.read("alpha", "1").unwrap().status, TaskStatus::Pending);
    assert_eq!(store.read_failure("alpha", "1").unwrap().retry_count, 1);
    assert_eq!(daemon.consecutive_errors(), 1);

    assert!(outbox(&root).iter().any(|m| matches!(
        m,
        OutboxMessage::TaskFailed { task_id, error, .. }
            if task_id == "1" && error.contains("model exploded") && error.contains("(attempt 1)")
    )));
}

#[tokio::test]
async fn persistence_failure_after_success_requeues_task() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");

    // A regular file where the outputs directory belongs makes the audit
    // write fail even though the executor itself succeeded.
    std::fs::create_dir_all(&work).unwrap();
    std::fs::write(work.join("outputs"), "in the way").unwrap();

    let mut daemon = daemon_with(
        test_config(&root, &work),
        StubBehavior::Succeed("all done".into()),
    );
    assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);

    // The attempt counts as a failure: task back in the pool, sidecar
    // recorded, task_failed reported. Never left in_progress.
    let store = TaskStore::new(StorePaths::new(&root));
    assert_eq!(store.read("alpha", "1").unwrap().status, TaskStatus::Pending);
    assert_eq!(store.read_failure("alpha", "1").unwrap().retry_count, 1);
    assert_eq!(daemon.consecutive_errors(), 1);
    assert!(outbox(&root).iter().any(|m| matches!(
        m,
        OutboxMessage::TaskFailed { task_id, .. } if task_id == "1"
    )));
}

#[tokio::test]
async fn timeout_is_a_failure_and_task_stays_pending() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");
    let mut daemon = daemon_with(test_config(&root, &work), StubBehavior::RunForever);

    assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);

    let store = TaskStore::new(StorePaths::new(&root));
    assert_eq!(store.read("alpha", "1").unwrap().status, TaskStatus::Pending);
    assert_eq!(daemon.consecutive_errors(), 1);
    assert!(outbox(&root).iter().any(|m| matches!(
        m,
        OutboxMessage::TaskFailed { error, .. } if error.contains("timed out")
    )));
}

#[tokio::test]
async fn quarantine_engages_after_threshold_and_notifies_once() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    let mut daemon = daemon_with(test_config(&root, &work), StubBehavior::Fail("boom".into()));

    // maxConsecutiveErrors is 2: two failing executions trip the breaker.
    for id in ["1", "2"] {
        write_task(&root, id, "pending", "w1");
        daemon.cycle().await.unwrap();
    }
    assert_eq!(daemon.consecutive_errors(), 2);

    // Both tasks are pending again but the quarantined daemon claims
    // neither; it posts exactly one error notice no matter how long it
    // sits there.
    for _ in 0..3 {
        assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Continue);
    }
    let store = TaskStore::new(StorePaths::new(&root));
    assert_eq!(store.read("alpha", "1").unwrap().status, TaskStatus::Pending);

    let notices = outbox(&root)
        .iter()
        .filter(|m| matches!(m, OutboxMessage::Error { message, .. } if message.contains("quarantined")))
        .count();
    assert_eq!(notices, 1);

    let heartbeat = HeartbeatStore::new(&work).read("alpha", "w1").unwrap();
    assert_eq!(heartbeat.status, HeartbeatStatus::Quarantined);
    assert_eq!(heartbeat.consecutive_errors, 2);
}

#[tokio::test]
async fn shutdown_signal_stops_the_loop_and_acks() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    let channels = ChannelStore::new(StorePaths::new(&root));
    channels
        .write_shutdown("alpha", "w1", "req-1", "session over")
        .unwrap();

    let mut daemon = daemon_with(test_config(&root, &work), StubBehavior::Succeed("ok".into()));
    assert_eq!(daemon.cycle().await.unwrap(), CycleOutcome::Shutdown);

    assert!(outbox(&root).iter().any(|m| matches!(
        m,
        OutboxMessage::ShutdownAck { request_id, .. } if request_id == "req-1"
    )));
    assert!(channels.check_shutdown("alpha", "w1").is_none());
    assert!(HeartbeatStore::new(&work).read("alpha", "w1").is_none());
}

#[tokio::test]
async fn shutdown_racing_a_claim_reverts_the_task() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");

    let store = TaskStore::new(StorePaths::new(&root));
    let task = store.find_next("alpha", "w1").unwrap();
    store
        .update(
            "alpha",
            "1",
            bridge_store::TaskPatch::status(TaskStatus::InProgress),
        )
        .unwrap();

    // The signal lands after the claim but before the executor spawns.
    let channels = ChannelStore::new(StorePaths::new(&root));
    channels
        .write_shutdown("alpha", "w1", "req-9", "lead teardown")
        .unwrap();

    let mut daemon = daemon_with(test_config(&root, &work), StubBehavior::Succeed("ok".into()));
    let outcome = daemon.execute_claimed(&task, &[]).await.unwrap();
    assert_eq!(outcome, CycleOutcome::Shutdown);

    // Task is back in the pool, not executed, and exactly one ack with
    // the request id went out.
    assert_eq!(store.read("alpha", "1").unwrap().status, TaskStatus::Pending);
    let acks: Vec<_> = outbox(&root)
        .into_iter()
        .filter(|m| matches!(m, OutboxMessage::ShutdownAck { .. }))
        .collect();
    assert_eq!(acks.len(), 1);
    assert!(matches!(
        &acks[0],
        OutboxMessage::ShutdownAck { request_id, .. } if request_id == "req-9"
    ));
    assert!(
        !outbox(&root)
            .iter()
            .any(|m| matches!(m, OutboxMessage::TaskComplete { .. }))
    );
    assert!(channels.check_shutdown("alpha", "w1").is_none());
}

/// Executor that plays back a scripted sequence of outcomes.
struct SequenceExecutor {
    script: std::sync::Mutex<Vec<Result<String, String>>>,
}

#[async_trait]
impl Executor for SequenceExecutor {
    async fn start(&self, _request: ExecRequest) -> Result<Execution> {
        let next = self
            .script
            .lock()
            .unwrap()
            .remove(0);
        let result = tokio::spawn(async move { next.map_err(|message| anyhow!(message)) });
        Ok(Execution {
            handle: ExecHandle::detached(),
            result,
        })
    }
}

#[tokio::test]
async fn completion_resets_the_error_streak() {
    let dir = tempdir().unwrap();
    let (root, work) = (dir.path().join("root"), dir.path().join("work"));
    write_task(&root, "1", "pending", "w1");

    let executor = Arc::new(SequenceExecutor {
        script: std::sync::Mutex::new(vec![
            Err("boom".into()),
            Ok("fixed".into()),
        ]),
    });
    let mut daemon = BridgeDaemon::with_executor(test_config(&root, &work), executor);

    daemon.cycle().await.unwrap();
    assert_eq!(daemon.consecutive_errors(), 1);

    // The task reverted to pending, so the next cycle retries it and the
    // success wipes the streak.
    daemon.cycle().await.unwrap();
    assert_eq!(daemon.consecutive_errors(), 0);
    let store = TaskStore::new(StorePaths::new(&root));
    assert_eq!(
        store.read("alpha", "1").unwrap().status,
        TaskStatus::Completed
    );
    assert_eq!(store.read_failure("alpha", "1").unwrap().retry_count, 1);
}
