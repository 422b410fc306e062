//! End-to-end pipeline scenarios: a real agent against a file-backed
//! mailbox, fork resource/launch backends, tight poll timings.

mod common;

use std::sync::Arc;
use std::time::Duration;

use talipot_agent::agent::FinalCause;
use talipot_agent::mailbox::{FsMailbox, PilotState};
use talipot_agent::task::{TaskDescription, TaskMode, TaskState};

use common::{agent_config, spawn_agent, stop_agent, task, wait_final};
use tempfile::TempDir;

fn echo_description() -> TaskDescription {
    TaskDescription {
        executable: "/bin/echo".into(),
        arguments: vec!["hi".into()],
        ranks: 1,
        cores_per_rank: 1,
        ..Default::default()
    }
}

fn shell_description(command: &str, cores_per_rank: u32) -> TaskDescription {
    TaskDescription {
        executable: "/bin/sh".into(),
        arguments: vec!["-c".into(), command.into()],
        ranks: 1,
        cores_per_rank,
        ..Default::default()
    }
}

#[tokio::test]
async fn single_rank_echo_completes() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());
    mailbox.submit_task(task("task.0001", echo_description())).await.unwrap();

    let done = wait_final(&mailbox, "task.0001", 20).await;
    assert_eq!(done.state(), TaskState::Done);
    assert_eq!(done.exit_code, Some(0));
    assert!(done.stdout.starts_with("hi"), "stdout was {:?}", done.stdout);

    let slots = done.slots.expect("scheduling decision recorded");
    assert_eq!(slots.ranks.len(), 1);
    assert_eq!(slots.ranks[0].node_index, 0);
    assert_eq!(slots.ranks[0].cores, vec![0]);

    // The state history is strictly monotone and ends in exactly one final.
    for pair in done.states.windows(2) {
        assert!(pair[0].state.rank() < pair[1].state.rank());
    }
    assert_eq!(done.states.iter().filter(|e| e.state.is_final()).count(), 1);

    let cause = stop_agent(&mailbox, handle).await;
    assert_eq!(cause, FinalCause::Cancel);
    assert_eq!(cause.exit_code(), 1);
}

#[tokio::test]
async fn oversubscription_waits_for_release() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    // 2 nodes x 2 cores via the hostfile backend.
    let hostfile = sandbox.path().join("nodefile");
    std::fs::write(&hostfile, "nodeA\nnodeA\nnodeB\nnodeB\n").unwrap();
    let mut cfg = agent_config(sandbox.path(), store.path());
    cfg.resource_manager = "hostfile".into();
    cfg.hostfile = Some(hostfile);

    let handle = spawn_agent(cfg, mailbox.clone());
    for uid in ["task.0001", "task.0002", "task.0003"] {
        mailbox
            .submit_task(task(uid, shell_description("sleep 0.3", 2)))
            .await
            .unwrap();
    }

    let t1 = wait_final(&mailbox, "task.0001", 30).await;
    let t2 = wait_final(&mailbox, "task.0002", 30).await;
    let t3 = wait_final(&mailbox, "task.0003", 30).await;
    assert!(
        [&t1, &t2, &t3].iter().all(|t| t.state() == TaskState::Done),
        "all tasks reach DONE"
    );

    // The first two run on disjoint nodes.
    let n1 = t1.slots.as_ref().unwrap().ranks[0].node_index;
    let n2 = t2.slots.as_ref().unwrap().ranks[0].node_index;
    assert_ne!(n1, n2);

    // The third starts executing no earlier than the first completion.
    let third_start = t3.state_timestamp(TaskState::AgentExecuting).unwrap();
    let first_done = [&t1, &t2]
        .iter()
        .filter_map(|t| t.state_timestamp(TaskState::AgentStagingOutputPending))
        .min()
        .unwrap();
    assert!(third_start >= first_done, "third ran before any slot was free");

    stop_agent(&mailbox, handle).await;
}

#[tokio::test]
async fn cancellation_mid_flight_yields_canceled() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());
    mailbox
        .submit_task(task("task.0001", shell_description("sleep 60", 1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    mailbox
        .send_command("cancel_tasks", serde_json::json!({"uids": ["task.0001"]}))
        .await
        .unwrap();

    let cancelled = wait_final(&mailbox, "task.0001", 20).await;
    assert_eq!(cancelled.state(), TaskState::Canceled);
    assert_ne!(cancelled.exit_code, Some(0));

    stop_agent(&mailbox, handle).await;
}

#[tokio::test]
async fn repeated_cancellation_is_idempotent() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());
    mailbox
        .submit_task(task("task.0001", shell_description("sleep 60", 1)))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(500)).await;
    for _ in 0..2 {
        mailbox
            .send_command("cancel_tasks", serde_json::json!({"uids": ["task.0001"]}))
            .await
            .unwrap();
    }

    let cancelled = wait_final(&mailbox, "task.0001", 20).await;
    assert_eq!(cancelled.state(), TaskState::Canceled);
    assert_eq!(cancelled.states.iter().filter(|e| e.state.is_final()).count(), 1);

    stop_agent(&mailbox, handle).await;
}

#[tokio::test]
async fn pilot_timeout_cancels_leftover_tasks() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let mut cfg = agent_config(sandbox.path(), store.path());
    cfg.runtime_minutes = 0.05; // 3 seconds
    let handle = spawn_agent(cfg, mailbox.clone());

    mailbox
        .submit_task(task("task.0001", shell_description("sleep 300", 1)))
        .await
        .unwrap();

    let cause = tokio::time::timeout(Duration::from_secs(30), handle)
        .await
        .expect("agent stops at deadline")
        .unwrap()
        .unwrap();
    assert_eq!(cause, FinalCause::Timeout);
    assert_eq!(cause.exit_code(), 2);

    let pilot = mailbox.read_pilot().await.unwrap();
    assert_eq!(pilot.state, PilotState::Done);

    let leftover = mailbox.read_task("task.0001").await.unwrap();
    assert_eq!(leftover.state(), TaskState::Canceled);
}

#[tokio::test]
async fn pilot_becomes_active_and_reports_resources() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let pilot = mailbox.read_pilot().await.unwrap();
        if pilot.state == PilotState::PmgrActive {
            assert!(pilot.resource_details.get("rm_info").is_some());
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pilot never became active");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    let cause = stop_agent(&mailbox, handle).await;
    let pilot = mailbox.read_pilot().await.unwrap();
    assert_eq!(pilot.state, PilotState::Canceled);
    assert_eq!(cause.pilot_state(), PilotState::Canceled);
}

#[tokio::test]
async fn resource_error_fails_only_the_oversized_task() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());
    mailbox
        .submit_task(task("task.0001", shell_description("true", 64)))
        .await
        .unwrap();
    mailbox.submit_task(task("task.0002", echo_description())).await.unwrap();

    let too_big = wait_final(&mailbox, "task.0001", 20).await;
    assert_eq!(too_big.state(), TaskState::Failed);
    assert!(too_big.exception.unwrap().contains("beyond total inventory"));

    let ok = wait_final(&mailbox, "task.0002", 20).await;
    assert_eq!(ok.state(), TaskState::Done);

    stop_agent(&mailbox, handle).await;
}

#[tokio::test]
async fn external_sigterm_fails_the_pilot() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    // A real agent_0 process, so the signal path is the one operators hit.
    let cfg = serde_json::json!({
        "session_id": "session.test",
        "pilot_id": "pilot.0000",
        "mailbox": store.path(),
        "pilot_sandbox": sandbox.path(),
        "poll_interval_secs": 0.05,
        "heartbeat_interval_secs": 0.05,
        "heartbeat_timeout_secs": 2.0,
        "cores_per_node": 4,
        "log_file": sandbox.path().join("agent_0.log")
    });
    let cfg_path = sandbox.path().join("agent_0.json");
    std::fs::write(&cfg_path, serde_json::to_vec_pretty(&cfg).unwrap()).unwrap();

    let mut child = tokio::process::Command::new(env!("CARGO_BIN_EXE_agent_0"))
        .arg(&cfg_path)
        .spawn()
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if mailbox.read_pilot().await.unwrap().state == PilotState::PmgrActive {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "pilot never became active");
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // SIGTERM is not a client cancel: it lands in the "otherwise" bucket.
    let pid = child.id().expect("agent pid").to_string();
    let killed = std::process::Command::new("kill").arg(&pid).status().unwrap();
    assert!(killed.success());

    let status = tokio::time::timeout(Duration::from_secs(20), child.wait())
        .await
        .expect("agent exits after SIGTERM")
        .unwrap();
    assert_eq!(status.code(), Some(3));

    let pilot = mailbox.read_pilot().await.unwrap();
    assert_eq!(pilot.state, PilotState::Failed);
    // The terminate sequence flushed a log tail before exiting.
    assert!(!pilot.logfile.is_empty());
}

#[tokio::test]
async fn raptor_master_serves_function_tasks() {
    let sandbox = TempDir::new().unwrap();
    let store = TempDir::new().unwrap();
    let mailbox = Arc::new(FsMailbox::open(store.path(), "pilot.0000").unwrap());

    let handle = spawn_agent(agent_config(sandbox.path(), store.path()), mailbox.clone());

    let master = TaskDescription {
        mode: TaskMode::RaptorMaster,
        executable: "/bin/sleep".into(),
        arguments: vec!["3".into()],
        ..Default::default()
    };
    mailbox.submit_task(task("master.0000", master)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    let function = TaskDescription {
        mode: TaskMode::Shell,
        executable: "echo".into(),
        arguments: vec!["raptor-hi".into()],
        raptor_id: Some("master.0000".into()),
        ..Default::default()
    };
    mailbox.submit_task(task("fn.0000", function)).await.unwrap();

    let result = wait_final(&mailbox, "fn.0000", 20).await;
    assert_eq!(result.state(), TaskState::Done);
    assert_eq!(result.exit_code, Some(0));
    assert!(result.stdout.starts_with("raptor-hi"));
    // Function tasks never occupy scheduler slots.
    assert!(result.slots.is_none());

    let master = wait_final(&mailbox, "master.0000", 20).await;
    assert_eq!(master.state(), TaskState::Done);

    stop_agent(&mailbox, handle).await;
}
