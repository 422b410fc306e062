//! Shared fixtures for the end-to-end tests: an agent config with tight
//! timings, and polling helpers against the mailbox.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use talipot_agent::agent::{Agent0, FinalCause};
use talipot_agent::config::AgentConfig;
use talipot_agent::error::AgentError;
use talipot_agent::mailbox::FsMailbox;
use talipot_agent::task::{Task, TaskDescription};

pub fn agent_config(sandbox: &Path, mailbox: &Path) -> AgentConfig {
    AgentConfig {
        session_id: "session.test".into(),
        pilot_id: "pilot.0000".into(),
        mailbox_path: mailbox.to_path_buf(),
        pilot_sandbox: sandbox.to_path_buf(),
        resource_manager: "fork".into(),
        launch_method: "fork".into(),
        lm_info: None,
        runtime_minutes: 1.0,
        poll_interval_secs: 0.05,
        heartbeat_interval_secs: 0.05,
        heartbeat_timeout_secs: 2.0,
        cores_per_node: Some(4),
        gpus_per_node: 0,
        hostfile: None,
        bridges: vec![],
        components: vec![
            "staging_input".into(),
            "scheduler".into(),
            "executor".into(),
            "staging_output".into(),
            "raptor".into(),
        ],
        sub_agents: vec![],
        task_environment: HashMap::new(),
        raptor_workers: 2,
        log_level: "info".into(),
        log_file: None,
    }
}

pub fn spawn_agent(
    cfg: AgentConfig,
    mailbox: Arc<FsMailbox>,
) -> tokio::task::JoinHandle<Result<FinalCause, AgentError>> {
    tokio::spawn(Agent0::new(cfg, mailbox).run())
}

pub fn task(uid: &str, description: TaskDescription) -> Task {
    Task::new(uid, "pilot.0000", description)
}

/// Poll the mailbox until the task reaches a terminal state.
pub async fn wait_final(mailbox: &FsMailbox, uid: &str, secs: u64) -> Task {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(secs);
    loop {
        if let Ok(task) = mailbox.read_task(uid).await {
            if task.is_final() {
                return task;
            }
        }
        if tokio::time::Instant::now() > deadline {
            panic!("task {uid} did not reach a terminal state within {secs}s");
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Ask the agent to stop and wait for its final cause.
pub async fn stop_agent(
    mailbox: &FsMailbox,
    handle: tokio::task::JoinHandle<Result<FinalCause, AgentError>>,
) -> FinalCause {
    mailbox
        .send_command("cancel_pilot", serde_json::Value::Null)
        .await
        .expect("send cancel_pilot");
    tokio::time::timeout(Duration::from_secs(20), handle)
        .await
        .expect("agent stops in time")
        .expect("agent task join")
        .expect("agent run result")
}
