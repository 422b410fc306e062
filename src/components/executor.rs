//! Executor component — spawns one child process per placed task and
//! collects the results.
//!
//! For each task the executor synthesises two scripts in the task sandbox:
//! an exec script (rank-env prelude, environment, `pre_exec`, the task
//! command, `post_exec`) and a launch script (launcher env plus the
//! launch-method command line).  The child runs in its own process group so
//! cancellation can signal the whole tree.

use std::collections::{HashMap, HashSet};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ControlBus, StateBus, TaskQueueSender};
use crate::error::AgentError;
use crate::lm::LaunchMethod;
use crate::messages::ControlMessage;
use crate::raptor::RaptorEvent;
use crate::task::{Task, TaskMode, TaskState};

use super::{Component, ComponentFuture, advance, cancel_to_output, fail_to_output, publish_state};

/// How many bytes of stdout/stderr are kept on the task record.
const TAIL_BYTES: usize = 1024;
/// Grace period between SIGTERM and SIGKILL on cancellation.
const KILL_GRACE: Duration = Duration::from_secs(2);

struct RunningTask {
    task: Task,
    pgid: i32,
}

struct ExitEvent {
    uid: String,
    status: Option<std::process::ExitStatus>,
}

pub struct ExecutorComponent {
    uid: String,
    rx: mpsc::Receiver<Vec<Task>>,
    output: TaskQueueSender,
    control: ControlBus,
    control_rx: broadcast::Receiver<ControlMessage>,
    state: StateBus,
    heartbeat_interval: Duration,
    lm: Arc<dyn LaunchMethod>,
    pilot_sandbox: PathBuf,
    running: HashMap<String, RunningTask>,
    cancelled: HashSet<String>,
    exits_tx: mpsc::UnboundedSender<ExitEvent>,
    exits_rx: mpsc::UnboundedReceiver<ExitEvent>,
    raptor_events: Option<mpsc::Sender<RaptorEvent>>,
}

impl ExecutorComponent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Vec<Task>>,
        output: TaskQueueSender,
        control: ControlBus,
        state: StateBus,
        heartbeat_interval: Duration,
        lm: Arc<dyn LaunchMethod>,
        pilot_sandbox: PathBuf,
        raptor_events: Option<mpsc::Sender<RaptorEvent>>,
    ) -> Self {
        let control_rx = control.subscribe();
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            uid: "executor.0".to_string(),
            rx,
            output,
            control,
            control_rx,
            state,
            heartbeat_interval,
            lm,
            pilot_sandbox,
            running: HashMap::new(),
            cancelled: HashSet::new(),
            exits_tx,
            exits_rx,
            raptor_events,
        }
    }

    async fn work(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        for mut task in tasks {
            task.advance_to(TaskState::AgentExecuting)?;
            publish_state(&self.uid, &task, &self.state);

            if self.cancelled.remove(&task.uid) {
                self.release_slots(&task);
                cancel_to_output(&self.uid, task, &self.state, &self.output).await?;
                continue;
            }

            let (ok, reason) = self.lm.can_launch(&task);
            if !ok {
                let err = AgentError::Launch(format!("cannot launch {}: {reason}", task.uid));
                self.release_slots(&task);
                fail_to_output(&self.uid, task, &err, &self.state, &self.output).await?;
                continue;
            }

            if let Err(e) = self.launch(&mut task).await {
                // Spawn failures stay per-task; the executor carries on.
                self.release_slots(&task);
                fail_to_output(&self.uid, task, &e, &self.state, &self.output).await?;
            }
        }
        Ok(())
    }

    fn exec_script(&self, task: &Task) -> String {
        let td = &task.description;
        let mut script = String::from("#!/bin/sh\n\n");
        script.push_str(&self.lm.rank_env());
        script.push('\n');

        let mut env: Vec<_> = td.environment.iter().collect();
        env.sort();
        for (key, value) in env {
            script.push_str(&format!("export {key}=\"{value}\"\n"));
        }
        if !td.environment.is_empty() {
            script.push('\n');
        }
        for cmd in &td.pre_exec {
            script.push_str(cmd);
            script.push('\n');
        }
        script.push_str(&self.lm.exec_cmd(task));
        script.push('\n');
        script.push_str("RP_RET=$?\n");
        for cmd in &td.post_exec {
            script.push_str(cmd);
            script.push('\n');
        }
        script.push_str("exit $RP_RET\n");
        script
    }

    async fn launch(&mut self, task: &mut Task) -> Result<(), AgentError> {
        let sandbox = task
            .sandbox_path
            .clone()
            .unwrap_or_else(|| self.pilot_sandbox.join(&task.uid));
        tokio::fs::create_dir_all(&sandbox).await?;
        task.sandbox_path = Some(sandbox.clone());

        let exec_path = sandbox.join(format!("{}.exec.sh", task.uid));
        tokio::fs::write(&exec_path, self.exec_script(task)).await?;

        let launch_cmd = self.lm.launch_cmd(task, &exec_path.to_string_lossy())?;
        let mut launch_script = String::from("#!/bin/sh\n\n");
        for cmd in self.lm.launcher_env() {
            launch_script.push_str(&cmd);
            launch_script.push('\n');
        }
        launch_script.push_str(&format!("exec {launch_cmd}\n"));
        let launch_path = sandbox.join(format!("{}.launch.sh", task.uid));
        tokio::fs::write(&launch_path, launch_script).await?;

        let stdout = std::fs::File::create(sandbox.join(format!("{}.out", task.uid)))?;
        let stderr = std::fs::File::create(sandbox.join(format!("{}.err", task.uid)))?;

        let mut child = tokio::process::Command::new("/bin/sh")
            .arg(&launch_path)
            .current_dir(&sandbox)
            .process_group(0)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| AgentError::Launch(format!("spawn failed for {}: {e}", task.uid)))?;

        let pgid = child.id().map(|id| id as i32).unwrap_or(0);
        info!(uid = %task.uid, pgid, "task spawned");

        if task.description.mode == TaskMode::RaptorMaster {
            if let Some(events) = &self.raptor_events {
                let _ = events.send(RaptorEvent::MasterStarted { uid: task.uid.clone() }).await;
            }
        }

        let uid = task.uid.clone();
        let exits = self.exits_tx.clone();
        tokio::spawn(async move {
            let status = child.wait().await.ok();
            let _ = exits.send(ExitEvent { uid, status });
        });

        self.running.insert(task.uid.clone(), RunningTask { task: task.clone(), pgid });
        Ok(())
    }

    async fn collect(&mut self, event: ExitEvent) -> Result<(), AgentError> {
        let Some(running) = self.running.remove(&event.uid) else {
            return Ok(());
        };
        let mut task = running.task;

        task.exit_code = match event.status {
            Some(status) => status.code().or_else(|| status.signal().map(|s| -s)),
            None => None,
        };
        if let Some(sandbox) = task.sandbox_path.clone() {
            task.stdout = read_tail(&sandbox.join(format!("{}.out", task.uid))).await;
            task.stderr = read_tail(&sandbox.join(format!("{}.err", task.uid))).await;
        }

        if self.cancelled.remove(&task.uid) {
            task.cancel();
        }
        if task.target_state.is_none() {
            task.target_state = match task.exit_code {
                Some(0) => Some(TaskState::Done),
                _ => Some(TaskState::Failed),
            };
        }
        debug!(uid = %task.uid, exit_code = ?task.exit_code, target = ?task.target_state, "task exited");

        // Slots are released only now that the process exit is confirmed.
        self.release_slots(&task);

        if task.description.mode == TaskMode::RaptorMaster {
            if let Some(events) = &self.raptor_events {
                let _ = events.send(RaptorEvent::MasterExited { uid: task.uid.clone() }).await;
            }
        }

        advance(&self.uid, vec![task], TaskState::AgentStagingOutputPending, &self.state, &self.output)
            .await
    }

    fn release_slots(&self, task: &Task) {
        if let Some(slots) = &task.slots {
            self.control.publish(ControlMessage::SlotRelease {
                uid: task.uid.clone(),
                slots: slots.clone(),
            });
        }
    }

    fn handle_cancel(&mut self, uids: Vec<String>) {
        for uid in uids {
            if let Some(running) = self.running.get_mut(&uid) {
                info!(%uid, pgid = running.pgid, "cancelling running task");
                running.task.cancel();
                terminate_group(running.pgid);
            } else {
                // Not here yet (or already gone) — remember for arrival.
                self.cancelled.insert(uid);
            }
        }
    }

    /// Shutdown path: no task may outlive the agent.
    fn kill_all(&mut self) {
        for (uid, running) in &self.running {
            warn!(%uid, "killing task at shutdown");
            let _ = killpg(Pid::from_raw(running.pgid), Signal::SIGKILL);
        }
    }
}

/// SIGTERM now, SIGKILL after the grace period.
fn terminate_group(pgid: i32) {
    let pid = Pid::from_raw(pgid);
    let _ = killpg(pid, Signal::SIGTERM);
    tokio::spawn(async move {
        sleep(KILL_GRACE).await;
        let _ = killpg(pid, Signal::SIGKILL);
    });
}

async fn read_tail(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(data) => {
            let cut = data.len().min(TAIL_BYTES);
            String::from_utf8_lossy(&data[..cut]).into_owned()
        }
        Err(_) => String::new(),
    }
}

impl Component for ExecutorComponent {
    fn uid(&self) -> &str {
        &self.uid
    }

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture {
        Box::pin(async move {
            let mut this = *self;
            let mut beat = interval(this.heartbeat_interval);
            loop {
                tokio::select! {
                    biased;

                    _ = shutdown.cancelled() => {
                        this.kill_all();
                        return Ok(());
                    }

                    msg = this.control_rx.recv() => match msg {
                        Ok(ControlMessage::CancelTasks { uids }) => this.handle_cancel(uids),
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "executor lagged on control bus");
                        }
                        Err(_) => return Err(AgentError::Transport("control bus closed".into())),
                    },

                    _ = beat.tick() => {
                        this.control.publish(ControlMessage::heartbeat(&this.uid));
                    }

                    event = this.exits_rx.recv() => match event {
                        Some(event) => this.collect(event).await?,
                        None => return Err(AgentError::Transport("exit channel closed".into())),
                    },

                    batch = this.rx.recv() => match batch {
                        Some(tasks) => this.work(tasks).await?,
                        None => return Err(AgentError::Transport("executing queue closed".into())),
                    },
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::BridgeCatalog;
    use crate::lm;
    use crate::task::{RankSlot, SlotAssignment, TaskDescription};
    use tempfile::TempDir;
    use tokio::time::timeout;

    struct Harness {
        component: ExecutorComponent,
        out_rx: mpsc::Receiver<Vec<Task>>,
        control_rx: broadcast::Receiver<ControlMessage>,
    }

    fn harness(sandbox: &TempDir) -> Harness {
        let mut bridges = BridgeCatalog::new();
        let out_rx = bridges.staging_output.take_receiver();
        let control_rx = bridges.control.subscribe();
        let (lm, _info) = lm::create("fork").unwrap();
        let component = ExecutorComponent::new(
            bridges.executing.take_receiver(),
            bridges.staging_output.sender(),
            bridges.control.clone(),
            bridges.state.clone(),
            Duration::from_millis(50),
            Arc::from(lm),
            sandbox.path().to_path_buf(),
            None,
        );
        Harness { component, out_rx, control_rx }
    }

    fn pending(uid: &str, executable: &str, arguments: &[&str]) -> Task {
        let mut t = Task::new(
            uid,
            "pilot.0000",
            TaskDescription {
                executable: executable.into(),
                arguments: arguments.iter().map(|s| s.to_string()).collect(),
                ..Default::default()
            },
        );
        t.slots = Some(SlotAssignment {
            ranks: vec![RankSlot { node_index: 0, node_name: "n0".into(), cores: vec![0], gpus: vec![] }],
        });
        t.advance_to(TaskState::AgentExecutingPending).unwrap();
        t
    }

    async fn run_to_exit(h: &mut Harness, task: Task) -> Task {
        h.component.work(vec![task]).await.unwrap();
        let event = timeout(Duration::from_secs(10), h.component.exits_rx.recv())
            .await
            .expect("child exits")
            .expect("event");
        h.component.collect(event).await.unwrap();
        h.out_rx.recv().await.unwrap().pop().unwrap()
    }

    #[tokio::test]
    async fn echo_task_completes_with_stdout_tail() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        let task = run_to_exit(&mut h, pending("t.0", "/bin/echo", &["hi"])).await;

        assert_eq!(task.exit_code, Some(0));
        assert_eq!(task.target_state, Some(TaskState::Done));
        assert_eq!(task.state(), TaskState::AgentStagingOutputPending);
        assert!(task.stdout.starts_with("hi"));
    }

    #[tokio::test]
    async fn failing_task_targets_failed() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        let task = run_to_exit(&mut h, pending("t.0", "/bin/sh", &["-c", "exit 3"])).await;

        assert_eq!(task.exit_code, Some(3));
        assert_eq!(task.target_state, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn missing_executable_is_a_launch_failure_not_a_crash() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        // The shell reports 127 for a missing command; the executor maps any
        // non-zero exit to FAILED and keeps serving other tasks.
        let task = run_to_exit(&mut h, pending("t.0", "/no/such/binary", &[])).await;
        assert_ne!(task.exit_code, Some(0));
        assert_eq!(task.target_state, Some(TaskState::Failed));

        let ok = run_to_exit(&mut h, pending("t.1", "/bin/true", &[])).await;
        assert_eq!(ok.target_state, Some(TaskState::Done));
    }

    #[tokio::test]
    async fn slot_release_is_published_on_exit() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        let _task = run_to_exit(&mut h, pending("t.0", "/bin/true", &[])).await;

        let mut released = false;
        while let Ok(msg) = h.control_rx.try_recv() {
            if let ControlMessage::SlotRelease { uid, slots } = msg {
                assert_eq!(uid, "t.0");
                assert_eq!(slots.ranks.len(), 1);
                released = true;
            }
        }
        assert!(released);
    }

    #[tokio::test]
    async fn cancel_kills_the_process_group() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        h.component.work(vec![pending("t.0", "/bin/sleep", &["60"])]).await.unwrap();
        h.component.handle_cancel(vec!["t.0".to_string()]);

        let event = timeout(Duration::from_secs(5), h.component.exits_rx.recv())
            .await
            .expect("killed child exits")
            .expect("event");
        h.component.collect(event).await.unwrap();

        let task = h.out_rx.recv().await.unwrap().pop().unwrap();
        assert_eq!(task.target_state, Some(TaskState::Canceled));
        assert_ne!(task.exit_code, Some(0));
    }

    #[tokio::test]
    async fn rejected_shape_fails_before_spawn() {
        let dir = TempDir::new().unwrap();
        let mut h = harness(&dir);

        let mut task = pending("t.0", "/bin/true", &[]);
        task.description.ranks = 4;
        h.component.work(vec![task]).await.unwrap();

        let failed = h.out_rx.recv().await.unwrap().pop().unwrap();
        assert_eq!(failed.target_state, Some(TaskState::Failed));
        assert!(failed.exception.unwrap().contains("cannot launch"));
    }

    #[tokio::test]
    async fn exec_script_layers_env_pre_and_post() {
        let dir = TempDir::new().unwrap();
        let h = harness(&dir);

        let mut task = pending("t.0", "/bin/echo", &["x"]);
        task.description.environment.insert("GREETING".into(), "hello".into());
        task.description.pre_exec = vec!["touch pre.mark".into()];
        task.description.post_exec = vec!["touch post.mark".into()];

        let script = h.component.exec_script(&task);
        let rank = script.find("RP_RANK").unwrap();
        let env = script.find("export GREETING=\"hello\"").unwrap();
        let pre = script.find("touch pre.mark").unwrap();
        let exec = script.find("/bin/echo x").unwrap();
        let post = script.find("touch post.mark").unwrap();
        assert!(rank < env && env < pre && pre < exec && exec < post);
        assert!(script.ends_with("exit $RP_RET\n"));
    }
}
