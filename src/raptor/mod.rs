//! Raptor — the optional in-pilot sub-scheduler for high-rate function
//! tasks.
//!
//! A task in `RAPTOR_MASTER` mode runs through the normal pipeline; when the
//! executor spawns it, the router bootstraps the master's request/response
//! channels and a fixed set of worker proxies.  Function-typed tasks tagged
//! with that master's uid arrive here from the scheduler, are dispatched
//! round-robin over the workers, and their results re-enter the pipeline at
//! `AGENT_STAGING_OUTPUT_PENDING`.  Opaque function payloads are delivered,
//! not interpreted: only the shell/exec shaped modes can run without an
//! external payload runtime.

use std::collections::HashMap;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ControlBus, StateBus, TaskQueueSender};
use crate::components::{Component, ComponentFuture, advance, fail_to_output};
use crate::error::AgentError;
use crate::messages::ControlMessage;
use crate::task::{Task, TaskDescription, TaskMode, TaskState};

/// Executor → router notifications about master lifecycles.
#[derive(Debug, Clone)]
pub enum RaptorEvent {
    MasterStarted { uid: String },
    MasterExited { uid: String },
}

/// A finished request on a master's response queue.
struct WorkerResult {
    task: Task,
}

struct MasterHandle {
    request_tx: mpsc::Sender<Task>,
}

/// Default worker-task descriptions for one master, mirroring the shapes a
/// client submits: defaulted executable, the master uid as argument and
/// `raptor_id`, `RAPTOR_WORKER` mode.
pub fn worker_descriptions(master_uid: &str, count: usize) -> Vec<TaskDescription> {
    (0..count)
        .map(|i| TaskDescription {
            uid: Some(format!("{master_uid}.worker.{i:04}")),
            mode: TaskMode::RaptorWorker,
            executable: "talipot-raptor-worker".to_string(),
            arguments: vec![master_uid.to_string()],
            named_env: Some("rp".to_string()),
            raptor_id: Some(master_uid.to_string()),
            ..Default::default()
        })
        .collect()
}

pub struct RaptorRouter {
    uid: String,
    /// Function tasks routed here by the scheduler.
    rx: mpsc::Receiver<Vec<Task>>,
    events_rx: mpsc::Receiver<RaptorEvent>,
    output: TaskQueueSender,
    control: ControlBus,
    control_rx: broadcast::Receiver<ControlMessage>,
    state: StateBus,
    heartbeat_interval: Duration,
    workers_per_master: usize,
    masters: HashMap<String, MasterHandle>,
    results_tx: mpsc::UnboundedSender<WorkerResult>,
    results_rx: mpsc::UnboundedReceiver<WorkerResult>,
}

impl RaptorRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Vec<Task>>,
        events_rx: mpsc::Receiver<RaptorEvent>,
        output: TaskQueueSender,
        control: ControlBus,
        state: StateBus,
        heartbeat_interval: Duration,
        workers_per_master: usize,
    ) -> Self {
        let control_rx = control.subscribe();
        let (results_tx, results_rx) = mpsc::unbounded_channel();
        Self {
            uid: "raptor.0".to_string(),
            rx,
            events_rx,
            output,
            control,
            control_rx,
            state,
            heartbeat_interval,
            workers_per_master: workers_per_master.max(1),
            masters: HashMap::new(),
            results_tx,
            results_rx,
        }
    }

    /// Bootstrap request/response channels and the worker set for a master.
    fn master_started(&mut self, uid: String) {
        if self.masters.contains_key(&uid) {
            return;
        }
        info!(master = %uid, workers = self.workers_per_master, "raptor master bootstrapping");

        let (request_tx, mut request_rx) = mpsc::channel::<Task>(256);

        let mut worker_txs = Vec::new();
        for td in worker_descriptions(&uid, self.workers_per_master) {
            let worker_uid = td.uid.clone().unwrap_or_default();
            let (tx, mut rx) = mpsc::channel::<Task>(64);
            worker_txs.push(tx);
            let results = self.results_tx.clone();
            tokio::spawn(async move {
                while let Some(task) = rx.recv().await {
                    debug!(worker = %worker_uid, uid = %task.uid, "worker executing request");
                    let task = execute_request(task).await;
                    if results.send(WorkerResult { task }).is_err() {
                        return;
                    }
                }
            });
        }

        // Round-robin dispatcher from the master's request queue.
        tokio::spawn(async move {
            let mut next = 0usize;
            while let Some(task) = request_rx.recv().await {
                if worker_txs[next % worker_txs.len()].send(task).await.is_err() {
                    return;
                }
                next += 1;
            }
        });

        self.masters.insert(uid, MasterHandle { request_tx });
    }

    async fn route(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        for task in tasks {
            let master_uid = task.description.raptor_id.clone().unwrap_or_default();
            match self.masters.get(&master_uid) {
                Some(master) => {
                    if master.request_tx.send(task).await.is_err() {
                        warn!(master = %master_uid, "request queue gone, master removed");
                        self.masters.remove(&master_uid);
                    }
                }
                None => {
                    let err = AgentError::Launch(format!(
                        "raptor master '{master_uid}' is not running"
                    ));
                    fail_to_output(&self.uid, task, &err, &self.state, &self.output).await?;
                }
            }
        }
        Ok(())
    }

    /// A worker result re-enters the pipeline at output staging.
    async fn collect(&mut self, result: WorkerResult) -> Result<(), AgentError> {
        advance(
            &self.uid,
            vec![result.task],
            TaskState::AgentStagingOutputPending,
            &self.state,
            &self.output,
        )
        .await
    }
}

/// Execute one request in a worker proxy.
///
/// Shell/exec shaped payloads run as child processes; opaque function
/// payloads need the external worker runtime and fail here.
async fn execute_request(mut task: Task) -> Task {
    let command = {
        let td = &task.description;
        match td.mode {
            TaskMode::Shell => {
                let mut line = td.executable.clone();
                for arg in &td.arguments {
                    line.push(' ');
                    line.push_str(arg);
                }
                let mut cmd = tokio::process::Command::new("/bin/sh");
                cmd.arg("-c").arg(line);
                Some(cmd)
            }
            TaskMode::Exec | TaskMode::Proc => {
                let mut cmd = tokio::process::Command::new(&td.executable);
                cmd.args(&td.arguments);
                Some(cmd)
            }
            _ => None,
        }
    };

    let Some(mut command) = command else {
        task.exception = Some(format!(
            "raptor worker cannot interpret payload mode {:?}",
            task.description.mode
        ));
        task.target_state = Some(TaskState::Failed);
        return task;
    };

    match command.envs(task.description.environment.clone()).output().await {
        Ok(out) => {
            task.exit_code = out.status.code();
            task.stdout = String::from_utf8_lossy(&out.stdout[..out.stdout.len().min(1024)]).into_owned();
            task.stderr = String::from_utf8_lossy(&out.stderr[..out.stderr.len().min(1024)]).into_owned();
            task.target_state = Some(if out.status.success() {
                TaskState::Done
            } else {
                TaskState::Failed
            });
        }
        Err(e) => {
            task.exception = Some(format!("worker spawn failed: {e}"));
            task.target_state = Some(TaskState::Failed);
        }
    }
    task
}

impl Component for RaptorRouter {
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

                    _ = shutdown.cancelled() => return Ok(()),

                    msg = this.control_rx.recv() => match msg {
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "raptor router lagged on control bus");
                        }
                        Err(_) => return Err(AgentError::Transport("control bus closed".into())),
                    },

                    _ = beat.tick() => {
                        this.control.publish(ControlMessage::heartbeat(&this.uid));
                    }

                    event = this.events_rx.recv() => match event {
                        Some(RaptorEvent::MasterStarted { uid }) => this.master_started(uid),
                        Some(RaptorEvent::MasterExited { uid }) => {
                            info!(master = %uid, "raptor master exited");
                            this.masters.remove(&uid);
                        }
                        None => return Err(AgentError::Transport("raptor event channel closed".into())),
                    },

                    result = this.results_rx.recv() => match result {
                        Some(result) => this.collect(result).await?,
                        None => return Err(AgentError::Transport("raptor result channel closed".into())),
                    },

                    batch = this.rx.recv() => match batch {
                        Some(tasks) => this.route(tasks).await?,
                        None => return Err(AgentError::Transport("raptor request queue closed".into())),
                    },
                }
            }
        })
    }
}
