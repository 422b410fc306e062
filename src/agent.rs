//! Agent-0 — the supervisor process running inside the pilot allocation.
//!
//! Boot order: resource discovery, registry publication, launch-method
//! probing, bridges, components (via the component manager), sub-agents.
//! The run loop then polls the mailbox for commands and new tasks, enforces
//! the pilot runtime, and watches component supervision.  The terminate
//! sequence mirrors startup in reverse and always leaves every task with a
//! terminal state in the mailbox.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{interval, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BridgeCatalog, TaskQueue, TaskQueueSender};
use crate::components::executor::ExecutorComponent;
use crate::components::manager::ComponentManager;
use crate::components::scheduler::SchedulerComponent;
use crate::components::staging_input::StagingInputComponent;
use crate::components::staging_output::StagingOutputComponent;
use crate::components::Component;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::lm;
use crate::mailbox::{CommandSpec, Mailbox, PilotMeta, PilotState};
use crate::messages::{ControlMessage, StateMessage};
use crate::raptor::{RaptorEvent, RaptorRouter};
use crate::registry::Registry;
use crate::rm::ResourceManager;
use crate::task::{Task, TaskState};

/// Why the agent stopped.  Decides the final pilot state and the process
/// exit code: `cancel → CANCELED`, `timeout → DONE`, anything else —
/// heartbeat loss, component crash, an external signal — `FAILED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalCause {
    /// `cancel_pilot` command from the client.
    Cancel,
    /// The pilot runtime deadline expired.
    Timeout,
    /// Everything else: heartbeat loss, component crash, external signal.
    Failure(String),
}

impl FinalCause {
    pub fn pilot_state(&self) -> PilotState {
        match self {
            FinalCause::Cancel => PilotState::Canceled,
            FinalCause::Timeout => PilotState::Done,
            FinalCause::Failure(_) => PilotState::Failed,
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            FinalCause::Cancel => 1,
            FinalCause::Timeout => 2,
            FinalCause::Failure(_) => 3,
        }
    }
}

pub struct Agent0<M: Mailbox> {
    cfg: AgentConfig,
    mailbox: Arc<M>,
}

struct SubAgent {
    uid: String,
    /// Process-group id; the child itself is owned by its exit watcher.
    pgid: i32,
}

impl<M: Mailbox> Agent0<M> {
    pub fn new(cfg: AgentConfig, mailbox: Arc<M>) -> Self {
        Self { cfg, mailbox }
    }

    /// Run the agent to completion.  Startup errors return `Err`; anything
    /// after startup resolves into a [`FinalCause`] with the terminate
    /// sequence already executed.
    pub async fn run(self) -> Result<FinalCause, AgentError> {
        let cfg = &self.cfg;
        tokio::fs::create_dir_all(&cfg.pilot_sandbox).await?;
        info!(
            pilot = %cfg.pilot_id,
            session = %cfg.session_id,
            sandbox = %cfg.pilot_sandbox.display(),
            "agent_0 starting"
        );

        // Resource discovery first: scheduler and executor need the node
        // inventory before they can start.
        let rm = ResourceManager::create(cfg)?;

        // Sub-agents rehydrate the launch method from the probe results in
        // their config; only the first agent probes from scratch.
        let (lm, lm_info) = match &cfg.lm_info {
            Some(info) => (lm::init_from_info(info)?, info.clone()),
            None => lm::create(&cfg.launch_method)?,
        };

        let registry = Registry::new();
        registry.put("rm.info", rm.info()).await?;
        registry.put("lm.info", &lm_info).await?;
        registry.put("pilot.cfg", &json!({
            "session_id": cfg.session_id,
            "pilot_id": cfg.pilot_id,
            "runtime_minutes": cfg.runtime_minutes,
        })).await?;

        // Bridges exist before any component runs.
        crate::bus::validate_catalog(&cfg.bridges)?;
        let mut bridges = BridgeCatalog::new();
        let mut raptor_requests = TaskQueue::new("raptor_request_queue", 256);
        let (raptor_events_tx, raptor_events_rx) = mpsc::channel::<RaptorEvent>(64);

        let staging_input_tx = bridges.staging_input.sender();
        let mut state_rx = bridges.state.subscribe();
        let control = bridges.control.clone();

        let run_raptor = cfg.components.iter().any(|c| c == "raptor");
        let components = self.build_components(
            &rm,
            Arc::from(lm),
            &mut bridges,
            &mut raptor_requests,
            raptor_events_rx,
            raptor_events_tx.clone(),
            run_raptor,
        )?;

        let cancel = CancellationToken::new();
        let mut cmgr = ComponentManager::start(
            components,
            control.clone(),
            cfg.heartbeat_interval(),
            cfg.heartbeat_timeout(),
            cancel.clone(),
        )
        .await?;

        let (sa_exit_tx, mut sa_exit_rx) = mpsc::channel::<String>(8);
        let sub_agents = self.start_sub_agents(&rm, &lm_info, &sa_exit_tx).await?;

        // Bridges up, components beating, sub-agents launched: the pilot is
        // active.  Resource details come from the registry, the single
        // source the client and sub-agents agree on.
        self.mailbox
            .update_pilot_meta(PilotMeta {
                state: Some(PilotState::PmgrActive),
                resource_details: Some(json!({
                    "rm_info": registry.get("rm.info").await,
                    "lm_info": registry.get("lm.info").await,
                })),
                ..Default::default()
            })
            .await?;

        let mut in_flight: HashMap<String, Task> = HashMap::new();
        let deadline = tokio::time::Instant::now() + cfg.runtime();
        let mut poll = interval(cfg.poll_interval());
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

        let cause = loop {
            tokio::select! {
                biased;

                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    control.publish(ControlMessage::Terminate);
                    break FinalCause::Cancel;
                }

                _ = sigterm.recv() => {
                    error!("termination signal received");
                    control.publish(ControlMessage::Terminate);
                    break FinalCause::Failure("terminated by external signal".into());
                }

                _ = sleep_until(deadline) => {
                    info!(runtime_minutes = cfg.runtime_minutes, "pilot runtime exceeded");
                    control.publish(ControlMessage::Terminate);
                    break FinalCause::Timeout;
                }

                err = cmgr.failed() => {
                    error!(error = %err, "component supervision failed");
                    break FinalCause::Failure(err.to_string());
                }

                Some(uid) = sa_exit_rx.recv() => {
                    error!(sub_agent = %uid, "sub-agent exited");
                    control.publish(ControlMessage::Terminate);
                    break FinalCause::Failure(format!("sub-agent {uid} exited"));
                }

                snapshot = state_rx.recv() => {
                    Self::track(&mut in_flight, snapshot);
                }

                _ = poll.tick() => {
                    match self.poll_mailbox(&control, &staging_input_tx, &mut in_flight).await {
                        Ok(Some(cause)) => break cause,
                        Ok(None) => {}
                        Err(e) => {
                            error!(error = %e, "mailbox poll failed");
                            break FinalCause::Failure(e.to_string());
                        }
                    }
                }
            }
        };

        self.finalize(cause, cmgr, rm, &registry, sub_agents, &mut state_rx, in_flight)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    fn build_components(
        &self,
        rm: &ResourceManager,
        lm: Arc<dyn lm::LaunchMethod>,
        bridges: &mut BridgeCatalog,
        raptor_requests: &mut TaskQueue,
        raptor_events_rx: mpsc::Receiver<RaptorEvent>,
        raptor_events_tx: mpsc::Sender<RaptorEvent>,
        run_raptor: bool,
    ) -> Result<Vec<Box<dyn Component>>, AgentError> {
        let cfg = &self.cfg;
        let mut components: Vec<Box<dyn Component>> = Vec::new();
        let mut raptor_events_rx = Some(raptor_events_rx);

        for name in &cfg.components {
            match name.as_str() {
                "staging_input" => components.push(Box::new(StagingInputComponent::new(
                    bridges.staging_input.take_receiver(),
                    bridges.scheduling.sender(),
                    bridges.staging_output.sender(),
                    bridges.control.clone(),
                    bridges.state.clone(),
                    cfg.heartbeat_interval(),
                    cfg.pilot_sandbox.clone(),
                ))),
                "scheduler" => components.push(Box::new(SchedulerComponent::new(
                    rm.info(),
                    bridges.scheduling.take_receiver(),
                    bridges.executing.sender(),
                    bridges.staging_output.sender(),
                    run_raptor.then(|| raptor_requests.sender()),
                    bridges.control.clone(),
                    bridges.state.clone(),
                    cfg.heartbeat_interval(),
                ))),
                "executor" => components.push(Box::new(ExecutorComponent::new(
                    bridges.executing.take_receiver(),
                    bridges.staging_output.sender(),
                    bridges.control.clone(),
                    bridges.state.clone(),
                    cfg.heartbeat_interval(),
                    lm.clone(),
                    cfg.pilot_sandbox.clone(),
                    run_raptor.then(|| raptor_events_tx.clone()),
                ))),
                "staging_output" => components.push(Box::new(StagingOutputComponent::new(
                    bridges.staging_output.take_receiver(),
                    bridges.control.clone(),
                    bridges.state.clone(),
                    cfg.heartbeat_interval(),
                    self.mailbox.clone(),
                    cfg.pilot_sandbox.clone(),
                ))),
                "raptor" => components.push(Box::new(RaptorRouter::new(
                    raptor_requests.take_receiver(),
                    raptor_events_rx
                        .take()
                        .ok_or_else(|| AgentError::Config("duplicate raptor component".into()))?,
                    bridges.staging_output.sender(),
                    bridges.control.clone(),
                    bridges.state.clone(),
                    cfg.heartbeat_interval(),
                    cfg.raptor_workers,
                ))),
                other => {
                    return Err(AgentError::Config(format!("unknown component: {other}")));
                }
            }
        }
        Ok(components)
    }

    /// One poll tick: drain commands, then claim and inject new tasks.
    async fn poll_mailbox(
        &self,
        control: &crate::bus::ControlBus,
        staging_input: &TaskQueueSender,
        in_flight: &mut HashMap<String, Task>,
    ) -> Result<Option<FinalCause>, AgentError> {
        for command in self.mailbox.drain_commands().await? {
            if let Some(cause) = self.handle_command(control, command) {
                return Ok(Some(cause));
            }
        }

        let claimed = self.mailbox.claim_pending_tasks().await?;
        if claimed.is_empty() {
            return Ok(None);
        }
        info!(count = claimed.len(), "tasks pulled");

        let mut batch = Vec::with_capacity(claimed.len());
        for mut task in claimed {
            if task.state().rank() > TaskState::AgentStagingInputPending.rank() {
                error!(uid = %task.uid, state = ?task.state(), "claimed task in invalid state");
                continue;
            }

            // Merge configured environment defaults under the task's own.
            for (key, value) in &self.cfg.task_environment {
                task.description
                    .environment
                    .entry(key.clone())
                    .or_insert_with(|| value.clone());
            }
            if task.sandbox_path.is_none() {
                let sandbox = match &task.description.sandbox {
                    Some(s) if PathBuf::from(s).is_absolute() => PathBuf::from(s),
                    Some(s) => self.cfg.pilot_sandbox.join(s),
                    None => self.cfg.pilot_sandbox.join(&task.uid),
                };
                task.sandbox_path = Some(sandbox);
            }
            if task.state() != TaskState::AgentStagingInputPending {
                task.advance_to(TaskState::AgentStagingInputPending)?;
            }
            in_flight.insert(task.uid.clone(), task.clone());
            batch.push(task);
        }
        staging_input.push(batch).await?;
        Ok(None)
    }

    fn handle_command(
        &self,
        control: &crate::bus::ControlBus,
        command: CommandSpec,
    ) -> Option<FinalCause> {
        debug!(cmd = %command.cmd, "mailbox command");
        match command.cmd.as_str() {
            "heartbeat" => {
                debug!("client heartbeat");
                None
            }
            "cancel_pilot" => {
                info!("cancel_pilot command");
                control.publish(ControlMessage::Terminate);
                Some(FinalCause::Cancel)
            }
            "cancel_tasks" => {
                let uids: Vec<String> = command
                    .arg
                    .get("uids")
                    .and_then(|v| serde_json::from_value(v.clone()).ok())
                    .unwrap_or_default();
                info!(count = uids.len(), "cancel_tasks command");
                control.publish(ControlMessage::CancelTasks { uids });
                None
            }
            other => {
                warn!(cmd = %other, "unknown command ignored");
                None
            }
        }
    }

    fn track(
        in_flight: &mut HashMap<String, Task>,
        snapshot: Result<StateMessage, broadcast::error::RecvError>,
    ) {
        match snapshot {
            Ok(msg) => {
                if msg.task.is_final() {
                    in_flight.remove(&msg.task.uid);
                } else {
                    in_flight.insert(msg.task.uid.clone(), msg.task);
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(missed = n, "agent lagged on state bus");
            }
            Err(_) => {}
        }
    }

    /// Start one sub-agent per configured layout, placed via the resource
    /// manager's reserved nodes.  Each child is handed to an exit watcher
    /// reporting on `sa_exit_tx`; any exit before shutdown is fatal.
    async fn start_sub_agents(
        &self,
        rm: &ResourceManager,
        lm_info: &lm::LmInfo,
        sa_exit_tx: &mpsc::Sender<String>,
    ) -> Result<Vec<SubAgent>, AgentError> {
        let cfg = &self.cfg;
        let mut sub_agents = Vec::new();

        for layout in &cfg.sub_agents {
            let slots = rm.slots_for_subagent(&layout.uid)?;
            let node = &slots.ranks[0].node_name;
            info!(sub_agent = %layout.uid, node = %node, "starting sub-agent");

            // The sub-agent gets this agent's config minus the sub-agent
            // list, restricted to its own component layout.
            let sa_cfg = json!({
                "session_id": cfg.session_id,
                "pilot_id": cfg.pilot_id,
                "mailbox": cfg.mailbox_path,
                "pilot_sandbox": cfg.pilot_sandbox,
                "resource_manager": cfg.resource_manager,
                "launch_method": cfg.launch_method,
                "runtime_minutes": cfg.runtime_minutes,
                "poll_interval_secs": cfg.poll_interval_secs,
                "heartbeat_interval_secs": cfg.heartbeat_interval_secs,
                "heartbeat_timeout_secs": cfg.heartbeat_timeout_secs,
                "cores_per_node": cfg.cores_per_node,
                "components": layout.components,
                "log_level": cfg.log_level,
                "lm_info": lm_info,
            });
            let cfg_path = cfg.pilot_sandbox.join(format!("{}.cfg", layout.uid));
            tokio::fs::write(&cfg_path, serde_json::to_vec_pretty(&sa_cfg)?).await?;

            let exe = std::env::current_exe()?;
            let stdout =
                std::fs::File::create(cfg.pilot_sandbox.join(format!("{}.out", layout.uid)))?;
            let stderr =
                std::fs::File::create(cfg.pilot_sandbox.join(format!("{}.err", layout.uid)))?;
            let mut child = tokio::process::Command::new(exe)
                .arg(&cfg_path)
                .current_dir(&cfg.pilot_sandbox)
                .process_group(0)
                .stdout(std::process::Stdio::from(stdout))
                .stderr(std::process::Stdio::from(stderr))
                .spawn()
                .map_err(|e| {
                    AgentError::Launch(format!("sub-agent {} spawn failed: {e}", layout.uid))
                })?;
            let pgid = child.id().map(|id| id as i32).unwrap_or(0);

            let uid = layout.uid.clone();
            let tx = sa_exit_tx.clone();
            tokio::spawn(async move {
                let _ = child.wait().await;
                let _ = tx.send(uid).await;
            });

            sub_agents.push(SubAgent { uid: layout.uid.clone(), pgid });
        }
        Ok(sub_agents)
    }

    /// Terminate sequence: flush output tarball, close the component
    /// manager, stop sub-agents and the RM, settle leftover tasks, write the
    /// final pilot record.
    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        cause: FinalCause,
        cmgr: ComponentManager,
        rm: ResourceManager,
        registry: &Registry,
        sub_agents: Vec<SubAgent>,
        state_rx: &mut broadcast::Receiver<StateMessage>,
        mut in_flight: HashMap<String, Task>,
    ) -> Result<FinalCause, AgentError> {
        info!(cause = ?cause, "agent terminating");
        let registry_keys = registry.keys().await;
        debug!(registry = ?registry_keys, "registry at shutdown");

        self.stage_output_tarball().await;

        if let Err(e) = cmgr.close().await {
            debug!(error = %e, "component manager closed with error");
        }
        for sa in &sub_agents {
            debug!(sub_agent = %sa.uid, "stopping sub-agent");
            let _ = nix::sys::signal::killpg(
                nix::unistd::Pid::from_raw(sa.pgid),
                nix::sys::signal::Signal::SIGTERM,
            );
        }
        rm.stop();

        // Catch up on transitions that raced the shutdown, then settle every
        // remaining in-flight task as CANCELED in the mailbox.
        while let Ok(msg) = state_rx.try_recv() {
            Self::track(&mut in_flight, Ok(msg));
        }
        for (_, mut task) in in_flight {
            task.cancel();
            let terminal = task.target_state.unwrap_or(TaskState::Canceled);
            if !task.is_final() {
                task.advance_to(terminal)?;
            }
            warn!(uid = %task.uid, state = ?terminal, "settling task at shutdown");
            self.mailbox.publish_final_state(&task).await?;
        }

        let meta = PilotMeta {
            state: Some(cause.pilot_state()),
            stdout: Some(self.read_own_tail("agent_0.out").await),
            stderr: Some(self.read_own_tail("agent_0.err").await),
            logfile: Some(self.read_own_tail(crate::logger::AGENT_LOG).await),
            ..Default::default()
        };
        self.mailbox.update_pilot_meta(meta).await?;

        info!(state = ?cause.pilot_state(), "pilot final state written");
        Ok(cause)
    }

    /// Pack files listed in `staging_output.txt` into `staging_output.tgz`
    /// for the client to fetch in one transfer.
    async fn stage_output_tarball(&self) {
        let listing = self.cfg.pilot_sandbox.join("staging_output.txt");
        let tarball = self.cfg.pilot_sandbox.join("staging_output.tgz");
        if !listing.is_file() || tarball.is_file() {
            return;
        }
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("tar zcf staging_output.tgz $(cat staging_output.txt)")
            .current_dir(&self.cfg.pilot_sandbox)
            .status()
            .await;
        match status {
            Ok(s) if s.success() => debug!("output tarball written"),
            Ok(s) => error!(status = %s, "output tarring failed"),
            Err(e) => error!(error = %e, "output tarring failed"),
        }
    }

    async fn read_own_tail(&self, name: &str) -> String {
        let path = self.cfg.pilot_sandbox.join(name);
        match tokio::fs::read(&path).await {
            Ok(data) => {
                let cut = data.len().min(1024);
                String::from_utf8_lossy(&data[..cut]).into_owned()
            }
            Err(_) => String::new(),
        }
    }
}
