//! Staging-input component — enacts local stage-in directives.
//!
//! Tasks with no actionable directives are forwarded to scheduling as a
//! bulk without touching the filesystem; the rest are handled one by one so
//! a slow staging op never stalls the fast path.

use std::collections::HashSet;
use std::path::PathBuf;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::bus::{ControlBus, StateBus, TaskQueueSender};
use crate::error::AgentError;
use crate::messages::ControlMessage;
use crate::staging::{SandboxContext, enact};
use crate::task::{StagingDirective, Task, TaskState};

use super::{Component, ComponentFuture, advance, cancel_to_output, fail_to_output, publish_state};

pub struct StagingInputComponent {
    uid: String,
    rx: mpsc::Receiver<Vec<Task>>,
    scheduling: TaskQueueSender,
    output: TaskQueueSender,
    control: ControlBus,
    control_rx: broadcast::Receiver<ControlMessage>,
    state: StateBus,
    heartbeat_interval: Duration,
    pilot_sandbox: PathBuf,
    session_sandbox: PathBuf,
    cancelled: HashSet<String>,
}

impl StagingInputComponent {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rx: mpsc::Receiver<Vec<Task>>,
        scheduling: TaskQueueSender,
        output: TaskQueueSender,
        control: ControlBus,
        state: StateBus,
        heartbeat_interval: Duration,
        pilot_sandbox: PathBuf,
    ) -> Self {
        let control_rx = control.subscribe();
        let session_sandbox = pilot_sandbox
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| pilot_sandbox.clone());
        Self {
            uid: "staging_input.0".to_string(),
            rx,
            scheduling,
            output,
            control,
            control_rx,
            state,
            heartbeat_interval,
            pilot_sandbox,
            session_sandbox,
            cancelled: HashSet::new(),
        }
    }

    fn actionables(task: &Task) -> Vec<StagingDirective> {
        task.description
            .input_staging
            .iter()
            .filter(|sd| sd.action.is_local())
            .cloned()
            .collect()
    }

    async fn work(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        // Split the batch: tasks with nothing to stage advance as one bulk.
        let mut no_staging = Vec::new();
        let mut staging = Vec::new();

        for task in tasks {
            if self.cancelled.remove(&task.uid) {
                cancel_to_output(&self.uid, task, &self.state, &self.output).await?;
                continue;
            }
            // TRANSFER must not reach the agent; treat it as a per-task error.
            if task.description.input_staging.iter().any(|sd| !sd.action.is_local()) {
                let err = AgentError::Staging(format!(
                    "TRANSFER directive reached the agent for task {}",
                    task.uid
                ));
                fail_to_output(&self.uid, task, &err, &self.state, &self.output).await?;
                continue;
            }
            let actionables = Self::actionables(&task);
            if actionables.is_empty() {
                no_staging.push(task);
            } else {
                staging.push((task, actionables));
            }
        }

        if !no_staging.is_empty() {
            advance(
                &self.uid,
                no_staging,
                TaskState::AgentSchedulingPending,
                &self.state,
                &self.scheduling,
            )
            .await?;
        }

        for (task, actionables) in staging {
            self.handle_task(task, actionables).await?;
        }
        Ok(())
    }

    async fn handle_task(
        &mut self,
        mut task: Task,
        actionables: Vec<StagingDirective>,
    ) -> Result<(), AgentError> {
        task.advance_to(TaskState::AgentStagingInput)?;
        publish_state(&self.uid, &task, &self.state);

        match self.stage(&task, &actionables).await {
            Ok(()) => {
                advance(
                    &self.uid,
                    vec![task],
                    TaskState::AgentSchedulingPending,
                    &self.state,
                    &self.scheduling,
                )
                .await
            }
            Err(e) => fail_to_output(&self.uid, task, &e, &self.state, &self.output).await,
        }
    }

    async fn stage(&self, task: &Task, actionables: &[StagingDirective]) -> Result<(), AgentError> {
        let sandbox = task
            .sandbox_path
            .clone()
            .unwrap_or_else(|| self.pilot_sandbox.join(&task.uid));
        tokio::fs::create_dir_all(&sandbox).await?;

        let ctx = SandboxContext::for_task(&sandbox, &self.pilot_sandbox, &self.session_sandbox);
        for sd in actionables {
            debug!(uid = %task.uid, action = ?sd.action, source = %sd.source, "staging in");
            enact(&task.uid, sd, &ctx).await?;
        }
        Ok(())
    }
}

impl Component for StagingInputComponent {
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
                        Ok(ControlMessage::CancelTasks { uids }) => {
                            this.cancelled.extend(uids);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(missed = n, "staging input lagged on control bus");
                        }
                        Err(_) => return Err(AgentError::Transport("control bus closed".into())),
                    },

                    _ = beat.tick() => {
                        this.control.publish(ControlMessage::heartbeat(&this.uid));
                    }

                    batch = this.rx.recv() => match batch {
                        Some(tasks) => this.work(tasks).await?,
                        None => return Err(AgentError::Transport("staging input queue closed".into())),
                    },
                }
            }
        })
    }
}
