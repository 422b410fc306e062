//! Staging-output component — enacts local stage-out directives and settles
//! each task into its terminal state.
//!
//! Two kinds of arrivals share the inbound queue: tasks completing normally
//! (in `AGENT_STAGING_OUTPUT_PENDING`) and tasks short-circuited by failure
//! or cancellation (already in `TMGR_STAGING_OUTPUT_PENDING`, with a
//! `target_state` set).  Output staging is attempted for both; the terminal
//! state is decided here, recorded exactly once, and written to the mailbox.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::bus::{ControlBus, StateBus};
use crate::error::AgentError;
use crate::mailbox::Mailbox;
use crate::messages::ControlMessage;
use crate::staging::{SandboxContext, enact};
use crate::task::{Task, TaskState};

use super::{Component, ComponentFuture, publish_state};

pub struct StagingOutputComponent<M: Mailbox> {
    uid: String,
    rx: mpsc::Receiver<Vec<Task>>,
    control: ControlBus,
    control_rx: broadcast::Receiver<ControlMessage>,
    state: StateBus,
    heartbeat_interval: Duration,
    mailbox: Arc<M>,
    pilot_sandbox: PathBuf,
    session_sandbox: PathBuf,
}

impl<M: Mailbox> StagingOutputComponent<M> {
    pub fn new(
        rx: mpsc::Receiver<Vec<Task>>,
        control: ControlBus,
        state: StateBus,
        heartbeat_interval: Duration,
        mailbox: Arc<M>,
        pilot_sandbox: PathBuf,
    ) -> Self {
        let control_rx = control.subscribe();
        let session_sandbox = pilot_sandbox
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| pilot_sandbox.clone());
        Self {
            uid: "staging_output.0".to_string(),
            rx,
            control,
            control_rx,
            state,
            heartbeat_interval,
            mailbox,
            pilot_sandbox,
            session_sandbox,
        }
    }

    async fn work(&mut self, tasks: Vec<Task>) -> Result<(), AgentError> {
        for task in tasks {
            self.handle_task(task).await?;
        }
        Ok(())
    }

    async fn handle_task(&mut self, mut task: Task) -> Result<(), AgentError> {
        match task.state() {
            TaskState::AgentStagingOutputPending => {
                task.advance_to(TaskState::AgentStagingOutput)?;
                publish_state(&self.uid, &task, &self.state);

                if let Err(e) = self.stage(&task).await {
                    warn!(uid = %task.uid, error = %e, "output staging failed");
                    task.fail(&e);
                }
                task.advance_to(TaskState::TmgrStagingOutputPending)?;
                publish_state(&self.uid, &task, &self.state);
            }
            TaskState::TmgrStagingOutputPending => {
                // Failure/cancel short-circuit: output is still attempted,
                // but a second failure cannot change the routing decision.
                if let Err(e) = self.stage(&task).await {
                    debug!(uid = %task.uid, error = %e, "best-effort output staging failed");
                }
            }
            other => {
                return Err(AgentError::State(format!(
                    "staging output received task {} in {other:?}",
                    task.uid
                )));
            }
        }

        let terminal = task.target_state.unwrap_or(TaskState::Done);
        task.advance_to(terminal)?;
        publish_state(&self.uid, &task, &self.state);
        info!(uid = %task.uid, state = ?terminal, exit_code = ?task.exit_code, "task finalised");

        self.mailbox.publish_final_state(&task).await
    }

    async fn stage(&self, task: &Task) -> Result<(), AgentError> {
        let actionables: Vec<_> = task
            .description
            .output_staging
            .iter()
            .filter(|sd| sd.action.is_local())
            .collect();
        if actionables.is_empty() {
            return Ok(());
        }

        let sandbox = task
            .sandbox_path
            .clone()
            .unwrap_or_else(|| self.pilot_sandbox.join(&task.uid));
        let ctx = SandboxContext::for_task(&sandbox, &self.pilot_sandbox, &self.session_sandbox);
        for sd in actionables {
            debug!(uid = %task.uid, action = ?sd.action, source = %sd.source, "staging out");
            enact(&task.uid, sd, &ctx).await?;
        }
        Ok(())
    }
}

impl<M: Mailbox> Component for StagingOutputComponent<M> {
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
                            warn!(missed = n, "staging output lagged on control bus");
                        }
                        Err(_) => return Err(AgentError::Transport("control bus closed".into())),
                    },

                    _ = beat.tick() => {
                        this.control.publish(ControlMessage::heartbeat(&this.uid));
                    }

                    batch = this.rx.recv() => match batch {
                        Some(tasks) => this.work(tasks).await?,
                        None => return Err(AgentError::Transport("staging output queue closed".into())),
                    },
                }
            }
        })
    }
}
