//! Components — the single-writer pipeline stages of one agent.
//!
//! Each component runs as an independent tokio task owned by the
//! [`manager::ComponentManager`], receives task batches on its inbound queue
//! bridge, and talks to the rest of the agent only through bridges.  All
//! mutation of a task happens in the component owning its current state.

pub mod executor;
pub mod manager;
pub mod scheduler;
pub mod staging_input;
pub mod staging_output;

use std::pin::Pin;

use tokio_util::sync::CancellationToken;

use crate::bus::{StateBus, TaskQueueSender};
use crate::error::AgentError;
use crate::messages::StateMessage;
use crate::task::{Task, TaskState};

/// A boxed, owned future returned by [`Component::run`].
pub type ComponentFuture = Pin<Box<dyn Future<Output = Result<(), AgentError>> + Send + 'static>>;

/// A self-contained pipeline stage.
///
/// Implementors capture their bridge ends at construction time.  `run` is
/// called once by the component manager and must loop until `shutdown` is
/// cancelled; returning earlier — with or without an error — is treated as
/// fatal for the whole agent.
pub trait Component: Send + 'static {
    /// Stable identifier, also the heartbeat uid.
    fn uid(&self) -> &str;

    fn run(self: Box<Self>, shutdown: CancellationToken) -> ComponentFuture;
}

/// Publish one task-state snapshot.
pub fn publish_state(origin: &str, task: &Task, state_bus: &StateBus) {
    state_bus.publish(StateMessage { task: task.clone(), origin: origin.to_string() });
}

/// Advance a batch to `to`, publish each snapshot, then push the batch to
/// the next component.
///
/// The publish happens before the push so a transition is visible on the
/// state pub/sub no later than the next component sees the task.
pub async fn advance(
    origin: &str,
    mut tasks: Vec<Task>,
    to: TaskState,
    state_bus: &StateBus,
    push: &TaskQueueSender,
) -> Result<(), AgentError> {
    for task in &mut tasks {
        task.advance_to(to)?;
        publish_state(origin, task, state_bus);
    }
    push.push(tasks).await
}

/// Route a task that failed inside `origin` towards output staging: record
/// the error, short-circuit the state machine, publish, push.
pub async fn fail_to_output(
    origin: &str,
    mut task: Task,
    err: &AgentError,
    state_bus: &StateBus,
    output: &TaskQueueSender,
) -> Result<(), AgentError> {
    tracing::warn!(uid = %task.uid, error = %err, "task failed in {origin}");
    task.fail(err);
    task.advance_to(TaskState::TmgrStagingOutputPending)?;
    publish_state(origin, &task, state_bus);
    output.push(vec![task]).await
}

/// Route a cancelled task towards output staging with
/// `target_state = CANCELED`.  No-op state-wise if the task already carries
/// a terminal target.
pub async fn cancel_to_output(
    origin: &str,
    mut task: Task,
    state_bus: &StateBus,
    output: &TaskQueueSender,
) -> Result<(), AgentError> {
    tracing::info!(uid = %task.uid, "task cancelled in {origin}");
    task.cancel();
    task.advance_to(TaskState::TmgrStagingOutputPending)?;
    publish_state(origin, &task, state_bus);
    output.push(vec![task]).await
}
