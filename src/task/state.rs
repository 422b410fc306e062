//! Task state machine — the ordered pipeline states and their transition rules.
//!
//! A task arrives at a component in a `*_PENDING` state, is advanced to the
//! matching active state while the component works, and is pushed onward in
//! the next `*_PENDING` state.  `DONE`, `FAILED` and `CANCELED` share the
//! final rank; once any of them is recorded, no further transition is legal.

use serde::{Deserialize, Serialize};

use crate::error::AgentError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    TmgrStagingInputPending,
    AgentStagingInputPending,
    AgentStagingInput,
    AgentSchedulingPending,
    AgentScheduling,
    AgentExecutingPending,
    AgentExecuting,
    AgentStagingOutputPending,
    AgentStagingOutput,
    TmgrStagingOutputPending,
    Done,
    Failed,
    Canceled,
}

impl TaskState {
    /// Position in the pipeline order.  The three terminal states share the
    /// maximal rank.
    pub fn rank(&self) -> u8 {
        match self {
            TaskState::TmgrStagingInputPending => 0,
            TaskState::AgentStagingInputPending => 1,
            TaskState::AgentStagingInput => 2,
            TaskState::AgentSchedulingPending => 3,
            TaskState::AgentScheduling => 4,
            TaskState::AgentExecutingPending => 5,
            TaskState::AgentExecuting => 6,
            TaskState::AgentStagingOutputPending => 7,
            TaskState::AgentStagingOutput => 8,
            TaskState::TmgrStagingOutputPending => 9,
            TaskState::Done | TaskState::Failed | TaskState::Canceled => 10,
        }
    }

    pub fn is_final(&self) -> bool {
        matches!(self, TaskState::Done | TaskState::Failed | TaskState::Canceled)
    }

    /// Check that `self → to` is a legal advancement: strictly forward in
    /// rank, and never away from a terminal state.
    pub fn check_advance(&self, to: TaskState) -> Result<(), AgentError> {
        if self.is_final() {
            return Err(AgentError::State(format!(
                "task already terminal in {self:?}, cannot advance to {to:?}"
            )));
        }
        if to.rank() <= self.rank() {
            return Err(AgentError::State(format!(
                "non-monotone advance {self:?} -> {to:?}"
            )));
        }
        Ok(())
    }
}
