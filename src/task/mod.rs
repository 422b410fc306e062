//! Task records — the unit of work moving through the agent pipeline.

pub mod description;
pub mod state;

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AgentError;

pub use description::{StagingAction, StagingDirective, TaskDescription, TaskMode};
pub use state::TaskState;

// ── Slots ─────────────────────────────────────────────────────────────────────

/// Placement of one rank: a node plus the core (and gpu) indices claimed on
/// it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RankSlot {
    pub node_index: usize,
    pub node_name: String,
    pub cores: Vec<usize>,
    #[serde(default)]
    pub gpus: Vec<usize>,
}

/// The scheduling decision for a task: one [`RankSlot`] per rank.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SlotAssignment {
    pub ranks: Vec<RankSlot>,
}

impl SlotAssignment {
    /// Distinct node names, in first-use order — handed to MPI launchers.
    pub fn node_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for r in &self.ranks {
            if !names.contains(&r.node_name) {
                names.push(r.node_name.clone());
            }
        }
        names
    }
}

// ── Task ──────────────────────────────────────────────────────────────────────

/// One entry of the append-only state history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateEntry {
    pub state: TaskState,
    pub timestamp: DateTime<Utc>,
}

/// Ownership marker used by the mailbox claim protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TaskControl {
    #[default]
    TmgrPending,
    AgentPending,
    Agent,
}

/// A task as the agent sees it: immutable description plus mutable runtime
/// record.  Only the component owning the current state may mutate a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub uid: String,
    pub pilot: String,
    pub description: TaskDescription,

    #[serde(default)]
    pub control: TaskControl,

    /// Append-only, monotone under the [`TaskState`] rank order.
    #[serde(default)]
    pub states: Vec<StateEntry>,

    #[serde(default)]
    pub slots: Option<SlotAssignment>,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exception: Option<String>,

    /// Set by a failing or cancelling component; the output-staging component
    /// resolves it into the terminal state.
    #[serde(default)]
    pub target_state: Option<TaskState>,

    /// Resolved on the agent side; not part of the client wire format.
    #[serde(default)]
    pub sandbox_path: Option<PathBuf>,
}

impl Task {
    pub fn new(uid: impl Into<String>, pilot: impl Into<String>, description: TaskDescription) -> Self {
        Self {
            uid: uid.into(),
            pilot: pilot.into(),
            description,
            control: TaskControl::TmgrPending,
            states: Vec::new(),
            slots: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            exception: None,
            target_state: None,
            sandbox_path: None,
        }
    }

    /// The current state: the latest history entry, or the initial pipeline
    /// state for a task that has not been advanced yet.
    pub fn state(&self) -> TaskState {
        self.states
            .last()
            .map(|e| e.state)
            .unwrap_or(TaskState::TmgrStagingInputPending)
    }

    pub fn is_final(&self) -> bool {
        self.state().is_final()
    }

    /// Append `to` to the state history, enforcing monotone advancement.
    pub fn advance_to(&mut self, to: TaskState) -> Result<(), AgentError> {
        self.state().check_advance(to)?;
        self.states.push(StateEntry { state: to, timestamp: Utc::now() });
        Ok(())
    }

    /// Record a per-task failure: remember the error and redirect the task
    /// towards output staging, where the terminal state is resolved.
    pub fn fail(&mut self, err: &AgentError) {
        self.exception = Some(err.to_string());
        self.target_state = Some(TaskState::Failed);
    }

    /// Mark the task for cancellation.  Idempotent; a task that already
    /// carries a terminal target keeps it.
    pub fn cancel(&mut self) {
        if self.target_state.is_none() {
            self.target_state = Some(TaskState::Canceled);
        }
    }

    /// Timestamp of the first history entry for `state`, if any.
    pub fn state_timestamp(&self, state: TaskState) -> Option<DateTime<Utc>> {
        self.states.iter().find(|e| e.state == state).map(|e| e.timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn echo_task() -> Task {
        Task::new(
            "task.0000",
            "pilot.0000",
            TaskDescription {
                executable: "/bin/echo".into(),
                arguments: vec!["hi".into()],
                ..Default::default()
            },
        )
    }

    #[test]
    fn fresh_task_starts_at_pipeline_head() {
        let t = echo_task();
        assert_eq!(t.state(), TaskState::TmgrStagingInputPending);
        assert!(!t.is_final());
    }

    #[test]
    fn history_is_monotone() {
        let mut t = echo_task();
        t.advance_to(TaskState::AgentStagingInputPending).unwrap();
        t.advance_to(TaskState::AgentStagingInput).unwrap();
        assert!(t.advance_to(TaskState::AgentStagingInputPending).is_err());
        assert_eq!(t.state(), TaskState::AgentStagingInput);
        assert_eq!(t.states.len(), 2);
    }

    #[test]
    fn terminal_is_sticky() {
        let mut t = echo_task();
        t.advance_to(TaskState::Done).unwrap();
        assert!(t.is_final());
        assert!(t.advance_to(TaskState::Failed).is_err());
        let finals = t.states.iter().filter(|e| e.state.is_final()).count();
        assert_eq!(finals, 1);
    }

    #[test]
    fn fail_records_exception_and_target() {
        let mut t = echo_task();
        t.fail(&AgentError::Staging("no such file".into()));
        assert_eq!(t.target_state, Some(TaskState::Failed));
        assert!(t.exception.as_deref().unwrap().contains("no such file"));
    }

    #[test]
    fn cancel_is_idempotent_and_never_downgrades_failed() {
        let mut t = echo_task();
        t.cancel();
        t.cancel();
        assert_eq!(t.target_state, Some(TaskState::Canceled));

        let mut f = echo_task();
        f.fail(&AgentError::Launch("spawn".into()));
        f.cancel();
        assert_eq!(f.target_state, Some(TaskState::Failed));
    }

    #[test]
    fn slot_node_names_deduplicate_in_order() {
        let slots = SlotAssignment {
            ranks: vec![
                RankSlot { node_index: 1, node_name: "n1".into(), cores: vec![0], gpus: vec![] },
                RankSlot { node_index: 0, node_name: "n0".into(), cores: vec![0], gpus: vec![] },
                RankSlot { node_index: 1, node_name: "n1".into(), cores: vec![1], gpus: vec![] },
            ],
        };
        assert_eq!(slots.node_names(), vec!["n1".to_string(), "n0".to_string()]);
    }

    #[test]
    fn task_round_trips_through_wire_format() {
        let mut t = echo_task();
        t.advance_to(TaskState::AgentStagingInputPending).unwrap();
        let json = serde_json::to_string(&t).unwrap();
        let back: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(back.uid, t.uid);
        assert_eq!(back.state(), TaskState::AgentStagingInputPending);
    }
}
