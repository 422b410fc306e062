//! Task descriptions — the immutable, client-authored half of a task.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

// ── TaskMode ──────────────────────────────────────────────────────────────────

/// What kind of payload the task carries.
///
/// `Executable` tasks run through the scheduler/executor pipeline.  The
/// function-typed modes carry opaque payloads that are delivered to a raptor
/// master instead of being interpreted by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskMode {
    #[default]
    Executable,
    Function,
    Eval,
    Exec,
    Proc,
    Shell,
    Method,
    RaptorMaster,
    RaptorWorker,
    AgentService,
}

impl TaskMode {
    /// Modes routed to a raptor master when `raptor_id` is set.
    pub fn is_function_typed(&self) -> bool {
        matches!(
            self,
            TaskMode::Function
                | TaskMode::Eval
                | TaskMode::Exec
                | TaskMode::Proc
                | TaskMode::Shell
                | TaskMode::Method
        )
    }
}

// ── Staging directives ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StagingAction {
    Link,
    Copy,
    Move,
    Tarball,
    Transfer,
}

impl StagingAction {
    /// `true` for actions the agent enacts locally.  `Transfer` belongs to
    /// the client side and must not reach the agent.
    pub fn is_local(&self) -> bool {
        !matches!(self, StagingAction::Transfer)
    }
}

/// A declarative file-movement step bound to a task.
///
/// Source and target are URLs resolved against the sandbox context
/// (`task://`, `pilot://`, `session://`, `resource://`, `endpoint://`,
/// `file://`, or a bare path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagingDirective {
    pub action: StagingAction,
    pub source: String,
    #[serde(default)]
    pub target: String,
    #[serde(default)]
    pub flags: Vec<String>,
}

// ── TaskDescription ───────────────────────────────────────────────────────────

/// Client-authored task description.  Immutable once the task enters the
/// agent; the agent only ever merges configured environment defaults into
/// `environment`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TaskDescription {
    #[serde(default)]
    pub uid: Option<String>,

    #[serde(default)]
    pub mode: TaskMode,

    #[serde(default)]
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub environment: HashMap<String, String>,
    #[serde(default)]
    pub pre_exec: Vec<String>,
    #[serde(default)]
    pub post_exec: Vec<String>,

    #[serde(default = "default_one")]
    pub ranks: u32,
    #[serde(default = "default_one")]
    pub cores_per_rank: u32,
    #[serde(default)]
    pub gpus_per_rank: u32,
    #[serde(default)]
    pub threading_type: Option<String>,
    #[serde(default)]
    pub use_mpi: Option<bool>,

    /// Scheduling class: higher runs first, FIFO within a class.
    #[serde(default)]
    pub priority: i32,

    #[serde(default)]
    pub sandbox: Option<String>,
    #[serde(default)]
    pub input_staging: Vec<StagingDirective>,
    #[serde(default)]
    pub output_staging: Vec<StagingDirective>,

    #[serde(default)]
    pub raptor_id: Option<String>,
    #[serde(default)]
    pub named_env: Option<String>,
}

fn default_one() -> u32 {
    1
}

impl TaskDescription {
    /// Whether the task requires an MPI-capable launch method: explicit
    /// `use_mpi` wins, otherwise any multi-rank task counts as MPI.
    pub fn wants_mpi(&self) -> bool {
        self.use_mpi.unwrap_or(self.ranks > 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_minimal_description() {
        let td: TaskDescription =
            serde_json::from_str(r#"{"executable": "/bin/echo", "arguments": ["hi"]}"#).unwrap();
        assert_eq!(td.ranks, 1);
        assert_eq!(td.cores_per_rank, 1);
        assert_eq!(td.gpus_per_rank, 0);
        assert_eq!(td.mode, TaskMode::Executable);
        assert!(td.input_staging.is_empty());
        assert!(!td.wants_mpi());
    }

    #[test]
    fn multi_rank_implies_mpi_unless_overridden() {
        let mut td = TaskDescription { ranks: 4, ..Default::default() };
        assert!(td.wants_mpi());
        td.use_mpi = Some(false);
        assert!(!td.wants_mpi());
    }

    #[test]
    fn function_typed_modes() {
        assert!(TaskMode::Shell.is_function_typed());
        assert!(TaskMode::Function.is_function_typed());
        assert!(!TaskMode::Executable.is_function_typed());
        assert!(!TaskMode::RaptorMaster.is_function_typed());
    }

    #[test]
    fn staging_action_locality() {
        assert!(StagingAction::Link.is_local());
        assert!(StagingAction::Tarball.is_local());
        assert!(!StagingAction::Transfer.is_local());
    }

    #[test]
    fn mode_wire_names() {
        let m: TaskMode = serde_json::from_str("\"RAPTOR_MASTER\"").unwrap();
        assert_eq!(m, TaskMode::RaptorMaster);
    }
}
