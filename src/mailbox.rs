//! Mailbox — the external document store used as an asynchronous channel
//! between the client and the agent.
//!
//! The agent needs four operations: claim pending tasks, drain pilot
//! commands, update the pilot document, and publish terminal task states.
//! Any storage backend providing them can be substituted; [`FsMailbox`] is
//! the file-backed implementation, one JSON document per entity with
//! atomic replace-on-write.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::error::AgentError;
use crate::task::{Task, TaskControl};

// ── Documents ─────────────────────────────────────────────────────────────────

/// Pilot lifecycle states as seen by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PilotState {
    PmgrLaunching,
    PmgrActive,
    Done,
    Failed,
    Canceled,
}

/// One command appended by the client: `{"cmd": ..., "arg": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandSpec {
    pub cmd: String,
    #[serde(default)]
    pub arg: Value,
}

/// The pilot document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PilotDocument {
    pub uid: String,
    #[serde(rename = "type", default = "pilot_type")]
    pub doc_type: String,
    pub state: PilotState,
    #[serde(default)]
    pub cmd: Vec<CommandSpec>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub logfile: String,
    #[serde(default)]
    pub resource_details: Value,
}

fn pilot_type() -> String {
    "pilot".to_string()
}

/// A task document: the task record plus its collection tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDocument {
    #[serde(rename = "type", default = "task_type")]
    pub doc_type: String,
    #[serde(flatten)]
    pub task: Task,
}

fn task_type() -> String {
    "task".to_string()
}

/// Partial pilot update applied by [`Mailbox::update_pilot_meta`].
#[derive(Debug, Clone, Default)]
pub struct PilotMeta {
    pub state: Option<PilotState>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub logfile: Option<String>,
    pub resource_details: Option<Value>,
}

// ── Mailbox ───────────────────────────────────────────────────────────────────

/// Agent-side mailbox operations.
pub trait Mailbox: Send + Sync + 'static {
    /// Atomically claim all tasks with `control == agent_pending`: flip them
    /// to `agent` *before* returning them, so a concurrent poll cannot claim
    /// the same tasks again.
    fn claim_pending_tasks(&self) -> impl Future<Output = Result<Vec<Task>, AgentError>> + Send;

    /// Atomically read and wipe the pilot command list.
    fn drain_commands(&self) -> impl Future<Output = Result<Vec<CommandSpec>, AgentError>> + Send;

    /// Merge `meta` into the pilot document.
    fn update_pilot_meta(
        &self,
        meta: PilotMeta,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;

    /// Write a task's terminal record back for the client to collect.
    fn publish_final_state(
        &self,
        task: &Task,
    ) -> impl Future<Output = Result<(), AgentError>> + Send;
}

// ── FsMailbox ─────────────────────────────────────────────────────────────────

/// File-backed mailbox: `<root>/pilot.json` plus `<root>/tasks/<uid>.json`.
///
/// Writes go through a temp file and `rename`, and every compound operation
/// holds the store mutex, so agent-side operations are atomic with respect
/// to each other.
pub struct FsMailbox {
    root: PathBuf,
    tasks_dir: PathBuf,
    pilot_id: String,
    lock: Mutex<()>,
}

impl FsMailbox {
    pub fn open(root: &Path, pilot_id: &str) -> Result<Self, AgentError> {
        let tasks_dir = root.join("tasks");
        std::fs::create_dir_all(&tasks_dir)?;
        Ok(Self {
            root: root.to_path_buf(),
            tasks_dir,
            pilot_id: pilot_id.to_string(),
            lock: Mutex::new(()),
        })
    }

    fn pilot_path(&self) -> PathBuf {
        self.root.join("pilot.json")
    }

    fn task_path(&self, uid: &str) -> PathBuf {
        self.tasks_dir.join(format!("{uid}.json"))
    }

    async fn write_atomic(&self, path: &Path, value: &impl Serialize) -> Result<(), AgentError> {
        let tmp = path.with_extension(format!("tmp.{}", Uuid::new_v4()));
        let data = serde_json::to_vec_pretty(value)?;
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }

    async fn read_pilot_doc(&self) -> Result<PilotDocument, AgentError> {
        let path = self.pilot_path();
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(serde_json::from_slice(&data)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(PilotDocument {
                uid: self.pilot_id.clone(),
                doc_type: pilot_type(),
                state: PilotState::PmgrLaunching,
                cmd: Vec::new(),
                stdout: String::new(),
                stderr: String::new(),
                logfile: String::new(),
                resource_details: Value::Null,
            }),
            Err(e) => Err(e.into()),
        }
    }

    // Client-side operations, used by drivers and tests to play the task
    // manager's role against the same store.

    /// Submit a task for the agent to claim.
    pub async fn submit_task(&self, mut task: Task) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        task.control = TaskControl::AgentPending;
        let path = self.task_path(&task.uid);
        let doc = TaskDocument { doc_type: task_type(), task };
        self.write_atomic(&path, &doc).await
    }

    /// Append a command to the pilot document.
    pub async fn send_command(&self, cmd: &str, arg: Value) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_pilot_doc().await?;
        doc.cmd.push(CommandSpec { cmd: cmd.to_string(), arg });
        self.write_atomic(&self.pilot_path(), &doc).await
    }

    /// Read back one task document.
    pub async fn read_task(&self, uid: &str) -> Result<Task, AgentError> {
        let data = tokio::fs::read(self.task_path(uid)).await?;
        let doc: TaskDocument = serde_json::from_slice(&data)?;
        Ok(doc.task)
    }

    /// Read back the pilot document.
    pub async fn read_pilot(&self) -> Result<PilotDocument, AgentError> {
        self.read_pilot_doc().await
    }
}

impl Mailbox for FsMailbox {
    async fn claim_pending_tasks(&self) -> Result<Vec<Task>, AgentError> {
        let _guard = self.lock.lock().await;

        let mut claimed = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.tasks_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let data = tokio::fs::read(&path).await?;
            let Ok(mut doc) = serde_json::from_slice::<TaskDocument>(&data) else {
                continue;
            };
            if doc.task.pilot != self.pilot_id || doc.task.control != TaskControl::AgentPending {
                continue;
            }
            // Flip ownership on disk before handing the task out.
            doc.task.control = TaskControl::Agent;
            self.write_atomic(&path, &doc).await?;
            claimed.push(doc.task);
        }

        claimed.sort_by(|a, b| a.uid.cmp(&b.uid));
        if !claimed.is_empty() {
            debug!(count = claimed.len(), "tasks claimed from mailbox");
        }
        Ok(claimed)
    }

    async fn drain_commands(&self) -> Result<Vec<CommandSpec>, AgentError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_pilot_doc().await?;
        if doc.cmd.is_empty() {
            return Ok(Vec::new());
        }
        let commands = std::mem::take(&mut doc.cmd);
        self.write_atomic(&self.pilot_path(), &doc).await?;
        Ok(commands)
    }

    async fn update_pilot_meta(&self, meta: PilotMeta) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let mut doc = self.read_pilot_doc().await?;
        if let Some(state) = meta.state {
            doc.state = state;
        }
        if let Some(stdout) = meta.stdout {
            doc.stdout = stdout;
        }
        if let Some(stderr) = meta.stderr {
            doc.stderr = stderr;
        }
        if let Some(logfile) = meta.logfile {
            doc.logfile = logfile;
        }
        if let Some(details) = meta.resource_details {
            doc.resource_details = details;
        }
        self.write_atomic(&self.pilot_path(), &doc).await
    }

    async fn publish_final_state(&self, task: &Task) -> Result<(), AgentError> {
        let _guard = self.lock.lock().await;
        let mut task = task.clone();
        task.control = TaskControl::TmgrPending;
        let path = self.task_path(&task.uid);
        let doc = TaskDocument { doc_type: task_type(), task };
        self.write_atomic(&path, &doc).await
    }
}
