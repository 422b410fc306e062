//! Wire messages for the control and state pub/sub bridges.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::task::{SlotAssignment, Task};

/// Verbs carried on the `CONTROL` pub/sub.
///
/// `Heartbeat` is published by every component at a fixed interval and
/// consumed by the component manager; the other verbs originate in Agent-0
/// (mailbox commands, runtime deadline) or in the executor (`SlotRelease`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "cmd", content = "arg", rename_all = "snake_case")]
pub enum ControlMessage {
    Terminate,
    CancelPilot,
    CancelTasks { uids: Vec<String> },
    SlotRelease { uid: String, slots: SlotAssignment },
    Heartbeat { uid: String, ts: DateTime<Utc> },
}

impl ControlMessage {
    pub fn heartbeat(uid: impl Into<String>) -> Self {
        ControlMessage::Heartbeat { uid: uid.into(), ts: Utc::now() }
    }
}

/// A task-state snapshot published on the `STATE` pub/sub.
///
/// The snapshot is published *before* the task is pushed to the next
/// component, so observers always see a transition no later than its
/// consumer does.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateMessage {
    pub task: Task,
    /// Component that performed the transition.
    pub origin: String,
}
