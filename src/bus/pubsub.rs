//! Pub/sub bridges — broadcast buses for control verbs and state snapshots.
//!
//! Subscribers must exist before the first publish to observe it, which is
//! why the bridge catalog is built before any component starts and every
//! component subscribes during construction.

use tokio::sync::broadcast;

use crate::messages::{ControlMessage, StateMessage};

const CONTROL_CAPACITY: usize = 1024;
const STATE_CAPACITY: usize = 1024;

// ── Control bus ───────────────────────────────────────────────────────────────

/// The `CONTROL` pub/sub: terminate, cancellation, slot releases, heartbeats.
#[derive(Clone)]
pub struct ControlBus {
    tx: broadcast::Sender<ControlMessage>,
}

impl ControlBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CONTROL_CAPACITY);
        Self { tx }
    }

    /// Publish a control message.  A send with no live subscribers is not an
    /// error: during early startup and late shutdown nobody may be listening.
    pub fn publish(&self, msg: ControlMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ControlMessage> {
        self.tx.subscribe()
    }
}

impl Default for ControlBus {
    fn default() -> Self {
        Self::new()
    }
}

// ── State bus ─────────────────────────────────────────────────────────────────

/// The `STATE` pub/sub: one snapshot per task-state transition.
#[derive(Clone)]
pub struct StateBus {
    tx: broadcast::Sender<StateMessage>,
}

impl StateBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(STATE_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, msg: StateMessage) {
        let _ = self.tx.send(msg);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateMessage> {
        self.tx.subscribe()
    }
}

impl Default for StateBus {
    fn default() -> Self {
        Self::new()
    }
}
