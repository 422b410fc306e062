//! Agent-wide error types.
//!
//! Per-task errors (`Staging`, `Resource`, `Launch`) are recorded on the task
//! and never escape the owning component.  Agent-scope errors (`Config`,
//! `Timeout`, `HeartbeatLoss`, `Transport`) propagate to Agent-0, which
//! publishes `terminate`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("config error: {0}")]
    Config(String),

    #[error("staging error: {0}")]
    Staging(String),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("launch error: {0}")]
    Launch(String),

    #[error("timeout: {0}")]
    Timeout(String),

    #[error("heartbeat loss: {0}")]
    HeartbeatLoss(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("state error: {0}")]
    State(String),

    #[error("logger error: {0}")]
    Logger(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl AgentError {
    /// `true` for error kinds that stay within the owning component and are
    /// surfaced only via the task record.
    pub fn is_task_scoped(&self) -> bool {
        matches!(
            self,
            AgentError::Staging(_) | AgentError::Resource(_) | AgentError::Launch(_)
        )
    }
}
