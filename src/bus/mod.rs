//! Bridges — the typed message buses connecting agent components.
//!
//! Bridges isolate components from each other: a component knows only its
//! inbound receiver and the senders it was handed at construction.  The
//! whole catalog is created up front (subscribers before publishers), then
//! components start, then traffic flows.

pub mod pubsub;
pub mod queue;

pub use pubsub::{ControlBus, StateBus};
pub use queue::{TaskQueue, TaskQueueSender};

use crate::error::AgentError;

/// Queue bridge names, in pipeline order.
pub const STAGING_INPUT_QUEUE: &str = "agent_staging_input_queue";
pub const SCHEDULING_QUEUE: &str = "agent_scheduling_queue";
pub const EXECUTING_QUEUE: &str = "agent_executing_queue";
pub const STAGING_OUTPUT_QUEUE: &str = "agent_staging_output_queue";
pub const CONTROL_PUBSUB: &str = "control_pubsub";
pub const STATE_PUBSUB: &str = "state_pubsub";

const QUEUE_CAPACITY: usize = 256;

/// Check a configured bridge catalog against the buses the pipeline needs.
/// An empty catalog means "the full standard set".
pub fn validate_catalog(names: &[String]) -> Result<(), AgentError> {
    if names.is_empty() {
        return Ok(());
    }
    for required in [
        STAGING_INPUT_QUEUE,
        SCHEDULING_QUEUE,
        EXECUTING_QUEUE,
        STAGING_OUTPUT_QUEUE,
        CONTROL_PUBSUB,
        STATE_PUBSUB,
    ] {
        if !names.iter().any(|n| n == required) {
            return Err(AgentError::Config(format!(
                "bridge catalog is missing '{required}'"
            )));
        }
    }
    Ok(())
}

/// All bridges of one agent process.
///
/// Receivers are handed out exactly once while the component set is built;
/// the sender sides stay cloneable for the life of the agent.
pub struct BridgeCatalog {
    pub staging_input: TaskQueue,
    pub scheduling: TaskQueue,
    pub executing: TaskQueue,
    pub staging_output: TaskQueue,
    pub control: ControlBus,
    pub state: StateBus,
}

impl BridgeCatalog {
    pub fn new() -> Self {
        Self {
            staging_input: TaskQueue::new(STAGING_INPUT_QUEUE, QUEUE_CAPACITY),
            scheduling: TaskQueue::new(SCHEDULING_QUEUE, QUEUE_CAPACITY),
            executing: TaskQueue::new(EXECUTING_QUEUE, QUEUE_CAPACITY),
            staging_output: TaskQueue::new(STAGING_OUTPUT_QUEUE, QUEUE_CAPACITY),
            control: ControlBus::new(),
            state: StateBus::new(),
        }
    }
}

impl Default for BridgeCatalog {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_catalog_means_standard_set() {
        assert!(validate_catalog(&[]).is_ok());
    }

    #[test]
    fn full_catalog_passes() {
        let names: Vec<String> = [
            STAGING_INPUT_QUEUE,
            SCHEDULING_QUEUE,
            EXECUTING_QUEUE,
            STAGING_OUTPUT_QUEUE,
            CONTROL_PUBSUB,
            STATE_PUBSUB,
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        assert!(validate_catalog(&names).is_ok());
    }

    #[test]
    fn missing_bridge_is_config_error() {
        let names = vec![STAGING_INPUT_QUEUE.to_string()];
        let err = validate_catalog(&names).unwrap_err();
        assert!(err.to_string().contains("agent_scheduling_queue"));
    }
}
