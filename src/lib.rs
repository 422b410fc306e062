//! talipot-agent — a pilot-job agent runtime.
//!
//! `agent_0` runs inside a resource allocation, pulls tasks from a mailbox
//! shared with the client, and drives them through a pipeline of staging,
//! scheduling, execution and collection components connected by typed
//! in-process bridges and supervised by heartbeats.

pub mod agent;
pub mod bus;
pub mod components;
pub mod config;
pub mod error;
pub mod lm;
pub mod logger;
pub mod mailbox;
pub mod messages;
pub mod raptor;
pub mod registry;
pub mod rm;
pub mod staging;
pub mod task;

pub use agent::{Agent0, FinalCause};
pub use config::AgentConfig;
pub use error::AgentError;
pub use mailbox::{FsMailbox, Mailbox, PilotState};
pub use task::{Task, TaskDescription, TaskState};
