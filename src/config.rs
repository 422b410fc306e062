//! Agent configuration loading with env-var overrides.
//!
//! `agent_0` receives a single JSON config file describing the session, the
//! pilot, the resource/launch backends, the bridge and component catalogs
//! and the runtime limits.  `TALIPOT_LOG_LEVEL` and `TALIPOT_SANDBOX`
//! override their config counterparts for local debugging.

use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::lm::LmInfo;

/// Layout of one sub-agent: which components it runs, on a node reserved by
/// the resource manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentLayout {
    pub uid: String,
    #[serde(default)]
    pub components: Vec<String>,
}

/// Fully-resolved agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub session_id: String,
    pub pilot_id: String,
    /// Root directory of the file-backed mailbox store.
    pub mailbox_path: PathBuf,
    /// Pilot sandbox — working directory for the agent, scripts and task
    /// sandboxes (already expanded, no `~`).
    pub pilot_sandbox: PathBuf,

    /// Resource manager selector: `"fork"`, `"hostfile"`, `"slurm"`.
    pub resource_manager: String,
    /// Launch method selector: `"fork"`, `"mpiexec"` (and dialect suffixes),
    /// `"srun"`.
    pub launch_method: String,
    /// Probe results handed down by a parent agent; when set, the launch
    /// method is rehydrated instead of probed from scratch.
    pub lm_info: Option<LmInfo>,

    /// Hard pilot deadline; fractional minutes are honoured.
    pub runtime_minutes: f64,
    /// Mailbox poll period for tasks and commands.
    pub poll_interval_secs: f64,
    pub heartbeat_interval_secs: f64,
    pub heartbeat_timeout_secs: f64,

    /// Inventory hints for the fork/hostfile backends.
    pub cores_per_node: Option<usize>,
    pub gpus_per_node: usize,
    pub hostfile: Option<PathBuf>,

    /// Bridge and component catalogs; the defaults describe the standard
    /// single-agent pipeline.
    pub bridges: Vec<String>,
    pub components: Vec<String>,
    pub sub_agents: Vec<SubAgentLayout>,

    /// Environment merged into every claimed task description.
    pub task_environment: HashMap<String, String>,

    /// Workers a raptor master spawns at bootstrap.
    pub raptor_workers: usize,

    pub log_level: String,
    pub log_file: Option<PathBuf>,
}

impl AgentConfig {
    pub fn runtime(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.runtime_minutes * 60.0)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.poll_interval_secs)
    }

    pub fn heartbeat_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.heartbeat_interval_secs)
    }

    pub fn heartbeat_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs_f64(self.heartbeat_timeout_secs)
    }
}

/// Raw JSON shape — `serde` target before resolution.
#[derive(Deserialize)]
struct RawConfig {
    session_id: String,
    pilot_id: String,
    mailbox: String,
    #[serde(default)]
    pilot_sandbox: Option<String>,

    #[serde(default = "default_rm")]
    resource_manager: String,
    #[serde(default = "default_lm")]
    launch_method: String,
    #[serde(default)]
    lm_info: Option<LmInfo>,

    #[serde(default = "default_runtime_minutes")]
    runtime_minutes: f64,
    #[serde(default = "default_poll_interval")]
    poll_interval_secs: f64,
    #[serde(default = "default_heartbeat_interval")]
    heartbeat_interval_secs: f64,
    #[serde(default = "default_heartbeat_timeout")]
    heartbeat_timeout_secs: f64,

    #[serde(default)]
    cores_per_node: Option<usize>,
    #[serde(default)]
    gpus_per_node: usize,
    #[serde(default)]
    hostfile: Option<String>,

    #[serde(default = "default_bridges")]
    bridges: Vec<String>,
    #[serde(default = "default_components")]
    components: Vec<String>,
    #[serde(default)]
    sub_agents: Vec<SubAgentLayout>,

    #[serde(default)]
    task_environment: HashMap<String, String>,

    #[serde(default = "default_raptor_workers")]
    raptor_workers: usize,

    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    log_file: Option<String>,
}

fn default_rm() -> String {
    "fork".to_string()
}

fn default_lm() -> String {
    "fork".to_string()
}

fn default_runtime_minutes() -> f64 {
    60.0
}

fn default_poll_interval() -> f64 {
    1.0
}

fn default_heartbeat_interval() -> f64 {
    1.0
}

fn default_heartbeat_timeout() -> f64 {
    10.0
}

fn default_raptor_workers() -> usize {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_bridges() -> Vec<String> {
    vec![
        "agent_staging_input_queue".to_string(),
        "agent_scheduling_queue".to_string(),
        "agent_executing_queue".to_string(),
        "agent_staging_output_queue".to_string(),
        "control_pubsub".to_string(),
        "state_pubsub".to_string(),
    ]
}

fn default_components() -> Vec<String> {
    vec![
        "staging_input".to_string(),
        "scheduler".to_string(),
        "executor".to_string(),
        "staging_output".to_string(),
        "raptor".to_string(),
    ]
}

/// Load the agent config from `path`, applying env-var overrides.
pub fn load(path: &Path) -> Result<AgentConfig, AgentError> {
    load_from(
        path,
        env::var("TALIPOT_SANDBOX").ok().as_deref(),
        env::var("TALIPOT_LOG_LEVEL").ok().as_deref(),
    )
}

/// Internal loader — tests pass overrides directly instead of mutating env.
pub fn load_from(
    path: &Path,
    sandbox_override: Option<&str>,
    log_level_override: Option<&str>,
) -> Result<AgentConfig, AgentError> {
    let raw = fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read {}: {e}", path.display())))?;

    let parsed: RawConfig = serde_json::from_str(&raw)
        .map_err(|e| AgentError::Config(format!("config error in {}: {e}", path.display())))?;

    if parsed.poll_interval_secs <= 0.0 {
        return Err(AgentError::Config("poll_interval_secs must be positive".into()));
    }
    if parsed.heartbeat_timeout_secs <= parsed.heartbeat_interval_secs {
        return Err(AgentError::Config(
            "heartbeat_timeout_secs must exceed heartbeat_interval_secs".into(),
        ));
    }

    let pilot_sandbox = match (sandbox_override, &parsed.pilot_sandbox) {
        (Some(s), _) => expand_home(s),
        (None, Some(s)) => expand_home(s),
        (None, None) => env::current_dir()?,
    };
    let log_level = log_level_override.unwrap_or(&parsed.log_level).to_string();

    Ok(AgentConfig {
        session_id: parsed.session_id,
        pilot_id: parsed.pilot_id,
        mailbox_path: expand_home(&parsed.mailbox),
        pilot_sandbox,
        resource_manager: parsed.resource_manager,
        launch_method: parsed.launch_method,
        lm_info: parsed.lm_info,
        runtime_minutes: parsed.runtime_minutes,
        poll_interval_secs: parsed.poll_interval_secs,
        heartbeat_interval_secs: parsed.heartbeat_interval_secs,
        heartbeat_timeout_secs: parsed.heartbeat_timeout_secs,
        cores_per_node: parsed.cores_per_node,
        gpus_per_node: parsed.gpus_per_node,
        hostfile: parsed.hostfile.as_deref().map(expand_home),
        bridges: parsed.bridges,
        components: parsed.components,
        sub_agents: parsed.sub_agents,
        task_environment: parsed.task_environment,
        raptor_workers: parsed.raptor_workers.max(1),
        log_level,
        log_file: parsed.log_file.as_deref().map(expand_home),
    })
}

/// Expand a leading `~` to the user's home directory.
/// Absolute or relative paths without `~` are returned unchanged.
pub fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

// ── test helpers ──────────────────────────────────────────────────────────────

/// Safe `AgentConfig` for tests — fork backends, tight timings, no sub-agents.
#[cfg(test)]
impl AgentConfig {
    pub fn test_default(sandbox: &Path, mailbox: &Path) -> Self {
        Self {
            session_id: "session.test".into(),
            pilot_id: "pilot.0000".into(),
            mailbox_path: mailbox.to_path_buf(),
            pilot_sandbox: sandbox.to_path_buf(),
            resource_manager: "fork".into(),
            launch_method: "fork".into(),
            lm_info: None,
            runtime_minutes: 1.0,
            poll_interval_secs: 0.05,
            heartbeat_interval_secs: 0.05,
            heartbeat_timeout_secs: 1.0,
            cores_per_node: Some(4),
            gpus_per_node: 0,
            hostfile: None,
            bridges: default_bridges(),
            components: default_components(),
            sub_agents: Vec::new(),
            task_environment: HashMap::new(),
            raptor_workers: 1,
            log_level: "info".into(),
            log_file: None,
        }
    }
}
