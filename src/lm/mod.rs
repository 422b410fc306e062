//! Launch methods — per-task command-line construction for a given
//! execution backend.
//!
//! Static probing (binary resolution, version, rankfile support) happens
//! once in [`init_from_scratch`]; the result is a serialisable [`LmInfo`]
//! that sub-agents rehydrate with [`init_from_info`] without reprobing.

pub mod fork;
pub mod mpiexec;
pub mod srun;

use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::AgentError;
use crate::task::Task;

// ── LmInfo ────────────────────────────────────────────────────────────────────

/// Probe results captured at first startup and shared with every agent
/// process of the pilot.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LmInfo {
    /// The selector this info was probed for.
    pub method: String,
    /// Resolved launcher binary (empty for the fork method).
    pub command: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Shell file sourced before each task, when the site provides one.
    #[serde(default)]
    pub env_sh: Option<String>,

    // mpiexec dialect flags
    #[serde(default)]
    pub mpt: bool,
    #[serde(default)]
    pub rsh: bool,
    #[serde(default)]
    pub ccmrun: String,
    #[serde(default)]
    pub dplace: String,
    #[serde(default)]
    pub omplace: String,
    /// Whether the launcher understands `-rf <rankfile>`.
    #[serde(default)]
    pub has_rankfile: bool,
}

// ── LaunchMethod ──────────────────────────────────────────────────────────────

/// Capability interface every launch backend implements.
pub trait LaunchMethod: Send + Sync {
    fn name(&self) -> &str;

    /// Rejects empty executables and dialect-incompatible task shapes.
    fn can_launch(&self, task: &Task) -> (bool, String);

    /// Shell commands priming the environment before each task.
    fn launcher_env(&self) -> Vec<String>;

    /// Full shell-level command line spawning `exec_path` under this
    /// launcher, for the task's slot assignment.
    fn launch_cmd(&self, task: &Task, exec_path: &str) -> Result<String, AgentError>;

    /// Shell prelude exporting `RP_RANK` from whichever launcher rank
    /// variable is set.
    fn rank_env(&self) -> String;

    /// Executable plus arguments, properly quoted.
    fn exec_cmd(&self, task: &Task) -> String {
        let td = &task.description;
        let mut cmd = td.executable.clone();
        for arg in &td.arguments {
            cmd.push(' ');
            cmd.push_str(&sh_quote(arg));
        }
        cmd
    }
}

/// Probe the selected launch method once, from scratch.
pub fn init_from_scratch(selector: &str) -> Result<LmInfo, AgentError> {
    match selector {
        "fork" => Ok(fork::probe()),
        s if s.starts_with("mpiexec") => mpiexec::probe(s),
        "srun" => srun::probe(),
        other => Err(AgentError::Config(format!("unknown launch method: {other}"))),
    }
}

/// Rehydrate a launch method from previously captured probe results.
pub fn init_from_info(info: &LmInfo) -> Result<Box<dyn LaunchMethod>, AgentError> {
    match info.method.as_str() {
        "fork" => Ok(Box::new(fork::Fork::from_info(info))),
        s if s.starts_with("mpiexec") => Ok(Box::new(mpiexec::MpiExec::from_info(info)?)),
        "srun" => Ok(Box::new(srun::Srun::from_info(info)?)),
        other => Err(AgentError::Config(format!("unknown launch method: {other}"))),
    }
}

/// Probe and construct in one step — the Agent-0 path.
pub fn create(selector: &str) -> Result<(Box<dyn LaunchMethod>, LmInfo), AgentError> {
    let info = init_from_scratch(selector)?;
    let lm = init_from_info(&info)?;
    Ok((lm, info))
}

// ── helpers ───────────────────────────────────────────────────────────────────

/// Resolve the first of `candidates` found on `PATH` as an executable file.
pub(crate) fn which(candidates: &[&str]) -> Option<String> {
    let path = std::env::var("PATH").ok()?;
    for cand in candidates {
        for dir in path.split(':') {
            if dir.is_empty() {
                continue;
            }
            let full = PathBuf::from(dir).join(cand);
            if let Ok(meta) = full.metadata() {
                if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                    return Some(full.to_string_lossy().into_owned());
                }
            }
        }
    }
    None
}

/// Quote one shell argument.  Plain words pass through; anything else is
/// single-quoted with embedded quotes escaped.
pub(crate) fn sh_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | '/' | ':' | '=' | '@' | '%' | '+'));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
