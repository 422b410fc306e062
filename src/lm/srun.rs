//! SLURM `srun` launch method.

use std::process::Command;

use tracing::debug;

use crate::error::AgentError;
use crate::task::Task;

use super::{LaunchMethod, LmInfo, which};

pub struct Srun {
    command: String,
    env_sh: Option<String>,
}

/// Resolve `srun` and capture its version.  A failing version probe is an
/// error: an srun that cannot report its version will not launch tasks
/// either.
pub fn probe() -> Result<LmInfo, AgentError> {
    let command = which(&["srun"])
        .ok_or_else(|| AgentError::Config("srun not found - cannot start SLURM tasks".into()))?;

    let out = Command::new(&command)
        .arg("--version")
        .output()
        .map_err(|e| AgentError::Config(format!("srun version probe failed: {e}")))?;
    if !out.status.success() {
        return Err(AgentError::Config(format!(
            "srun version probe failed: {}",
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    let version = String::from_utf8_lossy(&out.stdout).trim().to_string();
    debug!(%command, %version, "srun probed");

    Ok(LmInfo {
        method: "srun".to_string(),
        command,
        version: Some(version),
        ..Default::default()
    })
}

impl Srun {
    pub fn from_info(info: &LmInfo) -> Result<Self, AgentError> {
        if info.command.is_empty() {
            return Err(AgentError::Config("srun lm_info carries no command".into()));
        }
        Ok(Self { command: info.command.clone(), env_sh: info.env_sh.clone() })
    }
}

impl LaunchMethod for Srun {
    fn name(&self) -> &str {
        "srun"
    }

    fn can_launch(&self, task: &Task) -> (bool, String) {
        if task.description.executable.is_empty() {
            return (false, "no executable".to_string());
        }
        (true, String::new())
    }

    fn launcher_env(&self) -> Vec<String> {
        match &self.env_sh {
            Some(sh) => vec![format!(". {sh}")],
            None => Vec::new(),
        }
    }

    fn launch_cmd(&self, task: &Task, exec_path: &str) -> Result<String, AgentError> {
        let td = &task.description;
        let mut options = format!("-n {} --cpus-per-task={} --export=ALL", td.ranks, td.cores_per_rank);

        if let Some(slots) = task.slots.as_ref().filter(|s| !s.ranks.is_empty()) {
            let nodes = slots.node_names();
            options.push_str(&format!(" --nodes={} --nodelist={}", nodes.len(), nodes.join(",")));
        }
        if td.gpus_per_rank > 0 {
            options.push_str(&format!(" --gpus-per-task={}", td.gpus_per_rank));
        }

        Ok(format!("{} {} {}", self.command, options, exec_path))
    }

    fn rank_env(&self) -> String {
        "test -z \"$SLURM_PROCID\" || export RP_RANK=$SLURM_PROCID\n".to_string()
    }
}
