//! Fork launch method — direct execution, no launcher binary.

use crate::error::AgentError;
use crate::task::Task;

use super::{LaunchMethod, LmInfo};

pub struct Fork {
    env_sh: Option<String>,
}

pub fn probe() -> LmInfo {
    LmInfo { method: "fork".to_string(), ..Default::default() }
}

impl Fork {
    pub fn from_info(info: &LmInfo) -> Self {
        Self { env_sh: info.env_sh.clone() }
    }
}

impl LaunchMethod for Fork {
    fn name(&self) -> &str {
        "fork"
    }

    fn can_launch(&self, task: &Task) -> (bool, String) {
        let td = &task.description;
        if td.executable.is_empty() {
            return (false, "no executable".to_string());
        }
        if td.ranks > 1 && td.wants_mpi() {
            return (false, "fork cannot launch multi-rank MPI tasks".to_string());
        }
        (true, String::new())
    }

    fn launcher_env(&self) -> Vec<String> {
        match &self.env_sh {
            Some(sh) => vec![format!(". {sh}")],
            None => Vec::new(),
        }
    }

    fn launch_cmd(&self, _task: &Task, exec_path: &str) -> Result<String, AgentError> {
        Ok(format!("/bin/sh {exec_path}"))
    }

    fn rank_env(&self) -> String {
        "export RP_RANK=0\n".to_string()
    }
}
