//! MPI-exec launch method family.
//!
//! One implementation covers the dialects: generic `mpiexec`, MPICH hydra,
//! OpenMPI, and MPT, selected by the binary found on `PATH` and by the
//! selector suffixes (`mpiexec_mpt`, `mpiexec_rsh`, `mpiexec_ccmrun`,
//! `mpiexec_dplace`).  Whether the launcher takes a rankfile or a hostfile
//! is probed once at startup and carried in [`LmInfo`].

use std::collections::HashMap;
use std::fs;
use std::process::Command;

use tracing::debug;

use crate::error::AgentError;
use crate::task::{SlotAssignment, Task};

use super::{LaunchMethod, LmInfo, which};

/// Binary candidates, most generic first.
const CANDIDATES: &[&str] = &[
    "mpiexec",
    "mpiexec.mpich",
    "mpiexec.hydra",
    "mpiexec.openmpi",
    "mpiexec-mpich-mp",
    "mpiexec-openmpi-mp",
    "mpiexec_mpt",
];

pub struct MpiExec {
    name: String,
    command: String,
    env_sh: Option<String>,
    mpt: bool,
    ccmrun: String,
    dplace: String,
    omplace: String,
    has_rankfile: bool,
}

/// Resolve the launcher binary and capture its capabilities.
pub fn probe(selector: &str) -> Result<LmInfo, AgentError> {
    let command = which(CANDIDATES)
        .ok_or_else(|| AgentError::Config("mpiexec not found - cannot start MPI tasks".into()))?;

    let lower = selector.to_lowercase();
    let mpt = lower.contains("_mpt");
    let rsh = lower.contains("_rsh");

    let ccmrun = if lower.contains("_ccmrun") {
        which(&["ccmrun"])
            .ok_or_else(|| AgentError::Config("ccmrun wrapper requested but not found".into()))?
    } else {
        String::new()
    };
    let dplace = if lower.contains("_dplace") {
        which(&["dplace"])
            .ok_or_else(|| AgentError::Config("dplace wrapper requested but not found".into()))?
    } else {
        String::new()
    };

    // MPT launchers need omplace for core pinning.
    let omplace = if mpt { "omplace".to_string() } else { String::new() };

    let version = Command::new(&command)
        .arg("--version")
        .output()
        .ok()
        .and_then(|out| {
            String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .map(|l| l.trim().to_string())
        })
        .filter(|v| !v.is_empty());

    let has_rankfile = Command::new("sh")
        .arg("-c")
        .arg(format!("{command} --help 2>&1 | grep -- '-rf'"))
        .output()
        .map(|out| !out.stdout.is_empty())
        .unwrap_or(false);

    debug!(%command, mpt, has_rankfile, "mpiexec probed");

    Ok(LmInfo {
        method: selector.to_string(),
        command,
        version,
        env_sh: None,
        mpt,
        rsh,
        ccmrun,
        dplace,
        omplace,
        has_rankfile,
    })
}

impl MpiExec {
    pub fn from_info(info: &LmInfo) -> Result<Self, AgentError> {
        if info.command.is_empty() {
            return Err(AgentError::Config("mpiexec lm_info carries no command".into()));
        }
        Ok(Self {
            name: info.method.clone(),
            command: info.command.clone(),
            env_sh: info.env_sh.clone(),
            mpt: info.mpt,
            ccmrun: info.ccmrun.clone(),
            dplace: info.dplace.clone(),
            omplace: if info.omplace.is_empty() { String::new() } else { "omplace".to_string() },
            has_rankfile: info.has_rankfile,
        })
    }

    /// Rank file, one line per rank:
    /// ```text
    /// rank 0=nodeA slots=0,1,2,3
    /// rank 1=nodeA slots=4,5,6,7
    /// ```
    fn write_rank_file(&self, slots: &SlotAssignment, uid: &str, sandbox: &str) -> Result<String, AgentError> {
        let mut rf = String::new();
        for (rank_id, rank) in slots.ranks.iter().enumerate() {
            let cores: Vec<String> = rank.cores.iter().map(|c| c.to_string()).collect();
            rf.push_str(&format!("rank {rank_id}={} slots={}\n", rank.node_name, cores.join(",")));
        }
        let rf_name = format!("{sandbox}/{uid}.rf");
        fs::write(&rf_name, rf)?;
        Ok(rf_name)
    }

    /// Host file, one line per node: `nodeA slots=2`.
    fn write_host_file(&self, slots: &SlotAssignment, uid: &str, sandbox: &str) -> Result<String, AgentError> {
        let mut host_slots: Vec<(String, usize)> = Vec::new();
        for rank in &slots.ranks {
            match host_slots.iter_mut().find(|(name, _)| name == &rank.node_name) {
                Some((_, n)) => *n += 1,
                None => host_slots.push((rank.node_name.clone(), 1)),
            }
        }
        let mut hf = String::new();
        for (name, n) in host_slots {
            hf.push_str(&format!("{name} slots={n}\n"));
        }
        let hf_name = format!("{sandbox}/{uid}.hf");
        fs::write(&hf_name, hf)?;
        Ok(hf_name)
    }
}

impl LaunchMethod for MpiExec {
    fn name(&self) -> &str {
        &self.name
    }

    fn can_launch(&self, task: &Task) -> (bool, String) {
        if task.description.executable.is_empty() {
            return (false, "no executable".to_string());
        }
        (true, String::new())
    }

    fn launcher_env(&self) -> Vec<String> {
        let mut cmds = Vec::new();
        if let Some(sh) = &self.env_sh {
            cmds.push(format!(". {sh}"));
        }
        if self.mpt {
            cmds.push("export MPI_SHEPHERD=true".to_string());
        }
        cmds
    }

    fn launch_cmd(&self, task: &Task, exec_path: &str) -> Result<String, AgentError> {
        let slots = task
            .slots
            .as_ref()
            .filter(|s| !s.ranks.is_empty())
            .ok_or_else(|| AgentError::Launch(format!("task {} has no slots", task.uid)))?;
        let sandbox = task
            .sandbox_path
            .as_ref()
            .ok_or_else(|| AgentError::Launch(format!("task {} has no sandbox", task.uid)))?
            .to_string_lossy()
            .into_owned();

        let mut options = format!("-np {} ", slots.ranks.len());

        if self.has_rankfile {
            // Rankfile for hosts and cpu binding.
            let hosts = slots.node_names().join(",");
            let rf = self.write_rank_file(slots, &task.uid, &sandbox)?;
            options.push_str(&format!("-H {hosts} -rf {rf}"));
        } else {
            let cores_per_rank = slots.ranks[0].cores.len();
            let hf = self.write_host_file(slots, &task.uid, &sandbox)?;
            options.push_str(&format!("--hostfile {hf} --depth={cores_per_rank} --cpu-bind depth"));
        }

        if !self.omplace.is_empty() {
            options.push_str(&format!(" {}", self.omplace));
        }

        let mut cmd = String::new();
        for wrapper in [&self.ccmrun, &self.dplace] {
            if !wrapper.is_empty() {
                cmd.push_str(wrapper);
                cmd.push(' ');
            }
        }
        cmd.push_str(&format!("{} {} {}", self.command, options, exec_path));
        Ok(cmd.trim().to_string())
    }

    fn rank_env(&self) -> String {
        let mut ret = String::new();
        ret.push_str("test -z \"$MPI_RANK\"  || export RP_RANK=$MPI_RANK\n");
        ret.push_str("test -z \"$PMIX_RANK\" || export RP_RANK=$PMIX_RANK\n");
        ret.push_str("test -z \"$PMI_ID\"    || export RP_RANK=$PMI_ID\n");
        ret.push_str("test -z \"$PMI_RANK\"  || export RP_RANK=$PMI_RANK\n");
        if self.mpt {
            ret.push_str("test -z \"$MPT_MPI_RANK\" || export RP_RANK=$MPT_MPI_RANK\n");
        }
        ret
    }

}

/// Parsed view of a rank file, for tests and diagnostics.
pub fn parse_rank_file(content: &str) -> HashMap<usize, (String, Vec<usize>)> {
    let mut ranks = HashMap::new();
    for line in content.lines() {
        let Some(rest) = line.strip_prefix("rank ") else { continue };
        let Some((id, rest)) = rest.split_once('=') else { continue };
        let Some((node, slots)) = rest.split_once(" slots=") else { continue };
        let Ok(id) = id.trim().parse::<usize>() else { continue };
        let cores = slots.split(',').filter_map(|c| c.trim().parse().ok()).collect();
        ranks.insert(id, (node.to_string(), cores));
    }
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::{RankSlot, TaskDescription};
    use tempfile::TempDir;

    fn lm(has_rankfile: bool) -> MpiExec {
        MpiExec {
            name: "mpiexec".into(),
            command: "/usr/bin/mpiexec".into(),
            env_sh: None,
            mpt: false,
            ccmrun: String::new(),
            dplace: String::new(),
            omplace: String::new(),
            has_rankfile,
        }
    }

    fn placed_task(sandbox: &TempDir) -> Task {
        let mut task = Task::new(
            "task.0001",
            "pilot.0000",
            TaskDescription {
                executable: "/bin/hostname".into(),
                ranks: 2,
                cores_per_rank: 2,
                ..Default::default()
            },
        );
        task.slots = Some(SlotAssignment {
            ranks: vec![
                RankSlot { node_index: 0, node_name: "nodeA".into(), cores: vec![0, 1], gpus: vec![] },
                RankSlot { node_index: 0, node_name: "nodeA".into(), cores: vec![2, 3], gpus: vec![] },
            ],
        });
        task.sandbox_path = Some(sandbox.path().to_path_buf());
        task
    }

    #[test]
    fn rankfile_dialect_builds_rf_options() {
        let dir = TempDir::new().unwrap();
        let task = placed_task(&dir);
        let cmd = lm(true).launch_cmd(&task, "/sbx/task.0001.exec.sh").unwrap();

        assert!(cmd.starts_with("/usr/bin/mpiexec -np 2 -H nodeA -rf "));
        assert!(cmd.ends_with("/sbx/task.0001.exec.sh"));

        let rf = std::fs::read_to_string(dir.path().join("task.0001.rf")).unwrap();
        let ranks = parse_rank_file(&rf);
        assert_eq!(ranks[&0], ("nodeA".to_string(), vec![0, 1]));
        assert_eq!(ranks[&1], ("nodeA".to_string(), vec![2, 3]));
    }

    #[test]
    fn hostfile_dialect_uses_depth_binding() {
        let dir = TempDir::new().unwrap();
        let task = placed_task(&dir);
        let cmd = lm(false).launch_cmd(&task, "exec.sh").unwrap();

        assert!(cmd.contains("--hostfile "));
        assert!(cmd.contains("--depth=2 --cpu-bind depth"));

        let hf = std::fs::read_to_string(dir.path().join("task.0001.hf")).unwrap();
        assert_eq!(hf, "nodeA slots=2\n");
    }

    #[test]
    fn missing_slots_is_launch_error() {
        let dir = TempDir::new().unwrap();
        let mut task = placed_task(&dir);
        task.slots = None;
        assert!(matches!(
            lm(true).launch_cmd(&task, "exec.sh"),
            Err(AgentError::Launch(_))
        ));
    }

    #[test]
    fn mpt_adds_shepherd_and_rank_var() {
        let mut m = lm(true);
        m.mpt = true;
        assert!(m.launcher_env().contains(&"export MPI_SHEPHERD=true".to_string()));
        assert!(m.rank_env().contains("MPT_MPI_RANK"));
    }

    #[test]
    fn rank_var_resolution_order_is_deterministic() {
        let env = lm(true).rank_env();
        let mpi = env.find("$MPI_RANK").unwrap();
        let pmix = env.find("$PMIX_RANK").unwrap();
        let pmi_id = env.find("$PMI_ID").unwrap();
        let pmi = env.find("$PMI_RANK").unwrap();
        assert!(mpi < pmix && pmix < pmi_id && pmi_id < pmi);
    }

    #[test]
    fn wrappers_prefix_the_command() {
        let dir = TempDir::new().unwrap();
        let task = placed_task(&dir);
        let mut m = lm(true);
        m.ccmrun = "/opt/ccmrun".into();
        m.dplace = "/opt/dplace".into();
        let cmd = m.launch_cmd(&task, "exec.sh").unwrap();
        assert!(cmd.starts_with("/opt/ccmrun /opt/dplace /usr/bin/mpiexec "));
    }

    #[test]
    fn from_info_requires_command() {
        let info = LmInfo { method: "mpiexec".into(), ..Default::default() };
        assert!(MpiExec::from_info(&info).is_err());
    }

    #[test]
    fn empty_executable_rejected() {
        let task = Task::new("t.0", "p.0", TaskDescription::default());
        let (ok, reason) = lm(true).can_launch(&task);
        assert!(!ok);
        assert_eq!(reason, "no executable");
    }
}
