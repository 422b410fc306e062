//! SLURM backend — inventory from scheduler-injected environment variables.
//!
//! Reads `SLURM_JOB_NODELIST` (compressed form, e.g. `nd[0001-0003,0007]`)
//! and `SLURM_CPUS_ON_NODE`.  GPU counts come from the config hint; SLURM
//! does not expose them uniformly across sites.

use std::env;

use crate::config::AgentConfig;
use crate::error::AgentError;

use super::Node;

pub fn discover(cfg: &AgentConfig) -> Result<Vec<Node>, AgentError> {
    let nodelist = env::var("SLURM_JOB_NODELIST")
        .or_else(|_| env::var("SLURM_NODELIST"))
        .map_err(|_| AgentError::Config("SLURM_JOB_NODELIST is not set".into()))?;

    let cpus = env::var("SLURM_CPUS_ON_NODE")
        .map_err(|_| AgentError::Config("SLURM_CPUS_ON_NODE is not set".into()))?;
    let cores: usize = cpus
        .parse()
        .map_err(|_| AgentError::Config(format!("bad SLURM_CPUS_ON_NODE: '{cpus}'")))?;

    let names = expand_nodelist(&nodelist)?;
    Ok(names
        .into_iter()
        .enumerate()
        .map(|(index, name)| Node {
            index,
            name,
            uid: format!("node.{index:04}"),
            cores,
            gpus: cfg.gpus_per_node,
            lfs_path: None,
            lfs_size_mb: 0,
        })
        .collect())
}

/// Expand a compressed SLURM nodelist into individual host names.
///
/// Handles comma-separated entries where each entry is either a plain name
/// or `prefix[spec]` with `spec` a comma list of ids and zero-padded ranges
/// (`nd[0001-0003,0007]` → nd0001 nd0002 nd0003 nd0007).
pub fn expand_nodelist(nodelist: &str) -> Result<Vec<String>, AgentError> {
    let mut names = Vec::new();

    for entry in split_toplevel(nodelist) {
        match entry.find('[') {
            None => {
                if !entry.is_empty() {
                    names.push(entry.to_string());
                }
            }
            Some(open) => {
                let close = entry
                    .rfind(']')
                    .ok_or_else(|| AgentError::Config(format!("unbalanced nodelist: {entry}")))?;
                let prefix = &entry[..open];
                let spec = &entry[open + 1..close];
                for part in spec.split(',') {
                    match part.split_once('-') {
                        None => names.push(format!("{prefix}{part}")),
                        Some((lo, hi)) => {
                            let width = lo.len();
                            let lo_n: u64 = lo.parse().map_err(|_| {
                                AgentError::Config(format!("bad nodelist range: {part}"))
                            })?;
                            let hi_n: u64 = hi.parse().map_err(|_| {
                                AgentError::Config(format!("bad nodelist range: {part}"))
                            })?;
                            if hi_n < lo_n {
                                return Err(AgentError::Config(format!(
                                    "bad nodelist range: {part}"
                                )));
                            }
                            for n in lo_n..=hi_n {
                                names.push(format!("{prefix}{n:0width$}"));
                            }
                        }
                    }
                }
            }
        }
    }

    if names.is_empty() {
        return Err(AgentError::Config(format!("empty nodelist: '{nodelist}'")));
    }
    Ok(names)
}

/// Split on commas that are not inside brackets.
fn split_toplevel(s: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                parts.push(s[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(s[start..].trim());
    parts
}
