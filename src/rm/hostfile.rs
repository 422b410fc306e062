//! Hostfile backend — PBS/Torque-style node-file parsing.
//!
//! The node file lists one hostname per launchable slot; a host appearing N
//! times has N cores.  Blank lines and `#` comments are skipped.  GPU counts
//! are not expressed in node files and come from the config hint.

use std::fs;

use crate::config::AgentConfig;
use crate::error::AgentError;

use super::Node;

pub fn discover(cfg: &AgentConfig) -> Result<Vec<Node>, AgentError> {
    let path = cfg
        .hostfile
        .as_ref()
        .ok_or_else(|| AgentError::Config("hostfile backend needs a 'hostfile' path".into()))?;

    let content = fs::read_to_string(path)
        .map_err(|e| AgentError::Config(format!("cannot read hostfile {}: {e}", path.display())))?;

    parse(&content, cfg.gpus_per_node)
}

fn parse(content: &str, gpus: usize) -> Result<Vec<Node>, AgentError> {
    // Preserve first-seen order; node files group repeated names.
    let mut names: Vec<String> = Vec::new();
    let mut counts: Vec<usize> = Vec::new();

    for line in content.lines() {
        let name = line.trim();
        if name.is_empty() || name.starts_with('#') {
            continue;
        }
        match names.iter().position(|n| n == name) {
            Some(i) => counts[i] += 1,
            None => {
                names.push(name.to_string());
                counts.push(1);
            }
        }
    }

    if names.is_empty() {
        return Err(AgentError::Config("hostfile lists no nodes".into()));
    }

    Ok(names
        .into_iter()
        .zip(counts)
        .enumerate()
        .map(|(index, (name, cores))| Node {
            index,
            name,
            uid: format!("node.{index:04}"),
            cores,
            gpus,
            lfs_path: None,
            lfs_size_mb: 0,
        })
        .collect())
}
