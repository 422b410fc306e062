//! Fork backend — single-node fallback inventory.
//!
//! Used when the agent runs outside any batch system (development, tests,
//! single workstations).  One node, core count from the config hint or the
//! host's parallelism.

use crate::config::AgentConfig;
use crate::error::AgentError;

use super::Node;

pub fn discover(cfg: &AgentConfig) -> Result<Vec<Node>, AgentError> {
    let cores = match cfg.cores_per_node {
        Some(c) => c,
        None => std::thread::available_parallelism()
            .map(|n| n.get())
            .map_err(|e| AgentError::Config(format!("cannot probe core count: {e}")))?,
    };

    let name = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());

    Ok(vec![Node {
        index: 0,
        name,
        uid: "node.0000".to_string(),
        cores,
        gpus: cfg.gpus_per_node,
        lfs_path: Some(std::env::temp_dir()),
        lfs_size_mb: 0,
    }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;

    fn cfg(cores: Option<usize>) -> AgentConfig {
        let dir = std::env::temp_dir();
        let mut c = AgentConfig::test_default(&dir, &dir);
        c.cores_per_node = cores;
        c
    }

    #[test]
    fn single_node_with_configured_cores() {
        let nodes = discover(&cfg(Some(4))).unwrap();
        assert_eq!(nodes.len(), 1);
        assert_eq!(nodes[0].cores, 4);
        assert_eq!(nodes[0].index, 0);
    }

    #[test]
    fn probes_parallelism_without_hint() {
        let nodes = discover(&cfg(None)).unwrap();
        assert!(nodes[0].cores >= 1);
    }
}
