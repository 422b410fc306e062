//! Resource manager — one-shot node-inventory discovery at agent start.
//!
//! The backend is selected by the `resource_manager` config key.  Discovery
//! runs exactly once; the resulting [`RmInfo`] is published to the registry
//! and is immutable thereafter.  Nodes reserved for sub-agents are split off
//! the end of the inventory so sub-agent placement never contends with
//! workload tasks.

pub mod fork;
pub mod hostfile;
pub mod slurm;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::task::{RankSlot, SlotAssignment};

// ── Node ──────────────────────────────────────────────────────────────────────

/// One compute node.  Immutable within a pilot lifetime; cores and GPUs are
/// addressed as integer indices.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub index: usize,
    pub name: String,
    pub uid: String,
    pub cores: usize,
    pub gpus: usize,
    #[serde(default)]
    pub lfs_path: Option<PathBuf>,
    #[serde(default)]
    pub lfs_size_mb: u64,
}

/// The discovered inventory: workload nodes plus the sub-agent reservation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RmInfo {
    /// Nodes available to the scheduler.
    pub nodes: Vec<Node>,
    pub cores_per_node: usize,
    pub gpus_per_node: usize,
    /// Reserved nodes, keyed by sub-agent uid.
    pub agent_nodes: HashMap<String, Node>,
}

impl RmInfo {
    pub fn total_cores(&self) -> usize {
        self.nodes.iter().map(|n| n.cores).sum()
    }

    pub fn total_gpus(&self) -> usize {
        self.nodes.iter().map(|n| n.gpus).sum()
    }
}

// ── ResourceManager ───────────────────────────────────────────────────────────

/// Owns the inventory for one pilot.
pub struct ResourceManager {
    info: RmInfo,
}

impl ResourceManager {
    /// Run discovery with the configured backend and validate the result.
    pub fn create(cfg: &AgentConfig) -> Result<Self, AgentError> {
        let nodes = match cfg.resource_manager.as_str() {
            "fork" => fork::discover(cfg),
            "hostfile" => hostfile::discover(cfg),
            "slurm" => slurm::discover(cfg),
            other => Err(AgentError::Config(format!("unknown resource manager: {other}"))),
        }?;

        let info = Self::build_info(nodes, cfg)?;
        info!(
            nodes = info.nodes.len(),
            cores_per_node = info.cores_per_node,
            gpus_per_node = info.gpus_per_node,
            sub_agents = info.agent_nodes.len(),
            "resource inventory ready"
        );
        Ok(Self { info })
    }

    fn build_info(mut nodes: Vec<Node>, cfg: &AgentConfig) -> Result<RmInfo, AgentError> {
        if nodes.is_empty() {
            return Err(AgentError::Config("inventory holds no nodes".into()));
        }
        for node in &nodes {
            if node.cores == 0 {
                return Err(AgentError::Config(format!(
                    "node '{}' lists zero cores",
                    node.name
                )));
            }
        }
        let cores_per_node = nodes[0].cores;
        if nodes.iter().any(|n| n.cores != cores_per_node) {
            return Err(AgentError::Config("inconsistent cores per node".into()));
        }
        let gpus_per_node = nodes[0].gpus;
        if nodes.iter().any(|n| n.gpus != gpus_per_node) {
            return Err(AgentError::Config("inconsistent gpus per node".into()));
        }

        // Sub-agents take dedicated nodes from the tail of the inventory.
        let wanted = cfg.sub_agents.len();
        if wanted >= nodes.len() {
            return Err(AgentError::Config(format!(
                "{} sub-agents requested but only {} nodes discovered",
                wanted,
                nodes.len()
            )));
        }
        let reserved = nodes.split_off(nodes.len() - wanted);
        let agent_nodes = cfg
            .sub_agents
            .iter()
            .zip(reserved)
            .map(|(layout, node)| {
                debug!(sub_agent = %layout.uid, node = %node.name, "reserving sub-agent node");
                (layout.uid.clone(), node)
            })
            .collect();

        Ok(RmInfo { nodes, cores_per_node, gpus_per_node, agent_nodes })
    }

    pub fn info(&self) -> &RmInfo {
        &self.info
    }

    /// A single-core slot on the node reserved for `uid`, so that sub-agent
    /// placement does not contend with workload tasks.
    pub fn slots_for_subagent(&self, uid: &str) -> Result<SlotAssignment, AgentError> {
        let node = self
            .info
            .agent_nodes
            .get(uid)
            .ok_or_else(|| AgentError::Config(format!("no node reserved for sub-agent {uid}")))?;
        Ok(SlotAssignment {
            ranks: vec![RankSlot {
                node_index: node.index,
                node_name: node.name.clone(),
                cores: vec![0],
                gpus: Vec::new(),
            }],
        })
    }

    /// Inventory teardown at agent shutdown.  Discovery is one-shot, so this
    /// only logs.
    pub fn stop(&self) {
        debug!("resource manager stopped");
    }
}
