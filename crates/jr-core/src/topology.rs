//! Per-process role resolution.
//!
//! Every process of a job step runs jobreport. Exactly one process per node
//! collects and writes telemetry (the node root), and exactly one process per
//! job owns the top of the output tree (the root).

use jr_common::{Error, JobTopology, Result};
use serde::Serialize;

/// Roles of one process within its job step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Roles {
    /// Owns the output tree root (creates the marker).
    pub root: bool,
    /// Collects telemetry and writes a fragment for this node.
    pub node_root: bool,
    pub tasks_per_node: u32,
}

fn tasks_per_node(topo: &JobTopology) -> Result<u32> {
    if let Some(n) = topo.tasks_per_node {
        if n == 0 {
            return Err(Error::Topology("tasks per node is zero".to_string()));
        }
        return Ok(n);
    }
    match (topo.num_procs, topo.num_nodes) {
        (Some(procs), Some(nodes)) if nodes > 0 => match procs / nodes {
            0 => Err(Error::Topology(format!(
                "{procs} processes on {nodes} nodes leaves no task per node"
            ))),
            n => Ok(n),
        },
        (_, Some(0)) => Err(Error::Topology("node count is zero".to_string())),
        _ => Err(Error::Topology(
            "tasks per node unknown: set SLURM_NTASKS_PER_NODE or both node and task counts"
                .to_string(),
        )),
    }
}

/// Decide this process's roles.
///
/// With an explicit GPU binding every process owns its GPUs and collects for
/// them; otherwise the first process on each node collects for all of the
/// node's GPUs.
pub fn resolve_roles(topo: &JobTopology, ignore_gpu_binding: bool) -> Result<Roles> {
    let tasks_per_node = tasks_per_node(topo)?;
    let bound = !topo.gpu_ids.is_empty() && !ignore_gpu_binding;
    Ok(Roles {
        root: topo.proc_id.is_root(),
        node_root: bound || topo.proc_id.0 % tasks_per_node == 0,
        tasks_per_node,
    })
}
