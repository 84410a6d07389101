//! Slurm environment → `JobTopology`.

use jr_common::{Error, JobTopology, Result};
use std::collections::HashMap;
use std::str::FromStr;
use tracing::{debug, warn};

const UNKNOWN: &str = "unknown";

fn lookup<'a>(vars: &'a HashMap<String, String>, keys: &[&'a str]) -> Option<(&'a str, &'a str)> {
    keys.iter().find_map(|&k| {
        vars.get(k)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
            .map(|v| (k, v))
    })
}

fn parse_var<T: FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| Error::Topology(format!("{name}='{value}' is not a valid number")))
}

fn required<T: FromStr>(vars: &HashMap<String, String>, keys: &[&str]) -> Result<T> {
    let (name, value) = lookup(vars, keys).ok_or_else(|| {
        Error::Topology(format!("{} is not set (not running under Slurm?)", keys[0]))
    })?;
    parse_var(name, value)
}

fn optional<T: FromStr>(vars: &HashMap<String, String>, keys: &[&str]) -> Result<Option<T>> {
    lookup(vars, keys)
        .map(|(name, value)| parse_var(name, value))
        .transpose()
}

/// Parse a Slurm GPU list such as `0,1,3` or `0-3,6`.
pub fn parse_gpu_list(list: &str) -> Result<Vec<u32>> {
    let mut ids = Vec::new();
    for item in list.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        match item.split_once('-') {
            Some((lo, hi)) => {
                let lo: u32 = parse_var("GPU range", lo)?;
                let hi: u32 = parse_var("GPU range", hi)?;
                if hi < lo {
                    return Err(Error::Topology(format!("GPU range '{item}' is reversed")));
                }
                ids.extend(lo..=hi);
            }
            None => ids.push(parse_var("GPU id", item)?),
        }
    }
    ids.sort_unstable();
    ids.dedup();
    Ok(ids)
}

/// Build the topology from an explicit variable map.
///
/// `SLURM_JOB_ID` and `SLURM_PROCID` are required; everything else is
/// optional and left unset when missing.
pub fn topology_from_env_map(vars: &HashMap<String, String>, host: &str) -> Result<JobTopology> {
    let job_id: u32 = required(vars, &["SLURM_JOB_ID", "SLURM_JOBID"])?;
    let proc_id: u32 = required(vars, &["SLURM_PROCID"])?;
    let step_id: u32 = optional(vars, &["SLURM_STEP_ID", "SLURM_STEPID"])?.unwrap_or(0);

    let user = lookup(vars, &["SLURM_JOB_USER", "USER"]).map_or(UNKNOWN, |(_, v)| v);
    let account = lookup(vars, &["SLURM_JOB_ACCOUNT"]).map_or(UNKNOWN, |(_, v)| v);

    let mut topo = JobTopology::new(job_id, step_id, proc_id).with_identity(user, account, host);

    if let Some((_, list)) = lookup(vars, &["SLURM_STEP_GPUS", "SLURM_JOB_GPUS"]) {
        topo = topo.with_gpu_ids(parse_gpu_list(list)?);
    }
    topo.tasks_per_node = optional(vars, &["SLURM_NTASKS_PER_NODE"])?;
    topo.num_nodes = optional(vars, &["SLURM_JOB_NUM_NODES", "SLURM_NNODES"])?;
    topo.num_procs = optional(vars, &["SLURM_NTASKS", "SLURM_NPROCS"])?;

    let start: Option<u64> = optional(vars, &["SLURM_JOB_START_TIME"])?;
    let end: Option<u64> = optional(vars, &["SLURM_JOB_END_TIME"])?;
    if let (Some(start), Some(end)) = (start, end) {
        match end.checked_sub(start) {
            Some(limit) if limit > 0 => topo = topo.with_time_limit(limit),
            _ => warn!(start, end, "job end time is not after start time; ignoring"),
        }
    }

    debug!(
        job_id,
        step_id,
        proc_id,
        host,
        gpus = ?topo.gpu_ids,
        tasks_per_node = ?topo.tasks_per_node,
        "read Slurm topology"
    );
    Ok(topo)
}

/// Build the topology from the current process environment.
pub fn topology_from_env() -> Result<JobTopology> {
    let vars: HashMap<String, String> = std::env::vars().collect();
    let host = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|e| {
            warn!(error = %e, "could not read hostname");
            UNKNOWN.to_string()
        });
    topology_from_env_map(&vars, &host)
}
