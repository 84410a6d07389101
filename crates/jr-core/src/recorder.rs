//! Per-process recording: wrap a workload in a telemetry session and persist
//! the result.

use crate::layout::{prepare, LayoutOptions, OutputPlan};
use crate::source::{GpuSummary, TelemetrySource};
use crate::topology::{resolve_roles, Roles};
use crate::writer::write_fragment;
use jr_common::id::session_name;
use jr_common::{Error, JobTopology, Result};
use jr_telemetry::{RecordRow, RecordTable};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use tracing::{debug, info, warn};

const DEFAULT_MAX_RUNTIME_SECS: u64 = 24 * 60 * 60;
const SHORT_RUN_SECS: u64 = 10;
const DEFAULT_SAMPLING_US: u64 = 100_000;
const DEFAULT_SHELL: &str = "/bin/sh";

/// Resolved sampling window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeParams {
    pub max_runtime_secs: u64,
    pub sampling_interval_us: u64,
}

/// Pick the watch window.
///
/// Max runtime: explicit request, then the job's time limit, then one day.
/// A sampling time of zero means "choose": about a hundred samples for runs
/// shorter than ten seconds, otherwise every 100 ms.
pub fn resolve_time_params(
    requested_max_secs: Option<u64>,
    job_limit_secs: Option<u64>,
    sampling_time_secs: u64,
) -> TimeParams {
    let max_runtime_secs = requested_max_secs
        .or(job_limit_secs.filter(|&l| l > 0))
        .unwrap_or(DEFAULT_MAX_RUNTIME_SECS);
    let sampling_interval_us = if sampling_time_secs > 0 {
        sampling_time_secs.saturating_mul(1_000_000)
    } else if max_runtime_secs < SHORT_RUN_SECS {
        max_runtime_secs * 10_000
    } else {
        DEFAULT_SAMPLING_US
    };
    TimeParams {
        max_runtime_secs,
        sampling_interval_us,
    }
}

/// How the monitored workload ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "value")]
pub enum WorkloadStatus {
    Exited(i32),
    Signaled(i32),
}

impl WorkloadStatus {
    pub fn success(self) -> bool {
        self == WorkloadStatus::Exited(0)
    }

    /// Shell-style exit code: the status itself, or 128 + signal.
    pub fn exit_code(self) -> i32 {
        match self {
            WorkloadStatus::Exited(code) => code,
            WorkloadStatus::Signaled(sig) => 128 + sig,
        }
    }

    fn from_exit_status(status: ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return WorkloadStatus::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(sig) = status.signal() {
                return WorkloadStatus::Signaled(sig);
            }
        }
        WorkloadStatus::Exited(1)
    }
}

/// Run `command` through `<shell> -c` and wait for it.
pub fn run_workload(shell: &Path, command: &str) -> Result<WorkloadStatus> {
    debug!(shell = %shell.display(), command, "starting workload");
    let status = Command::new(shell)
        .arg("-c")
        .arg(command)
        .status()
        .map_err(|e| Error::Workload(format!("{}: {command}: {e}", shell.display())))?;
    Ok(WorkloadStatus::from_exit_status(status))
}

/// What one process did.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub roles: Roles,
    /// Fragment written by this process, if it collected.
    pub target: Option<PathBuf>,
    pub rows: usize,
    pub workload_status: WorkloadStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RecorderOptions {
    pub layout: LayoutOptions,
    pub ignore_gpu_binding: bool,
    pub sampling_time_secs: u64,
    /// Explicit maximum runtime, already parsed.
    pub max_runtime_secs: Option<u64>,
    /// Directory the default output base is resolved against.
    pub cwd: PathBuf,
    /// Shell the workload runs under; `/bin/sh` when unset.
    pub shell: Option<PathBuf>,
}

/// Build table rows from session summaries, one per GPU.
pub fn build_table(topo: &JobTopology, summaries: &[GpuSummary]) -> RecordTable {
    summaries
        .iter()
        .map(|s| RecordRow {
            job_id: topo.job_id.0,
            step_id: topo.step_id.0,
            user: topo.user.clone(),
            account: topo.account.clone(),
            num_nodes: topo.num_nodes.unwrap_or(u32::MAX),
            host: topo.host.clone(),
            gpu_id: s.gpu_id,
            power_usage: s.power_usage,
            start_time: s.start_time,
            end_time: s.end_time,
            sm_utilization: s.sm_utilization,
            memory_utilization: s.memory_utilization,
        })
        .collect()
}

/// Orchestrates one process: roles, layout, session, workload, fragment.
pub struct Recorder<S> {
    topology: JobTopology,
    options: RecorderOptions,
    source: S,
}

impl<S: TelemetrySource> Recorder<S> {
    pub fn new(topology: JobTopology, options: RecorderOptions, source: S) -> Self {
        Self {
            topology,
            options,
            source,
        }
    }

    /// Run `command` under telemetry.
    ///
    /// Layout problems surface before the workload starts. Once the
    /// session has started, the fragment is written whatever happens to the
    /// workload, including a shell that cannot be spawned; that error is
    /// returned afterwards.
    pub fn run(&mut self, command: &str) -> Result<RunOutcome> {
        let topo = &self.topology;
        let roles = resolve_roles(topo, self.options.ignore_gpu_binding)?;
        info!(
            job_id = %topo.job_id,
            step_id = %topo.step_id,
            proc_id = %topo.proc_id,
            root = roles.root,
            node_root = roles.node_root,
            "resolved roles"
        );

        let plan: Option<OutputPlan> = if roles.root || roles.node_root {
            Some(prepare(
                topo,
                &roles,
                &self.options.layout,
                &self.options.cwd,
            )?)
        } else {
            None
        };
        let collecting = match &plan {
            Some(plan) if roles.node_root => Some(plan),
            _ => None,
        };

        let session = match collecting {
            Some(_) => Some(self.start_session(&roles)?),
            None => None,
        };

        let shell = self
            .options
            .shell
            .clone()
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SHELL));
        let workload = run_workload(&shell, command);
        match &workload {
            Ok(status) if !status.success() => {
                warn!(status = ?status, "workload did not exit cleanly")
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "workload could not be started"),
        }

        let (target, rows) = match (collecting, session) {
            (Some(plan), Some((group, name))) => {
                let summaries = self.source.stop_session(&name)?;
                if let Err(e) = self.source.destroy_group(group) {
                    warn!(error = %e, "failed to destroy GPU group");
                }
                for s in &summaries {
                    debug!(
                        gpu = s.gpu_id,
                        pcie_rx = s.pcie_rx_bytes,
                        pcie_tx = s.pcie_tx_bytes,
                        "gpu summary"
                    );
                }
                if summaries.is_empty() {
                    warn!("telemetry session returned no GPUs");
                }
                let table = build_table(&self.topology, &summaries);
                write_fragment(&table, plan)?;
                (Some(plan.target.clone()), table.len())
            }
            _ => (None, 0),
        };
        let workload_status = workload?;

        Ok(RunOutcome {
            roles,
            target,
            rows,
            workload_status,
        })
    }

    fn start_session(&mut self, roles: &Roles) -> Result<(crate::source::GroupHandle, String)> {
        let topo = &self.topology;
        let time = resolve_time_params(
            self.options.max_runtime_secs,
            topo.time_limit_secs,
            self.options.sampling_time_secs,
        );
        let bound = !topo.gpu_ids.is_empty() && !self.options.ignore_gpu_binding;
        let gpus = bound.then_some(topo.gpu_ids.as_slice());

        let (name, truncated) = session_name(topo.job_id, topo.proc_id, topo.step_id);
        if truncated {
            warn!(session = %name, "session name truncated to 63 characters");
        }

        let group = self.source.create_group(gpus)?;
        self.source
            .watch(group, time.sampling_interval_us, time.max_runtime_secs)?;
        self.source.start_session(group, &name)?;
        info!(
            session = %name,
            gpus = ?gpus,
            tasks_per_node = roles.tasks_per_node,
            max_runtime_secs = time.max_runtime_secs,
            sampling_interval_us = time.sampling_interval_us,
            "telemetry session started"
        );
        Ok((group, name))
    }
}
