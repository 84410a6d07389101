//! Two-phase recording: `jobreport start` and `jobreport stop`.
//!
//! For workloads that cannot be wrapped by `jobreport run` (container
//! hooks), `start` launches a background nvidia-smi logger and leaves a
//! session file in the step directory; `stop` ends the logger, summarizes
//! its readings and writes the fragment exactly like `run` does. Both
//! invocations must see the same Slurm environment and layout options.

use crate::layout::{prepare, OutputPlan};
use crate::recorder::{build_table, resolve_time_params, RecorderOptions};
use crate::source::{parse_smi_log, spawn_smi_logger, summarize, SMI_LOOP_FLAG};
use crate::topology::{resolve_roles, Roles};
use crate::writer::write_fragment;
use jr_common::id::session_name;
use jr_common::{Error, JobTopology, ProcId, Result};
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const LOGGER_EXIT_WAIT: Duration = Duration::from_secs(2);

/// What `start` leaves behind for `stop`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    pub name: String,
    /// Microseconds since the Unix epoch.
    pub start_time: i64,
    /// GPUs the logger watches; empty means all.
    pub gpu_ids: Vec<u32>,
    pub sampling_interval_us: u64,
    pub max_runtime_secs: u64,
    /// Background logger, absent for dry runs.
    pub logger_pid: Option<u32>,
    pub samples_path: Option<PathBuf>,
}

/// Session file of one process, hidden so merges skip it.
pub fn state_path(step_dir: &Path, proc_id: ProcId) -> PathBuf {
    step_dir.join(format!(".session_proc_{proc_id}.json"))
}

fn samples_path(step_dir: &Path, proc_id: ProcId) -> PathBuf {
    step_dir.join(format!(".session_proc_{proc_id}.samples"))
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

/// Result of `stop` on a collecting process.
#[derive(Debug, Clone, Serialize)]
pub struct StopOutcome {
    pub target: PathBuf,
    pub rows: usize,
    pub samples: usize,
}

fn collecting_plan(
    topo: &JobTopology,
    options: &RecorderOptions,
) -> Result<Option<(Roles, OutputPlan)>> {
    let roles = resolve_roles(topo, options.ignore_gpu_binding)?;
    if !roles.root && !roles.node_root {
        debug!(proc_id = %topo.proc_id, "not a collector; nothing to do");
        return Ok(None);
    }
    let plan = prepare(topo, &roles, &options.layout, &options.cwd)?;
    Ok(roles.node_root.then_some((roles, plan)))
}

/// Open a session. `logger` is the nvidia-smi executable; `None` records
/// identity only. Returns `None` on processes that do not collect.
pub fn start(
    topo: &JobTopology,
    options: &RecorderOptions,
    logger: Option<&str>,
) -> Result<Option<SessionState>> {
    let Some((roles, plan)) = collecting_plan(topo, options)? else {
        return Ok(None);
    };
    let state_file = state_path(&plan.step_dir, topo.proc_id);
    if state_file.exists() {
        return Err(Error::OutputCollision { path: state_file });
    }

    let time = resolve_time_params(
        options.max_runtime_secs,
        topo.time_limit_secs,
        options.sampling_time_secs,
    );
    let bound = !topo.gpu_ids.is_empty() && !options.ignore_gpu_binding;
    let gpu_ids = if bound { topo.gpu_ids.clone() } else { Vec::new() };
    let (name, truncated) = session_name(topo.job_id, topo.proc_id, topo.step_id);
    if truncated {
        warn!(session = %name, "session name truncated to 63 characters");
    }

    let (logger_pid, samples) = match logger {
        Some(program) => {
            let log = samples_path(&plan.step_dir, topo.proc_id);
            let pid = spawn_smi_logger(program, &gpu_ids, time.sampling_interval_us / 1000, &log)?;
            (Some(pid), Some(log))
        }
        None => (None, None),
    };
    let state = SessionState {
        name,
        start_time: now_micros(),
        gpu_ids,
        sampling_interval_us: time.sampling_interval_us,
        max_runtime_secs: time.max_runtime_secs,
        logger_pid,
        samples_path: samples,
    };

    if let Err(e) = save_state(&state_file, &state) {
        if let Some(pid) = state.logger_pid {
            terminate_logger(pid);
        }
        return Err(e);
    }
    info!(
        session = %state.name,
        state = %state_file.display(),
        logger_pid = ?state.logger_pid,
        tasks_per_node = roles.tasks_per_node,
        max_runtime_secs = state.max_runtime_secs,
        sampling_interval_us = state.sampling_interval_us,
        "telemetry session started"
    );
    Ok(Some(state))
}

fn save_state(path: &Path, state: &SessionState) -> Result<()> {
    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    let mut sink = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut sink, state)?;
    sink.flush()?;
    Ok(())
}

fn load_state(path: &Path) -> Result<SessionState> {
    let file = fs::File::open(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => Error::Telemetry(format!(
            "no session was started for this process ({} missing)",
            path.display()
        )),
        _ => Error::Io(e),
    })?;
    Ok(serde_json::from_reader(BufReader::new(file))?)
}

/// Close the session opened by [`start`] and write the fragment.
pub fn stop(topo: &JobTopology, options: &RecorderOptions) -> Result<Option<StopOutcome>> {
    let Some((_, plan)) = collecting_plan(topo, options)? else {
        return Ok(None);
    };
    let state_file = state_path(&plan.step_dir, topo.proc_id);
    let state = load_state(&state_file)?;

    if let Some(pid) = state.logger_pid {
        terminate_logger(pid);
    }
    let end_time = now_micros();
    let elapsed_secs = end_time.saturating_sub(state.start_time) / 1_000_000;
    if u64::try_from(elapsed_secs).is_ok_and(|s| s > state.max_runtime_secs) {
        warn!(
            elapsed_secs,
            max_runtime_secs = state.max_runtime_secs,
            "session ran past its maximum runtime"
        );
    }

    let samples = match &state.samples_path {
        Some(path) => {
            let log = fs::read_to_string(path).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "logger output unreadable");
                String::new()
            });
            let (samples, dropped) = parse_smi_log(&log);
            if dropped > 0 {
                debug!(dropped, "dropped malformed logger lines");
            }
            samples
        }
        None => Vec::new(),
    };
    let summaries = summarize(&samples, state.start_time, end_time);
    if summaries.is_empty() {
        warn!(session = %state.name, "telemetry session returned no GPUs");
    }
    let table = build_table(topo, &summaries);
    write_fragment(&table, &plan)?;

    for leftover in std::iter::once(&state_file).chain(state.samples_path.as_ref()) {
        if let Err(e) = fs::remove_file(leftover) {
            warn!(path = %leftover.display(), error = %e, "failed to remove session file");
        }
    }
    info!(session = %state.name, rows = table.len(), samples = samples.len(), "telemetry session stopped");
    Ok(Some(StopOutcome {
        target: plan.target,
        rows: table.len(),
        samples: samples.len(),
    }))
}

/// Whether `pid` still runs an nvidia-smi logger. Without procfs the PID is
/// trusted as is.
fn is_logger(pid: u32) -> bool {
    match fs::read(format!("/proc/{pid}/cmdline")) {
        Ok(cmdline) => String::from_utf8_lossy(&cmdline).contains(SMI_LOOP_FLAG),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(_) => true,
    }
}

#[cfg(unix)]
fn terminate_logger(pid: u32) {
    let Ok(raw) = libc::pid_t::try_from(pid) else {
        return;
    };
    if !is_logger(pid) {
        debug!(pid, "logger already gone");
        return;
    }
    if unsafe { libc::kill(raw, libc::SIGTERM) } != 0 {
        warn!(pid, error = %std::io::Error::last_os_error(), "failed to stop logger");
        return;
    }
    let deadline = Instant::now() + LOGGER_EXIT_WAIT;
    while is_logger(pid) && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(20));
    }
    debug!(pid, "logger stopped");
}

#[cfg(not(unix))]
fn terminate_logger(pid: u32) {
    warn!(pid, "cannot stop the logger on this platform");
}
