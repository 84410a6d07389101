//! GPU telemetry sources.
//!
//! A source exposes the group/watch/session protocol of a GPU telemetry
//! service: select GPUs, configure sampling, then bracket the workload with
//! `start_session`/`stop_session` to obtain one windowed summary per GPU.
//!
//! - [`SmiTelemetrySource`] polls `nvidia-smi` from a background thread.
//! - [`StaticTelemetrySource`] returns fixed summaries (tests, dry runs).
//! - [`spawn_smi_logger`] leaves nvidia-smi looping on its own for sessions
//!   that span two invocations.

use jr_common::{Error, Result};
use jr_math::measure::INT64_BLANK;
use jr_math::Stat;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Opaque GPU group identifier handed out by a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GroupHandle(pub u64);

/// Windowed summary of one GPU over a session.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GpuSummary {
    pub gpu_id: u32,
    /// Watts.
    pub power_usage: Stat<f64>,
    /// Percent.
    pub sm_utilization: Stat<i32>,
    /// Percent.
    pub memory_utilization: Stat<i32>,
    /// Bytes received over PCIe during the window.
    pub pcie_rx_bytes: i64,
    /// Bytes sent over PCIe during the window.
    pub pcie_tx_bytes: i64,
    /// Microseconds since the Unix epoch.
    pub start_time: i64,
    /// Microseconds since the Unix epoch.
    pub end_time: i64,
}

/// Group/watch/session protocol of a GPU telemetry service.
pub trait TelemetrySource {
    /// Create a group of GPUs. `None` selects every GPU on the host.
    fn create_group(&mut self, gpu_ids: Option<&[u32]>) -> Result<GroupHandle>;

    /// Configure sampling for a group.
    fn watch(
        &mut self,
        group: GroupHandle,
        sampling_interval_us: u64,
        max_duration_s: u64,
    ) -> Result<()>;

    fn start_session(&mut self, group: GroupHandle, name: &str) -> Result<()>;

    /// End a session and summarize what was sampled during it.
    fn stop_session(&mut self, name: &str) -> Result<Vec<GpuSummary>>;

    fn destroy_group(&mut self, group: GroupHandle) -> Result<()>;
}

fn now_micros() -> i64 {
    chrono::Utc::now().timestamp_micros()
}

// ---------------------------------------------------------------------------
// nvidia-smi
// ---------------------------------------------------------------------------

/// Errors from the nvidia-smi source.
#[derive(Debug, thiserror::Error)]
pub enum SmiError {
    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited {status}: {stderr}")]
    Failed {
        program: String,
        status: String,
        stderr: String,
    },

    #[error("failed to parse nvidia-smi output: {0}")]
    Parse(String),

    #[error("unknown group {0}")]
    UnknownGroup(u64),

    #[error("unknown session '{0}'")]
    UnknownSession(String),

    #[error("session '{0}' already running")]
    SessionExists(String),

    #[error("sampling thread panicked")]
    ThreadPanicked,
}

impl From<SmiError> for Error {
    fn from(err: SmiError) -> Self {
        Error::Telemetry(err.to_string())
    }
}

/// One nvidia-smi reading of one GPU.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SmiSample {
    pub gpu_id: u32,
    pub power_w: f64,
    pub sm_percent: i32,
    pub memory_percent: i32,
}

const SMI_QUERY: &str = "--query-gpu=index,power.draw,utilization.gpu,utilization.memory";

fn is_unavailable(field: &str) -> bool {
    let f = field.trim();
    f.is_empty() || f.starts_with('[') || f == "N/A"
}

fn float_field(field: &str) -> Result<f64, SmiError> {
    if is_unavailable(field) {
        return Ok(f64::NAN);
    }
    field
        .trim()
        .parse()
        .map_err(|e| SmiError::Parse(format!("bad float '{field}': {e}")))
}

fn percent_field(field: &str) -> Result<i32, SmiError> {
    if is_unavailable(field) {
        return Ok(jr_math::measure::INT32_BLANK);
    }
    field
        .trim()
        .parse()
        .map_err(|e| SmiError::Parse(format!("bad percentage '{field}': {e}")))
}

/// Parse `--format=csv,noheader,nounits` output of [`SMI_QUERY`].
///
/// `[N/A]` and `[Not Supported]` readings become sentinels.
pub fn parse_smi_csv(csv: &str) -> Result<Vec<SmiSample>, SmiError> {
    let mut samples = Vec::new();
    for line in csv.lines().map(str::trim).filter(|l| !l.is_empty()) {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() != 4 {
            return Err(SmiError::Parse(format!(
                "expected 4 CSV fields, got {}: {line}",
                fields.len()
            )));
        }
        let gpu_id = fields[0]
            .parse::<u32>()
            .map_err(|e| SmiError::Parse(format!("bad GPU index '{}': {e}", fields[0])))?;
        samples.push(SmiSample {
            gpu_id,
            power_w: float_field(fields[1])?,
            sm_percent: percent_field(fields[2])?,
            memory_percent: percent_field(fields[3])?,
        });
    }
    Ok(samples)
}

/// Parse the output a looping logger accumulated.
///
/// Lines are independent readings; malformed ones (a line cut short when
/// the logger was stopped) are dropped and counted.
pub fn parse_smi_log(log: &str) -> (Vec<SmiSample>, usize) {
    let mut samples = Vec::new();
    let mut dropped = 0;
    for line in log.lines() {
        match parse_smi_csv(line) {
            Ok(batch) => samples.extend(batch),
            Err(e) => {
                trace!(error = %e, "dropping logger line");
                dropped += 1;
            }
        }
    }
    (samples, dropped)
}

fn smi_command(program: &str, gpu_ids: &[u32]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args([SMI_QUERY, "--format=csv,noheader,nounits"]);
    if !gpu_ids.is_empty() {
        let ids: Vec<String> = gpu_ids.iter().map(u32::to_string).collect();
        cmd.arg(format!("--id={}", ids.join(",")));
    }
    cmd
}

/// Flag that makes nvidia-smi repeat the query; also identifies a logger
/// process in `/proc/<pid>/cmdline`.
pub const SMI_LOOP_FLAG: &str = "--loop-ms";

/// Launch `program` repeating the query every `interval_ms`, with its
/// readings going to `log`. The logger is not waited for and outlives the
/// calling process; returns its PID.
pub fn spawn_smi_logger(
    program: &str,
    gpu_ids: &[u32],
    interval_ms: u64,
    log: &Path,
) -> Result<u32> {
    let sink = File::create(log)?;
    let spawned = smi_command(program, gpu_ids)
        .arg(format!("{SMI_LOOP_FLAG}={}", interval_ms.max(1)))
        .stdin(Stdio::null())
        .stdout(sink)
        .stderr(Stdio::null())
        .spawn();
    let child = match spawned {
        Ok(child) => child,
        Err(source) => {
            if let Err(e) = std::fs::remove_file(log) {
                debug!(log = %log.display(), error = %e, "failed to remove logger output");
            }
            return Err(SmiError::Spawn {
                program: program.to_string(),
                source,
            }
            .into());
        }
    };
    debug!(pid = child.id(), log = %log.display(), "nvidia-smi logger started");
    Ok(child.id())
}

fn query_smi(program: &str, gpu_ids: &[u32]) -> Result<Vec<SmiSample>, SmiError> {
    let output = smi_command(program, gpu_ids).output().map_err(|source| SmiError::Spawn {
        program: program.to_string(),
        source,
    })?;
    if !output.status.success() {
        return Err(SmiError::Failed {
            program: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    parse_smi_csv(&String::from_utf8_lossy(&output.stdout))
}

/// Reduce raw samples to one summary per GPU, ordered by GPU id.
pub fn summarize(samples: &[SmiSample], start_time: i64, end_time: i64) -> Vec<GpuSummary> {
    let mut by_gpu: BTreeMap<u32, Vec<SmiSample>> = BTreeMap::new();
    for s in samples {
        by_gpu.entry(s.gpu_id).or_default().push(*s);
    }
    by_gpu
        .into_iter()
        .map(|(gpu_id, samples)| {
            let power: Vec<f64> = samples.iter().map(|s| s.power_w).collect();
            let sm: Vec<i32> = samples.iter().map(|s| s.sm_percent).collect();
            let mem: Vec<i32> = samples.iter().map(|s| s.memory_percent).collect();
            GpuSummary {
                gpu_id,
                power_usage: Stat::from_samples(&power),
                sm_utilization: Stat::from_samples(&sm),
                memory_utilization: Stat::from_samples(&mem),
                // nvidia-smi has no cumulative PCIe byte counters.
                pcie_rx_bytes: INT64_BLANK,
                pcie_tx_bytes: INT64_BLANK,
                start_time,
                end_time,
            }
        })
        .collect()
}

#[derive(Debug, Clone, Copy)]
struct WatchParams {
    interval: Duration,
    max_duration: Duration,
}

struct Session {
    stop: Sender<()>,
    worker: JoinHandle<Vec<SmiSample>>,
    start_time: i64,
}

/// Polls `nvidia-smi` at the watch interval while a session is open.
pub struct SmiTelemetrySource {
    program: String,
    next_group: u64,
    groups: HashMap<u64, Vec<u32>>,
    watches: HashMap<u64, WatchParams>,
    sessions: HashMap<String, Session>,
}

impl Default for SmiTelemetrySource {
    fn default() -> Self {
        Self::new()
    }
}

impl SmiTelemetrySource {
    pub fn new() -> Self {
        Self::with_program("nvidia-smi")
    }

    /// Use a different executable speaking the nvidia-smi query CLI.
    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            next_group: 1,
            groups: HashMap::new(),
            watches: HashMap::new(),
            sessions: HashMap::new(),
        }
    }

    /// Check that the tool runs at all.
    pub fn probe(&self) -> Result<()> {
        query_smi(&self.program, &[])?;
        Ok(())
    }
}

fn poll_loop(
    program: String,
    gpu_ids: Vec<u32>,
    params: WatchParams,
    stop: mpsc::Receiver<()>,
) -> Vec<SmiSample> {
    let started = Instant::now();
    let mut samples = Vec::new();
    let mut failures = 0usize;
    loop {
        match query_smi(&program, &gpu_ids) {
            Ok(batch) => {
                trace!(gpus = batch.len(), "nvidia-smi sample");
                samples.extend(batch);
            }
            Err(e) => {
                failures += 1;
                // One warning per failure streak is enough.
                if failures == 1 {
                    warn!(error = %e, "nvidia-smi query failed");
                }
            }
        }
        if started.elapsed() >= params.max_duration {
            debug!("maximum watch duration reached; sampling stopped");
            break;
        }
        match stop.recv_timeout(params.interval) {
            Err(RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    if failures > 0 {
        warn!(failures, samples = samples.len(), "nvidia-smi sampling had failures");
    }
    samples
}

impl TelemetrySource for SmiTelemetrySource {
    fn create_group(&mut self, gpu_ids: Option<&[u32]>) -> Result<GroupHandle> {
        let id = self.next_group;
        self.next_group += 1;
        self.groups
            .insert(id, gpu_ids.map(<[u32]>::to_vec).unwrap_or_default());
        debug!(group = id, gpus = ?gpu_ids, "created GPU group");
        Ok(GroupHandle(id))
    }

    fn watch(
        &mut self,
        group: GroupHandle,
        sampling_interval_us: u64,
        max_duration_s: u64,
    ) -> Result<()> {
        if !self.groups.contains_key(&group.0) {
            return Err(SmiError::UnknownGroup(group.0).into());
        }
        self.watches.insert(
            group.0,
            WatchParams {
                // Zero would spin.
                interval: Duration::from_micros(sampling_interval_us.max(1_000)),
                max_duration: Duration::from_secs(max_duration_s),
            },
        );
        Ok(())
    }

    fn start_session(&mut self, group: GroupHandle, name: &str) -> Result<()> {
        if self.sessions.contains_key(name) {
            return Err(SmiError::SessionExists(name.to_string()).into());
        }
        let gpu_ids = self
            .groups
            .get(&group.0)
            .cloned()
            .ok_or(SmiError::UnknownGroup(group.0))?;
        let params = self.watches.get(&group.0).copied().unwrap_or(WatchParams {
            interval: Duration::from_secs(1),
            max_duration: Duration::from_secs(24 * 60 * 60),
        });

        let (stop, stop_rx) = mpsc::channel();
        let program = self.program.clone();
        let start_time = now_micros();
        let worker = thread::Builder::new()
            .name(format!("smi-{name}"))
            .spawn(move || poll_loop(program, gpu_ids, params, stop_rx))
            .map_err(|e| Error::Telemetry(format!("failed to start sampling thread: {e}")))?;
        self.sessions.insert(
            name.to_string(),
            Session {
                stop,
                worker,
                start_time,
            },
        );
        debug!(session = name, interval = ?params.interval, "telemetry session started");
        Ok(())
    }

    fn stop_session(&mut self, name: &str) -> Result<Vec<GpuSummary>> {
        let session = self
            .sessions
            .remove(name)
            .ok_or_else(|| SmiError::UnknownSession(name.to_string()))?;
        // The worker may already have exited on its own.
        let _ = session.stop.send(());
        let samples = session
            .worker
            .join()
            .map_err(|_| SmiError::ThreadPanicked)?;
        let end_time = now_micros();
        debug!(session = name, samples = samples.len(), "telemetry session stopped");
        Ok(summarize(&samples, session.start_time, end_time))
    }

    fn destroy_group(&mut self, group: GroupHandle) -> Result<()> {
        self.watches.remove(&group.0);
        self.groups
            .remove(&group.0)
            .map(|_| ())
            .ok_or_else(|| SmiError::UnknownGroup(group.0).into())
    }
}

// ---------------------------------------------------------------------------
// Static source
// ---------------------------------------------------------------------------

/// Source returning preset summaries.
///
/// Groups filter the presets by GPU id; the session window is stamped with
/// the real start and stop times unless the preset carries its own.
#[derive(Debug, Clone, Default)]
pub struct StaticTelemetrySource {
    summaries: Vec<GpuSummary>,
    next_group: u64,
    groups: HashMap<u64, Option<Vec<u32>>>,
    sessions: HashMap<String, (u64, i64)>,
}

impl StaticTelemetrySource {
    pub fn new(summaries: Vec<GpuSummary>) -> Self {
        Self {
            summaries,
            ..Self::default()
        }
    }
}

impl TelemetrySource for StaticTelemetrySource {
    fn create_group(&mut self, gpu_ids: Option<&[u32]>) -> Result<GroupHandle> {
        self.next_group += 1;
        self.groups
            .insert(self.next_group, gpu_ids.map(<[u32]>::to_vec));
        Ok(GroupHandle(self.next_group))
    }

    fn watch(&mut self, group: GroupHandle, _: u64, _: u64) -> Result<()> {
        if self.groups.contains_key(&group.0) {
            Ok(())
        } else {
            Err(Error::Telemetry(format!("unknown group {}", group.0)))
        }
    }

    fn start_session(&mut self, group: GroupHandle, name: &str) -> Result<()> {
        if !self.groups.contains_key(&group.0) {
            return Err(Error::Telemetry(format!("unknown group {}", group.0)));
        }
        self.sessions
            .insert(name.to_string(), (group.0, now_micros()));
        Ok(())
    }

    fn stop_session(&mut self, name: &str) -> Result<Vec<GpuSummary>> {
        let (group, start) = self
            .sessions
            .remove(name)
            .ok_or_else(|| Error::Telemetry(format!("unknown session '{name}'")))?;
        let end = now_micros();
        let filter = self.groups.get(&group).cloned().flatten();
        Ok(self
            .summaries
            .iter()
            .filter(|s| filter.as_ref().map_or(true, |ids| ids.contains(&s.gpu_id)))
            .map(|s| GpuSummary {
                start_time: if s.start_time == 0 { start } else { s.start_time },
                end_time: if s.end_time == 0 { end } else { s.end_time },
                ..s.clone()
            })
            .collect())
    }

    fn destroy_group(&mut self, group: GroupHandle) -> Result<()> {
        self.groups
            .remove(&group.0)
            .map(|_| ())
            .ok_or_else(|| Error::Telemetry(format!("unknown group {}", group.0)))
    }
}
