//! Output tree planning.
//!
//! ```text
//! <base>/
//!   .jobreport_root          marker, created by the job root
//!   step_<N>/
//!     proc_<P>.<ext>         split mode, one per collecting process
//!     gpus.<ext>             single-file mode, shared by all collectors
//!     .gpus.<ext>.lock       single-file lock (unless a lock dir is set)
//! ```
//!
//! Every directory is created with `create_dir_all`, so processes of the same
//! job can plan concurrently in any order.

use crate::topology::Roles;
use jr_common::{Error, JobId, JobTopology, Result, StepId};
use jr_telemetry::StorageFormat;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Marker file identifying the top of a job's output tree.
pub const ROOT_MARKER: &str = ".jobreport_root";

const STEP_DIR_PREFIX: &str = "step_";

/// How collectors of one step lay out their fragments.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// One file per collecting process.
    #[default]
    Split,
    /// One shared file per step, appended to under an exclusive lock.
    SingleFile,
}

#[derive(Debug, Clone, Default)]
pub struct LayoutOptions {
    /// Base directory; `<cwd>/jobreport_<job>` when unset.
    pub base: Option<PathBuf>,
    pub mode: OutputMode,
    pub format: StorageFormat,
    /// Replace an existing fragment, or a shared file left by another
    /// job, instead of failing.
    pub overwrite: bool,
    pub lock_dir: Option<PathBuf>,
}

/// Resolved locations for one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutputPlan {
    pub base: PathBuf,
    pub step_dir: PathBuf,
    /// File this process writes its fragment to.
    pub target: PathBuf,
    /// Lock guarding `target`, single-file mode only.
    pub lock_path: Option<PathBuf>,
    pub mode: OutputMode,
    pub format: StorageFormat,
    /// Step whose rows `target` may hold.
    pub job_id: JobId,
    pub step_id: StepId,
    pub overwrite: bool,
}

/// Default output base for a job.
pub fn default_base(cwd: &Path, job_id: JobId) -> PathBuf {
    cwd.join(format!("jobreport_{job_id}"))
}

pub fn step_dir_name(step: u32) -> String {
    format!("{STEP_DIR_PREFIX}{step}")
}

/// Compute the plan without touching the filesystem.
pub fn plan(topo: &JobTopology, opts: &LayoutOptions, cwd: &Path) -> OutputPlan {
    let base = opts
        .base
        .clone()
        .unwrap_or_else(|| default_base(cwd, topo.job_id));
    let step_dir = base.join(step_dir_name(topo.step_id.0));
    let ext = opts.format.extension();
    let (target, lock_path) = match opts.mode {
        OutputMode::Split => (step_dir.join(format!("proc_{}.{ext}", topo.proc_id)), None),
        OutputMode::SingleFile => {
            let lock = match &opts.lock_dir {
                Some(dir) => dir.join(format!(
                    "jobreport_{}_step_{}.lock",
                    topo.job_id, topo.step_id
                )),
                None => step_dir.join(format!(".gpus.{ext}.lock")),
            };
            (step_dir.join(format!("gpus.{ext}")), Some(lock))
        }
    };
    OutputPlan {
        base,
        step_dir,
        target,
        lock_path,
        mode: opts.mode,
        format: opts.format,
        job_id: topo.job_id,
        step_id: topo.step_id,
        overwrite: opts.overwrite,
    }
}

fn ensure_dir(path: &Path) -> Result<()> {
    if path.exists() && !path.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    fs::create_dir_all(path)?;
    Ok(())
}

/// Plan and create the output tree for this process.
///
/// The root creates the base and the marker. Collectors create the step
/// directory and, in split mode, claim their fragment path: an existing file
/// is a collision unless `overwrite` is set, in which case it is removed.
pub fn prepare(
    topo: &JobTopology,
    roles: &Roles,
    opts: &LayoutOptions,
    cwd: &Path,
) -> Result<OutputPlan> {
    let plan = plan(topo, opts, cwd);

    if plan.base.exists() && !plan.base.is_dir() {
        return Err(Error::OutputCollision { path: plan.base });
    }

    if roles.root {
        fs::create_dir_all(&plan.base)?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(plan.base.join(ROOT_MARKER))?;
        debug!(base = %plan.base.display(), "output root marked");
    }

    if roles.node_root {
        ensure_dir(&plan.step_dir)?;
        if let (Some(lock), Some(dir)) = (&plan.lock_path, &opts.lock_dir) {
            ensure_dir(dir)?;
            debug!(lock = %lock.display(), "using external lock directory");
        }
        if plan.mode == OutputMode::Split && plan.target.exists() {
            if !opts.overwrite {
                return Err(Error::OutputCollision { path: plan.target });
            }
            fs::remove_file(&plan.target)?;
            info!(path = %plan.target.display(), "removed existing fragment");
        }
    }

    Ok(plan)
}
