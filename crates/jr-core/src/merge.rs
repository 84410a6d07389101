//! Merging fragments back into one table per step.
//!
//! The merge runs after the job, on a quiescent tree, and takes no locks.
//! Fragments that cannot be read are skipped with a warning; the result is
//! sorted so it depends only on which rows were loaded.

use crate::layout::ROOT_MARKER;
use jr_common::{Error, Result};
use jr_telemetry::{RecordTable, StorageFormat};
use regex::Regex;
use serde::Serialize;
use std::cmp::Ordering;
use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static STEP_DIR_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^step_(\d+)$").expect("static regex"));

/// File counts from one step merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub loaded: usize,
    pub skipped: usize,
    pub rows: usize,
}

/// Merged data of one step directory.
#[derive(Debug, Clone)]
pub struct StepMerge {
    /// Directory name, e.g. `step_0`.
    pub name: String,
    pub table: RecordTable,
    pub stats: MergeStats,
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.'))
}

fn load_fragment(path: &Path, table: &mut RecordTable) -> Result<usize> {
    let format = StorageFormat::from_path(path);
    let mut reader = BufReader::new(File::open(path)?);
    table.load(&mut reader, format)
}

/// Load every fragment in `dir` into one sorted table.
///
/// Hidden entries (the marker, lock files) and subdirectories are ignored.
/// Fragments without rows (dry runs, nodes where sampling failed) count as
/// neither loaded nor skipped; a step where nothing contributed rows has no
/// data.
pub fn merge_step(dir: &Path) -> Result<(RecordTable, MergeStats)> {
    let mut table = RecordTable::new();
    let mut stats = MergeStats::default();

    for entry in fs::read_dir(dir)? {
        let path = match entry {
            Ok(entry) => entry.path(),
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "unreadable directory entry");
                stats.skipped += 1;
                continue;
            }
        };
        if is_hidden(&path) || !path.is_file() {
            continue;
        }
        match load_fragment(&path, &mut table) {
            Ok(0) => debug!(path = %path.display(), "fragment holds no rows"),
            Ok(rows) => {
                debug!(path = %path.display(), rows, "loaded fragment");
                stats.loaded += 1;
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "skipping unreadable fragment");
                stats.skipped += 1;
            }
        }
    }

    if stats.loaded == 0 {
        return Err(Error::NoData {
            path: dir.to_path_buf(),
        });
    }
    table.sort_by_host_gpu();
    stats.rows = table.len();
    info!(
        dir = %dir.display(),
        loaded = stats.loaded,
        skipped = stats.skipped,
        rows = stats.rows,
        "merged step"
    );
    Ok((table, stats))
}

/// Whether `dir` is the top of a job output tree.
pub fn is_job_root(dir: &Path) -> bool {
    dir.join(ROOT_MARKER).is_file()
}

fn step_number(name: &str) -> Option<u64> {
    STEP_DIR_RE
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Numbered steps first in numeric order, then everything else by name.
fn compare_step_names(a: &str, b: &str) -> Ordering {
    match (step_number(a), step_number(b)) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn step_dirs(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut dirs: Vec<(String, PathBuf)> = fs::read_dir(root)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir() && !is_hidden(p))
        .filter_map(|p| {
            let name = p.file_name()?.to_str()?.to_string();
            Some((name, p))
        })
        .collect();
    dirs.sort_by(|(a, _), (b, _)| compare_step_names(a, b));
    Ok(dirs)
}

/// Merge every step of a job tree, in step order.
///
/// Steps without any loadable fragment are skipped; the job fails only when
/// no step has data.
pub fn merge_job(root: &Path) -> Result<Vec<StepMerge>> {
    let mut steps = Vec::new();
    for (name, dir) in step_dirs(root)? {
        match merge_step(&dir) {
            Ok((table, stats)) => steps.push(StepMerge { name, table, stats }),
            Err(e) => warn!(step = %name, error = %e, "skipping step without data"),
        }
    }
    if steps.is_empty() {
        return Err(Error::NoData {
            path: root.to_path_buf(),
        });
    }
    Ok(steps)
}

/// Merge a job root (all steps) or a single step directory.
pub fn merge_path(path: &Path) -> Result<Vec<StepMerge>> {
    if !path.is_dir() {
        return Err(Error::NotADirectory {
            path: path.to_path_buf(),
        });
    }
    if is_job_root(path) {
        return merge_job(path);
    }
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    let (table, stats) = merge_step(path)?;
    Ok(vec![StepMerge { name, table, stats }])
}

#[cfg(test)]
mod tests {
    use super::*;
    use jr_math::Stat;
    use jr_telemetry::RecordRow;
    use tempfile::tempdir;

    #[test]
    fn test_natural_step_order() {
        let mut names = vec!["step_10", "misc", "step_2", "step_1", "aaa", "step_0"];
        names.sort_by(|a, b| compare_step_names(a, b));
        assert_eq!(
            names,
            vec!["step_0", "step_1", "step_2", "step_10", "aaa", "misc"]
        );
    }

    #[test]
    fn test_step_number() {
        assert_eq!(step_number("step_12"), Some(12));
        assert_eq!(step_number("step_"), None);
        assert_eq!(step_number("step_1a"), None);
        assert_eq!(step_number("xstep_1"), None);
    }

    fn fragment(path: &Path, rows: &[(&str, u32)], format: StorageFormat) {
        let table: RecordTable = rows
            .iter()
            .map(|&(host, gpu_id)| RecordRow {
                job_id: 5,
                step_id: 0,
                user: "u".into(),
                account: "a".into(),
                num_nodes: 1,
                host: host.into(),
                gpu_id,
                power_usage: Stat::new(1.0, 3.0, 2.0),
                start_time: 10,
                end_time: 20,
                sm_utilization: Stat::new(1, 3, 2),
                memory_utilization: Stat::new(1, 3, 2),
            })
            .collect();
        let mut file = File::create(path).unwrap();
        table.dump(&mut file, format).unwrap();
    }

    #[test]
    fn test_empty_fragments_do_not_count_as_data() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join(ROOT_MARKER), "").unwrap();
        let good = dir.path().join("step_0");
        let empty = dir.path().join("step_1");
        fs::create_dir_all(&good).unwrap();
        fs::create_dir_all(&empty).unwrap();
        fragment(&good.join("proc_0.csv"), &[("nid001", 0)], StorageFormat::Csv);
        fragment(&good.join("proc_4.bin"), &[], StorageFormat::Binary);
        fragment(&empty.join("proc_0.csv"), &[], StorageFormat::Csv);

        let steps = merge_path(dir.path()).unwrap();
        assert_eq!(steps.len(), 1);
        assert_eq!(steps[0].name, "step_0");
        assert_eq!(
            steps[0].stats,
            MergeStats {
                loaded: 1,
                skipped: 0,
                rows: 1
            }
        );
        assert!(crate::report::build_reports(&steps).is_ok());

        assert!(matches!(
            merge_path(&empty),
            Err(Error::NoData { .. })
        ));
    }

    #[test]
    fn test_hidden() {
        assert!(is_hidden(Path::new("/a/.gpus.csv.lock")));
        assert!(!is_hidden(Path::new("/a/proc_0.csv")));
    }
}
