//! Persisting a process's fragment to its planned target.

use crate::layout::{OutputMode, OutputPlan};
use crate::lock::WriteLock;
use jr_common::{Error, Result};
use jr_telemetry::RecordTable;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, Write};
use tracing::{info, warn};

/// Write `table` as planned.
///
/// Split mode creates the fragment exclusively. Single-file mode appends to
/// the shared file while holding the step's write lock; the CSV header is
/// written only by whoever finds the file empty. The append is encoded in
/// memory first and rolled back on a failed write, so rows other collectors
/// already committed stay decodable.
pub fn write_fragment(table: &RecordTable, plan: &OutputPlan) -> Result<()> {
    match plan.mode {
        OutputMode::Split => {
            let file = OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&plan.target)
                .map_err(|e| match e.kind() {
                    std::io::ErrorKind::AlreadyExists => Error::OutputCollision {
                        path: plan.target.clone(),
                    },
                    _ => Error::Io(e),
                })?;
            let mut sink = BufWriter::new(file);
            table.dump(&mut sink, plan.format)?;
            sink.into_inner()
                .map_err(|e| Error::Io(e.into_error()))?
                .sync_all()?;
        }
        OutputMode::SingleFile => {
            let lock_path = plan.lock_path.as_deref().ok_or_else(|| {
                Error::Config("single-file output planned without a lock path".to_string())
            })?;
            let _lock = WriteLock::acquire(lock_path)?;
            let mut file = OpenOptions::new()
                .read(true)
                .create(true)
                .append(true)
                .open(&plan.target)?;
            let mut committed = file.metadata()?.len();

            if committed > 0 && !holds_only_this_step(&file, plan) {
                if !plan.overwrite {
                    return Err(Error::OutputCollision {
                        path: plan.target.clone(),
                    });
                }
                file.set_len(0)?;
                committed = 0;
                info!(path = %plan.target.display(), "truncated shared file of another step");
            }

            let mut encoded = Vec::new();
            if committed == 0 {
                table.dump(&mut encoded, plan.format)?;
            } else {
                table.dump_rows(&mut encoded, plan.format)?;
            }
            if let Err(e) = file.write_all(&encoded).and_then(|()| file.sync_all()) {
                if let Err(rollback) = file.set_len(committed) {
                    warn!(
                        path = %plan.target.display(),
                        error = %rollback,
                        "failed to roll back partial append"
                    );
                }
                return Err(e.into());
            }
        }
    }
    info!(
        path = %plan.target.display(),
        rows = table.len(),
        mode = ?plan.mode,
        "fragment written"
    );
    Ok(())
}

/// Whether every row already in the shared file belongs to the planned step.
/// An undecodable file belongs to nobody.
fn holds_only_this_step(file: &File, plan: &OutputPlan) -> bool {
    let mut existing = RecordTable::new();
    if let Err(e) = existing.load(&mut BufReader::new(file), plan.format) {
        warn!(path = %plan.target.display(), error = %e, "shared file is unreadable");
        return false;
    }
    let only_this_step = existing
        .rows()
        .all(|r| r.job_id == plan.job_id.0 && r.step_id == plan.step_id.0);
    only_this_step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{plan, LayoutOptions};
    use crate::merge::merge_step;
    use jr_common::JobTopology;
    use jr_math::Stat;
    use jr_telemetry::{RecordRow, StorageFormat, CSV_HEADER};
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn table(host: &str, gpus: u32) -> RecordTable {
        job_table(1, host, gpus)
    }

    fn job_table(job_id: u32, host: &str, gpus: u32) -> RecordTable {
        (0..gpus)
            .map(|gpu_id| RecordRow {
                job_id,
                step_id: 0,
                user: "u".into(),
                account: "a".into(),
                num_nodes: 4,
                host: host.into(),
                gpu_id,
                power_usage: Stat::new(1.0, 3.0, 2.0),
                start_time: 10,
                end_time: 20,
                sm_utilization: Stat::new(1, 3, 2),
                memory_utilization: Stat::new(1, 3, 2),
            })
            .collect()
    }

    #[test]
    fn test_split_refuses_existing_target() {
        let dir = tempdir().unwrap();
        let p = plan(&JobTopology::new(1, 0, 0), &LayoutOptions::default(), dir.path());
        std::fs::create_dir_all(&p.step_dir).unwrap();
        write_fragment(&table("h", 1), &p).unwrap();
        assert!(matches!(
            write_fragment(&table("h", 1), &p),
            Err(Error::OutputCollision { .. })
        ));
    }

    #[test]
    fn test_single_file_concurrent_appends() {
        for format in [StorageFormat::Csv, StorageFormat::Binary] {
            let dir = tempdir().unwrap();
            let opts = LayoutOptions {
                mode: OutputMode::SingleFile,
                format,
                ..LayoutOptions::default()
            };
            let base = Arc::new(dir.path().to_path_buf());
            let handles: Vec<_> = (0..4u32)
                .map(|node| {
                    let base = Arc::clone(&base);
                    let opts = opts.clone();
                    thread::spawn(move || {
                        let p = plan(&JobTopology::new(1, 0, node * 4), &opts, &base);
                        std::fs::create_dir_all(&p.step_dir).unwrap();
                        write_fragment(&table(&format!("nid{node}"), 2), &p).unwrap();
                        p
                    })
                })
                .collect();
            let plans: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            if format == StorageFormat::Csv {
                let text = std::fs::read_to_string(&plans[0].target).unwrap();
                assert_eq!(text.matches(CSV_HEADER).count(), 1);
            }
            let (merged, stats) = merge_step(&plans[0].step_dir).unwrap();
            assert_eq!(stats.loaded, 1);
            assert_eq!(merged.len(), 8);
        }
    }

    fn single_file(format: StorageFormat, overwrite: bool) -> LayoutOptions {
        LayoutOptions {
            mode: OutputMode::SingleFile,
            format,
            overwrite,
            ..LayoutOptions::default()
        }
    }

    #[test]
    fn test_single_file_failed_append_keeps_committed_rows() {
        let dir = tempdir().unwrap();
        let opts = single_file(StorageFormat::Binary, false);
        let first = plan(&JobTopology::new(1, 0, 0), &opts, dir.path());
        std::fs::create_dir_all(&first.step_dir).unwrap();
        write_fragment(&table("nid0", 1), &first).unwrap();
        let committed = std::fs::metadata(&first.target).unwrap().len();

        let second = plan(&JobTopology::new(1, 0, 4), &opts, dir.path());
        let mut rows = table("nid1", 2);
        rows.extend(&table(&"x".repeat(70_000), 1));
        assert!(write_fragment(&rows, &second).is_err());

        assert_eq!(std::fs::metadata(&first.target).unwrap().len(), committed);
        let (merged, _) = merge_step(&first.step_dir).unwrap();
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.row(0).unwrap().host, "nid0");
    }

    #[test]
    fn test_single_file_rejects_rows_of_another_job() {
        for format in [StorageFormat::Csv, StorageFormat::Binary] {
            let dir = tempdir().unwrap();
            let old = plan(&JobTopology::new(100, 0, 0), &single_file(format, false), dir.path());
            std::fs::create_dir_all(&old.step_dir).unwrap();
            write_fragment(&job_table(100, "nid0", 1), &old).unwrap();

            let new = plan(&JobTopology::new(200, 0, 0), &single_file(format, false), dir.path());
            assert!(matches!(
                write_fragment(&job_table(200, "nid0", 1), &new),
                Err(Error::OutputCollision { .. })
            ));

            let forced = plan(&JobTopology::new(200, 0, 0), &single_file(format, true), dir.path());
            write_fragment(&job_table(200, "nid0", 1), &forced).unwrap();
            let (merged, _) = merge_step(&forced.step_dir).unwrap();
            let jobs: Vec<u32> = merged.rows().map(|r| r.job_id).collect();
            assert_eq!(jobs, vec![200]);

            // Same step again: appended, not a collision.
            let peer = plan(&JobTopology::new(200, 0, 4), &single_file(format, false), dir.path());
            write_fragment(&job_table(200, "nid1", 1), &peer).unwrap();
            assert_eq!(merge_step(&peer.step_dir).unwrap().0.len(), 2);
        }
    }
}
