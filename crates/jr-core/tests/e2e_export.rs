//! CLI E2E tests for `jobreport export`.
//!
//! Validates:
//! - Text, JSON and CSV reports over a job tree with several steps
//! - Corrupt fragments are skipped and counted, not fatal
//! - Steps are reported in natural order (step_2 before step_10)
//! - Exit codes for missing data and bad paths
//! - Parquet side output

use assert_cmd::cargo::cargo_bin_cmd;
use assert_cmd::Command;
use jr_core::layout::ROOT_MARKER;
use jr_math::Stat;
use jr_telemetry::{RecordRow, RecordTable, StorageFormat, CSV_HEADER};
use predicates::prelude::*;
use serde_json::Value;
use std::fs::{self, File};
use std::path::Path;
use std::time::Duration;
use tempfile::tempdir;

fn jobreport() -> Command {
    let mut cmd = cargo_bin_cmd!("jobreport");
    cmd.timeout(Duration::from_secs(60));
    cmd.env("RUST_LOG", "warn");
    cmd
}

fn row(step_id: u32, host: &str, gpu_id: u32, power: f64) -> RecordRow {
    RecordRow {
        job_id: 123,
        step_id,
        user: "alice".into(),
        account: "csstaff".into(),
        num_nodes: 2,
        host: host.into(),
        gpu_id,
        power_usage: Stat::new(power - 5.0, power + 5.0, power),
        start_time: 1_717_000_000_000_000,
        end_time: 1_717_003_600_000_000,
        sm_utilization: Stat::new(10, 90, 50),
        memory_utilization: Stat::new(5, 40, 20),
    }
}

fn write_fragment(path: &Path, rows: Vec<RecordRow>, format: StorageFormat) {
    let table: RecordTable = rows.into_iter().collect();
    let mut file = File::create(path).unwrap();
    table.dump(&mut file, format).unwrap();
}

/// Job tree: step_10 (one CSV fragment), step_2 (CSV + binary + one corrupt).
fn job_tree(root: &Path) {
    fs::write(root.join(ROOT_MARKER), "").unwrap();

    let step2 = root.join("step_2");
    fs::create_dir_all(&step2).unwrap();
    write_fragment(
        &step2.join("proc_4.csv"),
        vec![row(2, "nid002", 1, 150.0), row(2, "nid002", 0, 150.0)],
        StorageFormat::Csv,
    );
    write_fragment(
        &step2.join("proc_0.bin"),
        vec![row(2, "nid001", 0, 100.0)],
        StorageFormat::Binary,
    );
    fs::write(step2.join("proc_8.csv"), format!("{CSV_HEADER}\n123,2,truncated\n")).unwrap();

    let step10 = root.join("step_10");
    fs::create_dir_all(&step10).unwrap();
    write_fragment(
        &step10.join("proc_0.csv"),
        vec![row(10, "nid001", 0, 200.0)],
        StorageFormat::Csv,
    );
}

#[test]
fn test_export_text() {
    let dir = tempdir().unwrap();
    job_tree(dir.path());

    jobreport()
        .arg("export")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("== step_2 (2 fragments, 1 skipped) =="))
        .stdout(predicate::str::contains("== step_10 (1 fragments, 0 skipped) =="))
        .stdout(predicate::str::contains("nid002"))
        .stdout(predicate::str::contains("alice"));
}

#[test]
fn test_export_json_step_order_and_energy() {
    let dir = tempdir().unwrap();
    job_tree(dir.path());

    let output = jobreport()
        .args(["export", "--format", "json"])
        .arg(dir.path())
        .output()
        .unwrap();
    assert!(output.status.success());

    let doc: Value = serde_json::from_slice(&output.stdout).unwrap();
    let steps = doc["steps"].as_array().unwrap();
    assert_eq!(steps.len(), 2);
    assert_eq!(steps[0]["step"], "step_2");
    assert_eq!(steps[1]["step"], "step_10");
    assert_eq!(steps[0]["stats"]["skipped"], 1);

    // 100 W + 150 W + 150 W over one hour.
    let energy = steps[0]["summary"]["energy_wh"].as_f64().unwrap();
    assert!((energy - 400.0).abs() < 1e-6);

    let hosts: Vec<&str> = steps[0]["gpus"]
        .as_array()
        .unwrap()
        .iter()
        .map(|g| g["host"].as_str().unwrap())
        .collect();
    assert_eq!(hosts, vec!["nid001", "nid002", "nid002"]);
    assert_eq!(steps[0]["gpus"][1]["gpu_id"], 0);
}

#[test]
fn test_export_single_step_csv() {
    let dir = tempdir().unwrap();
    job_tree(dir.path());

    let output = jobreport()
        .args(["export", "--format", "csv"])
        .arg(dir.path().join("step_2"))
        .output()
        .unwrap();
    assert!(output.status.success());

    let text = String::from_utf8(output.stdout).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines[0], CSV_HEADER);
    assert_eq!(lines.len(), 4);
    assert!(lines[1].contains(",nid001,0,"));
}

#[test]
fn test_export_to_file_and_parquet() {
    let dir = tempdir().unwrap();
    job_tree(dir.path());
    let out = dir.path().join("report.json");
    let parquet = dir.path().join("rows.parquet");

    jobreport()
        .args(["export", "--format", "json", "--out"])
        .arg(&out)
        .arg("--parquet")
        .arg(&parquet)
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::is_empty());

    let doc: Value = serde_json::from_str(&fs::read_to_string(&out).unwrap()).unwrap();
    assert_eq!(doc["steps"].as_array().unwrap().len(), 2);
    assert!(fs::metadata(&parquet).unwrap().len() > 0);
}

#[test]
fn test_export_without_data_exits_14() {
    let dir = tempdir().unwrap();
    let step = dir.path().join("step_0");
    fs::create_dir_all(&step).unwrap();
    fs::write(step.join("proc_0.bin"), [1u8, 2, 3]).unwrap();

    jobreport()
        .arg("export")
        .arg(&step)
        .assert()
        .code(14)
        .stderr(predicate::str::contains("no readable telemetry"));
}

#[test]
fn test_export_missing_path_exits_13() {
    let dir = tempdir().unwrap();

    jobreport()
        .arg("export")
        .arg(dir.path().join("missing"))
        .assert()
        .code(13);
}

#[test]
fn test_version_json() {
    let output = jobreport().args(["version", "--json"]).output().unwrap();
    assert!(output.status.success());
    let doc: Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(doc["version"], env!("CARGO_PKG_VERSION"));
    assert!(doc["table_schema_version"].is_string());
}
