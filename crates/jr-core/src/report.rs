//! Rendering merged steps for humans (text) and machines (JSON).

use crate::merge::{MergeStats, StepMerge};
use chrono::{DateTime, Utc};
use jr_common::{Result, SCHEMA_VERSION};
use jr_math::{Measure, Stat};
use jr_telemetry::{AggregateRecord, RecordRow};
use serde::Serialize;
use std::fmt::Display;

const NA: &str = "n/a";

/// One merged step with its summary.
#[derive(Debug, Clone)]
pub struct StepReport {
    pub name: String,
    pub summary: AggregateRecord,
    pub gpus: Vec<RecordRow>,
    pub stats: MergeStats,
}

/// Summarize every merged step.
pub fn build_reports(steps: &[StepMerge]) -> Result<Vec<StepReport>> {
    steps
        .iter()
        .map(|s| {
            Ok(StepReport {
                name: s.name.clone(),
                summary: s.table.average()?,
                gpus: s.table.rows().collect(),
                stats: s.stats,
            })
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Text
// ---------------------------------------------------------------------------

fn known<T: Measure + Display>(v: T) -> String {
    if v.is_sentinel() {
        NA.to_string()
    } else {
        v.to_string()
    }
}

fn known_f(v: f64, decimals: usize) -> String {
    if v.is_nan() {
        NA.to_string()
    } else {
        format!("{v:.decimals$}")
    }
}

fn timestamp(micros: i64) -> String {
    if micros.is_sentinel() {
        return NA.to_string();
    }
    DateTime::<Utc>::from_timestamp_micros(micros)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| NA.to_string())
}

fn stat_cells<T: Measure + Display>(s: &Stat<T>) -> String {
    format!("{:>7} {:>7} {:>7}", known(s.avg), known(s.min), known(s.max))
}

fn power_cells(s: &Stat<f64>) -> String {
    format!(
        "{:>9} {:>9} {:>9}",
        known_f(s.avg, 2),
        known_f(s.min, 2),
        known_f(s.max, 2)
    )
}

fn elapsed_secs(row: &RecordRow) -> String {
    if row.start_time.is_sentinel() || row.end_time.is_sentinel() {
        return NA.to_string();
    }
    row.end_time
        .checked_sub(row.start_time)
        .map_or_else(|| NA.to_string(), |d| known_f(d as f64 / 1_000_000.0, 1))
}

/// Render the summary block of one step.
pub fn render_summary(summary: &AggregateRecord) -> String {
    let lines = [
        format!("  {:<20} {}", "Job ID:", summary.job_id),
        format!("  {:<20} {}", "Step ID:", summary.step_id),
        format!("  {:<20} {}", "User:", summary.user),
        format!("  {:<20} {}", "Account:", summary.account),
        format!("  {:<20} {}", "Nodes:", known(summary.num_nodes)),
        format!("  {:<20} {}", "GPUs:", summary.num_gpus),
        format!("  {:<20} {}", "Start:", timestamp(summary.start_time)),
        format!("  {:<20} {}", "End:", timestamp(summary.end_time)),
        format!(
            "  {:<20} {}",
            "Elapsed (s):",
            known_f(summary.elapsed_secs, 1)
        ),
        format!("  {:<20} {}", "Energy (Wh):", known_f(summary.energy_wh, 2)),
        format!("  {:<20} {:>9} {:>9} {:>9}", "", "avg", "min", "max"),
        format!("  {:<20} {}", "Power (W):", power_cells(&summary.power_usage)),
        format!(
            "  {:<20}   {}",
            "SM util (%):",
            stat_cells(&summary.sm_utilization)
        ),
        format!(
            "  {:<20}   {}",
            "Memory util (%):",
            stat_cells(&summary.memory_utilization)
        ),
    ];
    lines.join("\n")
}

/// Render the per-GPU table of one step.
pub fn render_gpu_table(gpus: &[RecordRow]) -> String {
    let mut lines = vec![
        format!(
            "  {:<16} {:>4} {:>9}   {:>7} {:>7} {:>7}   {:>7} {:>7} {:>7}",
            "Host", "GPU", "Elapsed", "SM avg", "SM min", "SM max", "Mem avg", "Mem min", "Mem max"
        ),
        format!("  {}", "-".repeat(94)),
    ];
    for row in gpus {
        lines.push(format!(
            "  {:<16} {:>4} {:>9}   {}   {}",
            row.host,
            row.gpu_id,
            elapsed_secs(row),
            stat_cells(&row.sm_utilization),
            stat_cells(&row.memory_utilization),
        ));
    }
    lines.join("\n")
}

/// Full text report.
pub fn render_text(reports: &[StepReport]) -> String {
    let mut blocks = Vec::new();
    for r in reports {
        let mut block = vec![format!(
            "== {} ({} fragments, {} skipped) ==",
            r.name, r.stats.loaded, r.stats.skipped
        )];
        block.push(render_summary(&r.summary));
        block.push(String::new());
        block.push(render_gpu_table(&r.gpus));
        blocks.push(block.join("\n"));
    }
    blocks.join("\n\n")
}

// ---------------------------------------------------------------------------
// JSON
// ---------------------------------------------------------------------------

/// Triple with sentinels as `null`.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct StatView<T> {
    pub avg: Option<T>,
    pub min: Option<T>,
    pub max: Option<T>,
}

fn opt<T: Measure>(v: T) -> Option<T> {
    (!v.is_sentinel()).then_some(v)
}

impl<T: Measure> From<&Stat<T>> for StatView<T> {
    fn from(s: &Stat<T>) -> Self {
        Self {
            avg: opt(s.avg),
            min: opt(s.min),
            max: opt(s.max),
        }
    }
}

#[derive(Debug, Serialize)]
struct SummaryView<'a> {
    job_id: u32,
    step_id: u32,
    user: &'a str,
    account: &'a str,
    num_nodes: Option<u32>,
    num_gpus: u32,
    start_time: Option<String>,
    end_time: Option<String>,
    elapsed_secs: Option<f64>,
    energy_wh: Option<f64>,
    power_usage: StatView<f64>,
    sm_utilization: StatView<i32>,
    memory_utilization: StatView<i32>,
}

#[derive(Debug, Serialize)]
struct GpuView<'a> {
    host: &'a str,
    gpu_id: u32,
    start_time: Option<String>,
    end_time: Option<String>,
    power_usage: StatView<f64>,
    sm_utilization: StatView<i32>,
    memory_utilization: StatView<i32>,
}

#[derive(Debug, Serialize)]
struct StepView<'a> {
    step: &'a str,
    stats: MergeStats,
    summary: SummaryView<'a>,
    gpus: Vec<GpuView<'a>>,
}

#[derive(Debug, Serialize)]
struct ReportView<'a> {
    schema_version: &'static str,
    steps: Vec<StepView<'a>>,
}

fn rfc3339(micros: i64) -> Option<String> {
    opt(micros)
        .and_then(DateTime::<Utc>::from_timestamp_micros)
        .map(|t| t.to_rfc3339())
}

/// JSON document: `{ schema_version, steps: [{ step, stats, summary, gpus }] }`.
pub fn render_json(reports: &[StepReport]) -> Result<serde_json::Value> {
    let view = ReportView {
        schema_version: SCHEMA_VERSION,
        steps: reports
            .iter()
            .map(|r| {
                let s = &r.summary;
                StepView {
                    step: &r.name,
                    stats: r.stats,
                    summary: SummaryView {
                        job_id: s.job_id,
                        step_id: s.step_id,
                        user: &s.user,
                        account: &s.account,
                        num_nodes: opt(s.num_nodes),
                        num_gpus: s.num_gpus,
                        start_time: rfc3339(s.start_time),
                        end_time: rfc3339(s.end_time),
                        elapsed_secs: opt(s.elapsed_secs),
                        energy_wh: opt(s.energy_wh),
                        power_usage: (&s.power_usage).into(),
                        sm_utilization: (&s.sm_utilization).into(),
                        memory_utilization: (&s.memory_utilization).into(),
                    },
                    gpus: r
                        .gpus
                        .iter()
                        .map(|g| GpuView {
                            host: &g.host,
                            gpu_id: g.gpu_id,
                            start_time: rfc3339(g.start_time),
                            end_time: rfc3339(g.end_time),
                            power_usage: (&g.power_usage).into(),
                            sm_utilization: (&g.sm_utilization).into(),
                            memory_utilization: (&g.memory_utilization).into(),
                        })
                        .collect(),
                }
            })
            .collect(),
    };
    Ok(serde_json::to_value(view)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use jr_math::measure::INT32_BLANK;
    use jr_telemetry::RecordTable;

    fn row(host: &str, gpu_id: u32, power: f64) -> RecordRow {
        RecordRow {
            job_id: 9,
            step_id: 0,
            user: "alice".into(),
            account: "proj".into(),
            num_nodes: 1,
            host: host.into(),
            gpu_id,
            power_usage: Stat::new(power, power, power),
            start_time: 1_700_000_000_000_000,
            end_time: 1_700_000_060_000_000,
            sm_utilization: Stat::new(10, 90, 50),
            memory_utilization: Stat::new(1, 9, 5),
        }
    }

    fn step(rows: Vec<RecordRow>) -> StepMerge {
        let table: RecordTable = rows.into_iter().collect();
        StepMerge {
            name: "step_0".into(),
            stats: MergeStats {
                loaded: 1,
                skipped: 0,
                rows: table.len(),
            },
            table,
        }
    }

    #[test]
    fn test_text_report() {
        let mut blank = row("nid002", 0, f64::NAN);
        blank.sm_utilization = Stat::new(INT32_BLANK, INT32_BLANK, INT32_BLANK);
        let reports = build_reports(&[step(vec![row("nid001", 0, 100.0), blank])]).unwrap();
        let text = render_text(&reports);
        assert!(text.contains("== step_0 (1 fragments, 0 skipped) =="));
        assert!(text.contains("2023-11-14 22:13:20 UTC"));
        assert!(text.lines().any(|l| l.contains("Elapsed (s):") && l.ends_with("60.0")));
        assert!(text.contains("100.00"));
        assert!(text.contains("n/a"));
        assert!(text.contains("nid002"));
    }

    #[test]
    fn test_elapsed_overflow_is_unknown() {
        let mut r = row("nid001", 0, 1.0);
        r.start_time = i64::MIN + 1;
        r.end_time = 0x7fff_ffff_0000_0000;
        assert_eq!(elapsed_secs(&r), NA);
        assert_eq!(elapsed_secs(&row("nid001", 0, 1.0)), "60.0");
    }

    #[test]
    fn test_json_nulls_for_sentinels() {
        let reports =
            build_reports(&[step(vec![row("nid001", 0, f64::NAN)])]).unwrap();
        let json = render_json(&reports).unwrap();
        assert_eq!(json["schema_version"], SCHEMA_VERSION);
        let summary = &json["steps"][0]["summary"];
        assert!(summary["power_usage"]["avg"].is_null());
        assert!(summary["energy_wh"].is_null());
        assert_eq!(summary["sm_utilization"]["max"], 90);
        assert_eq!(json["steps"][0]["gpus"][0]["host"], "nid001");
        assert_eq!(json["steps"][0]["stats"]["loaded"], 1);
    }
}
