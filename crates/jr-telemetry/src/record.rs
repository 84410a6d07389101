//! Per-step summary of a record table.

use crate::table::RecordTable;
use jr_common::{Error, Result};
use jr_math::{measure, Measure, Stat};
use serde::Serialize;

const MICROS_PER_SEC: f64 = 1_000_000.0;
const SECS_PER_HOUR: f64 = 3600.0;

/// Snapshot produced by reducing a non-empty [`RecordTable`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateRecord {
    pub job_id: u32,
    pub step_id: u32,
    pub user: String,
    pub account: String,
    pub num_nodes: u32,
    pub num_gpus: u32,
    /// Mean start time over all rows, microseconds since the epoch.
    pub start_time: i64,
    /// Mean end time over all rows, microseconds since the epoch.
    pub end_time: i64,
    pub elapsed_secs: f64,
    /// NaN when no GPU reported power.
    pub energy_wh: f64,
    pub power_usage: Stat<f64>,
    pub sm_utilization: Stat<i32>,
    pub memory_utilization: Stat<i32>,
}

impl AggregateRecord {
    /// Whether the elapsed time could be computed.
    pub fn has_timing(&self) -> bool {
        !(self.start_time.is_sentinel() || self.end_time.is_sentinel())
    }
}

impl RecordTable {
    /// Reduce the table to a single summary.
    ///
    /// Identity fields are taken from the first row. Averages come from the
    /// per-GPU average columns, minima from the minimum columns and maxima
    /// from the maximum columns.
    pub fn average(&self) -> Result<AggregateRecord> {
        let first = self.row(0).ok_or(Error::EmptyTable)?;

        let start_time = self.start_time.average();
        let end_time = self.end_time.average();
        let elapsed_secs = if start_time.is_sentinel() || end_time.is_sentinel() {
            f64::NAN
        } else {
            end_time
                .checked_sub(start_time)
                .map_or(f64::NAN, |d| d as f64 / MICROS_PER_SEC)
        };
        let total_power = self.power_usage_avg.sum();
        // NaN propagates when either factor is unknown.
        let energy_wh = total_power * elapsed_secs / SECS_PER_HOUR;

        Ok(AggregateRecord {
            job_id: first.job_id,
            step_id: first.step_id,
            user: first.user,
            account: first.account,
            num_nodes: first.num_nodes,
            num_gpus: u32::try_from(self.len()).unwrap_or(u32::MAX),
            start_time,
            end_time,
            elapsed_secs,
            energy_wh,
            power_usage: reduce(
                self.power_usage_min.as_slice(),
                self.power_usage_max.as_slice(),
                self.power_usage_avg.as_slice(),
            ),
            sm_utilization: reduce(
                self.sm_utilization_min.as_slice(),
                self.sm_utilization_max.as_slice(),
                self.sm_utilization_avg.as_slice(),
            ),
            memory_utilization: reduce(
                self.memory_utilization_min.as_slice(),
                self.memory_utilization_max.as_slice(),
                self.memory_utilization_avg.as_slice(),
            ),
        })
    }
}

fn reduce<T: Measure>(mins: &[T], maxs: &[T], avgs: &[T]) -> Stat<T> {
    Stat::new(
        measure::min(mins).unwrap_or(T::SENTINEL),
        measure::max(maxs).unwrap_or(T::SENTINEL),
        measure::mean(avgs),
    )
}
