//! The record table.
//!
//! One row per GPU observed by one process. Rows have no identity of their
//! own: row `i` is whatever sits at index `i` of every column, so every
//! operation that moves data moves all eighteen columns together.

use crate::column::{validate_permutation, Column};
use jr_common::{Error, Result};
use jr_math::Stat;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::io::{Read, Write};

/// One GPU observation, as pushed into or read out of a [`RecordTable`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordRow {
    pub job_id: u32,
    pub step_id: u32,
    pub user: String,
    pub account: String,
    pub num_nodes: u32,
    pub host: String,
    pub gpu_id: u32,
    /// Watts.
    pub power_usage: Stat<f64>,
    /// Microseconds since the Unix epoch.
    pub start_time: i64,
    /// Microseconds since the Unix epoch.
    pub end_time: i64,
    /// Percent.
    pub sm_utilization: Stat<i32>,
    /// Percent.
    pub memory_utilization: Stat<i32>,
}

/// Columnar store of GPU observations with a fixed schema.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordTable {
    pub(crate) job_id: Column<u32>,
    pub(crate) step_id: Column<u32>,
    pub(crate) user: Column<String>,
    pub(crate) account: Column<String>,
    pub(crate) num_nodes: Column<u32>,
    pub(crate) host: Column<String>,
    pub(crate) gpu_id: Column<u32>,
    pub(crate) power_usage_min: Column<f64>,
    pub(crate) power_usage_max: Column<f64>,
    pub(crate) power_usage_avg: Column<f64>,
    pub(crate) start_time: Column<i64>,
    pub(crate) end_time: Column<i64>,
    pub(crate) sm_utilization_min: Column<i32>,
    pub(crate) sm_utilization_max: Column<i32>,
    pub(crate) sm_utilization_avg: Column<i32>,
    pub(crate) memory_utilization_min: Column<i32>,
    pub(crate) memory_utilization_max: Column<i32>,
    pub(crate) memory_utilization_avg: Column<i32>,
}

impl RecordTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.gpu_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_row(&mut self, row: RecordRow) {
        self.job_id.push(row.job_id);
        self.step_id.push(row.step_id);
        self.user.push(row.user);
        self.account.push(row.account);
        self.num_nodes.push(row.num_nodes);
        self.host.push(row.host);
        self.gpu_id.push(row.gpu_id);
        self.power_usage_min.push(row.power_usage.min);
        self.power_usage_max.push(row.power_usage.max);
        self.power_usage_avg.push(row.power_usage.avg);
        self.start_time.push(row.start_time);
        self.end_time.push(row.end_time);
        self.sm_utilization_min.push(row.sm_utilization.min);
        self.sm_utilization_max.push(row.sm_utilization.max);
        self.sm_utilization_avg.push(row.sm_utilization.avg);
        self.memory_utilization_min.push(row.memory_utilization.min);
        self.memory_utilization_max.push(row.memory_utilization.max);
        self.memory_utilization_avg.push(row.memory_utilization.avg);
    }

    /// Materialize row `i`.
    pub fn row(&self, i: usize) -> Option<RecordRow> {
        if i >= self.len() {
            return None;
        }
        Some(RecordRow {
            job_id: self.job_id[i],
            step_id: self.step_id[i],
            user: self.user[i].clone(),
            account: self.account[i].clone(),
            num_nodes: self.num_nodes[i],
            host: self.host[i].clone(),
            gpu_id: self.gpu_id[i],
            power_usage: Stat::new(
                self.power_usage_min[i],
                self.power_usage_max[i],
                self.power_usage_avg[i],
            ),
            start_time: self.start_time[i],
            end_time: self.end_time[i],
            sm_utilization: Stat::new(
                self.sm_utilization_min[i],
                self.sm_utilization_max[i],
                self.sm_utilization_avg[i],
            ),
            memory_utilization: Stat::new(
                self.memory_utilization_min[i],
                self.memory_utilization_max[i],
                self.memory_utilization_avg[i],
            ),
        })
    }

    pub fn rows(&self) -> impl Iterator<Item = RecordRow> + '_ {
        (0..self.len()).filter_map(move |i| self.row(i))
    }

    /// Append every row of `other`.
    pub fn extend(&mut self, other: &RecordTable) {
        self.job_id.extend_from(&other.job_id);
        self.step_id.extend_from(&other.step_id);
        self.user.extend_from(&other.user);
        self.account.extend_from(&other.account);
        self.num_nodes.extend_from(&other.num_nodes);
        self.host.extend_from(&other.host);
        self.gpu_id.extend_from(&other.gpu_id);
        self.power_usage_min.extend_from(&other.power_usage_min);
        self.power_usage_max.extend_from(&other.power_usage_max);
        self.power_usage_avg.extend_from(&other.power_usage_avg);
        self.start_time.extend_from(&other.start_time);
        self.end_time.extend_from(&other.end_time);
        self.sm_utilization_min.extend_from(&other.sm_utilization_min);
        self.sm_utilization_max.extend_from(&other.sm_utilization_max);
        self.sm_utilization_avg.extend_from(&other.sm_utilization_avg);
        self.memory_utilization_min
            .extend_from(&other.memory_utilization_min);
        self.memory_utilization_max
            .extend_from(&other.memory_utilization_max);
        self.memory_utilization_avg
            .extend_from(&other.memory_utilization_avg);
    }

    /// Column lengths in canonical order.
    fn column_lengths(&self) -> [usize; 18] {
        [
            self.job_id.len(),
            self.step_id.len(),
            self.user.len(),
            self.account.len(),
            self.num_nodes.len(),
            self.host.len(),
            self.gpu_id.len(),
            self.power_usage_min.len(),
            self.power_usage_max.len(),
            self.power_usage_avg.len(),
            self.start_time.len(),
            self.end_time.len(),
            self.sm_utilization_min.len(),
            self.sm_utilization_max.len(),
            self.sm_utilization_avg.len(),
            self.memory_utilization_min.len(),
            self.memory_utilization_max.len(),
            self.memory_utilization_avg.len(),
        ]
    }

    /// Verify that all columns have the same length.
    pub fn check_consistent(&self) -> Result<()> {
        let lengths = self.column_lengths();
        if lengths.iter().any(|&l| l != lengths[0]) {
            return Err(Error::ColumnMismatch(format!(
                "column lengths differ: {lengths:?}"
            )));
        }
        Ok(())
    }

    /// Reorder every column by the same permutation.
    ///
    /// The permutation is validated once up front, so a bad order leaves the
    /// table untouched.
    pub fn permute(&mut self, order: &[usize]) -> Result<()> {
        validate_permutation(order, self.len())?;
        self.job_id.reorder(order);
        self.step_id.reorder(order);
        self.user.reorder(order);
        self.account.reorder(order);
        self.num_nodes.reorder(order);
        self.host.reorder(order);
        self.gpu_id.reorder(order);
        self.power_usage_min.reorder(order);
        self.power_usage_max.reorder(order);
        self.power_usage_avg.reorder(order);
        self.start_time.reorder(order);
        self.end_time.reorder(order);
        self.sm_utilization_min.reorder(order);
        self.sm_utilization_max.reorder(order);
        self.sm_utilization_avg.reorder(order);
        self.memory_utilization_min.reorder(order);
        self.memory_utilization_max.reorder(order);
        self.memory_utilization_avg.reorder(order);
        Ok(())
    }

    /// Sort rows by host name, then GPU id.
    ///
    /// Rows that agree on both keys are ordered by the remaining columns in
    /// schema order, so the result depends only on the set of rows and never
    /// on the order they were loaded in.
    pub fn sort_by_host_gpu(&mut self) {
        let mut order: Vec<usize> = (0..self.len()).collect();
        order.sort_by(|&a, &b| self.compare_rows(a, b));
        // `order` is a permutation of 0..len by construction.
        self.job_id.reorder(&order);
        self.step_id.reorder(&order);
        self.user.reorder(&order);
        self.account.reorder(&order);
        self.num_nodes.reorder(&order);
        self.host.reorder(&order);
        self.gpu_id.reorder(&order);
        self.power_usage_min.reorder(&order);
        self.power_usage_max.reorder(&order);
        self.power_usage_avg.reorder(&order);
        self.start_time.reorder(&order);
        self.end_time.reorder(&order);
        self.sm_utilization_min.reorder(&order);
        self.sm_utilization_max.reorder(&order);
        self.sm_utilization_avg.reorder(&order);
        self.memory_utilization_min.reorder(&order);
        self.memory_utilization_max.reorder(&order);
        self.memory_utilization_avg.reorder(&order);
    }

    fn compare_rows(&self, a: usize, b: usize) -> Ordering {
        self.host[a]
            .cmp(&self.host[b])
            .then_with(|| self.gpu_id[a].cmp(&self.gpu_id[b]))
            .then_with(|| self.job_id[a].cmp(&self.job_id[b]))
            .then_with(|| self.step_id[a].cmp(&self.step_id[b]))
            .then_with(|| self.user[a].cmp(&self.user[b]))
            .then_with(|| self.account[a].cmp(&self.account[b]))
            .then_with(|| self.num_nodes[a].cmp(&self.num_nodes[b]))
            .then_with(|| self.power_usage_min[a].total_cmp(&self.power_usage_min[b]))
            .then_with(|| self.power_usage_max[a].total_cmp(&self.power_usage_max[b]))
            .then_with(|| self.power_usage_avg[a].total_cmp(&self.power_usage_avg[b]))
            .then_with(|| self.start_time[a].cmp(&self.start_time[b]))
            .then_with(|| self.end_time[a].cmp(&self.end_time[b]))
            .then_with(|| self.sm_utilization_min[a].cmp(&self.sm_utilization_min[b]))
            .then_with(|| self.sm_utilization_max[a].cmp(&self.sm_utilization_max[b]))
            .then_with(|| self.sm_utilization_avg[a].cmp(&self.sm_utilization_avg[b]))
            .then_with(|| self.memory_utilization_min[a].cmp(&self.memory_utilization_min[b]))
            .then_with(|| self.memory_utilization_max[a].cmp(&self.memory_utilization_max[b]))
            .then_with(|| self.memory_utilization_avg[a].cmp(&self.memory_utilization_avg[b]))
    }

    /// Binary-encode row `i`, fields in canonical order.
    pub(crate) fn write_row<W: Write>(&self, sink: &mut W, i: usize) -> Result<()> {
        self.job_id.write(sink, i)?;
        self.step_id.write(sink, i)?;
        self.user.write(sink, i)?;
        self.account.write(sink, i)?;
        self.num_nodes.write(sink, i)?;
        self.host.write(sink, i)?;
        self.gpu_id.write(sink, i)?;
        self.power_usage_min.write(sink, i)?;
        self.power_usage_max.write(sink, i)?;
        self.power_usage_avg.write(sink, i)?;
        self.start_time.write(sink, i)?;
        self.end_time.write(sink, i)?;
        self.sm_utilization_min.write(sink, i)?;
        self.sm_utilization_max.write(sink, i)?;
        self.sm_utilization_avg.write(sink, i)?;
        self.memory_utilization_min.write(sink, i)?;
        self.memory_utilization_max.write(sink, i)?;
        self.memory_utilization_avg.write(sink, i)
    }

    /// Decode one binary row and append it.
    ///
    /// On error the columns may be left with unequal lengths; callers decode
    /// into a scratch table and discard it on failure.
    pub(crate) fn read_row<R: Read>(&mut self, source: &mut R) -> Result<()> {
        self.job_id.read(source)?;
        self.step_id.read(source)?;
        self.user.read(source)?;
        self.account.read(source)?;
        self.num_nodes.read(source)?;
        self.host.read(source)?;
        self.gpu_id.read(source)?;
        self.power_usage_min.read(source)?;
        self.power_usage_max.read(source)?;
        self.power_usage_avg.read(source)?;
        self.start_time.read(source)?;
        self.end_time.read(source)?;
        self.sm_utilization_min.read(source)?;
        self.sm_utilization_max.read(source)?;
        self.sm_utilization_avg.read(source)?;
        self.memory_utilization_min.read(source)?;
        self.memory_utilization_max.read(source)?;
        self.memory_utilization_avg.read(source)
    }
}

impl FromIterator<RecordRow> for RecordTable {
    fn from_iter<I: IntoIterator<Item = RecordRow>>(iter: I) -> Self {
        let mut table = RecordTable::new();
        for row in iter {
            table.push_row(row);
        }
        table
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn sample_row(host: &str, gpu_id: u32, power: f64) -> RecordRow {
        RecordRow {
            job_id: 4242,
            step_id: 0,
            user: "alice".into(),
            account: "csstaff".into(),
            num_nodes: 2,
            host: host.into(),
            gpu_id,
            power_usage: Stat::new(power - 10.0, power + 10.0, power),
            start_time: 1_717_000_000_000_000,
            end_time: 1_717_000_060_000_000,
            sm_utilization: Stat::new(10, 90, 50),
            memory_utilization: Stat::new(5, 40, 20),
        }
    }

    #[test]
    fn test_push_and_read_row() {
        let mut t = RecordTable::new();
        let row = sample_row("nid001", 3, 200.0);
        t.push_row(row.clone());
        assert_eq!(t.len(), 1);
        assert_eq!(t.row(0), Some(row));
        assert_eq!(t.row(1), None);
        t.check_consistent().unwrap();
    }

    #[test]
    fn test_sort_by_host_then_gpu() {
        let mut t: RecordTable = [
            sample_row("nid002", 1, 100.0),
            sample_row("nid001", 3, 110.0),
            sample_row("nid002", 0, 120.0),
            sample_row("nid001", 0, 130.0),
        ]
        .into_iter()
        .collect();
        t.sort_by_host_gpu();
        let keys: Vec<(String, u32)> = t.rows().map(|r| (r.host, r.gpu_id)).collect();
        assert_eq!(
            keys,
            vec![
                ("nid001".to_string(), 0),
                ("nid001".to_string(), 3),
                ("nid002".to_string(), 0),
                ("nid002".to_string(), 1),
            ]
        );
        // Columns moved together.
        assert_eq!(t.row(0).unwrap().power_usage.avg, 130.0);
        assert_eq!(t.row(3).unwrap().power_usage.avg, 100.0);
    }

    #[test]
    fn test_sort_tie_break_is_content_based() {
        let a = sample_row("nid001", 0, 100.0);
        let b = sample_row("nid001", 0, 300.0);
        let mut t1: RecordTable = [a.clone(), b.clone()].into_iter().collect();
        let mut t2: RecordTable = [b, a].into_iter().collect();
        t1.sort_by_host_gpu();
        t2.sort_by_host_gpu();
        assert_eq!(t1, t2);
    }

    #[test]
    fn test_permute_identity_and_inverse() {
        let original: RecordTable = (0..5)
            .map(|i| sample_row(&format!("nid{i:03}"), i, 100.0 + i as f64))
            .collect();
        let mut t = original.clone();
        t.permute(&[0, 1, 2, 3, 4]).unwrap();
        assert_eq!(t, original);

        let order = [4usize, 2, 0, 1, 3];
        let mut inverse = [0usize; 5];
        for (i, &o) in order.iter().enumerate() {
            inverse[o] = i;
        }
        t.permute(&order).unwrap();
        assert_eq!(t.row(0).unwrap().gpu_id, 4);
        t.permute(&inverse).unwrap();
        assert_eq!(t, original);
    }

    #[test]
    fn test_bad_permutation_leaves_table_untouched() {
        let original: RecordTable = [sample_row("a", 0, 1.0), sample_row("b", 1, 2.0)]
            .into_iter()
            .collect();
        let mut t = original.clone();
        assert!(t.permute(&[1, 2]).is_err());
        assert_eq!(t, original);
    }

    #[test]
    fn test_extend() {
        let mut a: RecordTable = [sample_row("a", 0, 1.0)].into_iter().collect();
        let b: RecordTable = [sample_row("b", 0, 2.0), sample_row("c", 0, 3.0)]
            .into_iter()
            .collect();
        a.extend(&b);
        assert_eq!(a.len(), 3);
        assert_eq!(a.row(2).unwrap().host, "c");
        a.check_consistent().unwrap();
    }
}
