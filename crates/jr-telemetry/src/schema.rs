//! Record table schema.
//!
//! The column order below is the on-disk contract: it is the CSV header
//! order and the per-row field order of the binary layout. Changing it means
//! bumping [`TABLE_SCHEMA_VERSION`].

/// Schema version for fragment files.
pub const TABLE_SCHEMA_VERSION: &str = "1.0.0";

/// Column names in canonical order.
pub const COLUMN_NAMES: [&str; 18] = [
    "job_id",
    "step_id",
    "user",
    "account",
    "num_nodes",
    "host",
    "gpu_id",
    "power_usage_min",
    "power_usage_max",
    "power_usage_avg",
    "start_time",
    "end_time",
    "sm_utilization_min",
    "sm_utilization_max",
    "sm_utilization_avg",
    "memory_utilization_min",
    "memory_utilization_max",
    "memory_utilization_avg",
];

/// Header line of CSV fragments (without the trailing newline).
pub const CSV_HEADER: &str = "job_id,step_id,user,account,num_nodes,host,gpu_id,\
power_usage_min,power_usage_max,power_usage_avg,start_time,end_time,\
sm_utilization_min,sm_utilization_max,sm_utilization_avg,\
memory_utilization_min,memory_utilization_max,memory_utilization_avg";
