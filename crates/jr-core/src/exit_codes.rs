//! Exit codes for the jobreport CLI.
//!
//! `jobreport run` exits with the workload's own status so it can wrap a
//! command transparently. The codes below are used when jobreport itself
//! fails, and by the other subcommands.

use jr_common::Error;

/// Exit codes for jobreport operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ExitCode {
    /// Success
    Clean = 0,

    /// Configuration or time-spec error
    ConfigError = 10,

    /// Slurm topology could not be resolved
    TopologyError = 11,

    /// Telemetry source failed
    TelemetryError = 12,

    /// Output tree collision or layout error
    OutputError = 13,

    /// Nothing could be merged
    NoData = 14,

    /// Corrupt input or encoding failure
    DataError = 15,

    /// I/O error
    IoError = 16,

    /// Workload could not be started
    WorkloadError = 17,

    /// Internal/unknown error
    InternalError = 99,
}

impl ExitCode {
    /// Convert to i32 for process exit.
    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Check if this exit code indicates success.
    pub fn is_success(self) -> bool {
        matches!(self, ExitCode::Clean)
    }

    /// Map a library error to the exit code the CLI reports.
    pub fn from_error(err: &Error) -> Self {
        match err {
            Error::Config(_) | Error::InvalidTimeSpec(_) => ExitCode::ConfigError,
            Error::Topology(_) => ExitCode::TopologyError,
            Error::Telemetry(_) => ExitCode::TelemetryError,
            Error::Workload(_) => ExitCode::WorkloadError,
            Error::OutputCollision { .. } | Error::NotADirectory { .. } | Error::Lock { .. } => {
                ExitCode::OutputError
            }
            Error::NoData { .. } | Error::EmptyTable => ExitCode::NoData,
            Error::Decode(_)
            | Error::Encode(_)
            | Error::InvalidPermutation(_)
            | Error::ColumnMismatch(_) => ExitCode::DataError,
            Error::Io(_) => ExitCode::IoError,
            Error::Json(_) => ExitCode::InternalError,
        }
    }
}

impl From<ExitCode> for i32 {
    fn from(code: ExitCode) -> Self {
        code as i32
    }
}
