//! Error types for jobreport.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for jobreport operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Unified error type for jobreport.
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors (10-19)
    #[error("configuration error: {0}")]
    Config(String),

    #[error("invalid time specification: {0}")]
    InvalidTimeSpec(String),

    // Topology and collection errors (20-29)
    #[error("unable to resolve job topology: {0}")]
    Topology(String),

    #[error("telemetry source error: {0}")]
    Telemetry(String),

    #[error("workload could not be started: {0}")]
    Workload(String),

    // Output layout errors (30-39)
    #[error("output path already exists: {}", path.display())]
    OutputCollision { path: PathBuf },

    #[error("output path exists and is not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("failed to lock {}: {source}", path.display())]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // Record store errors (40-49)
    #[error("decode error: {0}")]
    Decode(String),

    #[error("encode error: {0}")]
    Encode(String),

    #[error("invalid permutation: {0}")]
    InvalidPermutation(String),

    #[error("column length mismatch: {0}")]
    ColumnMismatch(String),

    #[error("cannot aggregate an empty table")]
    EmptyTable,

    // Merge errors (50-59)
    #[error("no readable telemetry found in {}", path.display())]
    NoData { path: PathBuf },

    // I/O errors (60-69)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Returns the error code for this error type.
    /// Used for detailed error reporting in JSON output.
    pub fn code(&self) -> u32 {
        match self {
            Error::Config(_) => 10,
            Error::InvalidTimeSpec(_) => 11,
            Error::Topology(_) => 20,
            Error::Telemetry(_) => 21,
            Error::Workload(_) => 22,
            Error::OutputCollision { .. } => 30,
            Error::NotADirectory { .. } => 31,
            Error::Lock { .. } => 32,
            Error::Decode(_) => 40,
            Error::Encode(_) => 41,
            Error::InvalidPermutation(_) => 42,
            Error::ColumnMismatch(_) => 43,
            Error::EmptyTable => 44,
            Error::NoData { .. } => 50,
            Error::Io(_) => 60,
            Error::Json(_) => 61,
        }
    }
}
