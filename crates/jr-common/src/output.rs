//! Output format selection for rendered reports.

use clap::ValueEnum;
use serde::{Deserialize, Serialize};
use std::fmt;

/// How `jobreport export` renders a merged report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OutputFormat {
    /// Aligned plain-text summary and per-GPU table for terminals.
    #[default]
    Text,
    /// Machine-readable JSON document.
    Json,
    /// The merged per-GPU rows in the on-disk CSV layout.
    Csv,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text => write!(f, "text"),
            Self::Json => write!(f, "json"),
            Self::Csv => write!(f, "csv"),
        }
    }
}
