//! Jobreport common types, IDs, and errors.
//!
//! This crate provides foundational types shared across the jobreport crates:
//! - Job, step and process identifiers
//! - The immutable per-process job topology
//! - The unified error type
//! - Report output format selection

pub mod error;
pub mod id;
pub mod output;
pub mod schema;
pub mod topology;

pub use error::{Error, Result};
pub use id::{JobId, ProcId, StepId};
pub use output::OutputFormat;
pub use schema::SCHEMA_VERSION;
pub use topology::JobTopology;
