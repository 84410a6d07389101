//! Jobreport telemetry storage.
//!
//! This crate provides:
//! - Typed columns with sentinel-aware aggregation
//! - The fixed-schema record table (one row per observed GPU)
//! - CSV and binary fragment codecs
//! - Reduction of a table to a single aggregate record
//! - Arrow schema and Parquet export of merged tables

pub mod arrow_export;
pub mod codec;
pub mod column;
pub mod record;
pub mod schema;
pub mod table;

pub use arrow_export::{arrow_schema, to_record_batch, write_parquet, ExportError};
pub use codec::StorageFormat;
pub use column::{Column, Element};
pub use record::AggregateRecord;
pub use schema::{COLUMN_NAMES, CSV_HEADER, TABLE_SCHEMA_VERSION};
pub use table::{RecordRow, RecordTable};
