//! Arrow view and Parquet export of a record table.
//!
//! Sentinel readings become Arrow nulls so downstream tools see "unknown"
//! instead of NaN or a DCGM blank value.

use crate::schema::TABLE_SCHEMA_VERSION;
use crate::table::RecordTable;
use arrow::array::{
    ArrayRef, Float64Array, Int32Array, StringArray, TimestampMicrosecondArray, UInt32Array,
};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::error::ArrowError;
use arrow::record_batch::RecordBatch;
use jr_math::Measure;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, ZstdLevel};
use parquet::errors::ParquetError;
use parquet::file::properties::WriterProperties;
use parquet::format::KeyValue;
use std::fs::File;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Errors from Arrow conversion and Parquet writing.
#[derive(Debug, Error)]
pub enum ExportError {
    #[error("arrow error: {0}")]
    Arrow(#[from] ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] ParquetError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn timestamp_type() -> DataType {
    DataType::Timestamp(TimeUnit::Microsecond, Some("UTC".into()))
}

/// Arrow schema mirroring the fragment column order.
pub fn arrow_schema() -> Schema {
    let metadata = [(
        "schema_version".to_string(),
        TABLE_SCHEMA_VERSION.to_string(),
    )]
    .into_iter()
    .collect();
    Schema::new(vec![
        Field::new("job_id", DataType::UInt32, false),
        Field::new("step_id", DataType::UInt32, false),
        Field::new("user", DataType::Utf8, false),
        Field::new("account", DataType::Utf8, false),
        Field::new("num_nodes", DataType::UInt32, true),
        Field::new("host", DataType::Utf8, false),
        Field::new("gpu_id", DataType::UInt32, false),
        Field::new("power_usage_min", DataType::Float64, true),
        Field::new("power_usage_max", DataType::Float64, true),
        Field::new("power_usage_avg", DataType::Float64, true),
        Field::new("start_time", timestamp_type(), true),
        Field::new("end_time", timestamp_type(), true),
        Field::new("sm_utilization_min", DataType::Int32, true),
        Field::new("sm_utilization_max", DataType::Int32, true),
        Field::new("sm_utilization_avg", DataType::Int32, true),
        Field::new("memory_utilization_min", DataType::Int32, true),
        Field::new("memory_utilization_max", DataType::Int32, true),
        Field::new("memory_utilization_avg", DataType::Int32, true),
    ])
    .with_metadata(metadata)
}

fn known<T: Measure>(values: &[T]) -> Vec<Option<T>> {
    values
        .iter()
        .map(|&v| (!v.is_sentinel()).then_some(v))
        .collect()
}

fn strings(values: &[String]) -> ArrayRef {
    Arc::new(StringArray::from_iter_values(values.iter()))
}

/// Convert the whole table into a single record batch.
pub fn to_record_batch(table: &RecordTable) -> Result<RecordBatch, ExportError> {
    let schema = Arc::new(arrow_schema());
    let columns: Vec<ArrayRef> = vec![
        Arc::new(UInt32Array::from(table.job_id.as_slice().to_vec())),
        Arc::new(UInt32Array::from(table.step_id.as_slice().to_vec())),
        strings(table.user.as_slice()),
        strings(table.account.as_slice()),
        Arc::new(UInt32Array::from(known(table.num_nodes.as_slice()))),
        strings(table.host.as_slice()),
        Arc::new(UInt32Array::from(table.gpu_id.as_slice().to_vec())),
        Arc::new(Float64Array::from(known(table.power_usage_min.as_slice()))),
        Arc::new(Float64Array::from(known(table.power_usage_max.as_slice()))),
        Arc::new(Float64Array::from(known(table.power_usage_avg.as_slice()))),
        Arc::new(
            TimestampMicrosecondArray::from(known(table.start_time.as_slice()))
                .with_timezone("UTC"),
        ),
        Arc::new(
            TimestampMicrosecondArray::from(known(table.end_time.as_slice()))
                .with_timezone("UTC"),
        ),
        Arc::new(Int32Array::from(known(table.sm_utilization_min.as_slice()))),
        Arc::new(Int32Array::from(known(table.sm_utilization_max.as_slice()))),
        Arc::new(Int32Array::from(known(table.sm_utilization_avg.as_slice()))),
        Arc::new(Int32Array::from(known(
            table.memory_utilization_min.as_slice(),
        ))),
        Arc::new(Int32Array::from(known(
            table.memory_utilization_max.as_slice(),
        ))),
        Arc::new(Int32Array::from(known(
            table.memory_utilization_avg.as_slice(),
        ))),
    ];
    Ok(RecordBatch::try_new(schema, columns)?)
}

fn writer_properties() -> WriterProperties {
    WriterProperties::builder()
        .set_compression(Compression::ZSTD(ZstdLevel::default()))
        .set_key_value_metadata(Some(vec![KeyValue {
            key: "created_by".to_string(),
            value: Some(format!("jobreport {}", env!("CARGO_PKG_VERSION"))),
        }]))
        .build()
}

/// Write the table to a Parquet file at `path`, replacing any existing file.
pub fn write_parquet(table: &RecordTable, path: &Path) -> Result<(), ExportError> {
    let batch = to_record_batch(table)?;
    let file = File::create(path)?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(writer_properties()))?;
    writer.write(&batch)?;
    writer.close()?;
    debug!(path = %path.display(), rows = batch.num_rows(), "wrote parquet export");
    Ok(())
}
