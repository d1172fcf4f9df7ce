//! Parquet adapter

use std::fs::File;
use std::path::Path;

use arrow::array::{Array, ArrayRef, AsArray};
use arrow::datatypes::{
    DataType, Float32Type, Float64Type, Int16Type, Int32Type, Int64Type, Int8Type, UInt16Type,
    UInt32Type, UInt64Type, UInt8Type,
};
use arrow::record_batch::RecordBatch;
use arrow::util::display::array_value_to_string;
use parquet::arrow::arrow_reader::{ParquetRecordBatchReader, ParquetRecordBatchReaderBuilder};
use serde_json::Value;

use super::{Adapter, DataChunk, FileValidation, RawDocument, SchemaSummary, Sheet, TableSummary};
use crate::error::{EngineError, EngineResult};
use crate::models::{DataFrame, FileFormat};

/// Parquet files, read through Arrow record batches
#[derive(Debug, Default)]
pub struct ParquetAdapter;

impl ParquetAdapter {
    pub fn new() -> Self {
        Self
    }

    fn builder(path: &Path) -> EngineResult<ParquetRecordBatchReaderBuilder<File>> {
        let file = File::open(path)?;
        ParquetRecordBatchReaderBuilder::try_new(file)
            .map_err(|e| EngineError::adapter(path, e.to_string()))
    }
}

fn float(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

/// JSON value of one cell of an Arrow array
pub fn array_value(array: &ArrayRef, row: usize) -> Value {
    if array.is_null(row) {
        return Value::Null;
    }
    match array.data_type() {
        DataType::Null => Value::Null,
        DataType::Boolean => Value::Bool(array.as_boolean().value(row)),
        DataType::Int8 => Value::from(array.as_primitive::<Int8Type>().value(row)),
        DataType::Int16 => Value::from(array.as_primitive::<Int16Type>().value(row)),
        DataType::Int32 => Value::from(array.as_primitive::<Int32Type>().value(row)),
        DataType::Int64 => Value::from(array.as_primitive::<Int64Type>().value(row)),
        DataType::UInt8 => Value::from(array.as_primitive::<UInt8Type>().value(row)),
        DataType::UInt16 => Value::from(array.as_primitive::<UInt16Type>().value(row)),
        DataType::UInt32 => Value::from(array.as_primitive::<UInt32Type>().value(row)),
        DataType::UInt64 => Value::from(array.as_primitive::<UInt64Type>().value(row)),
        DataType::Float32 => float(array.as_primitive::<Float32Type>().value(row) as f64),
        DataType::Float64 => float(array.as_primitive::<Float64Type>().value(row)),
        DataType::Utf8 => Value::String(array.as_string::<i32>().value(row).to_string()),
        DataType::LargeUtf8 => Value::String(array.as_string::<i64>().value(row).to_string()),
        _ => array_value_to_string(array.as_ref(), row)
            .map(Value::String)
            .unwrap_or(Value::Null),
    }
}

/// Rows of a record batch
pub fn batch_rows(batch: &RecordBatch) -> Vec<Vec<Value>> {
    (0..batch.num_rows())
        .map(|row| {
            batch
                .columns()
                .iter()
                .map(|column| array_value(column, row))
                .collect()
        })
        .collect()
}

/// Read a whole parquet file into a frame
pub fn read_parquet(path: &Path) -> EngineResult<DataFrame> {
    let builder = ParquetAdapter::builder(path)?;
    let columns: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().clone())
        .collect();
    let reader = builder
        .build()
        .map_err(|e| EngineError::adapter(path, e.to_string()))?;
    let mut rows = Vec::new();
    for batch in reader {
        let batch = batch.map_err(|e| EngineError::adapter(path, e.to_string()))?;
        rows.extend(batch_rows(&batch));
    }
    Ok(DataFrame::new(columns, rows))
}

impl Adapter for ParquetAdapter {
    fn format(&self) -> FileFormat {
        FileFormat::Parquet
    }

    fn probe_schema(&self, path: &Path, _probe_bytes: usize) -> EngineResult<SchemaSummary> {
        // Only the footer metadata is read
        let builder = Self::builder(path)?;
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let row_count = builder.metadata().file_metadata().num_rows().max(0) as usize;
        Ok(SchemaSummary {
            path: path.to_path_buf(),
            format: FileFormat::Parquet,
            tables: vec![TableSummary {
                name: path
                    .file_stem()
                    .map(|s| s.to_string_lossy().to_string())
                    .unwrap_or_else(|| "data".to_string()),
                columns,
                sampled_rows: 0,
            }],
            row_count: Some(row_count),
            truncated: false,
        })
    }

    fn validate_file(&self, path: &Path) -> EngineResult<FileValidation> {
        let mut validation = FileValidation::ok(path);
        if let Err(e) = Self::builder(path) {
            validation.issue(e.to_string());
        }
        Ok(validation)
    }

    fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame> {
        read_parquet(path)
    }

    fn read_document(&self, path: &Path) -> EngineResult<RawDocument> {
        let frame = read_parquet(path)?;
        let mut rows = Vec::with_capacity(frame.len() + 1);
        rows.push(frame.columns.iter().cloned().map(Value::String).collect());
        rows.extend(frame.rows);
        let sheet = Sheet {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| "data".to_string()),
            rows,
        };
        Ok(RawDocument::tabular(path, FileFormat::Parquet, vec![sheet], None))
    }

    fn supports_streaming(&self, _path: &Path) -> bool {
        true
    }

    fn stream_dataframe(
        &self,
        path: &Path,
        chunk_rows: usize,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<DataChunk>> + Send>> {
        let builder = Self::builder(path)?.with_batch_size(chunk_rows.max(1));
        let columns = builder
            .schema()
            .fields()
            .iter()
            .map(|f| f.name().clone())
            .collect();
        let reader = builder
            .build()
            .map_err(|e| EngineError::adapter(path, e.to_string()))?;
        Ok(Box::new(ParquetChunks {
            reader,
            columns,
            index: 0,
            path: path.display().to_string(),
        }))
    }
}

/// Lazy chunk iterator over parquet record batches
struct ParquetChunks {
    reader: ParquetRecordBatchReader,
    columns: Vec<String>,
    index: usize,
    path: String,
}

impl Iterator for ParquetChunks {
    type Item = EngineResult<DataChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = self.reader.next()?;
        let chunk = batch
            .map(|batch| DataChunk {
                index: self.index,
                frame: DataFrame::new(self.columns.clone(), batch_rows(&batch)),
            })
            .map_err(|e| EngineError::adapter(&self.path, e.to_string()));
        self.index += 1;
        Some(chunk)
    }
}
