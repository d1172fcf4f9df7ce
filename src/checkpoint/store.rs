//! Artifact store
//!
//! Layout under the artifact root:
//!
//! ```text
//! runs/<run_id>/checkpoint.json
//! runs/<run_id>/<stage_type>/<stage_id>/payload.json
//! runs/<run_id>/<stage_type>/<stage_id>/<table>.parquet
//! runs/<run_id>/<stage_type>/<stage_id>/<table>.meta.json
//! schemas/<profile_id>/<table>.json
//! ```
//!
//! Table data and sidecar are written as `.partial` files and renamed into
//! place; the caller then lists the table in the checkpoint. Existing final
//! files are never rewritten.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use arrow::array::{ArrayRef, BooleanBuilder, Float64Builder, Int64Builder, StringBuilder};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use chrono::{DateTime, SubsecRound, Utc};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{CancellationToken, CommittedTable, PARTIAL_SUFFIX, write_atomic};
use crate::adapters::Adapter;
use crate::adapters::CsvAdapter;
use crate::adapters::parquet::read_parquet;
use crate::error::{EngineError, EngineResult};
use crate::identity::relative_path;
use crate::models::{
    ColumnSchema, ColumnType, ExtractedTable, OutputFormat, StageId, StageType, TableMetadata,
    ValidationWarning, is_artifact_name,
};

/// Sidecar written next to every table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSidecar {
    pub stage_id: StageId,
    pub table: String,
    /// ISO-8601 UTC, second precision
    pub created_at: DateTime<Utc>,
    pub row_count: usize,
    pub column_schema: Vec<ColumnSchema>,
    pub validation_warnings: Vec<ValidationWarning>,
    #[serde(default)]
    pub metadata: TableMetadata,
    pub format: OutputFormat,
}

/// Locked schema of a table, recorded when a parse stage is locked
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedSchema {
    pub profile_id: String,
    pub table: String,
    pub stage_id: StageId,
    pub locked_at: DateTime<Utc>,
    pub columns: Vec<ColumnSchema>,
}

fn arrow_type(dtype: ColumnType) -> DataType {
    match dtype {
        ColumnType::Boolean => DataType::Boolean,
        ColumnType::Integer => DataType::Int64,
        ColumnType::Float => DataType::Float64,
        ColumnType::Null | ColumnType::String => DataType::Utf8,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Build one Arrow column from a table column
fn arrow_column(table: &ExtractedTable, idx: usize) -> ArrayRef {
    let cells = table.rows.iter().map(|row| row.get(idx).unwrap_or(&Value::Null));
    match table.columns[idx].dtype {
        ColumnType::Boolean => {
            let mut builder = BooleanBuilder::new();
            cells.for_each(|v| builder.append_option(v.as_bool()));
            Arc::new(builder.finish())
        }
        ColumnType::Integer => {
            let mut builder = Int64Builder::new();
            cells.for_each(|v| builder.append_option(v.as_i64()));
            Arc::new(builder.finish())
        }
        ColumnType::Float => {
            let mut builder = Float64Builder::new();
            cells.for_each(|v| builder.append_option(v.as_f64()));
            Arc::new(builder.finish())
        }
        ColumnType::Null | ColumnType::String => {
            let mut builder = StringBuilder::new();
            cells.for_each(|v| builder.append_option(text(v)));
            Arc::new(builder.finish())
        }
    }
}

/// Convert a table into a record batch typed by its column schema
pub fn to_record_batch(table: &ExtractedTable) -> EngineResult<RecordBatch> {
    let schema = Arc::new(Schema::new(
        table
            .columns
            .iter()
            .map(|c| Field::new(&c.name, arrow_type(c.dtype), true))
            .collect::<Vec<_>>(),
    ));
    let columns = (0..table.columns.len())
        .map(|idx| arrow_column(table, idx))
        .collect();
    let options = RecordBatchOptions::new().with_row_count(Some(table.row_count()));
    RecordBatch::try_new_with_options(schema, columns, &options)
        .map_err(|e| EngineError::Storage(format!("table '{}': {e}", table.name)))
}

fn write_parquet(path: &Path, table: &ExtractedTable) -> EngineResult<()> {
    let batch = to_record_batch(table)?;
    let file = File::create(path)?;
    let props = WriterProperties::builder()
        .set_compression(Compression::SNAPPY)
        .build();
    let storage = |e: parquet::errors::ParquetError| {
        EngineError::Storage(format!("writing {}: {e}", path.display()))
    };
    let mut writer = ArrowWriter::try_new(file, batch.schema(), Some(props)).map_err(storage)?;
    writer.write(&batch).map_err(storage)?;
    writer.close().map_err(storage)?;
    Ok(())
}

fn write_csv(path: &Path, table: &ExtractedTable) -> EngineResult<()> {
    let storage =
        |e: ::csv::Error| EngineError::Storage(format!("writing {}: {e}", path.display()));
    let mut writer = ::csv::Writer::from_path(path).map_err(storage)?;
    writer.write_record(table.column_names()).map_err(storage)?;
    for row in &table.rows {
        writer
            .write_record(row.iter().map(|v| text(v).unwrap_or_default()))
            .map_err(storage)?;
    }
    writer.flush()?;
    Ok(())
}

fn partial(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(PARTIAL_SUFFIX);
    PathBuf::from(name)
}

/// Append-only artifact storage rooted at one directory
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    pub fn stage_dir(&self, run_id: &str, stage_type: StageType, stage_id: &StageId) -> PathBuf {
        self.run_dir(run_id)
            .join(stage_type.name())
            .join(stage_id.as_str())
    }

    /// Path relative to the root, as recorded in checkpoints
    pub fn relative(&self, path: &Path) -> String {
        relative_path(path, &self.root)
    }

    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Write `payload.json` for a stage; an existing payload is kept
    pub fn write_payload(&self, stage_dir: &Path, payload: &Value) -> EngineResult<String> {
        let path = stage_dir.join("payload.json");
        if !path.exists() {
            write_atomic(&path, &serde_json::to_vec_pretty(payload)?)?;
        }
        Ok(self.relative(&path))
    }

    pub fn read_payload(&self, relative: &str) -> EngineResult<Value> {
        let json = std::fs::read_to_string(self.resolve(relative))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Write a table and its sidecar atomically
    ///
    /// The returned entry still has to be listed in the checkpoint before
    /// readers can see the table. A hard cancellation observed between write
    /// and rename leaves only `.partial` files behind.
    pub fn write_table(
        &self,
        stage_dir: &Path,
        stage_id: &StageId,
        table: &ExtractedTable,
        format: OutputFormat,
        token: Option<&CancellationToken>,
    ) -> EngineResult<CommittedTable> {
        if !is_artifact_name(&table.name) {
            return Err(EngineError::Storage(format!(
                "'{}' cannot be used as a table file name",
                table.name
            )));
        }
        std::fs::create_dir_all(stage_dir)?;
        let data = stage_dir.join(format!("{}.{}", table.name, format.extension()));
        let sidecar = stage_dir.join(format!("{}.meta.json", table.name));
        let mut entry = CommittedTable {
            table: table.name.clone(),
            data: self.relative(&data),
            sidecar: self.relative(&sidecar),
            row_count: table.row_count(),
        };
        if data.exists() && sidecar.exists() {
            // The entry describes the stored files, not the incoming table
            entry.row_count = self.read_sidecar(&entry)?.row_count;
            debug!(
                table = %table.name,
                rows = entry.row_count,
                "Table already stored, keeping existing files"
            );
            return Ok(entry);
        }

        let data_partial = partial(&data);
        match format {
            OutputFormat::Parquet => write_parquet(&data_partial, table)?,
            OutputFormat::Csv => write_csv(&data_partial, table)?,
        }
        let meta = TableSidecar {
            stage_id: stage_id.clone(),
            table: table.name.clone(),
            created_at: Utc::now().trunc_subsecs(0),
            row_count: table.row_count(),
            column_schema: table.columns.clone(),
            validation_warnings: table.validation_warnings.clone(),
            metadata: table.metadata.clone(),
            format,
        };
        let sidecar_partial = partial(&sidecar);
        std::fs::write(&sidecar_partial, serde_json::to_vec_pretty(&meta)?)?;

        if let Some(token) = token.filter(|t| t.is_hard()) {
            return Err(EngineError::Cancelled {
                stage: token.in_flight().unwrap_or_default(),
                completed_units: token.completed_units(),
            });
        }
        std::fs::rename(&data_partial, &data)?;
        std::fs::rename(&sidecar_partial, &sidecar)?;
        debug!(table = %table.name, rows = table.row_count(), path = %entry.data, "Stored table");
        Ok(entry)
    }

    pub fn read_sidecar(&self, entry: &CommittedTable) -> EngineResult<TableSidecar> {
        let json = std::fs::read_to_string(self.resolve(&entry.sidecar))?;
        Ok(serde_json::from_str(&json)?)
    }

    /// Read a committed table back with its schema and warnings
    pub fn read_table(&self, entry: &CommittedTable) -> EngineResult<ExtractedTable> {
        let sidecar = self.read_sidecar(entry)?;
        let path = self.resolve(&entry.data);
        let frame = match sidecar.format {
            OutputFormat::Parquet => read_parquet(&path)?,
            OutputFormat::Csv => CsvAdapter::new().read_dataframe(&path)?,
        };
        let mut table = frame.into_table(&sidecar.table);
        if table.column_names()
            == sidecar
                .column_schema
                .iter()
                .map(|c| c.name.clone())
                .collect::<Vec<_>>()
        {
            table.columns = sidecar.column_schema;
        }
        table.metadata = sidecar.metadata;
        table.metadata.row_count = table.rows.len();
        table.validation_warnings = sidecar.validation_warnings;
        Ok(table)
    }

    pub fn schema_path(&self, profile_id: &str, table: &str) -> PathBuf {
        self.root
            .join("schemas")
            .join(profile_id)
            .join(format!("{table}.json"))
    }

    /// Record the schema of a table at lock time, replacing any earlier one
    pub fn record_schema(
        &self,
        profile_id: &str,
        table: &str,
        stage_id: &StageId,
        columns: &[ColumnSchema],
    ) -> EngineResult<()> {
        let locked = LockedSchema {
            profile_id: profile_id.to_string(),
            table: table.to_string(),
            stage_id: stage_id.clone(),
            locked_at: Utc::now().trunc_subsecs(0),
            columns: columns.to_vec(),
        };
        write_atomic(
            &self.schema_path(profile_id, table),
            &serde_json::to_vec_pretty(&locked)?,
        )
    }

    /// Last locked schema of a table, if any
    pub fn locked_schema(
        &self,
        profile_id: &str,
        table: &str,
    ) -> EngineResult<Option<LockedSchema>> {
        let path = self.schema_path(profile_id, table);
        if !path.exists() {
            return Ok(None);
        }
        let json = std::fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn table() -> ExtractedTable {
        let mut table = ExtractedTable::new(
            "scans",
            vec![
                "id".into(),
                "score".into(),
                "ok".into(),
                "label".into(),
                "empty".into(),
            ],
            vec![
                vec![json!(1), json!(0.5), json!(true), json!("a"), Value::Null],
                vec![json!(2), Value::Null, json!(false), json!("b"), Value::Null],
            ],
        );
        table.metadata.source_files = vec!["in/a.json".into()];
        table.validation_warnings.push(ValidationWarning {
            table: "scans".into(),
            column: Some("score".into()),
            row: Some(1),
            rule: "not_null".into(),
            message: "value is null".into(),
        });
        table
    }

    #[test]
    fn test_parquet_roundtrip_with_sidecar() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_id = StageId::from("a1b2c3d4");
        let stage_dir = store.stage_dir("r1", StageType::Parse, &stage_id);

        let entry = store
            .write_table(&stage_dir, &stage_id, &table(), OutputFormat::Parquet, None)
            .unwrap();
        assert_eq!(entry.data, "runs/r1/parse/a1b2c3d4/scans.parquet");
        assert!(!stage_dir.join("scans.parquet.partial").exists());

        let back = store.read_table(&entry).unwrap();
        assert_eq!(back.rows, table().rows);
        assert_eq!(back.columns, table().columns);
        assert_eq!(back.validation_warnings.len(), 1);
        assert_eq!(back.metadata.source_files, vec!["in/a.json"]);

        let sidecar = store.read_sidecar(&entry).unwrap();
        assert_eq!(sidecar.row_count, 2);
        assert_eq!(sidecar.created_at.timestamp_subsec_nanos(), 0);
    }

    #[test]
    fn test_csv_output() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_id = StageId::from("00000001");
        let stage_dir = store.stage_dir("r1", StageType::Export, &stage_id);
        let entry = store
            .write_table(&stage_dir, &stage_id, &table(), OutputFormat::Csv, None)
            .unwrap();
        let text = std::fs::read_to_string(store.resolve(&entry.data)).unwrap();
        assert!(text.starts_with("id,score,ok,label,empty\n1,0.5,true,a,\n"));
        assert_eq!(store.read_table(&entry).unwrap().row_count(), 2);
    }

    #[test]
    fn test_second_write_is_noop() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_id = StageId::from("a1b2c3d4");
        let stage_dir = store.stage_dir("r1", StageType::Parse, &stage_id);
        store
            .write_table(&stage_dir, &stage_id, &table(), OutputFormat::Parquet, None)
            .unwrap();
        let first = std::fs::metadata(stage_dir.join("scans.meta.json"))
            .unwrap()
            .modified()
            .unwrap();

        let mut other = table();
        other.rows.truncate(1);
        let entry = store
            .write_table(&stage_dir, &stage_id, &other, OutputFormat::Parquet, None)
            .unwrap();
        let second = std::fs::metadata(stage_dir.join("scans.meta.json"))
            .unwrap()
            .modified()
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(entry.row_count, 2);
        assert_eq!(store.read_table(&entry).unwrap().row_count(), 2);
    }

    #[test]
    fn test_table_names_stay_inside_stage_dir() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path().join("artifacts"));
        let stage_id = StageId::from("a1b2c3d4");
        let stage_dir = store.stage_dir("r1", StageType::Parse, &stage_id);
        let mut escaping = table();
        escaping.name = "../../../escaped".into();

        let err = store
            .write_table(&stage_dir, &stage_id, &escaping, OutputFormat::Parquet, None)
            .unwrap_err();
        assert!(matches!(err, EngineError::Storage(_)));
        assert!(!dir.path().join("artifacts/runs/escaped.parquet").exists());
        assert!(!dir.path().join("artifacts/runs/escaped.meta.json").exists());
    }

    #[test]
    fn test_soft_cancel_still_commits_in_flight_table() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_id = StageId::from("a1b2c3d4");
        let stage_dir = store.stage_dir("r1", StageType::Parse, &stage_id);
        let token = CancellationToken::new();
        token.begin("parse");
        token.cancel(true);

        let entry = store
            .write_table(&stage_dir, &stage_id, &table(), OutputFormat::Parquet, Some(&token))
            .unwrap();
        assert!(stage_dir.join("scans.parquet").exists());
        assert!(!stage_dir.join("scans.parquet.partial").exists());
        assert_eq!(entry.row_count, 2);
    }

    #[test]
    fn test_hard_cancel_leaves_only_partials() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_id = StageId::from("a1b2c3d4");
        let stage_dir = store.stage_dir("r1", StageType::Parse, &stage_id);
        let token = CancellationToken::new();
        token.begin("parse");
        token.cancel(false);

        let err = store
            .write_table(&stage_dir, &stage_id, &table(), OutputFormat::Parquet, Some(&token))
            .unwrap_err();
        assert!(matches!(err, EngineError::Cancelled { .. }));
        assert!(!stage_dir.join("scans.parquet").exists());
        assert!(stage_dir.join("scans.parquet.partial").exists());
    }

    #[test]
    fn test_schema_registry() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        assert!(store.locked_schema("p", "scans").unwrap().is_none());
        store
            .record_schema("p", "scans", &StageId::from("a1b2c3d4"), &table().columns)
            .unwrap();
        let locked = store.locked_schema("p", "scans").unwrap().unwrap();
        assert_eq!(locked.columns, table().columns);
        assert!(dir.path().join("schemas/p/scans.json").exists());
    }

    #[test]
    fn test_payload_is_written_once() {
        let dir = TempDir::new().unwrap();
        let store = ArtifactStore::new(dir.path());
        let stage_dir = dir.path().join("runs/r1/discovery/0000000a");
        let rel = store.write_payload(&stage_dir, &json!({"files": 1})).unwrap();
        store.write_payload(&stage_dir, &json!({"files": 2})).unwrap();
        assert_eq!(store.read_payload(&rel).unwrap(), json!({"files": 1}));
    }
}
