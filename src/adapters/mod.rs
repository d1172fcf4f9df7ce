//! Format adapters and the adapter registry
//!
//! An adapter knows how to probe, validate, read and (optionally) stream one
//! file format. The registry maps a [`FileFormat`] to its adapter and decides
//! whether a given file must go through the streaming path.

pub mod csv;
pub mod excel;
pub mod json;
pub mod parquet;
pub mod timeout;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

use crate::error::{EngineError, EngineResult};
use crate::extraction::path;
use crate::models::{DataFrame, FileFormat};

pub use self::csv::CsvAdapter;
pub use self::excel::ExcelAdapter;
pub use self::json::JsonAdapter;
pub use self::parquet::ParquetAdapter;
pub use self::timeout::{retry_on_timeout, run_with_timeout};

/// Rows sampled by a schema probe
pub const PROBE_SAMPLE_ROWS: usize = 20;

/// One table (sheet) seen by a probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSummary {
    pub name: String,
    pub columns: Vec<String>,
    pub sampled_rows: usize,
}

/// Result of a bounded schema probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchemaSummary {
    pub path: PathBuf,
    pub format: FileFormat,
    pub tables: Vec<TableSummary>,
    /// Total rows when the format records it cheaply
    pub row_count: Option<usize>,
    /// The probe only saw a prefix of the file
    pub truncated: bool,
}

impl SchemaSummary {
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }
}

/// Result of validating a file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileValidation {
    pub path: PathBuf,
    pub valid: bool,
    pub issues: Vec<String>,
}

impl FileValidation {
    pub fn ok(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            valid: true,
            issues: Vec::new(),
        }
    }

    pub fn issue(&mut self, message: impl Into<String>) {
        self.valid = false;
        self.issues.push(message.into());
    }
}

/// One streamed chunk of a file
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    /// Zero-based chunk index
    pub index: usize,
    pub frame: DataFrame,
}

/// A sheet of raw rows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<Value>>,
}

impl Sheet {
    /// Rows keyed by the first row, which is taken as the header
    pub fn keyed_rows(&self) -> Vec<Value> {
        let Some((header, body)) = self.rows.split_first() else {
            return Vec::new();
        };
        let names: Vec<String> = header.iter().map(header_name).collect();
        body.iter()
            .map(|row| {
                let mut record = Map::new();
                for (idx, name) in names.iter().enumerate() {
                    record.insert(name.clone(), row.get(idx).cloned().unwrap_or(Value::Null));
                }
                Value::Object(record)
            })
            .collect()
    }
}

/// Column name for a header cell
pub fn header_name(cell: &Value) -> String {
    match cell {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Build a frame whose first raw row is the header
pub fn frame_from_rows(mut rows: Vec<Vec<Value>>) -> DataFrame {
    if rows.is_empty() {
        return DataFrame::default();
    }
    let header: Vec<String> = rows.remove(0).iter().map(header_name).collect();
    let width = header.len();
    for row in &mut rows {
        row.resize(width, Value::Null);
    }
    DataFrame::new(header, rows)
}

/// Raw records of one file, as consumed by the strategy engine
#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub path: PathBuf,
    pub file_name: String,
    pub format: FileFormat,
    /// Structured content; keyed rows of the first sheet for tabular formats
    pub content: Value,
    /// Raw rows per sheet for tabular formats, empty for JSON
    pub sheets: Vec<Sheet>,
    /// Raw text, when the format is textual
    pub text: Option<String>,
}

impl RawDocument {
    /// Build a document for a structured (JSON) payload
    pub fn structured(
        path: &Path,
        format: FileFormat,
        content: Value,
        text: Option<String>,
    ) -> Self {
        Self {
            path: path.to_path_buf(),
            file_name: file_name(path),
            format,
            content,
            sheets: Vec::new(),
            text,
        }
    }

    /// Build a document for sheet-based (tabular) content
    pub fn tabular(
        path: &Path,
        format: FileFormat,
        sheets: Vec<Sheet>,
        text: Option<String>,
    ) -> Self {
        let content = sheets
            .first()
            .map(|s| Value::Array(s.keyed_rows()))
            .unwrap_or(Value::Array(Vec::new()));
        Self {
            path: path.to_path_buf(),
            file_name: file_name(path),
            format,
            content,
            sheets,
            text,
        }
    }

    /// Build a document from a streamed chunk; rows are already keyed
    pub fn from_chunk(path: &Path, format: FileFormat, chunk: &DataChunk) -> Self {
        Self::structured(path, format, Value::Array(chunk.frame.records()), None)
    }

    /// Whether the document carries raw sheets
    pub fn is_tabular(&self) -> bool {
        !self.sheets.is_empty()
    }

    /// Look up a sheet by name, or the first sheet
    pub fn sheet(&self, name: Option<&str>) -> Option<&Sheet> {
        match name {
            Some(name) => self.sheets.iter().find(|s| s.name == name),
            None => self.sheets.first(),
        }
    }

    /// Keyed records at an optional path (JSON) or sheet (tabular)
    ///
    /// A selected array contributes its elements; any other selected value
    /// contributes itself.
    pub fn records(&self, sheet: Option<&str>, at: Option<&str>) -> Vec<Value> {
        if self.is_tabular() {
            return match sheet {
                None => match &self.content {
                    Value::Array(items) => items.clone(),
                    _ => Vec::new(),
                },
                Some(_) => self.sheet(sheet).map(Sheet::keyed_rows).unwrap_or_default(),
            };
        }
        let selected = match at {
            Some(p) => path::select(&self.content, p),
            None => vec![&self.content],
        };
        let mut records = Vec::new();
        for value in selected {
            match value {
                Value::Array(items) => records.extend(items.iter().cloned()),
                Value::Null => {}
                other => records.push(other.clone()),
            }
        }
        records
    }

    /// Raw (unkeyed) rows of a sheet, or the records at a path
    pub fn raw_rows(&self, sheet: Option<&str>, at: Option<&str>) -> Vec<Value> {
        if self.is_tabular() {
            return self
                .sheet(sheet)
                .map(|s| s.rows.iter().cloned().map(Value::Array).collect())
                .unwrap_or_default();
        }
        self.records(None, at)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

/// Infer a scalar from a raw text cell
///
/// Empty cells are null; otherwise integer, then float, then string.
pub fn infer_scalar(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    if let Ok(i) = trimmed.parse::<i64>() {
        return Value::from(i);
    }
    if let Ok(f) = trimmed.parse::<f64>() {
        if f.is_finite() {
            if let Some(n) = serde_json::Number::from_f64(f) {
                return Value::Number(n);
            }
        }
    }
    Value::String(raw.to_string())
}

/// Capability interface implemented once per format
pub trait Adapter: Send + Sync {
    /// Format handled by this adapter
    fn format(&self) -> FileFormat;

    /// Inspect at most `probe_bytes` of the file and summarize its tables
    fn probe_schema(&self, path: &Path, probe_bytes: usize) -> EngineResult<SchemaSummary>;

    /// Check the file can be read
    fn validate_file(&self, path: &Path) -> EngineResult<FileValidation>;

    /// Read the first table of the file in full
    fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame>;

    /// Read the raw records of the file
    fn read_document(&self, path: &Path) -> EngineResult<RawDocument>;

    /// Whether this file can be read chunk by chunk
    fn supports_streaming(&self, _path: &Path) -> bool {
        false
    }

    /// Lazily read the file in chunks of `chunk_rows` rows
    fn stream_dataframe(
        &self,
        path: &Path,
        _chunk_rows: usize,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<DataChunk>> + Send>> {
        Err(EngineError::adapter(
            path,
            format!("{} adapter does not stream", self.format()),
        ))
    }

    /// Restart a stream at a chunk index
    fn stream_from(
        &self,
        path: &Path,
        chunk_rows: usize,
        start_chunk: usize,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<DataChunk>> + Send>> {
        let chunks = self.stream_dataframe(path, chunk_rows)?;
        Ok(Box::new(chunks.skip(start_chunk)))
    }
}

/// How a file is going to be read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadPlan {
    Full,
    Stream,
    /// Large file whose adapter cannot stream
    FullFallback,
}

/// Registry of adapters keyed by format
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: BTreeMap<FileFormat, Arc<dyn Adapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("formats", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl AdapterRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the four built-in adapters
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(CsvAdapter::new()));
        registry.register(Arc::new(ExcelAdapter::new()));
        registry.register(Arc::new(JsonAdapter::new()));
        registry.register(Arc::new(ParquetAdapter::new()));
        registry
    }

    /// Register (or replace) the adapter for its format
    pub fn register(&mut self, adapter: Arc<dyn Adapter>) {
        self.adapters.insert(adapter.format(), adapter);
    }

    /// Adapter for a format
    pub fn get(&self, format: FileFormat) -> EngineResult<Arc<dyn Adapter>> {
        self.adapters
            .get(&format)
            .cloned()
            .ok_or_else(|| EngineError::UnsupportedFormat(format.to_string()))
    }

    /// Adapter for a format name such as `csv`
    pub fn get_by_name(&self, name: &str) -> EngineResult<Arc<dyn Adapter>> {
        let format: FileFormat = name
            .parse()
            .map_err(|_| EngineError::UnsupportedFormat(name.to_string()))?;
        self.get(format)
    }

    /// Adapter for a file, detected from its extension
    pub fn for_path(&self, path: &Path) -> EngineResult<(FileFormat, Arc<dyn Adapter>)> {
        let format = FileFormat::from_path(path).ok_or_else(|| {
            EngineError::UnsupportedFormat(
                path.extension()
                    .map(|e| e.to_string_lossy().to_string())
                    .unwrap_or_else(|| path.display().to_string()),
            )
        })?;
        Ok((format, self.get(format)?))
    }

    /// Decide between a full read and streaming for a file of `size` bytes
    pub fn read_plan(&self, path: &Path, size: u64, threshold: u64) -> EngineResult<ReadPlan> {
        let (_, adapter) = self.for_path(path)?;
        if size < threshold {
            return Ok(ReadPlan::Full);
        }
        if adapter.supports_streaming(path) {
            Ok(ReadPlan::Stream)
        } else {
            warn!(
                path = %path.display(),
                size,
                threshold,
                "Adapter cannot stream large file, falling back to a full read"
            );
            Ok(ReadPlan::FullFallback)
        }
    }

    /// Registered formats
    pub fn formats(&self) -> Vec<FileFormat> {
        self.adapters.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_infer_scalar() {
        assert_eq!(infer_scalar(""), Value::Null);
        assert_eq!(infer_scalar(" 42 "), json!(42));
        assert_eq!(infer_scalar("2.5"), json!(2.5));
        assert_eq!(infer_scalar("NaN"), json!("NaN"));
        assert_eq!(infer_scalar("LOT1"), json!("LOT1"));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.formats().len(), 4);
        assert!(registry.get_by_name("csv").is_ok());
        assert!(matches!(
            registry.get_by_name("xml"),
            Err(EngineError::UnsupportedFormat(_))
        ));
        assert!(matches!(
            registry.for_path(Path::new("a/b.xml")),
            Err(EngineError::UnsupportedFormat(_))
        ));
        let (format, _) = registry.for_path(Path::new("a/b.jsonl")).unwrap();
        assert_eq!(format, FileFormat::Json);
    }

    #[test]
    fn test_read_plan() {
        let registry = AdapterRegistry::with_defaults();
        let big = 20 * 1024 * 1024;
        let threshold = 10 * 1024 * 1024;
        assert_eq!(
            registry.read_plan(Path::new("a.csv"), 10, threshold).unwrap(),
            ReadPlan::Full
        );
        assert_eq!(
            registry.read_plan(Path::new("a.csv"), big, threshold).unwrap(),
            ReadPlan::Stream
        );
        assert_eq!(
            registry.read_plan(Path::new("a.json"), big, threshold).unwrap(),
            ReadPlan::FullFallback
        );
        assert_eq!(
            registry.read_plan(Path::new("a.jsonl"), big, threshold).unwrap(),
            ReadPlan::Stream
        );
    }

    #[test]
    fn test_document_records() {
        let doc = RawDocument::structured(
            Path::new("x/a.json"),
            FileFormat::Json,
            json!({"items": [{"a": 1}, {"a": 2}], "meta": {"b": 3}}),
            None,
        );
        assert_eq!(doc.file_name, "a.json");
        assert_eq!(doc.records(None, Some("items")).len(), 2);
        assert_eq!(doc.records(None, Some("meta")), vec![json!({"b": 3})]);
        assert_eq!(doc.records(None, None).len(), 1);

        let sheet = Sheet {
            name: "s1".into(),
            rows: vec![
                vec![json!("id"), json!("v")],
                vec![json!(1), json!(2.5)],
            ],
        };
        let doc = RawDocument::tabular(Path::new("t.csv"), FileFormat::Csv, vec![sheet], None);
        assert_eq!(doc.records(None, None), vec![json!({"id": 1, "v": 2.5})]);
        assert_eq!(doc.records(Some("s1"), None).len(), 1);
        assert!(doc.records(Some("nope"), None).is_empty());
        assert_eq!(doc.raw_rows(None, None).len(), 2);
    }
}
