//! JSON document and JSON-lines adapter

use std::fs::File;
use std::io::{BufRead, BufReader, Lines, Read};
use std::path::Path;

use serde_json::Value;

use super::{
    Adapter, DataChunk, FileValidation, PROBE_SAMPLE_ROWS, RawDocument, SchemaSummary, TableSummary,
};
use crate::error::{EngineError, EngineResult};
use crate::models::{DataFrame, FileFormat, TableBuilder};

/// `.json` documents and `.jsonl`/`.ndjson` line files
#[derive(Debug, Default)]
pub struct JsonAdapter;

impl JsonAdapter {
    pub fn new() -> Self {
        Self
    }

    /// Whether the file holds one JSON value per line
    pub fn is_lines(path: &Path) -> bool {
        matches!(
            path.extension()
                .and_then(|e| e.to_str())
                .map(|e| e.to_lowercase())
                .as_deref(),
            Some("jsonl") | Some("ndjson")
        )
    }

    fn parse_lines(text: &str, path: &Path) -> EngineResult<Vec<Value>> {
        text.lines()
            .enumerate()
            .filter(|(_, line)| !line.trim().is_empty())
            .map(|(idx, line)| {
                serde_json::from_str(line)
                    .map_err(|e| EngineError::adapter(path, format!("line {}: {}", idx + 1, e)))
            })
            .collect()
    }

    fn table_name(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string())
    }
}

/// Build a frame from records; non-object records land in a `value` column
fn frame_from_records(records: &[Value]) -> DataFrame {
    let mut builder = TableBuilder::new();
    for record in records {
        match record {
            Value::Object(map) => builder.push_map(map),
            other => builder.push_record(vec![("value".to_string(), other.clone())]),
        }
    }
    let table = builder.finish("frame");
    DataFrame::new(table.column_names(), table.rows)
}

fn top_level_records(value: &Value) -> Vec<Value> {
    match value {
        Value::Array(items) => items.clone(),
        Value::Null => Vec::new(),
        other => vec![other.clone()],
    }
}

impl Adapter for JsonAdapter {
    fn format(&self) -> FileFormat {
        FileFormat::Json
    }

    fn probe_schema(&self, path: &Path, probe_bytes: usize) -> EngineResult<SchemaSummary> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut head = Vec::new();
        file.take(probe_bytes as u64).read_to_end(&mut head)?;
        let truncated = (head.len() as u64) < size;
        let text = String::from_utf8_lossy(&head);

        let records = if Self::is_lines(path) {
            let complete = match (truncated, text.rfind('\n')) {
                (true, Some(pos)) => &text[..pos],
                (true, None) => "",
                (false, _) => &text[..],
            };
            Self::parse_lines(complete, path)?
        } else {
            match serde_json::from_str::<Value>(&text) {
                Ok(value) => top_level_records(&value),
                // A truncated document cannot be parsed without reading it all
                Err(_) if truncated => Vec::new(),
                Err(e) => return Err(EngineError::adapter(path, e.to_string())),
            }
        };
        let sample: Vec<Value> = records.into_iter().take(PROBE_SAMPLE_ROWS).collect();
        let frame = frame_from_records(&sample);

        Ok(SchemaSummary {
            path: path.to_path_buf(),
            format: FileFormat::Json,
            tables: vec![TableSummary {
                name: Self::table_name(path),
                columns: frame.columns,
                sampled_rows: sample.len(),
            }],
            row_count: None,
            truncated,
        })
    }

    fn validate_file(&self, path: &Path) -> EngineResult<FileValidation> {
        let mut validation = FileValidation::ok(path);
        let text = std::fs::read_to_string(path)?;
        if text.trim().is_empty() {
            validation.issue("file is empty");
        } else if Self::is_lines(path) {
            if let Err(e) = Self::parse_lines(&text, path) {
                validation.issue(e.to_string());
            }
        } else if let Err(e) = serde_json::from_str::<Value>(&text) {
            validation.issue(format!("invalid JSON: {e}"));
        }
        Ok(validation)
    }

    fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame> {
        let document = self.read_document(path)?;
        Ok(frame_from_records(&top_level_records(&document.content)))
    }

    fn read_document(&self, path: &Path) -> EngineResult<RawDocument> {
        let text = std::fs::read_to_string(path)?;
        let content = if Self::is_lines(path) {
            Value::Array(Self::parse_lines(&text, path)?)
        } else {
            serde_json::from_str(&text).map_err(|e| EngineError::adapter(path, e.to_string()))?
        };
        Ok(RawDocument::structured(path, FileFormat::Json, content, Some(text)))
    }

    fn supports_streaming(&self, path: &Path) -> bool {
        Self::is_lines(path)
    }

    fn stream_dataframe(
        &self,
        path: &Path,
        chunk_rows: usize,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<DataChunk>> + Send>> {
        if !Self::is_lines(path) {
            return Err(EngineError::adapter(
                path,
                "only JSON-lines files can be streamed",
            ));
        }
        Ok(Box::new(JsonLineChunks {
            lines: BufReader::new(File::open(path)?).lines(),
            chunk_rows: chunk_rows.max(1),
            index: 0,
            line: 0,
            path: path.display().to_string(),
            done: false,
        }))
    }
}

/// Lazy chunk iterator over a JSON-lines file
struct JsonLineChunks {
    lines: Lines<BufReader<File>>,
    chunk_rows: usize,
    index: usize,
    line: usize,
    path: String,
    done: bool,
}

impl Iterator for JsonLineChunks {
    type Item = EngineResult<DataChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut records = Vec::with_capacity(self.chunk_rows);
        while records.len() < self.chunk_rows {
            let Some(line) = self.lines.next() else {
                self.done = true;
                break;
            };
            self.line += 1;
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    self.done = true;
                    return Some(Err(EngineError::Io(e)));
                }
            };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<Value>(&line) {
                Ok(value) => records.push(value),
                Err(e) => {
                    self.done = true;
                    return Some(Err(EngineError::adapter(
                        &self.path,
                        format!("line {}: {}", self.line, e),
                    )));
                }
            }
        }
        if records.is_empty() {
            return None;
        }
        let chunk = DataChunk {
            index: self.index,
            frame: frame_from_records(&records),
        };
        self.index += 1;
        Some(Ok(chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_read_document_json_and_lines() {
        let dir = TempDir::new().unwrap();
        let doc_path = dir.path().join("scan.json");
        std::fs::write(&doc_path, r#"{"wafer": "W1", "images": [{"id": 1}]}"#).unwrap();
        let lines_path = dir.path().join("events.jsonl");
        std::fs::write(&lines_path, "{\"a\": 1}\n\n{\"a\": 2, \"b\": true}\n").unwrap();

        let adapter = JsonAdapter::new();
        let doc = adapter.read_document(&doc_path).unwrap();
        assert_eq!(doc.content["wafer"], json!("W1"));

        let frame = adapter.read_dataframe(&lines_path).unwrap();
        assert_eq!(frame.columns, vec!["a", "b"]);
        assert_eq!(frame.rows[0], vec![json!(1), Value::Null]);
    }

    #[test]
    fn test_streaming_only_for_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("events.ndjson");
        let content: String = (0..7).map(|i| format!("{{\"n\": {i}}}\n")).collect();
        std::fs::write(&path, content).unwrap();

        let adapter = JsonAdapter::new();
        assert!(adapter.supports_streaming(&path));
        assert!(!adapter.supports_streaming(Path::new("a.json")));
        let chunks: Vec<DataChunk> = adapter
            .stream_dataframe(&path, 3)
            .unwrap()
            .collect::<EngineResult<_>>()
            .unwrap();
        assert_eq!(chunks.iter().map(|c| c.frame.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
    }

    #[test]
    fn test_validate_and_summarize() {
        let dir = TempDir::new().unwrap();
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        let adapter = JsonAdapter::new();
        assert!(!adapter.validate_file(&bad).unwrap().valid);

        let good = dir.path().join("rows.json");
        std::fs::write(&good, r#"[{"x": 1}, {"y": 2}]"#).unwrap();
        let summary = adapter.probe_schema(&good, 1024).unwrap();
        assert!(!summary.truncated);
        assert_eq!(summary.tables[0].columns, vec!["x", "y"]);
    }
}
