//! Delimited text adapter

use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use serde_json::Value;

use super::{
    Adapter, DataChunk, FileValidation, PROBE_SAMPLE_ROWS, RawDocument, SchemaSummary, Sheet,
    TableSummary, frame_from_rows, infer_scalar,
};
use crate::error::{EngineError, EngineResult};
use crate::models::{DataFrame, FileFormat};

const DELIMITERS: [u8; 4] = [b',', b';', b'\t', b'|'];

/// Pick the delimiter occurring most often outside quotes in a line
///
/// Ties resolve in the order `,` `;` tab `|`.
pub fn sniff_delimiter(line: &str) -> u8 {
    let mut counts = [0usize; DELIMITERS.len()];
    let mut in_quotes = false;
    for byte in line.bytes() {
        if byte == b'"' {
            in_quotes = !in_quotes;
        } else if !in_quotes {
            if let Some(pos) = DELIMITERS.iter().position(|d| *d == byte) {
                counts[pos] += 1;
            }
        }
    }
    let mut best = 0;
    for (idx, count) in counts.iter().enumerate() {
        if *count > counts[best] {
            best = idx;
        }
    }
    DELIMITERS[best]
}

/// CSV, TSV and other delimited text
#[derive(Debug, Default)]
pub struct CsvAdapter;

impl CsvAdapter {
    pub fn new() -> Self {
        Self
    }

    fn delimiter_for(path: &Path) -> EngineResult<u8> {
        let file = File::open(path)?;
        let mut first = String::new();
        BufReader::new(file).read_line(&mut first)?;
        Ok(sniff_delimiter(first.trim_start_matches('\u{feff}')))
    }

    fn parse_rows<R: Read>(reader: R, delimiter: u8, path: &Path) -> EngineResult<Vec<Vec<Value>>> {
        let mut csv_reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(reader);
        let mut rows = Vec::new();
        for record in csv_reader.records() {
            let record = record.map_err(|e| EngineError::adapter(path, e.to_string()))?;
            rows.push(record.iter().map(infer_scalar).collect());
        }
        Ok(rows)
    }

    fn sheet_name(path: &Path) -> String {
        path.file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "data".to_string())
    }
}

impl Adapter for CsvAdapter {
    fn format(&self) -> FileFormat {
        FileFormat::Csv
    }

    fn probe_schema(&self, path: &Path, probe_bytes: usize) -> EngineResult<SchemaSummary> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        let mut head = Vec::new();
        file.take(probe_bytes as u64).read_to_end(&mut head)?;
        let truncated = (head.len() as u64) < size;

        let text = String::from_utf8_lossy(&head);
        // Drop a partial trailing line
        let text = match (truncated, text.rfind('\n')) {
            (true, Some(pos)) => &text[..pos],
            _ => &text[..],
        };
        let first_line = text.lines().next().unwrap_or("");
        let delimiter = sniff_delimiter(first_line.trim_start_matches('\u{feff}'));
        let rows = Self::parse_rows(text.as_bytes(), delimiter, path)?;
        let frame = frame_from_rows(rows);

        Ok(SchemaSummary {
            path: path.to_path_buf(),
            format: FileFormat::Csv,
            tables: vec![TableSummary {
                name: Self::sheet_name(path),
                columns: frame.columns.clone(),
                sampled_rows: frame.len().min(PROBE_SAMPLE_ROWS),
            }],
            row_count: if truncated { None } else { Some(frame.len()) },
            truncated,
        })
    }

    fn validate_file(&self, path: &Path) -> EngineResult<FileValidation> {
        let mut validation = FileValidation::ok(path);
        if std::fs::metadata(path)?.len() == 0 {
            validation.issue("file is empty");
            return Ok(validation);
        }
        let delimiter = Self::delimiter_for(path)?;
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(File::open(path)?);
        let width = match reader.headers() {
            Ok(headers) => headers.len(),
            Err(e) => {
                validation.issue(format!("unreadable header: {e}"));
                return Ok(validation);
            }
        };
        for (line, record) in reader.records().enumerate() {
            match record {
                Ok(record) if record.len() != width => validation.issue(format!(
                    "row {} has {} fields, header has {}",
                    line + 2,
                    record.len(),
                    width
                )),
                Ok(_) => {}
                Err(e) => validation.issue(e.to_string()),
            }
            if validation.issues.len() >= 10 {
                break;
            }
        }
        Ok(validation)
    }

    fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame> {
        let delimiter = Self::delimiter_for(path)?;
        let rows = Self::parse_rows(File::open(path)?, delimiter, path)?;
        Ok(frame_from_rows(rows))
    }

    fn read_document(&self, path: &Path) -> EngineResult<RawDocument> {
        let text = std::fs::read_to_string(path)?;
        let body = text.trim_start_matches('\u{feff}');
        let delimiter = sniff_delimiter(body.lines().next().unwrap_or(""));
        let rows = Self::parse_rows(body.as_bytes(), delimiter, path)?;
        let sheet = Sheet {
            name: Self::sheet_name(path),
            rows,
        };
        Ok(RawDocument::tabular(path, FileFormat::Csv, vec![sheet], Some(text)))
    }

    fn supports_streaming(&self, _path: &Path) -> bool {
        true
    }

    fn stream_dataframe(
        &self,
        path: &Path,
        chunk_rows: usize,
    ) -> EngineResult<Box<dyn Iterator<Item = EngineResult<DataChunk>> + Send>> {
        let delimiter = Self::delimiter_for(path)?;
        let mut reader = ::csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .flexible(true)
            .from_reader(File::open(path)?);
        let columns: Vec<String> = reader
            .headers()
            .map_err(|e| EngineError::adapter(path, e.to_string()))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').trim().to_string())
            .collect();
        Ok(Box::new(CsvChunks {
            records: reader.into_records(),
            columns,
            chunk_rows: chunk_rows.max(1),
            index: 0,
            path: path.display().to_string(),
            done: false,
        }))
    }
}

/// Lazy chunk iterator over a CSV file
struct CsvChunks {
    records: ::csv::StringRecordsIntoIter<File>,
    columns: Vec<String>,
    chunk_rows: usize,
    index: usize,
    path: String,
    done: bool,
}

impl Iterator for CsvChunks {
    type Item = EngineResult<DataChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let width = self.columns.len();
        let mut rows = Vec::with_capacity(self.chunk_rows);
        while rows.len() < self.chunk_rows {
            match self.records.next() {
                Some(Ok(record)) => {
                    let mut row: Vec<Value> = record.iter().map(infer_scalar).collect();
                    row.resize(width, Value::Null);
                    rows.push(row);
                }
                Some(Err(e)) => {
                    self.done = true;
                    return Some(Err(EngineError::adapter(&self.path, e.to_string())));
                }
                None => {
                    self.done = true;
                    break;
                }
            }
        }
        if rows.is_empty() {
            return None;
        }
        let chunk = DataChunk {
            index: self.index,
            frame: DataFrame::new(self.columns.clone(), rows),
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

    fn write(dir: &TempDir, name: &str, content: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn test_sniff_delimiter() {
        assert_eq!(sniff_delimiter("a,b,c"), b',');
        assert_eq!(sniff_delimiter("a;b;c"), b';');
        assert_eq!(sniff_delimiter("a\tb"), b'\t');
        assert_eq!(sniff_delimiter("\"x,y\"|b|c"), b'|');
        assert_eq!(sniff_delimiter("single"), b',');
    }

    #[test]
    fn test_read_dataframe_infers_cells() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "LOT1.csv", "id;value;label\n1;2.5;a\n2;;b\n");
        let frame = CsvAdapter::new().read_dataframe(&path).unwrap();
        assert_eq!(frame.columns, vec!["id", "value", "label"]);
        assert_eq!(frame.rows[0], vec![json!(1), json!(2.5), json!("a")]);
        assert_eq!(frame.rows[1][1], Value::Null);
    }

    #[test]
    fn test_read_document_keeps_raw_rows() {
        let dir = TempDir::new().unwrap();
        let path = write(&dir, "data.csv", "id,name\n1,x\n");
        let doc = CsvAdapter::new().read_document(&path).unwrap();
        assert_eq!(doc.sheets[0].name, "data");
        assert_eq!(doc.sheets[0].rows.len(), 2);
        assert_eq!(doc.content, json!([{"id": 1, "name": "x"}]));
        assert!(doc.text.unwrap().contains("1,x"));
    }

    #[test]
    fn test_stream_chunks_and_restart() {
        let dir = TempDir::new().unwrap();
        let mut content = String::from("n\n");
        for i in 0..25 {
            content.push_str(&format!("{i}\n"));
        }
        let path = write(&dir, "big.csv", &content);
        let adapter = CsvAdapter::new();

        let chunks: Vec<DataChunk> = adapter
            .stream_dataframe(&path, 10)
            .unwrap()
            .collect::<EngineResult<_>>()
            .unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].frame.len(), 5);
        assert_eq!(chunks[2].index, 2);

        let resumed: Vec<DataChunk> = adapter
            .stream_from(&path, 10, 1)
            .unwrap()
            .collect::<EngineResult<_>>()
            .unwrap();
        assert_eq!(resumed.len(), 2);
        assert_eq!(resumed[0].frame.rows[0], vec![json!(10)]);
    }

    #[test]
    fn test_schema_summary_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut content = String::from("a,b\n");
        for i in 0..5000 {
            content.push_str(&format!("{i},{i}\n"));
        }
        let path = write(&dir, "wide.csv", &content);
        let summary = CsvAdapter::new().probe_schema(&path, 256).unwrap();
        assert!(summary.truncated);
        assert_eq!(summary.row_count, None);
        assert_eq!(summary.tables[0].columns, vec!["a", "b"]);
    }

    #[test]
    fn test_validate_file_reports_ragged_rows() {
        let dir = TempDir::new().unwrap();
        let good = write(&dir, "good.csv", "a,b\n1,2\n");
        let bad = write(&dir, "bad.csv", "a,b\n1,2,3\n");
        let empty = write(&dir, "empty.csv", "");
        let adapter = CsvAdapter::new();
        assert!(adapter.validate_file(&good).unwrap().valid);
        assert!(!adapter.validate_file(&bad).unwrap().valid);
        assert!(!adapter.validate_file(&empty).unwrap().valid);
    }
}
