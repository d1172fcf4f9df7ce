//! XLSX adapter
//!
//! An `.xlsx` workbook is a zip archive of XML parts. Sheets are listed in
//! `xl/workbook.xml`, resolved to their part through the workbook
//! relationships, and cells reference the shared string table by index.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use serde_json::Value;

use super::{
    Adapter, FileValidation, PROBE_SAMPLE_ROWS, RawDocument, SchemaSummary, Sheet, TableSummary,
    frame_from_rows,
};
use crate::error::{EngineError, EngineResult};
use crate::models::{DataFrame, FileFormat};

type Archive = zip::ZipArchive<File>;

/// Excel workbooks, every sheet exposed in workbook order
#[derive(Debug, Default)]
pub struct ExcelAdapter;

impl ExcelAdapter {
    pub fn new() -> Self {
        Self
    }

    fn open(path: &Path) -> EngineResult<Archive> {
        let file = File::open(path)?;
        zip::ZipArchive::new(file)
            .map_err(|e| EngineError::adapter(path, format!("not an xlsx archive: {e}")))
    }

    /// Read every sheet, keeping at most `limit` rows per sheet
    fn read_sheets(path: &Path, limit: Option<usize>) -> EngineResult<(Vec<Sheet>, bool)> {
        let mut archive = Self::open(path)?;
        let shared = match read_entry(&mut archive, "xl/sharedStrings.xml", path)? {
            Some(xml) => parse_shared_strings(&xml, path)?,
            None => Vec::new(),
        };
        let entries = sheet_entries(&mut archive, path)?;

        let mut sheets = Vec::with_capacity(entries.len());
        let mut truncated = false;
        for (name, part) in entries {
            let entry = archive.by_name(&part).map_err(|e| {
                EngineError::adapter(path, format!("missing sheet part {part}: {e}"))
            })?;
            let (rows, cut) = parse_sheet(BufReader::new(entry), &shared, limit, path)?;
            truncated |= cut;
            sheets.push(Sheet { name, rows });
        }
        Ok((sheets, truncated))
    }
}

fn read_entry(archive: &mut Archive, name: &str, path: &Path) -> EngineResult<Option<String>> {
    match archive.by_name(name) {
        Ok(mut entry) => {
            let mut xml = String::new();
            entry.read_to_string(&mut xml)?;
            Ok(Some(xml))
        }
        Err(zip::result::ZipError::FileNotFound) => Ok(None),
        Err(e) => Err(EngineError::adapter(path, format!("reading {name}: {e}"))),
    }
}

fn attribute(e: &BytesStart<'_>, key: &[u8]) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.local_name().as_ref() == key {
            Some(
                attr.unescape_value()
                    .map(|v| v.to_string())
                    .unwrap_or_else(|_| String::from_utf8_lossy(&attr.value).to_string()),
            )
        } else {
            None
        }
    })
}

fn xml_error(path: &Path, position: u64, e: impl std::fmt::Display) -> EngineError {
    EngineError::adapter(path, format!("XML error at position {position}: {e}"))
}

/// Sheet names and their part paths, in workbook order
fn sheet_entries(archive: &mut Archive, path: &Path) -> EngineResult<Vec<(String, String)>> {
    let workbook = read_entry(archive, "xl/workbook.xml", path)?
        .ok_or_else(|| EngineError::adapter(path, "workbook.xml not found"))?;

    let mut targets = HashMap::new();
    if let Some(rels) = read_entry(archive, "xl/_rels/workbook.xml.rels", path)? {
        let mut reader = Reader::from_str(&rels);
        reader.config_mut().trim_text(true);
        loop {
            match reader.read_event() {
                Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                    if e.local_name().as_ref() == b"Relationship" =>
                {
                    if let (Some(id), Some(target)) = (attribute(e, b"Id"), attribute(e, b"Target"))
                    {
                        targets.insert(id, target);
                    }
                }
                Ok(Event::Eof) => break,
                Err(e) => return Err(xml_error(path, reader.error_position(), e)),
                _ => {}
            }
        }
    }

    let mut entries = Vec::new();
    let mut reader = Reader::from_str(&workbook);
    reader.config_mut().trim_text(true);
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) | Ok(Event::Empty(ref e))
                if e.local_name().as_ref() == b"sheet" =>
            {
                let name = attribute(e, b"name")
                    .unwrap_or_else(|| format!("Sheet{}", entries.len() + 1));
                let target = attribute(e, b"id")
                    .and_then(|id| targets.get(&id).cloned())
                    .unwrap_or_else(|| format!("worksheets/sheet{}.xml", entries.len() + 1));
                let part = match target.strip_prefix('/') {
                    Some(absolute) => absolute.to_string(),
                    None => format!("xl/{target}"),
                };
                entries.push((name, part));
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(path, reader.error_position(), e)),
            _ => {}
        }
    }
    Ok(entries)
}

/// Shared string table; rich-text runs are concatenated, phonetic runs skipped
fn parse_shared_strings(xml: &str, path: &Path) -> EngineResult<Vec<String>> {
    let mut reader = Reader::from_str(xml);
    let mut strings = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut in_phonetic = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => match e.local_name().as_ref() {
                b"si" => current.clear(),
                b"t" => in_text = true,
                b"rPh" => in_phonetic = true,
                _ => {}
            },
            Ok(Event::Empty(ref e)) if e.local_name().as_ref() == b"si" => {
                strings.push(String::new())
            }
            Ok(Event::Text(e)) if in_text && !in_phonetic => {
                let text = e
                    .unescape()
                    .map_err(|err| xml_error(path, reader.error_position(), err))?;
                current.push_str(&text);
            }
            Ok(Event::End(ref e)) => match e.local_name().as_ref() {
                b"si" => strings.push(std::mem::take(&mut current)),
                b"t" => in_text = false,
                b"rPh" => in_phonetic = false,
                _ => {}
            },
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(path, reader.error_position(), e)),
            _ => {}
        }
    }
    Ok(strings)
}

/// Zero-based column index of a cell reference such as `AB12`
pub fn column_index(reference: &str) -> Option<usize> {
    let letters: Vec<char> = reference
        .chars()
        .take_while(|c| c.is_ascii_alphabetic())
        .collect();
    if letters.is_empty() {
        return None;
    }
    let number = letters.iter().fold(0usize, |acc, c| {
        acc * 26 + (c.to_ascii_uppercase() as usize - 'A' as usize + 1)
    });
    Some(number - 1)
}

fn cell_value(kind: Option<&str>, raw: &str, shared: &[String]) -> Value {
    match kind {
        Some("s") => raw
            .trim()
            .parse::<usize>()
            .ok()
            .and_then(|idx| shared.get(idx))
            .map(|s| Value::String(s.clone()))
            .unwrap_or(Value::Null),
        Some("str") | Some("inlineStr") | Some("e") => Value::String(raw.to_string()),
        Some("b") => Value::Bool(raw.trim() == "1"),
        _ => numeric_cell(raw),
    }
}

fn numeric_cell(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    match trimmed.parse::<f64>() {
        Ok(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => Value::from(f as i64),
        Ok(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Err(_) => Value::String(raw.to_string()),
    }
}

/// Parse sheet XML into raw rows; gaps in row numbering become empty rows
fn parse_sheet<R: BufRead>(
    source: R,
    shared: &[String],
    limit: Option<usize>,
    path: &Path,
) -> EngineResult<(Vec<Vec<Value>>, bool)> {
    let mut reader = Reader::from_reader(source);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<Value>> = Vec::new();
    let mut row: Vec<Value> = Vec::new();
    let mut cell_column = 0usize;
    let mut cell_kind: Option<String> = None;
    let mut cell_text = String::new();
    let mut in_value = false;

    loop {
        let event = reader
            .read_event_into(&mut buf)
            .map_err(|e| xml_error(path, reader.error_position(), e))?;
        match event {
            Event::Start(ref e) | Event::Empty(ref e) if e.local_name().as_ref() == b"row" => {
                if let Some(number) = attribute(e, b"r").and_then(|r| r.parse::<usize>().ok()) {
                    while rows.len() + 1 < number {
                        rows.push(Vec::new());
                    }
                }
                row = Vec::new();
                if matches!(event, Event::Empty(_)) {
                    rows.push(std::mem::take(&mut row));
                }
            }
            Event::Start(ref e) if e.local_name().as_ref() == b"c" => {
                cell_column = attribute(e, b"r")
                    .and_then(|r| column_index(&r))
                    .unwrap_or(row.len());
                cell_kind = attribute(e, b"t");
                cell_text.clear();
            }
            Event::Start(ref e) if matches!(e.local_name().as_ref(), b"v" | b"t") => {
                in_value = true;
            }
            Event::Text(ref e) if in_value => {
                let text = e
                    .unescape()
                    .map_err(|err| xml_error(path, reader.error_position(), err))?;
                cell_text.push_str(&text);
            }
            Event::End(ref e) => match e.local_name().as_ref() {
                b"v" | b"t" => in_value = false,
                b"c" => {
                    let value = cell_value(cell_kind.as_deref(), &cell_text, shared);
                    if row.len() <= cell_column {
                        row.resize(cell_column + 1, Value::Null);
                    }
                    row[cell_column] = value;
                }
                b"row" => {
                    rows.push(std::mem::take(&mut row));
                    if limit.is_some_and(|max| rows.len() >= max) {
                        return Ok((rows, true));
                    }
                }
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
        buf.clear();
    }
    Ok((rows, false))
}

impl Adapter for ExcelAdapter {
    fn format(&self) -> FileFormat {
        FileFormat::Excel
    }

    fn probe_schema(&self, path: &Path, _probe_bytes: usize) -> EngineResult<SchemaSummary> {
        let (sheets, truncated) = Self::read_sheets(path, Some(PROBE_SAMPLE_ROWS + 1))?;
        let tables = sheets
            .iter()
            .map(|sheet| {
                let frame = frame_from_rows(sheet.rows.clone());
                TableSummary {
                    name: sheet.name.clone(),
                    sampled_rows: frame.len(),
                    columns: frame.columns,
                }
            })
            .collect();
        Ok(SchemaSummary {
            path: path.to_path_buf(),
            format: FileFormat::Excel,
            tables,
            row_count: None,
            truncated,
        })
    }

    fn validate_file(&self, path: &Path) -> EngineResult<FileValidation> {
        let mut validation = FileValidation::ok(path);
        match Self::open(path) {
            Ok(mut archive) => match sheet_entries(&mut archive, path) {
                Ok(entries) if entries.is_empty() => validation.issue("workbook has no sheets"),
                Ok(_) => {}
                Err(e) => validation.issue(e.to_string()),
            },
            Err(e) => validation.issue(e.to_string()),
        }
        Ok(validation)
    }

    fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame> {
        let (mut sheets, _) = Self::read_sheets(path, None)?;
        if sheets.is_empty() {
            return Ok(DataFrame::default());
        }
        Ok(frame_from_rows(sheets.remove(0).rows))
    }

    fn read_document(&self, path: &Path) -> EngineResult<RawDocument> {
        let (sheets, _) = Self::read_sheets(path, None)?;
        Ok(RawDocument::tabular(path, FileFormat::Excel, sheets, None))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    /// Write a minimal two-sheet workbook
    pub(crate) fn write_workbook(path: &Path) {
        let file = File::create(path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = SimpleFileOptions::default();
        let parts = [
            (
                "xl/workbook.xml",
                concat!(
                    r#"<?xml version="1.0"?><workbook xmlns:r="#,
                    r#""http://schemas.openxmlformats.org/officeDocument/2006/relationships">"#,
                    r#"<sheets><sheet name="Summary" sheetId="1" r:id="rId1"/>"#,
                    r#"<sheet name="Q&amp;A" sheetId="2" r:id="rId2"/></sheets></workbook>"#,
                ),
            ),
            (
                "xl/_rels/workbook.xml.rels",
                concat!(
                    r#"<?xml version="1.0"?><Relationships>"#,
                    r#"<Relationship Id="rId1" Target="worksheets/sheet1.xml"/>"#,
                    r#"<Relationship Id="rId2" Target="/xl/worksheets/sheet2.xml"/>"#,
                    r#"</Relationships>"#,
                ),
            ),
            (
                "xl/sharedStrings.xml",
                concat!(
                    r#"<?xml version="1.0"?><sst><si><t>lot</t></si><si><t>yield</t></si>"#,
                    r#"<si><r><t>LOT</t></r><r><t>7</t></r></si></sst>"#,
                ),
            ),
            (
                "xl/worksheets/sheet1.xml",
                concat!(
                    r#"<?xml version="1.0"?><worksheet><sheetData>"#,
                    r#"<row r="1"><c r="A1" t="s"><v>0</v></c><c r="B1" t="s"><v>1</v></c></row>"#,
                    r#"<row r="2"><c r="A2" t="s"><v>2</v></c><c r="B2"><v>0.95</v></c>"#,
                    r#"<c r="D2" t="b"><v>1</v></c></row></sheetData></worksheet>"#,
                ),
            ),
            (
                "xl/worksheets/sheet2.xml",
                concat!(
                    r#"<?xml version="1.0"?><worksheet><sheetData>"#,
                    r#"<row r="1"><c r="A1" t="inlineStr"><is><t>q</t></is></c></row>"#,
                    r#"<row r="3"><c r="A3"><v>12</v></c></row></sheetData></worksheet>"#,
                ),
            ),
        ];
        for (name, content) in parts {
            zip.start_file(name, options).unwrap();
            zip.write_all(content.as_bytes()).unwrap();
        }
        zip.finish().unwrap();
    }

    #[test]
    fn test_column_index() {
        assert_eq!(column_index("A1"), Some(0));
        assert_eq!(column_index("Z9"), Some(25));
        assert_eq!(column_index("AB12"), Some(27));
        assert_eq!(column_index("12"), None);
    }

    #[test]
    fn test_read_document_all_sheets() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        write_workbook(&path);

        let doc = ExcelAdapter::new().read_document(&path).unwrap();
        assert_eq!(doc.sheets.len(), 2);
        assert_eq!(doc.sheets[0].name, "Summary");
        assert_eq!(doc.sheets[1].name, "Q&A");
        assert_eq!(
            doc.sheets[0].rows[1],
            vec![json!("LOT7"), json!(0.95), Value::Null, json!(true)]
        );
        // Row 2 is missing from the second sheet
        assert_eq!(doc.sheets[1].rows.len(), 3);
        assert!(doc.sheets[1].rows[1].is_empty());
        assert_eq!(doc.sheets[1].rows[2], vec![json!(12)]);
        assert_eq!(doc.records(None, None)[0]["lot"], json!("LOT7"));
    }

    #[test]
    fn test_schema_summary_and_validate() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("book.xlsx");
        write_workbook(&path);
        let adapter = ExcelAdapter::new();

        let summary = adapter.probe_schema(&path, 1024).unwrap();
        assert_eq!(summary.table_names(), vec!["Summary", "Q&A"]);
        assert_eq!(summary.tables[0].columns, vec!["lot", "yield"]);
        assert!(adapter.validate_file(&path).unwrap().valid);

        let not_zip = dir.path().join("fake.xlsx");
        std::fs::write(&not_zip, "plain text").unwrap();
        assert!(!adapter.validate_file(&not_zip).unwrap().valid);
        assert!(!adapter.supports_streaming(&path));
    }
}
