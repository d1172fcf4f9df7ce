//! The six table-shaping strategies

use std::collections::HashMap;

use serde_json::{Map, Value};

use super::params::{
    ArrayOfObjectsParams, FlatObjectParams, HeadersDataParams, JoinHow, JoinParams,
    RepeatOverParams, UnpivotParams,
};
use super::path;
use super::{StrategyInput, TableSet};
use crate::adapters::{RawDocument, header_name};
use crate::error::{EngineError, EngineResult};
use crate::models::{ExtractedTable, TableBuilder};

/// A table-shaping algorithm
pub trait Strategy {
    /// Shape the input into a table called `name`
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable>;
}

fn expect_document<'a>(
    input: StrategyInput<'a>,
    strategy: &str,
    name: &str,
) -> EngineResult<&'a RawDocument> {
    match input {
        StrategyInput::Document(doc) => Ok(doc),
        StrategyInput::Tables(_) => Err(EngineError::InvalidStrategyParams {
            table: name.to_string(),
            reason: format!("{strategy} reads file records, not extracted tables"),
        }),
    }
}

fn expect_table<'a>(
    tables: &'a TableSet,
    name: &str,
    owner: &str,
) -> EngineResult<&'a ExtractedTable> {
    tables
        .get(name)
        .map(|t| t.as_ref())
        .ok_or_else(|| EngineError::InvalidStrategyParams {
            table: owner.to_string(),
            reason: format!("source table '{name}' has not been extracted"),
        })
}

/// Builder seeded with the provenance of a document
fn document_builder(doc: &RawDocument, source: Option<&str>) -> TableBuilder {
    let mut builder = TableBuilder::new();
    builder.add_source(doc.file_name.clone());
    let source_name = match source {
        Some(s) => s.to_string(),
        None => doc
            .sheet(None)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| doc.file_name.clone()),
    };
    builder.source_table(source_name);
    builder
}

/// Scalar cell for a nested value; arrays and objects become JSON text
fn cell(value: &Value) -> Value {
    match value {
        Value::Array(_) | Value::Object(_) => Value::String(value.to_string()),
        other => other.clone(),
    }
}

/// Flatten a record into `(column, value)` pairs
///
/// Nested objects are joined with `separator`; arrays and anything deeper
/// than `max_depth` are kept as JSON text. A non-object record becomes a
/// single `value` column.
pub fn flatten_record(
    record: &Value,
    separator: &str,
    max_depth: Option<usize>,
) -> Vec<(String, Value)> {
    let mut out = Vec::new();
    match record {
        Value::Object(map) => flatten_into(map, "", separator, max_depth, 0, &mut out),
        other => out.push(("value".to_string(), cell(other))),
    }
    out
}

fn flatten_into(
    map: &Map<String, Value>,
    prefix: &str,
    separator: &str,
    max_depth: Option<usize>,
    depth: usize,
    out: &mut Vec<(String, Value)>,
) {
    for (key, value) in map {
        let column = if prefix.is_empty() {
            key.clone()
        } else {
            format!("{prefix}{separator}{key}")
        };
        match value {
            Value::Object(inner) if max_depth.is_none_or(|max| depth < max) => {
                flatten_into(inner, &column, separator, max_depth, depth + 1, out)
            }
            other => out.push((column, cell(other))),
        }
    }
}

impl Strategy for FlatObjectParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        let doc = expect_document(input, "flat_object", name)?;
        let mut builder = document_builder(doc, self.sheet.as_deref().or(self.path.as_deref()));
        for record in doc.records(self.sheet.as_deref(), self.path.as_deref()) {
            builder.push_record(flatten_record(&record, &self.separator, self.max_depth));
        }
        Ok(builder.finish(name))
    }
}

fn is_blank(cells: &[Value]) -> bool {
    cells.iter().all(|c| match c {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    })
}

/// Unique, non-empty column names from a header row
fn header_columns(header: &[Value]) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    header
        .iter()
        .enumerate()
        .map(|(idx, value)| {
            let base = match header_name(value) {
                name if name.is_empty() => format!("column_{}", idx + 1),
                name => name,
            };
            let count = seen.entry(base.clone()).or_insert(0);
            *count += 1;
            if *count == 1 {
                base
            } else {
                format!("{base}_{count}")
            }
        })
        .collect()
}

impl HeadersDataParams {
    fn push_rows(&self, header: &[Value], rows: &[Vec<Value>], builder: &mut TableBuilder) {
        let columns = header_columns(header);
        for row in rows {
            if self.skip_blank_rows && is_blank(row) {
                continue;
            }
            let fields = row
                .iter()
                .enumerate()
                .map(|(idx, value)| {
                    let column = columns
                        .get(idx)
                        .cloned()
                        .unwrap_or_else(|| format!("column_{}", idx + 1));
                    (column, cell(value))
                })
                .collect();
            builder.push_record(fields);
        }
    }
}

impl Strategy for HeadersDataParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        let doc = expect_document(input, "headers_data", name)?;
        let mut builder = document_builder(doc, self.sheet.as_deref().or(self.path.as_deref()));
        let mut arrays: Vec<Vec<Value>> = Vec::new();

        for record in doc.raw_rows(self.sheet.as_deref(), self.path.as_deref()) {
            match record {
                Value::Object(map) => match (map.get("headers"), map.get("data")) {
                    (Some(Value::Array(header)), Some(Value::Array(data))) => {
                        let rows: Vec<Vec<Value>> = data
                            .iter()
                            .map(|row| match row {
                                Value::Array(cells) => cells.clone(),
                                other => vec![other.clone()],
                            })
                            .collect();
                        self.push_rows(header, &rows, &mut builder);
                    }
                    // Already keyed by a header, e.g. a streamed chunk
                    _ => builder.push_record(
                        map.iter().map(|(k, v)| (k.clone(), cell(v))).collect(),
                    ),
                },
                Value::Array(cells) => arrays.push(cells),
                other => arrays.push(vec![other]),
            }
        }

        if !arrays.is_empty() {
            let header = arrays.get(self.header_row).ok_or_else(|| {
                EngineError::adapter(
                    &doc.path,
                    format!(
                        "header row {} not present ({} rows)",
                        self.header_row,
                        arrays.len()
                    ),
                )
            })?;
            self.push_rows(header, &arrays[self.header_row + 1..], &mut builder);
        }
        Ok(builder.finish(name))
    }
}

impl Strategy for ArrayOfObjectsParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        let doc = expect_document(input, "array_of_objects", name)?;
        let mut builder = document_builder(doc, self.sheet.as_deref().or(self.path.as_deref()));
        for record in doc.records(self.sheet.as_deref(), self.path.as_deref()) {
            match record {
                Value::Object(map) => {
                    builder.push_record(map.iter().map(|(k, v)| (k.clone(), cell(v))).collect())
                }
                other => builder.push_record(vec![("value".to_string(), cell(&other))]),
            }
        }
        Ok(builder.finish(name))
    }
}

impl RepeatOverParams {
    /// Sibling fields broadcast onto every emitted row
    fn siblings(&self, record: &Value) -> Vec<(String, Value)> {
        if !self.broadcast.is_empty() {
            return self
                .broadcast
                .iter()
                .map(|field| {
                    let value = path::lookup(record, field).map(cell).unwrap_or(Value::Null);
                    (field.clone(), value)
                })
                .collect();
        }
        let iterated = match path::parse_path(&self.path).ok().and_then(|s| s.into_iter().next()) {
            Some(path::Segment::Key(key)) => Some(key),
            _ => None,
        };
        match record {
            Value::Object(map) => map
                .iter()
                .filter(|(key, value)| Some(*key) != iterated.as_ref() && !value.is_array())
                .flat_map(|(key, value)| match value {
                    Value::Object(_) => flatten_record(value, ".", None)
                        .into_iter()
                        .map(|(inner, v)| (format!("{key}.{inner}"), v))
                        .collect::<Vec<_>>(),
                    other => vec![(key.clone(), other.clone())],
                })
                .collect(),
            _ => Vec::new(),
        }
    }

    fn element_fields(&self, element: &Value) -> Vec<(String, Value)> {
        let prefix = self.prefix.as_deref().unwrap_or("");
        match element {
            Value::Object(_) => flatten_record(element, ".", None)
                .into_iter()
                .map(|(key, value)| (format!("{prefix}{key}"), value))
                .collect(),
            other => {
                let column = match self.prefix.as_deref() {
                    Some(p) if !p.is_empty() => p.trim_end_matches(['.', '_']).to_string(),
                    _ => match path::parse_path(&self.path).ok().and_then(|s| {
                        s.into_iter().rev().find_map(|seg| match seg {
                            path::Segment::Key(key) => Some(key),
                            _ => None,
                        })
                    }) {
                        Some(key) => key,
                        None => "value".to_string(),
                    },
                };
                vec![(column, cell(other))]
            }
        }
    }
}

impl Strategy for RepeatOverParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        let doc = expect_document(input, "repeat_over", name)?;
        let mut builder = document_builder(doc, Some(&self.path));
        for record in doc.records(None, self.root.as_deref()) {
            let siblings = self.siblings(&record);
            let selected = path::select(&record, &self.path);
            let elements: Vec<&Value> = match selected.as_slice() {
                [single] => match *single {
                    Value::Array(items) => items.iter().collect(),
                    other => vec![other],
                },
                _ => selected.clone(),
            };
            if elements.is_empty() {
                if self.keep_empty {
                    builder.push_record(siblings);
                }
                continue;
            }
            for element in elements {
                let mut fields = siblings.clone();
                fields.extend(self.element_fields(element));
                builder.push_record(fields);
            }
        }
        Ok(builder.finish(name))
    }
}

impl UnpivotParams {
    fn melt(
        &self,
        records: Vec<Map<String, Value>>,
        columns: &[String],
        name: &str,
        builder: &mut TableBuilder,
    ) -> EngineResult<()> {
        for id in &self.id_columns {
            if !columns.contains(id) {
                return Err(EngineError::InvalidStrategyParams {
                    table: name.to_string(),
                    reason: format!("id column '{id}' not found"),
                });
            }
        }
        let value_columns: Vec<String> = if self.value_columns.is_empty() {
            columns
                .iter()
                .filter(|c| !self.id_columns.contains(c))
                .cloned()
                .collect()
        } else {
            self.value_columns.clone()
        };
        for record in &records {
            for column in &value_columns {
                let value = record.get(column).cloned().unwrap_or(Value::Null);
                if self.drop_nulls && value.is_null() {
                    continue;
                }
                let mut fields: Vec<(String, Value)> = self
                    .id_columns
                    .iter()
                    .map(|id| (id.clone(), record.get(id).cloned().unwrap_or(Value::Null)))
                    .collect();
                fields.push((self.variable_column.clone(), Value::String(column.clone())));
                fields.push((self.value_column.clone(), value));
                builder.push_record(fields);
            }
        }
        Ok(())
    }
}

impl Strategy for UnpivotParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        match (input, self.source.as_deref()) {
            (StrategyInput::Tables(tables), Some(source)) => {
                let table = expect_table(tables, source, name)?;
                let mut builder = TableBuilder::new();
                builder.source_table(source);
                for file in &table.metadata.source_files {
                    builder.add_source(file.clone());
                }
                self.melt(table.records(), &table.column_names(), name, &mut builder)?;
                Ok(builder.finish(name))
            }
            (StrategyInput::Document(doc), None) => {
                let mut flat = TableBuilder::new();
                for record in doc.records(self.sheet.as_deref(), self.path.as_deref()) {
                    flat.push_record(flatten_record(&record, ".", None));
                }
                let wide = flat.finish(name);
                let source = self.sheet.as_deref().or(self.path.as_deref());
                let mut builder = document_builder(doc, source);
                self.melt(wide.records(), &wide.column_names(), name, &mut builder)?;
                Ok(builder.finish(name))
            }
            (StrategyInput::Tables(_), None) => Err(EngineError::InvalidStrategyParams {
                table: name.to_string(),
                reason: "unpivot without 'source' reads file records".to_string(),
            }),
            (StrategyInput::Document(_), Some(source)) => Err(EngineError::InvalidStrategyParams {
                table: name.to_string(),
                reason: format!("unpivot reads table '{source}', not file records"),
            }),
        }
    }
}

/// Reverse an unpivot: one row per distinct id tuple, one column per variable
///
/// Row order follows the first appearance of each id tuple and new columns
/// follow the first appearance of each variable.
pub fn repivot(
    table: &ExtractedTable,
    name: &str,
    id_columns: &[String],
    variable_column: &str,
    value_column: &str,
) -> EngineResult<ExtractedTable> {
    for column in id_columns
        .iter()
        .map(String::as_str)
        .chain([variable_column, value_column])
    {
        if table.column_index(column).is_none() {
            return Err(EngineError::InvalidStrategyParams {
                table: name.to_string(),
                reason: format!("column '{column}' not found"),
            });
        }
    }
    let mut order: Vec<String> = Vec::new();
    let mut grouped: HashMap<String, Vec<(String, Value)>> = HashMap::new();
    for record in table.records() {
        let ids: Vec<(String, Value)> = id_columns
            .iter()
            .map(|id| (id.clone(), record.get(id).cloned().unwrap_or(Value::Null)))
            .collect();
        let key = serde_json::to_string(&ids.iter().map(|(_, v)| v).collect::<Vec<_>>())?;
        let entry = grouped.entry(key.clone()).or_insert_with(|| {
            order.push(key.clone());
            ids
        });
        let variable = match record.get(variable_column) {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => continue,
        };
        entry.push((variable, record.get(value_column).cloned().unwrap_or(Value::Null)));
    }
    let mut builder = TableBuilder::new();
    for key in order {
        if let Some(fields) = grouped.remove(&key) {
            builder.push_record(fields);
        }
    }
    Ok(builder.finish(name))
}

/// Comparable form of a join key; null keys never match
fn join_key(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(format!("s:{s}")),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 => {
                Some(format!("n:{}", f as i64))
            }
            _ => Some(format!("n:{n}")),
        },
        other => Some(format!("v:{other}")),
    }
}

impl JoinParams {
    /// Output column names for the right side, keyed by right column index
    fn right_columns(&self, left: &ExtractedTable, right: &ExtractedTable) -> Vec<(usize, String)> {
        let left_names = left.column_names();
        right
            .column_names()
            .into_iter()
            .enumerate()
            .filter(|(_, name)| *name != self.on)
            .map(|(idx, name)| {
                if left_names.contains(&name) {
                    (idx, format!("{name}{}", self.right_suffix))
                } else {
                    (idx, name)
                }
            })
            .collect()
    }

    /// Join two tables
    pub fn join(
        &self,
        left: &ExtractedTable,
        right: &ExtractedTable,
        name: &str,
    ) -> EngineResult<ExtractedTable> {
        let left_key = left.column_index(&self.on).ok_or_else(|| EngineError::JoinKeyMismatch {
            key: self.on.clone(),
            side: "left".to_string(),
            table: left.name.clone(),
        })?;
        let right_key = right.column_index(&self.on).ok_or_else(|| EngineError::JoinKeyMismatch {
            key: self.on.clone(),
            side: "right".to_string(),
            table: right.name.clone(),
        })?;

        let mut index: HashMap<String, Vec<usize>> = HashMap::new();
        for (row_idx, row) in right.rows.iter().enumerate() {
            if let Some(key) = row.get(right_key).and_then(join_key) {
                index.entry(key).or_default().push(row_idx);
            }
        }

        let right_columns = self.right_columns(left, right);
        let mut columns = left.column_names();
        columns.extend(right_columns.iter().map(|(_, name)| name.clone()));
        let right_nulls = vec![Value::Null; right_columns.len()];
        let mut matched = vec![false; right.rows.len()];
        let mut rows = Vec::new();

        for left_row in &left.rows {
            let hits = left_row
                .get(left_key)
                .and_then(join_key)
                .and_then(|key| index.get(&key));
            match hits {
                Some(hits) => {
                    for &right_idx in hits {
                        matched[right_idx] = true;
                        let mut row = left_row.clone();
                        row.extend(right_columns.iter().map(|(idx, _)| {
                            right.rows[right_idx].get(*idx).cloned().unwrap_or(Value::Null)
                        }));
                        rows.push(row);
                    }
                }
                None if self.how != JoinHow::Inner => {
                    let mut row = left_row.clone();
                    row.extend(right_nulls.iter().cloned());
                    rows.push(row);
                }
                None => {}
            }
        }

        if self.how == JoinHow::Outer {
            for (right_idx, right_row) in right.rows.iter().enumerate() {
                if matched[right_idx] {
                    continue;
                }
                let mut row = vec![Value::Null; left.columns.len()];
                row[left_key] = right_row.get(right_key).cloned().unwrap_or(Value::Null);
                row.extend(
                    right_columns
                        .iter()
                        .map(|(idx, _)| right_row.get(*idx).cloned().unwrap_or(Value::Null)),
                );
                rows.push(row);
            }
        }

        let mut table = ExtractedTable::new(name, columns, rows);
        table.metadata.source_table_name = format!("{}+{}", left.name, right.name);
        for file in left
            .metadata
            .source_files
            .iter()
            .chain(&right.metadata.source_files)
        {
            if !table.metadata.source_files.contains(file) {
                table.metadata.source_files.push(file.clone());
            }
        }
        Ok(table)
    }
}

impl Strategy for JoinParams {
    fn apply(&self, input: StrategyInput<'_>, name: &str) -> EngineResult<ExtractedTable> {
        let StrategyInput::Tables(tables) = input else {
            return Err(EngineError::InvalidStrategyParams {
                table: name.to_string(),
                reason: "join reads extracted tables, not file records".to_string(),
            });
        };
        let left = expect_table(tables, &self.left, name)?;
        let right = expect_table(tables, &self.right, name)?;
        self.join(left, right, name)
    }
}
