//! Tabular data structures shared by adapters, strategies and the store

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Logical column type, inferred from cell values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColumnType {
    /// Only nulls seen
    Null,
    Boolean,
    Integer,
    Float,
    String,
}

impl ColumnType {
    /// Type of a single cell value
    pub fn of(value: &Value) -> Self {
        match value {
            Value::Null => Self::Null,
            Value::Bool(_) => Self::Boolean,
            Value::Number(n) if n.is_i64() || n.is_u64() => Self::Integer,
            Value::Number(_) => Self::Float,
            _ => Self::String,
        }
    }

    /// Widen two observed types into one that can hold both
    pub fn merge(self, other: Self) -> Self {
        match (self, other) {
            (a, b) if a == b => a,
            (Self::Null, b) => b,
            (a, Self::Null) => a,
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Self::Float,
            _ => Self::String,
        }
    }

    /// Infer the type of a column from its values
    pub fn infer<'a>(values: impl IntoIterator<Item = &'a Value>) -> Self {
        values
            .into_iter()
            .fold(Self::Null, |acc, value| acc.merge(Self::of(value)))
    }
}

/// Name and type of one column
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnSchema {
    pub name: String,
    pub dtype: ColumnType,
}

impl ColumnSchema {
    pub fn new(name: impl Into<String>, dtype: ColumnType) -> Self {
        Self {
            name: name.into(),
            dtype,
        }
    }
}

/// A validation or schema warning attached to a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationWarning {
    pub table: String,
    pub column: Option<String>,
    pub row: Option<usize>,
    pub rule: String,
    pub message: String,
}

/// Metadata carried with an extracted table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableMetadata {
    /// Table (or sheet) name the rows were taken from
    pub source_table_name: String,
    /// Source files in declared order
    pub source_files: Vec<String>,
    /// First and last chunk index consumed, for streamed sources
    pub chunk_range: Option<(usize, usize)>,
    pub row_count: usize,
}

/// A rectangular table produced by a strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedTable {
    pub name: String,
    pub columns: Vec<ColumnSchema>,
    pub rows: Vec<Vec<Value>>,
    pub metadata: TableMetadata,
    pub validation_warnings: Vec<ValidationWarning>,
}

impl ExtractedTable {
    /// Build a table from column names and rows; types are inferred
    pub fn new(name: impl Into<String>, columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        let name = name.into();
        let mut table = Self {
            metadata: TableMetadata {
                source_table_name: name.clone(),
                ..Default::default()
            },
            name,
            columns: columns
                .into_iter()
                .map(|c| ColumnSchema::new(c, ColumnType::Null))
                .collect(),
            rows,
            validation_warnings: Vec::new(),
        };
        table.refresh_schema();
        table
    }

    /// Create an empty table with no columns
    pub fn empty(name: impl Into<String>) -> Self {
        Self::new(name, Vec::new(), Vec::new())
    }

    /// Number of rows
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Column names in order
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Recompute column types and the row count after rows changed
    pub fn refresh_schema(&mut self) {
        for (idx, column) in self.columns.iter_mut().enumerate() {
            column.dtype = ColumnType::infer(self.rows.iter().filter_map(|row| row.get(idx)));
        }
        self.metadata.row_count = self.rows.len();
    }

    /// Append a column holding the same value in every row
    pub fn add_constant_column(&mut self, name: &str, value: Value) {
        if let Some(idx) = self.column_index(name) {
            for row in &mut self.rows {
                row[idx] = value.clone();
            }
        } else {
            self.columns
                .push(ColumnSchema::new(name, ColumnType::of(&value)));
            for row in &mut self.rows {
                row.push(value.clone());
            }
        }
        self.refresh_schema();
    }

    /// Rows as JSON objects keyed by column name
    pub fn records(&self) -> Vec<Map<String, Value>> {
        self.rows
            .iter()
            .map(|row| {
                self.columns
                    .iter()
                    .zip(row)
                    .map(|(c, v)| (c.name.clone(), v.clone()))
                    .collect()
            })
            .collect()
    }

    /// Value of a cell by row index and column name
    pub fn cell(&self, row: usize, column: &str) -> Option<&Value> {
        let idx = self.column_index(column)?;
        self.rows.get(row).and_then(|r| r.get(idx))
    }

    /// Copy with at most `limit` rows
    pub fn head(&self, limit: usize) -> Self {
        let mut table = self.clone();
        table.rows.truncate(limit);
        table.refresh_schema();
        table
    }

    /// Append the rows of another table, unioning columns by name
    pub fn append(&mut self, other: &ExtractedTable) {
        let name = self.name.clone();
        let mut builder = TableBuilder::from_table(std::mem::replace(self, Self::empty(&name)));
        for record in other.records() {
            builder.push_map(&record);
        }
        for file in &other.metadata.source_files {
            builder.add_source(file.clone());
        }
        if let Some((start, end)) = other.metadata.chunk_range {
            builder.add_chunk(start);
            builder.add_chunk(end);
        }
        builder
            .warnings
            .extend(other.validation_warnings.iter().cloned());
        *self = builder.finish(&name);
    }
}

/// Incrementally builds a rectangular table from keyed records
///
/// Column order is first-seen order; rows missing a column get `null`.
#[derive(Debug, Default)]
pub struct TableBuilder {
    columns: Vec<String>,
    index: HashMap<String, usize>,
    rows: Vec<Vec<Value>>,
    metadata: TableMetadata,
    warnings: Vec<ValidationWarning>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a builder with an existing table
    pub fn from_table(table: ExtractedTable) -> Self {
        let columns = table.column_names();
        let index = columns
            .iter()
            .enumerate()
            .map(|(i, c)| (c.clone(), i))
            .collect();
        Self {
            columns,
            index,
            rows: table.rows,
            metadata: table.metadata,
            warnings: table.validation_warnings,
        }
    }

    /// Make sure a column exists, returning its index
    pub fn ensure_column(&mut self, name: &str) -> usize {
        if let Some(&idx) = self.index.get(name) {
            return idx;
        }
        let idx = self.columns.len();
        self.columns.push(name.to_string());
        self.index.insert(name.to_string(), idx);
        for row in &mut self.rows {
            row.push(Value::Null);
        }
        idx
    }

    /// Append one row given as ordered key/value pairs
    pub fn push_record(&mut self, fields: Vec<(String, Value)>) {
        for (key, _) in &fields {
            self.ensure_column(key);
        }
        let mut row = vec![Value::Null; self.columns.len()];
        for (key, value) in fields {
            row[self.index[&key]] = value;
        }
        self.rows.push(row);
    }

    /// Append one row given as a JSON object
    pub fn push_map(&mut self, record: &Map<String, Value>) {
        self.push_record(
            record
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
        );
    }

    /// Record a contributing source file
    pub fn add_source(&mut self, file: impl Into<String>) {
        let file = file.into();
        if !self.metadata.source_files.contains(&file) {
            self.metadata.source_files.push(file);
        }
    }

    /// Set the source table (sheet) name
    pub fn source_table(&mut self, name: impl Into<String>) {
        self.metadata.source_table_name = name.into();
    }

    /// Widen the consumed chunk range
    pub fn add_chunk(&mut self, index: usize) {
        self.metadata.chunk_range = Some(match self.metadata.chunk_range {
            Some((start, end)) => (start.min(index), end.max(index)),
            None => (index, index),
        });
    }

    /// Number of rows so far
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Finish the table
    pub fn finish(self, name: &str) -> ExtractedTable {
        let mut table = ExtractedTable::new(name, self.columns, self.rows);
        let source_table_name = if self.metadata.source_table_name.is_empty() {
            name.to_string()
        } else {
            self.metadata.source_table_name
        };
        table.metadata = TableMetadata {
            source_table_name,
            source_files: self.metadata.source_files,
            chunk_range: self.metadata.chunk_range,
            row_count: table.rows.len(),
        };
        table.validation_warnings = self.warnings;
        table
    }
}

/// Adapter-level tabular view of a file: header plus rows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataFrame {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

impl DataFrame {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>) -> Self {
        Self { columns, rows }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Rows as JSON objects keyed by column name
    pub fn records(&self) -> Vec<Value> {
        self.rows
            .iter()
            .map(|row| {
                Value::Object(
                    self.columns
                        .iter()
                        .cloned()
                        .zip(row.iter().cloned())
                        .collect(),
                )
            })
            .collect()
    }

    /// Convert into an extracted table
    pub fn into_table(self, name: &str) -> ExtractedTable {
        ExtractedTable::new(name, self.columns, self.rows)
    }
}
