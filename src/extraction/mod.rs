//! Extraction strategy engine
//!
//! Turns adapter records into named tables. Record strategies run once per
//! document and their outputs are concatenated in declared file order;
//! `join` and sourced `unpivot` read tables extracted earlier in the same
//! stage.

pub mod params;
pub mod path;
pub mod strategies;

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;

use crate::adapters::RawDocument;
use crate::error::EngineResult;
use crate::models::{ColumnSchema, ColumnType, ExtractedTable, RunContext, ValidationWarning};

pub use params::{
    ArrayOfObjectsParams, FlatObjectParams, HeadersDataParams, JoinHow, JoinParams,
    RepeatOverParams, StrategyKind, StrategyType, UnpivotParams,
};
pub use strategies::{Strategy, flatten_record, repivot};

/// Tables extracted so far, by name
pub type TableSet = BTreeMap<String, Arc<ExtractedTable>>;

/// What a strategy reads
#[derive(Debug, Clone, Copy)]
pub enum StrategyInput<'a> {
    /// Records of one file
    Document(&'a RawDocument),
    /// Previously extracted tables
    Tables(&'a TableSet),
}

/// Apply a strategy, dispatching on its variant
pub fn extract_table(
    strategy: &StrategyType,
    input: StrategyInput<'_>,
    name: &str,
) -> EngineResult<ExtractedTable> {
    match strategy {
        StrategyType::FlatObject(p) => p.apply(input, name),
        StrategyType::HeadersData(p) => p.apply(input, name),
        StrategyType::ArrayOfObjects(p) => p.apply(input, name),
        StrategyType::RepeatOver(p) => p.apply(input, name),
        StrategyType::Unpivot(p) => p.apply(input, name),
        StrategyType::Join(p) => p.apply(input, name),
    }
}

/// Concatenate per-file parts in order; the schema is the first-seen union
pub fn concat_tables(name: &str, parts: Vec<ExtractedTable>) -> ExtractedTable {
    let mut parts = parts.into_iter();
    let Some(mut table) = parts.next() else {
        return ExtractedTable::empty(name);
    };
    for part in parts {
        table.append(&part);
    }
    table.name = name.to_string();
    table
}

/// Append context values as constant columns, null when a key is absent
pub fn append_context_columns(table: &mut ExtractedTable, keys: &[String], context: &RunContext) {
    for key in keys {
        let value = context.value(key).cloned().unwrap_or(Value::Null);
        table.add_constant_column(key, value);
    }
}

/// Differences between an emitted schema and the locked one, if any
///
/// Columns must match by name and order. Types must agree unless one side
/// only ever saw nulls.
pub fn schema_mismatch(current: &[ColumnSchema], locked: &[ColumnSchema]) -> Option<String> {
    let names = |schema: &[ColumnSchema]| schema.iter().map(|c| c.name.clone()).collect::<Vec<_>>();
    let (now, before) = (names(current), names(locked));
    if now != before {
        let added: Vec<&String> = now.iter().filter(|c| !before.contains(c)).collect();
        let removed: Vec<&String> = before.iter().filter(|c| !now.contains(c)).collect();
        return Some(if added.is_empty() && removed.is_empty() {
            "column order changed".to_string()
        } else {
            format!("added {added:?}, removed {removed:?}")
        });
    }
    let changed: Vec<String> = current
        .iter()
        .zip(locked)
        .filter(|(a, b)| {
            a.dtype != b.dtype && a.dtype != ColumnType::Null && b.dtype != ColumnType::Null
        })
        .map(|(a, b)| format!("{}: {:?} -> {:?}", a.name, b.dtype, a.dtype))
        .collect();
    if changed.is_empty() {
        None
    } else {
        Some(format!("type changed ({})", changed.join(", ")))
    }
}

/// Warning attached to a table kept despite a schema mismatch
pub fn stability_warning(table: &str, message: &str) -> ValidationWarning {
    ValidationWarning {
        table: table.to_string(),
        column: None,
        row: None,
        rule: "stable_columns".to_string(),
        message: format!("schema differs from locked schema: {message}"),
    }
}
