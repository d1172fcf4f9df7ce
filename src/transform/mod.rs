//! Validation and transform pipeline
//!
//! Steps run in declared order on every extracted table: `rename`,
//! `calculate`, `filter` and `coerce_numeric`. A step scoped to a table must
//! find the columns it names; an unscoped step is skipped for tables that
//! lack them. The constraint pass runs last and only adds warnings.

pub mod aggregate;
pub mod constraints;
pub mod expr;

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::{ColumnSchema, ColumnType, ExtractedTable};

pub use aggregate::{AggFunc, Aggregation, Metric, OutputJoin};
pub use constraints::{Constraint, MAX_WARNINGS_PER_CONSTRAINT, apply_constraints};
pub use expr::{ExprError, Expression, is_truthy};

fn default_nan_tokens() -> Vec<String> {
    ["", "nan", "na", "n/a", "null", "none", "-", "#n/a", "#div/0!"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

/// One transform operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TransformOp {
    /// Rename columns, old name to new name
    Rename { mapping: BTreeMap<String, String> },
    /// Add or replace a column computed from the row
    Calculate { column: String, expr: String },
    /// Keep rows where the predicate is true
    Filter { expr: String },
    /// Parse numeric text; tokens matching `nan_tokens` (case-insensitive)
    /// and unparseable text become `replacement`
    CoerceNumeric {
        columns: Vec<String>,
        #[serde(default = "default_nan_tokens")]
        nan_tokens: Vec<String>,
        #[serde(default)]
        replacement: Value,
    },
}

/// A transform step, optionally scoped to one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransformStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(flatten)]
    pub op: TransformOp,
}

impl TransformStep {
    pub fn name(&self) -> &'static str {
        match self.op {
            TransformOp::Rename { .. } => "rename",
            TransformOp::Calculate { .. } => "calculate",
            TransformOp::Filter { .. } => "filter",
            TransformOp::CoerceNumeric { .. } => "coerce_numeric",
        }
    }

    /// Structural check, run during profile validation
    pub fn validate(&self) -> Result<(), String> {
        if self.table.as_deref().is_some_and(|t| t.trim().is_empty()) {
            return Err("table scope must not be empty".to_string());
        }
        match &self.op {
            TransformOp::Rename { mapping } => {
                if mapping.is_empty() {
                    return Err("rename needs at least one mapping".to_string());
                }
                let mut targets = HashSet::new();
                for (from, to) in mapping {
                    if to.trim().is_empty() {
                        return Err(format!("rename of '{from}' has an empty target"));
                    }
                    if !targets.insert(to) {
                        return Err(format!("rename maps two columns to '{to}'"));
                    }
                }
                Ok(())
            }
            TransformOp::Calculate { column, expr } => {
                if column.trim().is_empty() {
                    return Err("calculate needs a column name".to_string());
                }
                Expression::parse(expr).map(|_| ()).map_err(|e| e.to_string())
            }
            TransformOp::Filter { expr } => {
                Expression::parse(expr).map(|_| ()).map_err(|e| e.to_string())
            }
            TransformOp::CoerceNumeric { columns, .. } => {
                if columns.is_empty() {
                    Err("coerce_numeric needs at least one column".to_string())
                } else {
                    Ok(())
                }
            }
        }
    }
}

/// A step with its expression parsed once
#[derive(Debug, Clone)]
enum CompiledOp {
    Rename(BTreeMap<String, String>),
    Calculate { column: String, expr: Expression },
    Filter(Expression),
    CoerceNumeric {
        columns: Vec<String>,
        nan_tokens: HashSet<String>,
        replacement: Value,
    },
}

#[derive(Debug, Clone)]
struct CompiledStep {
    table: Option<String>,
    name: &'static str,
    op: CompiledOp,
}

impl CompiledStep {
    fn compile(step: &TransformStep) -> EngineResult<Self> {
        let op = match &step.op {
            TransformOp::Rename { mapping } => CompiledOp::Rename(mapping.clone()),
            TransformOp::Calculate { column, expr } => CompiledOp::Calculate {
                column: column.clone(),
                expr: Expression::parse(expr)?,
            },
            TransformOp::Filter { expr } => CompiledOp::Filter(Expression::parse(expr)?),
            TransformOp::CoerceNumeric {
                columns,
                nan_tokens,
                replacement,
            } => CompiledOp::CoerceNumeric {
                columns: columns.clone(),
                nan_tokens: nan_tokens.iter().map(|t| t.trim().to_lowercase()).collect(),
                replacement: replacement.clone(),
            },
        };
        Ok(Self {
            table: step.table.clone(),
            name: step.name(),
            op,
        })
    }

    /// Columns the step reads
    fn required_columns(&self) -> Vec<&str> {
        match &self.op {
            CompiledOp::Rename(mapping) => mapping.keys().map(String::as_str).collect(),
            CompiledOp::Calculate { expr, .. } | CompiledOp::Filter(expr) => {
                expr.columns().iter().map(String::as_str).collect()
            }
            CompiledOp::CoerceNumeric { columns, .. } => {
                columns.iter().map(String::as_str).collect()
            }
        }
    }

    fn apply(&self, table: &mut ExtractedTable) -> EngineResult<bool> {
        let missing: Vec<&str> = self
            .required_columns()
            .into_iter()
            .filter(|c| table.column_index(c).is_none())
            .collect();
        match (&self.table, missing.is_empty()) {
            (Some(scope), _) if scope != &table.name => return Ok(false),
            (Some(_), false) => {
                return Err(EngineError::ValidationFailure {
                    table: table.name.clone(),
                    failures: missing
                        .iter()
                        .map(|c| format!("{}: column '{c}' not found", self.name))
                        .collect(),
                });
            }
            (None, false) => return Ok(false),
            _ => {}
        }

        match &self.op {
            CompiledOp::Rename(mapping) => rename(table, mapping)?,
            CompiledOp::Calculate { column, expr } => {
                let values = (0..table.row_count())
                    .map(|row| expr.evaluate(table, row))
                    .collect::<Result<Vec<_>, _>>()?;
                match table.column_index(column) {
                    Some(idx) => {
                        for (row, value) in table.rows.iter_mut().zip(values) {
                            row[idx] = value;
                        }
                    }
                    None => {
                        table
                            .columns
                            .push(ColumnSchema::new(column.as_str(), ColumnType::Null));
                        for (row, value) in table.rows.iter_mut().zip(values) {
                            row.push(value);
                        }
                    }
                }
            }
            CompiledOp::Filter(expr) => {
                let keep = (0..table.row_count())
                    .map(|row| expr.evaluate(table, row).map(|v| is_truthy(&v)))
                    .collect::<Result<Vec<_>, _>>()?;
                let mut keep = keep.into_iter();
                table.rows.retain(|_| keep.next().unwrap_or(false));
            }
            CompiledOp::CoerceNumeric {
                columns,
                nan_tokens,
                replacement,
            } => {
                for column in columns {
                    if let Some(idx) = table.column_index(column) {
                        for row in &mut table.rows {
                            row[idx] = coerce(&row[idx], nan_tokens, replacement);
                        }
                    }
                }
            }
        }
        table.refresh_schema();
        Ok(true)
    }
}

fn rename(table: &mut ExtractedTable, mapping: &BTreeMap<String, String>) -> EngineResult<()> {
    let renamed: HashSet<&str> = mapping.keys().map(String::as_str).collect();
    for target in mapping.values() {
        let clash = table
            .columns
            .iter()
            .any(|c| &c.name == target && !renamed.contains(c.name.as_str()));
        if clash {
            return Err(EngineError::ValidationFailure {
                table: table.name.clone(),
                failures: vec![format!("rename target '{target}' already exists")],
            });
        }
    }
    for column in &mut table.columns {
        if let Some(to) = mapping.get(&column.name) {
            column.name = to.clone();
        }
    }
    Ok(())
}

/// Coerce one cell to a number
pub fn coerce(value: &Value, nan_tokens: &HashSet<String>, replacement: &Value) -> Value {
    match value {
        Value::Number(_) | Value::Null => value.clone(),
        Value::Bool(b) => Value::from(u8::from(*b)),
        Value::String(s) => {
            let trimmed = s.trim();
            if nan_tokens.contains(&trimmed.to_lowercase()) {
                return replacement.clone();
            }
            let cleaned = trimmed.replace(',', "");
            if let Ok(i) = cleaned.parse::<i64>() {
                return Value::from(i);
            }
            match cleaned.parse::<f64>().ok().and_then(serde_json::Number::from_f64) {
                Some(n) => Value::Number(n),
                None => replacement.clone(),
            }
        }
        _ => replacement.clone(),
    }
}

/// Transform steps and constraints compiled for one profile
#[derive(Debug, Clone, Default)]
pub struct TransformPipeline {
    steps: Vec<CompiledStep>,
    constraints: Vec<Constraint>,
}

impl TransformPipeline {
    pub fn new(steps: &[TransformStep], constraints: &[Constraint]) -> EngineResult<Self> {
        Ok(Self {
            steps: steps.iter().map(CompiledStep::compile).collect::<EngineResult<_>>()?,
            constraints: constraints.to_vec(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.constraints.is_empty()
    }

    /// Run every step then the constraint pass
    pub fn run(&self, mut table: ExtractedTable) -> EngineResult<ExtractedTable> {
        for step in &self.steps {
            let rows_before = table.row_count();
            if step.apply(&mut table)? {
                debug!(
                    table = %table.name,
                    step = step.name,
                    rows_before,
                    rows_after = table.row_count(),
                    "Applied transform"
                );
            }
        }
        let warnings = apply_constraints(&mut table, &self.constraints);
        if warnings > 0 {
            debug!(table = %table.name, warnings, "Constraint violations recorded");
        }
        Ok(table)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table(name: &str) -> ExtractedTable {
        ExtractedTable::new(
            name,
            vec!["id".into(), "raw".into(), "w".into()],
            vec![
                vec![json!(1), json!("1,250.5"), json!(2)],
                vec![json!(2), json!("NaN"), json!(3)],
                vec![json!(3), json!("n/a"), json!(4)],
                vec![json!(4), json!("7"), json!(5)],
            ],
        )
    }

    fn steps(yaml: &str) -> Vec<TransformStep> {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn test_pipeline_in_order() {
        let steps = steps(
            r#"
- op: coerce_numeric
  columns: [raw]
  replacement: 0
- op: rename
  mapping: {raw: reading}
- op: calculate
  column: scaled
  expr: reading * w
- op: filter
  expr: scaled > 0
"#,
        );
        let pipeline = TransformPipeline::new(&steps, &[]).unwrap();
        let out = pipeline.run(table("t")).unwrap();
        assert_eq!(out.column_names(), vec!["id", "reading", "w", "scaled"]);
        assert_eq!(out.row_count(), 2);
        assert_eq!(out.cell(0, "reading"), Some(&json!(1250.5)));
        assert_eq!(out.cell(0, "scaled"), Some(&json!(2501.0)));
        assert_eq!(out.cell(1, "scaled"), Some(&json!(35)));
    }

    #[test]
    fn test_scoping() {
        let steps = steps(
            r#"
- op: filter
  table: other
  expr: id > 2
- op: calculate
  expr: missing + 1
  column: y
"#,
        );
        let pipeline = TransformPipeline::new(&steps, &[]).unwrap();
        // Scoped elsewhere, and unscoped with a missing column: both skipped
        let out = pipeline.run(table("t")).unwrap();
        assert_eq!(out.row_count(), 4);
        assert!(out.column_index("y").is_none());

        let scoped = steps_missing_column();
        let err = TransformPipeline::new(&scoped, &[])
            .unwrap()
            .run(table("t"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure { .. }));
    }

    fn steps_missing_column() -> Vec<TransformStep> {
        steps(
            r#"
- op: coerce_numeric
  table: t
  columns: [nope]
"#,
        )
    }

    #[test]
    fn test_rename_clash() {
        let clash = steps("- {op: rename, mapping: {raw: w}}");
        let err = TransformPipeline::new(&clash, &[])
            .unwrap()
            .run(table("t"))
            .unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure { .. }));

        // Swapping two names is allowed
        let swap = steps("- {op: rename, mapping: {raw: w, w: raw}}");
        let out = TransformPipeline::new(&swap, &[]).unwrap().run(table("t")).unwrap();
        assert_eq!(out.column_names(), vec!["id", "w", "raw"]);
    }

    #[test]
    fn test_coerce_defaults_to_null() {
        let tokens: HashSet<String> = default_nan_tokens().into_iter().collect();
        assert_eq!(coerce(&json!(" NaN "), &tokens, &Value::Null), Value::Null);
        assert_eq!(coerce(&json!("abc"), &tokens, &Value::Null), Value::Null);
        assert_eq!(coerce(&json!("-3"), &tokens, &Value::Null), json!(-3));
        assert_eq!(coerce(&json!(true), &tokens, &Value::Null), json!(1));
    }

    #[test]
    fn test_validate_steps() {
        let bad = steps("- {op: calculate, column: x, expr: 'sqrt(a)'}");
        assert!(bad[0].validate().is_err());
        let dup = steps("- {op: rename, mapping: {a: c, b: c}}");
        assert!(dup[0].validate().is_err());
        let ok = steps("- {op: filter, expr: 'a = 1', table: t}");
        assert!(ok[0].validate().is_ok());
        assert_eq!(ok[0].table.as_deref(), Some("t"));
    }

    #[test]
    fn test_constraints_run_after_steps() {
        let constraint = Constraint {
            column: "w".into(),
            max: Some(3.0),
            ..Default::default()
        };
        let out = TransformPipeline::new(&[], &[constraint])
            .unwrap()
            .run(table("t"))
            .unwrap();
        assert_eq!(out.validation_warnings.len(), 2);
        assert_eq!(out.row_count(), 4);
    }
}
