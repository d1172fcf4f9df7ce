//! Derived outputs: grouped aggregations and output joins

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};

use crate::error::{EngineError, EngineResult};
use crate::extraction::{JoinHow, JoinParams};
use crate::models::ExtractedTable;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggFunc {
    Count,
    Sum,
    Mean,
    Min,
    Max,
}

impl fmt::Display for AggFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Count => "count",
            Self::Sum => "sum",
            Self::Mean => "mean",
            Self::Min => "min",
            Self::Max => "max",
        };
        write!(f, "{name}")
    }
}

/// One aggregated output column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Metric {
    /// Source column; `count` without a column counts rows
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<String>,
    pub func: AggFunc,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

impl Metric {
    /// Output column name
    pub fn output_name(&self) -> String {
        match (&self.alias, &self.column) {
            (Some(alias), _) => alias.clone(),
            (None, Some(column)) => format!("{}_{column}", self.func),
            (None, None) => self.func.to_string(),
        }
    }
}

/// A grouped aggregation over a parse table or an output join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Aggregation {
    pub name: String,
    pub table: String,
    #[serde(default)]
    pub group_by: Vec<String>,
    pub metrics: Vec<Metric>,
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Running state for one metric of one group
#[derive(Debug, Default, Clone)]
struct Accumulator {
    count: usize,
    int_sum: Option<i64>,
    float_sum: f64,
    all_int: bool,
    min: Option<Value>,
    max: Option<Value>,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            int_sum: Some(0),
            all_int: true,
            ..Default::default()
        }
    }

    fn push(&mut self, value: &Value) -> Result<(), String> {
        if value.is_null() {
            return Ok(());
        }
        let Some(number) = value.as_f64() else {
            return Err(format!("{value} is not numeric"));
        };
        self.count += 1;
        self.float_sum += number;
        match value.as_i64() {
            Some(i) => self.int_sum = self.int_sum.and_then(|s| s.checked_add(i)),
            None => self.all_int = false,
        }
        let replace = |current: &Option<Value>, better: fn(f64, f64) -> bool| {
            current
                .as_ref()
                .and_then(Value::as_f64)
                .is_none_or(|c| better(number, c))
        };
        if replace(&self.min, |n, c| n < c) {
            self.min = Some(value.clone());
        }
        if replace(&self.max, |n, c| n > c) {
            self.max = Some(value.clone());
        }
        Ok(())
    }

    fn finish(&self, func: AggFunc, rows: usize, counts_rows: bool) -> Value {
        match func {
            AggFunc::Count if counts_rows => Value::from(rows),
            AggFunc::Count => Value::from(self.count),
            AggFunc::Sum => match self.int_sum {
                Some(sum) if self.all_int => Value::from(sum),
                _ => float(self.float_sum),
            },
            AggFunc::Mean if self.count == 0 => Value::Null,
            AggFunc::Mean => float(self.float_sum / self.count as f64),
            AggFunc::Min => self.min.clone().unwrap_or(Value::Null),
            AggFunc::Max => self.max.clone().unwrap_or(Value::Null),
        }
    }
}

impl Aggregation {
    /// Group rows in first-seen order and compute every metric
    pub fn apply(&self, table: &ExtractedTable) -> EngineResult<ExtractedTable> {
        let failure = |message: String| EngineError::ValidationFailure {
            table: self.name.clone(),
            failures: vec![message],
        };
        let column = |name: &str| {
            table
                .column_index(name)
                .ok_or_else(|| failure(format!("column '{name}' not found in '{}'", table.name)))
        };

        let keys = self
            .group_by
            .iter()
            .map(|c| column(c))
            .collect::<EngineResult<Vec<_>>>()?;
        let sources = self
            .metrics
            .iter()
            .map(|m| match (&m.column, m.func) {
                (None, AggFunc::Count) => Ok(None),
                (None, func) => Err(failure(format!("{func} needs a column"))),
                (Some(c), _) => column(c).map(Some),
            })
            .collect::<EngineResult<Vec<_>>>()?;

        let mut index: HashMap<String, usize> = HashMap::new();
        let mut groups: Vec<(Vec<Value>, usize, Vec<Accumulator>)> = Vec::new();
        for row in &table.rows {
            let key: Vec<Value> = keys
                .iter()
                .map(|&i| row.get(i).cloned().unwrap_or(Value::Null))
                .collect();
            let slot = *index
                .entry(Value::Array(key.clone()).to_string())
                .or_insert_with(|| {
                    groups.push((key, 0, vec![Accumulator::new(); sources.len()]));
                    groups.len() - 1
                });
            let (_, rows, accumulators) = &mut groups[slot];
            *rows += 1;
            for (acc, source) in accumulators.iter_mut().zip(&sources) {
                if let Some(i) = source {
                    acc.push(row.get(*i).unwrap_or(&Value::Null))
                        .map_err(|e| failure(format!("column '{}': {e}", table.columns[*i].name)))?;
                }
            }
        }

        let mut columns = self.group_by.clone();
        columns.extend(self.metrics.iter().map(Metric::output_name));
        let rows = groups
            .into_iter()
            .map(|(mut key, rows, accumulators)| {
                let per_metric = self.metrics.iter().zip(&sources).zip(&accumulators);
                for ((metric, source), acc) in per_metric {
                    key.push(acc.finish(metric.func, rows, source.is_none()));
                }
                key
            })
            .collect();
        let mut output = ExtractedTable::new(&self.name, columns, rows);
        output.metadata.source_table_name = table.name.clone();
        output.metadata.source_files = table.metadata.source_files.clone();
        Ok(output)
    }
}

fn default_suffix() -> String {
    "_right".to_string()
}

/// A join computed at export time from parse tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct OutputJoin {
    pub name: String,
    pub left: String,
    pub right: String,
    pub on: String,
    #[serde(default)]
    pub how: JoinHow,
    #[serde(default = "default_suffix")]
    pub right_suffix: String,
}

impl OutputJoin {
    pub fn params(&self) -> JoinParams {
        JoinParams {
            left: self.left.clone(),
            right: self.right.clone(),
            on: self.on.clone(),
            how: self.how,
            right_suffix: self.right_suffix.clone(),
        }
    }

    pub fn apply(
        &self,
        left: &ExtractedTable,
        right: &ExtractedTable,
    ) -> EngineResult<ExtractedTable> {
        self.params().join(left, right, &self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn measurements() -> ExtractedTable {
        ExtractedTable::new(
            "measurements",
            vec!["lot".into(), "value".into()],
            vec![
                vec![json!("A"), json!(1)],
                vec![json!("B"), json!(10)],
                vec![json!("A"), json!(3)],
                vec![json!("A"), Value::Null],
            ],
        )
    }

    #[test]
    fn test_group_by_metrics() {
        let aggregation: Aggregation = serde_yaml::from_str(
            r#"
name: per_lot
table: measurements
group_by: [lot]
metrics:
  - func: count
  - {column: value, func: count}
  - {column: value, func: sum}
  - {column: value, func: mean, alias: avg}
  - {column: value, func: min}
  - {column: value, func: max}
"#,
        )
        .unwrap();
        let output = aggregation.apply(&measurements()).unwrap();
        assert_eq!(
            output.column_names(),
            vec!["lot", "count", "count_value", "sum_value", "avg", "min_value", "max_value"]
        );
        assert_eq!(
            output.rows[0],
            vec![json!("A"), json!(3), json!(2), json!(4), json!(2.0), json!(1), json!(3)]
        );
        assert_eq!(output.rows[1][0], json!("B"));
        assert_eq!(output.row_count(), 2);
    }

    #[test]
    fn test_no_group_by_is_one_row() {
        let aggregation = Aggregation {
            name: "total".into(),
            table: "measurements".into(),
            group_by: vec![],
            metrics: vec![Metric {
                column: Some("value".into()),
                func: AggFunc::Sum,
                alias: None,
            }],
        };
        let output = aggregation.apply(&measurements()).unwrap();
        assert_eq!(output.rows, vec![vec![json!(14)]]);
    }

    #[test]
    fn test_errors() {
        let missing = Aggregation {
            name: "x".into(),
            table: "measurements".into(),
            group_by: vec!["nope".into()],
            metrics: vec![],
        };
        assert!(matches!(
            missing.apply(&measurements()),
            Err(EngineError::ValidationFailure { .. })
        ));
        let text = Aggregation {
            name: "x".into(),
            table: "measurements".into(),
            group_by: vec![],
            metrics: vec![Metric {
                column: Some("lot".into()),
                func: AggFunc::Sum,
                alias: None,
            }],
        };
        assert!(text.apply(&measurements()).is_err());
    }

    #[test]
    fn test_output_join() {
        let left = ExtractedTable::new(
            "l",
            vec!["id".into()],
            vec![vec![json!(1)], vec![json!(2)]],
        );
        let right = ExtractedTable::new(
            "r",
            vec!["id".into(), "v".into()],
            vec![vec![json!(2), json!("b")]],
        );
        let join = OutputJoin {
            name: "lr".into(),
            left: "l".into(),
            right: "r".into(),
            on: "id".into(),
            how: JoinHow::Inner,
            right_suffix: default_suffix(),
        };
        let joined = join.apply(&left, &right).unwrap();
        assert_eq!(joined.name, "lr");
        assert_eq!(joined.rows, vec![vec![json!(2), json!("b")]]);
    }
}
