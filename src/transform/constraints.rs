//! Column constraints
//!
//! Constraint failures never abort a run. Each violation becomes a
//! [`ValidationWarning`] on the table; callers decide whether warnings are
//! fatal.

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{ExtractedTable, ValidationWarning};

/// Violations reported per constraint before the rest are summarized
pub const MAX_WARNINGS_PER_CONSTRAINT: usize = 100;

/// Rules for one column
///
/// Null cells are only checked by `not_null`. `pattern` is a search, anchor
/// it with `^...$` for a full match.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Constraint {
    pub column: String,
    /// Restrict to one table; every table with the column when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub not_null: bool,
}

impl Constraint {
    /// Structural check, run during profile validation
    pub fn validate(&self) -> Result<(), String> {
        if self.column.trim().is_empty() {
            return Err("column must not be empty".to_string());
        }
        if self.min.is_none()
            && self.max.is_none()
            && self.allowed.is_none()
            && self.pattern.is_none()
            && !self.not_null
        {
            return Err(format!("constraint on '{}' declares no rule", self.column));
        }
        if let (Some(min), Some(max)) = (self.min, self.max) {
            if min > max {
                return Err(format!(
                    "constraint on '{}' has min {min} above max {max}",
                    self.column
                ));
            }
        }
        if let Some(pattern) = &self.pattern {
            Regex::new(pattern).map_err(|e| format!("pattern on '{}': {e}", self.column))?;
        }
        Ok(())
    }

    /// Whether this constraint applies to a table
    pub fn applies_to(&self, table: &str) -> bool {
        self.table.as_deref().is_none_or(|t| t == table)
    }

    fn violation(&self, value: &Value, pattern: Option<&Regex>) -> Option<(&'static str, String)> {
        if value.is_null() {
            return self
                .not_null
                .then(|| ("not_null", "value is null".to_string()));
        }
        if self.min.is_some() || self.max.is_some() {
            let Some(number) = value.as_f64() else {
                return Some(("range", format!("{value} is not numeric")));
            };
            if let Some(min) = self.min.filter(|min| number < *min) {
                return Some(("min", format!("{value} is below minimum {min}")));
            }
            if let Some(max) = self.max.filter(|max| number > *max) {
                return Some(("max", format!("{value} is above maximum {max}")));
            }
        }
        if let Some(allowed) = &self.allowed {
            if !allowed.contains(value) {
                return Some(("allowed", format!("{value} is not an allowed value")));
            }
        }
        if let Some(regex) = pattern {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            if !regex.is_match(&text) {
                return Some(("pattern", format!("'{text}' does not match {}", regex.as_str())));
            }
        }
        None
    }

    /// Check every row, returning warnings
    pub fn check(&self, table: &ExtractedTable) -> Vec<ValidationWarning> {
        let warning = |row: Option<usize>, rule: &str, message: String| ValidationWarning {
            table: table.name.clone(),
            column: Some(self.column.clone()),
            row,
            rule: rule.to_string(),
            message,
        };

        let Some(idx) = table.column_index(&self.column) else {
            return vec![warning(
                None,
                "missing_column",
                format!("column '{}' not found", self.column),
            )];
        };
        // validate() has already rejected bad patterns
        let pattern = self.pattern.as_deref().and_then(|p| Regex::new(p).ok());

        let mut warnings = Vec::new();
        let mut suppressed = 0usize;
        for (row, values) in table.rows.iter().enumerate() {
            let value = values.get(idx).unwrap_or(&Value::Null);
            if let Some((rule, message)) = self.violation(value, pattern.as_ref()) {
                if warnings.len() < MAX_WARNINGS_PER_CONSTRAINT {
                    warnings.push(warning(Some(row), rule, message));
                } else {
                    suppressed += 1;
                }
            }
        }
        if suppressed > 0 {
            warnings.push(warning(
                None,
                "truncated",
                format!("{suppressed} further violations not listed"),
            ));
        }
        warnings
    }
}

/// Run every applicable constraint and attach the warnings to the table
pub fn apply_constraints(table: &mut ExtractedTable, constraints: &[Constraint]) -> usize {
    let warnings: Vec<ValidationWarning> = constraints
        .iter()
        .filter(|c| c.applies_to(&table.name))
        .flat_map(|c| c.check(table))
        .collect();
    let count = warnings.len();
    table.validation_warnings.extend(warnings);
    count
}
