//! Row expressions for calculated columns and filters
//!
//! Expressions use SQL scalar syntax and are parsed with `sqlparser`. Only a
//! pure subset is evaluated: column references, literals, arithmetic,
//! comparisons, `AND`/`OR`/`NOT`, `IS [NOT] NULL` and the functions `abs`,
//! `round`, `lower`, `upper`, `concat`, `coalesce` and `len`. Column names
//! with spaces or dots can be quoted as `"meta.tool"`.

use serde_json::{Number, Value};
use sqlparser::ast::{
    BinaryOperator, Expr, FunctionArg, FunctionArgExpr, FunctionArguments, UnaryOperator,
    Value as SqlValue,
};
use sqlparser::dialect::GenericDialect;
use sqlparser::parser::Parser;
use sqlparser::tokenizer::Token;
use thiserror::Error;

use crate::error::EngineError;
use crate::models::ExtractedTable;

/// Errors raised while parsing or evaluating an expression
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("cannot parse '{source_text}': {message}")]
    Parse {
        source_text: String,
        message: String,
    },

    #[error("unsupported construct: {0}")]
    Unsupported(String),

    #[error("unknown column '{0}'")]
    UnknownColumn(String),

    #[error("unknown function '{0}'")]
    UnknownFunction(String),

    #[error("{name}() takes {expected} argument(s), got {found}")]
    Arity {
        name: String,
        expected: &'static str,
        found: usize,
    },

    #[error("type error: {0}")]
    Type(String),
}

impl From<ExprError> for EngineError {
    fn from(err: ExprError) -> Self {
        EngineError::Expression(err.to_string())
    }
}

const FUNCTIONS: &[(&str, usize, usize)] = &[
    ("abs", 1, 1),
    ("round", 1, 2),
    ("lower", 1, 1),
    ("upper", 1, 1),
    ("len", 1, 1),
    ("concat", 1, usize::MAX),
    ("coalesce", 1, usize::MAX),
];

fn arity_text(min: usize, max: usize) -> &'static str {
    match (min, max) {
        (1, 1) => "1",
        (1, 2) => "1 or 2",
        _ => "at least 1",
    }
}

/// A parsed, checked expression
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    ast: Expr,
    columns: Vec<String>,
}

impl Expression {
    /// Parse and check an expression
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let parse_error = |message: String| ExprError::Parse {
            source_text: source.to_string(),
            message,
        };
        let dialect = GenericDialect {};
        let mut parser = Parser::new(&dialect)
            .try_with_sql(source)
            .map_err(|e| parse_error(e.to_string()))?;
        let ast = parser.parse_expr().map_err(|e| parse_error(e.to_string()))?;
        let trailing = parser.peek_token();
        if trailing.token != Token::EOF {
            return Err(parse_error(format!("unexpected '{}'", trailing.token)));
        }

        let mut columns = Vec::new();
        collect(&ast, &mut columns)?;
        Ok(Self {
            source: source.to_string(),
            ast,
            columns,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Column names referenced, in first-use order
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Fail when the expression reads a column the table does not have
    pub fn check_columns(&self, table: &ExtractedTable) -> Result<(), ExprError> {
        match self
            .columns
            .iter()
            .find(|c| table.column_index(c).is_none())
        {
            Some(missing) => Err(ExprError::UnknownColumn(missing.clone())),
            None => Ok(()),
        }
    }

    /// Evaluate against one row of a table
    pub fn evaluate(&self, table: &ExtractedTable, row: usize) -> Result<Value, ExprError> {
        let lookup = |name: &str| -> Result<Value, ExprError> {
            table
                .cell(row, name)
                .cloned()
                .ok_or_else(|| ExprError::UnknownColumn(name.to_string()))
        };
        eval(&self.ast, &lookup)
    }
}

fn column_name(expr: &Expr) -> Option<String> {
    match expr {
        Expr::Identifier(ident) => Some(ident.value.clone()),
        Expr::CompoundIdentifier(parts) => Some(
            parts
                .iter()
                .map(|p| p.value.as_str())
                .collect::<Vec<_>>()
                .join("."),
        ),
        _ => None,
    }
}

fn function_args(args: &FunctionArguments) -> Result<Vec<&Expr>, ExprError> {
    match args {
        FunctionArguments::None => Ok(Vec::new()),
        FunctionArguments::List(list) => list
            .args
            .iter()
            .map(|arg| match arg {
                FunctionArg::Unnamed(FunctionArgExpr::Expr(e)) => Ok(e),
                other => Err(ExprError::Unsupported(other.to_string())),
            })
            .collect(),
        _ => Err(ExprError::Unsupported("subquery arguments".to_string())),
    }
}

/// Walk the tree, rejecting anything outside the supported subset
fn collect(expr: &Expr, columns: &mut Vec<String>) -> Result<(), ExprError> {
    if let Some(name) = column_name(expr) {
        if !columns.contains(&name) {
            columns.push(name);
        }
        return Ok(());
    }
    match expr {
        Expr::Value(_) => Ok(()),
        Expr::Nested(inner) | Expr::IsNull(inner) | Expr::IsNotNull(inner) => {
            collect(inner, columns)
        }
        Expr::UnaryOp { op, expr } => match op {
            UnaryOperator::Not | UnaryOperator::Minus | UnaryOperator::Plus => {
                collect(expr, columns)
            }
            other => Err(ExprError::Unsupported(format!("operator {other}"))),
        },
        Expr::BinaryOp { left, op, right } => {
            binary_supported(op)?;
            collect(left, columns)?;
            collect(right, columns)
        }
        Expr::Function(function) => {
            let name = function.name.to_string().to_lowercase();
            let args = function_args(&function.args)?;
            let (_, min, max) = FUNCTIONS
                .iter()
                .find(|(n, _, _)| *n == name)
                .ok_or_else(|| ExprError::UnknownFunction(name.clone()))?;
            if args.len() < *min || args.len() > *max {
                return Err(ExprError::Arity {
                    expected: arity_text(*min, *max),
                    found: args.len(),
                    name,
                });
            }
            args.into_iter().try_for_each(|arg| collect(arg, columns))
        }
        other => Err(ExprError::Unsupported(other.to_string())),
    }
}

fn binary_supported(op: &BinaryOperator) -> Result<(), ExprError> {
    match op {
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo
        | BinaryOperator::Eq
        | BinaryOperator::NotEq
        | BinaryOperator::Lt
        | BinaryOperator::LtEq
        | BinaryOperator::Gt
        | BinaryOperator::GtEq
        | BinaryOperator::And
        | BinaryOperator::Or => Ok(()),
        other => Err(ExprError::Unsupported(format!("operator {other}"))),
    }
}

fn literal(value: &SqlValue) -> Result<Value, ExprError> {
    match value {
        SqlValue::Number(text, _) => {
            if let Ok(i) = text.parse::<i64>() {
                Ok(Value::from(i))
            } else {
                text.parse::<f64>()
                    .ok()
                    .and_then(Number::from_f64)
                    .map(Value::Number)
                    .ok_or_else(|| ExprError::Type(format!("invalid number {text}")))
            }
        }
        SqlValue::SingleQuotedString(s) | SqlValue::DoubleQuotedString(s) => {
            Ok(Value::String(s.clone()))
        }
        SqlValue::Boolean(b) => Ok(Value::Bool(*b)),
        SqlValue::Null => Ok(Value::Null),
        other => Err(ExprError::Unsupported(other.to_string())),
    }
}

fn float(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

fn text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// SQL-style truthiness: only `true` passes a filter
pub fn is_truthy(value: &Value) -> bool {
    matches!(value, Value::Bool(true))
}

fn as_bool(value: &Value) -> Result<Option<bool>, ExprError> {
    match value {
        Value::Null => Ok(None),
        Value::Bool(b) => Ok(Some(*b)),
        other => Err(ExprError::Type(format!("expected a boolean, found {other}"))),
    }
}

fn as_number(value: &Value, op: &str) -> Result<f64, ExprError> {
    value
        .as_f64()
        .ok_or_else(|| ExprError::Type(format!("'{op}' needs numbers, found {value}")))
}

fn eval(
    expr: &Expr,
    lookup: &dyn Fn(&str) -> Result<Value, ExprError>,
) -> Result<Value, ExprError> {
    if let Some(name) = column_name(expr) {
        return lookup(&name);
    }
    match expr {
        Expr::Value(v) => literal(&v.value),
        Expr::Nested(inner) => eval(inner, lookup),
        Expr::IsNull(inner) => Ok(Value::Bool(eval(inner, lookup)?.is_null())),
        Expr::IsNotNull(inner) => Ok(Value::Bool(!eval(inner, lookup)?.is_null())),
        Expr::UnaryOp { op, expr } => {
            let value = eval(expr, lookup)?;
            match op {
                UnaryOperator::Not => Ok(as_bool(&value)?.map_or(Value::Null, |b| Value::Bool(!b))),
                UnaryOperator::Minus => match &value {
                    Value::Null => Ok(Value::Null),
                    Value::Number(n) if n.is_i64() => match n.as_i64().and_then(i64::checked_neg) {
                        Some(i) => Ok(Value::from(i)),
                        None => Ok(float(-as_number(&value, "-")?)),
                    },
                    v => Ok(float(-as_number(v, "-")?)),
                },
                UnaryOperator::Plus => Ok(value),
                other => Err(ExprError::Unsupported(format!("operator {other}"))),
            }
        }
        Expr::BinaryOp { left, op, right } => {
            // Short-circuit logic keeps three-valued semantics
            match op {
                BinaryOperator::And => {
                    let l = as_bool(&eval(left, lookup)?)?;
                    if l == Some(false) {
                        return Ok(Value::Bool(false));
                    }
                    let r = as_bool(&eval(right, lookup)?)?;
                    return Ok(match (l, r) {
                        (_, Some(false)) => Value::Bool(false),
                        (Some(true), Some(true)) => Value::Bool(true),
                        _ => Value::Null,
                    });
                }
                BinaryOperator::Or => {
                    let l = as_bool(&eval(left, lookup)?)?;
                    if l == Some(true) {
                        return Ok(Value::Bool(true));
                    }
                    let r = as_bool(&eval(right, lookup)?)?;
                    return Ok(match (l, r) {
                        (_, Some(true)) => Value::Bool(true),
                        (Some(false), Some(false)) => Value::Bool(false),
                        _ => Value::Null,
                    });
                }
                _ => {}
            }
            let l = eval(left, lookup)?;
            let r = eval(right, lookup)?;
            binary(op, &l, &r)
        }
        Expr::Function(function) => {
            let name = function.name.to_string().to_lowercase();
            let args = function_args(&function.args)?
                .into_iter()
                .map(|arg| eval(arg, lookup))
                .collect::<Result<Vec<_>, _>>()?;
            call(&name, args)
        }
        other => Err(ExprError::Unsupported(other.to_string())),
    }
}

fn arithmetic(op: &BinaryOperator, l: &Value, r: &Value) -> Result<Value, ExprError> {
    let symbol = op.to_string();
    if let (Some(a), Some(b)) = (l.as_i64(), r.as_i64()) {
        let exact = match op {
            BinaryOperator::Plus => a.checked_add(b),
            BinaryOperator::Minus => a.checked_sub(b),
            BinaryOperator::Multiply => a.checked_mul(b),
            BinaryOperator::Modulo if b != 0 => a.checked_rem(b),
            _ => None,
        };
        if let Some(v) = exact {
            return Ok(Value::from(v));
        }
    }
    let (a, b) = (as_number(l, &symbol)?, as_number(r, &symbol)?);
    let result = match op {
        BinaryOperator::Plus => a + b,
        BinaryOperator::Minus => a - b,
        BinaryOperator::Multiply => a * b,
        BinaryOperator::Divide if b == 0.0 => return Ok(Value::Null),
        BinaryOperator::Divide => a / b,
        BinaryOperator::Modulo if b == 0.0 => return Ok(Value::Null),
        BinaryOperator::Modulo => a % b,
        other => return Err(ExprError::Unsupported(format!("operator {other}"))),
    };
    Ok(float(result))
}

fn compare(l: &Value, r: &Value) -> Result<Option<std::cmp::Ordering>, ExprError> {
    match (l, r) {
        (Value::Number(_), Value::Number(_)) => Ok(l
            .as_f64()
            .zip(r.as_f64())
            .and_then(|(a, b)| a.partial_cmp(&b))),
        (Value::String(a), Value::String(b)) => Ok(Some(a.cmp(b))),
        (Value::Bool(a), Value::Bool(b)) => Ok(Some(a.cmp(b))),
        _ => Err(ExprError::Type(format!("cannot compare {l} with {r}"))),
    }
}

fn binary(op: &BinaryOperator, l: &Value, r: &Value) -> Result<Value, ExprError> {
    if l.is_null() || r.is_null() {
        return Ok(Value::Null);
    }
    match op {
        BinaryOperator::Plus
        | BinaryOperator::Minus
        | BinaryOperator::Multiply
        | BinaryOperator::Divide
        | BinaryOperator::Modulo => arithmetic(op, l, r),
        BinaryOperator::Eq | BinaryOperator::NotEq => {
            let equal = match compare(l, r) {
                Ok(ordering) => ordering == Some(std::cmp::Ordering::Equal),
                Err(_) => false,
            };
            Ok(Value::Bool(equal == (*op == BinaryOperator::Eq)))
        }
        BinaryOperator::Lt | BinaryOperator::LtEq | BinaryOperator::Gt | BinaryOperator::GtEq => {
            let Some(ordering) = compare(l, r)? else {
                return Ok(Value::Null);
            };
            use std::cmp::Ordering::*;
            let result = match op {
                BinaryOperator::Lt => ordering == Less,
                BinaryOperator::LtEq => ordering != Greater,
                BinaryOperator::Gt => ordering == Greater,
                _ => ordering != Less,
            };
            Ok(Value::Bool(result))
        }
        other => Err(ExprError::Unsupported(format!("operator {other}"))),
    }
}

fn call(name: &str, args: Vec<Value>) -> Result<Value, ExprError> {
    match name {
        "coalesce" => Ok(args.into_iter().find(|v| !v.is_null()).unwrap_or(Value::Null)),
        "concat" => Ok(Value::String(
            args.iter().filter(|v| !v.is_null()).map(text).collect(),
        )),
        _ => {
            let value = args.first().cloned().unwrap_or(Value::Null);
            if value.is_null() {
                return Ok(Value::Null);
            }
            match name {
                "abs" => match value.as_i64() {
                    Some(i) => Ok(i
                        .checked_abs()
                        .map_or_else(|| float((i as f64).abs()), Value::from)),
                    None => Ok(float(as_number(&value, "abs")?.abs())),
                },
                "round" => {
                    let digits = match args.get(1) {
                        Some(d) => d.as_i64().ok_or_else(|| {
                            ExprError::Type("round() digits must be an integer".to_string())
                        })?,
                        None => 0,
                    };
                    if value.is_i64() && digits >= 0 {
                        return Ok(value);
                    }
                    let factor = 10f64.powi(digits as i32);
                    let rounded = (as_number(&value, "round")? * factor).round() / factor;
                    if digits <= 0 && rounded.abs() < i64::MAX as f64 {
                        Ok(Value::from(rounded as i64))
                    } else {
                        Ok(float(rounded))
                    }
                }
                "lower" => Ok(Value::String(text(&value).to_lowercase())),
                "upper" => Ok(Value::String(text(&value).to_uppercase())),
                "len" => match &value {
                    Value::Array(items) => Ok(Value::from(items.len())),
                    other => Ok(Value::from(text(other).chars().count())),
                },
                other => Err(ExprError::UnknownFunction(other.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn table() -> ExtractedTable {
        ExtractedTable::new(
            "t",
            vec!["a".into(), "b".into(), "tag".into(), "meta.tool".into()],
            vec![
                vec![json!(6), json!(4), json!("Wafer"), json!("T1")],
                vec![json!(1.5), Value::Null, json!(" x "), Value::Null],
            ],
        )
    }

    fn eval_at(source: &str, row: usize) -> Value {
        Expression::parse(source).unwrap().evaluate(&table(), row).unwrap()
    }

    #[test]
    fn test_arithmetic_and_precedence() {
        assert_eq!(eval_at("a + b * 2", 0), json!(14));
        assert_eq!(eval_at("(a + b) / 4", 0), json!(2.5));
        assert_eq!(eval_at("a % 4", 0), json!(2));
        assert_eq!(eval_at("-a", 0), json!(-6));
        assert_eq!(eval_at("a / 0", 0), Value::Null);
        assert_eq!(eval_at("a + b", 1), Value::Null);
    }

    #[test]
    fn test_comparisons_and_logic() {
        assert_eq!(eval_at("a > b AND tag = 'Wafer'", 0), json!(true));
        assert_eq!(eval_at("a < b OR NOT (b = 4)", 0), json!(false));
        assert_eq!(eval_at("b > 1", 1), Value::Null);
        assert_eq!(eval_at("b > 1 OR a > 1", 1), json!(true));
        assert_eq!(eval_at("b IS NULL", 1), json!(true));
        assert!(is_truthy(&eval_at("a >= 6", 0)));
        assert!(!is_truthy(&eval_at("b > 1", 1)));
    }

    #[test]
    fn test_functions() {
        assert_eq!(eval_at("abs(-a)", 0), json!(6));
        assert_eq!(eval_at("round(a / 4, 1)", 0), json!(1.5));
        assert_eq!(eval_at("round(a / 4)", 0), json!(2));
        assert_eq!(eval_at("lower(tag)", 0), json!("wafer"));
        assert_eq!(eval_at("upper(tag)", 0), json!("WAFER"));
        assert_eq!(eval_at("concat(tag, '-', a)", 0), json!("Wafer-6"));
        assert_eq!(eval_at("coalesce(b, a)", 1), json!(1.5));
        assert_eq!(eval_at("len(tag)", 1), json!(3));
        assert_eq!(eval_at("\"meta.tool\"", 0), json!("T1"));
    }

    #[test]
    fn test_columns_and_rejections() {
        let expr = Expression::parse("a + coalesce(b, a)").unwrap();
        assert_eq!(expr.columns(), &["a".to_string(), "b".to_string()]);
        assert!(expr.check_columns(&table()).is_ok());

        let missing = Expression::parse("c * 2").unwrap();
        assert_eq!(
            missing.check_columns(&table()),
            Err(ExprError::UnknownColumn("c".into()))
        );

        assert!(matches!(
            Expression::parse("sqrt(a)"),
            Err(ExprError::UnknownFunction(_))
        ));
        assert!(matches!(
            Expression::parse("abs(a, b)"),
            Err(ExprError::Arity { .. })
        ));
        assert!(matches!(
            Expression::parse("a +"),
            Err(ExprError::Parse { .. })
        ));
        assert!(Expression::parse("(SELECT 1)").is_err());
    }

    #[test]
    fn test_type_error() {
        let expr = Expression::parse("tag * 2").unwrap();
        assert!(matches!(expr.evaluate(&table(), 0), Err(ExprError::Type(_))));
    }
}
