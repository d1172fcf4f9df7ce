//! Strategy selection and typed strategy parameters

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The six table-shaping strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    FlatObject,
    HeadersData,
    ArrayOfObjects,
    RepeatOver,
    Unpivot,
    Join,
}

impl StrategyKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FlatObject => "flat_object",
            Self::HeadersData => "headers_data",
            Self::ArrayOfObjects => "array_of_objects",
            Self::RepeatOver => "repeat_over",
            Self::Unpivot => "unpivot",
            Self::Join => "join",
        }
    }
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for StrategyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "flat_object" => Ok(Self::FlatObject),
            "headers_data" => Ok(Self::HeadersData),
            "array_of_objects" => Ok(Self::ArrayOfObjects),
            "repeat_over" => Ok(Self::RepeatOver),
            "unpivot" => Ok(Self::Unpivot),
            "join" => Ok(Self::Join),
            _ => Err(format!("Unknown strategy: {}", s)),
        }
    }
}

/// A strategy together with its validated parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "strategy", content = "strategy_params", rename_all = "snake_case")]
pub enum StrategyType {
    FlatObject(FlatObjectParams),
    HeadersData(HeadersDataParams),
    ArrayOfObjects(ArrayOfObjectsParams),
    RepeatOver(RepeatOverParams),
    Unpivot(UnpivotParams),
    Join(JoinParams),
}

impl StrategyType {
    /// Parse raw parameters for a strategy kind
    ///
    /// Unknown fields are rejected so that a typo in a profile fails before
    /// execution instead of silently falling back to a default.
    pub fn from_params(kind: StrategyKind, params: &Value) -> Result<Self, String> {
        let params = match params {
            Value::Null => Value::Object(Default::default()),
            other => other.clone(),
        };
        let parsed = match kind {
            StrategyKind::FlatObject => serde_json::from_value(params).map(Self::FlatObject),
            StrategyKind::HeadersData => serde_json::from_value(params).map(Self::HeadersData),
            StrategyKind::ArrayOfObjects => {
                serde_json::from_value(params).map(Self::ArrayOfObjects)
            }
            StrategyKind::RepeatOver => serde_json::from_value(params).map(Self::RepeatOver),
            StrategyKind::Unpivot => serde_json::from_value(params).map(Self::Unpivot),
            StrategyKind::Join => serde_json::from_value(params).map(Self::Join),
        };
        let strategy = parsed.map_err(|e| format!("{} parameters: {}", kind, e))?;
        strategy.check()?;
        Ok(strategy)
    }

    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::FlatObject(_) => StrategyKind::FlatObject,
            Self::HeadersData(_) => StrategyKind::HeadersData,
            Self::ArrayOfObjects(_) => StrategyKind::ArrayOfObjects,
            Self::RepeatOver(_) => StrategyKind::RepeatOver,
            Self::Unpivot(_) => StrategyKind::Unpivot,
            Self::Join(_) => StrategyKind::Join,
        }
    }

    /// Previously extracted tables this strategy reads
    pub fn depends_on(&self) -> Vec<&str> {
        match self {
            Self::Join(p) => vec![p.left.as_str(), p.right.as_str()],
            Self::Unpivot(p) => p.source.as_deref().into_iter().collect(),
            Self::FlatObject(_)
            | Self::HeadersData(_)
            | Self::ArrayOfObjects(_)
            | Self::RepeatOver(_) => Vec::new(),
        }
    }

    /// Whether the strategy consumes file records
    pub fn reads_files(&self) -> bool {
        self.depends_on().is_empty()
    }

    /// Sheet requested by the strategy, if any
    pub fn sheet(&self) -> Option<&str> {
        match self {
            Self::FlatObject(p) => p.sheet.as_deref(),
            Self::HeadersData(p) => p.sheet.as_deref(),
            Self::ArrayOfObjects(p) => p.sheet.as_deref(),
            Self::Unpivot(p) => p.sheet.as_deref(),
            Self::RepeatOver(_) | Self::Join(_) => None,
        }
    }

    /// Path into each document the strategy reads from, if any
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::FlatObject(p) => p.path.as_deref(),
            Self::HeadersData(p) => p.path.as_deref(),
            Self::ArrayOfObjects(p) => p.path.as_deref(),
            Self::RepeatOver(p) => p.root.as_deref().or(Some(p.path.as_str())),
            Self::Unpivot(p) => p.path.as_deref(),
            Self::Join(_) => None,
        }
    }

    /// Cross-field checks serde cannot express
    fn check(&self) -> Result<(), String> {
        match self {
            Self::RepeatOver(p) if p.path.trim().is_empty() => {
                Err("repeat_over requires a non-empty 'path'".to_string())
            }
            Self::Unpivot(p) if p.variable_column == p.value_column => {
                Err("unpivot variable_column and value_column must differ".to_string())
            }
            Self::Unpivot(p) if p.value_columns.iter().any(|c| p.id_columns.contains(c)) => {
                Err("unpivot value_columns overlap id_columns".to_string())
            }
            Self::Join(p) if p.on.trim().is_empty() => {
                Err("join requires a non-empty 'on' key".to_string())
            }
            Self::Join(p) if p.left == p.right => {
                Err("join left and right tables must differ".to_string())
            }
            _ => Ok(()),
        }
    }
}

fn default_separator() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_variable() -> String {
    "variable".to_string()
}

fn default_value() -> String {
    "value".to_string()
}

fn default_suffix() -> String {
    "_right".to_string()
}

/// One record becomes one row, nested objects flattened
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlatObjectParams {
    /// Path to the record(s) inside each document
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default = "default_separator")]
    pub separator: String,
    /// Nesting depth beyond which objects are kept as JSON text
    #[serde(default)]
    pub max_depth: Option<usize>,
}

/// A header row names the columns of the rows that follow it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HeadersDataParams {
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    /// Zero-based index of the header record
    #[serde(default)]
    pub header_row: usize,
    #[serde(default = "default_true")]
    pub skip_blank_rows: bool,
}

/// An array of homogeneous objects becomes rows directly
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArrayOfObjectsParams {
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub sheet: Option<String>,
}

/// One row per element of a nested array, siblings broadcast
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RepeatOverParams {
    /// Path of the array to iterate, relative to each record
    pub path: String,
    /// Sibling fields copied onto every emitted row; empty means all scalars
    #[serde(default)]
    pub broadcast: Vec<String>,
    /// Prefix for element fields
    #[serde(default)]
    pub prefix: Option<String>,
    /// Path to the record(s) holding the array
    #[serde(default)]
    pub root: Option<String>,
    /// Emit one row of siblings when the array is missing or empty
    #[serde(default)]
    pub keep_empty: bool,
}

/// Wide-to-long reshape
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UnpivotParams {
    /// Previously extracted table to reshape; file records when absent
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub sheet: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
    pub id_columns: Vec<String>,
    /// Columns to melt; every non-id column when empty
    #[serde(default)]
    pub value_columns: Vec<String>,
    #[serde(default = "default_variable")]
    pub variable_column: String,
    #[serde(default = "default_value")]
    pub value_column: String,
    #[serde(default)]
    pub drop_nulls: bool,
}

/// Join kind
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinHow {
    #[default]
    Inner,
    Left,
    Outer,
}

impl std::fmt::Display for JoinHow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inner => "inner",
            Self::Left => "left",
            Self::Outer => "outer",
        };
        write!(f, "{name}")
    }
}

/// Combine two previously extracted tables
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct JoinParams {
    pub left: String,
    pub right: String,
    pub on: String,
    #[serde(default)]
    pub how: JoinHow,
    /// Suffix for right-side columns that clash with left-side names
    #[serde(default = "default_suffix")]
    pub right_suffix: String,
}
