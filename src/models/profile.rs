//! Extraction profile model
//!
//! A profile is the declarative document that drives a run: where files come
//! from, how each table is shaped, how context values are resolved and what
//! is written at the end. Profiles are read-only once loaded; a new version is
//! a new profile.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{EngineError, EngineResult};
use crate::extraction::{StrategyKind, StrategyType};
use crate::identity::canonical_json;
use crate::models::FileFormat;
use crate::transform::{Aggregation, Constraint, OutputJoin, TransformStep};

/// Whether a name can be used as-is for an artifact file or directory
///
/// Only ASCII letters, digits, `_`, `.` and `-` are allowed, and never `..`.
pub fn is_artifact_name(name: &str) -> bool {
    !name.is_empty()
        && !name.contains("..")
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

fn check_artifact_name(what: &str, name: &str) -> EngineResult<()> {
    if is_artifact_name(name) {
        return Ok(());
    }
    Err(EngineError::InvalidProfile(format!(
        "{what} '{name}' may only use letters, digits, '_', '.' and '-', and not '..'"
    )))
}

fn default_schema_version() -> String {
    "1".to_string()
}

fn default_version() -> String {
    "1".to_string()
}

/// Accept `version: 2` as well as `version: "2"`
fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected a string or number, found {other}"
        ))),
    }
}

/// A versioned extraction profile
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionProfile {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default = "default_schema_version", deserialize_with = "string_or_number")]
    pub schema_version: String,
    #[serde(default = "default_version", deserialize_with = "string_or_number")]
    pub version: String,
    #[serde(default)]
    pub datasource: DataSource,
    #[serde(default)]
    pub population: Population,
    #[serde(default)]
    pub context: ContextSpec,
    pub tables: Vec<TableConfig>,
    #[serde(default)]
    pub transforms: Vec<TransformStep>,
    #[serde(default)]
    pub validation: ValidationSpec,
    #[serde(default)]
    pub output: OutputSpec,
    #[serde(default)]
    pub governance: Governance,
}

/// Where source files come from
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataSource {
    /// Restrict discovery to one format; any supported format when absent
    #[serde(default)]
    pub format: Option<FileFormat>,
    #[serde(default)]
    pub filters: SourceFilters,
}

/// File filters applied during discovery
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceFilters {
    /// Glob patterns relative to the source root; everything when empty
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Regex the file name must match
    #[serde(default)]
    pub name_pattern: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Population {
    #[serde(default)]
    pub default_strategy: StrategyKind,
}

/// Context resolution rules and defaults
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSpec {
    #[serde(default)]
    pub rules: Vec<ContextRule>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
}

impl ContextSpec {
    /// Every key named by a rule or a default, in first-seen order
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = Vec::new();
        let names = self
            .rules
            .iter()
            .map(|r| &r.key)
            .chain(self.defaults.keys());
        for key in names {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }
        keys
    }
}

/// Kind of extraction a context rule performs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleKind {
    /// Path lookup into parsed content
    Jsonpath,
    /// Pattern match against a file name or raw text
    Regex,
}

/// What a regex rule is matched against
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchTarget {
    #[default]
    Filename,
    Content,
}

/// Post-processing applied to an extracted context value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueTransform {
    Int,
    Float,
    Upper,
    Lower,
    Strip,
}

/// Behaviour when a rule produces no value
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFail {
    /// Continue with lower-priority levels
    #[default]
    SkipKey,
    /// Go straight to the declared default
    UseDefault,
    /// Abort context resolution
    FailRun,
}

fn default_group() -> usize {
    1
}

/// One context extraction rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextRule {
    pub key: String,
    #[serde(rename = "type")]
    pub kind: RuleKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub target: MatchTarget,
    /// Capture group to take; 0 is the whole match
    #[serde(default = "default_group")]
    pub group: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<ValueTransform>,
    #[serde(default)]
    pub on_fail: OnFail,
}

/// Severity of a schema-stability mismatch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    #[default]
    Warn,
    Error,
}

/// How a table reacts to a file-level failure
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorPolicy {
    /// Record a diagnostic and continue with the next file
    #[default]
    SkipFile,
    /// Fail the stage
    FailRun,
}

/// One target table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Falls back to `population.default_strategy`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<StrategyKind>,
    #[serde(default)]
    pub strategy_params: Value,
    /// Context keys appended as constant columns
    #[serde(default)]
    pub context_columns: Vec<String>,
    /// Per-table override of the schema-stability severity
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stable_columns: Option<Severity>,
    #[serde(default)]
    pub on_error: ErrorPolicy,
}

/// Schema-stability check settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StableColumns {
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub severity: Severity,
}

fn default_enabled() -> bool {
    true
}

impl Default for StableColumns {
    fn default() -> Self {
        Self {
            enabled: true,
            severity: Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationSpec {
    #[serde(default)]
    pub stable_columns: StableColumns,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// Output table format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Parquet,
    Csv,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Parquet => "parquet",
            Self::Csv => "csv",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    #[serde(default)]
    pub format: OutputFormat,
    /// Tables to export; every parsed table when empty
    #[serde(default)]
    pub default_outputs: Vec<String>,
    #[serde(default)]
    pub aggregations: Vec<Aggregation>,
    #[serde(default)]
    pub joins: Vec<OutputJoin>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Governance {
    #[serde(default)]
    pub limits: Limits,
}

/// Discovery limits; `None` means unlimited
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(default)]
    pub max_files: Option<usize>,
    #[serde(default)]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub max_total_size: Option<u64>,
}

impl ExtractionProfile {
    /// Load a profile from a YAML or JSON file
    pub fn from_path(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Err(EngineError::not_found("profile", path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let extension = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or("")
            .to_lowercase();
        match extension.as_str() {
            "json" => Self::from_json_str(&content),
            "yaml" | "yml" => Self::from_yaml_str(&content),
            other => Err(EngineError::InvalidProfile(format!(
                "unsupported profile extension '{other}' for {}",
                path.display()
            ))),
        }
    }

    /// Parse and validate a YAML profile
    pub fn from_yaml_str(content: &str) -> EngineResult<Self> {
        let profile: Self = serde_yaml::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Parse and validate a JSON profile
    pub fn from_json_str(content: &str) -> EngineResult<Self> {
        let profile: Self = serde_json::from_str(content)?;
        profile.validate()?;
        Ok(profile)
    }

    /// Catalog key, `id@version`
    pub fn key(&self) -> String {
        format!("{}@{}", self.id, self.version)
    }

    /// SHA-256 of the canonical profile document
    pub fn digest(&self) -> EngineResult<String> {
        let value = serde_json::to_value(self)?;
        let mut hasher = Sha256::new();
        hasher.update(canonical_json(&value).as_bytes());
        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Look up a table by name
    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Names of all declared tables in order
    pub fn table_names(&self) -> Vec<String> {
        self.tables.iter().map(|t| t.name.clone()).collect()
    }

    /// Resolve the typed strategy of a table
    pub fn strategy_for(&self, table: &TableConfig) -> EngineResult<StrategyType> {
        let kind = table.strategy.unwrap_or(self.population.default_strategy);
        StrategyType::from_params(kind, &table.strategy_params).map_err(|reason| {
            EngineError::InvalidStrategyParams {
                table: table.name.clone(),
                reason,
            }
        })
    }

    /// Effective schema-stability severity for a table, `None` when disabled
    pub fn stability_severity(&self, table: &TableConfig) -> Option<Severity> {
        if !self.validation.stable_columns.enabled {
            return None;
        }
        Some(
            table
                .stable_columns
                .unwrap_or(self.validation.stable_columns.severity),
        )
    }

    /// Check the profile is structurally valid
    ///
    /// Every strategy payload is parsed, dependent tables must be declared
    /// before the tables that read them, and every pattern and expression
    /// must compile.
    pub fn validate(&self) -> EngineResult<()> {
        if self.id.trim().is_empty() {
            return Err(EngineError::InvalidProfile("id must not be empty".to_string()));
        }
        check_artifact_name("id", &self.id)?;
        if self.tables.is_empty() {
            return Err(EngineError::InvalidProfile(
                "at least one table is required".to_string(),
            ));
        }

        let mut declared: HashSet<&str> = HashSet::new();
        for table in &self.tables {
            if table.name.trim().is_empty() {
                return Err(EngineError::InvalidProfile(
                    "table name must not be empty".to_string(),
                ));
            }
            check_artifact_name("table", &table.name)?;
            if !declared.insert(table.name.as_str()) {
                return Err(EngineError::InvalidProfile(format!(
                    "duplicate table '{}'",
                    table.name
                )));
            }
            let strategy = self.strategy_for(table)?;
            for dependency in strategy.depends_on() {
                if dependency == table.name || !declared.contains(dependency) {
                    return Err(EngineError::InvalidStrategyParams {
                        table: table.name.clone(),
                        reason: format!("'{dependency}' must be a table declared earlier"),
                    });
                }
            }
        }

        for rule in &self.context.rules {
            self.validate_rule(rule)?;
        }

        for step in &self.transforms {
            step.validate()
                .map_err(|e| EngineError::InvalidProfile(format!("transform: {e}")))?;
            if let Some(scope) = step.table.as_deref() {
                if !declared.contains(scope) {
                    return Err(EngineError::InvalidProfile(format!(
                        "transform scoped to unknown table '{scope}'"
                    )));
                }
            }
        }
        for constraint in &self.validation.constraints {
            constraint
                .validate()
                .map_err(|e| EngineError::InvalidProfile(format!("constraint: {e}")))?;
        }

        for name in &self.output.default_outputs {
            if !declared.contains(name.as_str()) {
                return Err(EngineError::InvalidProfile(format!(
                    "default output '{name}' is not a declared table"
                )));
            }
        }
        let mut outputs = declared.clone();
        for join in &self.output.joins {
            for side in [&join.left, &join.right] {
                if !outputs.contains(side.as_str()) {
                    return Err(EngineError::InvalidProfile(format!(
                        "output join '{}' reads unknown table '{side}'",
                        join.name
                    )));
                }
            }
            check_artifact_name("output join", &join.name)?;
            if !outputs.insert(join.name.as_str()) {
                return Err(EngineError::InvalidProfile(format!(
                    "output join '{}' shadows another table",
                    join.name
                )));
            }
        }
        for aggregation in &self.output.aggregations {
            if !outputs.contains(aggregation.table.as_str()) {
                return Err(EngineError::InvalidProfile(format!(
                    "aggregation '{}' reads unknown table '{}'",
                    aggregation.name, aggregation.table
                )));
            }
            check_artifact_name("aggregation", &aggregation.name)?;
            if !outputs.insert(aggregation.name.as_str()) {
                return Err(EngineError::InvalidProfile(format!(
                    "aggregation '{}' shadows another table",
                    aggregation.name
                )));
            }
        }

        if let Some(pattern) = &self.datasource.filters.name_pattern {
            Regex::new(pattern).map_err(|e| {
                EngineError::InvalidProfile(format!("name_pattern '{pattern}': {e}"))
            })?;
        }
        for pattern in self
            .datasource
            .filters
            .include
            .iter()
            .chain(&self.datasource.filters.exclude)
        {
            glob::Pattern::new(pattern)
                .map_err(|e| EngineError::InvalidProfile(format!("glob '{pattern}': {e}")))?;
        }
        Ok(())
    }

    fn validate_rule(&self, rule: &ContextRule) -> EngineResult<()> {
        if rule.key.trim().is_empty() {
            return Err(EngineError::InvalidProfile(
                "context rule key must not be empty".to_string(),
            ));
        }
        match rule.kind {
            RuleKind::Jsonpath => {
                if rule.path.as_deref().map(str::trim).unwrap_or("").is_empty() {
                    return Err(EngineError::InvalidProfile(format!(
                        "jsonpath rule '{}' requires a path",
                        rule.key
                    )));
                }
            }
            RuleKind::Regex => {
                let pattern = rule.pattern.as_deref().ok_or_else(|| {
                    EngineError::InvalidProfile(format!(
                        "regex rule '{}' requires a pattern",
                        rule.key
                    ))
                })?;
                let regex = Regex::new(pattern).map_err(|e| {
                    EngineError::InvalidProfile(format!("rule '{}': {e}", rule.key))
                })?;
                if rule.group >= regex.captures_len() {
                    return Err(EngineError::InvalidProfile(format!(
                        "rule '{}' asks for group {} but the pattern has {}",
                        rule.key,
                        rule.group,
                        regex.captures_len() - 1
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const PROFILE: &str = r#"
id: wafer-scan
version: 3
datasource:
  format: json
  filters:
    include: ["**/*.json"]
population:
  default_strategy: flat_object
context:
  rules:
    - key: lot_id
      type: regex
      pattern: 'LOT(\d+)'
    - key: tool
      type: jsonpath
      path: meta.tool
  defaults:
    site: fab1
tables:
  - name: images
    strategy: repeat_over
    strategy_params:
      path: images
      broadcast: [wafer]
    context_columns: [lot_id]
  - name: summary
"#;

    #[test]
    fn test_parse_yaml_profile() {
        let profile = ExtractionProfile::from_yaml_str(PROFILE).unwrap();
        assert_eq!(profile.key(), "wafer-scan@3");
        assert_eq!(profile.schema_version, "1");
        assert_eq!(profile.datasource.format, Some(FileFormat::Json));
        assert_eq!(profile.context.rules[0].group, 1);
        assert_eq!(profile.context.rules[0].on_fail, OnFail::SkipKey);
        assert_eq!(profile.context.keys(), vec!["lot_id", "tool", "site"]);

        let summary = profile.table("summary").unwrap();
        assert_eq!(
            profile.strategy_for(summary).unwrap().kind(),
            StrategyKind::FlatObject
        );
    }

    #[test]
    fn test_invalid_strategy_params_rejected() {
        let yaml = PROFILE.replace("path: images", "paht: images");
        let err = ExtractionProfile::from_yaml_str(&yaml).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidStrategyParams { ref table, .. } if table == "images"
        ));
    }

    #[test]
    fn test_join_must_follow_its_inputs() {
        let yaml = r#"
id: p
tables:
  - name: joined
    strategy: join
    strategy_params: {left: a, right: b, on: id}
  - name: a
  - name: b
"#;
        assert!(matches!(
            ExtractionProfile::from_yaml_str(yaml),
            Err(EngineError::InvalidStrategyParams { .. })
        ));
    }

    #[test]
    fn test_regex_group_out_of_range() {
        let yaml = r#"
id: p
context:
  rules:
    - key: lot
      type: regex
      pattern: 'LOT\d+'
tables:
  - name: t
"#;
        assert!(matches!(
            ExtractionProfile::from_yaml_str(yaml),
            Err(EngineError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_names_must_be_safe_file_names() {
        assert!(is_artifact_name("images_per-wafer.v2"));
        for name in ["", "..", "../../escaped", "a/b", "a\\b", "with space"] {
            assert!(!is_artifact_name(name), "{name:?} accepted");
        }

        let escaping = PROFILE.replace("name: summary", "name: ../../../escaped");
        assert!(matches!(
            ExtractionProfile::from_yaml_str(&escaping),
            Err(EngineError::InvalidProfile(_))
        ));
        let bad_id = PROFILE.replace("id: wafer-scan", "id: ../up");
        assert!(matches!(
            ExtractionProfile::from_yaml_str(&bad_id),
            Err(EngineError::InvalidProfile(_))
        ));

        let join = r#"
output:
  joins:
    - name: ../joined
      left: images
      right: summary
      on: wafer
"#;
        assert!(matches!(
            ExtractionProfile::from_yaml_str(&format!("{PROFILE}{join}")),
            Err(EngineError::InvalidProfile(_))
        ));
    }

    #[test]
    fn test_output_names_may_not_shadow_tables() {
        let aggregation = r#"
output:
  aggregations:
    - name: summary
      table: images
      group_by: [wafer]
      metrics:
        - func: count
          alias: n
"#;
        assert!(matches!(
            ExtractionProfile::from_yaml_str(&format!("{PROFILE}{aggregation}")),
            Err(EngineError::InvalidProfile(_))
        ));
        let renamed = aggregation.replace("name: summary", "name: per_wafer");
        assert!(ExtractionProfile::from_yaml_str(&format!("{PROFILE}{renamed}")).is_ok());
    }

    #[test]
    fn test_stability_severity_override() {
        let yaml = r#"
id: p
validation:
  stable_columns:
    severity: error
tables:
  - name: a
  - name: b
    stable_columns: warn
"#;
        let profile = ExtractionProfile::from_yaml_str(yaml).unwrap();
        assert_eq!(
            profile.stability_severity(profile.table("a").unwrap()),
            Some(Severity::Error)
        );
        assert_eq!(
            profile.stability_severity(profile.table("b").unwrap()),
            Some(Severity::Warn)
        );
    }

    #[test]
    fn test_from_path_json_and_digest() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("profile.json");
        std::fs::write(&path, r#"{"id": "p", "version": "2", "tables": [{"name": "t"}]}"#).unwrap();

        let profile = ExtractionProfile::from_path(&path).unwrap();
        assert_eq!(profile.key(), "p@2");
        assert_eq!(profile.digest().unwrap(), profile.clone().digest().unwrap());
        assert!(ExtractionProfile::from_path(&dir.path().join("missing.yaml")).is_err());
    }
}
