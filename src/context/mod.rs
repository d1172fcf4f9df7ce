//! Context resolution
//!
//! Each context key is resolved through four levels, highest priority first:
//! a user override, a path lookup into parsed content, a regex over a file
//! name or raw text, and finally the declared default. The first level that
//! yields a value wins. A key with no value and no default is left out of
//! the [`RunContext`] entirely.

use std::collections::BTreeMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tracing::debug;

use crate::adapters::RawDocument;
use crate::error::{EngineError, EngineResult};
use crate::extraction::path;
use crate::models::{
    ContextRule, ContextSpec, ContextValue, MatchTarget, OnFail, Provenance, RuleKind, RunContext,
    ValueTransform,
};

static INTEGER_PREFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[+-]?\d+").expect("valid regex"));

/// A selected file as seen by the resolver
///
/// `document` is `None` when only file names are needed or the file could
/// not be read; content rules then skip it.
#[derive(Debug, Clone)]
pub struct ContextDocument {
    pub file_name: String,
    pub document: Option<RawDocument>,
}

impl ContextDocument {
    pub fn named(file_name: impl Into<String>) -> Self {
        Self {
            file_name: file_name.into(),
            document: None,
        }
    }

    pub fn loaded(document: RawDocument) -> Self {
        Self {
            file_name: document.file_name.clone(),
            document: Some(document),
        }
    }
}

/// Apply a value transform; `None` when the value cannot be converted
pub fn apply_transform(value: Value, transform: Option<ValueTransform>) -> Option<Value> {
    let Some(transform) = transform else {
        return Some(value);
    };
    let text = match &value {
        Value::String(s) => s.clone(),
        Value::Null => return None,
        other => other.to_string(),
    };
    match transform {
        ValueTransform::Int => {
            let trimmed = text.trim();
            if let Ok(i) = trimmed.parse::<i64>() {
                return Some(Value::from(i));
            }
            match trimmed.parse::<f64>() {
                Ok(f) if f.fract() == 0.0 => Some(Value::from(f as i64)),
                _ => INTEGER_PREFIX
                    .find(trimmed)
                    .and_then(|m| m.as_str().parse::<i64>().ok())
                    .map(Value::from),
            }
        }
        ValueTransform::Float => text
            .trim()
            .parse::<f64>()
            .ok()
            .and_then(serde_json::Number::from_f64)
            .map(Value::Number),
        ValueTransform::Upper => Some(Value::String(text.to_uppercase())),
        ValueTransform::Lower => Some(Value::String(text.to_lowercase())),
        ValueTransform::Strip => Some(Value::String(text.trim().to_string())),
    }
}

/// Resolves context keys against overrides, documents and defaults
#[derive(Debug)]
pub struct ContextResolver<'a> {
    spec: &'a ContextSpec,
}

/// Outcome of evaluating one cascade level
enum LevelOutcome {
    Found(ContextValue),
    Continue,
    UseDefault,
}

impl<'a> ContextResolver<'a> {
    pub fn new(spec: &'a ContextSpec) -> Self {
        Self { spec }
    }

    /// Whether any rule needs parsed file content
    pub fn needs_content(&self) -> bool {
        self.spec
            .rules
            .iter()
            .any(|r| r.kind == RuleKind::Jsonpath || r.target == MatchTarget::Content)
    }

    /// Resolve every key named by a rule, a default or an override
    ///
    /// Documents are consulted in the given order.
    pub fn resolve(
        &self,
        overrides: &BTreeMap<String, Value>,
        documents: &[ContextDocument],
    ) -> EngineResult<RunContext> {
        let mut keys = self.spec.keys();
        for key in overrides.keys() {
            if !keys.contains(key) {
                keys.push(key.clone());
            }
        }

        let mut context = RunContext::new();
        for key in keys {
            if let Some(value) = self.resolve_key(&key, overrides, documents)? {
                debug!(key = %key, provenance = %value.provenance, "Resolved context key");
                context.insert(key, value);
            } else {
                debug!(key = %key, "Context key left unresolved");
            }
        }
        Ok(context)
    }

    /// Context built from declared defaults alone
    ///
    /// Used when a run skips the context stage; no rule is evaluated.
    pub fn defaults(&self) -> RunContext {
        let mut context = RunContext::new();
        for (key, value) in &self.spec.defaults {
            context.insert(
                key.clone(),
                ContextValue {
                    value: value.clone(),
                    provenance: Provenance::Default,
                    source: None,
                },
            );
        }
        context
    }

    fn resolve_key(
        &self,
        key: &str,
        overrides: &BTreeMap<String, Value>,
        documents: &[ContextDocument],
    ) -> EngineResult<Option<ContextValue>> {
        if let Some(value) = overrides.get(key) {
            return Ok(Some(ContextValue {
                value: value.clone(),
                provenance: Provenance::Override,
                source: None,
            }));
        }

        let rules: Vec<&ContextRule> = self.spec.rules.iter().filter(|r| r.key == key).collect();
        let mut jump_to_default = false;
        'levels: for kind in [RuleKind::Jsonpath, RuleKind::Regex] {
            for rule in rules.iter().filter(|r| r.kind == kind) {
                match self.evaluate(rule, documents)? {
                    LevelOutcome::Found(value) => return Ok(Some(value)),
                    LevelOutcome::Continue => {}
                    LevelOutcome::UseDefault => {
                        jump_to_default = true;
                        break 'levels;
                    }
                }
            }
        }
        if jump_to_default {
            debug!(key, "Rule failed with use_default");
        }

        Ok(self.spec.defaults.get(key).map(|value| ContextValue {
            value: value.clone(),
            provenance: Provenance::Default,
            source: None,
        }))
    }

    fn evaluate(
        &self,
        rule: &ContextRule,
        documents: &[ContextDocument],
    ) -> EngineResult<LevelOutcome> {
        let found = match rule.kind {
            RuleKind::Jsonpath => Self::by_path(rule, documents),
            RuleKind::Regex => Self::by_pattern(rule, documents)?,
        };
        if let Some(value) = found {
            return Ok(LevelOutcome::Found(value));
        }
        match rule.on_fail {
            OnFail::SkipKey => Ok(LevelOutcome::Continue),
            OnFail::UseDefault => Ok(LevelOutcome::UseDefault),
            OnFail::FailRun => Err(EngineError::ContextResolution {
                key: rule.key.clone(),
                reason: match rule.kind {
                    RuleKind::Jsonpath => format!(
                        "path '{}' matched no document",
                        rule.path.as_deref().unwrap_or_default()
                    ),
                    RuleKind::Regex => format!(
                        "pattern '{}' matched no {}",
                        rule.pattern.as_deref().unwrap_or_default(),
                        match rule.target {
                            MatchTarget::Filename => "file name",
                            MatchTarget::Content => "file content",
                        }
                    ),
                },
            }),
        }
    }

    fn by_path(rule: &ContextRule, documents: &[ContextDocument]) -> Option<ContextValue> {
        let expression = rule.path.as_deref()?;
        documents.iter().find_map(|entry| {
            let document = entry.document.as_ref()?;
            let value = path::lookup(&document.content, expression)?;
            if value.is_null() {
                return None;
            }
            let value = apply_transform(value.clone(), rule.transform)?;
            Some(ContextValue {
                value,
                provenance: Provenance::Jsonpath,
                source: Some(entry.file_name.clone()),
            })
        })
    }

    fn by_pattern(
        rule: &ContextRule,
        documents: &[ContextDocument],
    ) -> EngineResult<Option<ContextValue>> {
        let pattern = rule.pattern.as_deref().unwrap_or_default();
        let regex = Regex::new(pattern).map_err(|e| EngineError::ContextResolution {
            key: rule.key.clone(),
            reason: format!("invalid pattern '{pattern}': {e}"),
        })?;
        for entry in documents {
            let haystack = match rule.target {
                MatchTarget::Filename => Some(entry.file_name.clone()),
                MatchTarget::Content => entry.document.as_ref().map(|d| match &d.text {
                    Some(text) => text.clone(),
                    None => d.content.to_string(),
                }),
            };
            let Some(haystack) = haystack else { continue };
            let Some(captured) = regex
                .captures(&haystack)
                .and_then(|caps| caps.get(rule.group))
                .map(|m| m.as_str().to_string())
            else {
                continue;
            };
            if let Some(value) = apply_transform(Value::String(captured), rule.transform) {
                return Ok(Some(ContextValue {
                    value,
                    provenance: Provenance::Regex,
                    source: Some(entry.file_name.clone()),
                }));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FileFormat;
    use serde_json::json;
    use std::path::Path;

    fn rule(key: &str, kind: RuleKind) -> ContextRule {
        ContextRule {
            key: key.to_string(),
            kind,
            path: None,
            pattern: None,
            target: MatchTarget::Filename,
            group: 1,
            transform: None,
            on_fail: OnFail::SkipKey,
        }
    }

    fn lot_rule() -> ContextRule {
        ContextRule {
            pattern: Some(r"LOT(\d+)".to_string()),
            ..rule("lot_id", RuleKind::Regex)
        }
    }

    #[test]
    fn test_defaults_only_skips_rules() {
        let mut defaults = BTreeMap::new();
        defaults.insert("site".to_string(), json!("fab1"));
        let spec = ContextSpec {
            rules: vec![ContextRule {
                on_fail: OnFail::FailRun,
                ..lot_rule()
            }],
            defaults,
        };
        let context = ContextResolver::new(&spec).defaults();
        assert_eq!(context.len(), 1);
        assert_eq!(context.get("site").unwrap().provenance, Provenance::Default);
        assert!(!context.contains("lot_id"));
    }

    #[test]
    fn test_regex_on_filename() {
        let spec = ContextSpec {
            rules: vec![lot_rule()],
            defaults: BTreeMap::new(),
        };
        let docs = vec![ContextDocument::named("LOT123_run4.csv")];
        let context = ContextResolver::new(&spec)
            .resolve(&BTreeMap::new(), &docs)
            .unwrap();
        let value = context.get("lot_id").unwrap();
        assert_eq!(value.value, json!("123"));
        assert_eq!(value.provenance, Provenance::Regex);
        assert_eq!(value.source.as_deref(), Some("LOT123_run4.csv"));
    }

    #[test]
    fn test_override_beats_regex() {
        let spec = ContextSpec {
            rules: vec![lot_rule()],
            defaults: BTreeMap::new(),
        };
        let overrides = BTreeMap::from([("lot_id".to_string(), json!("999"))]);
        let docs = vec![ContextDocument::named("LOT123_run4.csv")];
        let context = ContextResolver::new(&spec).resolve(&overrides, &docs).unwrap();
        assert_eq!(context.value("lot_id"), Some(&json!("999")));
        assert_eq!(context.get("lot_id").unwrap().provenance, Provenance::Override);
    }

    #[test]
    fn test_jsonpath_beats_regex_and_documents_in_order() {
        let tool = ContextRule {
            path: Some("meta.tool".to_string()),
            transform: Some(ValueTransform::Upper),
            ..rule("tool", RuleKind::Jsonpath)
        };
        let tool_from_name = ContextRule {
            pattern: Some(r"_(T\d)".to_string()),
            ..rule("tool", RuleKind::Regex)
        };
        let spec = ContextSpec {
            rules: vec![tool_from_name, tool],
            defaults: BTreeMap::new(),
        };
        let first =
            RawDocument::structured(Path::new("a_T1.json"), FileFormat::Json, json!({}), None);
        let second = RawDocument::structured(
            Path::new("b_T2.json"),
            FileFormat::Json,
            json!({"meta": {"tool": "t7"}}),
            None,
        );
        let docs = vec![ContextDocument::loaded(first), ContextDocument::loaded(second)];
        let context = ContextResolver::new(&spec)
            .resolve(&BTreeMap::new(), &docs)
            .unwrap();
        let value = context.get("tool").unwrap();
        assert_eq!(value.value, json!("T7"));
        assert_eq!(value.provenance, Provenance::Jsonpath);
        assert_eq!(value.source.as_deref(), Some("b_T2.json"));
    }

    #[test]
    fn test_missing_key_is_omitted_and_default_applies() {
        let spec = ContextSpec {
            rules: vec![lot_rule(), rule("operator", RuleKind::Jsonpath)],
            defaults: BTreeMap::from([("site".to_string(), json!("fab1"))]),
        };
        let docs = vec![ContextDocument::named("report.csv")];
        let context = ContextResolver::new(&spec)
            .resolve(&BTreeMap::new(), &docs)
            .unwrap();
        assert!(!context.contains("lot_id"));
        assert!(!context.contains("operator"));
        assert_eq!(context.get("site").unwrap().provenance, Provenance::Default);
        assert_eq!(context.len(), 1);
    }

    #[test]
    fn test_on_fail_policies() {
        let use_default = ContextRule {
            on_fail: OnFail::UseDefault,
            path: Some("lot".to_string()),
            ..rule("lot_id", RuleKind::Jsonpath)
        };
        let spec = ContextSpec {
            // The regex would match, but use_default skips it
            rules: vec![use_default, lot_rule()],
            defaults: BTreeMap::from([("lot_id".to_string(), json!("0"))]),
        };
        let docs = vec![ContextDocument::named("LOT5.csv")];
        let context = ContextResolver::new(&spec)
            .resolve(&BTreeMap::new(), &docs)
            .unwrap();
        assert_eq!(context.value("lot_id"), Some(&json!("0")));

        let fail = ContextRule {
            on_fail: OnFail::FailRun,
            ..lot_rule()
        };
        let spec = ContextSpec {
            rules: vec![fail],
            defaults: BTreeMap::new(),
        };
        let err = ContextResolver::new(&spec)
            .resolve(&BTreeMap::new(), &[ContextDocument::named("report.csv")])
            .unwrap_err();
        assert!(matches!(err, EngineError::ContextResolution { ref key, .. } if key == "lot_id"));

        // An override satisfies the key before the failing rule runs
        let overrides = BTreeMap::from([("lot_id".to_string(), json!("7"))]);
        assert!(
            ContextResolver::new(&spec)
                .resolve(&overrides, &[ContextDocument::named("report.csv")])
                .is_ok()
        );
    }

    #[test]
    fn test_transforms() {
        assert_eq!(apply_transform(json!("0042"), Some(ValueTransform::Int)), Some(json!(42)));
        assert_eq!(apply_transform(json!("12abc"), Some(ValueTransform::Int)), Some(json!(12)));
        assert_eq!(apply_transform(json!("x"), Some(ValueTransform::Int)), None);
        assert_eq!(apply_transform(json!("2.5"), Some(ValueTransform::Float)), Some(json!(2.5)));
        assert_eq!(apply_transform(json!(" a "), Some(ValueTransform::Strip)), Some(json!("a")));
        assert_eq!(apply_transform(json!("Ab"), Some(ValueTransform::Lower)), Some(json!("ab")));
        assert_eq!(apply_transform(json!(3), None), Some(json!(3)));
    }

    #[test]
    fn test_content_regex() {
        let doc = RawDocument::structured(
            Path::new("x.json"),
            FileFormat::Json,
            json!({}),
            Some("Operator: jdoe\n".to_string()),
        );
        let spec = ContextSpec {
            rules: vec![ContextRule {
                pattern: Some(r"Operator:\s*(\w+)".to_string()),
                target: MatchTarget::Content,
                ..rule("operator", RuleKind::Regex)
            }],
            defaults: BTreeMap::new(),
        };
        let resolver = ContextResolver::new(&spec);
        assert!(resolver.needs_content());
        let context = resolver
            .resolve(&BTreeMap::new(), &[ContextDocument::loaded(doc)])
            .unwrap();
        assert_eq!(context.value("operator"), Some(&json!("jdoe")));
    }
}
