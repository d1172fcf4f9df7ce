//! Resolved run context values

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which cascade level produced a context value
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Override,
    Jsonpath,
    Regex,
    Default,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Override => "override",
            Self::Jsonpath => "jsonpath",
            Self::Regex => "regex",
            Self::Default => "default",
        };
        write!(f, "{name}")
    }
}

/// A resolved value with its provenance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextValue {
    pub value: Value,
    pub provenance: Provenance,
    /// File the value was taken from, for content and filename levels
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// The resolved context of a run
///
/// Keys that could not be resolved are absent; there is no placeholder
/// value for "unknown".
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunContext {
    values: BTreeMap<String, ContextValue>,
}

impl RunContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn insert(&mut self, key: impl Into<String>, value: ContextValue) {
        self.values.insert(key.into(), value);
    }

    /// Resolved entry for a key
    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.values.get(key)
    }

    /// Resolved value for a key
    pub fn value(&self, key: &str) -> Option<&Value> {
        self.values.get(key).map(|v| &v.value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &ContextValue)> {
        self.values.iter()
    }
}
