//! Pipeline stage types and states

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Pipeline stages
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageType {
    /// Stage 1: Discover candidate files
    Discovery,
    /// Stage 2: Select and validate files
    Selection,
    /// Stage 3: Resolve run context (optional)
    Context,
    /// Stage 4: Probe which tables each file offers (optional)
    TableAvailability,
    /// Stage 5: Choose tables to extract (optional)
    TableSelection,
    /// Stage 6: Preview extraction on a sample (optional)
    Preview,
    /// Stage 7: Extract, transform and persist tables
    Parse,
    /// Stage 8: Write output tables, joins and aggregations
    Export,
}

impl StageType {
    /// Get all stages in declaration order
    pub fn all() -> Vec<Self> {
        vec![
            Self::Discovery,
            Self::Selection,
            Self::Context,
            Self::TableAvailability,
            Self::TableSelection,
            Self::Preview,
            Self::Parse,
            Self::Export,
        ]
    }

    /// Get stage name
    pub fn name(&self) -> &'static str {
        match self {
            Self::Discovery => "discovery",
            Self::Selection => "selection",
            Self::Context => "context",
            Self::TableAvailability => "table_availability",
            Self::TableSelection => "table_selection",
            Self::Preview => "preview",
            Self::Parse => "parse",
            Self::Export => "export",
        }
    }

    /// Get stage description
    pub fn description(&self) -> &'static str {
        match self {
            Self::Discovery => "Discover candidate files",
            Self::Selection => "Select and validate files",
            Self::Context => "Resolve run context values",
            Self::TableAvailability => "Probe available tables",
            Self::TableSelection => "Choose tables to extract",
            Self::Preview => "Preview extraction on a sample",
            Self::Parse => "Extract and persist tables",
            Self::Export => "Export outputs",
        }
    }

    /// Get stage index (1-based)
    pub fn index(&self) -> usize {
        match self {
            Self::Discovery => 1,
            Self::Selection => 2,
            Self::Context => 3,
            Self::TableAvailability => 4,
            Self::TableSelection => 5,
            Self::Preview => 6,
            Self::Parse => 7,
            Self::Export => 8,
        }
    }

    /// Check if this stage is optional
    pub fn is_optional(&self) -> bool {
        matches!(
            self,
            Self::Context | Self::TableAvailability | Self::TableSelection | Self::Preview
        )
    }

    /// Direct upstream dependencies of this stage
    pub fn upstream(&self) -> &'static [StageType] {
        match self {
            Self::Discovery => &[],
            Self::Selection => &[Self::Discovery],
            Self::Context => &[Self::Selection],
            Self::TableAvailability => &[Self::Selection],
            Self::TableSelection => &[Self::TableAvailability],
            Self::Preview => &[Self::TableSelection],
            Self::Parse => &[
                Self::Selection,
                Self::Context,
                Self::TableSelection,
                Self::Preview,
            ],
            Self::Export => &[Self::Parse],
        }
    }
}

impl std::fmt::Display for StageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for StageType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "discovery" | "1" => Ok(Self::Discovery),
            "selection" | "2" => Ok(Self::Selection),
            "context" | "3" => Ok(Self::Context),
            "table_availability" | "4" => Ok(Self::TableAvailability),
            "table_selection" | "5" => Ok(Self::TableSelection),
            "preview" | "6" => Ok(Self::Preview),
            "parse" | "7" => Ok(Self::Parse),
            "export" | "8" => Ok(Self::Export),
            _ => Err(format!("Unknown stage: {}", s)),
        }
    }
}

/// Lifecycle state of a stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageState {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    Locked,
    Unlocked,
}

impl StageState {
    /// Whether the stage holds a usable result
    pub fn has_result(&self) -> bool {
        matches!(self, Self::Completed | Self::Locked | Self::Unlocked)
    }
}

impl std::fmt::Display for StageState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::Locked => "locked",
            Self::Unlocked => "unlocked",
        };
        write!(f, "{name}")
    }
}

/// Content-addressed stage identifier (8 hex characters)
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageId(String);

impl StageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for StageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// A node of the stage graph for one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage {
    pub stage_type: StageType,
    pub stage_id: StageId,
    pub state: StageState,
    /// Full digest of the canonical inputs
    pub inputs_hash: String,
    /// Upstream instances this stage was built from
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub upstream: BTreeMap<StageType, StageId>,
    /// Artifact paths, append-only
    pub produced_artifacts: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub error: Option<String>,
}

impl Stage {
    /// Create a pending stage
    pub fn new(stage_type: StageType, stage_id: StageId, inputs_hash: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            stage_type,
            stage_id,
            state: StageState::Pending,
            inputs_hash: inputs_hash.into(),
            upstream: BTreeMap::new(),
            produced_artifacts: Vec::new(),
            created_at: now,
            updated_at: now,
            error: None,
        }
    }

    pub fn with_upstream(mut self, upstream: BTreeMap<StageType, StageId>) -> Self {
        self.upstream = upstream;
        self
    }

    /// Move to a new state
    pub fn transition(&mut self, state: StageState) {
        self.state = state;
        self.updated_at = Utc::now();
    }

    /// Record a produced artifact; existing entries are never removed
    pub fn add_artifact(&mut self, path: impl Into<String>) {
        let path = path.into();
        if !self.produced_artifacts.contains(&path) {
            self.produced_artifacts.push(path);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_type_parse() {
        assert_eq!("parse".parse::<StageType>().unwrap(), StageType::Parse);
        assert_eq!(
            "table-availability".parse::<StageType>().unwrap(),
            StageType::TableAvailability
        );
        assert_eq!("1".parse::<StageType>().unwrap(), StageType::Discovery);
        assert!("unknown".parse::<StageType>().is_err());
    }

    #[test]
    fn test_stage_type_properties() {
        assert_eq!(StageType::all().len(), 8);
        assert!(StageType::Context.is_optional());
        assert!(StageType::Preview.is_optional());
        assert!(!StageType::Parse.is_optional());
        assert_eq!(StageType::Export.index(), 8);
        for stage in StageType::all() {
            for upstream in stage.upstream() {
                assert!(upstream.index() < stage.index());
            }
        }
    }

    #[test]
    fn test_stage_artifacts_append_only() {
        let mut stage = Stage::new(StageType::Parse, StageId::from("deadbeef"), "deadbeef00");
        stage.add_artifact("runs/r/parse/deadbeef/a.parquet");
        stage.add_artifact("runs/r/parse/deadbeef/a.parquet");
        stage.transition(StageState::Unlocked);
        assert_eq!(stage.produced_artifacts.len(), 1);
    }

    #[test]
    fn test_stage_upstream_serialization() {
        let stage = Stage::new(StageType::Selection, StageId::from("0000000b"), "digest")
            .with_upstream(BTreeMap::from([(StageType::Discovery, StageId::from("0000000a"))]));
        let value = serde_json::to_value(&stage).unwrap();
        assert_eq!(value["upstream"]["discovery"], "0000000a");

        let back: Stage = serde_json::from_value(value).unwrap();
        assert_eq!(back.upstream, stage.upstream);

        let bare = Stage::new(StageType::Discovery, StageId::from("0000000a"), "digest");
        let bare = serde_json::to_value(&bare).unwrap();
        assert!(bare.get("upstream").is_none());
    }
}
