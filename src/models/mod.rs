//! Core data structures shared across the engine

pub mod context;
pub mod format;
pub mod profile;
pub mod stage;
pub mod table;

pub use context::{ContextValue, Provenance, RunContext};
pub use format::FileFormat;
pub use profile::{
    ContextRule, ContextSpec, DataSource, ErrorPolicy, ExtractionProfile, Governance, Limits,
    MatchTarget, OnFail, OutputFormat, OutputSpec, Population, RuleKind, Severity, SourceFilters,
    StableColumns, TableConfig, ValidationSpec, ValueTransform, is_artifact_name,
};
pub use stage::{Stage, StageId, StageState, StageType};
pub use table::{
    ColumnSchema, ColumnType, DataFrame, ExtractedTable, TableBuilder, TableMetadata,
    ValidationWarning,
};
