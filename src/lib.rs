//! Profile Extraction - profile-driven extraction of tables from data files
//!
//! Provides:
//! - Adapters reading CSV, Excel, JSON and Parquet files
//! - Declarative extraction profiles (YAML/JSON)
//! - Extraction strategies turning raw records into tables
//! - Run context resolution from file names and content
//! - Transform and validation pipelines
//! - A gated, checkpointed stage orchestrator with content-addressed artifacts

pub mod adapters;
pub mod checkpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod extraction;
pub mod identity;
pub mod models;
pub mod orchestrator;
pub mod transform;

// Re-export commonly used types
pub use adapters::{Adapter, AdapterRegistry, RawDocument, ReadPlan, SchemaSummary};
pub use checkpoint::{
    ArtifactStore, CancellationReport, CancellationToken, CheckpointManager, CleanupReport,
    CommittedTable,
};
pub use config::EngineConfig;
pub use context::{ContextDocument, ContextResolver};
pub use error::{EngineError, EngineResult, ErrorKind};
pub use extraction::{StrategyKind, StrategyType};
pub use identity::{compute_id, compute_identity};
pub use orchestrator::{
    ArtifactRef, Diagnostic, DiagnosticKind, DiagnosticLevel, Engine, ProfileKey, RunHandle,
    StageOutput, StageParams, UnlockReport,
};
pub use transform::TransformPipeline;

// Re-export models
pub use models::{
    ExtractedTable, ExtractionProfile, FileFormat, RunContext, Stage, StageId, StageState,
    StageType, TableConfig,
};
