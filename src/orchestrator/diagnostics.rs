//! Per-run diagnostics
//!
//! Problems that are isolated to one file or table do not abort a stage.
//! They are collected here and persisted next to the run's artifacts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::checkpoint::{DIAGNOSTICS_FILE, write_atomic};
use crate::error::EngineResult;
use crate::models::{StageId, StageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Info,
    Warning,
    Error,
}

/// What a diagnostic is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticKind {
    SkippedFile,
    InvalidFile,
    ValidationWarnings,
    SchemaMismatch,
    StreamingFallback,
    TableError,
    UnavailableTable,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub stage_type: StageType,
    pub stage_id: StageId,
    pub level: DiagnosticLevel,
    pub kind: DiagnosticKind,
    /// File or table the diagnostic refers to
    pub subject: String,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Diagnostics collected by one stage execution
#[derive(Debug, Clone)]
pub struct DiagnosticSink {
    stage_type: StageType,
    stage_id: StageId,
    entries: Vec<Diagnostic>,
}

impl DiagnosticSink {
    pub fn new(stage_type: StageType, stage_id: StageId) -> Self {
        Self {
            stage_type,
            stage_id,
            entries: Vec::new(),
        }
    }

    pub fn push(
        &mut self,
        level: DiagnosticLevel,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.entries.push(Diagnostic {
            stage_type: self.stage_type,
            stage_id: self.stage_id.clone(),
            level,
            kind,
            subject: subject.into(),
            message: message.into(),
            at: Utc::now().trunc_subsecs(0),
        });
    }

    pub fn warn(
        &mut self,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(DiagnosticLevel::Warning, kind, subject, message);
    }

    pub fn error(
        &mut self,
        kind: DiagnosticKind,
        subject: impl Into<String>,
        message: impl Into<String>,
    ) {
        self.push(DiagnosticLevel::Error, kind, subject, message);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn into_entries(self) -> Vec<Diagnostic> {
        self.entries
    }
}

pub fn diagnostics_path(run_dir: &Path) -> PathBuf {
    run_dir.join(DIAGNOSTICS_FILE)
}

/// Persist the diagnostics of a run
pub fn save_diagnostics(run_dir: &Path, diagnostics: &[Diagnostic]) -> EngineResult<()> {
    write_atomic(
        &diagnostics_path(run_dir),
        &serde_json::to_vec_pretty(diagnostics)?,
    )
}

/// Load persisted diagnostics; a run without any has none
pub fn load_diagnostics(run_dir: &Path) -> EngineResult<Vec<Diagnostic>> {
    let path = diagnostics_path(run_dir);
    if !path.exists() {
        return Ok(Vec::new());
    }
    let json = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_sink_and_persistence() {
        let dir = TempDir::new().unwrap();
        let mut sink = DiagnosticSink::new(StageType::Parse, StageId::from("0badf00d"));
        sink.warn(DiagnosticKind::SkippedFile, "a.json", "unreadable");
        sink.error(DiagnosticKind::TableError, "images", "join key missing");
        assert_eq!(sink.len(), 2);

        let entries = sink.into_entries();
        save_diagnostics(dir.path(), &entries).unwrap();
        let loaded = load_diagnostics(dir.path()).unwrap();
        assert_eq!(loaded, entries);
        assert_eq!(loaded[1].level, DiagnosticLevel::Error);
        assert_eq!(loaded[0].stage_id.as_str(), "0badf00d");
    }

    #[test]
    fn test_load_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        assert!(load_diagnostics(dir.path()).unwrap().is_empty());
    }
}
