//! Checkpointing, cancellation and cleanup
//!
//! Every run keeps a `checkpoint.json` at its root. It records the stage
//! graph, per-stage progress and the tables committed so far. A table only
//! becomes visible to readers once it is listed here, so data written by an
//! interrupted commit stays invisible until `cleanup` removes it.

pub mod store;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{EngineError, EngineResult};
use crate::models::{Stage, StageId};

pub use store::{ArtifactStore, TableSidecar};

/// File name of the per-run checkpoint
pub const CHECKPOINT_FILE: &str = "checkpoint.json";

/// File name of the per-run diagnostics list
pub const DIAGNOSTICS_FILE: &str = "diagnostics.json";

/// Suffix of files written before their commit rename
pub const PARTIAL_SUFFIX: &str = ".partial";

/// Write a file via a temporary sibling and a rename
pub fn write_atomic(path: &Path, contents: &[u8]) -> EngineResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[derive(Debug, Default)]
struct TokenState {
    requested: AtomicBool,
    hard: AtomicBool,
    completed_units: AtomicUsize,
    in_flight: Mutex<Option<String>>,
}

/// Cooperative cancellation flag shared between a run and its callers
///
/// Work checks [`CancellationToken::checkpoint`] at yield points: chunk
/// boundaries, between tables and between stages. A soft cancellation lets
/// the unit in progress commit; a hard one abandons it uncommitted.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    state: Arc<TokenState>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation; `false` when one is already pending
    pub fn cancel(&self, soft: bool) -> bool {
        if self.state.requested.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.state.hard.store(!soft, Ordering::SeqCst);
        true
    }

    pub fn is_cancelled(&self) -> bool {
        self.state.requested.load(Ordering::SeqCst)
    }

    /// Whether the in-flight unit must be abandoned rather than committed
    pub fn is_hard(&self) -> bool {
        self.is_cancelled() && self.state.hard.load(Ordering::SeqCst)
    }

    /// Yield point: `Err(Cancelled)` once cancellation was requested
    pub fn checkpoint(&self) -> EngineResult<()> {
        if !self.is_cancelled() {
            return Ok(());
        }
        Err(EngineError::Cancelled {
            stage: self.in_flight().unwrap_or_else(|| "idle".to_string()),
            completed_units: self.completed_units(),
        })
    }

    /// Count one committed unit of work
    pub fn record_unit(&self) {
        self.state.completed_units.fetch_add(1, Ordering::SeqCst);
    }

    pub fn completed_units(&self) -> usize {
        self.state.completed_units.load(Ordering::SeqCst)
    }

    /// Mark a stage as running
    pub fn begin(&self, stage: impl Into<String>) {
        self.state.completed_units.store(0, Ordering::SeqCst);
        *self.in_flight_slot() = Some(stage.into());
    }

    /// Clear the running stage and any observed request
    pub fn finish(&self) {
        *self.in_flight_slot() = None;
        self.state.requested.store(false, Ordering::SeqCst);
        self.state.hard.store(false, Ordering::SeqCst);
    }

    /// Stage currently running, if any
    pub fn in_flight(&self) -> Option<String> {
        self.in_flight_slot().clone()
    }

    fn in_flight_slot(&self) -> std::sync::MutexGuard<'_, Option<String>> {
        self.state
            .in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Result of a cancellation request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancellationReport {
    pub run_id: String,
    pub soft: bool,
    /// Stage that will observe the request, `None` when nothing was running
    pub in_flight: Option<String>,
    /// Whether the request was registered
    pub accepted: bool,
    pub requested_at: DateTime<Utc>,
}

/// Result of a cleanup pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CleanupReport {
    pub run_id: String,
    pub dry_run: bool,
    /// Files not referenced by the checkpoint
    pub orphans: Vec<PathBuf>,
    /// Files actually deleted, empty for a dry run
    pub removed: Vec<PathBuf>,
    pub bytes: u64,
}

/// A table committed to a stage directory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommittedTable {
    pub table: String,
    /// Data file, relative to the artifact root
    pub data: String,
    /// Sidecar file, relative to the artifact root
    pub sidecar: String,
    pub row_count: usize,
}

/// Progress markers for one stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageProgress {
    pub completed_substeps: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Durable state of a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunCheckpoint {
    pub run_id: String,
    pub profile_key: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub stages: Vec<Stage>,
    #[serde(default)]
    pub progress: BTreeMap<String, StageProgress>,
    #[serde(default)]
    pub committed: BTreeMap<String, Vec<CommittedTable>>,
    /// Stage payloads, relative to the artifact root
    #[serde(default)]
    pub payloads: BTreeMap<String, String>,
}

impl RunCheckpoint {
    pub fn new(run_id: impl Into<String>, profile_key: impl Into<String>) -> Self {
        let now = Utc::now().trunc_subsecs(0);
        Self {
            run_id: run_id.into(),
            profile_key: profile_key.into(),
            created_at: now,
            updated_at: now,
            stages: Vec::new(),
            progress: BTreeMap::new(),
            committed: BTreeMap::new(),
            payloads: BTreeMap::new(),
        }
    }

    /// Every artifact path the checkpoint references
    pub fn referenced(&self) -> Vec<&str> {
        self.committed
            .values()
            .flatten()
            .flat_map(|t| [t.data.as_str(), t.sidecar.as_str()])
            .chain(self.payloads.values().map(String::as_str))
            .collect()
    }
}

/// Owns the checkpoint file of one run
#[derive(Debug)]
pub struct CheckpointManager {
    path: PathBuf,
    state: RunCheckpoint,
}

impl CheckpointManager {
    /// Start a fresh checkpoint in `run_dir`
    pub fn create(run_dir: &Path, run_id: &str, profile_key: &str) -> EngineResult<Self> {
        let manager = Self {
            path: run_dir.join(CHECKPOINT_FILE),
            state: RunCheckpoint::new(run_id, profile_key),
        };
        manager.save()?;
        Ok(manager)
    }

    /// Load the checkpoint of an existing run
    pub fn load(run_dir: &Path) -> EngineResult<Self> {
        let path = run_dir.join(CHECKPOINT_FILE);
        if !path.exists() {
            return Err(EngineError::not_found("checkpoint", path.display().to_string()));
        }
        let json = std::fs::read_to_string(&path)?;
        let state: RunCheckpoint = serde_json::from_str(&json)?;
        Ok(Self { path, state })
    }

    pub fn state(&self) -> &RunCheckpoint {
        &self.state
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist via temp file and rename
    pub fn save(&self) -> EngineResult<()> {
        let json = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &json)
    }

    fn touch(&mut self) {
        self.state.updated_at = Utc::now().trunc_subsecs(0);
    }

    /// Record progress of a stage
    pub fn checkpoint(
        &mut self,
        stage_id: &StageId,
        completed_substeps: &[String],
    ) -> EngineResult<()> {
        let progress = self
            .state
            .progress
            .entry(stage_id.to_string())
            .or_default();
        for step in completed_substeps {
            if !progress.completed_substeps.contains(step) {
                progress.completed_substeps.push(step.clone());
            }
        }
        progress.updated_at = Some(Utc::now().trunc_subsecs(0));
        self.touch();
        debug!(stage_id = %stage_id, substeps = completed_substeps.len(), "Checkpointed progress");
        self.save()
    }

    /// Make a committed table visible
    pub fn commit_table(&mut self, stage_id: &StageId, entry: CommittedTable) -> EngineResult<()> {
        let tables = self.state.committed.entry(stage_id.to_string()).or_default();
        if !tables.iter().any(|t| t.table == entry.table) {
            tables.push(entry);
        }
        self.touch();
        self.save()
    }

    pub fn record_payload(&mut self, stage_id: &StageId, path: String) -> EngineResult<()> {
        self.state.payloads.insert(stage_id.to_string(), path);
        self.touch();
        self.save()
    }

    /// Replace the stage list
    pub fn record_stages(&mut self, stages: &[Stage]) -> EngineResult<()> {
        self.state.stages = stages.to_vec();
        self.touch();
        self.save()
    }

    /// Tables visible for a stage, in commit order
    pub fn committed_tables(&self, stage_id: &StageId) -> &[CommittedTable] {
        self.state
            .committed
            .get(stage_id.as_str())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn payload(&self, stage_id: &StageId) -> Option<&str> {
        self.state.payloads.get(stage_id.as_str()).map(String::as_str)
    }

    pub fn progress(&self, stage_id: &StageId) -> Option<&StageProgress> {
        self.state.progress.get(stage_id.as_str())
    }

    /// List (and unless `dry_run`, delete) files the checkpoint does not reference
    pub fn cleanup(&self, artifact_root: &Path, dry_run: bool) -> EngineResult<CleanupReport> {
        let run_dir = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let referenced = self.state.referenced();
        let pattern = run_dir.join("**").join("*");
        let entries = glob::glob(&pattern.to_string_lossy())
            .map_err(|e| EngineError::Storage(format!("invalid cleanup pattern: {e}")))?;

        let mut report = CleanupReport {
            run_id: self.state.run_id.clone(),
            dry_run,
            ..Default::default()
        };
        for path in entries.flatten() {
            if !path.is_file() || path == self.path || path == run_dir.join(DIAGNOSTICS_FILE) {
                continue;
            }
            let relative = crate::identity::relative_path(&path, artifact_root);
            if referenced.contains(&relative.as_str()) {
                continue;
            }
            report.bytes += path.metadata().map(|m| m.len()).unwrap_or(0);
            if !dry_run {
                std::fs::remove_file(&path)?;
                report.removed.push(path.clone());
            }
            report.orphans.push(path);
        }
        info!(
            run_id = %report.run_id,
            dry_run,
            orphans = report.orphans.len(),
            bytes = report.bytes,
            "Cleanup finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StageType;
    use tempfile::TempDir;

    #[test]
    fn test_token_lifecycle() {
        let token = CancellationToken::new();
        assert!(token.checkpoint().is_ok());

        token.begin("parse");
        token.record_unit();
        assert!(token.cancel(true));
        assert!(!token.cancel(false), "second request is refused");
        assert!(!token.is_hard());

        match token.checkpoint() {
            Err(EngineError::Cancelled {
                stage,
                completed_units,
            }) => {
                assert_eq!(stage, "parse");
                assert_eq!(completed_units, 1);
            }
            other => panic!("expected cancellation, got {other:?}"),
        }

        token.finish();
        assert!(token.checkpoint().is_ok());
        assert!(token.in_flight().is_none());

        let clone = token.clone();
        clone.cancel(false);
        assert!(token.is_hard());
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let dir = TempDir::new().unwrap();
        let run_dir = dir.path().join("runs").join("r1");
        let mut manager = CheckpointManager::create(&run_dir, "r1", "p@1").unwrap();

        let stage_id = StageId::from("0badf00d");
        manager
            .record_stages(&[Stage::new(StageType::Discovery, stage_id.clone(), "digest")])
            .unwrap();
        manager
            .checkpoint(&stage_id, &["a.csv".to_string(), "b.csv".to_string()])
            .unwrap();
        manager.checkpoint(&stage_id, &["a.csv".to_string()]).unwrap();
        manager
            .commit_table(
                &stage_id,
                CommittedTable {
                    table: "t".into(),
                    data: "runs/r1/parse/0badf00d/t.parquet".into(),
                    sidecar: "runs/r1/parse/0badf00d/t.meta.json".into(),
                    row_count: 3,
                },
            )
            .unwrap();

        let loaded = CheckpointManager::load(&run_dir).unwrap();
        assert_eq!(loaded.state().stages.len(), 1);
        assert_eq!(
            loaded.progress(&stage_id).unwrap().completed_substeps,
            vec!["a.csv", "b.csv"]
        );
        assert_eq!(loaded.committed_tables(&stage_id).len(), 1);
        assert!(!run_dir.join("checkpoint.json.tmp").exists());
    }

    #[test]
    fn test_cleanup_lists_orphans_and_dry_run_keeps_them() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        let run_dir = root.join("runs").join("r1");
        let mut manager = CheckpointManager::create(&run_dir, "r1", "p@1").unwrap();
        let stage_dir = run_dir.join("parse").join("0badf00d");
        std::fs::create_dir_all(&stage_dir).unwrap();
        std::fs::write(stage_dir.join("t.parquet"), b"data").unwrap();
        std::fs::write(stage_dir.join("t.meta.json"), b"{}").unwrap();
        std::fs::write(stage_dir.join("u.parquet.partial"), b"half").unwrap();
        manager
            .commit_table(
                &StageId::from("0badf00d"),
                CommittedTable {
                    table: "t".into(),
                    data: "runs/r1/parse/0badf00d/t.parquet".into(),
                    sidecar: "runs/r1/parse/0badf00d/t.meta.json".into(),
                    row_count: 1,
                },
            )
            .unwrap();

        let report = manager.cleanup(root, true).unwrap();
        assert_eq!(report.orphans, vec![stage_dir.join("u.parquet.partial")]);
        assert!(report.removed.is_empty());
        assert!(stage_dir.join("u.parquet.partial").exists());

        let report = manager.cleanup(root, false).unwrap();
        assert_eq!(report.removed.len(), 1);
        assert!(!stage_dir.join("u.parquet.partial").exists());
        assert!(stage_dir.join("t.parquet").exists());
    }
}
