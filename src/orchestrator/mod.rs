//! Stage orchestrator
//!
//! The [`Engine`] owns the profile catalog, the artifact store and every run
//! created through it. Each run moves through the fixed stage DAG of
//! [`StageGraph`]; a stage may only run once its upstream stages are locked,
//! and its id is derived from its inputs, so re-running with the same inputs
//! reuses the earlier result.

pub mod catalog;
pub mod diagnostics;
pub mod discovery;
pub mod graph;
pub mod stages;

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard, TryLockError};
use std::time::Instant;

use rayon::ThreadPool;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, error, info, info_span, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::checkpoint::{
    ArtifactStore, CancellationReport, CancellationToken, CheckpointManager, CleanupReport,
    CommittedTable,
};
use crate::config::EngineConfig;
use crate::error::{EngineError, EngineResult};
use crate::identity::{DEFAULT_SEED, compute_identity};
use crate::models::{ExtractedTable, ExtractionProfile, Stage, StageId, StageState, StageType};

pub use catalog::{ProfileCatalog, ProfileKey};
pub use diagnostics::{Diagnostic, DiagnosticKind, DiagnosticLevel, DiagnosticSink};
pub use discovery::{DiscoveredFile, DiscoveryScan, SkippedFile, discover_files, hash_file};
pub use graph::StageGraph;
pub use stages::{
    DEFAULT_PREVIEW_ROWS, FileSet, ParsedTables, Preview, StageEnv, StageOutput, StageParams,
    TableAvailability, Upstream,
};

use diagnostics::save_diagnostics;

/// Handle returned when a run is created
#[derive(Debug, Clone)]
pub struct RunHandle {
    pub run_id: String,
    pub profile_key: ProfileKey,
    pub run_dir: PathBuf,
    pub token: CancellationToken,
}

/// Result of unlocking a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnlockReport {
    pub run_id: String,
    pub stage_id: StageId,
    /// Every stage now unlocked, the requested one first
    pub unlocked: Vec<StageId>,
    /// Artifacts of the unlocked stages, all still on disk
    pub preserved_artifacts: usize,
}

/// Where a stage's artifacts live
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub run_id: String,
    pub stage_id: StageId,
    pub stage_type: StageType,
    pub state: StageState,
    pub dir: PathBuf,
    pub payload: Option<PathBuf>,
    /// Checkpointed tables only
    pub tables: Vec<CommittedTable>,
}

/// Mutable state of one run
struct RunState {
    run_id: String,
    run_dir: PathBuf,
    profile: Arc<ExtractionProfile>,
    profile_digest: String,
    checkpoint: CheckpointManager,
    stages: Vec<Stage>,
    /// Current instance of each stage type
    current: BTreeMap<StageType, StageId>,
    outputs: HashMap<StageId, StageOutput>,
    diagnostics: Vec<Diagnostic>,
}

impl RunState {
    fn index_of(&self, stage_id: &StageId) -> EngineResult<usize> {
        self.stages
            .iter()
            .position(|s| s.stage_id == *stage_id)
            .ok_or_else(|| EngineError::not_found("stage", stage_id.as_str()))
    }

    fn current_stage(&self, stage_type: StageType) -> Option<&Stage> {
        let id = self.current.get(&stage_type)?;
        self.stages.iter().find(|s| s.stage_id == *id)
    }

    fn exists(&self, stage_type: StageType) -> bool {
        self.current.contains_key(&stage_type)
    }
}

fn lock_run(run: &Mutex<RunState>) -> MutexGuard<'_, RunState> {
    run.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Outputs of every existing ancestor of a stage
fn upstream_outputs<'a>(
    graph: &StageGraph,
    stage_type: StageType,
    current: &BTreeMap<StageType, StageId>,
    outputs: &'a HashMap<StageId, StageOutput>,
) -> Upstream<'a> {
    let outputs = graph
        .ancestors(stage_type)
        .into_iter()
        .filter_map(|ancestor| {
            let id = current.get(&ancestor)?;
            outputs.get(id).map(|output| (ancestor, output))
        })
        .collect();
    Upstream::new(outputs)
}

fn execute(
    env: &mut StageEnv<'_>,
    stage_type: StageType,
    upstream: &Upstream<'_>,
    discovery: Option<(PathBuf, DiscoveryScan)>,
) -> EngineResult<StageOutput> {
    env.token.checkpoint()?;
    match stage_type {
        StageType::Discovery => {
            let (root, scan) = discovery
                .ok_or_else(|| EngineError::gate(stage_type.name(), "no source was scanned"))?;
            stages::run_discovery(env, root, scan)
        }
        StageType::Selection => stages::run_selection(env, upstream),
        StageType::Context => stages::run_context(env, upstream),
        StageType::TableAvailability => stages::run_table_availability(env, upstream),
        StageType::TableSelection => stages::run_table_selection(env, upstream),
        StageType::Preview => stages::run_preview(env, upstream),
        StageType::Parse => stages::run_parse(env, upstream),
        StageType::Export => stages::run_export(env, upstream),
    }
}

/// Extraction engine
///
/// Runs are independent; calls on one run are serialized, while
/// [`Engine::cancel_run`] never waits on the run it cancels.
pub struct Engine {
    config: EngineConfig,
    registry: Arc<AdapterRegistry>,
    store: ArtifactStore,
    catalog: RwLock<ProfileCatalog>,
    runs: RwLock<HashMap<String, Arc<Mutex<RunState>>>>,
    tokens: RwLock<HashMap<String, CancellationToken>>,
    graph: StageGraph,
    pool: ThreadPool,
}

impl Engine {
    /// Create an engine with the default adapters
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(config.workers)
            .thread_name(|i| format!("extract-worker-{i}"))
            .build()
            .map_err(|e| EngineError::Config(format!("worker pool: {e}")))?;
        info!(
            artifact_root = %config.artifact_root.display(),
            workers = config.workers,
            "Engine ready"
        );
        Ok(Self {
            store: ArtifactStore::new(&config.artifact_root),
            registry: Arc::new(AdapterRegistry::with_defaults()),
            catalog: RwLock::new(ProfileCatalog::new()),
            runs: RwLock::new(HashMap::new()),
            tokens: RwLock::new(HashMap::new()),
            graph: StageGraph::new(),
            config,
            pool,
        })
    }

    /// Replace the adapter registry
    pub fn with_registry(mut self, registry: AdapterRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    pub fn register_profile(&self, profile: ExtractionProfile) -> EngineResult<ProfileKey> {
        write(&self.catalog).register(profile)
    }

    /// Read a YAML or JSON profile file and register it
    pub fn load_profile(&self, path: &Path) -> EngineResult<ProfileKey> {
        self.register_profile(ExtractionProfile::from_path(path)?)
    }

    /// Resolve `id` or `id@version`
    pub fn profile(&self, reference: &str) -> EngineResult<Arc<ExtractionProfile>> {
        read(&self.catalog).get(reference)
    }

    /// Start a run of a registered profile
    pub fn create_run(&self, profile_ref: &str) -> EngineResult<RunHandle> {
        let profile = self.profile(profile_ref)?;
        let profile_key = profile.key();
        let run_id = Uuid::new_v4().to_string();
        let run_dir = self.store.run_dir(&run_id);
        let checkpoint = CheckpointManager::create(&run_dir, &run_id, &profile_key)?;
        let token = CancellationToken::new();

        let state = RunState {
            run_id: run_id.clone(),
            run_dir: run_dir.clone(),
            profile_digest: profile.digest()?,
            profile,
            checkpoint,
            stages: Vec::new(),
            current: BTreeMap::new(),
            outputs: HashMap::new(),
            diagnostics: Vec::new(),
        };
        write(&self.runs).insert(run_id.clone(), Arc::new(Mutex::new(state)));
        write(&self.tokens).insert(run_id.clone(), token.clone());
        info!(run_id = %run_id, profile = %profile_key, "Created run");

        Ok(RunHandle {
            run_id,
            profile_key,
            run_dir,
            token,
        })
    }

    fn run(&self, run_id: &str) -> EngineResult<Arc<Mutex<RunState>>> {
        read(&self.runs)
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    /// Cancellation token shared by every stage of a run
    pub fn cancellation_token(&self, run_id: &str) -> EngineResult<CancellationToken> {
        read(&self.tokens)
            .get(run_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("run", run_id))
    }

    /// Run a stage, or reuse the existing stage with identical inputs
    ///
    /// Every existing upstream stage must be locked. An optional upstream
    /// that was never run is skipped and its own upstreams gate in its
    /// place.
    pub fn advance_stage(
        &self,
        run_id: &str,
        stage_type: StageType,
        params: &StageParams,
    ) -> EngineResult<Stage> {
        let run = self.run(run_id)?;
        let token = self.cancellation_token(run_id)?;
        let mut guard = lock_run(&run);
        let state = &mut *guard;
        let _span = info_span!("stage", run_id = %run_id, stage = stage_type.name()).entered();

        let gating = self
            .graph
            .effective_upstream(stage_type, &|s| state.exists(s));
        let mut upstream_ids = BTreeMap::new();
        let mut lineage = BTreeMap::new();
        for upstream in gating {
            let stage = state.current_stage(upstream).ok_or_else(|| {
                EngineError::gate(stage_type.name(), format!("upstream '{upstream}' has not run"))
            })?;
            if stage.state != StageState::Locked {
                return Err(EngineError::gate(
                    stage_type.name(),
                    format!(
                        "upstream '{upstream}' ({}) is {}, not locked",
                        stage.stage_id, stage.state
                    ),
                ));
            }
            upstream_ids.insert(upstream.name(), stage.stage_id.as_str().to_string());
            lineage.insert(upstream, stage.stage_id.clone());
        }
        if let Some(current) = state.current_stage(stage_type) {
            if current.state == StageState::Locked {
                return Err(EngineError::gate(
                    stage_type.name(),
                    format!("current instance {} is locked; unlock it first", current.stage_id),
                ));
            }
        }

        // Discovery hashes its files before its id is known
        let discovery = if stage_type == StageType::Discovery {
            let source = params.source.as_ref().ok_or_else(|| {
                EngineError::gate(stage_type.name(), "a source directory is required")
            })?;
            let root = std::fs::canonicalize(source).map_err(|_| {
                EngineError::not_found("source directory", source.display().to_string())
            })?;
            let scan = discover_files(
                &root,
                params.pattern.as_deref(),
                &state.profile,
                &self.registry,
                &self.pool,
            )?;
            Some((root, scan))
        } else {
            None
        };

        let mut inputs = json!({
            "profile": state.profile.key(),
            "profile_digest": state.profile_digest,
            "upstream": upstream_ids,
            "params": params.identity_inputs(stage_type),
        });
        if let Some((_, scan)) = &discovery {
            inputs["files"] = json!(scan
                .files
                .iter()
                .map(|f| [f.relative.as_str(), f.sha256.as_str()])
                .collect::<Vec<_>>());
        }
        let identity = compute_identity(stage_type, &inputs, DEFAULT_SEED);

        let existing = state.stages.iter().position(|s| s.stage_id == identity.id);
        if let Some(index) = existing {
            let stage = &state.stages[index];
            if stage.inputs_hash != identity.digest {
                return Err(EngineError::IdCollision {
                    stage_id: identity.id.to_string(),
                    existing: stage.inputs_hash.clone(),
                    incoming: identity.digest,
                });
            }
            if stage.state.has_result() && state.outputs.contains_key(&identity.id) {
                let stage = stage.clone();
                debug!(stage_id = %identity.id, "Reusing stage with identical inputs");
                state.current.insert(stage_type, identity.id);
                return Ok(stage);
            }
        }

        let index = match existing {
            Some(index) => index,
            None => {
                state.stages.push(
                    Stage::new(stage_type, identity.id.clone(), identity.digest.clone())
                        .with_upstream(lineage),
                );
                state.stages.len() - 1
            }
        };
        state.stages[index].error = None;
        state.stages[index].transition(StageState::Running);
        state.current.insert(stage_type, identity.id.clone());
        state.checkpoint.record_stages(&state.stages)?;

        info!(stage_id = %identity.id, "Starting stage");
        let start = Instant::now();
        token.begin(stage_type.name());
        let stage_dir = self.store.stage_dir(run_id, stage_type, &identity.id);
        let mut sink = DiagnosticSink::new(stage_type, identity.id.clone());

        let result = {
            let upstream =
                upstream_outputs(&self.graph, stage_type, &state.current, &state.outputs);
            let mut env = StageEnv {
                config: &self.config,
                registry: &self.registry,
                store: &self.store,
                pool: &self.pool,
                profile: &state.profile,
                params,
                stage_id: &identity.id,
                stage_dir: stage_dir.clone(),
                token: &token,
                checkpoint: &mut state.checkpoint,
                diagnostics: &mut sink,
            };
            execute(&mut env, stage_type, &upstream, discovery)
        };
        let result = result.and_then(|output| {
            let payload = self
                .store
                .write_payload(&stage_dir, &serde_json::to_value(&output)?)?;
            state.checkpoint.record_payload(&identity.id, payload.clone())?;
            Ok((output, payload))
        });
        token.finish();

        let mut entries = sink.into_entries();
        let stage = &mut state.stages[index];
        let outcome = match result {
            Ok((output, payload)) => {
                stage.add_artifact(payload);
                for table in output.committed() {
                    stage.add_artifact(table.data.clone());
                    stage.add_artifact(table.sidecar.clone());
                }
                stage.transition(StageState::Completed);
                info!(
                    stage_id = %identity.id,
                    duration_ms = start.elapsed().as_millis() as u64,
                    diagnostics = entries.len(),
                    "Stage completed"
                );
                state.outputs.insert(identity.id.clone(), output);
                Ok(())
            }
            Err(err) => {
                let next = match err {
                    EngineError::Cancelled { .. } => StageState::Cancelled,
                    _ => StageState::Failed,
                };
                stage.transition(next);
                stage.error = Some(err.to_string());
                error!(stage_id = %identity.id, error = %err, "Stage {}", next);
                Err(err)
            }
        };

        state.diagnostics.retain(|d| d.stage_id != identity.id);
        state.diagnostics.append(&mut entries);
        state.checkpoint.record_stages(&state.stages)?;
        save_diagnostics(&state.run_dir, &state.diagnostics)?;
        outcome?;
        Ok(state.stages[index].clone())
    }

    /// Make a completed stage immutable
    ///
    /// Locking a parse stage records the schema of each of its tables for
    /// later schema-stability checks.
    pub fn lock_stage(&self, run_id: &str, stage_id: &StageId) -> EngineResult<Stage> {
        let run = self.run(run_id)?;
        let mut guard = lock_run(&run);
        let state = &mut *guard;
        let index = state.index_of(stage_id)?;
        let stage_type = state.stages[index].stage_type;

        match state.stages[index].state {
            StageState::Completed | StageState::Unlocked => {}
            other => {
                return Err(EngineError::lock(
                    stage_id.as_str(),
                    format!("stage is {other}; only completed or unlocked stages can be locked"),
                ));
            }
        }
        if state.current.get(&stage_type) != Some(stage_id) {
            return Err(EngineError::lock(
                stage_id.as_str(),
                "a newer instance of this stage is current",
            ));
        }
        // The stage must have been built from the locked upstream instances
        let recorded = &state.stages[index].upstream;
        for upstream in self.graph.effective_upstream(stage_type, &|s| state.exists(s)) {
            let Some(stage) = state.current_stage(upstream) else {
                continue;
            };
            if stage.state != StageState::Locked {
                return Err(EngineError::lock(
                    stage_id.as_str(),
                    format!("upstream '{upstream}' ({}) is not locked", stage.stage_id),
                ));
            }
            if recorded.get(&upstream) != Some(&stage.stage_id) {
                let built_from = recorded
                    .get(&upstream)
                    .map_or_else(|| "no instance".to_string(), |id| id.to_string());
                return Err(EngineError::lock(
                    stage_id.as_str(),
                    format!(
                        "built from {built_from} of '{upstream}' but {} is current; \
                         advance the stage again",
                        stage.stage_id
                    ),
                ));
            }
        }

        if let Some(StageOutput::Parse(parsed)) = state.outputs.get(stage_id) {
            for entry in &parsed.committed {
                let columns = match parsed.tables.get(&entry.table) {
                    Some(table) => table.columns.clone(),
                    None => self.store.read_sidecar(entry)?.column_schema,
                };
                self.store
                    .record_schema(&state.profile.id, &entry.table, stage_id, &columns)?;
            }
        }

        state.stages[index].transition(StageState::Locked);
        state.checkpoint.record_stages(&state.stages)?;
        info!(run_id = %state.run_id, stage = %stage_type, stage_id = %stage_id, "Locked stage");
        Ok(state.stages[index].clone())
    }

    /// Unlock a stage, and with `cascade` every stage downstream of it
    ///
    /// No artifact is deleted.
    pub fn unlock_stage(
        &self,
        run_id: &str,
        stage_id: &StageId,
        cascade: bool,
    ) -> EngineResult<UnlockReport> {
        let run = self.run(run_id)?;
        let mut guard = lock_run(&run);
        let state = &mut *guard;
        let index = state.index_of(stage_id)?;
        let stage_type = state.stages[index].stage_type;
        if state.stages[index].state != StageState::Locked {
            return Err(EngineError::lock(
                stage_id.as_str(),
                format!("stage is {}, not locked", state.stages[index].state),
            ));
        }

        let downstream: Vec<usize> = self
            .graph
            .downstream(stage_type)
            .into_iter()
            .filter_map(|t| state.current.get(&t))
            .filter_map(|id| state.index_of(id).ok())
            .collect();
        let locked: Vec<String> = downstream
            .iter()
            .filter(|&&i| state.stages[i].state == StageState::Locked)
            .map(|&i| state.stages[i].stage_id.to_string())
            .collect();
        if !cascade && !locked.is_empty() {
            return Err(EngineError::DownstreamLocked {
                stage_id: stage_id.to_string(),
                downstream: locked,
            });
        }

        let mut touched = vec![index];
        if cascade {
            touched.extend(
                downstream
                    .into_iter()
                    .filter(|&i| {
                        matches!(
                            state.stages[i].state,
                            StageState::Completed | StageState::Locked
                        )
                    }),
            );
        }
        for &i in &touched {
            state.stages[i].transition(StageState::Unlocked);
        }
        state.checkpoint.record_stages(&state.stages)?;

        let report = UnlockReport {
            run_id: run_id.to_string(),
            stage_id: stage_id.clone(),
            unlocked: touched.iter().map(|&i| state.stages[i].stage_id.clone()).collect(),
            preserved_artifacts: touched
                .iter()
                .map(|&i| state.stages[i].produced_artifacts.len())
                .sum(),
        };
        info!(
            run_id = %run_id,
            stage_id = %stage_id,
            cascade,
            unlocked = report.unlocked.len(),
            "Unlocked stage"
        );
        Ok(report)
    }

    /// Ask the running stage of a run to stop at its next yield point
    ///
    /// A soft cancellation lets the unit in progress commit. Nothing is
    /// deleted either way.
    pub fn cancel_run(&self, run_id: &str, soft: bool) -> EngineResult<CancellationReport> {
        let token = self.cancellation_token(run_id)?;
        let in_flight = token.in_flight();
        let requested_at = chrono::Utc::now();
        if in_flight.is_none() {
            debug!(run_id = %run_id, "Nothing to cancel");
            return Ok(CancellationReport {
                run_id: run_id.to_string(),
                soft,
                in_flight,
                accepted: false,
                requested_at,
            });
        }
        if !token.cancel(soft) {
            return Err(EngineError::CancellationInProgress(run_id.to_string()));
        }
        warn!(run_id = %run_id, stage = ?in_flight, soft, "Cancellation requested");
        Ok(CancellationReport {
            run_id: run_id.to_string(),
            soft,
            in_flight,
            accepted: true,
            requested_at,
        })
    }

    /// Forget a run; its checkpoint and artifacts stay on disk
    ///
    /// A run with a stage in flight is refused.
    pub fn close_run(&self, run_id: &str) -> EngineResult<()> {
        let run = self.run(run_id)?;
        let token = self.cancellation_token(run_id)?;
        let mut runs = write(&self.runs);
        // A stage holds the run lock while it executes
        let busy = matches!(run.try_lock(), Err(TryLockError::WouldBlock));
        if busy || token.in_flight().is_some() {
            let stage = token.in_flight().unwrap_or_else(|| "stage".to_string());
            return Err(EngineError::gate(
                stage,
                format!("run '{run_id}' is still running and cannot be closed"),
            ));
        }
        runs.remove(run_id);
        write(&self.tokens).remove(run_id);
        info!(run_id = %run_id, "Closed run");
        Ok(())
    }

    /// List, and unless `dry_run` delete, files of a run no checkpoint references
    pub fn cleanup_run(&self, run_id: &str, dry_run: bool) -> EngineResult<CleanupReport> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        let report = guard.checkpoint.cleanup(self.store.root(), dry_run)?;
        info!(
            run_id = %run_id,
            dry_run,
            orphans = report.orphans.len(),
            bytes = report.bytes,
            "Cleaned up run"
        );
        Ok(report)
    }

    pub fn get_stage_artifact(
        &self,
        run_id: &str,
        stage_id: &StageId,
    ) -> EngineResult<ArtifactRef> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        let stage = &guard.stages[guard.index_of(stage_id)?];
        Ok(ArtifactRef {
            run_id: run_id.to_string(),
            stage_id: stage_id.clone(),
            stage_type: stage.stage_type,
            state: stage.state,
            dir: self.store.stage_dir(run_id, stage.stage_type, stage_id),
            payload: guard
                .checkpoint
                .payload(stage_id)
                .map(|p| self.store.resolve(p)),
            tables: guard.checkpoint.committed_tables(stage_id).to_vec(),
        })
    }

    /// Result of a completed stage
    pub fn stage_output(&self, run_id: &str, stage_id: &StageId) -> EngineResult<StageOutput> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        guard
            .outputs
            .get(stage_id)
            .cloned()
            .ok_or_else(|| EngineError::not_found("stage result", stage_id.as_str()))
    }

    /// Load a committed table of a stage
    pub fn read_table(&self, artifact: &ArtifactRef, table: &str) -> EngineResult<ExtractedTable> {
        let entry = artifact
            .tables
            .iter()
            .find(|t| t.table == table)
            .ok_or_else(|| EngineError::not_found("table", table))?;
        self.store.read_table(entry)
    }

    pub fn diagnostics(&self, run_id: &str) -> EngineResult<Vec<Diagnostic>> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        Ok(guard.diagnostics.clone())
    }

    /// Every stage instance of a run, in creation order
    pub fn stages(&self, run_id: &str) -> EngineResult<Vec<Stage>> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        Ok(guard.stages.clone())
    }

    /// Current instance of a stage type
    pub fn current_stage(
        &self,
        run_id: &str,
        stage_type: StageType,
    ) -> EngineResult<Option<Stage>> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        Ok(guard.current_stage(stage_type).cloned())
    }

    /// Stages that may be advanced now, in declaration order
    pub fn eligible_stages(&self, run_id: &str) -> EngineResult<Vec<StageType>> {
        let run = self.run(run_id)?;
        let guard = lock_run(&run);
        let state = &*guard;
        Ok(StageType::all()
            .into_iter()
            .filter(|&stage_type| {
                let open = state
                    .current_stage(stage_type)
                    .is_none_or(|s| s.state != StageState::Locked);
                open && self
                    .graph
                    .effective_upstream(stage_type, &|s| state.exists(s))
                    .into_iter()
                    .all(|u| {
                        state
                            .current_stage(u)
                            .is_some_and(|s| s.state == StageState::Locked)
                    })
            })
            .collect())
    }
}
