//! Stage executors
//!
//! Each executor turns the outputs of its upstream stages plus the caller's
//! [`StageParams`] into a [`StageOutput`]. Executors never change stage
//! state; the engine does that around them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rayon::ThreadPool;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::adapters::{
    Adapter, AdapterRegistry, RawDocument, ReadPlan, SchemaSummary, retry_on_timeout,
    run_with_timeout,
};
use crate::checkpoint::{ArtifactStore, CancellationToken, CheckpointManager, CommittedTable};
use crate::config::EngineConfig;
use crate::context::{ContextDocument, ContextResolver};
use crate::error::{EngineError, EngineResult};
use crate::extraction::path::{Segment, parse_path};
use crate::extraction::{
    StrategyInput, StrategyType, TableSet, append_context_columns, concat_tables, extract_table,
    schema_mismatch, stability_warning,
};
use crate::identity::canonical_path;
use crate::models::{
    ErrorPolicy, ExtractedTable, ExtractionProfile, FileFormat, OutputFormat, RunContext, Severity,
    StageId, StageType, TableConfig,
};
use crate::transform::TransformPipeline;

use super::diagnostics::{DiagnosticKind, DiagnosticLevel, DiagnosticSink};
use super::discovery::{DiscoveredFile, DiscoveryScan};

/// Rows kept per table by the preview stage unless overridden
pub const DEFAULT_PREVIEW_ROWS: usize = 20;

/// Caller-supplied inputs of a stage
///
/// Each stage reads only the fields that concern it, and only those fields
/// feed its stage id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StageParams {
    /// Source root scanned by discovery
    pub source: Option<PathBuf>,
    /// Glob overriding the profile's include filters
    pub pattern: Option<String>,
    /// Relative paths to select, in order; every discovered file when absent
    pub files: Option<Vec<String>>,
    /// Context values that win over every rule
    pub overrides: BTreeMap<String, Value>,
    /// Tables to extract; every available table when absent
    pub tables: Option<Vec<String>>,
    pub preview_rows: Option<usize>,
    /// Tables to export; the profile's outputs when absent
    pub outputs: Option<Vec<String>>,
}

impl StageParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source: impl Into<PathBuf>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_pattern(mut self, pattern: impl Into<String>) -> Self {
        self.pattern = Some(pattern.into());
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = Some(files.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_override(mut self, key: impl Into<String>, value: Value) -> Self {
        self.overrides.insert(key.into(), value);
        self
    }

    pub fn with_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_preview_rows(mut self, rows: usize) -> Self {
        self.preview_rows = Some(rows);
        self
    }

    pub fn with_outputs<I, S>(mut self, outputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.outputs = Some(outputs.into_iter().map(Into::into).collect());
        self
    }

    /// The parameters that identify a stage of the given type
    pub fn identity_inputs(&self, stage_type: StageType) -> Value {
        match stage_type {
            StageType::Discovery => serde_json::json!({
                "source": self.source.as_deref().map(canonical_path),
                "pattern": self.pattern,
            }),
            StageType::Selection => serde_json::json!({ "files": self.files }),
            StageType::Context => serde_json::json!({ "overrides": self.overrides }),
            StageType::TableSelection => serde_json::json!({ "tables": self.tables }),
            StageType::Preview => serde_json::json!({ "preview_rows": self.preview_rows }),
            StageType::Export => serde_json::json!({ "outputs": self.outputs }),
            StageType::TableAvailability | StageType::Parse => serde_json::json!({}),
        }
    }
}

/// Files under a source root
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileSet {
    pub root: PathBuf,
    pub files: Vec<DiscoveredFile>,
}

/// Whether the selected files offer a table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableAvailability {
    pub table: String,
    pub available: bool,
    /// Files offering the table; empty for derived tables
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preview {
    /// Sampled file, `None` when nothing was selected
    pub file: Option<String>,
    pub tables: Vec<ExtractedTable>,
}

/// Tables committed by the parse stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedTables {
    pub committed: Vec<CommittedTable>,
    /// In-memory copies, absent when the output was reloaded from its payload
    #[serde(skip)]
    pub tables: TableSet,
}

/// Result of one stage, persisted as its `payload.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", content = "result", rename_all = "snake_case")]
pub enum StageOutput {
    Discovery(FileSet),
    Selection(FileSet),
    Context(Arc<RunContext>),
    TableAvailability(Vec<TableAvailability>),
    TableSelection(Vec<String>),
    Preview(Preview),
    Parse(ParsedTables),
    Export(Vec<CommittedTable>),
}

impl StageOutput {
    /// Tables committed by the stage
    pub fn committed(&self) -> &[CommittedTable] {
        match self {
            Self::Parse(parsed) => &parsed.committed,
            Self::Export(outputs) => outputs,
            _ => &[],
        }
    }
}

/// Outputs of the existing upstream stages of the stage being run
#[derive(Debug, Default)]
pub struct Upstream<'a> {
    outputs: BTreeMap<StageType, &'a StageOutput>,
}

impl<'a> Upstream<'a> {
    pub fn new(outputs: BTreeMap<StageType, &'a StageOutput>) -> Self {
        Self { outputs }
    }

    fn missing(stage: StageType) -> EngineError {
        EngineError::gate(stage.name(), "upstream result is not available")
    }

    pub fn discovered(&self) -> EngineResult<&'a FileSet> {
        match self.outputs.get(&StageType::Discovery) {
            Some(StageOutput::Discovery(files)) => Ok(files),
            _ => Err(Self::missing(StageType::Discovery)),
        }
    }

    pub fn selected(&self) -> EngineResult<&'a FileSet> {
        match self.outputs.get(&StageType::Selection) {
            Some(StageOutput::Selection(files)) => Ok(files),
            _ => Err(Self::missing(StageType::Selection)),
        }
    }

    pub fn context(&self) -> Option<Arc<RunContext>> {
        match self.outputs.get(&StageType::Context) {
            Some(StageOutput::Context(context)) => Some(Arc::clone(context)),
            _ => None,
        }
    }

    pub fn availability(&self) -> Option<&'a [TableAvailability]> {
        match self.outputs.get(&StageType::TableAvailability) {
            Some(StageOutput::TableAvailability(tables)) => Some(tables),
            _ => None,
        }
    }

    pub fn table_selection(&self) -> Option<&'a [String]> {
        match self.outputs.get(&StageType::TableSelection) {
            Some(StageOutput::TableSelection(tables)) => Some(tables),
            _ => None,
        }
    }

    pub fn parsed(&self) -> EngineResult<&'a ParsedTables> {
        match self.outputs.get(&StageType::Parse) {
            Some(StageOutput::Parse(parsed)) => Ok(parsed),
            _ => Err(Self::missing(StageType::Parse)),
        }
    }
}

/// Everything an executor may touch
pub struct StageEnv<'a> {
    pub config: &'a EngineConfig,
    pub registry: &'a AdapterRegistry,
    pub store: &'a ArtifactStore,
    pub pool: &'a ThreadPool,
    pub profile: &'a ExtractionProfile,
    pub params: &'a StageParams,
    pub stage_id: &'a StageId,
    pub stage_dir: PathBuf,
    pub token: &'a CancellationToken,
    pub checkpoint: &'a mut CheckpointManager,
    pub diagnostics: &'a mut DiagnosticSink,
}

/// Run one adapter call under a time budget, retrying a timeout once
///
/// A hard cancellation stops before the call. Any cancellation stops the
/// retry, since the worker left behind by the timeout is not joined.
fn timed<T, F>(
    operation: &'static str,
    budget: Duration,
    token: &CancellationToken,
    adapter: &Arc<dyn Adapter>,
    path: &Path,
    op: F,
) -> EngineResult<T>
where
    T: Send + 'static,
    F: Fn(&dyn Adapter, &Path) -> EngineResult<T> + Clone + Send + 'static,
{
    let mut attempts = 0;
    retry_on_timeout(operation, || {
        attempts += 1;
        if attempts > 1 || token.is_hard() {
            token.checkpoint()?;
        }
        let adapter = Arc::clone(adapter);
        let path = path.to_path_buf();
        let op = op.clone();
        run_with_timeout(operation, budget, move || op(adapter.as_ref(), &path))
    })
}

fn diagnostic_kind(err: &EngineError) -> DiagnosticKind {
    match err {
        EngineError::Timeout { .. } => DiagnosticKind::Timeout,
        _ => DiagnosticKind::SkippedFile,
    }
}

/// Shareable read access for worker threads
#[derive(Clone, Copy)]
struct FileReader<'a> {
    config: &'a EngineConfig,
    registry: &'a AdapterRegistry,
    token: &'a CancellationToken,
}

/// Record-strategy outputs of one file
struct FileParts {
    parts: Vec<(String, EngineResult<ExtractedTable>)>,
    fallback: bool,
}

impl FileReader<'_> {
    fn document(&self, file: &DiscoveredFile) -> EngineResult<RawDocument> {
        let adapter = self.registry.get(file.format)?;
        timed(
            "read_document",
            self.config.read_timeout(),
            self.token,
            &adapter,
            &file.path,
            |a, p| a.read_document(p),
        )
    }

    fn probe(&self, file: &DiscoveredFile) -> EngineResult<SchemaSummary> {
        let adapter = self.registry.get(file.format)?;
        let probe_bytes = self.config.probe_bytes;
        timed(
            "probe_schema",
            self.config.probe_timeout(),
            self.token,
            &adapter,
            &file.path,
            move |a, p| a.probe_schema(p, probe_bytes),
        )
    }

    fn validate(&self, file: &DiscoveredFile) -> EngineResult<Vec<String>> {
        let adapter = self.registry.get(file.format)?;
        let validation = timed(
            "validate_file",
            self.config.read_timeout(),
            self.token,
            &adapter,
            &file.path,
            |a, p| a.validate_file(p),
        )?;
        Ok(validation.issues)
    }

    fn extract(
        &self,
        file: &DiscoveredFile,
        strategies: &[(String, StrategyType)],
    ) -> EngineResult<FileParts> {
        let plan = self
            .registry
            .read_plan(&file.path, file.size, self.config.stream_threshold_bytes)?;
        if plan == ReadPlan::Stream {
            return self.extract_streamed(file, strategies);
        }
        let document = self.document(file)?;
        let parts = strategies
            .iter()
            .map(|(name, strategy)| {
                (
                    name.clone(),
                    extract_table(strategy, StrategyInput::Document(&document), name),
                )
            })
            .collect();
        Ok(FileParts {
            parts,
            fallback: plan == ReadPlan::FullFallback,
        })
    }

    /// Extract chunk by chunk, polling cancellation at every chunk boundary
    fn extract_streamed(
        &self,
        file: &DiscoveredFile,
        strategies: &[(String, StrategyType)],
    ) -> EngineResult<FileParts> {
        let adapter = self.registry.get(file.format)?;
        let chunks = adapter.stream_dataframe(&file.path, self.config.chunk_rows)?;
        let mut pieces: Vec<EngineResult<Vec<ExtractedTable>>> =
            strategies.iter().map(|_| Ok(Vec::new())).collect();
        let mut count = 0;
        for chunk in chunks {
            self.token.checkpoint()?;
            let chunk = chunk?;
            let document = RawDocument::from_chunk(&file.path, file.format, &chunk);
            for ((name, strategy), slot) in strategies.iter().zip(pieces.iter_mut()) {
                if slot.is_err() {
                    continue;
                }
                match extract_table(strategy, StrategyInput::Document(&document), name) {
                    Ok(mut table) => {
                        table.metadata.chunk_range = Some((chunk.index, chunk.index));
                        if let Ok(tables) = slot {
                            tables.push(table);
                        }
                    }
                    Err(err) => *slot = Err(err),
                }
            }
            count += 1;
        }
        debug!(file = %file.relative, chunks = count, "Streamed file");
        let parts = strategies
            .iter()
            .zip(pieces)
            .map(|((name, _), piece)| (name.clone(), piece.map(|p| concat_tables(name, p))))
            .collect();
        Ok(FileParts {
            parts,
            fallback: false,
        })
    }
}

fn reader<'a>(env: &StageEnv<'a>) -> FileReader<'a> {
    FileReader {
        config: env.config,
        registry: env.registry,
        token: env.token,
    }
}

/// Table configs to process: the chosen tables, or every profile table
fn chosen_tables<'p>(
    profile: &'p ExtractionProfile,
    chosen: Option<&[String]>,
) -> Vec<&'p TableConfig> {
    profile
        .tables
        .iter()
        .filter(|t| chosen.is_none_or(|names| names.contains(&t.name)))
        .collect()
}

/// Context columns then transforms and constraints
fn finish_table(
    mut table: ExtractedTable,
    config: &TableConfig,
    context: &RunContext,
    pipeline: &TransformPipeline,
) -> EngineResult<ExtractedTable> {
    append_context_columns(&mut table, &config.context_columns, context);
    pipeline.run(table)
}

/// Record a table-level failure, or escalate it when the table asks to
fn table_failure(
    diagnostics: &mut DiagnosticSink,
    config: &TableConfig,
    subject: &str,
    err: EngineError,
) -> EngineResult<()> {
    if config.on_error == ErrorPolicy::FailRun || matches!(err, EngineError::Cancelled { .. }) {
        return Err(err);
    }
    diagnostics.error(DiagnosticKind::TableError, subject, err.to_string());
    Ok(())
}

pub fn run_discovery(
    env: &mut StageEnv<'_>,
    root: PathBuf,
    scan: DiscoveryScan,
) -> EngineResult<StageOutput> {
    for skipped in &scan.skipped {
        env.diagnostics
            .warn(DiagnosticKind::SkippedFile, &skipped.relative, &skipped.reason);
    }
    Ok(StageOutput::Discovery(FileSet {
        root,
        files: scan.files,
    }))
}

/// Pick files from discovery and keep those their adapter accepts
pub fn run_selection(env: &mut StageEnv<'_>, upstream: &Upstream<'_>) -> EngineResult<StageOutput> {
    let discovered = upstream.discovered()?;
    let mut candidates: Vec<DiscoveredFile> = Vec::new();
    match &env.params.files {
        Some(wanted) => {
            for relative in wanted {
                let relative = canonical_path(Path::new(relative));
                let file = discovered
                    .files
                    .iter()
                    .find(|f| f.relative == relative)
                    .ok_or_else(|| EngineError::not_found("discovered file", relative.clone()))?;
                if !candidates.contains(file) {
                    candidates.push(file.clone());
                }
            }
        }
        None => candidates = discovered.files.clone(),
    }

    let reader = reader(env);
    let results: Vec<EngineResult<Vec<String>>> =
        env.pool.install(|| candidates.par_iter().map(|f| reader.validate(f)).collect());

    let mut files = Vec::new();
    for (file, result) in candidates.into_iter().zip(results) {
        match result {
            Ok(issues) if issues.is_empty() => files.push(file),
            Ok(issues) => {
                env.diagnostics
                    .warn(DiagnosticKind::InvalidFile, &file.relative, issues.join("; "))
            }
            Err(err) if err.is_file_scoped() => {
                env.diagnostics
                    .warn(diagnostic_kind(&err), &file.relative, err.to_string())
            }
            Err(err) => return Err(err),
        }
    }
    env.token.checkpoint()?;
    info!(selected = files.len(), "Selected files");
    Ok(StageOutput::Selection(FileSet {
        root: discovered.root.clone(),
        files,
    }))
}

pub fn run_context(env: &mut StageEnv<'_>, upstream: &Upstream<'_>) -> EngineResult<StageOutput> {
    let selected = upstream.selected()?;
    let resolver = ContextResolver::new(&env.profile.context);
    let documents: Vec<ContextDocument> = if resolver.needs_content() {
        let reader = reader(env);
        let results: Vec<EngineResult<RawDocument>> = env
            .pool
            .install(|| selected.files.par_iter().map(|f| reader.document(f)).collect());
        let mut documents = Vec::new();
        for (file, result) in selected.files.iter().zip(results) {
            match result {
                Ok(document) => documents.push(ContextDocument::loaded(document)),
                Err(err) if err.is_file_scoped() => {
                    env.diagnostics
                        .warn(diagnostic_kind(&err), &file.relative, err.to_string());
                    documents.push(ContextDocument::named(file.file_name()));
                }
                Err(err) => return Err(err),
            }
        }
        documents
    } else {
        selected
            .files
            .iter()
            .map(|f| ContextDocument::named(f.file_name()))
            .collect()
    };
    env.token.checkpoint()?;
    let context = resolver.resolve(&env.params.overrides, &documents)?;
    info!(keys = context.len(), "Resolved run context");
    Ok(StageOutput::Context(Arc::new(context)))
}

/// Whether a probed file offers what a record strategy reads
///
/// Anything the probe cannot tell counts as offered.
fn offers(strategy: &StrategyType, summary: &SchemaSummary) -> bool {
    if let Some(sheet) = strategy.sheet() {
        return summary.tables.iter().any(|t| t.name == sheet);
    }
    let (Some(path), FileFormat::Json) = (strategy.path(), summary.format) else {
        return true;
    };
    let Some(Segment::Key(head)) = parse_path(path).ok().and_then(|s| s.into_iter().next()) else {
        return true;
    };
    let columns: Vec<&String> = summary.tables.iter().flat_map(|t| &t.columns).collect();
    columns.is_empty() || columns.iter().any(|c| **c == head)
}

pub fn run_table_availability(
    env: &mut StageEnv<'_>,
    upstream: &Upstream<'_>,
) -> EngineResult<StageOutput> {
    let selected = upstream.selected()?;
    let reader = reader(env);
    let results: Vec<EngineResult<SchemaSummary>> = env
        .pool
        .install(|| selected.files.par_iter().map(|f| reader.probe(f)).collect());

    let mut summaries: Vec<(&DiscoveredFile, Option<SchemaSummary>)> = Vec::new();
    for (file, result) in selected.files.iter().zip(results) {
        match result {
            Ok(summary) => summaries.push((file, Some(summary))),
            Err(err) if err.is_file_scoped() => {
                env.diagnostics
                    .warn(diagnostic_kind(&err), &file.relative, err.to_string());
                summaries.push((file, None));
            }
            Err(err) => return Err(err),
        }
    }

    let mut availability: Vec<TableAvailability> = Vec::new();
    for table in &env.profile.tables {
        let strategy = env.profile.strategy_for(table)?;
        let (available, files) = if strategy.reads_files() {
            let files: Vec<String> = summaries
                .iter()
                .filter(|(_, s)| s.as_ref().is_none_or(|s| offers(&strategy, s)))
                .map(|(f, _)| f.relative.clone())
                .collect();
            (!files.is_empty(), files)
        } else {
            let ready = strategy.depends_on().iter().all(|dependency| {
                availability
                    .iter()
                    .any(|a| a.table == *dependency && a.available)
            });
            (ready, Vec::new())
        };
        if !available {
            env.diagnostics.push(
                DiagnosticLevel::Info,
                DiagnosticKind::UnavailableTable,
                &table.name,
                "no selected file offers this table",
            );
        }
        availability.push(TableAvailability {
            table: table.name.clone(),
            available,
            files,
        });
    }
    env.token.checkpoint()?;
    Ok(StageOutput::TableAvailability(availability))
}

/// Requested tables plus everything they depend on, in profile order
pub fn run_table_selection(
    env: &mut StageEnv<'_>,
    upstream: &Upstream<'_>,
) -> EngineResult<StageOutput> {
    let profile = env.profile;
    let availability = upstream.availability();
    let is_available = |name: &str| {
        availability.is_none_or(|tables| tables.iter().any(|t| t.table == name && t.available))
    };
    let requested: Vec<String> = match &env.params.tables {
        Some(tables) => tables.clone(),
        None => profile
            .table_names()
            .into_iter()
            .filter(|t| is_available(t.as_str()))
            .collect(),
    };

    let mut chosen: BTreeSet<String> = BTreeSet::new();
    let mut pending = requested.clone();
    while let Some(name) = pending.pop() {
        let config = profile
            .table(&name)
            .ok_or_else(|| EngineError::not_found("table", name.clone()))?;
        if !is_available(name.as_str()) {
            return Err(EngineError::ValidationFailure {
                table: name,
                failures: vec!["not available in the selected files".to_string()],
            });
        }
        if chosen.insert(name.clone()) {
            let strategy = profile.strategy_for(config)?;
            pending.extend(strategy.depends_on().into_iter().map(str::to_string));
        }
    }
    let tables: Vec<String> = profile
        .table_names()
        .into_iter()
        .filter(|t| chosen.contains(t))
        .collect();
    info!(requested = requested.len(), chosen = tables.len(), "Selected tables");
    Ok(StageOutput::TableSelection(tables))
}

/// Extract the first selected file and keep the head of every table
pub fn run_preview(env: &mut StageEnv<'_>, upstream: &Upstream<'_>) -> EngineResult<StageOutput> {
    let profile = env.profile;
    let selected = upstream.selected()?;
    let limit = env.params.preview_rows.unwrap_or(DEFAULT_PREVIEW_ROWS);
    let Some(file) = selected.files.first() else {
        return Ok(StageOutput::Preview(Preview {
            file: None,
            tables: Vec::new(),
        }));
    };
    let document = match reader(env).document(file) {
        Ok(document) => document,
        Err(err) if err.is_file_scoped() => {
            env.diagnostics
                .warn(diagnostic_kind(&err), &file.relative, err.to_string());
            return Ok(StageOutput::Preview(Preview {
                file: Some(file.relative.clone()),
                tables: Vec::new(),
            }));
        }
        Err(err) => return Err(err),
    };

    let context = upstream
        .context()
        .unwrap_or_else(|| Arc::new(ContextResolver::new(&profile.context).defaults()));
    let pipeline = TransformPipeline::new(&profile.transforms, &profile.validation.constraints)?;
    let mut set = TableSet::new();
    let mut tables = Vec::new();
    for config in chosen_tables(profile, upstream.table_selection()) {
        let strategy = profile.strategy_for(config)?;
        let input = if strategy.reads_files() {
            StrategyInput::Document(&document)
        } else {
            StrategyInput::Tables(&set)
        };
        match extract_table(&strategy, input, &config.name)
            .and_then(|t| finish_table(t, config, &context, &pipeline))
        {
            Ok(table) => {
                tables.push(table.head(limit));
                set.insert(config.name.clone(), Arc::new(table));
            }
            Err(err) => env
                .diagnostics
                .warn(DiagnosticKind::TableError, &config.name, err.to_string()),
        }
    }
    Ok(StageOutput::Preview(Preview {
        file: Some(file.relative.clone()),
        tables,
    }))
}

/// Compare a table with its last locked schema
///
/// Returns `None` when the table is rejected.
fn check_stability(
    env: &mut StageEnv<'_>,
    config: &TableConfig,
    mut table: ExtractedTable,
) -> EngineResult<Option<ExtractedTable>> {
    let Some(severity) = env.profile.stability_severity(config) else {
        return Ok(Some(table));
    };
    let Some(locked) = env.store.locked_schema(&env.profile.id, &table.name)? else {
        return Ok(Some(table));
    };
    let Some(message) = schema_mismatch(&table.columns, &locked.columns) else {
        return Ok(Some(table));
    };
    match severity {
        Severity::Warn => {
            env.diagnostics
                .warn(DiagnosticKind::SchemaMismatch, &table.name, &message);
            table
                .validation_warnings
                .push(stability_warning(&table.name, &message));
            Ok(Some(table))
        }
        Severity::Error => {
            env.diagnostics.error(
                DiagnosticKind::SchemaMismatch,
                &table.name,
                format!("table rejected: {message}"),
            );
            Ok(None)
        }
    }
}

/// Write tables one at a time; each committed table is one unit of work
fn commit_tables<'t>(
    env: &mut StageEnv<'_>,
    tables: impl IntoIterator<Item = &'t ExtractedTable>,
    format: OutputFormat,
) -> EngineResult<Vec<CommittedTable>> {
    let mut committed = Vec::new();
    for table in tables {
        env.token.checkpoint()?;
        let entry = env
            .store
            .write_table(&env.stage_dir, env.stage_id, table, format, Some(env.token))?;
        env.checkpoint.commit_table(env.stage_id, entry.clone())?;
        env.checkpoint
            .checkpoint(env.stage_id, &[format!("table:{}", table.name)])?;
        env.token.record_unit();
        committed.push(entry);
    }
    Ok(committed)
}

/// Extract, transform and commit every chosen table
pub fn run_parse(env: &mut StageEnv<'_>, upstream: &Upstream<'_>) -> EngineResult<StageOutput> {
    let profile = env.profile;
    let selected = upstream.selected()?;
    let configs = chosen_tables(profile, upstream.table_selection());
    let context = upstream
        .context()
        .unwrap_or_else(|| Arc::new(ContextResolver::new(&profile.context).defaults()));
    let pipeline = TransformPipeline::new(&profile.transforms, &profile.validation.constraints)?;

    let mut strategies: HashMap<String, StrategyType> = HashMap::new();
    let mut record_strategies: Vec<(String, StrategyType)> = Vec::new();
    let mut record_configs: Vec<&TableConfig> = Vec::new();
    for config in &configs {
        let strategy = profile.strategy_for(config)?;
        if strategy.reads_files() {
            record_strategies.push((config.name.clone(), strategy.clone()));
            record_configs.push(config);
        }
        strategies.insert(config.name.clone(), strategy);
    }
    let fail_on_file_error = record_configs
        .iter()
        .any(|c| c.on_error == ErrorPolicy::FailRun);

    // Files are read in bounded windows; parts are merged in selection order
    let reader = reader(env);
    let window = env.config.workers.max(1) * 2;
    let mut parts: HashMap<String, Vec<ExtractedTable>> = HashMap::new();
    if !record_strategies.is_empty() {
        for batch in selected.files.chunks(window) {
            env.token.checkpoint()?;
            let results: Vec<EngineResult<FileParts>> = env.pool.install(|| {
                batch
                    .par_iter()
                    .map(|f| reader.extract(f, &record_strategies))
                    .collect()
            });
            for (file, result) in batch.iter().zip(results) {
                match result {
                    Ok(file_parts) => {
                        if file_parts.fallback {
                            env.diagnostics.warn(
                                DiagnosticKind::StreamingFallback,
                                &file.relative,
                                "adapter cannot stream this file; read in full",
                            );
                        }
                        let named = file_parts.parts.into_iter().zip(&record_configs);
                        for ((name, part), config) in named {
                            match part {
                                Ok(table) => parts.entry(name).or_default().push(table),
                                Err(err) => table_failure(
                                    env.diagnostics,
                                    config,
                                    &format!("{name} ({})", file.relative),
                                    err,
                                )?,
                            }
                        }
                    }
                    Err(err) if err.is_file_scoped() && !fail_on_file_error => {
                        env.diagnostics
                            .warn(diagnostic_kind(&err), &file.relative, err.to_string());
                    }
                    Err(err) => return Err(err),
                }
            }
            let substeps: Vec<String> = batch
                .iter()
                .map(|f| format!("file:{}", f.relative))
                .collect();
            env.checkpoint.checkpoint(env.stage_id, &substeps)?;
        }
    }

    let mut set = TableSet::new();
    for config in &configs {
        let strategy = &strategies[&config.name];
        let built = if strategy.reads_files() {
            Ok(concat_tables(
                &config.name,
                parts.remove(&config.name).unwrap_or_default(),
            ))
        } else {
            extract_table(strategy, StrategyInput::Tables(&set), &config.name)
        };
        let table = match built.and_then(|t| finish_table(t, config, &context, &pipeline)) {
            Ok(table) => table,
            Err(err) => {
                table_failure(env.diagnostics, config, &config.name, err)?;
                continue;
            }
        };
        let Some(table) = check_stability(env, config, table)? else {
            continue;
        };
        if !table.validation_warnings.is_empty() {
            env.diagnostics.warn(
                DiagnosticKind::ValidationWarnings,
                &table.name,
                format!("{} validation warning(s)", table.validation_warnings.len()),
            );
        }
        debug!(table = %table.name, rows = table.row_count(), "Extracted table");
        set.insert(config.name.clone(), Arc::new(table));
    }

    let ordered: Vec<Arc<ExtractedTable>> = configs
        .iter()
        .filter_map(|c| set.get(&c.name).cloned())
        .collect();
    let committed = commit_tables(env, ordered.iter().map(Arc::as_ref), OutputFormat::Parquet)?;
    // A re-run keeps the files committed first; downstream reads those
    for entry in &committed {
        if set
            .get(&entry.table)
            .is_some_and(|t| t.row_count() != entry.row_count)
        {
            warn!(
                table = %entry.table,
                stored_rows = entry.row_count,
                "Extracted table differs from the stored one, using the stored table"
            );
            set.insert(entry.table.clone(), Arc::new(env.store.read_table(entry)?));
        }
    }
    info!(tables = committed.len(), files = selected.files.len(), "Parsed tables");
    Ok(StageOutput::Parse(ParsedTables {
        committed,
        tables: set,
    }))
}

/// Write the requested tables, output joins and aggregations
pub fn run_export(env: &mut StageEnv<'_>, upstream: &Upstream<'_>) -> EngineResult<StageOutput> {
    let profile = env.profile;
    let parsed = upstream.parsed()?;

    let mut tables: BTreeMap<String, Arc<ExtractedTable>> = BTreeMap::new();
    for entry in &parsed.committed {
        let table = match parsed.tables.get(&entry.table) {
            Some(table) => Arc::clone(table),
            None => Arc::new(env.store.read_table(entry)?),
        };
        tables.insert(entry.table.clone(), table);
    }
    let parse_names: Vec<String> = parsed.committed.iter().map(|e| e.table.clone()).collect();

    let mut derived: Vec<String> = Vec::new();
    for join in &profile.output.joins {
        let (Some(left), Some(right)) = (tables.get(&join.left), tables.get(&join.right)) else {
            env.diagnostics.error(
                DiagnosticKind::TableError,
                &join.name,
                format!("inputs '{}' and '{}' are not both available", join.left, join.right),
            );
            continue;
        };
        match join.apply(left, right) {
            Ok(table) => {
                tables.insert(join.name.clone(), Arc::new(table));
                derived.push(join.name.clone());
            }
            Err(err) => env
                .diagnostics
                .error(DiagnosticKind::TableError, &join.name, err.to_string()),
        }
    }
    for aggregation in &profile.output.aggregations {
        let Some(source) = tables.get(&aggregation.table) else {
            env.diagnostics.error(
                DiagnosticKind::TableError,
                &aggregation.name,
                format!("input '{}' is not available", aggregation.table),
            );
            continue;
        };
        match aggregation.apply(source) {
            Ok(table) => {
                tables.insert(aggregation.name.clone(), Arc::new(table));
                derived.push(aggregation.name.clone());
            }
            Err(err) => env
                .diagnostics
                .error(DiagnosticKind::TableError, &aggregation.name, err.to_string()),
        }
    }

    let outputs: Vec<String> = match &env.params.outputs {
        Some(outputs) => outputs.clone(),
        None => {
            let mut outputs = if profile.output.default_outputs.is_empty() {
                parse_names
            } else {
                profile
                    .output
                    .default_outputs
                    .iter()
                    .filter(|t| parse_names.contains(t))
                    .cloned()
                    .collect()
            };
            outputs.extend(derived);
            outputs
        }
    };
    let mut written: Vec<Arc<ExtractedTable>> = Vec::new();
    for name in &outputs {
        let table = tables
            .get(name)
            .ok_or_else(|| EngineError::not_found("output table", name.clone()))?;
        if !written.iter().any(|t| t.name == *name) {
            written.push(Arc::clone(table));
        }
    }

    let committed = commit_tables(env, written.iter().map(Arc::as_ref), profile.output.format)?;
    info!(outputs = committed.len(), format = ?profile.output.format, "Exported tables");
    Ok(StageOutput::Export(committed))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{FileValidation, TableSummary};
    use crate::extraction::StrategyKind;
    use crate::models::DataFrame;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn summary(columns: &[&str], format: FileFormat) -> SchemaSummary {
        SchemaSummary {
            path: PathBuf::from("a"),
            format,
            tables: vec![TableSummary {
                name: "Sheet1".into(),
                columns: columns.iter().map(|c| c.to_string()).collect(),
                sampled_rows: 1,
            }],
            row_count: None,
            truncated: false,
        }
    }

    #[test]
    fn test_offers_by_path_and_sheet() {
        let repeat = StrategyType::from_params(StrategyKind::RepeatOver, &json!({"path": "images"}))
            .unwrap();
        assert!(offers(&repeat, &summary(&["wafer", "images"], FileFormat::Json)));
        assert!(!offers(&repeat, &summary(&["wafer"], FileFormat::Json)));
        assert!(offers(&repeat, &summary(&[], FileFormat::Json)));
        assert!(offers(&repeat, &summary(&["x"], FileFormat::Csv)));

        let sheet = StrategyType::from_params(StrategyKind::HeadersData, &json!({"sheet": "Data"}))
            .unwrap();
        assert!(!offers(&sheet, &summary(&["a"], FileFormat::Excel)));
        let flat = StrategyType::from_params(StrategyKind::FlatObject, &Value::Null).unwrap();
        assert!(offers(&flat, &summary(&["a"], FileFormat::Json)));
    }

    #[test]
    fn test_identity_inputs_only_cover_own_fields() {
        let params = StageParams::new()
            .with_source("/data/in")
            .with_tables(["a"])
            .with_preview_rows(5);
        assert_eq!(
            params.identity_inputs(StageType::Discovery),
            json!({"source": "data/in", "pattern": null})
        );
        assert_eq!(params.identity_inputs(StageType::Parse), json!({}));
        assert_eq!(
            params.identity_inputs(StageType::TableSelection),
            json!({"tables": ["a"]})
        );
        assert_eq!(
            params.identity_inputs(StageType::Preview),
            json!({"preview_rows": 5})
        );
    }

    #[test]
    fn test_stage_output_payload_roundtrip() {
        let output = StageOutput::TableSelection(vec!["a".into(), "b".into()]);
        let value = serde_json::to_value(&output).unwrap();
        assert_eq!(value["stage"], "table_selection");
        let back: StageOutput = serde_json::from_value(value).unwrap();
        assert_eq!(back, output);
        assert!(back.committed().is_empty());
    }

    /// Adapter whose document reads cancel the run and then stall
    struct StallingAdapter {
        token: CancellationToken,
        calls: Arc<AtomicUsize>,
    }

    impl Adapter for StallingAdapter {
        fn format(&self) -> FileFormat {
            FileFormat::Json
        }

        fn probe_schema(&self, path: &Path, _probe_bytes: usize) -> EngineResult<SchemaSummary> {
            Err(EngineError::Storage(format!("no schema for {}", path.display())))
        }

        fn validate_file(&self, path: &Path) -> EngineResult<FileValidation> {
            Ok(FileValidation::ok(path))
        }

        fn read_dataframe(&self, path: &Path) -> EngineResult<DataFrame> {
            Err(EngineError::Storage(format!("no frame for {}", path.display())))
        }

        fn read_document(&self, path: &Path) -> EngineResult<RawDocument> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.token.cancel(true);
            std::thread::sleep(Duration::from_millis(300));
            Err(EngineError::Storage(format!("stalled on {}", path.display())))
        }
    }

    #[test]
    fn test_timed_read_not_retried_after_cancel() {
        let token = CancellationToken::new();
        token.begin("parse");
        let calls = Arc::new(AtomicUsize::new(0));
        let adapter: Arc<dyn Adapter> = Arc::new(StallingAdapter {
            token: token.clone(),
            calls: Arc::clone(&calls),
        });

        let result = timed(
            "read_document",
            Duration::from_millis(50),
            &token,
            &adapter,
            Path::new("slow.json"),
            |a, p| a.read_document(p),
        );
        assert!(matches!(result, Err(EngineError::Cancelled { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_commit_stops_between_tables_once_cancelled() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = EngineConfig::default();
        let registry = AdapterRegistry::with_defaults();
        let store = ArtifactStore::new(dir.path().join("artifacts"));
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(1)
            .build()
            .unwrap();
        let profile = ExtractionProfile::from_yaml_str(
            "id: pair\nversion: \"1\"\ntables:\n  - name: a\n    strategy: flat_object\n",
        )
        .unwrap();
        let params = StageParams::new();
        let stage_id = StageId::from("0000c0de");
        let mut checkpoint =
            CheckpointManager::create(&store.run_dir("run"), "run", "pair@1").unwrap();
        let mut diagnostics = DiagnosticSink::new(StageType::Parse, stage_id.clone());
        let token = CancellationToken::new();
        token.begin("parse");
        let stage_dir = store.stage_dir("run", StageType::Parse, &stage_id);

        let tables = [
            ExtractedTable::new("a", vec!["x".into()], vec![vec![json!(1)]]),
            ExtractedTable::new("b", vec!["x".into()], vec![vec![json!(2)]]),
        ];
        let mut env = StageEnv {
            config: &config,
            registry: &registry,
            store: &store,
            pool: &pool,
            profile: &profile,
            params: &params,
            stage_id: &stage_id,
            stage_dir: stage_dir.clone(),
            token: &token,
            checkpoint: &mut checkpoint,
            diagnostics: &mut diagnostics,
        };
        // The request arrives after the first table was committed
        let result = commit_tables(
            &mut env,
            tables.iter().inspect(|t| {
                if t.name == "b" {
                    token.cancel(true);
                }
            }),
            OutputFormat::Parquet,
        );
        assert!(matches!(
            result,
            Err(EngineError::Cancelled {
                completed_units: 1,
                ..
            })
        ));

        let committed: Vec<&str> = checkpoint
            .committed_tables(&stage_id)
            .iter()
            .map(|t| t.table.as_str())
            .collect();
        assert_eq!(committed, vec!["a"]);
        assert_eq!(
            checkpoint.progress(&stage_id).unwrap().completed_substeps,
            vec!["table:a".to_string()]
        );
        assert!(stage_dir.join("a.parquet").exists());
        assert!(!stage_dir.join("b.parquet").exists());
    }
}
