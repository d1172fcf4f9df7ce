//! Error types for engine operations
//!
//! Every failure the engine surfaces is an [`EngineError`]. Callers that map
//! errors onto a transport (HTTP status codes, exit codes) should match on
//! [`EngineError::kind`] rather than on display strings.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while running an extraction
#[derive(Error, Debug)]
pub enum EngineError {
    /// Forward gating violated: an upstream stage is not locked
    #[error("Stage '{stage}' is gated: {reason}")]
    Gate { stage: String, reason: String },

    /// Lock or unlock precondition violated
    #[error("Cannot change lock on stage {stage_id}: {reason}")]
    Lock { stage_id: String, reason: String },

    /// Non-cascading unlock attempted while downstream stages are locked
    #[error("Stage {stage_id} has locked downstream stages: {}", .downstream.join(", "))]
    DownstreamLocked {
        stage_id: String,
        downstream: Vec<String>,
    },

    /// No adapter is registered for the requested format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Validation failures escalated by the caller
    #[error("Validation failed for table '{table}': {} issue(s)", .failures.len())]
    ValidationFailure { table: String, failures: Vec<String> },

    /// Join key missing from one side of a join
    #[error("Join key '{key}' not found in {side} table '{table}'")]
    JoinKeyMismatch {
        key: String,
        side: String,
        table: String,
    },

    /// Adapter operation exceeded its time budget
    #[error("Operation '{operation}' timed out after {budget_ms}ms")]
    Timeout { operation: String, budget_ms: u64 },

    /// Two different inputs produced the same truncated stage id
    #[error("Stage id collision on {stage_id}: existing digest {existing}, incoming {incoming}")]
    IdCollision {
        stage_id: String,
        existing: String,
        incoming: String,
    },

    /// The run has been cancelled and accepts no further work
    #[error("Run {0} is being cancelled")]
    CancellationInProgress(String),

    /// A stage observed a cancellation request at a yield point
    #[error("Stage '{stage}' cancelled after {completed_units} completed unit(s)")]
    Cancelled {
        stage: String,
        completed_units: usize,
    },

    /// A context rule declared `on_fail: fail_run` and produced no value
    #[error("Context key '{key}' could not be resolved: {reason}")]
    ContextResolution { key: String, reason: String },

    /// Profile failed structural validation
    #[error("Invalid profile: {0}")]
    InvalidProfile(String),

    /// Strategy parameters do not match the selected strategy
    #[error("Invalid parameters for table '{table}': {reason}")]
    InvalidStrategyParams { table: String, reason: String },

    /// Governance limit exceeded
    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Expression failed to parse or evaluate
    #[error("Expression error: {0}")]
    Expression(String),

    /// Run, stage, profile or table not found
    #[error("{what} not found: {id}")]
    NotFound { what: &'static str, id: String },

    /// Adapter failed to read a file
    #[error("Adapter error reading {path}: {message}")]
    Adapter { path: PathBuf, message: String },

    /// Artifact store failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid engine configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Stable error classification for transport-level mapping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Gate,
    Lock,
    DownstreamLocked,
    UnsupportedFormat,
    ValidationFailure,
    JoinKeyMismatch,
    Timeout,
    IdCollision,
    CancellationInProgress,
    Cancelled,
    Context,
    InvalidInput,
    LimitExceeded,
    NotFound,
    Internal,
}

impl EngineError {
    /// Create a gate error
    pub fn gate(stage: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Gate {
            stage: stage.into(),
            reason: reason.into(),
        }
    }

    /// Create a lock error
    pub fn lock(stage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Lock {
            stage_id: stage_id.into(),
            reason: reason.into(),
        }
    }

    /// Create a not-found error
    pub fn not_found(what: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            id: id.into(),
        }
    }

    /// Create an adapter error for a file
    pub fn adapter(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self::Adapter {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Classify the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Gate { .. } => ErrorKind::Gate,
            Self::Lock { .. } => ErrorKind::Lock,
            Self::DownstreamLocked { .. } => ErrorKind::DownstreamLocked,
            Self::UnsupportedFormat(_) => ErrorKind::UnsupportedFormat,
            Self::ValidationFailure { .. } => ErrorKind::ValidationFailure,
            Self::JoinKeyMismatch { .. } => ErrorKind::JoinKeyMismatch,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::IdCollision { .. } => ErrorKind::IdCollision,
            Self::CancellationInProgress(_) => ErrorKind::CancellationInProgress,
            Self::Cancelled { .. } => ErrorKind::Cancelled,
            Self::ContextResolution { .. } => ErrorKind::Context,
            Self::InvalidProfile(_)
            | Self::InvalidStrategyParams { .. }
            | Self::Expression(_)
            | Self::Config(_)
            | Self::Yaml(_) => ErrorKind::InvalidInput,
            Self::LimitExceeded(_) => ErrorKind::LimitExceeded,
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::Adapter { .. } | Self::Storage(_) | Self::Io(_) | Self::Json(_) => {
                ErrorKind::Internal
            }
        }
    }

    /// Check if this error may succeed on a retry with identical inputs
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Check if this error is isolated to a single file or table
    ///
    /// Isolated errors are recorded as diagnostics instead of aborting the
    /// stage, unless the profile asks for `fail_run`.
    pub fn is_file_scoped(&self) -> bool {
        matches!(
            self,
            Self::Adapter { .. }
                | Self::Io(_)
                | Self::Json(_)
                | Self::Timeout { .. }
                | Self::UnsupportedFormat(_)
                | Self::Expression(_)
                | Self::JoinKeyMismatch { .. }
        )
    }

    /// Get a user-friendly error message for CLI output
    pub fn user_message(&self) -> String {
        match self {
            Self::Gate { stage, reason } => {
                format!(
                    "Stage '{stage}' cannot start: {reason}\n\n\
                    Hint: Lock the upstream stages first."
                )
            }
            Self::DownstreamLocked {
                stage_id,
                downstream,
            } => format!(
                "Stage {stage_id} has locked downstream stages ({}).\n\n\
                Hint: Unlock with cascade to release them together.",
                downstream.join(", ")
            ),
            Self::UnsupportedFormat(format) => format!(
                "Unsupported format: {format}\n\n\
                Hint: Supported formats are csv, excel, json and parquet."
            ),
            Self::IdCollision { stage_id, .. } => format!(
                "Stage id collision on {stage_id}. \
                This is a bug; please report it with the profile used."
            ),
            Self::InvalidProfile(msg) => {
                format!(
                    "Invalid profile: {msg}\n\n\
                    Hint: Check the profile document against its schema_version."
                )
            }
            _ => self.to_string(),
        }
    }
}
