//! Engine configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

/// Default size at which files must be read through the streaming path (10 MiB)
pub const DEFAULT_STREAM_THRESHOLD: u64 = 10 * 1024 * 1024;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root directory for run artifacts and locked schemas
    pub artifact_root: PathBuf,
    /// Files at or above this size are streamed when the adapter supports it
    pub stream_threshold_bytes: u64,
    /// Rows per streamed chunk
    pub chunk_rows: usize,
    /// Time budget for schema probes
    pub probe_timeout_ms: u64,
    /// Time budget for full reads and validation
    pub read_timeout_ms: u64,
    /// Worker threads for parallel file reads within a stage
    pub workers: usize,
    /// Bytes inspected by a schema probe
    pub probe_bytes: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            artifact_root: PathBuf::from("artifacts"),
            stream_threshold_bytes: DEFAULT_STREAM_THRESHOLD,
            chunk_rows: 10_000,
            probe_timeout_ms: 1_000,
            read_timeout_ms: 60_000,
            workers: 4,
            probe_bytes: 64 * 1024,
        }
    }
}

impl EngineConfig {
    /// Create a new engine config
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn load(path: &Path) -> EngineResult<Self> {
        if !path.exists() {
            return Err(EngineError::not_found("config file", path.display().to_string()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| EngineError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Set the artifact root
    pub fn with_artifact_root(mut self, path: impl Into<PathBuf>) -> Self {
        self.artifact_root = path.into();
        self
    }

    /// Set the streaming threshold in bytes
    pub fn with_stream_threshold(mut self, bytes: u64) -> Self {
        self.stream_threshold_bytes = bytes;
        self
    }

    /// Set the rows per streamed chunk
    pub fn with_chunk_rows(mut self, rows: usize) -> Self {
        self.chunk_rows = rows;
        self
    }

    /// Set the probe time budget
    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the read time budget
    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Set the number of worker threads
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Probe time budget as a duration
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Read time budget as a duration
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    /// Validate the configuration
    pub fn validate(&self) -> EngineResult<()> {
        if self.chunk_rows == 0 {
            return Err(EngineError::Config("chunk_rows must be at least 1".to_string()));
        }
        if self.workers == 0 {
            return Err(EngineError::Config("workers must be at least 1".to_string()));
        }
        if self.probe_timeout_ms == 0 || self.read_timeout_ms == 0 {
            return Err(EngineError::Config("timeouts must be non-zero".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_engine_config_default() {
        let config = EngineConfig::default();
        assert_eq!(config.stream_threshold_bytes, 10 * 1024 * 1024);
        assert_eq!(config.probe_timeout(), Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_engine_config_builder() {
        let config = EngineConfig::new()
            .with_artifact_root("/tmp/out")
            .with_chunk_rows(50)
            .with_workers(2);
        assert_eq!(config.artifact_root, PathBuf::from("/tmp/out"));
        assert_eq!(config.chunk_rows, 50);
        assert_eq!(config.workers, 2);
    }

    #[test]
    fn test_engine_config_validation() {
        assert!(EngineConfig::new().with_chunk_rows(0).validate().is_err());
        assert!(EngineConfig::new().with_workers(0).validate().is_err());
    }

    #[test]
    fn test_engine_config_load_toml() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("engine.toml");
        std::fs::write(
            &path,
            "artifact_root = \"runs\"\nchunk_rows = 500\nworkers = 8\n",
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.artifact_root, PathBuf::from("runs"));
        assert_eq!(config.chunk_rows, 500);
        assert_eq!(config.workers, 8);
        // Unset fields keep their defaults
        assert_eq!(config.probe_timeout_ms, 1_000);
    }
}
