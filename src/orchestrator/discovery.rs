//! File discovery under a source root

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use rayon::ThreadPool;
use rayon::prelude::*;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::adapters::AdapterRegistry;
use crate::error::{EngineError, EngineResult};
use crate::identity::relative_path;
use crate::models::{ExtractionProfile, FileFormat};

/// A candidate file found by discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveredFile {
    pub path: PathBuf,
    /// Path relative to the source root with `/` separators
    pub relative: String,
    pub format: FileFormat,
    pub size: u64,
    /// Hex SHA-256 of the file content
    pub sha256: String,
}

impl DiscoveredFile {
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.relative.clone())
    }
}

/// A file filtered out for a reason worth reporting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedFile {
    pub relative: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoveryScan {
    /// Files sorted by relative path
    pub files: Vec<DiscoveredFile>,
    pub skipped: Vec<SkippedFile>,
}

/// Hex SHA-256 of a file, streamed through the hasher
pub fn hash_file(path: &Path) -> EngineResult<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// Glob patterns to expand: an explicit pattern wins over the profile includes
fn patterns(pattern: Option<&str>, profile: &ExtractionProfile) -> Vec<String> {
    match pattern {
        Some(p) => vec![p.to_string()],
        None if profile.datasource.filters.include.is_empty() => vec!["**/*".to_string()],
        None => profile.datasource.filters.include.clone(),
    }
}

/// Find, filter and hash the files of a source root
///
/// Files over `max_file_size` are skipped and reported; exceeding
/// `max_files` or `max_total_size` fails the whole scan.
pub fn discover_files(
    root: &Path,
    pattern: Option<&str>,
    profile: &ExtractionProfile,
    registry: &AdapterRegistry,
    pool: &ThreadPool,
) -> EngineResult<DiscoveryScan> {
    if !root.is_dir() {
        return Err(EngineError::not_found("source directory", root.display().to_string()));
    }
    let filters = &profile.datasource.filters;
    let excludes = filters
        .exclude
        .iter()
        .map(|p| glob::Pattern::new(p))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| EngineError::InvalidProfile(format!("exclude pattern: {e}")))?;
    let name_pattern = filters
        .name_pattern
        .as_deref()
        .map(Regex::new)
        .transpose()
        .map_err(|e| EngineError::InvalidProfile(format!("name_pattern: {e}")))?;
    let limits = &profile.governance.limits;

    // Keyed by relative path so overlapping patterns yield each file once
    let mut candidates: BTreeMap<String, (PathBuf, FileFormat, u64)> = BTreeMap::new();
    let mut scan = DiscoveryScan::default();
    let escaped_root = glob::Pattern::escape(&root.to_string_lossy());
    for pattern in patterns(pattern, profile) {
        let full_pattern = format!("{}/{}", escaped_root.trim_end_matches('/'), pattern);
        let entries = glob::glob(&full_pattern)
            .map_err(|e| EngineError::InvalidProfile(format!("{pattern}: {e}")))?;
        for entry in entries {
            let path = match entry {
                Ok(path) if path.is_file() => path,
                Ok(_) => continue,
                Err(e) => {
                    tracing::warn!("Error accessing path: {}", e);
                    continue;
                }
            };
            let relative = relative_path(&path, root);
            if candidates.contains_key(&relative) {
                continue;
            }
            if excludes.iter().any(|p| p.matches(&relative)) {
                debug!(file = %relative, "Excluded by filter");
                continue;
            }
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            if name_pattern.as_ref().is_some_and(|re| !re.is_match(&file_name)) {
                continue;
            }
            let Some(format) = FileFormat::from_path(&path) else {
                debug!(file = %relative, "No adapter for extension");
                continue;
            };
            if profile.datasource.format.is_some_and(|f| f != format)
                || registry.get(format).is_err()
            {
                continue;
            }
            let size = std::fs::metadata(&path)?.len();
            if let Some(max) = limits.max_file_size {
                if size > max {
                    scan.skipped.push(SkippedFile {
                        relative,
                        reason: format!("{size} bytes exceeds max_file_size {max}"),
                    });
                    continue;
                }
            }
            candidates.insert(relative, (path, format, size));
        }
    }

    if let Some(max) = limits.max_files {
        if candidates.len() > max {
            return Err(EngineError::LimitExceeded(format!(
                "{} files found, max_files is {max}",
                candidates.len()
            )));
        }
    }
    let total: u64 = candidates.values().map(|(_, _, size)| size).sum();
    if let Some(max) = limits.max_total_size {
        if total > max {
            return Err(EngineError::LimitExceeded(format!(
                "{total} bytes found, max_total_size is {max}"
            )));
        }
    }

    let candidates: Vec<(String, (PathBuf, FileFormat, u64))> = candidates.into_iter().collect();
    scan.files = pool.install(|| {
        candidates
            .par_iter()
            .map(|(relative, (path, format, size))| {
                Ok(DiscoveredFile {
                    sha256: hash_file(path)?,
                    path: path.clone(),
                    relative: relative.clone(),
                    format: *format,
                    size: *size,
                })
            })
            .collect::<EngineResult<Vec<_>>>()
    })?;

    info!(
        root = %root.display(),
        files = scan.files.len(),
        skipped = scan.skipped.len(),
        bytes = total,
        "Discovered files"
    );
    Ok(scan)
}
