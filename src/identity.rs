//! Content-addressed stage identities
//!
//! A stage id is derived purely from the stage type and its canonicalized
//! inputs, so identical inputs always produce the identical id on any
//! machine. Ids are the first 8 hex characters of a SHA-256 digest; the full
//! digest is kept alongside so that a truncation collision can be detected
//! instead of silently reusing another stage's artifacts.

use std::path::Path;

use serde_json::{Map, Value};
use sha2::{Digest, Sha256};

use crate::models::{StageId, StageType};

/// Seed mixed into every stage digest
pub const DEFAULT_SEED: u64 = 42;

/// Length of a stage id in hex characters
pub const ID_LENGTH: usize = 8;

/// A computed stage identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Truncated id used as the artifact key
    pub id: StageId,
    /// Full hex digest, used for collision detection
    pub digest: String,
}

/// Compute the stage id for a stage type and its inputs using the default seed
pub fn compute_id(stage_type: StageType, inputs: &Value) -> StageId {
    compute_identity(stage_type, inputs, DEFAULT_SEED).id
}

/// Compute the full identity for a stage type and its inputs
pub fn compute_identity(stage_type: StageType, inputs: &Value, seed: u64) -> Identity {
    let canonical = canonical_json(inputs);
    let mut hasher = Sha256::new();
    hasher.update(seed.to_string().as_bytes());
    hasher.update(b"\0");
    hasher.update(stage_type.name().as_bytes());
    hasher.update(b"\0");
    hasher.update(canonical.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    Identity {
        id: StageId::new(&digest[..ID_LENGTH]),
        digest,
    }
}

/// Serialize a value with object keys in sorted order at every depth
pub fn canonical_json(value: &Value) -> String {
    canonicalize(value).to_string()
}

/// Return a copy of the value with object keys sorted at every depth
pub fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Normalize a path for use inside identity inputs
///
/// Separators become `/`, `.` segments are dropped and any root or drive
/// prefix is stripped, so the result never depends on where a tree lives.
pub fn canonical_path(path: &Path) -> String {
    let raw = path.to_string_lossy().replace('\\', "/");
    let without_drive = match raw.as_bytes() {
        [letter, b':', ..] if letter.is_ascii_alphabetic() => &raw[2..],
        _ => raw.as_str(),
    };
    without_drive
        .split('/')
        .filter(|segment| !segment.is_empty() && *segment != ".")
        .collect::<Vec<_>>()
        .join("/")
}

/// Path of `path` relative to `base`, canonicalized
///
/// Falls back to the canonical form of `path` itself when it does not live
/// under `base`.
pub fn relative_path(path: &Path, base: &Path) -> String {
    match path.strip_prefix(base) {
        Ok(relative) => canonical_path(relative),
        Err(_) => canonical_path(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_compute_id_is_deterministic() {
        let inputs = json!({"source": "data/in", "pattern": "*.json"});
        let a = compute_id(StageType::Discovery, &inputs);
        let b = compute_id(StageType::Discovery, &inputs);
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), ID_LENGTH);
        assert!(a.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_compute_id_ignores_key_order() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": {"y": 2, "x": 3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": {"x": 3, "y": 2}, "b": 1}"#).unwrap();
        assert_eq!(
            compute_id(StageType::Parse, &a),
            compute_id(StageType::Parse, &b)
        );
    }

    #[test]
    fn test_compute_id_depends_on_stage_type_and_seed() {
        let inputs = json!({"files": ["a.csv"]});
        assert_ne!(
            compute_id(StageType::Selection, &inputs),
            compute_id(StageType::Parse, &inputs)
        );
        assert_ne!(
            compute_identity(StageType::Selection, &inputs, 42).digest,
            compute_identity(StageType::Selection, &inputs, 7).digest
        );
    }

    #[test]
    fn test_identity_id_is_digest_prefix() {
        let identity = compute_identity(StageType::Export, &json!({}), DEFAULT_SEED);
        assert!(identity.digest.starts_with(identity.id.as_str()));
        assert_eq!(identity.digest.len(), 64);
    }

    #[test]
    fn test_canonical_path() {
        assert_eq!(canonical_path(Path::new("/data/in/./a.csv")), "data/in/a.csv");
        assert_eq!(canonical_path(Path::new("C:\\data\\in\\a.csv")), "data/in/a.csv");
        assert_eq!(canonical_path(Path::new("rel/a.csv")), "rel/a.csv");
    }

    #[test]
    fn test_relative_path() {
        assert_eq!(
            relative_path(Path::new("/data/in/sub/a.csv"), Path::new("/data/in")),
            "sub/a.csv"
        );
        assert_eq!(
            relative_path(Path::new("/other/a.csv"), Path::new("/data/in")),
            "other/a.csv"
        );
    }
}
