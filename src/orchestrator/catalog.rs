//! Registered profiles

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::ExtractionProfile;

/// Catalog key of a registered profile, `id@version`
pub type ProfileKey = String;

#[derive(Debug, Clone)]
struct Entry {
    profile: Arc<ExtractionProfile>,
    digest: String,
}

/// Profiles by id and version
///
/// Versions of one id are kept in registration order; `id` alone resolves to
/// the most recently registered version.
#[derive(Debug, Default)]
pub struct ProfileCatalog {
    profiles: BTreeMap<String, Vec<(String, Entry)>>,
}

impl ProfileCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a validated profile
    ///
    /// Registering identical content again is a no-op. A different document
    /// under an existing `id@version` is rejected: versions are immutable.
    pub fn register(&mut self, profile: ExtractionProfile) -> EngineResult<ProfileKey> {
        profile.validate()?;
        let digest = profile.digest()?;
        let key = profile.key();
        let versions = self.profiles.entry(profile.id.clone()).or_default();
        if let Some((_, existing)) = versions.iter().find(|(v, _)| *v == profile.version) {
            if existing.digest != digest {
                return Err(EngineError::InvalidProfile(format!(
                    "{key} is already registered with different content; bump the version"
                )));
            }
            return Ok(key);
        }
        info!(profile = %key, tables = profile.tables.len(), "Registered profile");
        versions.push((
            profile.version.clone(),
            Entry {
                profile: Arc::new(profile),
                digest,
            },
        ));
        Ok(key)
    }

    /// Resolve `id` or `id@version`
    pub fn get(&self, reference: &str) -> EngineResult<Arc<ExtractionProfile>> {
        let (id, version) = match reference.split_once('@') {
            Some((id, version)) => (id, Some(version)),
            None => (reference, None),
        };
        let versions = self
            .profiles
            .get(id)
            .ok_or_else(|| EngineError::not_found("profile", reference))?;
        let entry = match version {
            Some(version) => versions.iter().find(|(v, _)| v == version),
            None => versions.last(),
        };
        entry
            .map(|(_, e)| Arc::clone(&e.profile))
            .ok_or_else(|| EngineError::not_found("profile", reference))
    }

    /// Every registered key
    pub fn keys(&self) -> Vec<ProfileKey> {
        self.profiles
            .iter()
            .flat_map(|(id, versions)| versions.iter().map(move |(v, _)| format!("{id}@{v}")))
            .collect()
    }
}
