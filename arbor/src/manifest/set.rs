//! Manifest set validation.
//!
//! A request supplies an array of manifests plus a designated root id.
//! Validation rejects duplicate versions of one id, dangling sub-agent
//! references, and cycles in the sub-agent graph; the result is a
//! read-only resolver shared by every level of the run tree.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::error::{Error, Result};

use super::AgentManifest;

/// Canonical key of a manifest within a set: `(id, version)` encoded as
/// `id\0version`. The NUL separator cannot occur in either component, so
/// the encoding is unambiguous.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ManifestKey(String);

impl ManifestKey {
    /// Build the canonical key for an `(id, version)` pair.
    #[must_use]
    pub fn new(id: &str, version: &str) -> Self {
        Self(format!("{id}\0{version}"))
    }

    /// The manifest id component.
    #[must_use]
    pub fn id(&self) -> &str {
        self.0.split('\0').next().unwrap_or(&self.0)
    }

    /// The manifest version component.
    #[must_use]
    pub fn version(&self) -> &str {
        self.0.split('\0').nth(1).unwrap_or("")
    }
}

impl std::fmt::Display for ManifestKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.id(), self.version())
    }
}

/// A validated, read-only set of manifests rooted at one agent.
#[derive(Debug, Clone)]
pub struct ManifestSet {
    root: Arc<AgentManifest>,
    map: HashMap<ManifestKey, Arc<AgentManifest>>,
}

impl ManifestSet {
    /// Validate a manifest array against a root id.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if no manifest carries the root id.
    /// - [`Error::BadRequest`] if an id occurs with more than one
    ///   version, a sub-agent reference points outside the set, or the
    ///   sub-agent graph contains a cycle.
    pub fn validate(manifests: Vec<AgentManifest>, root_id: &str) -> Result<Self> {
        let mut map: HashMap<ManifestKey, Arc<AgentManifest>> = HashMap::new();
        let mut versions_by_id: HashMap<String, String> = HashMap::new();
        let mut root = None;

        for manifest in manifests {
            if let Some(existing) = versions_by_id.get(&manifest.id)
                && *existing != manifest.version
            {
                return Err(Error::bad_request(format!(
                    "manifest id '{}' occurs with more than one version ('{}' and '{}')",
                    manifest.id, existing, manifest.version
                )));
            }
            versions_by_id.insert(manifest.id.clone(), manifest.version.clone());

            let manifest = Arc::new(manifest);
            if manifest.id == root_id {
                root = Some(Arc::clone(&manifest));
            }
            map.insert(manifest.key(), manifest);
        }

        let root = root.ok_or_else(|| {
            Error::not_found(format!("root manifest '{root_id}' is not in the request"))
        })?;

        for manifest in map.values() {
            for reference in &manifest.sub_agents {
                if !map.contains_key(&reference.key()) {
                    return Err(Error::bad_request(format!(
                        "manifest '{}' references unknown sub-agent '{}'",
                        manifest.key(),
                        reference.key()
                    )));
                }
            }
        }

        let set = Self { root, map };
        set.check_cycles()?;
        Ok(set)
    }

    /// The root manifest of the set.
    #[must_use]
    pub fn root(&self) -> &Arc<AgentManifest> {
        &self.root
    }

    /// Resolve a manifest by key.
    #[must_use]
    pub fn get(&self, key: &ManifestKey) -> Option<&Arc<AgentManifest>> {
        self.map.get(key)
    }

    /// Resolve a manifest by id and version.
    #[must_use]
    pub fn get_by(&self, id: &str, version: &str) -> Option<&Arc<AgentManifest>> {
        self.map.get(&ManifestKey::new(id, version))
    }

    /// Resolve a manifest by key, mapping absence to [`Error::NotFound`].
    pub fn require(&self, key: &ManifestKey) -> Result<Arc<AgentManifest>> {
        self.get(key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("manifest '{key}' is not in the set")))
    }

    /// Number of manifests in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Whether the set is empty. A validated set never is.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Depth-first cycle check over the sub-agent graph. The first key
    /// found on the current recursion path reports the cycle.
    fn check_cycles(&self) -> Result<()> {
        let mut finished: HashSet<ManifestKey> = HashSet::new();
        let mut on_path: HashSet<ManifestKey> = HashSet::new();
        for key in self.map.keys() {
            self.visit(key, &mut on_path, &mut finished)?;
        }
        Ok(())
    }

    fn visit(
        &self,
        key: &ManifestKey,
        on_path: &mut HashSet<ManifestKey>,
        finished: &mut HashSet<ManifestKey>,
    ) -> Result<()> {
        if finished.contains(key) {
            return Ok(());
        }
        if !on_path.insert(key.clone()) {
            return Err(Error::bad_request(format!(
                "sub-agent graph contains a cycle through '{key}'"
            )));
        }
        if let Some(manifest) = self.map.get(key) {
            for reference in &manifest.sub_agents {
                self.visit(&reference.key(), on_path, finished)?;
            }
        }
        on_path.remove(key);
        finished.insert(key.clone());
        Ok(())
    }
}
