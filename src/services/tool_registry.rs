// src/services/tool_registry.rs
use dashmap::DashMap;
use glob::glob;
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::core::error::ResolveError;
use crate::core::tool_loader::{
    DefinitionSource, ScriptToolDefinition, ToolLoader, DEFINITION_FILE, SCRIPT_ID_RE,
};

/// Template-local scripts live in `<template dir>/tools/<id>/`.
pub const LOCAL_TOOLS_DIR: &str = "tools";
/// Shared scripts live in `<workspace>/resources/scripts/<id>/`.
pub const WORKSPACE_SCRIPTS_DIR: &str = "resources/scripts";

#[derive(Debug, Default)]
struct Counters {
    local_loads: AtomicU64,
    workspace_loads: AtomicU64,
    cache_hits: AtomicU64,
    load_errors: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RegistryStats {
    pub local_loads: u64,
    pub workspace_loads: u64,
    pub cache_hits: u64,
    pub load_errors: u64,
    pub cached_local: usize,
    pub cached_workspace: usize,
}

/// Two-tier script definition registry.
///
/// Lookups check the owning template's `tools/` directory first, then the
/// shared workspace directory. The first valid definition wins; tiers are
/// never merged. Cache entries are `Arc`s replaced whole, so a concurrent
/// reader sees either the old or the new definition.
#[derive(Debug)]
pub struct ScriptRegistry {
    workspace_root: PathBuf,
    local_cache: DashMap<(PathBuf, String), Arc<ScriptToolDefinition>>,
    workspace_cache: DashMap<String, Arc<ScriptToolDefinition>>,
    counters: Counters,
}

impl ScriptRegistry {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            local_cache: DashMap::new(),
            workspace_cache: DashMap::new(),
            counters: Counters::default(),
        }
    }

    pub fn workspace_root(&self) -> &Path {
        &self.workspace_root
    }

    pub fn workspace_scripts_dir(&self) -> PathBuf {
        self.workspace_root.join(WORKSPACE_SCRIPTS_DIR)
    }

    /// Rejects ids that could escape the tools directories.
    pub fn validate_id(id: &str) -> Result<(), ResolveError> {
        if id.is_empty() {
            return Err(ResolveError::InvalidScriptId {
                script_id: id.to_string(),
                reason: "id is empty".to_string(),
            });
        }
        if id.contains("..") || id.contains('/') || id.contains('\\') {
            return Err(ResolveError::InvalidScriptId {
                script_id: id.to_string(),
                reason: "id looks like a path".to_string(),
            });
        }
        if !SCRIPT_ID_RE.is_match(id) {
            return Err(ResolveError::InvalidScriptId {
                script_id: id.to_string(),
                reason: "id must match [a-zA-Z0-9_-]+".to_string(),
            });
        }
        Ok(())
    }

    /// Directories searched for `id`, in priority order.
    pub fn search_paths(&self, id: &str, owner_dir: Option<&Path>) -> Vec<PathBuf> {
        let mut paths = Vec::with_capacity(2);
        if let Some(owner) = owner_dir {
            paths.push(owner.join(LOCAL_TOOLS_DIR).join(id));
        }
        paths.push(self.workspace_scripts_dir().join(id));
        paths
    }

    /// Look up a definition. Invalid ids, missing and invalid definitions all
    /// yield `None`; invalid ones are logged and counted.
    pub fn load(&self, id: &str, owner_dir: Option<&Path>) -> Option<Arc<ScriptToolDefinition>> {
        if let Err(e) = Self::validate_id(id) {
            warn!("{}", e);
            return None;
        }

        if let Some(owner) = owner_dir {
            if let Some(def) = self.load_local(id, owner) {
                return Some(def);
            }
        }
        self.load_workspace(id)
    }

    /// Like [`load`](Self::load) but with typed errors for callers that must
    /// have the script.
    pub fn require(
        &self,
        id: &str,
        owner_dir: Option<&Path>,
    ) -> Result<Arc<ScriptToolDefinition>, ResolveError> {
        Self::validate_id(id)?;
        self.load(id, owner_dir)
            .ok_or_else(|| ResolveError::ScriptNotRegistered {
                script_id: id.to_string(),
                searched_paths: self.search_paths(id, owner_dir),
            })
    }

    pub fn exists(&self, id: &str, owner_dir: Option<&Path>) -> bool {
        self.load(id, owner_dir).is_some()
    }

    fn load_local(&self, id: &str, owner: &Path) -> Option<Arc<ScriptToolDefinition>> {
        let key = (owner.to_path_buf(), id.to_string());
        if let Some(hit) = self.local_cache.get(&key) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit.value().clone());
        }

        let dir = owner.join(LOCAL_TOOLS_DIR).join(id);
        let def = self.load_dir(&dir, id, DefinitionSource::Local)?;
        self.counters.local_loads.fetch_add(1, Ordering::Relaxed);
        self.local_cache.insert(key, def.clone());
        Some(def)
    }

    fn load_workspace(&self, id: &str) -> Option<Arc<ScriptToolDefinition>> {
        if let Some(hit) = self.workspace_cache.get(id) {
            self.counters.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Some(hit.value().clone());
        }

        let dir = self.workspace_scripts_dir().join(id);
        let def = self.load_dir(&dir, id, DefinitionSource::Workspace)?;
        self.counters.workspace_loads.fetch_add(1, Ordering::Relaxed);
        self.workspace_cache.insert(id.to_string(), def.clone());
        Some(def)
    }

    fn load_dir(&self, dir: &Path, id: &str, source: DefinitionSource) -> Option<Arc<ScriptToolDefinition>> {
        if !dir.join(DEFINITION_FILE).is_file() {
            return None;
        }
        match ToolLoader::load_from_dir(dir, id, source) {
            Ok(def) => {
                info!("🔧 Loaded script tool [{}] from {}", id, dir.display());
                Some(Arc::new(def))
            }
            Err(e) => {
                self.counters.load_errors.fetch_add(1, Ordering::Relaxed);
                warn!("Rejected script definition in {}: {:#}", dir.display(), e);
                None
            }
        }
    }

    /// Ids of every directory holding a definition file, across both tiers.
    /// Validity is not checked here.
    pub fn discover(&self, owner_dir: Option<&Path>) -> Vec<String> {
        let mut ids = BTreeSet::new();
        if let Some(owner) = owner_dir {
            ids.extend(Self::scan(&owner.join(LOCAL_TOOLS_DIR)));
        }
        ids.extend(Self::scan(&self.workspace_scripts_dir()));
        ids.into_iter().collect()
    }

    fn scan(base: &Path) -> Vec<String> {
        let pattern = base.join("*").join(DEFINITION_FILE);
        let Some(pattern_str) = pattern.to_str() else {
            warn!("Non UTF-8 tools path: {}", base.display());
            return Vec::new();
        };

        let entries = match glob(pattern_str) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Invalid glob pattern {}: {}", pattern_str, e);
                return Vec::new();
            }
        };

        entries
            .filter_map(|entry| match entry {
                Ok(path) => path
                    .parent()
                    .and_then(|p| p.file_name())
                    .and_then(|n| n.to_str())
                    .map(str::to_string),
                Err(e) => {
                    debug!("Glob error: {}", e);
                    None
                }
            })
            .filter(|id| SCRIPT_ID_RE.is_match(id))
            .collect()
    }

    /// Drops cached definitions: all of them, or only those for `id`.
    pub fn invalidate(&self, id: Option<&str>) {
        match id {
            Some(id) => {
                self.workspace_cache.remove(id);
                self.local_cache.retain(|(_, cached_id), _| cached_id != id);
                debug!("Invalidated cached script '{}'", id);
            }
            None => {
                self.workspace_cache.clear();
                self.local_cache.clear();
                debug!("Invalidated all cached scripts");
            }
        }
    }

    /// Drops cached template-local definitions under one template directory.
    pub fn invalidate_owner(&self, owner_dir: &Path) {
        self.local_cache.retain(|(owner, _), _| owner != owner_dir);
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            local_loads: self.counters.local_loads.load(Ordering::Relaxed),
            workspace_loads: self.counters.workspace_loads.load(Ordering::Relaxed),
            cache_hits: self.counters.cache_hits.load(Ordering::Relaxed),
            load_errors: self.counters.load_errors.load(Ordering::Relaxed),
            cached_local: self.local_cache.len(),
            cached_workspace: self.workspace_cache.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn write_tool(dir: &Path, id: &str, name: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(
            dir.join(DEFINITION_FILE),
            format!(r#"{{"id": "{}", "name": "{}", "script": "run.sh"}}"#, id, name),
        )
        .unwrap();
    }

    #[test]
    fn test_local_tier_wins() {
        let ws = tempfile::tempdir().unwrap();
        let owner = ws.path().join("prompts/demo");
        write_tool(&owner.join("tools/counter"), "counter", "Local Counter");
        write_tool(&ws.path().join(WORKSPACE_SCRIPTS_DIR).join("counter"), "counter", "Shared Counter");

        let registry = ScriptRegistry::new(ws.path());
        let local = registry.load("counter", Some(owner.as_path())).unwrap();
        assert_eq!(local.name, "Local Counter");
        assert_eq!(local.source, DefinitionSource::Local);

        let shared = registry.load("counter", None).unwrap();
        assert_eq!(shared.name, "Shared Counter");
        assert_eq!(shared.source, DefinitionSource::Workspace);
    }

    #[test]
    fn test_falls_back_to_workspace() {
        let ws = tempfile::tempdir().unwrap();
        let owner = ws.path().join("prompts/demo");
        fs::create_dir_all(&owner).unwrap();
        write_tool(&ws.path().join(WORKSPACE_SCRIPTS_DIR).join("lint"), "lint", "Lint");

        let registry = ScriptRegistry::new(ws.path());
        assert!(registry.exists("lint", Some(owner.as_path())));
        assert!(!registry.exists("missing", Some(owner.as_path())));
    }

    #[test]
    fn test_require_reports_searched_paths() {
        let ws = tempfile::tempdir().unwrap();
        let owner = ws.path().join("prompts/demo");
        let registry = ScriptRegistry::new(ws.path());

        match registry.require("ghost", Some(owner.as_path())) {
            Err(ResolveError::ScriptNotRegistered { searched_paths, .. }) => {
                assert_eq!(searched_paths.len(), 2);
                assert_eq!(searched_paths[0], owner.join("tools/ghost"));
            }
            other => panic!("unexpected: {:?}", other),
        }

        assert!(matches!(
            registry.require("../etc", None),
            Err(ResolveError::InvalidScriptId { .. })
        ));
    }

    #[test]
    fn test_invalidate_owner_only_touches_that_template() {
        let ws = tempfile::tempdir().unwrap();
        let alpha = ws.path().join("prompts/alpha");
        let beta = ws.path().join("prompts/beta");
        write_tool(&alpha.join("tools/counter"), "counter", "Alpha v1");
        write_tool(&beta.join("tools/counter"), "counter", "Beta v1");

        let registry = ScriptRegistry::new(ws.path());
        registry.load("counter", Some(alpha.as_path())).unwrap();
        registry.load("counter", Some(beta.as_path())).unwrap();
        assert_eq!(registry.stats().cached_local, 2);

        write_tool(&alpha.join("tools/counter"), "counter", "Alpha v2");
        write_tool(&beta.join("tools/counter"), "counter", "Beta v2");
        registry.invalidate_owner(&alpha);
        assert_eq!(registry.stats().cached_local, 1);

        assert_eq!(registry.load("counter", Some(alpha.as_path())).unwrap().name, "Alpha v2");
        assert_eq!(registry.load("counter", Some(beta.as_path())).unwrap().name, "Beta v1");
        assert_eq!(registry.stats().local_loads, 3);
    }

    #[test]
    fn test_cache_and_invalidation() {
        let ws = tempfile::tempdir().unwrap();
        let dir = ws.path().join(WORKSPACE_SCRIPTS_DIR).join("fmt");
        write_tool(&dir, "fmt", "Format v1");

        let registry = ScriptRegistry::new(ws.path());
        assert_eq!(registry.load("fmt", None).unwrap().name, "Format v1");

        write_tool(&dir, "fmt", "Format v2");
        // still served from cache
        assert_eq!(registry.load("fmt", None).unwrap().name, "Format v1");
        assert_eq!(registry.stats().cache_hits, 1);

        registry.invalidate(Some("fmt"));
        assert_eq!(registry.load("fmt", None).unwrap().name, "Format v2");
        assert_eq!(registry.stats().workspace_loads, 2);
    }

    #[test]
    fn test_invalid_definition_counted() {
        let ws = tempfile::tempdir().unwrap();
        let dir = ws.path().join(WORKSPACE_SCRIPTS_DIR).join("broken");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(DEFINITION_FILE), r#"{"id": "broken"}"#).unwrap();

        let registry = ScriptRegistry::new(ws.path());
        assert!(registry.load("broken", None).is_none());
        assert_eq!(registry.stats().load_errors, 1);
    }

    #[test]
    fn test_discover_merges_tiers() {
        let ws = tempfile::tempdir().unwrap();
        let owner = ws.path().join("prompts/demo");
        write_tool(&owner.join("tools/alpha"), "alpha", "A");
        write_tool(&owner.join("tools/shared"), "shared", "S");
        write_tool(&ws.path().join(WORKSPACE_SCRIPTS_DIR).join("shared"), "shared", "S");
        write_tool(&ws.path().join(WORKSPACE_SCRIPTS_DIR).join("zeta"), "zeta", "Z");

        let registry = ScriptRegistry::new(ws.path());
        assert_eq!(
            registry.discover(Some(owner.as_path())),
            vec!["alpha".to_string(), "shared".to_string(), "zeta".to_string()]
        );
        assert_eq!(registry.discover(None), vec!["shared".to_string(), "zeta".to_string()]);
    }
}
