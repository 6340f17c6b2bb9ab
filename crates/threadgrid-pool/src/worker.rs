//! Worker identities and what a booted slot is dedicated to.
//!
//! A stalled work item either targets a named persistent worker script
//! or any regular request thread. The dispatch layer registers worker
//! definitions here; the upscale loop resolves stall targets against it
//! to decide what a newly booted slot runs.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

/// Lookup key for a worker: its name and script path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkerKey {
    pub name: String,
    pub script_path: PathBuf,
}

impl WorkerKey {
    pub fn new(name: impl Into<String>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_path: script_path.into(),
        }
    }
}

/// A persistent worker script threads can be dedicated to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerDefinition {
    pub name: String,
    pub script_path: PathBuf,
}

impl WorkerDefinition {
    pub fn new(name: impl Into<String>, script_path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            script_path: script_path.into(),
        }
    }

    pub fn key(&self) -> WorkerKey {
        WorkerKey::new(self.name.clone(), self.script_path.clone())
    }
}

/// What a booted slot serves.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SlotTarget {
    /// Generic request-servicing thread.
    #[default]
    Regular,
    /// Dedicated to a persistent worker script.
    Worker(Arc<WorkerDefinition>),
}

impl SlotTarget {
    pub fn worker_name(&self) -> Option<&str> {
        match self {
            SlotTarget::Regular => None,
            SlotTarget::Worker(def) => Some(&def.name),
        }
    }
}

impl fmt::Display for SlotTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotTarget::Regular => f.write_str("regular"),
            SlotTarget::Worker(def) => write!(f, "worker:{}", def.name),
        }
    }
}

/// Registry of worker definitions, keyed by `(name, script_path)`.
#[derive(Debug, Default)]
pub struct WorkerRegistry {
    workers: RwLock<HashMap<WorkerKey, Arc<WorkerDefinition>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a worker, replacing any previous definition with the same key.
    pub fn register(&self, definition: WorkerDefinition) -> Arc<WorkerDefinition> {
        let definition = Arc::new(definition);
        self.workers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(definition.key(), definition.clone());
        definition
    }

    pub fn get(&self, name: &str, script_path: &Path) -> Option<Arc<WorkerDefinition>> {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&WorkerKey::new(name, script_path))
            .cloned()
    }

    /// Resolve a stall target: a registered worker, or a regular thread.
    pub fn resolve(&self, key: Option<&WorkerKey>) -> SlotTarget {
        key.and_then(|k| self.get(&k.name, &k.script_path))
            .map(SlotTarget::Worker)
            .unwrap_or(SlotTarget::Regular)
    }

    pub fn len(&self) -> usize {
        self.workers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_registered_worker() {
        let registry = WorkerRegistry::new();
        let def = registry.register(WorkerDefinition::new("mailer", "/app/mailer.worker"));

        let target = registry.resolve(Some(&WorkerKey::new("mailer", "/app/mailer.worker")));
        assert_eq!(target, SlotTarget::Worker(def));
        assert_eq!(target.worker_name(), Some("mailer"));
    }

    #[test]
    fn unknown_or_missing_key_resolves_to_regular() {
        let registry = WorkerRegistry::new();
        registry.register(WorkerDefinition::new("mailer", "/app/mailer.worker"));

        assert_eq!(
            registry.resolve(Some(&WorkerKey::new("mailer", "/app/other.worker"))),
            SlotTarget::Regular
        );
        assert_eq!(registry.resolve(None), SlotTarget::Regular);
    }

    #[test]
    fn register_replaces_same_key() {
        let registry = WorkerRegistry::new();
        let first = registry.register(WorkerDefinition::new("w", "/a.worker"));
        let second = registry.register(WorkerDefinition::new("w", "/a.worker"));

        assert_eq!(registry.len(), 1);
        let current = registry.get("w", Path::new("/a.worker")).unwrap();
        assert!(Arc::ptr_eq(&current, &second));
        assert!(!Arc::ptr_eq(&current, &first));
    }

    #[test]
    fn target_display() {
        assert_eq!(SlotTarget::Regular.to_string(), "regular");
        let def = Arc::new(WorkerDefinition::new("mailer", "/m.worker"));
        assert_eq!(SlotTarget::Worker(def).to_string(), "worker:mailer");
    }
}
