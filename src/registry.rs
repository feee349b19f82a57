// Kanban registry - load, validate, index, classify

//! # Kanban Registry
//!
//! The registry owns every loaded [`KanbanDefinition`] and two indexes:
//! `id -> definition` and `form_path -> kanban_id`. It is read-mostly:
//! lookups take a shared hold and return defensive copies, while loads and
//! registrations take an exclusive hold and swap both indexes atomically.
//!
//! Loading a directory is forgiving per file and strict per definition:
//! a malformed JSON file is reported and skipped, it never aborts the rest
//! of the load. Every validation error is attributed to its file name.
//!
//! A process-wide singleton with an init/teardown lifecycle is provided for
//! embedders that want one registry per process; library code can equally
//! construct registries directly.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use lazy_static::lazy_static;
use tracing::{info, warn};

use crate::models::kanban::{KanbanDefinition, TransitionRule};
use crate::{FlowboardError, Result};

#[derive(Default)]
struct Indexes {
    kanbans: HashMap<String, KanbanDefinition>,
    form_to_kanban: HashMap<String, String>,
}

/// Outcome of a directory load: what loaded, what failed and why.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub loaded: usize,
    /// File name paired with the error that rejected it
    pub errors: Vec<(String, FlowboardError)>,
}

/// Registry of workflow definitions and their form mappings.
pub struct KanbanRegistry {
    kanbans_dir: PathBuf,
    indexes: RwLock<Indexes>,
}

impl KanbanRegistry {
    /// Empty registry backed by `kanbans_dir` for persistence.
    pub fn new(kanbans_dir: impl Into<PathBuf>) -> Self {
        KanbanRegistry {
            kanbans_dir: kanbans_dir.into(),
            indexes: RwLock::new(Indexes::default()),
        }
    }

    /// Load every `*.json` under `kanbans_dir`, rebuilding both indexes
    /// atomically. Individual malformed files are collected into the
    /// report, not fatal.
    pub fn load_all(&self) -> Result<LoadReport> {
        let mut report = LoadReport::default();
        let mut fresh = Indexes::default();

        if !self.kanbans_dir.exists() {
            fs::create_dir_all(&self.kanbans_dir)?;
            info!(dir = %self.kanbans_dir.display(), "created kanbans directory");
        }

        let mut entries: Vec<PathBuf> = fs::read_dir(&self.kanbans_dir)?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "json"))
            .collect();
        entries.sort();

        for path in entries {
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            match Self::load_file(&path, &file_name, &fresh) {
                Ok(def) => {
                    for form in &def.linked_forms {
                        fresh.form_to_kanban.insert(form.clone(), def.id.clone());
                    }
                    fresh.kanbans.insert(def.id.clone(), def);
                    report.loaded += 1;
                }
                Err(err) => {
                    warn!(file = %file_name, error = %err, "rejected kanban definition");
                    report.errors.push((file_name, err));
                }
            }
        }

        *self.indexes.write().unwrap() = fresh;
        info!(
            loaded = report.loaded,
            rejected = report.errors.len(),
            dir = %self.kanbans_dir.display(),
            "kanban registry loaded"
        );
        Ok(report)
    }

    fn load_file(path: &Path, file_name: &str, current: &Indexes) -> Result<KanbanDefinition> {
        let contents = fs::read_to_string(path)?;
        let def: KanbanDefinition =
            serde_json::from_str(&contents).map_err(|e| FlowboardError::InvalidDefinition {
                file: file_name.to_string(),
                reason: e.to_string(),
            })?;
        def.validate(file_name)?;
        Self::check_form_partition(&def, current, file_name)?;
        Ok(def)
    }

    /// A form maps to at most one kanban process-wide.
    fn check_form_partition(
        def: &KanbanDefinition,
        indexes: &Indexes,
        file: &str,
    ) -> Result<()> {
        for form in &def.linked_forms {
            if let Some(owner) = indexes.form_to_kanban.get(form) {
                if owner != &def.id {
                    return Err(FlowboardError::InvalidDefinition {
                        file: file.to_string(),
                        reason: format!(
                            "form '{form}' is already linked to kanban '{owner}'"
                        ),
                    });
                }
            }
        }
        Ok(())
    }

    /// Reload everything from disk.
    pub fn reload(&self) -> Result<LoadReport> {
        self.load_all()
    }

    // ========== Lookups ==========

    /// Defensive copy of a definition; callers cannot mutate the index.
    pub fn get(&self, kanban_id: &str) -> Option<KanbanDefinition> {
        self.indexes.read().unwrap().kanbans.get(kanban_id).cloned()
    }

    /// Defensive copy of the definition a form is linked to.
    pub fn get_by_form(&self, form_path: &str) -> Option<KanbanDefinition> {
        let indexes = self.indexes.read().unwrap();
        indexes
            .form_to_kanban
            .get(form_path)
            .and_then(|id| indexes.kanbans.get(id))
            .cloned()
    }

    pub fn kanban_id_for_form(&self, form_path: &str) -> Option<String> {
        self.indexes
            .read()
            .unwrap()
            .form_to_kanban
            .get(form_path)
            .cloned()
    }

    pub fn is_form_linked(&self, form_path: &str) -> bool {
        self.indexes
            .read()
            .unwrap()
            .form_to_kanban
            .contains_key(form_path)
    }

    pub fn all(&self) -> Vec<KanbanDefinition> {
        self.indexes
            .read()
            .unwrap()
            .kanbans
            .values()
            .cloned()
            .collect()
    }

    pub fn ids(&self) -> Vec<String> {
        self.indexes.read().unwrap().kanbans.keys().cloned().collect()
    }

    pub fn linked_forms(&self, kanban_id: &str) -> Vec<String> {
        self.get(kanban_id)
            .map(|k| k.linked_forms)
            .unwrap_or_default()
    }

    // ========== Registration ==========

    /// Validate and index a definition; optionally persist `<id>.json`
    /// into the kanbans directory.
    pub fn register(&self, def: KanbanDefinition, persist: bool) -> Result<()> {
        let file = format!("{}.json", def.id);
        def.validate(&file)?;

        {
            let mut indexes = self.indexes.write().unwrap();
            // Drop the previous version's form links before re-checking
            // the partition, so re-registration of the same kanban works.
            indexes
                .form_to_kanban
                .retain(|_, owner| owner != &def.id);
            Self::check_form_partition(&def, &indexes, &file)?;

            for form in &def.linked_forms {
                indexes.form_to_kanban.insert(form.clone(), def.id.clone());
            }
            indexes.kanbans.insert(def.id.clone(), def.clone());
        }

        if persist {
            fs::create_dir_all(&self.kanbans_dir)?;
            let path = self.kanbans_dir.join(&file);
            fs::write(&path, serde_json::to_string_pretty(&def)?)?;
            info!(file = %path.display(), "kanban definition persisted");
        }
        Ok(())
    }

    /// Remove a definition from both indexes; optionally delete its file.
    pub fn unregister(&self, kanban_id: &str, delete_file: bool) -> Result<bool> {
        let removed = {
            let mut indexes = self.indexes.write().unwrap();
            let removed = indexes.kanbans.remove(kanban_id).is_some();
            indexes.form_to_kanban.retain(|_, owner| owner != kanban_id);
            removed
        };

        if removed && delete_file {
            let path = self.kanbans_dir.join(format!("{kanban_id}.json"));
            if path.exists() {
                fs::remove_file(&path)?;
            }
        }
        Ok(removed)
    }

    // ========== Transition classification ==========

    pub fn is_blocked(&self, kanban_id: &str, from: &str, to: &str) -> bool {
        self.get(kanban_id)
            .map_or(false, |k| k.is_blocked(from, to))
    }

    pub fn blocked_reason(&self, kanban_id: &str, from: &str, to: &str) -> Option<String> {
        self.get(kanban_id)
            .and_then(|k| k.blocked(from, to).map(|b| b.reason.clone()))
    }

    pub fn is_warned(&self, kanban_id: &str, from: &str, to: &str) -> bool {
        self.get(kanban_id).map_or(false, |k| k.is_warned(from, to))
    }

    pub fn recommended(&self, kanban_id: &str, from: &str, to: &str) -> Option<TransitionRule> {
        self.get(kanban_id)
            .and_then(|k| k.recommended(from, to).cloned())
    }

    pub fn available_from(&self, kanban_id: &str, from: &str) -> Vec<TransitionRule> {
        self.get(kanban_id)
            .map(|k| k.available_from(from).into_iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The engine-wide contract: permitted unless explicitly blocked.
    pub fn can_transition(&self, kanban_id: &str, from: &str, to: &str) -> bool {
        !self.is_blocked(kanban_id, from, to)
    }
}

// ========== Process-wide singleton ==========

lazy_static! {
    static ref GLOBAL: RwLock<Option<Arc<KanbanRegistry>>> = RwLock::new(None);
}

/// Initialize the process-wide registry and load its directory.
pub fn init_global(kanbans_dir: impl Into<PathBuf>) -> Result<LoadReport> {
    let registry = Arc::new(KanbanRegistry::new(kanbans_dir));
    let report = registry.load_all()?;
    *GLOBAL.write().unwrap() = Some(registry);
    Ok(report)
}

/// The process-wide registry, if initialized.
pub fn global() -> Option<Arc<KanbanRegistry>> {
    GLOBAL.read().unwrap().clone()
}

/// Tear the process-wide registry down (tests, reconfiguration).
pub fn teardown_global() {
    *GLOBAL.write().unwrap() = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kanban::tests::sample_kanban;

    fn registry_with_sample() -> KanbanRegistry {
        let registry = KanbanRegistry::new(tempfile::tempdir().unwrap().path());
        registry.register(sample_kanban(), false).unwrap();
        registry
    }

    #[test]
    fn test_register_and_lookup() {
        let registry = registry_with_sample();

        let def = registry.get("pedidos").unwrap();
        assert_eq!(def.name, "Pedidos");
        assert_eq!(registry.get_by_form("pedidos").unwrap().id, "pedidos");
        assert!(registry.is_form_linked("pedidos"));
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_defensive_copy() {
        let registry = registry_with_sample();

        let mut copy = registry.get("pedidos").unwrap();
        copy.name = "Mutated".to_string();
        copy.states.clear();

        assert_eq!(registry.get("pedidos").unwrap().name, "Pedidos");
        assert_eq!(registry.get("pedidos").unwrap().states.len(), 3);
    }

    #[test]
    fn test_form_partition_enforced() {
        let registry = registry_with_sample();

        let mut other = sample_kanban();
        other.id = "outro".to_string();
        // Still links form "pedidos", owned by kanban "pedidos"
        let err = registry.register(other, false).unwrap_err();
        assert!(matches!(err, FlowboardError::InvalidDefinition { .. }));

        // Re-registering the owner itself is fine
        registry.register(sample_kanban(), false).unwrap();
    }

    #[test]
    fn test_load_all_collects_per_file_errors() {
        let dir = tempfile::tempdir().unwrap();
        let good = sample_kanban();
        std::fs::write(
            dir.path().join("pedidos.json"),
            serde_json::to_string_pretty(&good).unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(
            dir.path().join("empty_states.json"),
            r#"{"id": "x", "name": "X", "states": []}"#,
        )
        .unwrap();

        let registry = KanbanRegistry::new(dir.path());
        let report = registry.load_all().unwrap();

        assert_eq!(report.loaded, 1);
        assert_eq!(report.errors.len(), 2);
        assert!(registry.get("pedidos").is_some());
        // Error attribution carries the file name
        assert!(report.errors.iter().any(|(f, _)| f == "broken.json"));
    }

    #[test]
    fn test_persist_and_unregister_file() {
        let dir = tempfile::tempdir().unwrap();
        let registry = KanbanRegistry::new(dir.path());

        registry.register(sample_kanban(), true).unwrap();
        assert!(dir.path().join("pedidos.json").exists());

        assert!(registry.unregister("pedidos", true).unwrap());
        assert!(!dir.path().join("pedidos.json").exists());
        assert!(registry.get("pedidos").is_none());
        assert!(!registry.is_form_linked("pedidos"));
    }

    #[test]
    fn test_classification_predicates() {
        let registry = KanbanRegistry::new(tempfile::tempdir().unwrap().path());
        let mut def = sample_kanban();
        def.blocked_transitions.push(crate::BlockedTransition {
            from: "novo".to_string(),
            to: "aprovado".to_string(),
            reason: "skip_review".to_string(),
        });
        registry.register(def, false).unwrap();

        assert!(registry.is_blocked("pedidos", "novo", "aprovado"));
        assert!(!registry.can_transition("pedidos", "novo", "aprovado"));
        assert_eq!(
            registry.blocked_reason("pedidos", "novo", "aprovado"),
            Some("skip_review".to_string())
        );

        assert!(registry.can_transition("pedidos", "novo", "em_analise"));
        assert_eq!(registry.available_from("pedidos", "novo").len(), 1);

        // Unknown kanban: nothing blocked, nothing recommended
        assert!(registry.can_transition("ghost", "a", "b"));
        assert!(registry.available_from("ghost", "a").is_empty());
    }
}
