// Process factory and form trigger manager

//! # Process Factory & Form Triggers
//!
//! The factory turns one form record into one process: it resolves the
//! kanban by form path, picks the initial state, applies the field mapping
//! and computes the SLA block. The trigger manager wires the factory to
//! form lifecycle events (create / update / delete) and offers bulk sync
//! for pre-existing records.
//!
//! Deleting a form record does not necessarily delete its process. By
//! default the process is kept and marked orphaned (its `source_form`
//! gains the `[DELETED] ` prefix), preserving the audit history. The
//! behavior is configurable via [`OrphanPolicy`].

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::Utc;
use serde_json::Value;
use tracing::{info, warn};

use crate::models::kanban::KanbanDefinition;
use crate::models::process::{Process, SlaConfig, ORPHAN_PREFIX};
use crate::registry::KanbanRegistry;
use crate::storage::repository::{ProcessPatch, ProcessRepository};
use crate::{FlowboardError, Result};

/// What to do with a process whose originating form record was deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OrphanPolicy {
    /// Keep the process, prefix `source_form`, clear the record index
    #[default]
    MarkOrphaned,
    /// Delete the process together with its form record
    Delete,
}

/// Stats returned by [`FormTriggerManager::sync_existing_forms`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
    pub errors: usize,
}

/// Builds process records from form data.
pub struct ProcessFactory {
    registry: Arc<KanbanRegistry>,
}

impl ProcessFactory {
    pub fn new(registry: Arc<KanbanRegistry>) -> Self {
        ProcessFactory { registry }
    }

    /// Build a process for a form save. Returns `None` when the form is
    /// not linked to any kanban.
    pub fn create_from_form(
        &self,
        form_path: &str,
        form_data: &HashMap<String, Value>,
        record_idx: i64,
    ) -> Result<Option<Process>> {
        let Some(kanban) = self.registry.get_by_form(form_path) else {
            return Ok(None);
        };

        let initial = kanban
            .initial_state()
            .ok_or_else(|| FlowboardError::InvalidDefinition {
                file: format!("{}.json", kanban.id),
                reason: "no initial state can be resolved".to_string(),
            })?
            .id
            .clone();

        let now = Utc::now();
        let process = Process {
            process_id: Self::generate_process_id(&kanban.id),
            kanban_id: kanban.id.clone(),
            source_form: form_path.to_string(),
            source_record_idx: record_idx,
            current_state: initial,
            field_values: Self::apply_field_mapping(&kanban, form_data),
            created_at: now,
            updated_at: now,
            tags: vec![],
            assigned_to: None,
            sla: Self::compute_sla(&kanban),
            metadata: HashMap::new(),
        };

        Ok(Some(process))
    }

    /// Human-readable globally unique id:
    /// `{kanban_id}_{YYYYMMDD_HHMMSS}_{8-char random}`.
    pub fn generate_process_id(kanban_id: &str) -> String {
        let timestamp = Utc::now().format("%Y%m%d_%H%M%S");
        let suffix: String = uuid::Uuid::new_v4().simple().to_string()[..8].to_string();
        format!("{kanban_id}_{timestamp}_{suffix}")
    }

    /// Map form fields to process fields. Identity when the kanban
    /// declares no mapping; otherwise unmapped fields are dropped.
    pub fn apply_field_mapping(
        kanban: &KanbanDefinition,
        form_data: &HashMap<String, Value>,
    ) -> HashMap<String, Value> {
        match &kanban.field_mapping {
            None => form_data.clone(),
            Some(mapping) if mapping.is_empty() => form_data.clone(),
            Some(mapping) => mapping
                .iter()
                .filter_map(|(form_field, process_field)| {
                    form_data
                        .get(form_field)
                        .map(|v| (process_field.clone(), v.clone()))
                })
                .collect(),
        }
    }

    /// Re-apply the field mapping over fresh form data.
    pub fn update_from_form(
        &self,
        process: &Process,
        form_data: &HashMap<String, Value>,
    ) -> Result<HashMap<String, Value>> {
        let kanban = self
            .registry
            .get(&process.kanban_id)
            .ok_or_else(|| FlowboardError::KanbanNotFound(process.kanban_id.clone()))?;
        Ok(Self::apply_field_mapping(&kanban, form_data))
    }

    /// SLA from the kanban-level `sla_hours` plus per-state overrides.
    fn compute_sla(kanban: &KanbanDefinition) -> Option<SlaConfig> {
        let state_slas: HashMap<String, f64> = kanban
            .states
            .iter()
            .filter_map(|s| s.sla_hours.map(|h| (s.id.clone(), h)))
            .collect();

        match kanban.sla_hours {
            Some(hours) => Some(SlaConfig {
                deadline: Some(Utc::now() + chrono::Duration::seconds((hours * 3600.0) as i64)),
                warn_threshold_hours: Some(hours / 4.0),
                state_slas,
            }),
            None if !state_slas.is_empty() => Some(SlaConfig {
                deadline: None,
                warn_threshold_hours: None,
                state_slas,
            }),
            None => None,
        }
    }
}

type ProcessHook = Box<dyn Fn(&Process) + Send + Sync>;

/// Routes form lifecycle events into process lifecycle operations.
pub struct FormTriggerManager {
    registry: Arc<KanbanRegistry>,
    repo: Arc<ProcessRepository>,
    factory: ProcessFactory,
    orphan_policy: OrphanPolicy,
    on_created: Mutex<Vec<ProcessHook>>,
    on_updated: Mutex<Vec<ProcessHook>>,
}

impl FormTriggerManager {
    pub fn new(registry: Arc<KanbanRegistry>, repo: Arc<ProcessRepository>) -> Self {
        FormTriggerManager {
            factory: ProcessFactory::new(registry.clone()),
            registry,
            repo,
            orphan_policy: OrphanPolicy::default(),
            on_created: Mutex::new(Vec::new()),
            on_updated: Mutex::new(Vec::new()),
        }
    }

    pub fn with_orphan_policy(mut self, policy: OrphanPolicy) -> Self {
        self.orphan_policy = policy;
        self
    }

    /// Run `hook` after every process creation.
    pub fn on_process_created(&self, hook: ProcessHook) {
        self.on_created.lock().unwrap().push(hook);
    }

    /// Run `hook` after every process update.
    pub fn on_process_updated(&self, hook: ProcessHook) {
        self.on_updated.lock().unwrap().push(hook);
    }

    // ========== Form events ==========

    /// A new form record was saved. Returns the process id when the form
    /// is linked to a kanban and a process was created.
    pub async fn on_form_created(
        &self,
        form_path: &str,
        form_data: &HashMap<String, Value>,
        record_idx: i64,
    ) -> Result<Option<String>> {
        let Some(process) = self.factory.create_from_form(form_path, form_data, record_idx)?
        else {
            return Ok(None);
        };

        let process = self.repo.create_process(process).await?;
        info!(process_id = %process.process_id, form = form_path, "process created from form");

        for hook in self.on_created.lock().unwrap().iter() {
            hook(&process);
        }
        Ok(Some(process.process_id))
    }

    /// An existing form record changed. Re-applies the field mapping to
    /// the linked process; records without a process (legacy data) get one
    /// created instead.
    pub async fn on_form_updated(
        &self,
        form_path: &str,
        form_data: &HashMap<String, Value>,
        record_idx: i64,
    ) -> Result<bool> {
        if !self.registry.is_form_linked(form_path) {
            return Ok(false);
        }

        let Some(process) = self.find_by_record(form_path, record_idx).await? else {
            return Ok(self
                .on_form_created(form_path, form_data, record_idx)
                .await?
                .is_some());
        };

        let field_values = self.factory.update_from_form(&process, form_data)?;
        let updated = self
            .repo
            .update_process(
                &process.process_id,
                ProcessPatch {
                    field_values: Some(field_values),
                    ..Default::default()
                },
            )
            .await?;

        for hook in self.on_updated.lock().unwrap().iter() {
            hook(&updated);
        }
        Ok(true)
    }

    /// A form record was deleted. Applies the configured [`OrphanPolicy`].
    pub async fn on_form_deleted(&self, form_path: &str, record_idx: i64) -> Result<bool> {
        if !self.registry.is_form_linked(form_path) {
            return Ok(false);
        }

        let Some(process) = self.find_by_record(form_path, record_idx).await? else {
            return Ok(false);
        };

        match self.orphan_policy {
            OrphanPolicy::Delete => {
                let deleted = self.repo.delete_process(&process.process_id).await?;
                if deleted {
                    info!(process_id = %process.process_id, "process deleted with its form record");
                }
                Ok(deleted)
            }
            OrphanPolicy::MarkOrphaned => {
                self.repo
                    .update_process(
                        &process.process_id,
                        ProcessPatch {
                            source_form: Some(format!("{ORPHAN_PREFIX}{form_path}")),
                            source_record_idx: Some(-1),
                            ..Default::default()
                        },
                    )
                    .await?;
                warn!(process_id = %process.process_id, "process orphaned: form record deleted");
                Ok(true)
            }
        }
    }

    // ========== Bulk operations ==========

    /// Sync all records of a form with their processes: create missing
    /// ones, refresh existing ones. Idempotent: syncing twice changes
    /// nothing the second time. With `recreate` every existing process is
    /// dropped first.
    pub async fn sync_existing_forms(
        &self,
        form_path: &str,
        form_records: &[HashMap<String, Value>],
        recreate: bool,
    ) -> Result<SyncStats> {
        let mut stats = SyncStats::default();

        if !self.registry.is_form_linked(form_path) {
            stats.skipped = form_records.len();
            return Ok(stats);
        }

        let existing = self.repo.by_source_form(form_path).await?;
        let mut by_idx: HashMap<i64, Process> = existing
            .iter()
            .filter(|p| p.source_record_idx >= 0)
            .map(|p| (p.source_record_idx, p.clone()))
            .collect();

        if recreate {
            for process in &existing {
                self.repo.delete_process(&process.process_id).await?;
            }
            by_idx.clear();
            info!(
                form = form_path,
                count = existing.len(),
                "deleted existing processes for recreation"
            );
        }

        for (idx, form_data) in form_records.iter().enumerate() {
            let idx = idx as i64;
            let outcome: Result<bool> = match by_idx.get(&idx) {
                Some(process) => {
                    let refresh = async {
                        let field_values = self.factory.update_from_form(process, form_data)?;
                        self.repo
                            .update_process(
                                &process.process_id,
                                ProcessPatch {
                                    field_values: Some(field_values),
                                    ..Default::default()
                                },
                            )
                            .await
                    };
                    refresh.await.map(|_| false)
                }
                None => self
                    .on_form_created(form_path, form_data, idx)
                    .await
                    .map(|_| true),
            };

            match outcome {
                Ok(true) => stats.created += 1,
                Ok(false) => stats.updated += 1,
                Err(err) => {
                    warn!(form = form_path, record = idx, error = %err, "sync error");
                    stats.errors += 1;
                }
            }
        }

        info!(form = form_path, ?stats, "form sync completed");
        Ok(stats)
    }

    /// Delete every process orphaned from `form_path`. Returns how many
    /// were removed.
    pub async fn cleanup_orphaned(&self, form_path: &str) -> Result<usize> {
        let orphaned_form = format!("{ORPHAN_PREFIX}{form_path}");
        let processes = self.repo.by_source_form(&orphaned_form).await?;

        let mut removed = 0;
        for process in processes {
            if self.repo.delete_process(&process.process_id).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn find_by_record(&self, form_path: &str, record_idx: i64) -> Result<Option<Process>> {
        Ok(self
            .repo
            .by_source_form(form_path)
            .await?
            .into_iter()
            .find(|p| p.source_record_idx == record_idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::AuditAction;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::memory::MemoryDriver;
    use serde_json::json;

    fn setup() -> (Arc<KanbanRegistry>, Arc<ProcessRepository>, FormTriggerManager) {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(sample_kanban(), false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        let triggers = FormTriggerManager::new(registry.clone(), repo.clone());
        (registry, repo, triggers)
    }

    fn form_data() -> HashMap<String, Value> {
        [
            ("cliente".to_string(), json!("Ana")),
            ("valor".to_string(), json!(100)),
        ]
        .into()
    }

    #[tokio::test]
    async fn test_create_from_form_end_to_end() {
        let (_registry, repo, triggers) = setup();

        let process_id = triggers
            .on_form_created("pedidos", &form_data(), 0)
            .await
            .unwrap()
            .expect("linked form must create a process");

        assert!(process_id.starts_with("pedidos_"));

        let process = repo.get_by_id(&process_id).await.unwrap().unwrap();
        assert_eq!(process.current_state, "novo");
        assert_eq!(process.field_values.get("cliente"), Some(&json!("Ana")));

        let history = repo.history(&process_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, AuditAction::ProcessCreated);
        assert_eq!(history[0].to_state.as_deref(), Some("novo"));
    }

    #[tokio::test]
    async fn test_unlinked_form_creates_nothing() {
        let (_registry, _repo, triggers) = setup();
        let created = triggers
            .on_form_created("unrelated", &form_data(), 0)
            .await
            .unwrap();
        assert!(created.is_none());
    }

    #[tokio::test]
    async fn test_field_mapping_drops_unmapped_fields() {
        let mut kanban = sample_kanban();
        kanban.field_mapping = Some(
            [
                ("nome_cliente".to_string(), "cliente".to_string()),
                ("valor_total".to_string(), "valor".to_string()),
            ]
            .into(),
        );

        let data: HashMap<String, Value> = [
            ("nome_cliente".to_string(), json!("Ana")),
            ("valor_total".to_string(), json!(250)),
            ("interno".to_string(), json!("dropped")),
        ]
        .into();

        let mapped = ProcessFactory::apply_field_mapping(&kanban, &data);
        assert_eq!(mapped.get("cliente"), Some(&json!("Ana")));
        assert_eq!(mapped.get("valor"), Some(&json!(250)));
        assert!(!mapped.contains_key("interno"));
        assert!(!mapped.contains_key("nome_cliente"));
    }

    #[tokio::test]
    async fn test_sla_from_kanban_hours() {
        let (registry, _repo, _triggers) = setup();
        let mut kanban = registry.get("pedidos").unwrap();
        kanban.sla_hours = Some(48.0);
        registry.register(kanban, false).unwrap();

        let factory = ProcessFactory::new(registry);
        let process = factory
            .create_from_form("pedidos", &form_data(), 0)
            .unwrap()
            .unwrap();

        let sla = process.sla.unwrap();
        assert_eq!(sla.warn_threshold_hours, Some(12.0));
        let deadline = sla.deadline.unwrap();
        let expected = Utc::now() + chrono::Duration::hours(48);
        assert!((deadline - expected).num_seconds().abs() < 5);
    }

    #[tokio::test]
    async fn test_update_refreshes_fields_and_legacy_records_create() {
        let (_registry, repo, triggers) = setup();

        // Legacy record: update without a process creates one
        assert!(triggers
            .on_form_updated("pedidos", &form_data(), 3)
            .await
            .unwrap());
        let process = repo.by_source_form("pedidos").await.unwrap().remove(0);
        assert_eq!(process.source_record_idx, 3);

        let mut changed = form_data();
        changed.insert("valor".to_string(), json!(999));
        assert!(triggers
            .on_form_updated("pedidos", &changed, 3)
            .await
            .unwrap());

        let process = repo.get_by_id(&process.process_id).await.unwrap().unwrap();
        assert_eq!(process.field_values.get("valor"), Some(&json!(999)));
    }

    #[tokio::test]
    async fn test_orphan_mark_and_cleanup() {
        let (_registry, repo, triggers) = setup();
        let process_id = triggers
            .on_form_created("pedidos", &form_data(), 0)
            .await
            .unwrap()
            .unwrap();

        assert!(triggers.on_form_deleted("pedidos", 0).await.unwrap());
        let process = repo.get_by_id(&process_id).await.unwrap().unwrap();
        assert!(process.is_orphaned());
        assert_eq!(process.source_record_idx, -1);

        assert_eq!(triggers.cleanup_orphaned("pedidos").await.unwrap(), 1);
        assert!(repo.get_by_id(&process_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_policy_removes_process() {
        let (registry, repo, _) = setup();
        let triggers = FormTriggerManager::new(registry, repo.clone())
            .with_orphan_policy(OrphanPolicy::Delete);

        let process_id = triggers
            .on_form_created("pedidos", &form_data(), 0)
            .await
            .unwrap()
            .unwrap();
        assert!(triggers.on_form_deleted("pedidos", 0).await.unwrap());
        assert!(repo.get_by_id(&process_id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sync_is_idempotent() {
        let (_registry, repo, triggers) = setup();
        let records = vec![form_data(), form_data(), form_data()];

        let first = triggers
            .sync_existing_forms("pedidos", &records, false)
            .await
            .unwrap();
        assert_eq!(first.created, 3);
        assert_eq!(first.errors, 0);

        let second = triggers
            .sync_existing_forms("pedidos", &records, false)
            .await
            .unwrap();
        assert_eq!(second.created, 0);
        assert_eq!(second.updated, 3);
        assert_eq!(repo.all().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_creation_hooks_fire() {
        let (_registry, _repo, triggers) = setup();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        triggers.on_process_created(Box::new(move |process| {
            sink.lock().unwrap().push(process.process_id.clone());
        }));

        let process_id = triggers
            .on_form_created("pedidos", &form_data(), 0)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![process_id]);
    }

    #[tokio::test]
    async fn test_sync_unlinked_form_skips_everything() {
        let (_registry, _repo, triggers) = setup();
        let stats = triggers
            .sync_existing_forms("unrelated", &[form_data()], false)
            .await
            .unwrap();
        assert_eq!(stats.skipped, 1);
        assert_eq!(stats.created, 0);
    }
}
