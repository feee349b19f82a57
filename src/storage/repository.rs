// Process repository - the two-table persistence split

//! # Process Repository
//!
//! Processes persist across two tables on any [`StorageDriver`]:
//!
//! - `workflow_processes`: one live record per process, small and flat
//! - `workflow_audit`: the append-only trail, one row per event
//!
//! Structured values (field values, tags, SLA, metadata) are flattened to
//! JSON-encoded strings so scalar-only backends can hold them, and inflated
//! back on read. History never lives in the live record: it is a projection
//! of the audit table filtered by process id.
//!
//! ## Write discipline
//!
//! Every mutation writes the live record first and appends its audit entry
//! second, in the same logical operation. When the audit append fails the
//! live write is compensated (deleted or restored) and a retryable storage
//! error surfaces: a dangling audit row is a correctness defect, an
//! unlogged live write only a retry.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::models::audit::{ActorType, AuditAction, AuditEntry};
use crate::models::ident;
use crate::models::process::{Process, SlaConfig};
use crate::storage::{FieldSpec, FieldType, Record, StorageDriver, TableSchema, RECORD_ID_FIELD};
use crate::{FlowboardError, Result};

/// Default live-record table name.
pub const PROCESS_TABLE: &str = "workflow_processes";

/// Default audit table name.
pub const AUDIT_TABLE: &str = "workflow_audit";

/// Schema of the live process table.
pub fn process_schema() -> TableSchema {
    TableSchema::new(
        "Workflow Processes",
        vec![
            FieldSpec::new("process_id", FieldType::Text).required(),
            FieldSpec::new("kanban_id", FieldType::Text).required(),
            FieldSpec::new("source_form", FieldType::Text),
            FieldSpec::new("source_record_idx", FieldType::Number),
            FieldSpec::new("current_state", FieldType::Text).required(),
            // JSON string
            FieldSpec::new("field_values", FieldType::Text),
            FieldSpec::new("created_at", FieldType::Text).required(),
            FieldSpec::new("updated_at", FieldType::Text).required(),
            // JSON array
            FieldSpec::new("tags", FieldType::Text),
            FieldSpec::new("assigned_to", FieldType::Text),
            // JSON object
            FieldSpec::new("sla", FieldType::Text),
            // JSON object
            FieldSpec::new("metadata", FieldType::Text),
        ],
    )
}

/// Schema of the audit table: the twelve positional columns.
pub fn audit_schema() -> TableSchema {
    TableSchema::new(
        "Workflow Audit Trail",
        vec![
            FieldSpec::new("timestamp", FieldType::Text).required(),
            FieldSpec::new("process_id", FieldType::Text).required(),
            FieldSpec::new("kanban_id", FieldType::Text).required(),
            FieldSpec::new("action", FieldType::Text).required(),
            FieldSpec::new("from_state", FieldType::Text),
            FieldSpec::new("to_state", FieldType::Text),
            FieldSpec::new("user", FieldType::Text).required(),
            FieldSpec::new("type", FieldType::Text).required(),
            FieldSpec::new("justification", FieldType::Text),
            FieldSpec::new("duration_in_previous_state", FieldType::Text),
            FieldSpec::new("prerequisites_met", FieldType::Text),
            FieldSpec::new("metadata", FieldType::Text),
        ],
    )
}

/// One state change to apply through [`ProcessRepository::update_state`].
#[derive(Debug, Clone)]
pub struct StateChange {
    pub new_state: String,
    pub actor: ActorType,
    pub user: String,
    pub action: AuditAction,
    pub justification: Option<String>,
    pub duration_in_previous_state: Option<f64>,
    pub prerequisites_met: Option<bool>,
    pub metadata: Map<String, Value>,
}

impl StateChange {
    pub fn new(new_state: &str, actor: ActorType, user: &str) -> Self {
        StateChange {
            new_state: new_state.to_string(),
            actor,
            user: user.to_string(),
            action: AuditAction::StateChanged,
            justification: None,
            duration_in_previous_state: None,
            prerequisites_met: None,
            metadata: Map::new(),
        }
    }

    pub fn forced(mut self, justification: &str) -> Self {
        self.action = AuditAction::ForcedTransition;
        self.justification = Some(justification.to_string());
        self.metadata.insert("forced".to_string(), Value::Bool(true));
        self
    }

    pub fn with_justification(mut self, justification: Option<String>) -> Self {
        self.justification = justification;
        self
    }

    pub fn with_duration(mut self, hours: Option<f64>) -> Self {
        self.duration_in_previous_state = hours;
        self
    }

    pub fn with_prerequisites_met(mut self, met: Option<bool>) -> Self {
        self.prerequisites_met = met;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }
}

/// Partial update of a live process record.
#[derive(Debug, Clone, Default)]
pub struct ProcessPatch {
    pub field_values: Option<HashMap<String, Value>>,
    pub source_form: Option<String>,
    pub source_record_idx: Option<i64>,
    pub assigned_to: Option<Option<String>>,
    pub tags: Option<Vec<String>>,
    pub sla: Option<Option<SlaConfig>>,
    pub metadata: Option<HashMap<String, Value>>,
}

impl ProcessPatch {
    /// Names of the fields this patch touches, for the audit entry.
    fn changed_fields(&self) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if self.field_values.is_some() {
            changed.push("field_values");
        }
        if self.source_form.is_some() {
            changed.push("source_form");
        }
        if self.source_record_idx.is_some() {
            changed.push("source_record_idx");
        }
        if self.assigned_to.is_some() {
            changed.push("assigned_to");
        }
        if self.tags.is_some() {
            changed.push("tags");
        }
        if self.sla.is_some() {
            changed.push("sla");
        }
        if self.metadata.is_some() {
            changed.push("metadata");
        }
        changed
    }
}

/// Repository for processes and their audit trail.
pub struct ProcessRepository {
    driver: Arc<dyn StorageDriver>,
    process_table: String,
    audit_table: String,
}

impl ProcessRepository {
    pub fn new(driver: Arc<dyn StorageDriver>) -> Self {
        ProcessRepository {
            driver,
            process_table: PROCESS_TABLE.to_string(),
            audit_table: AUDIT_TABLE.to_string(),
        }
    }

    /// Use custom table names (one pair per embedding application).
    pub fn with_tables(mut self, process_table: &str, audit_table: &str) -> Self {
        self.process_table = process_table.to_string();
        self.audit_table = audit_table.to_string();
        self
    }

    /// Create both tables when absent.
    pub async fn ensure_storage(&self) -> Result<()> {
        self.driver
            .create_storage(&self.process_table, &process_schema())
            .await?;
        self.driver
            .create_storage(&self.audit_table, &audit_schema())
            .await?;
        Ok(())
    }

    // ========== Process CRUD ==========

    /// Persist a new process and its `process_created` audit entry.
    ///
    /// Assigns a process id when absent. The audit append is compensated:
    /// if it fails, the live record is removed again and a retryable error
    /// returns.
    pub async fn create_process(&self, mut process: Process) -> Result<Process> {
        if process.process_id.trim().is_empty() {
            process.process_id = ident::generate();
        }
        if process.kanban_id.trim().is_empty() {
            return Err(FlowboardError::InvalidInput(
                "process is missing 'kanban_id'".to_string(),
            ));
        }
        if process.current_state.trim().is_empty() {
            return Err(FlowboardError::InvalidInput(
                "process is missing 'current_state'".to_string(),
            ));
        }

        let record = flatten_process(&process)?;
        self.driver
            .create(&self.process_table, &process_schema(), record)
            .await?;

        let entry = AuditEntry {
            timestamp: Utc::now(),
            process_id: process.process_id.clone(),
            kanban_id: process.kanban_id.clone(),
            action: AuditAction::ProcessCreated,
            from_state: None,
            to_state: Some(process.current_state.clone()),
            user: "system".to_string(),
            actor: ActorType::System,
            justification: None,
            duration_in_previous_state: None,
            prerequisites_met: None,
            metadata: Map::new(),
        };

        if let Err(err) = self.append_audit(&entry).await {
            // Compensate: never leave a live record whose creation was not
            // recorded. The caller may retry the whole operation.
            let _ = self
                .driver
                .delete_by_id(&self.process_table, &process_schema(), &process.process_id)
                .await;
            return Err(err);
        }

        debug!(process_id = %process.process_id, kanban = %process.kanban_id, "process created");
        Ok(process)
    }

    pub async fn get_by_id(&self, process_id: &str) -> Result<Option<Process>> {
        let record = self
            .driver
            .read_by_id(&self.process_table, &process_schema(), process_id)
            .await?;
        record.map(inflate_process).transpose()
    }

    pub async fn all(&self) -> Result<Vec<Process>> {
        let records = self
            .driver
            .read_all(&self.process_table, &process_schema())
            .await?;
        records.into_iter().map(inflate_process).collect()
    }

    pub async fn by_kanban(&self, kanban_id: &str) -> Result<Vec<Process>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|p| p.kanban_id == kanban_id)
            .collect())
    }

    pub async fn by_source_form(&self, form_path: &str) -> Result<Vec<Process>> {
        Ok(self
            .all()
            .await?
            .into_iter()
            .filter(|p| p.source_form == form_path)
            .collect())
    }

    pub async fn by_state(&self, kanban_id: &str, state: &str) -> Result<Vec<Process>> {
        Ok(self
            .by_kanban(kanban_id)
            .await?
            .into_iter()
            .filter(|p| p.current_state == state)
            .collect())
    }

    /// Apply a state change: live `current_state` + `updated_at`, then one
    /// audit entry. Rolls the live record back when the append fails.
    pub async fn update_state(&self, process_id: &str, change: StateChange) -> Result<Process> {
        let previous = self
            .get_by_id(process_id)
            .await?
            .ok_or_else(|| FlowboardError::ProcessNotFound(process_id.to_string()))?;

        let mut updated = previous.clone();
        updated.current_state = change.new_state.clone();
        updated.updated_at = Utc::now();

        self.write_live(&updated).await?;

        let entry = AuditEntry {
            timestamp: Utc::now(),
            process_id: process_id.to_string(),
            kanban_id: previous.kanban_id.clone(),
            action: change.action,
            from_state: Some(previous.current_state.clone()),
            to_state: Some(change.new_state.clone()),
            user: change.user,
            actor: change.actor,
            justification: change.justification,
            duration_in_previous_state: change.duration_in_previous_state,
            prerequisites_met: change.prerequisites_met,
            metadata: change.metadata,
        };

        if let Err(err) = self.append_audit(&entry).await {
            let _ = self.write_live(&previous).await;
            return Err(err);
        }

        debug!(
            process_id,
            from = %previous.current_state,
            to = %updated.current_state,
            "state updated"
        );
        Ok(updated)
    }

    /// Apply a partial update and log `process_updated`.
    pub async fn update_process(&self, process_id: &str, patch: ProcessPatch) -> Result<Process> {
        let previous = self
            .get_by_id(process_id)
            .await?
            .ok_or_else(|| FlowboardError::ProcessNotFound(process_id.to_string()))?;

        let changed = patch.changed_fields();
        let mut updated = previous.clone();
        if let Some(field_values) = patch.field_values {
            updated.field_values = field_values;
        }
        if let Some(source_form) = patch.source_form {
            updated.source_form = source_form;
        }
        if let Some(idx) = patch.source_record_idx {
            updated.source_record_idx = idx;
        }
        if let Some(assigned_to) = patch.assigned_to {
            updated.assigned_to = assigned_to;
        }
        if let Some(tags) = patch.tags {
            updated.tags = tags;
        }
        if let Some(sla) = patch.sla {
            updated.sla = sla;
        }
        if let Some(metadata) = patch.metadata {
            updated.metadata = metadata;
        }
        updated.updated_at = Utc::now();

        self.write_live(&updated).await?;

        let mut metadata = Map::new();
        metadata.insert(
            "changed_fields".to_string(),
            Value::Array(changed.iter().map(|f| Value::String(f.to_string())).collect()),
        );
        let entry = AuditEntry {
            timestamp: Utc::now(),
            process_id: process_id.to_string(),
            kanban_id: previous.kanban_id.clone(),
            action: AuditAction::ProcessUpdated,
            from_state: None,
            to_state: None,
            user: "system".to_string(),
            actor: ActorType::System,
            justification: None,
            duration_in_previous_state: None,
            prerequisites_met: None,
            metadata,
        };

        if let Err(err) = self.append_audit(&entry).await {
            let _ = self.write_live(&previous).await;
            return Err(err);
        }

        Ok(updated)
    }

    /// Delete the live record and log `process_deleted`. Restores the
    /// record when the audit append fails.
    pub async fn delete_process(&self, process_id: &str) -> Result<bool> {
        let Some(previous) = self.get_by_id(process_id).await? else {
            return Ok(false);
        };

        let deleted = self
            .driver
            .delete_by_id(&self.process_table, &process_schema(), process_id)
            .await?;
        if !deleted {
            return Ok(false);
        }

        let entry = AuditEntry {
            timestamp: Utc::now(),
            process_id: process_id.to_string(),
            kanban_id: previous.kanban_id.clone(),
            action: AuditAction::ProcessDeleted,
            from_state: Some(previous.current_state.clone()),
            to_state: None,
            user: "system".to_string(),
            actor: ActorType::System,
            justification: None,
            duration_in_previous_state: None,
            prerequisites_met: None,
            metadata: Map::new(),
        };

        if let Err(err) = self.append_audit(&entry).await {
            let record = flatten_process(&previous)?;
            let _ = self
                .driver
                .create(&self.process_table, &process_schema(), record)
                .await;
            return Err(err);
        }

        Ok(true)
    }

    // ========== Audit projections ==========

    /// All audit entries for a process, oldest first. A missing audit
    /// table reads as empty history.
    pub async fn history(&self, process_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit_all()
            .await?
            .into_iter()
            .filter(|e| e.process_id == process_id)
            .collect())
    }

    /// Every audit entry, oldest first.
    pub async fn audit_all(&self) -> Result<Vec<AuditEntry>> {
        if !self.driver.exists(&self.audit_table).await {
            return Ok(Vec::new());
        }

        let records = self
            .driver
            .read_all(&self.audit_table, &audit_schema())
            .await?;

        Ok(records
            .into_iter()
            .filter_map(|record| {
                let entry = inflate_audit(&record);
                if entry.is_none() {
                    warn!(?record, "skipping unparseable audit row");
                }
                entry
            })
            .collect())
    }

    /// Audit entries for one kanban, oldest first.
    pub async fn audit_by_kanban(&self, kanban_id: &str) -> Result<Vec<AuditEntry>> {
        Ok(self
            .audit_all()
            .await?
            .into_iter()
            .filter(|e| e.kanban_id == kanban_id)
            .collect())
    }

    /// Record a kanban definition change in the trail.
    pub async fn log_kanban_modified(
        &self,
        kanban_id: &str,
        user: &str,
        details: Map<String, Value>,
    ) -> Result<()> {
        let entry = AuditEntry {
            timestamp: Utc::now(),
            process_id: String::new(),
            kanban_id: kanban_id.to_string(),
            action: AuditAction::KanbanModified,
            from_state: None,
            to_state: None,
            user: user.to_string(),
            actor: ActorType::Manual,
            justification: None,
            duration_in_previous_state: None,
            prerequisites_met: None,
            metadata: details,
        };
        self.append_audit(&entry).await
    }

    /// Aggregate counts for a kanban within an optional creation window.
    pub async fn analytics(
        &self,
        kanban_id: &str,
        start: Option<DateTime<Utc>>,
        end: Option<DateTime<Utc>>,
    ) -> Result<Value> {
        let processes: Vec<Process> = self
            .by_kanban(kanban_id)
            .await?
            .into_iter()
            .filter(|p| start.map_or(true, |s| p.created_at >= s))
            .filter(|p| end.map_or(true, |e| p.created_at <= e))
            .collect();

        let transitions: Vec<AuditEntry> = self
            .audit_by_kanban(kanban_id)
            .await?
            .into_iter()
            .filter(|e| e.is_transition())
            .filter(|e| start.map_or(true, |s| e.timestamp >= s))
            .filter(|e| end.map_or(true, |x| e.timestamp <= x))
            .collect();

        let mut by_state: HashMap<String, u64> = HashMap::new();
        for p in &processes {
            *by_state.entry(p.current_state.clone()).or_default() += 1;
        }

        let mut by_type: HashMap<String, u64> = HashMap::new();
        for t in &transitions {
            *by_type.entry(t.actor.as_str().to_string()).or_default() += 1;
        }

        let avg = if processes.is_empty() {
            0.0
        } else {
            transitions.len() as f64 / processes.len() as f64
        };

        Ok(serde_json::json!({
            "total_processes": processes.len(),
            "by_state": by_state,
            "by_transition_type": by_type,
            "avg_transitions_per_process": (avg * 100.0).round() / 100.0,
        }))
    }

    // ========== Internals ==========

    async fn write_live(&self, process: &Process) -> Result<()> {
        let record = flatten_process(process)?;
        let updated = self
            .driver
            .update_by_id(
                &self.process_table,
                &process_schema(),
                &process.process_id,
                record,
            )
            .await?;
        if !updated {
            return Err(FlowboardError::Storage(anyhow!(
                "live record for '{}' vanished during update",
                process.process_id
            )));
        }
        Ok(())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        let record = flatten_audit(entry);
        self.driver
            .create(&self.audit_table, &audit_schema(), record)
            .await?;
        Ok(())
    }
}

// ========== Flatten / inflate ==========

fn flatten_process(process: &Process) -> Result<Record> {
    let mut record = Record::new();
    record.insert(RECORD_ID_FIELD.to_string(), process.process_id.clone());
    record.insert("process_id".to_string(), process.process_id.clone());
    record.insert("kanban_id".to_string(), process.kanban_id.clone());
    record.insert("source_form".to_string(), process.source_form.clone());
    record.insert(
        "source_record_idx".to_string(),
        process.source_record_idx.to_string(),
    );
    record.insert("current_state".to_string(), process.current_state.clone());
    record.insert(
        "field_values".to_string(),
        serde_json::to_string(&process.field_values)?,
    );
    record.insert("created_at".to_string(), process.created_at.to_rfc3339());
    record.insert("updated_at".to_string(), process.updated_at.to_rfc3339());
    record.insert("tags".to_string(), serde_json::to_string(&process.tags)?);
    record.insert(
        "assigned_to".to_string(),
        process.assigned_to.clone().unwrap_or_default(),
    );
    record.insert(
        "sla".to_string(),
        match &process.sla {
            Some(sla) => serde_json::to_string(sla)?,
            None => String::new(),
        },
    );
    record.insert(
        "metadata".to_string(),
        serde_json::to_string(&process.metadata)?,
    );
    Ok(record)
}

fn inflate_process(record: Record) -> Result<Process> {
    let get = |key: &str| record.get(key).cloned().unwrap_or_default();

    let created_at = parse_timestamp(&get("created_at"))
        .ok_or_else(|| FlowboardError::Internal(format!("bad created_at in {record:?}")))?;
    let updated_at = parse_timestamp(&get("updated_at")).unwrap_or(created_at);

    Ok(Process {
        process_id: get("process_id"),
        kanban_id: get("kanban_id"),
        source_form: get("source_form"),
        source_record_idx: get("source_record_idx").parse().unwrap_or(-1),
        current_state: get("current_state"),
        // Columns that fail to parse fall back to empty structures rather
        // than poisoning the read.
        field_values: serde_json::from_str(&get("field_values")).unwrap_or_default(),
        created_at,
        updated_at,
        tags: serde_json::from_str(&get("tags")).unwrap_or_default(),
        assigned_to: Some(get("assigned_to")).filter(|s| !s.is_empty()),
        sla: serde_json::from_str(&get("sla")).ok(),
        metadata: serde_json::from_str(&get("metadata")).unwrap_or_default(),
    })
}

fn flatten_audit(entry: &AuditEntry) -> Record {
    let mut record = Record::new();
    record.insert("timestamp".to_string(), entry.timestamp.to_rfc3339());
    record.insert("process_id".to_string(), entry.process_id.clone());
    record.insert("kanban_id".to_string(), entry.kanban_id.clone());
    record.insert("action".to_string(), entry.action.as_str().to_string());
    record.insert(
        "from_state".to_string(),
        entry.from_state.clone().unwrap_or_default(),
    );
    record.insert(
        "to_state".to_string(),
        entry.to_state.clone().unwrap_or_default(),
    );
    record.insert("user".to_string(), entry.user.clone());
    record.insert("type".to_string(), entry.actor.as_str().to_string());
    record.insert(
        "justification".to_string(),
        entry.justification.clone().unwrap_or_default(),
    );
    record.insert(
        "duration_in_previous_state".to_string(),
        entry
            .duration_in_previous_state
            .map(|d| d.to_string())
            .unwrap_or_default(),
    );
    record.insert(
        "prerequisites_met".to_string(),
        match entry.prerequisites_met {
            Some(true) => "True".to_string(),
            Some(false) => "False".to_string(),
            None => String::new(),
        },
    );
    record.insert(
        "metadata".to_string(),
        if entry.metadata.is_empty() {
            String::new()
        } else {
            serde_json::to_string(&entry.metadata).unwrap_or_default()
        },
    );
    record
}

fn inflate_audit(record: &Record) -> Option<AuditEntry> {
    let get = |key: &str| record.get(key).cloned().unwrap_or_default();

    let non_empty = |s: String| if s.is_empty() { None } else { Some(s) };

    Some(AuditEntry {
        timestamp: parse_timestamp(&get("timestamp"))?,
        process_id: get("process_id"),
        kanban_id: get("kanban_id"),
        action: AuditAction::parse(&get("action"))?,
        from_state: non_empty(get("from_state")),
        to_state: non_empty(get("to_state")),
        user: get("user"),
        actor: ActorType::parse(&get("type"))?,
        justification: non_empty(get("justification")),
        duration_in_previous_state: get("duration_in_previous_state").parse().ok(),
        prerequisites_met: match get("prerequisites_met").as_str() {
            "True" | "true" => Some(true),
            "False" | "false" => Some(false),
            _ => None,
        },
        metadata: serde_json::from_str(&get("metadata")).unwrap_or_default(),
    })
}

/// Parse an RFC 3339 timestamp; naive timestamps are interpreted as UTC.
pub(crate) fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    if value.is_empty() {
        return None;
    }
    if let Ok(t) = DateTime::parse_from_rfc3339(value) {
        return Some(t.with_timezone(&Utc));
    }
    value
        .parse::<chrono::NaiveDateTime>()
        .ok()
        .map(|naive| naive.and_utc())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::memory::MemoryDriver;
    use serde_json::json;

    pub(crate) fn repo() -> ProcessRepository {
        ProcessRepository::new(Arc::new(MemoryDriver::new()))
    }

    pub(crate) fn sample_process(process_id: &str, state: &str) -> Process {
        Process {
            process_id: process_id.to_string(),
            kanban_id: "pedidos".to_string(),
            source_form: "pedidos".to_string(),
            source_record_idx: 0,
            current_state: state.to_string(),
            field_values: [
                ("cliente".to_string(), json!("Ana")),
                ("valor".to_string(), json!(100.0)),
            ]
            .into(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: vec![],
            assigned_to: None,
            sla: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_create_writes_live_and_audit() {
        let repo = repo();
        repo.ensure_storage().await.unwrap();

        let process = repo
            .create_process(sample_process("p1", "novo"))
            .await
            .unwrap();

        let stored = repo.get_by_id("p1").await.unwrap().unwrap();
        assert_eq!(stored.current_state, "novo");
        assert_eq!(stored.field_values.get("cliente"), Some(&json!("Ana")));

        let history = repo.history(&process.process_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].action, AuditAction::ProcessCreated);
        assert_eq!(history[0].to_state.as_deref(), Some("novo"));
    }

    #[tokio::test]
    async fn test_update_state_appends_single_entry() {
        let repo = repo();
        repo.create_process(sample_process("p1", "novo"))
            .await
            .unwrap();

        let updated = repo
            .update_state(
                "p1",
                StateChange::new("em_analise", ActorType::Manual, "ana")
                    .with_duration(Some(2.5))
                    .with_prerequisites_met(Some(true)),
            )
            .await
            .unwrap();
        assert_eq!(updated.current_state, "em_analise");

        let history = repo.history("p1").await.unwrap();
        assert_eq!(history.len(), 2);
        let last = history.last().unwrap();
        assert_eq!(last.action, AuditAction::StateChanged);
        assert_eq!(last.from_state.as_deref(), Some("novo"));
        assert_eq!(last.to_state.as_deref(), Some("em_analise"));
        assert_eq!(last.duration_in_previous_state, Some(2.5));
        assert_eq!(last.prerequisites_met, Some(true));
    }

    #[tokio::test]
    async fn test_current_state_matches_latest_audit_entry() {
        // Audit-process agreement across a sequence of operations
        let repo = repo();
        repo.create_process(sample_process("p1", "novo"))
            .await
            .unwrap();
        for state in ["em_analise", "aprovado"] {
            repo.update_state("p1", StateChange::new(state, ActorType::Manual, "ana"))
                .await
                .unwrap();
        }

        let process = repo.get_by_id("p1").await.unwrap().unwrap();
        let history = repo.history("p1").await.unwrap();
        let last_state = history
            .iter()
            .rev()
            .find(|e| e.is_state_bearing())
            .and_then(|e| e.to_state.clone())
            .unwrap();
        assert_eq!(process.current_state, last_state);
    }

    #[tokio::test]
    async fn test_update_and_delete_are_logged() {
        let repo = repo();
        repo.create_process(sample_process("p1", "novo"))
            .await
            .unwrap();

        repo.update_process(
            "p1",
            ProcessPatch {
                field_values: Some([("valor".to_string(), json!(250.0))].into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert!(repo.delete_process("p1").await.unwrap());
        assert!(repo.get_by_id("p1").await.unwrap().is_none());

        let actions: Vec<AuditAction> = repo
            .history("p1")
            .await
            .unwrap()
            .iter()
            .map(|e| e.action)
            .collect();
        assert_eq!(
            actions,
            vec![
                AuditAction::ProcessCreated,
                AuditAction::ProcessUpdated,
                AuditAction::ProcessDeleted
            ]
        );
    }

    #[tokio::test]
    async fn test_missing_audit_table_reads_empty() {
        let repo = repo();
        assert!(repo.history("nope").await.unwrap().is_empty());
        assert!(repo.audit_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_kanban_modification_logged() {
        let repo = repo();
        let mut details = Map::new();
        details.insert("modification".to_string(), json!("state_added"));
        repo.log_kanban_modified("pedidos", "admin", details)
            .await
            .unwrap();

        let entries = repo.audit_by_kanban("pedidos").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].action, AuditAction::KanbanModified);
        assert_eq!(entries[0].user, "admin");
        assert_eq!(entries[0].metadata["modification"], json!("state_added"));
    }

    #[tokio::test]
    async fn test_analytics_summary() {
        let repo = repo();
        for i in 0..2 {
            let pid = format!("p{i}");
            repo.create_process(sample_process(&pid, "novo")).await.unwrap();
            repo.update_state(&pid, StateChange::new("em_analise", ActorType::Manual, "ana"))
                .await
                .unwrap();
        }

        let analytics = repo.analytics("pedidos", None, None).await.unwrap();
        assert_eq!(analytics["total_processes"], json!(2));
        assert_eq!(analytics["by_state"]["em_analise"], json!(2));
        assert_eq!(analytics["by_transition_type"]["manual"], json!(2));
        assert_eq!(analytics["avg_transitions_per_process"], json!(1.0));
    }

    #[tokio::test]
    async fn test_forced_change_round_trips_metadata() {
        let repo = repo();
        repo.create_process(sample_process("p1", "novo"))
            .await
            .unwrap();

        repo.update_state(
            "p1",
            StateChange::new("aprovado", ActorType::Manual, "admin").forced("emergency approval"),
        )
        .await
        .unwrap();

        let history = repo.history("p1").await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.action, AuditAction::ForcedTransition);
        assert!(last.is_forced());
        assert_eq!(last.justification.as_deref(), Some("emergency approval"));
    }
}
