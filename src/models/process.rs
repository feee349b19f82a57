// Process records - live instances of a kanban

//! # Process Records
//!
//! A process is the live instance of one kanban, born from one form record.
//! The record is deliberately small: it carries the current state, the
//! mapped field values, tags, assignment and SLA, **not** its history.
//! History is a projection reconstructed from the audit table, which keeps
//! every transition on a single write path and the live record free of
//! read-modify-write races.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Prefix applied to `source_form` when the originating form record was
/// deleted but the process is kept for its history.
pub const ORPHAN_PREFIX: &str = "[DELETED] ";

/// SLA block attached to a process at creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlaConfig {
    /// Absolute due time derived from the kanban's `sla_hours`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// Hours before the deadline at which warnings start
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warn_threshold_hours: Option<f64>,

    /// Per-state SLA hours copied from the state definitions
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub state_slas: HashMap<String, f64>,
}

/// The live state of one workflow process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Process {
    /// Factory-formatted id: `{kanban_id}_{YYYYMMDD_HHMMSS}_{8-char random}`
    pub process_id: String,

    pub kanban_id: String,

    /// Form path the process was created from
    pub source_form: String,

    /// Index of the originating record within its form; -1 once orphaned
    pub source_record_idx: i64,

    /// A state id declared by the kanban
    pub current_state: String,

    /// Mapped form values; scalars or null
    #[serde(default)]
    pub field_values: HashMap<String, Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// Short lower-case tokens, managed by the tag service
    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_to: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla: Option<SlaConfig>,

    /// Free-form bag for embedders
    #[serde(default)]
    pub metadata: HashMap<String, Value>,
}

impl Process {
    /// Fraction of field values that are present and non-empty.
    pub fn field_completeness(&self) -> f64 {
        if self.field_values.is_empty() {
            return 0.0;
        }
        let filled = self
            .field_values
            .values()
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
            .count();
        filled as f64 / self.field_values.len() as f64
    }

    /// Whether the originating form record has been deleted.
    pub fn is_orphaned(&self) -> bool {
        self.source_form.starts_with(ORPHAN_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn process_with_fields(fields: &[(&str, Value)]) -> Process {
        Process {
            process_id: "pedidos_20250101_000000_abcd1234".to_string(),
            kanban_id: "pedidos".to_string(),
            source_form: "pedidos".to_string(),
            source_record_idx: 0,
            current_state: "novo".to_string(),
            field_values: fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            tags: vec![],
            assigned_to: None,
            sla: None,
            metadata: HashMap::new(),
        }
    }

    #[test]
    fn test_field_completeness() {
        let process = process_with_fields(&[
            ("cliente", json!("Ana")),
            ("valor", json!(100)),
            ("obs", json!("")),
            ("extra", Value::Null),
        ]);
        assert!((process.field_completeness() - 0.5).abs() < 1e-9);

        let empty = process_with_fields(&[]);
        assert_eq!(empty.field_completeness(), 0.0);
    }

    #[test]
    fn test_orphan_detection() {
        let mut process = process_with_fields(&[]);
        assert!(!process.is_orphaned());
        process.source_form = format!("{ORPHAN_PREFIX}pedidos");
        assert!(process.is_orphaned());
    }
}
