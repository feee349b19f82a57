// Audit entries - the append-only record of everything that happened

//! # Audit Entries
//!
//! Every mutation of a process writes exactly one audit entry, and entries
//! are never mutated or deleted afterwards. The audit table is the
//! authoritative explanation of what happened: process history, pattern
//! mining, anomaly detection and compliance reporting are all projections
//! over it.
//!
//! Within one process, entries are total-ordered by write time. Consumers
//! must not rely on timestamps alone for ordering across processes.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ProcessCreated,
    StateChanged,
    ProcessUpdated,
    ProcessDeleted,
    /// A state change taken despite unmet prerequisites, with justification
    ForcedTransition,
    KanbanModified,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ProcessCreated => "process_created",
            AuditAction::StateChanged => "state_changed",
            AuditAction::ProcessUpdated => "process_updated",
            AuditAction::ProcessDeleted => "process_deleted",
            AuditAction::ForcedTransition => "forced_transition",
            AuditAction::KanbanModified => "kanban_modified",
        }
    }

    pub fn parse(s: &str) -> Option<AuditAction> {
        match s {
            "process_created" => Some(AuditAction::ProcessCreated),
            "state_changed" => Some(AuditAction::StateChanged),
            "process_updated" => Some(AuditAction::ProcessUpdated),
            "process_deleted" => Some(AuditAction::ProcessDeleted),
            "forced_transition" => Some(AuditAction::ForcedTransition),
            "kanban_modified" => Some(AuditAction::KanbanModified),
            _ => None,
        }
    }
}

/// Who triggered it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActorType {
    /// A user action through the UI or API
    Manual,
    /// The auto-transition engine
    System,
    /// A confirmed agent suggestion
    Agent,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::Manual => "manual",
            ActorType::System => "system",
            ActorType::Agent => "agent",
        }
    }

    pub fn parse(s: &str) -> Option<ActorType> {
        match s {
            "manual" => Some(ActorType::Manual),
            "system" => Some(ActorType::System),
            "agent" => Some(ActorType::Agent),
            _ => None,
        }
    }
}

/// One immutable event on one process.
///
/// The flat-file backend stores these as twelve semicolon-delimited columns
/// in this field order; empty strings denote absent values (see the
/// repository's flatten/inflate pair).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub process_id: String,
    pub kanban_id: String,
    pub action: AuditAction,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_state: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<String>,

    pub user: String,

    #[serde(rename = "type")]
    pub actor: ActorType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub justification: Option<String>,

    /// Hours spent in the previous state, for transitions
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_in_previous_state: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prerequisites_met: Option<bool>,

    /// Free-form bag (`forced`, `was_anomaly`, sweep context, ...)
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub metadata: Map<String, Value>,
}

impl AuditEntry {
    /// Whether this entry places the process into a state. Creation entries
    /// carry the initial state in `to_state`; state changes and forced
    /// transitions carry the target. Sequence reconstruction keys on this.
    pub fn is_state_bearing(&self) -> bool {
        self.to_state.is_some()
    }

    /// Whether this entry records a state change (normal or forced).
    pub fn is_transition(&self) -> bool {
        matches!(
            self.action,
            AuditAction::StateChanged | AuditAction::ForcedTransition
        ) && self.from_state.is_some()
            && self.to_state.is_some()
    }

    /// Whether the entry records a forced transition, by action or by the
    /// `forced` metadata flag.
    pub fn is_forced(&self) -> bool {
        self.action == AuditAction::ForcedTransition
            || self.metadata.get("forced").and_then(Value::as_bool) == Some(true)
    }
}
