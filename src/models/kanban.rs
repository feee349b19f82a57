// Kanban definitions - declarative workflow state machines

//! # Kanban Definitions
//!
//! A kanban is the declarative description of one workflow: its states, the
//! transitions the UI should advertise, the transitions the engine must
//! refuse, the transitions that are abnormal but permitted, and the form
//! paths whose records spawn processes.
//!
//! ## Recommended vs blocked duality
//!
//! Recommended and blocked transitions are **two disjoint sets**, not a
//! single allow-list. The default is permissive: anything not explicitly
//! blocked may execute. Recommended transitions carry prerequisites whose
//! failure produces warnings, never rejections; only
//! [`BlockedTransition`] entries reject. This makes a half-written kanban
//! useful from day one and preserves the warn-not-block user contract.
//!
//! Definitions are immutable after load: the registry hands out defensive
//! copies, so nothing downstream can corrupt the indexed definition.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::models::prerequisite::Prerequisite;
use crate::{FlowboardError, Result};

/// Lifecycle role of a state within its kanban.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateType {
    /// Where new processes start; at most one per kanban
    Initial,
    Intermediate,
    /// Processes in a final state count as completed
    Final,
}

/// One column of the kanban board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateDefinition {
    /// Unique within the kanban
    pub id: String,

    /// Human-readable label
    pub name: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub state_type: Option<StateType>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,

    /// Target of automatic progression out of this state, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_transition_to: Option<String>,

    /// Hours after which a timeout transition to `auto_transition_to` fires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_hours: Option<f64>,

    /// Prerequisites attached to the state itself (checked by callers that
    /// validate entry into this state)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<Prerequisite>,

    /// Per-column SLA override in hours
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_hours: Option<f64>,
}

/// A UI-advertised path. Not a constraint: execution never requires one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRule {
    pub from: String,
    pub to: String,

    /// Checked before the transition; unmet prerequisites warn, they do
    /// not block
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub prerequisites: Vec<Prerequisite>,
}

/// The only kind of transition the engine refuses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedTransition {
    pub from: String,
    pub to: String,
    pub reason: String,
}

/// An abnormal but permitted path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarnedTransition {
    pub from: String,
    pub to: String,
    pub message: String,

    /// When set, the engine refuses the transition unless the caller
    /// supplies a justification
    #[serde(default)]
    pub require_justification: bool,
}

/// Email channel settings inside [`NotificationSettings`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmailChannelConfig {
    #[serde(default)]
    pub recipients: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
}

/// Webhook channel settings inside [`NotificationSettings`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookChannelConfig {
    pub url: String,

    /// Header values may reference `${ENV_VAR}` placeholders
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Per-kanban notification gate: which events emit, over which channels.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NotificationSettings {
    #[serde(default)]
    pub enabled: bool,

    /// Event name -> enabled (e.g. `process_created`, `state_changed`,
    /// `sla_warning`, `sla_exceeded`)
    #[serde(default)]
    pub events: HashMap<String, bool>,

    /// Active channels: `email` and/or `webhook`
    #[serde(default)]
    pub channels: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email_config: Option<EmailChannelConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_config: Option<WebhookChannelConfig>,
}

impl NotificationSettings {
    /// Whether `event` should emit at all for this kanban.
    pub fn emits(&self, event: &str) -> bool {
        self.enabled && self.events.get(event).copied().unwrap_or(false)
    }

    pub fn has_channel(&self, channel: &str) -> bool {
        self.channels.iter().any(|c| c == channel)
    }
}

/// Hints consumed by the suggestion agents.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentHints {
    /// The nominal happy path through the board, in order
    #[serde(default)]
    pub flow_sequence: Vec<String>,
}

/// A complete workflow definition, loaded from one JSON file.
///
/// File convention: the file name should equal `id + ".json"`. Legacy
/// definitions may spell `recommended_transitions` as `transitions`; both
/// deserialize into the same field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KanbanDefinition {
    /// Unique process-wide
    pub id: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub icon: Option<String>,

    /// Ordered list of board columns
    pub states: Vec<StateDefinition>,

    #[serde(default, alias = "transitions")]
    pub recommended_transitions: Vec<TransitionRule>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub blocked_transitions: Vec<BlockedTransition>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warned_transitions: Vec<WarnedTransition>,

    /// Form paths whose saves spawn processes of this kanban. A form maps
    /// to at most one kanban process-wide; the registry enforces the
    /// partition.
    #[serde(default)]
    pub linked_forms: Vec<String>,

    /// Form-field name -> process-field name; identity when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_mapping: Option<HashMap<String, String>>,

    /// Kanban-level SLA in hours, applied at process creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sla_hours: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agents: Option<AgentHints>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifications: Option<NotificationSettings>,
}

impl KanbanDefinition {
    /// Look up a state by id.
    pub fn state(&self, state_id: &str) -> Option<&StateDefinition> {
        self.states.iter().find(|s| s.id == state_id)
    }

    pub fn has_state(&self, state_id: &str) -> bool {
        self.state(state_id).is_some()
    }

    /// Resolve where new processes start.
    ///
    /// Exactly one of three paths applies: the state declared
    /// `type = initial`, else the head of `agents.flow_sequence`, else the
    /// first declared state. An empty state list has no resolution and is a
    /// definition error at validation time.
    pub fn initial_state(&self) -> Option<&StateDefinition> {
        if let Some(state) = self
            .states
            .iter()
            .find(|s| s.state_type == Some(StateType::Initial))
        {
            return Some(state);
        }

        if let Some(hints) = &self.agents {
            if let Some(first) = hints.flow_sequence.first() {
                if let Some(state) = self.state(first) {
                    return Some(state);
                }
            }
        }

        self.states.first()
    }

    /// The blocked entry covering `(from, to)`, if any.
    pub fn blocked(&self, from: &str, to: &str) -> Option<&BlockedTransition> {
        self.blocked_transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    pub fn is_blocked(&self, from: &str, to: &str) -> bool {
        self.blocked(from, to).is_some()
    }

    /// The warned entry covering `(from, to)`, if any.
    pub fn warned(&self, from: &str, to: &str) -> Option<&WarnedTransition> {
        self.warned_transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    pub fn is_warned(&self, from: &str, to: &str) -> bool {
        self.warned(from, to).is_some()
    }

    /// The recommended entry covering `(from, to)`, if any.
    pub fn recommended(&self, from: &str, to: &str) -> Option<&TransitionRule> {
        self.recommended_transitions
            .iter()
            .find(|t| t.from == from && t.to == to)
    }

    /// All recommended transitions out of `from`, in declaration order.
    pub fn available_from(&self, from: &str) -> Vec<&TransitionRule> {
        self.recommended_transitions
            .iter()
            .filter(|t| t.from == from)
            .collect()
    }

    /// Permissive by default, restrict by exception: a transition may
    /// execute unless it appears on the blocked list.
    pub fn can_transition(&self, from: &str, to: &str) -> bool {
        !self.is_blocked(from, to)
    }

    /// Validate structural invariants, attributing failures to `file`.
    pub fn validate(&self, file: &str) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FlowboardError::InvalidDefinition {
                file: file.to_string(),
                reason: "missing required field 'id'".to_string(),
            });
        }
        if self.name.trim().is_empty() {
            return Err(FlowboardError::InvalidDefinition {
                file: file.to_string(),
                reason: "missing required field 'name'".to_string(),
            });
        }
        if self.states.is_empty() {
            return Err(FlowboardError::InvalidDefinition {
                file: file.to_string(),
                reason: "'states' cannot be empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for state in &self.states {
            if state.id.trim().is_empty() || state.name.trim().is_empty() {
                return Err(FlowboardError::InvalidDefinition {
                    file: file.to_string(),
                    reason: "each state must have 'id' and 'name'".to_string(),
                });
            }
            if !seen.insert(state.id.as_str()) {
                return Err(FlowboardError::DuplicateState {
                    file: file.to_string(),
                    state: state.id.clone(),
                });
            }
        }

        let initial_count = self
            .states
            .iter()
            .filter(|s| s.state_type == Some(StateType::Initial))
            .count();
        if initial_count > 1 {
            return Err(FlowboardError::InvalidDefinition {
                file: file.to_string(),
                reason: format!("{initial_count} states declare type 'initial'; at most one allowed"),
            });
        }

        let check = |state: &str, context: &str| -> Result<()> {
            if seen.contains(state) {
                Ok(())
            } else {
                Err(FlowboardError::UnknownStateReference {
                    file: file.to_string(),
                    context: context.to_string(),
                    state: state.to_string(),
                })
            }
        };

        for t in &self.recommended_transitions {
            check(&t.from, "recommended_transitions")?;
            check(&t.to, "recommended_transitions")?;
        }
        for t in &self.blocked_transitions {
            check(&t.from, "blocked_transitions")?;
            check(&t.to, "blocked_transitions")?;
        }
        for t in &self.warned_transitions {
            check(&t.from, "warned_transitions")?;
            check(&t.to, "warned_transitions")?;
        }
        for state in &self.states {
            if let Some(target) = &state.auto_transition_to {
                check(target, "auto_transition_to")?;
            }
        }
        if let Some(hints) = &self.agents {
            for state in &hints.flow_sequence {
                check(state, "agents.flow_sequence")?;
            }
        }

        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// A small three-state kanban used across the test suite.
    pub(crate) fn sample_kanban() -> KanbanDefinition {
        serde_json::from_value(serde_json::json!({
            "id": "pedidos",
            "name": "Pedidos",
            "states": [
                {"id": "novo", "name": "Novo", "type": "initial"},
                {"id": "em_analise", "name": "Em Análise"},
                {"id": "aprovado", "name": "Aprovado", "type": "final"}
            ],
            "recommended_transitions": [
                {"from": "novo", "to": "em_analise"},
                {"from": "em_analise", "to": "aprovado"}
            ],
            "linked_forms": ["pedidos"]
        }))
        .unwrap()
    }

    #[test]
    fn test_validate_accepts_sample() {
        assert!(sample_kanban().validate("pedidos.json").is_ok());
    }

    #[test]
    fn test_duplicate_state_rejected() {
        let mut kanban = sample_kanban();
        kanban.states.push(kanban.states[0].clone());
        let err = kanban.validate("pedidos.json").unwrap_err();
        assert!(matches!(err, FlowboardError::DuplicateState { .. }));
    }

    #[test]
    fn test_unknown_state_reference_rejected() {
        let mut kanban = sample_kanban();
        kanban.blocked_transitions.push(BlockedTransition {
            from: "novo".to_string(),
            to: "missing".to_string(),
            reason: "nope".to_string(),
        });
        let err = kanban.validate("pedidos.json").unwrap_err();
        assert!(matches!(err, FlowboardError::UnknownStateReference { .. }));
    }

    #[test]
    fn test_legacy_transitions_alias() {
        let kanban: KanbanDefinition = serde_json::from_value(serde_json::json!({
            "id": "legacy",
            "name": "Legacy",
            "states": [
                {"id": "a", "name": "A"},
                {"id": "b", "name": "B"}
            ],
            "transitions": [{"from": "a", "to": "b"}]
        }))
        .unwrap();

        assert_eq!(kanban.recommended_transitions.len(), 1);
        assert!(kanban.recommended("a", "b").is_some());
    }

    #[test]
    fn test_initial_state_resolution_order() {
        // Declared initial wins
        let kanban = sample_kanban();
        assert_eq!(kanban.initial_state().unwrap().id, "novo");

        // Without a declared initial, flow_sequence head wins
        let mut kanban = sample_kanban();
        for s in &mut kanban.states {
            s.state_type = None;
        }
        kanban.agents = Some(AgentHints {
            flow_sequence: vec!["em_analise".to_string(), "aprovado".to_string()],
        });
        assert_eq!(kanban.initial_state().unwrap().id, "em_analise");

        // Otherwise the first declared state
        kanban.agents = None;
        assert_eq!(kanban.initial_state().unwrap().id, "novo");
    }

    #[test]
    fn test_classification_consistency() {
        let mut kanban = sample_kanban();
        kanban.blocked_transitions.push(BlockedTransition {
            from: "novo".to_string(),
            to: "aprovado".to_string(),
            reason: "skip_review".to_string(),
        });

        // is_blocked implies not can_transition
        assert!(kanban.is_blocked("novo", "aprovado"));
        assert!(!kanban.can_transition("novo", "aprovado"));

        // Absence from every list still allows execution
        assert!(!kanban.is_blocked("aprovado", "novo"));
        assert!(kanban.can_transition("aprovado", "novo"));
    }

    #[test]
    fn test_available_from() {
        let kanban = sample_kanban();
        let from_novo = kanban.available_from("novo");
        assert_eq!(from_novo.len(), 1);
        assert_eq!(from_novo[0].to, "em_analise");
        assert!(kanban.available_from("aprovado").is_empty());
    }
}
