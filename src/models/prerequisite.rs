// Prerequisite descriptors and the script rule expression language

//! # Prerequisites
//!
//! A prerequisite is a declarative precondition attached to a recommended
//! transition (or a state). Four kinds exist: field checks, external API
//! calls, elapsed-time checks, and custom script rules. Prerequisites
//! **inform, they do not prevent**: the checker turns every failure,
//! including its own errors, into an unsatisfied result.
//!
//! ## Script rules
//!
//! Custom logic runs as a pure, recursive condition tree ([`CheckRule`])
//! loaded from a JSON document in the scripts directory. The tree evaluates
//! against the process and its kanban only: no I/O, no environment, no
//! recursion beyond a fixed depth. Malformed or over-deep rules evaluate to
//! `false` rather than erroring, which keeps the warn-not-block contract
//! intact even for broken scripts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;

/// Nesting bound for [`CheckRule`] evaluation.
const MAX_RULE_DEPTH: usize = 32;

fn default_method() -> String {
    "GET".to_string()
}

fn default_timeout() -> u64 {
    5
}

/// Comparison applied by a `field_check` prerequisite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCondition {
    NotEmpty,
    Equals,
    NotEquals,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
    /// Full match anchored at the start of the value
    Regex,
}

/// One declarative precondition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Prerequisite {
    /// Compare a process field against a condition
    FieldCheck {
        field: String,
        condition: FieldCondition,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<Value>,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Ask an external HTTP endpoint; only a 2xx JSON body with
    /// `satisfied: true` passes
    ExternalApi {
        /// May contain `{field}` placeholders substituted from the process
        url: String,

        #[serde(default = "default_method")]
        method: String,

        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,

        /// POST body; string values support the same placeholders
        #[serde(default, skip_serializing_if = "Map::is_empty")]
        payload: Map<String, Value>,

        /// Seconds; the call is always bounded
        #[serde(default = "default_timeout")]
        timeout: u64,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Minimum dwell time since the last recorded transition (or creation)
    TimeElapsed {
        #[serde(default)]
        hours: f64,

        #[serde(default)]
        minutes: f64,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },

    /// Evaluate a [`ScriptRule`] document from the scripts directory
    CustomScript {
        /// File name within the fixed scripts directory
        script: String,

        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
}

impl Prerequisite {
    /// The wire name of this prerequisite kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Prerequisite::FieldCheck { .. } => "field_check",
            Prerequisite::ExternalApi { .. } => "external_api",
            Prerequisite::TimeElapsed { .. } => "time_elapsed",
            Prerequisite::CustomScript { .. } => "custom_script",
        }
    }
}

/// Outcome of checking one prerequisite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckResult {
    /// Prerequisite kind (`field_check`, `external_api`, ...)
    #[serde(rename = "type")]
    pub kind: String,

    pub satisfied: bool,

    /// Human-readable explanation, surfaced as a warning when unsatisfied
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl CheckResult {
    pub fn new(kind: &str, satisfied: bool, message: impl Into<String>) -> Self {
        CheckResult {
            kind: kind.to_string(),
            satisfied,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// A custom script: one pure condition tree plus its messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub rule: CheckRule,

    /// Message reported when the rule is unsatisfied
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// Recursive condition tree evaluated against a process and its kanban.
///
/// Serialized as a tagged union, so a script file reads naturally:
///
/// ```json
/// {
///   "description": "order is payable",
///   "rule": {
///     "type": "And",
///     "rules": [
///       {"type": "FieldGreaterThan", "field": "valor", "value": 0.0},
///       {"type": "Not", "rule": {"type": "FieldEquals", "field": "status", "value": "cancelado"}}
///     ]
///   },
///   "message": "order is not payable yet"
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CheckRule {
    /// Field is present and non-null
    FieldExists { field: String },

    /// Exact JSON equality
    FieldEquals { field: String, value: Value },

    FieldNotEquals { field: String, value: Value },

    /// Numeric comparison; non-numeric values fail the check
    FieldGreaterThan { field: String, value: f64 },

    FieldLessThan { field: String, value: f64 },

    /// Case-sensitive substring on string values
    FieldContains { field: String, substring: String },

    /// Regex match anchored at the start of the value
    FieldMatches { field: String, pattern: String },

    /// The process currently sits in the named state
    InState { state: String },

    /// At least this many hours since the process was last touched
    ElapsedAtLeastHours { hours: f64 },

    /// All nested rules pass; an empty list passes
    And { rules: Vec<CheckRule> },

    /// At least one nested rule passes; an empty list fails
    Or { rules: Vec<CheckRule> },

    Not { rule: Box<CheckRule> },
}

impl CheckRule {
    /// Evaluate against a process and its kanban definition.
    pub fn evaluate(&self, process: &Process, kanban: &KanbanDefinition) -> bool {
        self.evaluate_at(process, kanban, 0)
    }

    fn evaluate_at(&self, process: &Process, kanban: &KanbanDefinition, depth: usize) -> bool {
        if depth > MAX_RULE_DEPTH {
            return false;
        }

        match self {
            CheckRule::FieldExists { field } => {
                matches!(lookup_field(process, field), Some(v) if !v.is_null())
            }

            CheckRule::FieldEquals { field, value } => {
                lookup_field(process, field) == Some(value.clone())
            }

            CheckRule::FieldNotEquals { field, value } => {
                lookup_field(process, field) != Some(value.clone())
            }

            CheckRule::FieldGreaterThan { field, value } => {
                numeric_field(process, field).map_or(false, |v| v > *value)
            }

            CheckRule::FieldLessThan { field, value } => {
                numeric_field(process, field).map_or(false, |v| v < *value)
            }

            CheckRule::FieldContains { field, substring } => lookup_field(process, field)
                .and_then(|v| v.as_str().map(str::to_string))
                .map_or(false, |s| s.contains(substring)),

            CheckRule::FieldMatches { field, pattern } => {
                let Some(value) = lookup_field(process, field) else {
                    return false;
                };
                let Some(text) = value.as_str() else {
                    return false;
                };
                match regex::Regex::new(pattern) {
                    Ok(re) => re.find(text).map_or(false, |m| m.start() == 0),
                    Err(_) => false,
                }
            }

            CheckRule::InState { state } => {
                process.current_state == *state && kanban.has_state(state)
            }

            CheckRule::ElapsedAtLeastHours { hours } => {
                let elapsed = chrono::Utc::now() - process.updated_at;
                elapsed.num_seconds() as f64 / 3600.0 >= *hours
            }

            CheckRule::And { rules } => rules
                .iter()
                .all(|r| r.evaluate_at(process, kanban, depth + 1)),

            CheckRule::Or { rules } => rules
                .iter()
                .any(|r| r.evaluate_at(process, kanban, depth + 1)),

            CheckRule::Not { rule } => !rule.evaluate_at(process, kanban, depth + 1),
        }
    }
}

/// Resolve a field name against `field_values`, then process attributes.
fn lookup_field(process: &Process, field: &str) -> Option<Value> {
    if let Some(value) = process.field_values.get(field) {
        return Some(value.clone());
    }

    match field {
        "process_id" => Some(Value::String(process.process_id.clone())),
        "kanban_id" => Some(Value::String(process.kanban_id.clone())),
        "current_state" => Some(Value::String(process.current_state.clone())),
        "source_form" => Some(Value::String(process.source_form.clone())),
        "assigned_to" => process.assigned_to.clone().map(Value::String),
        _ => process.metadata.get(field).cloned(),
    }
}

/// Coerce a field value to f64: numbers directly, strings by parsing.
pub(crate) fn numeric_field(process: &Process, field: &str) -> Option<f64> {
    value_as_f64(&lookup_field(process, field)?)
}

/// Numeric coercion shared by field checks and script rules.
pub(crate) fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}
