// Notification and webhook dispatch

//! # Dispatch Layer
//!
//! Event-to-channel fan-out. Each kanban gates its own notifications: the
//! `notifications` block decides whether an event type emits at all and
//! over which channels. Two channels exist, each with its own bounded
//! queue and background worker:
//!
//! - [`email::EmailDispatcher`]: templated email over a pluggable
//!   transport
//! - [`webhook::WebhookDispatcher`]: HTTP POST with a fixed payload shape
//!
//! Producers enqueue and return immediately; the workers retry failures up
//! to three times before recording them as failed. Both dispatchers expose
//! their queue depth and a history of recent results.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;

pub mod email;
pub mod webhook;

/// Maximum delivery attempts per notification.
pub const MAX_RETRIES: u32 = 3;

/// Bounded queue capacity per dispatcher.
pub const QUEUE_CAPACITY: usize = 1000;

/// Workflow events that can fan out to channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowEvent {
    ProcessCreated,
    StateChanged,
    ProcessDeleted,
    SlaWarning,
    SlaExceeded,
}

impl WorkflowEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowEvent::ProcessCreated => "process_created",
            WorkflowEvent::StateChanged => "state_changed",
            WorkflowEvent::ProcessDeleted => "process_deleted",
            WorkflowEvent::SlaWarning => "sla_warning",
            WorkflowEvent::SlaExceeded => "sla_exceeded",
        }
    }
}

/// How one queued notification ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchStatus {
    Sent,
    Failed,
}

/// One delivery result kept for observability.
#[derive(Debug, Clone, Serialize)]
pub struct DispatchRecord {
    pub target: String,
    pub event_type: String,
    pub status: DispatchStatus,
    pub retry_count: u32,
    pub queued_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Whether `kanban` emits `event` over `channel` at all.
pub(crate) fn channel_enabled(kanban: &KanbanDefinition, event: WorkflowEvent, channel: &str) -> bool {
    kanban
        .notifications
        .as_ref()
        .map_or(false, |n| n.emits(event.as_str()) && n.has_channel(channel))
}

/// Template context shared by email and webhook rendering: process
/// attributes plus `field_*` entries for every field value.
pub(crate) fn template_context(
    event: WorkflowEvent,
    process: &Process,
    kanban: &KanbanDefinition,
    additional: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut context = HashMap::from([
        ("event_type".to_string(), event.as_str().to_string()),
        ("process_id".to_string(), process.process_id.clone()),
        ("kanban_name".to_string(), kanban.name.clone()),
        ("kanban_id".to_string(), kanban.id.clone()),
        ("current_state".to_string(), process.current_state.clone()),
        ("created_at".to_string(), process.created_at.to_rfc3339()),
        ("updated_at".to_string(), process.updated_at.to_rfc3339()),
    ]);

    for (key, value) in &process.field_values {
        let safe_key = key.replace([' ', '-'], "_");
        let text = match value {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        };
        context.insert(format!("field_{safe_key}"), text);
    }

    for (key, value) in additional {
        context.insert(key.clone(), value.clone());
    }
    context
}

/// `$name` / `${name}` substitution. Unknown variables are left intact,
/// `$$` escapes a literal dollar sign.
pub(crate) fn substitute_vars(template: &str, context: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }

        match chars.peek() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some('{') => {
                chars.next();
                let mut name = String::new();
                let mut closed = false;
                for c in chars.by_ref() {
                    if c == '}' {
                        closed = true;
                        break;
                    }
                    name.push(c);
                }
                match context.get(&name) {
                    Some(value) if closed => out.push_str(value),
                    _ => {
                        out.push_str("${");
                        out.push_str(&name);
                        if closed {
                            out.push('}');
                        }
                    }
                }
            }
            _ => {
                let mut name = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        name.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match context.get(&name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('$');
                        out.push_str(&name);
                    }
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::repository::tests::sample_process;

    #[test]
    fn test_substitution_forms() {
        let context = HashMap::from([
            ("name".to_string(), "Ana".to_string()),
            ("state".to_string(), "novo".to_string()),
        ]);

        assert_eq!(
            substitute_vars("Hello $name, state is ${state}", &context),
            "Hello Ana, state is novo"
        );
        // Unknown variables survive untouched
        assert_eq!(
            substitute_vars("$unknown and ${other}", &context),
            "$unknown and ${other}"
        );
        assert_eq!(substitute_vars("$$name", &context), "$name");
    }

    #[test]
    fn test_template_context_fields() {
        let mut process = sample_process("p1", "novo");
        process.field_values.insert(
            "nome do cliente".to_string(),
            serde_json::json!("Maria"),
        );
        let kanban = sample_kanban();

        let context = template_context(
            WorkflowEvent::StateChanged,
            &process,
            &kanban,
            &HashMap::new(),
        );

        assert_eq!(context["event_type"], "state_changed");
        assert_eq!(context["process_id"], "p1");
        assert_eq!(context["kanban_name"], "Pedidos");
        // Spaces become underscores in field keys
        assert_eq!(context["field_nome_do_cliente"], "Maria");
        assert_eq!(context["field_cliente"], "Ana");
    }

    #[test]
    fn test_channel_gating() {
        let mut kanban = sample_kanban();
        assert!(!channel_enabled(
            &kanban,
            WorkflowEvent::StateChanged,
            "email"
        ));

        kanban.notifications = Some(crate::NotificationSettings {
            enabled: true,
            events: HashMap::from([("state_changed".to_string(), true)]),
            channels: vec!["email".to_string()],
            email_config: None,
            webhook_config: None,
        });

        assert!(channel_enabled(&kanban, WorkflowEvent::StateChanged, "email"));
        assert!(!channel_enabled(&kanban, WorkflowEvent::StateChanged, "webhook"));
        assert!(!channel_enabled(&kanban, WorkflowEvent::ProcessCreated, "email"));

        // Master switch off silences everything
        kanban.notifications.as_mut().unwrap().enabled = false;
        assert!(!channel_enabled(&kanban, WorkflowEvent::StateChanged, "email"));
    }
}
