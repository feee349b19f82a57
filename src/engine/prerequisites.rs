// Prerequisite checker - four check kinds, warn-not-block

//! # Prerequisite Checker
//!
//! Evaluates the prerequisites of a transition and reports one
//! [`CheckResult`] per descriptor. The checker upholds the engine's central
//! contract: **it never raises for a check outcome**. Unknown kinds,
//! unreachable endpoints, malformed scripts, bad timestamps: every
//! failure mode becomes `satisfied = false` with a diagnostic message, and
//! the transition engine turns unsatisfied results into warnings, not
//! rejections.
//!
//! External API checks and custom scripts are the two extension points.
//! API calls are bounded by a per-descriptor timeout (default 5 s) and
//! accept only a 2xx response whose JSON body says `satisfied: true`.
//! Custom scripts are pure [`ScriptRule`](crate::models::prerequisite::ScriptRule)
//! documents loaded from a fixed directory: no I/O, no environment access,
//! bounded evaluation depth.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::models::kanban::KanbanDefinition;
use crate::models::prerequisite::{
    value_as_f64, CheckResult, FieldCondition, Prerequisite, ScriptRule,
};
use crate::models::process::Process;
use crate::storage::repository::ProcessRepository;

impl FieldCondition {
    fn as_str(&self) -> &'static str {
        match self {
            FieldCondition::NotEmpty => "not_empty",
            FieldCondition::Equals => "equals",
            FieldCondition::NotEquals => "not_equals",
            FieldCondition::Contains => "contains",
            FieldCondition::GreaterThan => "greater_than",
            FieldCondition::LessThan => "less_than",
            FieldCondition::GreaterOrEqual => "greater_or_equal",
            FieldCondition::LessOrEqual => "less_or_equal",
            FieldCondition::Regex => "regex",
        }
    }
}

/// Checker for transition prerequisites.
pub struct PrerequisiteChecker {
    scripts_dir: PathBuf,
    repo: Arc<ProcessRepository>,
    http: reqwest::Client,
}

impl PrerequisiteChecker {
    pub fn new(scripts_dir: impl Into<PathBuf>, repo: Arc<ProcessRepository>) -> Self {
        PrerequisiteChecker {
            scripts_dir: scripts_dir.into(),
            repo,
            http: reqwest::Client::new(),
        }
    }

    /// Check every prerequisite, one result per descriptor, in order.
    pub async fn check_prerequisites(
        &self,
        prerequisites: &[Prerequisite],
        process: &Process,
        kanban: &KanbanDefinition,
    ) -> Vec<CheckResult> {
        let mut results = Vec::with_capacity(prerequisites.len());
        for prereq in prerequisites {
            let result = match prereq {
                Prerequisite::FieldCheck {
                    field,
                    condition,
                    value,
                    message,
                } => self.check_field(process, field, *condition, value.as_ref(), message.as_deref()),
                Prerequisite::ExternalApi {
                    url,
                    method,
                    headers,
                    payload,
                    timeout,
                    message,
                } => {
                    self.check_external_api(
                        process,
                        url,
                        method,
                        headers,
                        payload,
                        *timeout,
                        message.as_deref(),
                    )
                    .await
                }
                Prerequisite::TimeElapsed {
                    hours,
                    minutes,
                    message,
                } => {
                    self.check_time_elapsed(process, *hours, *minutes, message.as_deref())
                        .await
                }
                Prerequisite::CustomScript { script, message } => {
                    self.check_custom_script(process, kanban, script, message.as_deref())
                }
            };
            results.push(result);
        }
        results
    }

    /// All results satisfied?
    pub fn all_satisfied(&self, results: &[CheckResult]) -> bool {
        results.iter().all(|r| r.satisfied)
    }

    /// The unsatisfied subset, in order.
    pub fn unsatisfied<'a>(&self, results: &'a [CheckResult]) -> Vec<&'a CheckResult> {
        results.iter().filter(|r| !r.satisfied).collect()
    }

    // ========== field_check ==========

    fn check_field(
        &self,
        process: &Process,
        field: &str,
        condition: FieldCondition,
        expected: Option<&Value>,
        message: Option<&str>,
    ) -> CheckResult {
        let actual = process.field_values.get(field).cloned();
        let message = message.map(str::to_string).unwrap_or_else(|| {
            format!(
                "Field '{field}' does not meet condition '{}'",
                condition.as_str()
            )
        });

        let satisfied = match condition {
            FieldCondition::NotEmpty => {
                matches!(&actual, Some(v) if !v.is_null() && v.as_str() != Some(""))
            }

            FieldCondition::Equals => values_equal(actual.as_ref(), expected),

            FieldCondition::NotEquals => !values_equal(actual.as_ref(), expected),

            FieldCondition::Contains => match (&actual, expected.and_then(Value::as_str)) {
                (Some(Value::String(s)), Some(needle)) => s.contains(needle),
                _ => false,
            },

            FieldCondition::GreaterThan
            | FieldCondition::LessThan
            | FieldCondition::GreaterOrEqual
            | FieldCondition::LessOrEqual => {
                // Absent or null compares as zero; unparseable values fail
                let actual_num = match &actual {
                    None | Some(Value::Null) => Some(0.0),
                    Some(v) => value_as_f64(v),
                };
                match (actual_num, expected.and_then(|v| value_as_f64(v))) {
                    (Some(a), Some(e)) => match condition {
                        FieldCondition::GreaterThan => a > e,
                        FieldCondition::LessThan => a < e,
                        FieldCondition::GreaterOrEqual => a >= e,
                        FieldCondition::LessOrEqual => a <= e,
                        _ => unreachable!(),
                    },
                    _ => false,
                }
            }

            FieldCondition::Regex => match (&actual, expected.and_then(Value::as_str)) {
                (Some(Value::String(s)), Some(pattern)) => {
                    match regex::Regex::new(&format!("^(?:{pattern})$")) {
                        Ok(re) => re.is_match(s),
                        Err(_) => false,
                    }
                }
                _ => false,
            },
        };

        CheckResult::new("field_check", satisfied, message).with_details(json!({
            "field": field,
            "condition": condition.as_str(),
            "actual_value": actual,
            "expected_value": expected,
        }))
    }

    // ========== external_api ==========

    #[allow(clippy::too_many_arguments)]
    async fn check_external_api(
        &self,
        process: &Process,
        url: &str,
        method: &str,
        headers: &std::collections::HashMap<String, String>,
        payload: &Map<String, Value>,
        timeout_secs: u64,
        message: Option<&str>,
    ) -> CheckResult {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| "External API validation failed".to_string());

        let url = substitute_placeholders(url, process);
        let payload = substitute_in_map(payload, process);
        let timeout = Duration::from_secs(timeout_secs);

        let request = match method.to_uppercase().as_str() {
            "GET" => self.http.get(&url),
            "POST" => self.http.post(&url).json(&payload),
            other => {
                return CheckResult::new(
                    "external_api",
                    false,
                    format!("Unsupported HTTP method: {other}"),
                );
            }
        };

        let mut request = request.timeout(timeout);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = match request.send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return CheckResult::new(
                    "external_api",
                    false,
                    format!("API call timed out after {timeout_secs}s"),
                );
            }
            Err(e) => {
                return CheckResult::new("external_api", false, format!("API call failed: {e}"));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return CheckResult::new(
                "external_api",
                false,
                format!("API returned status {}", status.as_u16()),
            )
            .with_details(json!({"url": url, "status_code": status.as_u16()}));
        }

        match response.json::<Value>().await {
            Ok(body) => {
                let satisfied = body
                    .get("satisfied")
                    .and_then(Value::as_bool)
                    .unwrap_or(false);
                let api_message = body
                    .get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(message);
                CheckResult::new("external_api", satisfied, api_message).with_details(json!({
                    "url": url,
                    "status_code": status.as_u16(),
                    "response": body,
                }))
            }
            Err(e) => CheckResult::new(
                "external_api",
                false,
                format!("API returned malformed JSON: {e}"),
            ),
        }
    }

    // ========== time_elapsed ==========

    async fn check_time_elapsed(
        &self,
        process: &Process,
        hours: f64,
        minutes: f64,
        message: Option<&str>,
    ) -> CheckResult {
        let message = message
            .map(str::to_string)
            .unwrap_or_else(|| format!("Minimum {hours}h {minutes}m not elapsed"));

        let min_seconds = hours * 3600.0 + minutes * 60.0;

        // Latest audit timestamp for the process, or creation time if the
        // trail is empty.
        let since = match self.repo.history(&process.process_id).await {
            Ok(history) => history
                .last()
                .map(|e| e.timestamp)
                .unwrap_or(process.created_at),
            Err(e) => {
                return CheckResult::new(
                    "time_elapsed",
                    false,
                    format!("Could not read process history: {e}"),
                );
            }
        };

        let elapsed = (Utc::now() - since).num_seconds() as f64;
        CheckResult::new("time_elapsed", elapsed >= min_seconds, message).with_details(json!({
            "required_seconds": min_seconds,
            "elapsed_seconds": elapsed,
            "since": since.to_rfc3339(),
        }))
    }

    // ========== custom_script ==========

    fn check_custom_script(
        &self,
        process: &Process,
        kanban: &KanbanDefinition,
        script: &str,
        message: Option<&str>,
    ) -> CheckResult {
        let fallback = message
            .map(str::to_string)
            .unwrap_or_else(|| "Custom script validation failed".to_string());

        if script.trim().is_empty() {
            return CheckResult::new("custom_script", false, "No script specified");
        }

        let path = self.scripts_dir.join(script);
        if !path.exists() {
            return CheckResult::new("custom_script", false, format!("Script not found: {script}"));
        }

        let contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return CheckResult::new(
                    "custom_script",
                    false,
                    format!("Script read error: {e}"),
                );
            }
        };

        let rule: ScriptRule = match serde_json::from_str(&contents) {
            Ok(r) => r,
            Err(e) => {
                return CheckResult::new(
                    "custom_script",
                    false,
                    format!("Script parse error: {e}"),
                );
            }
        };

        let satisfied = rule.rule.evaluate(process, kanban);
        debug!(script, satisfied, "custom script evaluated");

        let message = if satisfied {
            rule.description.unwrap_or(fallback)
        } else {
            rule.message.unwrap_or(fallback)
        };

        CheckResult::new("custom_script", satisfied, message)
            .with_details(json!({"script": script}))
    }
}

/// `{key}` placeholder substitution from process attributes and fields.
fn substitute_placeholders(text: &str, process: &Process) -> String {
    let mut out = text.to_string();

    let mut replace = |key: &str, value: String| {
        let placeholder = format!("{{{key}}}");
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, &value);
        }
    };

    replace("process_id", process.process_id.clone());
    replace("kanban_id", process.kanban_id.clone());
    replace("current_state", process.current_state.clone());
    replace("source_form", process.source_form.clone());
    for (key, value) in &process.field_values {
        replace(key, display_value(value));
    }
    out
}

fn substitute_in_map(map: &Map<String, Value>, process: &Process) -> Map<String, Value> {
    map.iter()
        .map(|(k, v)| (k.clone(), substitute_in_value(v, process)))
        .collect()
}

fn substitute_in_value(value: &Value, process: &Process) -> Value {
    match value {
        Value::String(s) => Value::String(substitute_placeholders(s, process)),
        Value::Object(map) => Value::Object(substitute_in_map(map, process)),
        other => other.clone(),
    }
}

/// Scalar rendering for placeholders: strings bare, everything else JSON.
fn display_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Numeric-aware equality: `100` equals `100.0`, otherwise exact JSON.
fn values_equal(actual: Option<&Value>, expected: Option<&Value>) -> bool {
    match (actual, expected) {
        (Some(a), Some(e)) => {
            if a == e {
                return true;
            }
            if let (Value::Number(x), Value::Number(y)) = (a, e) {
                if let (Some(x), Some(y)) = (x.as_f64(), y.as_f64()) {
                    return (x - y).abs() < f64::EPSILON;
                }
            }
            false
        }
        (None, None) => true,
        (Some(Value::Null), None) | (None, Some(Value::Null)) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::repository::tests::{repo, sample_process};
    use serde_json::json;

    fn checker_with_repo() -> (PrerequisiteChecker, Arc<ProcessRepository>) {
        let repo = Arc::new(repo());
        let dir = tempfile::tempdir().unwrap();
        (
            PrerequisiteChecker::new(dir.path(), repo.clone()),
            repo,
        )
    }

    fn field_check(field: &str, condition: &str, value: Value) -> Prerequisite {
        serde_json::from_value(json!({
            "type": "field_check",
            "field": field,
            "condition": condition,
            "value": value,
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_field_conditions() {
        let (checker, _) = checker_with_repo();
        let kanban = sample_kanban();
        let process = sample_process("p1", "novo");

        let prereqs = vec![
            field_check("cliente", "not_empty", Value::Null),
            field_check("valor", "greater_than", json!(50)),
            field_check("valor", "less_or_equal", json!(100)),
            field_check("cliente", "equals", json!("Ana")),
            field_check("cliente", "contains", json!("An")),
            field_check("cliente", "regex", json!("[A-Z][a-z]+")),
        ];
        let results = checker.check_prerequisites(&prereqs, &process, &kanban).await;
        assert!(checker.all_satisfied(&results), "{results:?}");

        let failing = vec![
            field_check("valor", "greater_than", json!(100)),
            field_check("missing", "not_empty", Value::Null),
            // Full match, not substring match
            field_check("cliente", "regex", json!("[a-z]+")),
        ];
        let results = checker.check_prerequisites(&failing, &process, &kanban).await;
        assert_eq!(checker.unsatisfied(&results).len(), 3);
    }

    #[tokio::test]
    async fn test_absent_numeric_field_compares_as_zero() {
        let (checker, _) = checker_with_repo();
        let kanban = sample_kanban();
        let process = sample_process("p1", "novo");

        let results = checker
            .check_prerequisites(
                &[field_check("missing", "less_than", json!(1))],
                &process,
                &kanban,
            )
            .await;
        assert!(results[0].satisfied);
    }

    #[tokio::test]
    async fn test_unknown_api_host_is_unsatisfied_not_error() {
        let (checker, _) = checker_with_repo();
        let kanban = sample_kanban();
        let process = sample_process("p1", "novo");

        let prereq: Prerequisite = serde_json::from_value(json!({
            "type": "external_api",
            "url": "http://127.0.0.1:9/check/{process_id}",
            "timeout": 1
        }))
        .unwrap();

        let results = checker
            .check_prerequisites(&[prereq], &process, &kanban)
            .await;
        assert!(!results[0].satisfied);
        assert_eq!(results[0].kind, "external_api");
    }

    #[tokio::test]
    async fn test_time_elapsed_uses_creation_time_without_history() {
        let (checker, _) = checker_with_repo();
        let kanban = sample_kanban();
        let mut process = sample_process("p1", "novo");
        process.created_at = Utc::now() - chrono::Duration::hours(2);

        let satisfied: Prerequisite =
            serde_json::from_value(json!({"type": "time_elapsed", "hours": 1})).unwrap();
        let unsatisfied: Prerequisite =
            serde_json::from_value(json!({"type": "time_elapsed", "hours": 5})).unwrap();

        let results = checker
            .check_prerequisites(&[satisfied, unsatisfied], &process, &kanban)
            .await;
        assert!(results[0].satisfied);
        assert!(!results[1].satisfied);
    }

    #[tokio::test]
    async fn test_custom_script_paths() {
        let repo = Arc::new(repo());
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("payable.json"),
            serde_json::to_string(&json!({
                "description": "order is payable",
                "rule": {"type": "FieldGreaterThan", "field": "valor", "value": 50.0},
                "message": "order value too low"
            }))
            .unwrap(),
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "not json").unwrap();
        let checker = PrerequisiteChecker::new(dir.path(), repo);

        let kanban = sample_kanban();
        let process = sample_process("p1", "novo");

        let script = |name: &str| -> Prerequisite {
            serde_json::from_value(json!({"type": "custom_script", "script": name})).unwrap()
        };

        let results = checker
            .check_prerequisites(
                &[script("payable.json"), script("broken.json"), script("missing.json")],
                &process,
                &kanban,
            )
            .await;

        assert!(results[0].satisfied);
        assert!(!results[1].satisfied);
        assert!(results[1].message.contains("parse error"));
        assert!(!results[2].satisfied);
        assert!(results[2].message.contains("not found"));
    }

    #[test]
    fn test_placeholder_substitution() {
        let process = sample_process("p1", "novo");
        let url = substitute_placeholders(
            "https://api.test/{process_id}/check?cliente={cliente}&v={valor}",
            &process,
        );
        assert_eq!(url, "https://api.test/p1/check?cliente=Ana&v=100.0");
    }
}
