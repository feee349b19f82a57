// Rule agent - suggestions from prerequisite readiness

//! # Rule Agent
//!
//! Evaluates the prerequisites of every recommended transition out of the
//! current state and suggests the readiest path. A configured auto target
//! whose prerequisites all hold is a near-certain suggestion; a target with
//! unmet prerequisites is still suggested, with the unmet conditions as
//! risk factors, because the engine lets a justified forced transition
//! take it anyway.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{AgentKind, AgentSupport, RiskLevel, Suggestion, TransitionAgent, Validation};
use crate::engine::prerequisites::PrerequisiteChecker;
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Readiness of one candidate transition.
struct TransitionReadiness {
    to_state: String,
    ready: bool,
    unsatisfied: Vec<(String, String)>,
}

/// Prerequisite-driven agent backed by the [`PrerequisiteChecker`].
pub struct RuleAgent {
    support: AgentSupport,
    checker: Arc<PrerequisiteChecker>,
}

impl RuleAgent {
    pub fn new(
        repo: Arc<ProcessRepository>,
        registry: Arc<KanbanRegistry>,
        checker: Arc<PrerequisiteChecker>,
    ) -> Self {
        RuleAgent {
            support: AgentSupport::new(repo, registry),
            checker,
        }
    }

    /// Evaluate every recommended transition out of the current state, in
    /// declaration order.
    async fn readiness(&self, process_id: &str) -> Result<(Vec<TransitionReadiness>, Option<String>)> {
        let (process, kanban, _history) = self.support.load(process_id).await?;

        let mut readiness = Vec::new();
        for rule in kanban.available_from(&process.current_state) {
            let results = self
                .checker
                .check_prerequisites(&rule.prerequisites, &process, &kanban)
                .await;
            let unsatisfied: Vec<(String, String)> = self
                .checker
                .unsatisfied(&results)
                .into_iter()
                .map(|r| (r.kind.clone(), r.message.clone()))
                .collect();

            readiness.push(TransitionReadiness {
                to_state: rule.to.clone(),
                ready: unsatisfied.is_empty(),
                unsatisfied,
            });
        }

        let auto_target = kanban
            .state(&process.current_state)
            .and_then(|s| s.auto_transition_to.clone());
        Ok((readiness, auto_target))
    }
}

#[async_trait]
impl TransitionAgent for RuleAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Rule
    }

    async fn analyze_context(&self, process_id: &str) -> Result<Value> {
        let (readiness, auto_target) = self.readiness(process_id).await?;

        let mut by_state = serde_json::Map::new();
        for r in &readiness {
            by_state.insert(
                r.to_state.clone(),
                json!({
                    "ready": r.ready,
                    "prerequisites_met": r.ready,
                    "unsatisfied_prerequisites": r
                        .unsatisfied
                        .iter()
                        .map(|(kind, message)| json!({"type": kind, "message": message}))
                        .collect::<Vec<_>>(),
                }),
            );
        }

        Ok(json!({
            "available_transitions": readiness.iter().map(|r| r.to_state.clone()).collect::<Vec<_>>(),
            "transition_readiness": by_state,
            "auto_transition_available": auto_target.is_some(),
            "auto_transition_to": auto_target,
        }))
    }

    async fn suggest_transition(&self, process_id: &str) -> Result<Suggestion> {
        let (readiness, auto_target) = self.readiness(process_id).await?;

        if readiness.is_empty() {
            return Ok(Suggestion::new(
                None,
                0.0,
                "No transitions available from current state",
            )
            .with_risks(vec!["Process may be stuck".to_string()]));
        }

        // A ready auto target is a near-certain call
        if let Some(target) = &auto_target {
            if let Some(r) = readiness.iter().find(|r| &r.to_state == target) {
                if r.ready {
                    return Ok(Suggestion::new(
                        Some(target.clone()),
                        0.9,
                        format!(
                            "Auto-transition to '{target}' configured and all prerequisites satisfied."
                        ),
                    ));
                }
                return Ok(Suggestion::new(
                    None,
                    0.4,
                    format!(
                        "Auto-transition to '{target}' configured but {} prerequisite(s) not satisfied.",
                        r.unsatisfied.len()
                    ),
                )
                .with_risks(r.unsatisfied.iter().map(|(_, m)| m.clone()).collect()));
            }
        }

        // Any fully ready transition
        if let Some(r) = readiness.iter().find(|r| r.ready) {
            return Ok(Suggestion::new(
                Some(r.to_state.clone()),
                0.8,
                format!("All prerequisites satisfied for transition to '{}'.", r.to_state),
            ));
        }

        // Least-blocked transition, suggested for a justified force
        let best = readiness
            .iter()
            .min_by_key(|r| r.unsatisfied.len())
            .expect("readiness checked non-empty");
        Ok(Suggestion::new(
            Some(best.to_state.clone()),
            0.5,
            format!(
                "Transition to '{}' has {} unsatisfied prerequisite(s). Consider forced transition with justification.",
                best.to_state,
                best.unsatisfied.len()
            ),
        )
        .with_risks(best.unsatisfied.iter().map(|(_, m)| m.clone()).collect()))
    }

    async fn validate_transition(
        &self,
        process_id: &str,
        target_state: &str,
    ) -> Result<Validation> {
        let (readiness, _) = self.readiness(process_id).await?;

        let Some(target) = readiness.iter().find(|r| r.to_state == target_state) else {
            return Ok(Validation::rejected(vec![format!(
                "Transition to '{target_state}' is not defined in kanban"
            )]));
        };

        if target.ready {
            return Ok(Validation::ok());
        }

        let warnings: Vec<String> = target.unsatisfied.iter().map(|(_, m)| m.clone()).collect();
        let risk_level = if target.unsatisfied.len() > 2 {
            RiskLevel::High
        } else {
            RiskLevel::Medium
        };

        Ok(Validation {
            valid: true,
            warnings,
            errors: vec![],
            risk_level,
        })
    }
}
