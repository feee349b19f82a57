// Heuristic agent - completeness and dwell-time heuristics

//! # Heuristic Agent
//!
//! The general-purpose agent: no history, no configured rules, just
//! structural signals. Confidence rises with field completeness and with
//! time already spent in the state; a state with only one way out is a
//! strong suggestion; an `auto_transition_to` hint is preferred over
//! declaration order; below 50% completeness the agent recommends staying
//! and filling data first.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{AgentKind, AgentSupport, RiskLevel, Suggestion, TransitionAgent, Validation};
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Heuristics-driven agent; works on any kanban without training data.
pub struct HeuristicAgent {
    support: AgentSupport,
}

impl HeuristicAgent {
    pub fn new(repo: Arc<ProcessRepository>, registry: Arc<KanbanRegistry>) -> Self {
        HeuristicAgent {
            support: AgentSupport::new(repo, registry),
        }
    }
}

#[async_trait]
impl TransitionAgent for HeuristicAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Heuristic
    }

    async fn analyze_context(&self, process_id: &str) -> Result<Value> {
        let (process, kanban, history) = self.support.load(process_id).await?;

        let available: Vec<String> = kanban
            .available_from(&process.current_state)
            .iter()
            .map(|t| t.to.clone())
            .collect();

        let total_fields = process.field_values.len();
        let filled_fields = process
            .field_values
            .values()
            .filter(|v| !v.is_null() && v.as_str() != Some(""))
            .count();

        Ok(json!({
            "field_completeness": process.field_completeness(),
            "time_in_current_state": AgentSupport::hours_in_state(&process, &history),
            "transition_count": AgentSupport::transition_count(&history),
            "available_transitions": available,
            "state_info": {
                "kanban_id": process.kanban_id,
                "current_state": process.current_state,
                "total_fields": total_fields,
                "filled_fields": filled_fields,
            },
        }))
    }

    async fn suggest_transition(&self, process_id: &str) -> Result<Suggestion> {
        let (process, kanban, history) = self.support.load(process_id).await?;

        let completeness = process.field_completeness();
        let time_in_state = AgentSupport::hours_in_state(&process, &history);
        let current_state = process.current_state.clone();
        let available: Vec<String> = kanban
            .available_from(&current_state)
            .iter()
            .map(|t| t.to.clone())
            .collect();

        // Incomplete data: recommend staying and filling first
        if completeness < 0.5 {
            return Ok(Suggestion::new(
                None,
                0.2,
                format!(
                    "Field completeness is only {}%. Recommend filling more data before transitioning.",
                    (completeness * 100.0) as u32
                ),
            )
            .with_risks(vec![
                "Incomplete data may cause issues in next state".to_string()
            ]));
        }

        if available.is_empty() {
            return Ok(Suggestion::new(
                None,
                0.0,
                format!("No transitions available from '{current_state}'"),
            )
            .with_risks(vec![
                "Process may be in final state or misconfigured".to_string()
            ]));
        }

        // A single way out is a strong signal
        if available.len() == 1 {
            let target = available[0].clone();
            let mut confidence = 0.6;
            if completeness > 0.8 {
                confidence += 0.2;
            }
            if time_in_state > 1.0 {
                confidence += 0.1;
            }
            return Ok(Suggestion::new(
                Some(target.clone()),
                confidence,
                format!(
                    "Only one path available from '{current_state}' to '{target}'. Field completeness is {}%.",
                    (completeness * 100.0) as u32
                ),
            ));
        }

        // Several options: prefer the configured auto target
        let auto_target = kanban
            .state(&current_state)
            .and_then(|s| s.auto_transition_to.clone())
            .filter(|t| available.contains(t));
        if let Some(target) = auto_target {
            let confidence = if completeness > 0.9 { 0.85 } else { 0.7 };
            return Ok(Suggestion::new(
                Some(target.clone()),
                confidence,
                format!(
                    "State '{current_state}' is configured to auto-transition to '{target}'. Field completeness: {}%.",
                    (completeness * 100.0) as u32
                ),
            ));
        }

        let target = available[0].clone();
        Ok(Suggestion::new(
            Some(target.clone()),
            0.5,
            format!(
                "Multiple transitions available. Suggesting '{target}' based on definition order. Consider context before proceeding."
            ),
        )
        .with_risks(vec![
            "Multiple paths available - manual review recommended".to_string()
        ]))
    }

    async fn validate_transition(
        &self,
        process_id: &str,
        target_state: &str,
    ) -> Result<Validation> {
        let (process, kanban, history) = self.support.load(process_id).await?;

        if let Some(blocked) = kanban.blocked(&process.current_state, target_state) {
            return Ok(Validation::rejected(vec![blocked.reason.clone()]));
        }

        let completeness = process.field_completeness();
        let mut warnings = Vec::new();
        let mut risk_level = RiskLevel::Low;

        if completeness < 0.5 {
            warnings.push(format!(
                "Field completeness is only {}%",
                (completeness * 100.0) as u32
            ));
            risk_level = RiskLevel::High;
        } else if completeness < 0.8 {
            warnings.push(format!(
                "Field completeness is {}% - consider filling more data",
                (completeness * 100.0) as u32
            ));
            risk_level = RiskLevel::Medium;
        }

        // Sub-six-minute turnarounds deserve a second look
        if AgentSupport::hours_in_state(&process, &history) < 0.1 {
            warnings.push("Very quick transition - ensure this is intentional".to_string());
        }

        Ok(Validation {
            valid: true,
            warnings,
            errors: vec![],
            risk_level,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::repository::tests::sample_process;
    use serde_json::json;

    async fn setup(kanban: crate::KanbanDefinition) -> (HeuristicAgent, Arc<ProcessRepository>) {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(kanban, false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        (HeuristicAgent::new(repo.clone(), registry), repo)
    }

    #[tokio::test]
    async fn test_single_transition_suggested() {
        let (agent, repo) = setup(sample_kanban()).await;
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        let suggestion = agent.suggest_transition("p1").await.unwrap();
        assert_eq!(suggestion.suggested_state.as_deref(), Some("em_analise"));
        // Complete fields: 0.6 + 0.2
        assert!((suggestion.confidence - 0.8).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_incomplete_data_suggests_staying() {
        let (agent, repo) = setup(sample_kanban()).await;
        let mut process = sample_process("p1", "novo");
        process.field_values.insert("valor".to_string(), json!(""));
        process.field_values.insert("obs".to_string(), Value::Null);
        process.field_values.insert("extra".to_string(), json!(""));
        repo.create_process(process).await.unwrap();

        let suggestion = agent.suggest_transition("p1").await.unwrap();
        assert!(suggestion.suggested_state.is_none());
        assert!((suggestion.confidence - 0.2).abs() < 1e-9);
        assert!(!suggestion.risk_factors.is_empty());
    }

    #[tokio::test]
    async fn test_final_state_has_no_suggestion() {
        let (agent, repo) = setup(sample_kanban()).await;
        repo.create_process(sample_process("p1", "aprovado"))
            .await
            .unwrap();

        let suggestion = agent.suggest_transition("p1").await.unwrap();
        assert!(suggestion.suggested_state.is_none());
        assert_eq!(suggestion.confidence, 0.0);
    }

    #[tokio::test]
    async fn test_auto_hint_preferred_among_many() {
        let mut kanban = sample_kanban();
        kanban
            .recommended_transitions
            .push(crate::TransitionRule {
                from: "novo".to_string(),
                to: "aprovado".to_string(),
                prerequisites: vec![],
            });
        kanban.states[0].auto_transition_to = Some("em_analise".to_string());
        let (agent, repo) = setup(kanban).await;
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        let suggestion = agent.suggest_transition("p1").await.unwrap();
        assert_eq!(suggestion.suggested_state.as_deref(), Some("em_analise"));
        assert!((suggestion.confidence - 0.7).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_validate_blocks_and_warns() {
        let mut kanban = sample_kanban();
        kanban.blocked_transitions.push(crate::BlockedTransition {
            from: "novo".to_string(),
            to: "aprovado".to_string(),
            reason: "skip_review".to_string(),
        });
        let (agent, repo) = setup(kanban).await;
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        let rejected = agent.validate_transition("p1", "aprovado").await.unwrap();
        assert!(!rejected.valid);
        assert_eq!(rejected.errors, vec!["skip_review"]);

        let allowed = agent.validate_transition("p1", "em_analise").await.unwrap();
        assert!(allowed.valid);
        // Fresh process: quick-transition warning fires
        assert!(allowed
            .warnings
            .iter()
            .any(|w| w.contains("Very quick transition")));
    }
}
