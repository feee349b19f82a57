// Pattern agent - suggestions from historical paths

//! # Pattern Agent
//!
//! Suggests whatever similar processes historically did next. The agent
//! matches the live state sequence against mined patterns: a pattern whose
//! prefix extends the current sequence contributes its next state, and the
//! best-supported continuation wins. Confidence is the contributing
//! pattern's confidence, so a rarely-completed path produces a hesitant
//! suggestion.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::agents::{AgentKind, AgentSupport, RiskLevel, Suggestion, TransitionAgent, Validation};
use crate::analysis::patterns::{PatternAnalyzer, PatternStat};
use crate::analysis::ProcessTrail;
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Support floor used when mining patterns for suggestions.
const SUGGESTION_MIN_SUPPORT: f64 = 0.2;

/// History-driven agent backed by the [`PatternAnalyzer`].
pub struct PatternAgent {
    support: AgentSupport,
    analyzer: Arc<PatternAnalyzer>,
}

impl PatternAgent {
    pub fn new(
        repo: Arc<ProcessRepository>,
        registry: Arc<KanbanRegistry>,
        analyzer: Arc<PatternAnalyzer>,
    ) -> Self {
        PatternAgent {
            support: AgentSupport::new(repo, registry),
            analyzer,
        }
    }

    /// Patterns whose prefix matches the tail of the live sequence.
    fn matching_patterns<'a>(
        sequence: &[String],
        patterns: &'a [PatternStat],
    ) -> Vec<&'a PatternStat> {
        patterns
            .iter()
            .filter(|stat| {
                let prefix_len = stat.pattern.len() - 1;
                if sequence.len() < prefix_len {
                    return false;
                }
                let tail = &sequence[sequence.len() - prefix_len..];
                tail == &stat.pattern[..prefix_len]
            })
            .collect()
    }

    /// Possible next states weighted by the confidence of the patterns
    /// that continue the live sequence.
    fn next_states(sequence: &[String], patterns: &[PatternStat]) -> HashMap<String, f64> {
        let mut next = HashMap::new();

        for stat in patterns {
            if sequence.len() >= stat.pattern.len() {
                continue;
            }
            let matches = sequence
                .iter()
                .zip(stat.pattern.iter())
                .all(|(a, b)| a == b);
            if !matches {
                continue;
            }
            let state = stat.pattern[sequence.len()].clone();
            let entry = next.entry(state).or_insert(0.0f64);
            *entry = entry.max(stat.confidence);
        }
        next
    }
}

#[async_trait]
impl TransitionAgent for PatternAgent {
    fn kind(&self) -> AgentKind {
        AgentKind::Pattern
    }

    async fn analyze_context(&self, process_id: &str) -> Result<Value> {
        let (process, _kanban, history) = self.support.load(process_id).await?;
        let kanban_id = process.kanban_id.clone();

        let sequence = ProcessTrail {
            process,
            entries: history,
        }
        .sequence();

        let patterns = self
            .analyzer
            .frequent_patterns(&kanban_id, SUGGESTION_MIN_SUPPORT)
            .await?;
        let matching: Vec<Value> = Self::matching_patterns(&sequence, &patterns)
            .iter()
            .map(|stat| {
                json!({
                    "pattern": stat.pattern,
                    "support": stat.support,
                    "confidence": stat.confidence,
                })
            })
            .collect();

        let similar: Vec<Value> = self
            .analyzer
            .similar_processes(process_id, &kanban_id, 3)
            .await?
            .into_iter()
            .map(|s| {
                json!({
                    "process_id": s.process_id,
                    "similarity": s.similarity,
                    "common_transitions": s.common_transitions,
                })
            })
            .collect();

        Ok(json!({
            "current_sequence": sequence.clone(),
            "matching_patterns": matching,
            "similar_processes": similar,
            "common_next_states": Self::next_states(&sequence, &patterns),
        }))
    }

    async fn suggest_transition(&self, process_id: &str) -> Result<Suggestion> {
        let (process, _kanban, history) = self.support.load(process_id).await?;
        let kanban_id = process.kanban_id.clone();

        let sequence = ProcessTrail {
            process,
            entries: history,
        }
        .sequence();

        let patterns = self
            .analyzer
            .frequent_patterns(&kanban_id, SUGGESTION_MIN_SUPPORT)
            .await?;
        let next_states = Self::next_states(&sequence, &patterns);

        if next_states.is_empty() {
            return Ok(Suggestion::new(
                None,
                0.3,
                "No historical patterns found for current sequence. Consider manual transition.",
            )
            .with_risks(vec!["No historical data to guide decision".to_string()]));
        }

        let (best_state, confidence) = next_states
            .into_iter()
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal))
            .unwrap();

        let matching = Self::matching_patterns(&sequence, &patterns);
        let top_support = matching.first().map(|s| s.support).unwrap_or(0.0);

        Ok(Suggestion::new(
            Some(best_state.clone()),
            confidence,
            format!(
                "Historical patterns suggest '{best_state}' as next state. Found {} matching pattern(s) with {}% support.",
                matching.len(),
                (top_support * 100.0) as u32
            ),
        ))
    }

    async fn validate_transition(
        &self,
        process_id: &str,
        target_state: &str,
    ) -> Result<Validation> {
        let context = self.analyze_context(process_id).await?;
        let next_states: HashMap<String, f64> =
            serde_json::from_value(context["common_next_states"].clone()).unwrap_or_default();

        let mut warnings = Vec::new();
        let mut risk_level = RiskLevel::Low;

        match next_states.get(target_state) {
            None => {
                warnings.push(format!(
                    "Target state '{target_state}' is not a common next state based on historical patterns"
                ));
                risk_level = RiskLevel::Medium;
            }
            Some(confidence) if *confidence < 0.3 => {
                warnings.push(format!(
                    "Target state '{target_state}' occurs in only {}% of similar cases",
                    (confidence * 100.0) as u32
                ));
                risk_level = RiskLevel::Medium;
            }
            Some(_) => {}
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
    use crate::models::audit::ActorType;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::repository::tests::sample_process;
    use crate::storage::repository::StateChange;

    async fn setup() -> (PatternAgent, Arc<ProcessRepository>) {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(sample_kanban(), false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        let analyzer = Arc::new(PatternAnalyzer::new(repo.clone()));
        (PatternAgent::new(repo.clone(), registry, analyzer), repo)
    }

    /// Walk several processes novo -> em_analise -> aprovado so the
    /// pattern corpus has a dominant path.
    async fn seed_corpus(repo: &Arc<ProcessRepository>) {
        for i in 0..5 {
            let pid = format!("hist{i}");
            repo.create_process(sample_process(&pid, "novo")).await.unwrap();
            for state in ["em_analise", "aprovado"] {
                repo.update_state(&pid, StateChange::new(state, ActorType::Manual, "ana"))
                    .await
                    .unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_suggests_dominant_continuation() {
        let (agent, repo) = setup().await;
        seed_corpus(&repo).await;

        repo.create_process(sample_process("live", "novo"))
            .await
            .unwrap();

        let suggestion = agent.suggest_transition("live").await.unwrap();
        assert_eq!(suggestion.suggested_state.as_deref(), Some("em_analise"));
        assert!(suggestion.confidence > 0.5);
        assert!(suggestion.justification.contains("em_analise"));
    }

    #[tokio::test]
    async fn test_no_patterns_yields_hesitant_none() {
        let (agent, repo) = setup().await;
        repo.create_process(sample_process("lonely", "novo"))
            .await
            .unwrap();

        let suggestion = agent.suggest_transition("lonely").await.unwrap();
        // A single-process corpus has no continuation beyond its own
        // sequence
        assert!(suggestion.suggested_state.is_none());
        assert!((suggestion.confidence - 0.3).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_validation_flags_uncommon_target() {
        let (agent, repo) = setup().await;
        seed_corpus(&repo).await;
        repo.create_process(sample_process("live", "novo"))
            .await
            .unwrap();

        let unusual = agent.validate_transition("live", "aprovado").await.unwrap();
        assert!(unusual.valid);
        assert_eq!(unusual.risk_level, RiskLevel::Medium);
        assert!(!unusual.warnings.is_empty());

        let usual = agent
            .validate_transition("live", "em_analise")
            .await
            .unwrap();
        assert!(usual.valid);
        assert!(usual.warnings.is_empty());
    }
}
