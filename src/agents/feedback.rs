// Agent feedback loop - outcome tracking and weight learning

//! # Feedback Loop
//!
//! Records every agent suggestion, matches it against what actually
//! happened, and slowly re-weights each agent's confidence. Outcomes span
//! the 2x2 of accepted-vs-rejected and successful-vs-failed, plus the
//! "rejected but matched" case where the user dismissed the suggestion yet
//! ended up in the suggested state anyway.
//!
//! Weights move multiplicatively and are clamped to `[0.3, 2.0]`; the
//! small step sizes are deliberate, fast-moving weights oscillate. A cold
//! start is always weight 1.0.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::agents::AgentKind;
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Weight bounds.
const MIN_WEIGHT: f64 = 0.3;
const MAX_WEIGHT: f64 = 2.0;

/// How one suggestion played out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionOutcome {
    AcceptedSuccessful,
    AcceptedFailed,
    /// Dismissed, but the process ended up in the suggested state
    RejectedButMatched,
    Rejected,
}

impl SuggestionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            SuggestionOutcome::AcceptedSuccessful => "accepted_successful",
            SuggestionOutcome::AcceptedFailed => "accepted_failed",
            SuggestionOutcome::RejectedButMatched => "rejected_but_matched",
            SuggestionOutcome::Rejected => "rejected",
        }
    }

    /// Weight delta applied when this outcome lands.
    fn weight_delta(&self) -> f64 {
        match self {
            SuggestionOutcome::AcceptedSuccessful => 0.05,
            SuggestionOutcome::AcceptedFailed => -0.10,
            SuggestionOutcome::RejectedButMatched => 0.02,
            SuggestionOutcome::Rejected => -0.02,
        }
    }
}

/// One recorded suggestion and, once known, its outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub suggestion_id: String,
    pub process_id: String,
    pub agent: AgentKind,
    pub suggested_state: String,
    pub confidence: f64,
    pub reasoning: String,
    pub metadata: Value,
    pub recorded_at: DateTime<Utc>,

    pub outcome: Option<SuggestionOutcome>,
    pub actual_state: Option<String>,
    pub was_accepted: Option<bool>,
    pub success: Option<bool>,
    pub outcome_notes: Option<String>,
    pub outcome_recorded_at: Option<DateTime<Utc>>,
}

/// Windowed performance of one agent.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatistics {
    pub agent: AgentKind,
    pub period_days: i64,
    pub total_suggestions: usize,
    pub acceptance_rate: f64,
    pub success_rate: f64,
    /// Fraction where suggested == actual
    pub accuracy: f64,
    pub current_weight: f64,
    pub outcome_breakdown: HashMap<String, usize>,
}

#[derive(Default)]
struct FeedbackState {
    history: Vec<FeedbackRecord>,
    weights: HashMap<AgentKind, f64>,
}

/// In-memory feedback store. May be persisted by embedders; must tolerate
/// cold starts either way.
pub struct FeedbackLoop {
    state: Mutex<FeedbackState>,
    repo: Arc<ProcessRepository>,
}

impl FeedbackLoop {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        FeedbackLoop {
            state: Mutex::new(FeedbackState::default()),
            repo,
        }
    }

    // ========== Recording ==========

    /// Record a fresh suggestion; returns its id.
    pub fn record_suggestion(
        &self,
        process_id: &str,
        agent: AgentKind,
        suggested_state: &str,
        confidence: f64,
        reasoning: &str,
        metadata: Value,
    ) -> String {
        let suggestion_id = uuid::Uuid::new_v4().to_string();

        let record = FeedbackRecord {
            suggestion_id: suggestion_id.clone(),
            process_id: process_id.to_string(),
            agent,
            suggested_state: suggested_state.to_string(),
            confidence,
            reasoning: reasoning.to_string(),
            metadata,
            recorded_at: Utc::now(),
            outcome: None,
            actual_state: None,
            was_accepted: None,
            success: None,
            outcome_notes: None,
            outcome_recorded_at: None,
        };

        self.state.lock().unwrap().history.push(record);
        debug!(suggestion_id = %suggestion_id, agent = agent.as_str(), process_id, "suggestion recorded");
        suggestion_id
    }

    /// Attach the real-world outcome to a recorded suggestion and adjust
    /// the agent's weight. Returns false for unknown ids.
    pub fn record_outcome(
        &self,
        suggestion_id: &str,
        was_accepted: bool,
        actual_state: &str,
        success: bool,
        notes: Option<&str>,
    ) -> bool {
        let mut guard = self.state.lock().unwrap();
        let state = &mut *guard;

        let Some(record) = state
            .history
            .iter_mut()
            .find(|r| r.suggestion_id == suggestion_id)
        else {
            warn!(suggestion_id, "outcome for unknown suggestion");
            return false;
        };

        let outcome = if was_accepted && success {
            SuggestionOutcome::AcceptedSuccessful
        } else if was_accepted {
            SuggestionOutcome::AcceptedFailed
        } else if record.suggested_state == actual_state {
            SuggestionOutcome::RejectedButMatched
        } else {
            SuggestionOutcome::Rejected
        };

        record.was_accepted = Some(was_accepted);
        record.actual_state = Some(actual_state.to_string());
        record.success = Some(success);
        record.outcome = Some(outcome);
        record.outcome_notes = notes.map(str::to_string);
        record.outcome_recorded_at = Some(Utc::now());
        let agent = record.agent;

        let weight = state.weights.entry(agent).or_insert(1.0);
        let previous = *weight;
        *weight = (*weight + outcome.weight_delta()).clamp(MIN_WEIGHT, MAX_WEIGHT);
        debug!(
            agent = agent.as_str(),
            outcome = outcome.as_str(),
            previous,
            current = *weight,
            "agent weight adjusted"
        );
        true
    }

    // ========== Weights ==========

    /// Current weight; cold start is 1.0.
    pub fn weight(&self, agent: AgentKind) -> f64 {
        self.state
            .lock()
            .unwrap()
            .weights
            .get(&agent)
            .copied()
            .unwrap_or(1.0)
    }

    /// Base confidence scaled by the learned weight, clamped to `[0, 1]`.
    pub fn weighted_confidence(&self, agent: AgentKind, base_confidence: f64) -> f64 {
        (base_confidence * self.weight(agent)).clamp(0.0, 1.0)
    }

    pub fn reset_weights(&self) {
        self.state.lock().unwrap().weights.clear();
        info!("agent weights reset");
    }

    // ========== Statistics ==========

    /// Performance of one agent over the trailing window.
    pub fn statistics(&self, agent: AgentKind, days: i64) -> AgentStatistics {
        let state = self.state.lock().unwrap();
        let cutoff = Utc::now() - Duration::days(days);

        let entries: Vec<&FeedbackRecord> = state
            .history
            .iter()
            .filter(|r| r.recorded_at >= cutoff && r.outcome.is_some() && r.agent == agent)
            .collect();

        let total = entries.len();
        let rate = |count: usize| {
            if total == 0 {
                0.0
            } else {
                count as f64 / total as f64
            }
        };

        let accepted = entries.iter().filter(|r| r.was_accepted == Some(true)).count();
        let successful = entries.iter().filter(|r| r.success == Some(true)).count();
        let correct = entries
            .iter()
            .filter(|r| r.actual_state.as_deref() == Some(r.suggested_state.as_str()))
            .count();

        let mut breakdown: HashMap<String, usize> = HashMap::new();
        for record in &entries {
            if let Some(outcome) = record.outcome {
                *breakdown.entry(outcome.as_str().to_string()).or_default() += 1;
            }
        }

        AgentStatistics {
            agent,
            period_days: days,
            total_suggestions: total,
            acceptance_rate: rate(accepted),
            success_rate: rate(successful),
            accuracy: rate(correct),
            current_weight: state.weights.get(&agent).copied().unwrap_or(1.0),
            outcome_breakdown: breakdown,
        }
    }

    pub fn all_statistics(&self, days: i64) -> Vec<AgentStatistics> {
        [AgentKind::Heuristic, AgentKind::Pattern, AgentKind::Rule]
            .into_iter()
            .map(|agent| self.statistics(agent, days))
            .collect()
    }

    /// The agent with the best accuracy over a kanban's recent
    /// suggestions; heuristic at 1.0 when no data exists.
    pub async fn best_agent_for(&self, kanban_id: &str, days: i64) -> Result<(AgentKind, f64)> {
        let cutoff = Utc::now() - Duration::days(days);
        let candidates: Vec<FeedbackRecord> = {
            let state = self.state.lock().unwrap();
            state
                .history
                .iter()
                .filter(|r| r.outcome.is_some() && r.recorded_at >= cutoff)
                .cloned()
                .collect()
        };

        let mut scores: HashMap<AgentKind, (usize, usize)> = HashMap::new();
        for record in candidates {
            let Some(process) = self.repo.get_by_id(&record.process_id).await? else {
                continue;
            };
            if process.kanban_id != kanban_id {
                continue;
            }

            let entry = scores.entry(record.agent).or_default();
            entry.1 += 1;
            if record.actual_state.as_deref() == Some(record.suggested_state.as_str()) {
                entry.0 += 1;
            }
        }

        let best = scores
            .into_iter()
            .filter(|(_, (_, total))| *total > 0)
            .map(|(agent, (correct, total))| (agent, correct as f64 / total as f64))
            .max_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.unwrap_or((AgentKind::Heuristic, 1.0)))
    }

    // ========== History maintenance ==========

    pub fn history(
        &self,
        process_id: Option<&str>,
        agent: Option<AgentKind>,
        limit: usize,
    ) -> Vec<FeedbackRecord> {
        let state = self.state.lock().unwrap();
        let mut records: Vec<FeedbackRecord> = state
            .history
            .iter()
            .filter(|r| process_id.map_or(true, |p| r.process_id == p))
            .filter(|r| agent.map_or(true, |a| r.agent == a))
            .cloned()
            .collect();
        records.sort_by(|a, b| b.recorded_at.cmp(&a.recorded_at));
        records.truncate(limit);
        records
    }

    pub fn export(&self) -> Vec<FeedbackRecord> {
        self.state.lock().unwrap().history.clone()
    }

    /// Drop records older than `days`.
    pub fn clear_old(&self, days: i64) -> usize {
        let cutoff = Utc::now() - Duration::days(days);
        let mut state = self.state.lock().unwrap();
        let before = state.history.len();
        state.history.retain(|r| r.recorded_at >= cutoff);
        let removed = before - state.history.len();
        info!(removed, kept_days = days, "old feedback cleared");
        removed
    }

    /// Accuracy trends and prose recommendations for the window.
    pub fn learning_insights(&self, days: i64) -> Value {
        let stats = self.all_statistics(days);

        let mut insights = Vec::new();
        let mut recommendations: Vec<String> = Vec::new();

        for stat in &stats {
            if stat.total_suggestions == 0 {
                continue;
            }

            let trend = if stat.current_weight > 1.0 {
                "improving"
            } else if stat.current_weight < 1.0 {
                "declining"
            } else {
                "stable"
            };
            insights.push(json!({
                "agent": stat.agent.as_str(),
                "accuracy": stat.accuracy,
                "weight": stat.current_weight,
                "total_suggestions": stat.total_suggestions,
                "trend": trend,
            }));

            if stat.accuracy < 0.5 && stat.total_suggestions > 10 {
                recommendations.push(format!(
                    "{} agent has low accuracy ({:.0}%) - consider reviewing configuration",
                    stat.agent.as_str(),
                    stat.accuracy * 100.0
                ));
            } else if stat.current_weight > 1.5 {
                recommendations.push(format!(
                    "{} agent is performing well ({:.0}%) - consider using it as default",
                    stat.agent.as_str(),
                    stat.accuracy * 100.0
                ));
            }
        }

        if insights.is_empty() {
            recommendations.push("Insufficient data for learning insights".to_string());
        }

        let best = stats
            .iter()
            .filter(|s| s.total_suggestions > 0)
            .max_by(|a, b| {
                a.accuracy
                    .partial_cmp(&b.accuracy)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .map(|s| s.agent.as_str());

        json!({
            "period_days": days,
            "insights": insights,
            "recommendations": recommendations,
            "best_agent": best,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::repository::tests::{repo, sample_process};

    fn feedback() -> FeedbackLoop {
        FeedbackLoop::new(Arc::new(repo()))
    }

    #[test]
    fn test_outcome_classification() {
        let fb = feedback();

        let cases = [
            (true, "em_analise", true, SuggestionOutcome::AcceptedSuccessful),
            (true, "em_analise", false, SuggestionOutcome::AcceptedFailed),
            (false, "em_analise", true, SuggestionOutcome::RejectedButMatched),
            (false, "aprovado", true, SuggestionOutcome::Rejected),
        ];

        for (accepted, actual, success, expected) in cases {
            let id = fb.record_suggestion(
                "p1",
                AgentKind::Rule,
                "em_analise",
                0.8,
                "test",
                Value::Null,
            );
            assert!(fb.record_outcome(&id, accepted, actual, success, None));
            let record = fb
                .export()
                .into_iter()
                .find(|r| r.suggestion_id == id)
                .unwrap();
            assert_eq!(record.outcome, Some(expected));
        }
    }

    #[test]
    fn test_weight_bounds_under_any_sequence() {
        let fb = feedback();

        // Push hard downward
        for _ in 0..50 {
            let id =
                fb.record_suggestion("p1", AgentKind::Pattern, "x", 0.5, "t", Value::Null);
            fb.record_outcome(&id, true, "x", false, None);
        }
        assert!((fb.weight(AgentKind::Pattern) - MIN_WEIGHT).abs() < 1e-9);

        // Push hard upward
        for _ in 0..100 {
            let id =
                fb.record_suggestion("p1", AgentKind::Pattern, "x", 0.5, "t", Value::Null);
            fb.record_outcome(&id, true, "x", true, None);
        }
        assert!((fb.weight(AgentKind::Pattern) - MAX_WEIGHT).abs() < 1e-9);

        // And the clamp held the whole way
        let weight = fb.weight(AgentKind::Pattern);
        assert!((MIN_WEIGHT..=MAX_WEIGHT).contains(&weight));
    }

    #[test]
    fn test_weighted_confidence_clamped() {
        let fb = feedback();
        // Cold start: weight 1.0
        assert!((fb.weighted_confidence(AgentKind::Rule, 0.8) - 0.8).abs() < 1e-9);

        for _ in 0..100 {
            let id = fb.record_suggestion("p1", AgentKind::Rule, "x", 0.5, "t", Value::Null);
            fb.record_outcome(&id, true, "x", true, None);
        }
        // Weight 2.0 would push 0.8 to 1.6; confidence stays in [0, 1]
        assert!((fb.weighted_confidence(AgentKind::Rule, 0.8) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_statistics_window() {
        let fb = feedback();
        for i in 0..4 {
            let id = fb.record_suggestion(
                "p1",
                AgentKind::Rule,
                "em_analise",
                0.8,
                "t",
                Value::Null,
            );
            // Three accepted hits, one miss
            if i < 3 {
                fb.record_outcome(&id, true, "em_analise", true, None);
            } else {
                fb.record_outcome(&id, false, "aprovado", true, None);
            }
        }

        let stats = fb.statistics(AgentKind::Rule, 30);
        assert_eq!(stats.total_suggestions, 4);
        assert!((stats.acceptance_rate - 0.75).abs() < 1e-9);
        assert!((stats.accuracy - 0.75).abs() < 1e-9);
        assert_eq!(stats.outcome_breakdown["accepted_successful"], 3);
        assert_eq!(stats.outcome_breakdown["rejected"], 1);
    }

    #[tokio::test]
    async fn test_best_agent_for_kanban() {
        let repo = Arc::new(repo());
        repo.create_process(sample_process("p1", "novo")).await.unwrap();
        let fb = FeedbackLoop::new(repo);

        // Rule agent: 2/2 correct; pattern agent: 0/1
        for _ in 0..2 {
            let id = fb.record_suggestion("p1", AgentKind::Rule, "em_analise", 0.9, "t", Value::Null);
            fb.record_outcome(&id, true, "em_analise", true, None);
        }
        let id = fb.record_suggestion("p1", AgentKind::Pattern, "aprovado", 0.6, "t", Value::Null);
        fb.record_outcome(&id, false, "em_analise", true, None);

        let (best, accuracy) = fb.best_agent_for("pedidos", 30).await.unwrap();
        assert_eq!(best, AgentKind::Rule);
        assert!((accuracy - 1.0).abs() < 1e-9);

        // Unknown kanban: cold-start default
        let (best, accuracy) = fb.best_agent_for("ghost", 30).await.unwrap();
        assert_eq!(best, AgentKind::Heuristic);
        assert!((accuracy - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_history_filter_and_clear() {
        let fb = feedback();
        for agent in [AgentKind::Rule, AgentKind::Pattern] {
            fb.record_suggestion("p1", agent, "x", 0.5, "t", Value::Null);
        }
        fb.record_suggestion("p2", AgentKind::Rule, "y", 0.5, "t", Value::Null);

        assert_eq!(fb.history(Some("p1"), None, 10).len(), 2);
        assert_eq!(fb.history(None, Some(AgentKind::Rule), 10).len(), 2);
        assert_eq!(fb.history(None, None, 1).len(), 1);

        assert_eq!(fb.clear_old(0), 3);
        assert!(fb.export().is_empty());
    }
}
