// Agent orchestrator - fan-out, consensus, best suggestion

//! # Agent Orchestrator
//!
//! Coordinates the three agents over one process: fans an analysis out to
//! all of them, reweights each confidence through the feedback loop,
//! records the suggestions for later outcome matching, and reduces the
//! answers to a consensus plus a single best suggestion.
//!
//! Selection is deliberately conservative. With high agreement the voted
//! state wins, carried by its most confident proponent. Without it, the
//! single highest-confidence suggestion wins, scanned in the fixed
//! priority order rule, pattern, heuristic: prerequisite knowledge beats
//! history, history beats structural guessing.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};

use crate::agents::feedback::FeedbackLoop;
use crate::agents::heuristic::HeuristicAgent;
use crate::agents::pattern::PatternAgent;
use crate::agents::rule::RuleAgent;
use crate::agents::{AgentKind, RiskLevel, Suggestion, TransitionAgent, Validation};
use crate::analysis::patterns::PatternAnalyzer;
use crate::engine::prerequisites::PrerequisiteChecker;
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::{FlowboardError, Result};

/// Fixed tie-breaking order for best-suggestion selection.
const AGENT_PRIORITY: [AgentKind; 3] = [AgentKind::Rule, AgentKind::Pattern, AgentKind::Heuristic];

/// One agent's contribution to a multi-agent analysis.
#[derive(Debug, Clone)]
pub struct AgentReport {
    pub agent: AgentKind,
    pub context: Value,
    pub suggestion: Suggestion,
    /// Confidence before feedback reweighting
    pub base_confidence: Option<f64>,
    /// The agent's learned weight at analysis time
    pub weight: Option<f64>,
    /// Id of the recorded feedback suggestion, when one was stored
    pub feedback_id: Option<String>,
    /// Set instead of the fields above when the agent failed
    pub error: Option<String>,
}

/// Vote tally for one suggested state.
#[derive(Debug, Clone, Copy)]
pub struct StateVotes {
    pub count: usize,
    pub avg_confidence: f64,
}

/// How strongly the agents agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgreementLevel {
    /// At least 80% of responding agents voted the same state
    High,
    /// At least half
    Medium,
    Low,
    /// Nobody suggested a state
    None,
}

impl AgreementLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgreementLevel::High => "high",
            AgreementLevel::Medium => "medium",
            AgreementLevel::Low => "low",
            AgreementLevel::None => "none",
        }
    }
}

/// The aggregated vote.
#[derive(Debug, Clone)]
pub struct Consensus {
    pub suggested_states: HashMap<String, StateVotes>,
    pub consensus_state: Option<String>,
    pub agreement_level: AgreementLevel,
}

/// The final pick out of all agent answers.
#[derive(Debug, Clone)]
pub struct BestSuggestion {
    pub agent: Option<AgentKind>,
    pub suggestion: Suggestion,
    pub selection_reason: &'static str,
}

/// Everything [`AgentOrchestrator::analyze_all`] produces.
#[derive(Debug, Clone)]
pub struct MultiAgentAnalysis {
    pub process_id: String,
    pub reports: Vec<AgentReport>,
    pub consensus: Consensus,
    pub best: BestSuggestion,
}

/// Aggregated validation across all agents.
#[derive(Debug, Clone)]
pub struct ValidationSummary {
    pub process_id: String,
    pub target_state: String,
    pub validations: Vec<(AgentKind, std::result::Result<Validation, String>)>,
    pub overall_valid: bool,
    pub max_risk_level: RiskLevel,
    pub all_warnings: Vec<String>,
}

/// Coordinator over the agent trio.
pub struct AgentOrchestrator {
    repo: Arc<ProcessRepository>,
    registry: Arc<KanbanRegistry>,
    agents: Vec<Arc<dyn TransitionAgent>>,
    feedback: Option<Arc<FeedbackLoop>>,
}

impl AgentOrchestrator {
    /// Standard trio: heuristic, pattern and rule agents over shared
    /// infrastructure.
    pub fn new(
        repo: Arc<ProcessRepository>,
        registry: Arc<KanbanRegistry>,
        analyzer: Arc<PatternAnalyzer>,
        checker: Arc<PrerequisiteChecker>,
    ) -> Self {
        let agents: Vec<Arc<dyn TransitionAgent>> = vec![
            Arc::new(HeuristicAgent::new(repo.clone(), registry.clone())),
            Arc::new(PatternAgent::new(repo.clone(), registry.clone(), analyzer)),
            Arc::new(RuleAgent::new(repo.clone(), registry.clone(), checker)),
        ];
        AgentOrchestrator {
            repo,
            registry,
            agents,
            feedback: None,
        }
    }

    /// Custom agent set (tests, embedders with extra agents).
    pub fn from_agents(
        repo: Arc<ProcessRepository>,
        registry: Arc<KanbanRegistry>,
        agents: Vec<Arc<dyn TransitionAgent>>,
    ) -> Self {
        AgentOrchestrator {
            repo,
            registry,
            agents,
            feedback: None,
        }
    }

    /// Enable feedback learning: confidences get reweighted and every
    /// suggestion is recorded for outcome matching.
    pub fn with_feedback(mut self, feedback: Arc<FeedbackLoop>) -> Self {
        self.feedback = Some(feedback);
        self
    }

    pub fn agent(&self, kind: AgentKind) -> Option<Arc<dyn TransitionAgent>> {
        self.agents.iter().find(|a| a.kind() == kind).cloned()
    }

    // ========== Selection ==========

    /// Pick the most suitable single agent for a process: rule when
    /// prerequisites are configured on an outgoing transition, pattern
    /// when the process already has meaningful history, heuristic
    /// otherwise.
    pub async fn auto_select(&self, process_id: &str) -> Result<AgentKind> {
        let Some(process) = self.repo.get_by_id(process_id).await? else {
            return Ok(AgentKind::Heuristic);
        };

        let has_prerequisites = self
            .registry
            .available_from(&process.kanban_id, &process.current_state)
            .iter()
            .any(|rule| !rule.prerequisites.is_empty());
        if has_prerequisites {
            return Ok(AgentKind::Rule);
        }

        let transitions = self
            .repo
            .history(process_id)
            .await?
            .iter()
            .filter(|e| e.is_transition())
            .count();
        if transitions >= 3 {
            return Ok(AgentKind::Pattern);
        }

        Ok(AgentKind::Heuristic)
    }

    /// Analyze with one agent (`kind`), or with the auto-selected one.
    pub async fn analyze_with(
        &self,
        process_id: &str,
        kind: Option<AgentKind>,
    ) -> Result<AgentReport> {
        let kind = match kind {
            Some(kind) => kind,
            None => self.auto_select(process_id).await?,
        };
        let agent = self
            .agent(kind)
            .ok_or_else(|| FlowboardError::InvalidInput(format!("no '{}' agent", kind.as_str())))?;
        Ok(self.run_agent(&agent, process_id).await)
    }

    /// Fan out to every agent and aggregate.
    pub async fn analyze_all(&self, process_id: &str) -> Result<MultiAgentAnalysis> {
        let mut reports = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            reports.push(self.run_agent(agent, process_id).await);
        }

        let consensus = calculate_consensus(&reports);
        let best = select_best(&reports, &consensus);
        debug!(
            process_id,
            consensus = consensus.agreement_level.as_str(),
            best_agent = best.agent.map(|a| a.as_str()).unwrap_or("-"),
            "multi-agent analysis complete"
        );

        Ok(MultiAgentAnalysis {
            process_id: process_id.to_string(),
            reports,
            consensus,
            best,
        })
    }

    async fn run_agent(&self, agent: &Arc<dyn TransitionAgent>, process_id: &str) -> AgentReport {
        let kind = agent.kind();

        let context = match agent.analyze_context(process_id).await {
            Ok(context) => context,
            Err(err) => return error_report(kind, err),
        };
        let mut suggestion = match agent.suggest_transition(process_id).await {
            Ok(suggestion) => suggestion,
            Err(err) => return error_report(kind, err),
        };

        let mut base_confidence = None;
        let mut weight = None;
        let mut feedback_id = None;

        if let Some(feedback) = &self.feedback {
            base_confidence = Some(suggestion.confidence);
            weight = Some(feedback.weight(kind));
            suggestion.confidence = feedback.weighted_confidence(kind, suggestion.confidence);

            if let Some(state) = &suggestion.suggested_state {
                feedback_id = Some(feedback.record_suggestion(
                    process_id,
                    kind,
                    state,
                    suggestion.confidence,
                    &suggestion.justification,
                    context.clone(),
                ));
            }
        }

        AgentReport {
            agent: kind,
            context,
            suggestion,
            base_confidence,
            weight,
            feedback_id,
            error: None,
        }
    }

    // ========== Validation ==========

    /// Validate a proposed transition with every agent and aggregate the
    /// verdicts.
    pub async fn validate_all(
        &self,
        process_id: &str,
        target_state: &str,
    ) -> Result<ValidationSummary> {
        let mut validations = Vec::with_capacity(self.agents.len());
        for agent in &self.agents {
            let verdict = agent
                .validate_transition(process_id, target_state)
                .await
                .map_err(|e| e.to_string());
            validations.push((agent.kind(), verdict));
        }

        let overall_valid = validations
            .iter()
            .filter_map(|(_, v)| v.as_ref().ok())
            .all(|v| v.valid);

        let max_risk_level = validations
            .iter()
            .filter_map(|(_, v)| v.as_ref().ok())
            .map(|v| v.risk_level)
            .max()
            .unwrap_or(RiskLevel::Low);

        let mut all_warnings: Vec<String> = validations
            .iter()
            .filter_map(|(_, v)| v.as_ref().ok())
            .flat_map(|v| v.warnings.iter().cloned())
            .collect();
        all_warnings.sort();
        all_warnings.dedup();

        Ok(ValidationSummary {
            process_id: process_id.to_string(),
            target_state: target_state.to_string(),
            validations,
            overall_valid,
            max_risk_level,
            all_warnings,
        })
    }

    // ========== Feedback wiring ==========

    /// After a confirmed transition, close the loop: every recorded
    /// suggestion from `analysis` gets its outcome.
    pub fn record_transition_feedback(
        &self,
        analysis: &MultiAgentAnalysis,
        to_state: &str,
        success: bool,
    ) -> bool {
        let Some(feedback) = &self.feedback else {
            return false;
        };

        for report in &analysis.reports {
            let Some(feedback_id) = &report.feedback_id else {
                continue;
            };
            let was_accepted = report.suggestion.suggested_state.as_deref() == Some(to_state);
            if !feedback.record_outcome(
                feedback_id,
                was_accepted,
                to_state,
                success,
                Some(&format!("transition to {to_state}")),
            ) {
                warn!(feedback_id = %feedback_id, "could not record outcome");
            }
        }
        true
    }

    /// Windowed performance statistics, when feedback is enabled.
    pub fn performance_stats(&self, days: i64) -> Option<Vec<crate::agents::feedback::AgentStatistics>> {
        self.feedback.as_ref().map(|f| f.all_statistics(days))
    }

    /// Learning insights, when feedback is enabled.
    pub fn learning_insights(&self, days: i64) -> Option<Value> {
        self.feedback.as_ref().map(|f| f.learning_insights(days))
    }
}

fn error_report(kind: AgentKind, err: FlowboardError) -> AgentReport {
    AgentReport {
        agent: kind,
        context: Value::Null,
        suggestion: Suggestion::new(None, 0.0, "agent failed"),
        base_confidence: None,
        weight: None,
        feedback_id: None,
        error: Some(err.to_string()),
    }
}

/// Tally votes per suggested state and derive the agreement level.
fn calculate_consensus(reports: &[AgentReport]) -> Consensus {
    let mut tallies: HashMap<String, Vec<f64>> = HashMap::new();
    let mut responding = 0usize;

    for report in reports {
        if report.error.is_some() {
            continue;
        }
        responding += 1;
        if let Some(state) = &report.suggestion.suggested_state {
            tallies
                .entry(state.clone())
                .or_default()
                .push(report.suggestion.confidence);
        }
    }

    let suggested_states: HashMap<String, StateVotes> = tallies
        .iter()
        .map(|(state, confidences)| {
            (
                state.clone(),
                StateVotes {
                    count: confidences.len(),
                    avg_confidence: confidences.iter().sum::<f64>() / confidences.len() as f64,
                },
            )
        })
        .collect();

    let consensus_state = suggested_states
        .iter()
        .max_by_key(|(_, votes)| votes.count)
        .map(|(state, _)| state.clone());

    let agreement_level = match (&consensus_state, responding) {
        (None, _) | (_, 0) => AgreementLevel::None,
        (Some(state), _) => {
            let ratio = suggested_states[state].count as f64 / responding as f64;
            if ratio >= 0.8 {
                AgreementLevel::High
            } else if ratio >= 0.5 {
                AgreementLevel::Medium
            } else {
                AgreementLevel::Low
            }
        }
    };

    Consensus {
        suggested_states,
        consensus_state,
        agreement_level,
    }
}

/// Pick the winning suggestion.
fn select_best(reports: &[AgentReport], consensus: &Consensus) -> BestSuggestion {
    let by_kind = |kind: AgentKind| reports.iter().find(|r| r.agent == kind && r.error.is_none());

    // High agreement: the voted state, carried by its most confident
    // proponent (priority order breaks confidence ties)
    if consensus.agreement_level == AgreementLevel::High {
        if let Some(state) = &consensus.consensus_state {
            let mut best: Option<&AgentReport> = None;
            for kind in AGENT_PRIORITY {
                let Some(report) = by_kind(kind) else { continue };
                if report.suggestion.suggested_state.as_deref() != Some(state) {
                    continue;
                }
                if best.map_or(true, |b| {
                    report.suggestion.confidence > b.suggestion.confidence
                }) {
                    best = Some(report);
                }
            }
            if let Some(report) = best {
                return BestSuggestion {
                    agent: Some(report.agent),
                    suggestion: report.suggestion.clone(),
                    selection_reason: "high_consensus",
                };
            }
        }
    }

    // Otherwise the highest confidence wins, scanned in priority order
    let mut best: Option<&AgentReport> = None;
    for kind in AGENT_PRIORITY {
        let Some(report) = by_kind(kind) else { continue };
        if best.map_or(true, |b| {
            report.suggestion.confidence > b.suggestion.confidence
        }) {
            best = Some(report);
        }
    }

    match best {
        Some(report) => BestSuggestion {
            agent: Some(report.agent),
            suggestion: report.suggestion.clone(),
            selection_reason: "highest_confidence",
        },
        None => BestSuggestion {
            agent: None,
            suggestion: Suggestion::new(None, 0.0, "No agents provided valid suggestions"),
            selection_reason: "no_suggestions",
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::kanban::tests::sample_kanban;
    use crate::storage::memory::MemoryDriver;
    use crate::storage::repository::tests::sample_process;
    use async_trait::async_trait;
    use serde_json::json;

    /// Test double with a fixed suggestion.
    struct FixedAgent {
        kind: AgentKind,
        suggestion: Suggestion,
    }

    #[async_trait]
    impl TransitionAgent for FixedAgent {
        fn kind(&self) -> AgentKind {
            self.kind
        }

        async fn analyze_context(&self, _process_id: &str) -> Result<Value> {
            Ok(json!({}))
        }

        async fn suggest_transition(&self, _process_id: &str) -> Result<Suggestion> {
            Ok(self.suggestion.clone())
        }

        async fn validate_transition(&self, _pid: &str, _target: &str) -> Result<Validation> {
            Ok(Validation::ok())
        }
    }

    fn fixed(kind: AgentKind, state: Option<&str>, confidence: f64) -> Arc<dyn TransitionAgent> {
        Arc::new(FixedAgent {
            kind,
            suggestion: Suggestion::new(state.map(str::to_string), confidence, "fixed"),
        })
    }

    fn infra() -> (Arc<ProcessRepository>, Arc<KanbanRegistry>) {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(sample_kanban(), false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        (repo, registry)
    }

    #[tokio::test]
    async fn test_high_consensus_prefers_rule_agent() {
        let (repo, registry) = infra();
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        // All three vote em_analise; rule is the most confident
        let orchestrator = AgentOrchestrator::from_agents(
            repo,
            registry,
            vec![
                fixed(AgentKind::Heuristic, Some("em_analise"), 0.8),
                fixed(AgentKind::Pattern, Some("em_analise"), 0.85),
                fixed(AgentKind::Rule, Some("em_analise"), 0.9),
            ],
        );

        let analysis = orchestrator.analyze_all("p1").await.unwrap();
        assert_eq!(analysis.consensus.agreement_level, AgreementLevel::High);
        assert_eq!(
            analysis.consensus.consensus_state.as_deref(),
            Some("em_analise")
        );

        let votes = &analysis.consensus.suggested_states["em_analise"];
        assert_eq!(votes.count, 3);
        assert!((votes.avg_confidence - 0.85).abs() < 1e-9);

        assert_eq!(analysis.best.agent, Some(AgentKind::Rule));
        assert_eq!(
            analysis.best.suggestion.suggested_state.as_deref(),
            Some("em_analise")
        );
        assert_eq!(analysis.best.selection_reason, "high_consensus");
    }

    #[tokio::test]
    async fn test_split_vote_takes_highest_confidence() {
        let (repo, registry) = infra();
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        let orchestrator = AgentOrchestrator::from_agents(
            repo,
            registry,
            vec![
                fixed(AgentKind::Heuristic, Some("em_analise"), 0.95),
                fixed(AgentKind::Pattern, Some("aprovado"), 0.6),
                fixed(AgentKind::Rule, None, 0.3),
            ],
        );

        let analysis = orchestrator.analyze_all("p1").await.unwrap();
        assert_ne!(analysis.consensus.agreement_level, AgreementLevel::High);
        assert_eq!(analysis.best.agent, Some(AgentKind::Heuristic));
        assert_eq!(analysis.best.selection_reason, "highest_confidence");
    }

    #[tokio::test]
    async fn test_feedback_reweights_and_records() {
        let (repo, registry) = infra();
        repo.create_process(sample_process("p1", "novo")).await.unwrap();
        let feedback = Arc::new(FeedbackLoop::new(repo.clone()));

        let orchestrator = AgentOrchestrator::from_agents(
            repo,
            registry,
            vec![
                fixed(AgentKind::Rule, Some("em_analise"), 0.8),
                fixed(AgentKind::Pattern, Some("aprovado"), 0.5),
            ],
        )
        .with_feedback(feedback.clone());

        let analysis = orchestrator.analyze_all("p1").await.unwrap();
        for report in &analysis.reports {
            assert!(report.feedback_id.is_some());
            assert_eq!(report.weight, Some(1.0));
            assert_eq!(report.base_confidence, Some(report.suggestion.confidence));
        }

        // User confirms em_analise
        assert!(orchestrator.record_transition_feedback(&analysis, "em_analise", true));

        let rule_stats = feedback.statistics(AgentKind::Rule, 30);
        assert_eq!(rule_stats.total_suggestions, 1);
        assert!((rule_stats.accuracy - 1.0).abs() < 1e-9);
        assert!(feedback.weight(AgentKind::Rule) > 1.0);
        assert!(feedback.weight(AgentKind::Pattern) < 1.0);
    }

    #[tokio::test]
    async fn test_auto_select_logic() {
        let (repo, registry) = infra();

        // Prerequisites on an outgoing transition select the rule agent
        let mut with_prereq = sample_kanban();
        with_prereq.recommended_transitions[0].prerequisites =
            vec![serde_json::from_value(json!({
                "type": "field_check",
                "field": "valor",
                "condition": "not_empty"
            }))
            .unwrap()];
        registry.register(with_prereq, false).unwrap();

        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        let orchestrator = AgentOrchestrator::from_agents(
            repo.clone(),
            registry.clone(),
            vec![
                fixed(AgentKind::Heuristic, None, 0.0),
                fixed(AgentKind::Pattern, None, 0.0),
                fixed(AgentKind::Rule, None, 0.0),
            ],
        );
        assert_eq!(
            orchestrator.auto_select("p1").await.unwrap(),
            AgentKind::Rule
        );

        // Without prerequisites and without history: heuristic
        registry.register(sample_kanban(), false).unwrap();
        assert_eq!(
            orchestrator.auto_select("p1").await.unwrap(),
            AgentKind::Heuristic
        );

        // Deep history promotes the pattern agent
        use crate::models::audit::ActorType;
        use crate::storage::repository::StateChange;
        for state in ["em_analise", "novo", "em_analise"] {
            repo.update_state("p1", StateChange::new(state, ActorType::Manual, "ana"))
                .await
                .unwrap();
        }
        assert_eq!(
            orchestrator.auto_select("p1").await.unwrap(),
            AgentKind::Pattern
        );
    }

    #[tokio::test]
    async fn test_validation_aggregate() {
        let (repo, registry) = infra();
        repo.create_process(sample_process("p1", "novo")).await.unwrap();

        struct WarnAgent;
        #[async_trait]
        impl TransitionAgent for WarnAgent {
            fn kind(&self) -> AgentKind {
                AgentKind::Pattern
            }
            async fn analyze_context(&self, _p: &str) -> Result<Value> {
                Ok(json!({}))
            }
            async fn suggest_transition(&self, _p: &str) -> Result<Suggestion> {
                Ok(Suggestion::new(None, 0.0, "-"))
            }
            async fn validate_transition(&self, _p: &str, _t: &str) -> Result<Validation> {
                Ok(Validation {
                    valid: true,
                    warnings: vec!["unusual path".to_string(), "unusual path".to_string()],
                    errors: vec![],
                    risk_level: RiskLevel::High,
                })
            }
        }

        let orchestrator = AgentOrchestrator::from_agents(
            repo,
            registry,
            vec![fixed(AgentKind::Rule, None, 0.0), Arc::new(WarnAgent)],
        );

        let summary = orchestrator.validate_all("p1", "em_analise").await.unwrap();
        assert!(summary.overall_valid);
        assert_eq!(summary.max_risk_level, RiskLevel::High);
        // Warnings deduplicated
        assert_eq!(summary.all_warnings, vec!["unusual path"]);
    }

    #[tokio::test]
    async fn test_all_agents_failing_yields_no_suggestion() {
        let (repo, registry) = infra();
        // No process exists: every real agent will fail
        let analyzer = Arc::new(PatternAnalyzer::new(repo.clone()));
        let checker = Arc::new(PrerequisiteChecker::new(
            tempfile::tempdir().unwrap().path(),
            repo.clone(),
        ));
        let orchestrator = AgentOrchestrator::new(repo, registry, analyzer, checker);

        let analysis = orchestrator.analyze_all("ghost").await.unwrap();
        assert!(analysis.reports.iter().all(|r| r.error.is_some()));
        assert_eq!(analysis.consensus.agreement_level, AgreementLevel::None);
        assert_eq!(analysis.best.selection_reason, "no_suggestions");
        assert!(analysis.best.agent.is_none());
    }
}
