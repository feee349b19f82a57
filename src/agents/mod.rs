// Suggestion agents - the pluggable advisory layer

//! # Agents
//!
//! Three independent agents analyze a process and suggest its next
//! transition, each from a different angle:
//!
//! - [`heuristic::HeuristicAgent`]: field completeness and dwell-time
//!   heuristics; works on any kanban with zero history
//! - [`pattern::PatternAgent`]: what similar processes historically did
//! - [`rule::RuleAgent`]: which transitions have their prerequisites
//!   satisfied right now
//!
//! Agents only ever *advise*. A suggestion becomes a transition exclusively
//! through a manual confirmation that goes back through the transition
//! engine, and the [`feedback::FeedbackLoop`] learns from what the user
//! actually did. The [`orchestrator::AgentOrchestrator`] fans a process out
//! to all three and aggregates their answers into one ranked
//! recommendation.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::audit::AuditEntry;
use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::{FlowboardError, Result};

use std::sync::Arc;

pub mod feedback;
pub mod heuristic;
pub mod orchestrator;
pub mod pattern;
pub mod rule;

/// The three agent strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Heuristic,
    Pattern,
    Rule,
}

impl AgentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Heuristic => "heuristic",
            AgentKind::Pattern => "pattern",
            AgentKind::Rule => "rule",
        }
    }

    pub fn parse(s: &str) -> Option<AgentKind> {
        match s {
            "heuristic" => Some(AgentKind::Heuristic),
            "pattern" => Some(AgentKind::Pattern),
            "rule" => Some(AgentKind::Rule),
            _ => None,
        }
    }
}

/// Risk attached to a validation verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    Low,
    Medium,
    High,
}

impl RiskLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskLevel::Low => "low",
            RiskLevel::Medium => "medium",
            RiskLevel::High => "high",
        }
    }
}

/// One agent's advice for a process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Suggestion {
    /// The advised next state; `None` means "stay put"
    pub suggested_state: Option<String>,

    /// Clamped to `[0, 1]`
    pub confidence: f64,

    pub justification: String,

    #[serde(default)]
    pub risk_factors: Vec<String>,

    /// Estimated hours to complete the suggested transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration: Option<f64>,
}

impl Suggestion {
    pub fn new(
        suggested_state: Option<String>,
        confidence: f64,
        justification: impl Into<String>,
    ) -> Self {
        Suggestion {
            suggested_state,
            confidence: confidence.clamp(0.0, 1.0),
            justification: justification.into(),
            risk_factors: vec![],
            estimated_duration: None,
        }
    }

    pub fn with_risks(mut self, risks: Vec<String>) -> Self {
        self.risk_factors = risks;
        self
    }
}

/// One agent's verdict on a proposed transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Validation {
    pub valid: bool,

    #[serde(default)]
    pub warnings: Vec<String>,

    #[serde(default)]
    pub errors: Vec<String>,

    pub risk_level: RiskLevel,
}

impl Validation {
    pub fn ok() -> Self {
        Validation {
            valid: true,
            warnings: vec![],
            errors: vec![],
            risk_level: RiskLevel::Low,
        }
    }

    pub fn rejected(errors: Vec<String>) -> Self {
        Validation {
            valid: false,
            warnings: vec![],
            errors,
            risk_level: RiskLevel::High,
        }
    }
}

/// The contract every agent implements.
#[async_trait]
pub trait TransitionAgent: Send + Sync {
    fn kind(&self) -> AgentKind;

    /// Strategy-specific insight into the process, as free-form JSON.
    async fn analyze_context(&self, process_id: &str) -> Result<Value>;

    /// Advise the next transition.
    async fn suggest_transition(&self, process_id: &str) -> Result<Suggestion>;

    /// Judge a proposed transition. Follows warn-not-block: only an
    /// explicitly blocked or undefined target yields `valid = false`.
    async fn validate_transition(&self, process_id: &str, target_state: &str)
        -> Result<Validation>;
}

/// Shared loading and measurement helpers used by every agent.
pub(crate) struct AgentSupport {
    pub repo: Arc<ProcessRepository>,
    pub registry: Arc<KanbanRegistry>,
}

impl AgentSupport {
    pub fn new(repo: Arc<ProcessRepository>, registry: Arc<KanbanRegistry>) -> Self {
        AgentSupport { repo, registry }
    }

    /// Process, kanban and history in one call.
    pub async fn load(
        &self,
        process_id: &str,
    ) -> Result<(Process, KanbanDefinition, Vec<AuditEntry>)> {
        let process = self
            .repo
            .get_by_id(process_id)
            .await?
            .ok_or_else(|| FlowboardError::ProcessNotFound(process_id.to_string()))?;
        let kanban = self
            .registry
            .get(&process.kanban_id)
            .ok_or_else(|| FlowboardError::KanbanNotFound(process.kanban_id.clone()))?;
        let history = self.repo.history(process_id).await?;
        Ok((process, kanban, history))
    }

    /// Hours since the last state-bearing audit entry or creation.
    pub fn hours_in_state(process: &Process, history: &[AuditEntry]) -> f64 {
        let since = history
            .iter()
            .rev()
            .find(|e| e.is_state_bearing())
            .map(|e| e.timestamp)
            .unwrap_or(process.created_at);
        (chrono::Utc::now() - since).num_seconds().max(0) as f64 / 3600.0
    }

    /// Number of recorded transitions (normal or forced).
    pub fn transition_count(history: &[AuditEntry]) -> usize {
        history.iter().filter(|e| e.is_transition()).count()
    }
}
