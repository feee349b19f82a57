// Transition engine - the single decision gate for state changes

//! # Transition Engine
//!
//! Every state change, user-initiated, automatic or forced, funnels
//! through this engine. A requested transition is classified against the
//! kanban's transition sets:
//!
//! | Classification | Behaviour |
//! |---|---|
//! | blocked | rejected with the configured reason |
//! | warned  | allowed; warning attached; justification enforced if demanded |
//! | otherwise | allowed |
//!
//! That is the **warn-not-block** contract: anything not explicitly
//! blocked executes. Prerequisites of the recommended transition are
//! evaluated before execution, but their failure only produces warnings
//! and an `prerequisites_met = false` mark on the audit entry.
//!
//! Automatic progression has two rules, checked in order: a **timeout**
//! rule (the state declares `timeout_hours` and an auto target, and the
//! process has dwelled at least that long) and an **auto** rule (the state
//! declares an auto target whose recommended-transition prerequisites are
//! all satisfied). Cascades chain these rules to a bounded depth, writing
//! one `system` audit entry per hop.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::engine::prerequisites::PrerequisiteChecker;
use crate::models::audit::ActorType;
use crate::models::kanban::KanbanDefinition;
use crate::models::process::Process;
use crate::registry::KanbanRegistry;
use crate::storage::repository::{ProcessRepository, StateChange};
use crate::{FlowboardError, Result};

/// User recorded on cascade-driven audit entries.
pub const AUTO_TRANSITION_USER: &str = "auto_transition_engine";

/// Default bound on cascade length.
pub const DEFAULT_MAX_CASCADE_DEPTH: usize = 10;

/// How a requested transition is classified.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionClass {
    Permitted,
    Warned {
        message: String,
        require_justification: bool,
    },
    Blocked {
        reason: String,
    },
}

/// Why an automatic transition fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoReason {
    Timeout,
    AutoTransition,
}

impl AutoReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            AutoReason::Timeout => "timeout",
            AutoReason::AutoTransition => "auto_transition",
        }
    }
}

/// An applicable automatic transition found by the auto-check.
#[derive(Debug, Clone)]
pub struct AutoTransition {
    pub to_state: String,
    pub reason: AutoReason,
}

/// Result of one executed transition.
#[derive(Debug, Clone)]
pub struct TransitionOutcome {
    pub process_id: String,
    pub from_state: String,
    pub to_state: String,

    /// Unmet prerequisites and warned-transition notices. Never blocking.
    pub warnings: Vec<String>,

    /// Whether every prerequisite of the recommended transition held
    pub prerequisites_met: bool,

    /// Unusual, not illegal: set when prerequisites were configured and
    /// at least one was unmet
    pub was_anomaly: bool,

    pub forced: bool,
    pub executed_at: DateTime<Utc>,
}

/// One hop of a cascade.
#[derive(Debug, Clone)]
pub struct CascadeStep {
    pub from_state: String,
    pub to_state: String,
    pub reason: AutoReason,
    pub success: bool,
}

/// Result of a batch sweep over candidate processes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub processes_checked: usize,
    pub transitions_executed: usize,
    pub cascades_executed: usize,
    pub errors: usize,
}

/// A process with an applicable auto-transition, for diagnostics.
#[derive(Debug, Clone)]
pub struct PendingAuto {
    pub process_id: String,
    pub current_state: String,
    pub to_state: String,
    pub reason: AutoReason,
}

/// The engine itself. Cheap to construct; all state lives in the
/// registry and the repository.
pub struct TransitionEngine {
    registry: Arc<KanbanRegistry>,
    checker: Arc<PrerequisiteChecker>,
    repo: Arc<ProcessRepository>,
    max_cascade_depth: usize,
}

impl TransitionEngine {
    pub fn new(
        registry: Arc<KanbanRegistry>,
        checker: Arc<PrerequisiteChecker>,
        repo: Arc<ProcessRepository>,
    ) -> Self {
        TransitionEngine {
            registry,
            checker,
            repo,
            max_cascade_depth: DEFAULT_MAX_CASCADE_DEPTH,
        }
    }

    pub fn with_max_cascade_depth(mut self, depth: usize) -> Self {
        self.max_cascade_depth = depth;
        self
    }

    /// Classify a requested transition against the kanban's sets.
    pub fn classify(&self, kanban: &KanbanDefinition, from: &str, to: &str) -> TransitionClass {
        if let Some(blocked) = kanban.blocked(from, to) {
            return TransitionClass::Blocked {
                reason: blocked.reason.clone(),
            };
        }
        if let Some(warned) = kanban.warned(from, to) {
            return TransitionClass::Warned {
                message: warned.message.clone(),
                require_justification: warned.require_justification,
            };
        }
        TransitionClass::Permitted
    }

    /// Execute a transition on behalf of `actor`/`user`.
    pub async fn execute(
        &self,
        process_id: &str,
        to_state: &str,
        actor: ActorType,
        user: &str,
        justification: Option<&str>,
    ) -> Result<TransitionOutcome> {
        self.execute_inner(process_id, to_state, actor, user, justification, false)
            .await
    }

    /// Execute a transition despite unmet prerequisites. A justification
    /// is mandatory; warnings are surfaced but never block. Blocked
    /// transitions still reject: forcing bypasses prerequisites, not the
    /// blocked list.
    pub async fn force(
        &self,
        process_id: &str,
        to_state: &str,
        user: &str,
        justification: &str,
    ) -> Result<TransitionOutcome> {
        if justification.trim().is_empty() {
            return Err(FlowboardError::InvalidInput(
                "forced transitions require a justification".to_string(),
            ));
        }
        self.execute_inner(
            process_id,
            to_state,
            ActorType::Manual,
            user,
            Some(justification),
            true,
        )
        .await
    }

    async fn execute_inner(
        &self,
        process_id: &str,
        to_state: &str,
        actor: ActorType,
        user: &str,
        justification: Option<&str>,
        forced: bool,
    ) -> Result<TransitionOutcome> {
        let process = self
            .repo
            .get_by_id(process_id)
            .await?
            .ok_or_else(|| FlowboardError::ProcessNotFound(process_id.to_string()))?;
        let kanban = self
            .registry
            .get(&process.kanban_id)
            .ok_or_else(|| FlowboardError::KanbanNotFound(process.kanban_id.clone()))?;

        if !kanban.has_state(to_state) {
            return Err(FlowboardError::InvalidInput(format!(
                "state '{to_state}' does not exist in kanban '{}'",
                kanban.id
            )));
        }

        let from_state = process.current_state.clone();
        let mut warnings = Vec::new();

        match self.classify(&kanban, &from_state, to_state) {
            TransitionClass::Blocked { reason } => {
                return Err(FlowboardError::TransitionBlocked(reason));
            }
            TransitionClass::Warned {
                message,
                require_justification,
            } => {
                if require_justification && justification.map_or(true, |j| j.trim().is_empty()) {
                    return Err(FlowboardError::JustificationRequired {
                        from: from_state,
                        to: to_state.to_string(),
                    });
                }
                warnings.push(message);
            }
            TransitionClass::Permitted => {}
        }

        // Prerequisites of the recommended transition, if one covers this
        // path. Unmet prerequisites warn; they never reject.
        let mut had_prerequisites = false;
        let mut prerequisites_met = true;
        if let Some(rule) = kanban.recommended(&from_state, to_state) {
            if !rule.prerequisites.is_empty() {
                had_prerequisites = true;
                let results = self
                    .checker
                    .check_prerequisites(&rule.prerequisites, &process, &kanban)
                    .await;
                prerequisites_met = self.checker.all_satisfied(&results);
                for unmet in self.checker.unsatisfied(&results) {
                    warnings.push(unmet.message.clone());
                }
            }
        }
        let was_anomaly = had_prerequisites && !prerequisites_met;

        let duration_hours = self.hours_in_current_state(&process).await?;

        let mut change = StateChange::new(to_state, actor, user)
            .with_justification(justification.map(str::to_string))
            .with_duration(Some(duration_hours))
            .with_prerequisites_met(Some(prerequisites_met));
        if forced {
            // Keep the caller's justification; the forced marker travels
            // in the action and metadata.
            change = change.forced(justification.unwrap_or_default());
        }
        if was_anomaly {
            change = change.with_metadata("was_anomaly", Value::Bool(true));
        }

        let updated = self.repo.update_state(process_id, change).await?;

        info!(
            process_id,
            from = %from_state,
            to = %to_state,
            actor = actor.as_str(),
            forced,
            prerequisites_met,
            "transition executed"
        );

        Ok(TransitionOutcome {
            process_id: process_id.to_string(),
            from_state,
            to_state: to_state.to_string(),
            warnings,
            prerequisites_met,
            was_anomaly,
            forced,
            executed_at: updated.updated_at,
        })
    }

    // ========== Automatic progression ==========

    /// The first applicable automatic transition for a process: timeout
    /// rule first, then the prerequisite-gated auto rule.
    pub async fn check_auto(&self, process: &Process) -> Result<Option<AutoTransition>> {
        let Some(kanban) = self.registry.get(&process.kanban_id) else {
            return Ok(None);
        };
        let Some(state) = kanban.state(&process.current_state) else {
            return Ok(None);
        };
        let Some(target) = state.auto_transition_to.clone() else {
            return Ok(None);
        };

        // Timeout rule
        if let Some(timeout_hours) = state.timeout_hours {
            let elapsed = self.hours_in_current_state(process).await?;
            if elapsed >= timeout_hours {
                return Ok(Some(AutoTransition {
                    to_state: target,
                    reason: AutoReason::Timeout,
                }));
            }
        }

        // Auto rule: requires a recommended transition whose prerequisites
        // all hold
        if let Some(rule) = kanban.recommended(&process.current_state, &target) {
            let results = self
                .checker
                .check_prerequisites(&rule.prerequisites, process, &kanban)
                .await;
            if self.checker.all_satisfied(&results) {
                return Ok(Some(AutoTransition {
                    to_state: target,
                    reason: AutoReason::AutoTransition,
                }));
            }
        }

        Ok(None)
    }

    /// Chain automatic transitions until nothing fires, a hop fails, or
    /// the depth bound is reached. One `system` audit entry per hop.
    pub async fn cascade(&self, process_id: &str) -> Result<Vec<CascadeStep>> {
        let mut steps = Vec::new();

        for _ in 0..self.max_cascade_depth {
            let Some(process) = self.repo.get_by_id(process_id).await? else {
                break;
            };
            let Some(auto) = self.check_auto(&process).await? else {
                break;
            };

            let from_state = process.current_state.clone();
            let justification = format!("Auto-transition: {}", auto.reason.as_str());
            let result = self
                .execute_inner(
                    process_id,
                    &auto.to_state,
                    ActorType::System,
                    AUTO_TRANSITION_USER,
                    Some(&justification),
                    false,
                )
                .await;

            match result {
                Ok(_) => {
                    debug!(process_id, from = %from_state, to = %auto.to_state, "cascade hop");
                    steps.push(CascadeStep {
                        from_state,
                        to_state: auto.to_state,
                        reason: auto.reason,
                        success: true,
                    });
                }
                Err(err) => {
                    warn!(process_id, error = %err, "cascade hop failed");
                    steps.push(CascadeStep {
                        from_state,
                        to_state: auto.to_state,
                        reason: auto.reason,
                        success: false,
                    });
                    break;
                }
            }
        }

        Ok(steps)
    }

    /// Sweep candidate processes, running a cascade on each. Designed for
    /// a periodic scheduler with at most one in-flight sweep per kanban.
    pub async fn process_all(&self, kanban_id: Option<&str>) -> Result<SweepStats> {
        let processes = match kanban_id {
            Some(id) => self.repo.by_kanban(id).await?,
            None => self.repo.all().await?,
        };

        let mut stats = SweepStats::default();
        for process in processes {
            stats.processes_checked += 1;
            match self.cascade(&process.process_id).await {
                Ok(steps) => {
                    let executed = steps.iter().filter(|s| s.success).count();
                    if executed > 0 {
                        stats.transitions_executed += executed;
                        stats.cascades_executed += 1;
                    }
                    if steps.iter().any(|s| !s.success) {
                        stats.errors += 1;
                    }
                }
                Err(err) => {
                    warn!(process_id = %process.process_id, error = %err, "sweep error");
                    stats.errors += 1;
                }
            }
        }

        info!(?stats, kanban = kanban_id.unwrap_or("*"), "auto-transition sweep finished");
        Ok(stats)
    }

    /// Processes that would auto-transition right now, without executing.
    pub async fn pending_auto(&self, kanban_id: Option<&str>) -> Result<Vec<PendingAuto>> {
        let processes = match kanban_id {
            Some(id) => self.repo.by_kanban(id).await?,
            None => self.repo.all().await?,
        };

        let mut pending = Vec::new();
        for process in processes {
            if let Some(auto) = self.check_auto(&process).await? {
                pending.push(PendingAuto {
                    process_id: process.process_id.clone(),
                    current_state: process.current_state.clone(),
                    to_state: auto.to_state,
                    reason: auto.reason,
                });
            }
        }
        Ok(pending)
    }

    /// Hours since the last state-bearing audit entry, or since creation.
    async fn hours_in_current_state(&self, process: &Process) -> Result<f64> {
        let history = self.repo.history(&process.process_id).await?;
        let since = history
            .iter()
            .rev()
            .find(|e| e.is_state_bearing())
            .map(|e| e.timestamp)
            .unwrap_or(process.created_at);
        Ok((Utc::now() - since).num_seconds().max(0) as f64 / 3600.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::AuditAction;
    use crate::models::kanban::tests::sample_kanban;
    use crate::models::kanban::{BlockedTransition, WarnedTransition};
    use crate::storage::memory::MemoryDriver;
    use crate::storage::repository::tests::sample_process;
    use serde_json::json;

    struct Fixture {
        repo: Arc<ProcessRepository>,
        engine: TransitionEngine,
    }

    fn fixture(kanban: crate::KanbanDefinition) -> Fixture {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(kanban, false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        let checker = Arc::new(PrerequisiteChecker::new(
            tempfile::tempdir().unwrap().path(),
            repo.clone(),
        ));
        let engine = TransitionEngine::new(registry, checker, repo.clone());
        Fixture { repo, engine }
    }

    async fn seed(fixture: &Fixture, state: &str) -> String {
        let process = fixture
            .repo
            .create_process(sample_process("", state))
            .await
            .unwrap();
        process.process_id
    }

    #[tokio::test]
    async fn test_normal_execution_writes_audit() {
        let f = fixture(sample_kanban());
        let pid = seed(&f, "novo").await;

        let outcome = f
            .engine
            .execute(&pid, "em_analise", ActorType::Manual, "ana", None)
            .await
            .unwrap();

        assert_eq!(outcome.from_state, "novo");
        assert_eq!(outcome.to_state, "em_analise");
        assert!(outcome.warnings.is_empty());
        assert!(outcome.prerequisites_met);

        let process = f.repo.get_by_id(&pid).await.unwrap().unwrap();
        assert_eq!(process.current_state, "em_analise");
    }

    #[tokio::test]
    async fn test_blocked_transition_rejects_without_audit() {
        let mut kanban = sample_kanban();
        kanban.blocked_transitions.push(BlockedTransition {
            from: "novo".to_string(),
            to: "aprovado".to_string(),
            reason: "skip_review".to_string(),
        });
        let f = fixture(kanban);
        let pid = seed(&f, "novo").await;

        let err = f
            .engine
            .execute(&pid, "aprovado", ActorType::Manual, "ana", None)
            .await
            .unwrap_err();
        match err {
            FlowboardError::TransitionBlocked(reason) => assert_eq!(reason, "skip_review"),
            other => panic!("expected TransitionBlocked, got {other:?}"),
        }

        // State unchanged, no new audit entry beyond creation
        let process = f.repo.get_by_id(&pid).await.unwrap().unwrap();
        assert_eq!(process.current_state, "novo");
        assert_eq!(f.repo.history(&pid).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unmet_prerequisite_warns_but_executes() {
        let mut kanban = sample_kanban();
        kanban.recommended_transitions[0].prerequisites = vec![serde_json::from_value(json!({
            "type": "field_check",
            "field": "valor",
            "condition": "greater_than",
            "value": 0
        }))
        .unwrap()];
        let f = fixture(kanban);

        let mut process = sample_process("", "novo");
        process.field_values.insert("valor".to_string(), json!(0));
        let pid = f
            .repo
            .create_process(process)
            .await
            .unwrap()
            .process_id;

        let outcome = f
            .engine
            .execute(&pid, "em_analise", ActorType::Manual, "ana", None)
            .await
            .unwrap();

        assert_eq!(outcome.warnings.len(), 1);
        assert!(!outcome.prerequisites_met);
        assert!(outcome.was_anomaly);

        let history = f.repo.history(&pid).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.action, AuditAction::StateChanged);
        assert_eq!(last.prerequisites_met, Some(false));
        assert_eq!(
            last.metadata.get("was_anomaly"),
            Some(&Value::Bool(true))
        );
    }

    #[tokio::test]
    async fn test_warned_transition_demands_justification() {
        let mut kanban = sample_kanban();
        kanban.warned_transitions.push(WarnedTransition {
            from: "novo".to_string(),
            to: "aprovado".to_string(),
            message: "skipping analysis is unusual".to_string(),
            require_justification: true,
        });
        let f = fixture(kanban);
        let pid = seed(&f, "novo").await;

        let err = f
            .engine
            .execute(&pid, "aprovado", ActorType::Manual, "ana", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowboardError::JustificationRequired { .. }));

        let outcome = f
            .engine
            .execute(
                &pid,
                "aprovado",
                ActorType::Manual,
                "ana",
                Some("customer escalation"),
            )
            .await
            .unwrap();
        assert_eq!(outcome.warnings, vec!["skipping analysis is unusual"]);
    }

    #[tokio::test]
    async fn test_forced_transition_surfaces_warnings_and_completes() {
        let mut kanban = sample_kanban();
        kanban.recommended_transitions[0].prerequisites = vec![serde_json::from_value(json!({
            "type": "field_check",
            "field": "valor",
            "condition": "greater_than",
            "value": 1000,
            "message": "valor must exceed 1000"
        }))
        .unwrap()];
        let f = fixture(kanban);
        let pid = seed(&f, "novo").await;

        // Justification is mandatory
        let err = f.engine.force(&pid, "em_analise", "admin", "  ").await.unwrap_err();
        assert!(matches!(err, FlowboardError::InvalidInput(_)));

        let outcome = f
            .engine
            .force(&pid, "em_analise", "admin", "emergency")
            .await
            .unwrap();
        assert!(outcome.forced);
        assert_eq!(outcome.warnings, vec!["valor must exceed 1000"]);

        let history = f.repo.history(&pid).await.unwrap();
        let last = history.last().unwrap();
        assert_eq!(last.action, AuditAction::ForcedTransition);
        assert!(last.is_forced());
        assert_eq!(f.repo.get_by_id(&pid).await.unwrap().unwrap().current_state, "em_analise");
    }

    fn cascade_kanban() -> crate::KanbanDefinition {
        serde_json::from_value(json!({
            "id": "cascata",
            "name": "Cascata",
            "states": [
                {"id": "a", "name": "A", "type": "initial",
                 "auto_transition_to": "b", "timeout_hours": 0},
                {"id": "b", "name": "B",
                 "auto_transition_to": "c", "timeout_hours": 0},
                {"id": "c", "name": "C", "type": "final"}
            ],
            "recommended_transitions": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "c"}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_cascade_chains_to_final_state() {
        let f = fixture(cascade_kanban());
        let mut process = sample_process("", "a");
        process.kanban_id = "cascata".to_string();
        let pid = f.repo.create_process(process).await.unwrap().process_id;

        let stats = f.engine.process_all(Some("cascata")).await.unwrap();
        assert_eq!(stats.processes_checked, 1);
        assert_eq!(stats.cascades_executed, 1);
        assert_eq!(stats.transitions_executed, 2);
        assert_eq!(stats.errors, 0);

        let process = f.repo.get_by_id(&pid).await.unwrap().unwrap();
        assert_eq!(process.current_state, "c");

        let system_hops: Vec<_> = f
            .repo
            .history(&pid)
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.action == AuditAction::StateChanged)
            .collect();
        assert_eq!(system_hops.len(), 2);
        for hop in &system_hops {
            assert_eq!(hop.actor, ActorType::System);
            assert_eq!(hop.user, AUTO_TRANSITION_USER);
        }
    }

    #[tokio::test]
    async fn test_cascade_terminates_on_cycles() {
        // a and b auto-transition to each other with zero timeout: the
        // depth bound is the only thing that stops the chain.
        let kanban: crate::KanbanDefinition = serde_json::from_value(json!({
            "id": "loop",
            "name": "Loop",
            "states": [
                {"id": "a", "name": "A", "type": "initial",
                 "auto_transition_to": "b", "timeout_hours": 0},
                {"id": "b", "name": "B",
                 "auto_transition_to": "a", "timeout_hours": 0}
            ],
            "recommended_transitions": [
                {"from": "a", "to": "b"},
                {"from": "b", "to": "a"}
            ]
        }))
        .unwrap();
        let f = fixture(kanban);
        let mut process = sample_process("", "a");
        process.kanban_id = "loop".to_string();
        let pid = f.repo.create_process(process).await.unwrap().process_id;

        let steps = f.engine.cascade(&pid).await.unwrap();
        assert_eq!(steps.len(), DEFAULT_MAX_CASCADE_DEPTH);
        assert!(steps.iter().all(|s| s.success));
    }

    #[tokio::test]
    async fn test_pending_auto_lists_without_executing() {
        let f = fixture(cascade_kanban());
        let mut process = sample_process("", "a");
        process.kanban_id = "cascata".to_string();
        let pid = f.repo.create_process(process).await.unwrap().process_id;

        let pending = f.engine.pending_auto(Some("cascata")).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].process_id, pid);
        assert_eq!(pending[0].to_state, "b");

        // Nothing moved
        assert_eq!(
            f.repo.get_by_id(&pid).await.unwrap().unwrap().current_state,
            "a"
        );
    }

    #[tokio::test]
    async fn test_unknown_target_state_rejected() {
        let f = fixture(sample_kanban());
        let pid = seed(&f, "novo").await;
        let err = f
            .engine
            .execute(&pid, "inexistente", ActorType::Manual, "ana", None)
            .await
            .unwrap_err();
        assert!(matches!(err, FlowboardError::InvalidInput(_)));
    }
}
