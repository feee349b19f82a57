// Audit trail queries and compliance reporting

//! # Audit Trail
//!
//! Read-only projections over the append-only audit table. The trail is
//! the authoritative explanation of what happened to every process; these
//! queries never mutate it.
//!
//! The compliance report scores a kanban by how often its users bypassed
//! prerequisites: `score = max(0, 1 - 2 * forced_ratio)`, so a workflow
//! where half of all transitions are forced bottoms out at zero.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::models::audit::{AuditAction, AuditEntry};
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// An actor who forced transitions often enough to stand out.
#[derive(Debug, Clone, Serialize)]
pub struct UnusualActivity {
    pub user: String,
    pub forced_count: usize,
    pub severity: &'static str,
}

/// Aggregate event counts over a window.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityStatistics {
    pub period_days: i64,
    pub total_events: usize,
    pub events_by_type: HashMap<String, usize>,
    pub events_by_user: HashMap<String, usize>,
    pub forced_transitions_count: usize,
}

/// Compliance snapshot for one kanban.
#[derive(Debug, Clone, Serialize)]
pub struct ComplianceReport {
    pub kanban_id: String,
    pub report_date: String,
    pub period_days: i64,
    pub total_processes: usize,
    pub total_transitions: usize,
    pub forced_transitions: Vec<AuditEntry>,
    pub unusual_activity: Vec<UnusualActivity>,
    /// `max(0, 1 - 2 * forced_ratio)`, in `[0, 1]`
    pub compliance_score: f64,
}

/// Query surface over the audit table.
pub struct AuditTrail {
    repo: Arc<ProcessRepository>,
}

impl AuditTrail {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        AuditTrail { repo }
    }

    /// Complete trail of one process, oldest first.
    pub async fn by_process(&self, process_id: &str) -> Result<Vec<AuditEntry>> {
        self.repo.history(process_id).await
    }

    /// Complete trail of one kanban, oldest first.
    pub async fn by_kanban(&self, kanban_id: &str) -> Result<Vec<AuditEntry>> {
        self.repo.audit_by_kanban(kanban_id).await
    }

    /// One user's activity inside the trailing window, newest first.
    pub async fn by_user(&self, user: &str, days: i64) -> Result<Vec<AuditEntry>> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut entries: Vec<AuditEntry> = self
            .repo
            .audit_all()
            .await?
            .into_iter()
            .filter(|e| e.user == user && e.timestamp >= cutoff)
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// The most recent `limit` events across all processes.
    pub async fn recent(&self, limit: usize) -> Result<Vec<AuditEntry>> {
        let mut entries = self.repo.audit_all().await?;
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        entries.truncate(limit);
        Ok(entries)
    }

    /// Forced transitions inside the trailing window, newest first.
    pub async fn forced_only(&self, days: i64) -> Result<Vec<AuditEntry>> {
        let cutoff = Utc::now() - Duration::days(days);
        let mut entries: Vec<AuditEntry> = self
            .repo
            .audit_all()
            .await?
            .into_iter()
            .filter(|e| e.is_forced() && e.timestamp >= cutoff)
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(entries)
    }

    /// Event counts by type and user over the trailing window.
    pub async fn activity_statistics(&self, days: i64) -> Result<ActivityStatistics> {
        let cutoff = Utc::now() - Duration::days(days);
        let entries: Vec<AuditEntry> = self
            .repo
            .audit_all()
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= cutoff)
            .collect();

        let mut events_by_type: HashMap<String, usize> = HashMap::new();
        let mut events_by_user: HashMap<String, usize> = HashMap::new();
        let mut forced = 0usize;

        for entry in &entries {
            *events_by_type
                .entry(entry.action.as_str().to_string())
                .or_default() += 1;
            *events_by_user.entry(entry.user.clone()).or_default() += 1;
            if entry.is_forced() {
                forced += 1;
            }
        }

        Ok(ActivityStatistics {
            period_days: days,
            total_events: entries.len(),
            events_by_type,
            events_by_user,
            forced_transitions_count: forced,
        })
    }

    /// Compliance report for one kanban over the trailing window.
    pub async fn compliance_report(&self, kanban_id: &str, days: i64) -> Result<ComplianceReport> {
        let cutoff = Utc::now() - Duration::days(days);
        let entries: Vec<AuditEntry> = self
            .repo
            .audit_by_kanban(kanban_id)
            .await?
            .into_iter()
            .filter(|e| e.timestamp >= cutoff)
            .collect();

        let total_processes = entries
            .iter()
            .filter(|e| e.action == AuditAction::ProcessCreated)
            .count();
        let transitions: Vec<&AuditEntry> = entries.iter().filter(|e| e.is_transition()).collect();
        let forced: Vec<AuditEntry> = transitions
            .iter()
            .filter(|e| e.is_forced())
            .map(|e| (*e).clone())
            .collect();

        let forced_ratio = if transitions.is_empty() {
            0.0
        } else {
            forced.len() as f64 / transitions.len() as f64
        };
        let compliance_score = (1.0 - 2.0 * forced_ratio).max(0.0);

        // Repeated forcing by one actor is worth a second look
        let mut forced_by_user: HashMap<String, usize> = HashMap::new();
        for entry in &forced {
            *forced_by_user.entry(entry.user.clone()).or_default() += 1;
        }
        let mut unusual_activity: Vec<UnusualActivity> = forced_by_user
            .into_iter()
            .filter(|(_, count)| *count > 2)
            .map(|(user, count)| UnusualActivity {
                user,
                forced_count: count,
                severity: if count > 5 { "high" } else { "medium" },
            })
            .collect();
        unusual_activity.sort_by(|a, b| b.forced_count.cmp(&a.forced_count));

        Ok(ComplianceReport {
            kanban_id: kanban_id.to_string(),
            report_date: Utc::now().date_naive().to_string(),
            period_days: days,
            total_processes,
            total_transitions: transitions.len(),
            forced_transitions: forced,
            unusual_activity,
            compliance_score,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::audit::ActorType;
    use crate::storage::repository::tests::{repo, sample_process};
    use crate::storage::repository::StateChange;

    async fn seeded() -> (AuditTrail, Arc<ProcessRepository>) {
        let repo = Arc::new(repo());
        repo.create_process(sample_process("p1", "novo")).await.unwrap();
        repo.update_state("p1", StateChange::new("em_analise", ActorType::Manual, "ana"))
            .await
            .unwrap();
        repo.update_state(
            "p1",
            StateChange::new("aprovado", ActorType::Manual, "admin").forced("urgent"),
        )
        .await
        .unwrap();
        (AuditTrail::new(repo.clone()), repo)
    }

    #[tokio::test]
    async fn test_query_surfaces() {
        let (trail, _repo) = seeded().await;

        assert_eq!(trail.by_process("p1").await.unwrap().len(), 3);
        assert_eq!(trail.by_kanban("pedidos").await.unwrap().len(), 3);

        let recent = trail.recent(2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp >= recent[1].timestamp);

        let by_ana = trail.by_user("ana", 7).await.unwrap();
        assert_eq!(by_ana.len(), 1);
        assert_eq!(by_ana[0].user, "ana");

        let forced = trail.forced_only(7).await.unwrap();
        assert_eq!(forced.len(), 1);
        assert_eq!(forced[0].user, "admin");
    }

    #[tokio::test]
    async fn test_activity_statistics() {
        let (trail, _repo) = seeded().await;
        let stats = trail.activity_statistics(7).await.unwrap();

        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.events_by_type["process_created"], 1);
        assert_eq!(stats.events_by_type["state_changed"], 1);
        assert_eq!(stats.events_by_type["forced_transition"], 1);
        assert_eq!(stats.events_by_user["ana"], 1);
        assert_eq!(stats.forced_transitions_count, 1);
    }

    #[tokio::test]
    async fn test_compliance_score_penalizes_forcing() {
        let (trail, repo) = seeded().await;

        // One of two transitions forced: score = 1 - 2 * 0.5 = 0
        let report = trail.compliance_report("pedidos", 30).await.unwrap();
        assert_eq!(report.total_processes, 1);
        assert_eq!(report.total_transitions, 2);
        assert_eq!(report.forced_transitions.len(), 1);
        assert!((report.compliance_score - 0.0).abs() < 1e-9);

        // Add clean transitions: ratio falls, score rises but stays in
        // bounds
        for i in 0..6 {
            let pid = format!("clean{i}");
            repo.create_process(sample_process(&pid, "novo")).await.unwrap();
            repo.update_state(&pid, StateChange::new("em_analise", ActorType::Manual, "ana"))
                .await
                .unwrap();
        }
        let report = trail.compliance_report("pedidos", 30).await.unwrap();
        assert_eq!(report.total_transitions, 8);
        let expected = 1.0 - 2.0 * (1.0 / 8.0);
        assert!((report.compliance_score - expected).abs() < 1e-9);
        assert!((0.0..=1.0).contains(&report.compliance_score));
    }

    #[tokio::test]
    async fn test_unusual_activity_flags_repeat_forcers() {
        let repo = Arc::new(repo());
        let trail = AuditTrail::new(repo.clone());

        repo.create_process(sample_process("p1", "novo")).await.unwrap();
        for target in ["em_analise", "novo", "em_analise", "novo", "em_analise", "novo"] {
            repo.update_state(
                "p1",
                StateChange::new(target, ActorType::Manual, "admin").forced("because"),
            )
            .await
            .unwrap();
        }

        let report = trail.compliance_report("pedidos", 30).await.unwrap();
        assert_eq!(report.unusual_activity.len(), 1);
        assert_eq!(report.unusual_activity[0].user, "admin");
        assert_eq!(report.unusual_activity[0].severity, "high");
    }
}
