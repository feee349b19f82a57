// Analytics over the audit trail

//! # Analysis Layer
//!
//! Pure analytics over the audit trail: pattern mining, anomaly detection
//! and numeric feature extraction. Schedulers and dashboards consume these
//! results; nothing in here mutates engine state.
//!
//! All computations run over [`ProcessTrail`] values (a process paired
//! with its audit entries), so the statistics are plain functions that can
//! be tested against synthetic histories without any storage behind them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::models::audit::AuditEntry;
use crate::models::process::Process;
use crate::storage::repository::ProcessRepository;
use crate::Result;

pub mod anomalies;
pub mod features;
pub mod patterns;

/// One process together with its audit history, oldest entry first.
#[derive(Debug, Clone)]
pub struct ProcessTrail {
    pub process: Process,
    pub entries: Vec<AuditEntry>,
}

impl ProcessTrail {
    /// The chronological state sequence of the process: one state per
    /// state-bearing audit entry, with the live `current_state` appended
    /// when the trail does not already end on it.
    pub fn sequence(&self) -> Vec<String> {
        let mut sequence = Vec::new();

        for entry in &self.entries {
            if sequence.is_empty() {
                if let Some(from) = &entry.from_state {
                    sequence.push(from.clone());
                }
            }
            if let Some(to) = &entry.to_state {
                sequence.push(to.clone());
            }
        }

        let current = &self.process.current_state;
        if !current.is_empty() && sequence.last() != Some(current) {
            sequence.push(current.clone());
        }
        sequence
    }

    /// Directed transitions the process performed, as `from->to` strings.
    pub fn transition_keys(&self) -> Vec<String> {
        let sequence = self.sequence();
        sequence
            .windows(2)
            .map(|pair| format!("{}->{}", pair[0], pair[1]))
            .collect()
    }

    /// Timestamp of the latest audit entry, or creation time for an empty
    /// trail. The process has sat in its current state since this moment.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.entries
            .last()
            .map(|e| e.timestamp)
            .unwrap_or(self.process.created_at)
    }

    /// Hours from creation to the latest audit entry (or to now when the
    /// trail is empty).
    pub fn total_duration_hours(&self, now: DateTime<Utc>) -> f64 {
        let end = self.entries.last().map(|e| e.timestamp).unwrap_or(now);
        (end - self.process.created_at).num_seconds() as f64 / 3600.0
    }
}

/// Load the trails of every process in a kanban with one audit scan.
pub async fn load_trails(
    repo: &Arc<ProcessRepository>,
    kanban_id: &str,
) -> Result<Vec<ProcessTrail>> {
    let processes = repo.by_kanban(kanban_id).await?;
    let entries = repo.audit_by_kanban(kanban_id).await?;

    Ok(processes
        .into_iter()
        .map(|process| {
            let own: Vec<AuditEntry> = entries
                .iter()
                .filter(|e| e.process_id == process.process_id)
                .cloned()
                .collect();
            ProcessTrail {
                process,
                entries: own,
            }
        })
        .collect())
}

/// Sample statistics used across the analysis layer.
pub(crate) fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Sample standard deviation (n - 1); zero below two samples.
pub(crate) fn std_dev(values: &[f64]) -> f64 {
    if values.len() < 2 {
        return 0.0;
    }
    let m = mean(values);
    let variance =
        values.iter().map(|v| (v - m).powi(2)).sum::<f64>() / (values.len() - 1) as f64;
    variance.sqrt()
}
