// Dashboards - health scores, throughput, bottlenecks

//! # Dashboards
//!
//! High-level aggregates composed from the pattern analyzer and the
//! anomaly detector. The health score folds the anomaly counts into one
//! number:
//!
//! `health = 1 - 0.5 * stuck/total - 0.3 * loops/total - 0.2 * outliers/total`
//!
//! with status bands healthy (>= 0.8), warning (>= 0.6) and critical
//! below that.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use serde::Serialize;

use crate::analysis::anomalies::AnomalyDetector;
use crate::analysis::patterns::PatternAnalyzer;
use crate::analysis::{load_trails, mean, ProcessTrail};
use crate::models::kanban::StateType;
use crate::registry::KanbanRegistry;
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Health status bands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

/// One issue contributing to a degraded health score.
#[derive(Debug, Clone, Serialize)]
pub struct HealthIssue {
    pub kind: &'static str,
    pub count: usize,
    pub severity: &'static str,
}

/// Headline numbers inside [`KanbanHealth`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthMetrics {
    pub total_processes: usize,
    pub active_processes: usize,
    pub completed_processes: usize,
    pub stuck_processes: usize,
    pub avg_completion_time_hours: f64,
    pub throughput_per_day: f64,
}

/// Composite health record for one kanban.
#[derive(Debug, Clone, Serialize)]
pub struct KanbanHealth {
    pub kanban_id: String,
    pub health_score: f64,
    pub status: HealthStatus,
    pub metrics: HealthMetrics,
    pub issues: Vec<HealthIssue>,
    pub recommendations: Vec<String>,
}

/// Windowed process statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ProcessStats {
    pub period_days: i64,
    pub created: usize,
    pub completed: usize,
    pub active: usize,
    pub completion_rate: f64,
    pub avg_cycle_time_hours: f64,
    pub states_distribution: HashMap<String, usize>,
    /// Completions per day, keyed by ISO date
    pub daily_throughput: HashMap<String, usize>,
}

/// One state slowing the workflow down.
#[derive(Debug, Clone, Serialize)]
pub struct BottleneckState {
    pub state_id: String,
    pub avg_duration_hours: f64,
    pub min_duration_hours: f64,
    pub slowdown_factor: f64,
    pub process_count: usize,
}

/// The bottleneck report.
#[derive(Debug, Clone, Serialize)]
pub struct Bottlenecks {
    pub bottleneck_states: Vec<BottleneckState>,
    pub recommendations: Vec<String>,
}

/// Dashboard aggregates for one repository.
pub struct Dashboard {
    repo: Arc<ProcessRepository>,
    registry: Arc<KanbanRegistry>,
    patterns: PatternAnalyzer,
    anomalies: AnomalyDetector,
}

impl Dashboard {
    pub fn new(repo: Arc<ProcessRepository>, registry: Arc<KanbanRegistry>) -> Self {
        Dashboard {
            patterns: PatternAnalyzer::new(repo.clone()),
            anomalies: AnomalyDetector::new(repo.clone()),
            repo,
            registry,
        }
    }

    fn is_completed(&self, kanban_id: &str, state: &str) -> bool {
        self.registry
            .get(kanban_id)
            .and_then(|k| k.state(state).and_then(|s| s.state_type))
            == Some(StateType::Final)
    }

    /// Composite health of one kanban.
    pub async fn kanban_health(&self, kanban_id: &str) -> Result<KanbanHealth> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        let report = self.anomalies.report(kanban_id).await?;

        let total = trails.len();
        let completed: Vec<&ProcessTrail> = trails
            .iter()
            .filter(|t| self.is_completed(kanban_id, &t.process.current_state))
            .collect();
        let active = total - completed.len();

        let completion_times: Vec<f64> = completed
            .iter()
            .filter_map(|t| {
                t.entries
                    .last()
                    .map(|e| (e.timestamp - t.process.created_at).num_seconds() as f64 / 3600.0)
            })
            .collect();

        let thirty_days_ago = Utc::now() - Duration::days(30);
        let recent_completed = completed
            .iter()
            .filter(|t| t.process.created_at > thirty_days_ago)
            .count();
        let throughput = recent_completed as f64 / 30.0;

        let mut issues = Vec::new();
        let summary = report.summary;
        if summary.stuck_count > 0 {
            issues.push(HealthIssue {
                kind: "stuck_processes",
                count: summary.stuck_count,
                severity: if summary.stuck_count > 5 { "high" } else { "medium" },
            });
        }
        if summary.loop_count > 0 {
            issues.push(HealthIssue {
                kind: "loops",
                count: summary.loop_count,
                severity: "medium",
            });
        }
        if summary.duration_outlier_count > 0 {
            issues.push(HealthIssue {
                kind: "duration_anomalies",
                count: summary.duration_outlier_count,
                severity: "low",
            });
        }

        let health_score = if total == 0 {
            1.0
        } else {
            let total = total as f64;
            (1.0 - 0.5 * summary.stuck_count as f64 / total
                - 0.3 * summary.loop_count as f64 / total
                - 0.2 * summary.duration_outlier_count as f64 / total)
                .clamp(0.0, 1.0)
        };

        let status = if health_score >= 0.8 {
            HealthStatus::Healthy
        } else if health_score >= 0.6 {
            HealthStatus::Warning
        } else {
            HealthStatus::Critical
        };

        let mut recommendations = Vec::new();
        if summary.stuck_count > 0 {
            recommendations.push(format!(
                "Review {} stuck process(es) and consider manual intervention or process redesign",
                summary.stuck_count
            ));
        }
        if summary.loop_count > 0 {
            recommendations.push(
                "Investigate process loops - may indicate rework cycles or validation issues"
                    .to_string(),
            );
        }
        if summary.rare_transition_count > 5 {
            recommendations.push(
                "High number of unusual transitions detected - review kanban workflow design"
                    .to_string(),
            );
        }
        if recommendations.is_empty() {
            recommendations.push("Workflow operating normally - continue monitoring".to_string());
        }

        Ok(KanbanHealth {
            kanban_id: kanban_id.to_string(),
            health_score,
            status,
            metrics: HealthMetrics {
                total_processes: total,
                active_processes: active,
                completed_processes: completed.len(),
                stuck_processes: summary.stuck_count,
                avg_completion_time_hours: mean(&completion_times),
                throughput_per_day: throughput,
            },
            issues,
            recommendations,
        })
    }

    /// Counts, completion rate, cycle time and daily throughput over the
    /// trailing window.
    pub async fn process_stats(&self, kanban_id: &str, days: i64) -> Result<ProcessStats> {
        let cutoff = Utc::now() - Duration::days(days);
        let trails: Vec<ProcessTrail> = load_trails(&self.repo, kanban_id)
            .await?
            .into_iter()
            .filter(|t| t.process.created_at >= cutoff)
            .collect();

        let created = trails.len();
        let completed: Vec<&ProcessTrail> = trails
            .iter()
            .filter(|t| self.is_completed(kanban_id, &t.process.current_state))
            .collect();
        let completed_count = completed.len();
        let active = created - completed_count;

        let completion_rate = if created == 0 {
            0.0
        } else {
            completed_count as f64 / created as f64
        };

        let cycle_times: Vec<f64> = completed
            .iter()
            .filter_map(|t| {
                t.entries
                    .last()
                    .map(|e| (e.timestamp - t.process.created_at).num_seconds() as f64 / 3600.0)
            })
            .collect();

        let mut states_distribution: HashMap<String, usize> = HashMap::new();
        for trail in &trails {
            *states_distribution
                .entry(trail.process.current_state.clone())
                .or_default() += 1;
        }

        let mut daily_throughput: HashMap<String, usize> = HashMap::new();
        for trail in &completed {
            if let Some(last) = trail.entries.last() {
                *daily_throughput
                    .entry(last.timestamp.date_naive().to_string())
                    .or_default() += 1;
            }
        }

        Ok(ProcessStats {
            period_days: days,
            created,
            completed: completed_count,
            active,
            completion_rate,
            avg_cycle_time_hours: mean(&cycle_times),
            states_distribution,
            daily_throughput,
        })
    }

    /// States whose average dwell is at least twice their observed
    /// minimum, with enough samples to matter.
    pub async fn bottlenecks(&self, kanban_id: &str) -> Result<Bottlenecks> {
        let durations = self.patterns.state_durations(kanban_id).await?;

        let mut bottleneck_states: Vec<BottleneckState> = durations
            .into_iter()
            .filter(|(_, stats)| stats.sample_count >= 3 && stats.min_hours > 0.0)
            .filter_map(|(state, stats)| {
                let slowdown = stats.avg_hours / stats.min_hours;
                (slowdown >= 2.0).then_some(BottleneckState {
                    state_id: state,
                    avg_duration_hours: stats.avg_hours,
                    min_duration_hours: stats.min_hours,
                    slowdown_factor: slowdown,
                    process_count: stats.sample_count,
                })
            })
            .collect();
        bottleneck_states.sort_by(|a, b| {
            b.slowdown_factor
                .partial_cmp(&a.slowdown_factor)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        let mut recommendations = Vec::new();
        if let Some(top) = bottleneck_states.first() {
            recommendations.push(format!(
                "State '{}' is {:.1}x slower than optimal - investigate delays",
                top.state_id, top.slowdown_factor
            ));
        }

        Ok(Bottlenecks {
            bottleneck_states,
            recommendations,
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

    async fn setup() -> (Dashboard, Arc<ProcessRepository>) {
        let registry = Arc::new(KanbanRegistry::new(tempfile::tempdir().unwrap().path()));
        registry.register(sample_kanban(), false).unwrap();
        let repo = Arc::new(ProcessRepository::new(Arc::new(MemoryDriver::new())));
        (Dashboard::new(repo.clone(), registry), repo)
    }

    #[tokio::test]
    async fn test_health_of_clean_corpus() {
        let (dashboard, repo) = setup().await;
        for i in 0..4 {
            let pid = format!("p{i}");
            repo.create_process(sample_process(&pid, "novo")).await.unwrap();
            repo.update_state(&pid, StateChange::new("em_analise", ActorType::Manual, "ana"))
                .await
                .unwrap();
            repo.update_state(&pid, StateChange::new("aprovado", ActorType::Manual, "ana"))
                .await
                .unwrap();
        }

        let health = dashboard.kanban_health("pedidos").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert!((health.health_score - 1.0).abs() < 1e-9);
        assert_eq!(health.metrics.total_processes, 4);
        assert_eq!(health.metrics.completed_processes, 4);
        assert_eq!(health.metrics.active_processes, 0);
        assert_eq!(
            health.recommendations,
            vec!["Workflow operating normally - continue monitoring"]
        );
    }

    #[tokio::test]
    async fn test_empty_kanban_is_healthy() {
        let (dashboard, _repo) = setup().await;
        let health = dashboard.kanban_health("pedidos").await.unwrap();
        assert_eq!(health.status, HealthStatus::Healthy);
        assert_eq!(health.metrics.total_processes, 0);
    }

    #[tokio::test]
    async fn test_process_stats_window() {
        let (dashboard, repo) = setup().await;
        for i in 0..3 {
            let pid = format!("p{i}");
            repo.create_process(sample_process(&pid, "novo")).await.unwrap();
        }
        repo.update_state("p0", StateChange::new("em_analise", ActorType::Manual, "ana"))
            .await
            .unwrap();
        repo.update_state("p0", StateChange::new("aprovado", ActorType::Manual, "ana"))
            .await
            .unwrap();

        let stats = dashboard.process_stats("pedidos", 30).await.unwrap();
        assert_eq!(stats.created, 3);
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.active, 2);
        assert!((stats.completion_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(stats.states_distribution["novo"], 2);
        assert_eq!(stats.states_distribution["aprovado"], 1);
        assert_eq!(stats.daily_throughput.values().sum::<usize>(), 1);
    }

    #[tokio::test]
    async fn test_bottlenecks_from_synthetic_durations() {
        use crate::analysis::tests::trail;
        use crate::analysis::patterns::duration_stats;

        // Direct check of the threshold logic against known durations
        let trails = vec![
            trail("fast", &["novo", "em_analise", "aprovado"], 50.0, 5.0),
            trail("slow1", &["novo", "em_analise", "aprovado"], 50.0, 20.0),
            trail("slow2", &["novo", "em_analise", "aprovado"], 50.0, 20.0),
        ];
        let stats = duration_stats(&trails);
        let novo = &stats["novo"];
        assert!(novo.sample_count >= 3);
        assert!(novo.avg_hours / novo.min_hours >= 2.0);
    }
}
