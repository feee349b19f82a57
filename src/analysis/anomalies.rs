// Anomaly detector - stuck processes, outliers, loops, rare edges

//! # Anomaly Detector
//!
//! Statistical and structural outlier detection over the process corpus.
//! An anomaly flags something *unusual*, never something illegal: every
//! detector only reads the audit trail and reports, it does not act.
//!
//! Four detectors ship: stuck processes (dwell time far beyond the corpus
//! average), duration outliers (z-score over total process durations),
//! loops (states revisited within a bounded window) and rare edges
//! (transitions whose corpus-wide frequency falls below a threshold).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::analysis::patterns::duration_stats;
use crate::analysis::{load_trails, mean, std_dev, ProcessTrail};
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Default dwell threshold for [`AnomalyDetector::detect_stuck`].
pub const DEFAULT_STUCK_THRESHOLD_HOURS: f64 = 48.0;

/// Default z-score threshold for duration outliers.
pub const DEFAULT_Z_SCORE_THRESHOLD: f64 = 2.0;

/// Default maximum loop size.
pub const DEFAULT_MAX_LOOP_SIZE: usize = 3;

/// Default rarity threshold for unusual transitions.
pub const DEFAULT_RARITY_THRESHOLD: f64 = 0.05;

/// A process that has sat in its state beyond the threshold.
#[derive(Debug, Clone)]
pub struct StuckProcess {
    pub process_id: String,
    pub current_state: String,
    pub hours_stuck: f64,
    /// Corpus average for the state, falling back to the threshold
    pub expected_duration: f64,
    /// `min(1, hours_stuck / (2 * expected_duration))`
    pub anomaly_score: f64,
    pub last_transition: chrono::DateTime<Utc>,
}

/// Direction of a duration outlier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutlierKind {
    TooLong,
    TooShort,
}

/// A process whose total duration deviates from the corpus.
#[derive(Debug, Clone)]
pub struct DurationOutlier {
    pub process_id: String,
    pub total_duration_hours: f64,
    pub expected_duration: f64,
    pub z_score: f64,
    pub kind: OutlierKind,
    pub states_visited: Vec<String>,
}

/// A revisited-state window inside one process.
#[derive(Debug, Clone)]
pub struct LoopPattern {
    /// The window, first and last element being the revisited state
    pub states: Vec<String>,
    /// Number of hops in the loop
    pub size: usize,
}

/// A process containing loops.
#[derive(Debug, Clone)]
pub struct LoopAnomaly {
    pub process_id: String,
    pub loops: Vec<LoopPattern>,
}

/// One rare edge carried by a process.
#[derive(Debug, Clone)]
pub struct RareTransition {
    pub from_state: String,
    pub to_state: String,
    pub occurrence_rate: f64,
    pub total_occurrences: usize,
}

/// A process that performed at least one rare edge.
#[derive(Debug, Clone)]
pub struct RareTransitionAnomaly {
    pub process_id: String,
    pub unusual_transitions: Vec<RareTransition>,
}

/// Aggregate counts for the composite report.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnomalySummary {
    pub total_processes: usize,
    pub stuck_count: usize,
    pub duration_outlier_count: usize,
    pub loop_count: usize,
    pub rare_transition_count: usize,
}

/// All four detectors in one record.
#[derive(Debug, Clone)]
pub struct AnomalyReport {
    pub stuck: Vec<StuckProcess>,
    pub duration_outliers: Vec<DurationOutlier>,
    pub loops: Vec<LoopAnomaly>,
    pub rare_transitions: Vec<RareTransitionAnomaly>,
    pub summary: AnomalySummary,
}

/// Detector over one repository's audit trail.
pub struct AnomalyDetector {
    repo: Arc<ProcessRepository>,
}

impl AnomalyDetector {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        AnomalyDetector { repo }
    }

    /// Processes stuck at least `threshold_hours`, sorted by dwell time
    /// descending. Lowering the threshold can only grow the result set.
    pub async fn detect_stuck(
        &self,
        kanban_id: &str,
        threshold_hours: f64,
    ) -> Result<Vec<StuckProcess>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(detect_stuck_in(&trails, threshold_hours))
    }

    /// Total-duration outliers by z-score. Requires at least three
    /// samples; fewer return empty.
    pub async fn detect_duration_outliers(
        &self,
        kanban_id: &str,
        z_score_threshold: f64,
    ) -> Result<Vec<DurationOutlier>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(detect_outliers_in(&trails, z_score_threshold))
    }

    /// Processes revisiting states within windows of at most
    /// `max_loop_size` hops.
    pub async fn detect_loops(
        &self,
        kanban_id: &str,
        max_loop_size: usize,
    ) -> Result<Vec<LoopAnomaly>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(detect_loops_in(&trails, max_loop_size))
    }

    /// Processes carrying transitions rarer than `rarity_threshold`.
    pub async fn detect_rare_transitions(
        &self,
        kanban_id: &str,
        rarity_threshold: f64,
    ) -> Result<Vec<RareTransitionAnomaly>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(detect_rare_in(&trails, rarity_threshold))
    }

    /// Composite report with all four detectors at their defaults.
    pub async fn report(&self, kanban_id: &str) -> Result<AnomalyReport> {
        let trails = load_trails(&self.repo, kanban_id).await?;

        let stuck = detect_stuck_in(&trails, DEFAULT_STUCK_THRESHOLD_HOURS);
        let duration_outliers = detect_outliers_in(&trails, DEFAULT_Z_SCORE_THRESHOLD);
        let loops = detect_loops_in(&trails, DEFAULT_MAX_LOOP_SIZE);
        let rare_transitions = detect_rare_in(&trails, DEFAULT_RARITY_THRESHOLD);

        let summary = AnomalySummary {
            total_processes: trails.len(),
            stuck_count: stuck.len(),
            duration_outlier_count: duration_outliers.len(),
            loop_count: loops.len(),
            rare_transition_count: rare_transitions.len(),
        };

        Ok(AnomalyReport {
            stuck,
            duration_outliers,
            loops,
            rare_transitions,
            summary,
        })
    }
}

// ========== Pure computations ==========

pub(crate) fn detect_stuck_in(trails: &[ProcessTrail], threshold_hours: f64) -> Vec<StuckProcess> {
    let now = Utc::now();
    let averages: HashMap<String, f64> = duration_stats(trails)
        .into_iter()
        .map(|(state, stats)| (state, stats.avg_hours))
        .collect();

    let mut stuck: Vec<StuckProcess> = trails
        .iter()
        .filter_map(|trail| {
            let last = trail.last_activity();
            let hours = (now - last).num_seconds() as f64 / 3600.0;
            if hours < threshold_hours {
                return None;
            }

            let state = trail.process.current_state.clone();
            let expected = averages.get(&state).copied().unwrap_or(threshold_hours);
            Some(StuckProcess {
                process_id: trail.process.process_id.clone(),
                current_state: state,
                hours_stuck: hours,
                expected_duration: expected,
                anomaly_score: (hours / (expected * 2.0)).min(1.0),
                last_transition: last,
            })
        })
        .collect();

    stuck.sort_by(|a, b| {
        b.hours_stuck
            .partial_cmp(&a.hours_stuck)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    stuck
}

pub(crate) fn detect_outliers_in(
    trails: &[ProcessTrail],
    z_score_threshold: f64,
) -> Vec<DurationOutlier> {
    if trails.len() < 3 {
        return Vec::new();
    }

    let now = Utc::now();
    let durations: Vec<(usize, f64)> = trails
        .iter()
        .enumerate()
        .map(|(i, t)| (i, t.total_duration_hours(now)))
        .collect();

    let values: Vec<f64> = durations.iter().map(|(_, d)| *d).collect();
    let mu = mean(&values);
    let sigma = std_dev(&values);
    if sigma == 0.0 {
        return Vec::new();
    }

    let mut outliers: Vec<DurationOutlier> = durations
        .into_iter()
        .filter_map(|(i, duration)| {
            let z = (duration - mu) / sigma;
            if z.abs() < z_score_threshold {
                return None;
            }
            let trail = &trails[i];
            let mut states = trail.sequence();
            states.dedup();
            Some(DurationOutlier {
                process_id: trail.process.process_id.clone(),
                total_duration_hours: duration,
                expected_duration: mu,
                z_score: z,
                kind: if z > 0.0 {
                    OutlierKind::TooLong
                } else {
                    OutlierKind::TooShort
                },
                states_visited: states,
            })
        })
        .collect();

    outliers.sort_by(|a, b| {
        b.z_score
            .abs()
            .partial_cmp(&a.z_score.abs())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    outliers
}

pub(crate) fn detect_loops_in(trails: &[ProcessTrail], max_loop_size: usize) -> Vec<LoopAnomaly> {
    trails
        .iter()
        .filter_map(|trail| {
            let sequence = trail.sequence();
            let mut last_seen: HashMap<&str, usize> = HashMap::new();
            let mut loops = Vec::new();

            for (i, state) in sequence.iter().enumerate() {
                if let Some(&start) = last_seen.get(state.as_str()) {
                    let window = sequence[start..=i].to_vec();
                    let size = window.len() - 1;
                    if size <= max_loop_size {
                        loops.push(LoopPattern {
                            states: window,
                            size,
                        });
                    }
                }
                last_seen.insert(state.as_str(), i);
            }

            if loops.is_empty() {
                None
            } else {
                Some(LoopAnomaly {
                    process_id: trail.process.process_id.clone(),
                    loops,
                })
            }
        })
        .collect()
}

pub(crate) fn detect_rare_in(
    trails: &[ProcessTrail],
    rarity_threshold: f64,
) -> Vec<RareTransitionAnomaly> {
    let mut counts: HashMap<(String, String), usize> = HashMap::new();
    let mut total = 0usize;

    for trail in trails {
        for entry in &trail.entries {
            if let (Some(from), Some(to)) = (&entry.from_state, &entry.to_state) {
                *counts.entry((from.clone(), to.clone())).or_default() += 1;
                total += 1;
            }
        }
    }
    if total == 0 {
        return Vec::new();
    }

    let rare: HashMap<(String, String), (f64, usize)> = counts
        .into_iter()
        .filter_map(|(edge, count)| {
            let rate = count as f64 / total as f64;
            (rate < rarity_threshold).then_some((edge, (rate, count)))
        })
        .collect();
    if rare.is_empty() {
        return Vec::new();
    }

    trails
        .iter()
        .filter_map(|trail| {
            let mut unusual = Vec::new();
            for entry in &trail.entries {
                if let (Some(from), Some(to)) = (&entry.from_state, &entry.to_state) {
                    let key = (from.clone(), to.clone());
                    if let Some(&(rate, count)) = rare.get(&key) {
                        unusual.push(RareTransition {
                            from_state: from.clone(),
                            to_state: to.clone(),
                            occurrence_rate: rate,
                            total_occurrences: count,
                        });
                    }
                }
            }

            if unusual.is_empty() {
                None
            } else {
                Some(RareTransitionAnomaly {
                    process_id: trail.process.process_id.clone(),
                    unusual_transitions: unusual,
                })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::tests::trail;

    /// Ten healthy processes that completed plus one stuck in analysis
    /// for 96 hours.
    fn corpus_with_stuck() -> Vec<ProcessTrail> {
        let mut trails = Vec::new();
        for i in 0..10 {
            // Entered em_analise 48h ago, left it 24h ago
            trails.push(trail(
                &format!("done{i}"),
                &["novo", "em_analise", "aprovado"],
                72.0,
                24.0,
            ));
        }
        // Entered em_analise 96h ago, still there
        trails.push(trail("stuck1", &["novo", "em_analise"], 192.0, 96.0));
        trails
    }

    #[test]
    fn test_detect_stuck_scenario() {
        let stuck = detect_stuck_in(&corpus_with_stuck(), 48.0);

        assert_eq!(stuck.len(), 1);
        let hit = &stuck[0];
        assert_eq!(hit.process_id, "stuck1");
        assert_eq!(hit.current_state, "em_analise");
        assert!((hit.hours_stuck - 96.0).abs() < 0.5, "{}", hit.hours_stuck);
        assert!(hit.anomaly_score >= 0.5);
    }

    #[test]
    fn test_stuck_set_monotonicity() {
        let trails = corpus_with_stuck();
        let strict = detect_stuck_in(&trails, 48.0);
        let loose = detect_stuck_in(&trails, 12.0);

        // Lowering the threshold never shrinks the stuck set
        assert!(loose.len() >= strict.len());
        for hit in &strict {
            assert!(loose.iter().any(|l| l.process_id == hit.process_id));
        }
    }

    #[test]
    fn test_duration_outliers() {
        let mut trails = Vec::new();
        for i in 0..6 {
            trails.push(trail(
                &format!("p{i}"),
                &["novo", "em_analise", "aprovado"],
                50.0,
                10.0,
            ));
        }
        // One process took 200 hours
        trails.push(trail("slow", &["novo", "em_analise", "aprovado"], 400.0, 100.0));

        let outliers = detect_outliers_in(&trails, 2.0);
        assert_eq!(outliers.len(), 1);
        assert_eq!(outliers[0].process_id, "slow");
        assert_eq!(outliers[0].kind, OutlierKind::TooLong);
        assert!(outliers[0].z_score >= 2.0);
    }

    #[test]
    fn test_small_corpus_yields_no_outliers() {
        let trails = vec![
            trail("a", &["novo", "aprovado"], 10.0, 1.0),
            trail("b", &["novo", "aprovado"], 10.0, 9.0),
        ];
        assert!(detect_outliers_in(&trails, 2.0).is_empty());
    }

    #[test]
    fn test_loop_detection_bounds() {
        let trails = vec![
            trail("looper", &["novo", "em_analise", "novo", "em_analise"], 40.0, 10.0),
            trail("clean", &["novo", "em_analise", "aprovado"], 40.0, 10.0),
        ];

        let anomalies = detect_loops_in(&trails, 3);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].process_id, "looper");
        assert!(anomalies[0]
            .loops
            .iter()
            .all(|l| l.size <= 3 && l.states.first() == l.states.last()));

        // A window larger than the bound is not reported
        let wide = vec![trail(
            "wide",
            &["a", "b", "c", "d", "e", "a"],
            60.0,
            10.0,
        )];
        assert!(detect_loops_in(&wide, 3).is_empty());
    }

    #[test]
    fn test_rare_transitions() {
        let mut trails = Vec::new();
        for i in 0..20 {
            trails.push(trail(
                &format!("p{i}"),
                &["novo", "em_analise", "aprovado"],
                30.0,
                10.0,
            ));
        }
        // One process jumped straight to aprovado
        trails.push(trail("jumper", &["novo", "aprovado"], 30.0, 10.0));

        let anomalies = detect_rare_in(&trails, 0.05);
        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].process_id, "jumper");
        let rare = &anomalies[0].unusual_transitions[0];
        assert_eq!(rare.from_state, "novo");
        assert_eq!(rare.to_state, "aprovado");
        assert!(rare.occurrence_rate < 0.05);
    }
}
