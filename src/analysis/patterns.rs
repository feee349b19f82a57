// Pattern analyzer - frequent sequences, transition matrix, durations

//! # Pattern Analyzer
//!
//! Sequential pattern mining over process histories. Support counts how
//! often a contiguous state subsequence occurs relative to the number of
//! processes; confidence is the conditional probability of a pattern's
//! terminal state given its prefix across the corpus. Durations come from
//! pairing consecutive audit entries of each process.
//!
//! These statistics feed the pattern agent, the dashboards and the
//! bottleneck report.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;

use crate::analysis::{load_trails, mean, std_dev, ProcessTrail};
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// Patterns span contiguous subsequences of 2 to this many states.
const MAX_PATTERN_LEN: usize = 5;

/// One mined pattern with its corpus statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct PatternStat {
    pub pattern: Vec<String>,
    /// Occurrences divided by process count
    pub support: f64,
    pub count: usize,
    /// Mean hours between the first and last state of the pattern
    pub avg_duration_hours: f64,
    /// P(last state | prefix)
    pub confidence: f64,
}

/// Patterns bucketed by [`PatternAnalyzer::classify`].
#[derive(Debug, Clone, Default)]
pub struct ClassifiedPatterns {
    pub common: Vec<PatternStat>,
    pub problematic: Vec<PatternStat>,
    pub exceptional: Vec<PatternStat>,
}

/// Per-state dwell statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct DurationStats {
    pub avg_hours: f64,
    pub min_hours: f64,
    pub max_hours: f64,
    pub std_dev: f64,
    pub sample_count: usize,
}

/// A process similar to a reference process.
#[derive(Debug, Clone)]
pub struct SimilarProcess {
    pub process_id: String,
    /// Jaccard similarity over directed-transition sets
    pub similarity: f64,
    pub common_transitions: Vec<String>,
}

/// Analyzer over one repository's audit trail.
pub struct PatternAnalyzer {
    repo: Arc<ProcessRepository>,
}

impl PatternAnalyzer {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        PatternAnalyzer { repo }
    }

    /// The state sequence of every process in a kanban.
    pub async fn sequences_of(&self, kanban_id: &str) -> Result<Vec<Vec<String>>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(trails.iter().map(ProcessTrail::sequence).collect())
    }

    /// Mine patterns with at least `min_support`, sorted by support
    /// descending.
    pub async fn frequent_patterns(
        &self,
        kanban_id: &str,
        min_support: f64,
    ) -> Result<Vec<PatternStat>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(mine_patterns(&trails, min_support))
    }

    /// Bucket patterns: **problematic** when the terminal state names a
    /// failure (cancel / reject / fail / error, case-insensitive), else
    /// **common** above `common_threshold`, **exceptional** below
    /// `exceptional_threshold`.
    pub fn classify(
        &self,
        patterns: &[PatternStat],
        common_threshold: f64,
        exceptional_threshold: f64,
    ) -> ClassifiedPatterns {
        let mut classified = ClassifiedPatterns::default();

        for stat in patterns {
            let last = stat
                .pattern
                .last()
                .map(|s| s.to_lowercase())
                .unwrap_or_default();
            let problematic = ["cancel", "reject", "fail", "error"]
                .iter()
                .any(|word| last.contains(word));

            if problematic {
                classified.problematic.push(stat.clone());
            } else if stat.support >= common_threshold {
                classified.common.push(stat.clone());
            } else if stat.support <= exceptional_threshold {
                classified.exceptional.push(stat.clone());
            }
        }
        classified
    }

    /// Per-state probability distribution over successor states. Every
    /// row sums to 1.
    pub async fn transition_matrix(
        &self,
        kanban_id: &str,
    ) -> Result<HashMap<String, HashMap<String, f64>>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(build_matrix(&trails))
    }

    /// Dwell statistics per state.
    pub async fn state_durations(
        &self,
        kanban_id: &str,
    ) -> Result<HashMap<String, DurationStats>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(duration_stats(&trails))
    }

    /// Processes most similar to `process_id` by shared transitions.
    pub async fn similar_processes(
        &self,
        process_id: &str,
        kanban_id: &str,
        limit: usize,
    ) -> Result<Vec<SimilarProcess>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(find_similar(&trails, process_id, limit))
    }
}

// ========== Pure computations ==========

pub(crate) fn mine_patterns(trails: &[ProcessTrail], min_support: f64) -> Vec<PatternStat> {
    if trails.is_empty() {
        return Vec::new();
    }

    let sequences: Vec<Vec<String>> = trails.iter().map(ProcessTrail::sequence).collect();

    // Count every contiguous subsequence of length 2..=5
    let mut counts: HashMap<Vec<String>, usize> = HashMap::new();
    for sequence in &sequences {
        let max_len = MAX_PATTERN_LEN.min(sequence.len());
        for len in 2..=max_len {
            for window in sequence.windows(len) {
                *counts.entry(window.to_vec()).or_default() += 1;
            }
        }
    }

    let total = sequences.len() as f64;
    let mut stats: Vec<PatternStat> = counts
        .into_iter()
        .filter_map(|(pattern, count)| {
            let support = count as f64 / total;
            if support < min_support {
                return None;
            }
            let durations = pattern_durations(&pattern, trails);
            Some(PatternStat {
                confidence: pattern_confidence(&pattern, &sequences),
                avg_duration_hours: mean(&durations),
                support,
                count,
                pattern,
            })
        })
        .collect();

    stats.sort_by(|a, b| {
        b.support
            .partial_cmp(&a.support)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.pattern.cmp(&b.pattern))
    });
    stats
}

/// Hours between entering the first and entering the last state of each
/// pattern occurrence.
fn pattern_durations(pattern: &[String], trails: &[ProcessTrail]) -> Vec<f64> {
    let mut durations = Vec::new();

    for trail in trails {
        let timed = timed_sequence(trail);
        if timed.len() < pattern.len() {
            continue;
        }

        for window in timed.windows(pattern.len()) {
            let matches = pattern
                .iter()
                .zip(window.iter())
                .all(|(state, (entered, _))| state == entered);
            if matches {
                let first = window[0].1;
                let last = window[pattern.len() - 1].1;
                durations.push((last - first).num_seconds() as f64 / 3600.0);
            }
        }
    }
    durations
}

/// The state sequence of a trail with the time each state was entered.
fn timed_sequence(trail: &ProcessTrail) -> Vec<(String, chrono::DateTime<Utc>)> {
    let mut timed = Vec::new();
    for entry in &trail.entries {
        if timed.is_empty() {
            if let Some(from) = &entry.from_state {
                timed.push((from.clone(), trail.process.created_at));
            }
        }
        if let Some(to) = &entry.to_state {
            timed.push((to.clone(), entry.timestamp));
        }
    }
    timed
}

/// P(full pattern | its prefix) across every prefix occurrence.
fn pattern_confidence(pattern: &[String], sequences: &[Vec<String>]) -> f64 {
    if pattern.len() < 2 {
        return 1.0;
    }

    let prefix = &pattern[..pattern.len() - 1];
    let mut prefix_count = 0usize;
    let mut full_count = 0usize;

    for sequence in sequences {
        if sequence.len() < prefix.len() {
            continue;
        }
        for start in 0..=(sequence.len() - prefix.len()) {
            if &sequence[start..start + prefix.len()] == prefix {
                prefix_count += 1;
                if start + pattern.len() <= sequence.len()
                    && sequence[start..start + pattern.len()] == *pattern
                {
                    full_count += 1;
                }
            }
        }
    }

    if prefix_count == 0 {
        0.0
    } else {
        full_count as f64 / prefix_count as f64
    }
}

pub(crate) fn build_matrix(trails: &[ProcessTrail]) -> HashMap<String, HashMap<String, f64>> {
    let mut counts: HashMap<String, HashMap<String, usize>> = HashMap::new();
    let mut totals: HashMap<String, usize> = HashMap::new();

    for trail in trails {
        for entry in &trail.entries {
            if let (Some(from), Some(to)) = (&entry.from_state, &entry.to_state) {
                *counts
                    .entry(from.clone())
                    .or_default()
                    .entry(to.clone())
                    .or_default() += 1;
                *totals.entry(from.clone()).or_default() += 1;
            }
        }
    }

    counts
        .into_iter()
        .map(|(from, row)| {
            let total = totals[&from] as f64;
            let probabilities = row
                .into_iter()
                .map(|(to, count)| (to, count as f64 / total))
                .collect();
            (from, probabilities)
        })
        .collect()
}

pub(crate) fn duration_stats(trails: &[ProcessTrail]) -> HashMap<String, DurationStats> {
    let now = Utc::now();
    let mut samples: HashMap<String, Vec<f64>> = HashMap::new();

    for trail in trails {
        let entries = &trail.entries;
        for (i, entry) in entries.iter().enumerate() {
            let Some(from) = &entry.from_state else {
                continue;
            };
            let end = entries
                .get(i + 1)
                .map(|next| next.timestamp)
                .unwrap_or(now);
            let hours = (end - entry.timestamp).num_seconds() as f64 / 3600.0;
            samples.entry(from.clone()).or_default().push(hours);
        }
    }

    samples
        .into_iter()
        .map(|(state, durations)| {
            let stats = DurationStats {
                avg_hours: mean(&durations),
                min_hours: durations.iter().cloned().fold(f64::INFINITY, f64::min),
                max_hours: durations.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
                std_dev: std_dev(&durations),
                sample_count: durations.len(),
            };
            (state, stats)
        })
        .collect()
}

pub(crate) fn find_similar(
    trails: &[ProcessTrail],
    process_id: &str,
    limit: usize,
) -> Vec<SimilarProcess> {
    let Some(target) = trails.iter().find(|t| t.process.process_id == process_id) else {
        return Vec::new();
    };

    let target_set: std::collections::HashSet<String> =
        target.transition_keys().into_iter().collect();
    if target_set.is_empty() {
        return Vec::new();
    }

    let mut similar: Vec<SimilarProcess> = trails
        .iter()
        .filter(|t| t.process.process_id != process_id)
        .filter_map(|trail| {
            let set: std::collections::HashSet<String> =
                trail.transition_keys().into_iter().collect();
            if set.is_empty() {
                return None;
            }

            let intersection = target_set.intersection(&set).count();
            let union = target_set.union(&set).count();
            let similarity = intersection as f64 / union as f64;
            if similarity <= 0.0 {
                return None;
            }

            let mut common: Vec<String> = target_set.intersection(&set).cloned().collect();
            common.sort();

            Some(SimilarProcess {
                process_id: trail.process.process_id.clone(),
                similarity,
                common_transitions: common,
            })
        })
        .collect();

    similar.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    similar.truncate(limit);
    similar
}
