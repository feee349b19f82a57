// Process feature extraction and k-means-style grouping

//! # Process Features
//!
//! Numeric feature vectors per process, used by reporting dashboards to
//! group comparable processes. This is deliberately *not* model training:
//! the only consumer is a small Lloyd's-iteration grouping over min-max
//! normalized vectors, whose output is a set of cluster summaries.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Datelike, Timelike, Utc};

use crate::analysis::{load_trails, ProcessTrail};
use crate::storage::repository::ProcessRepository;
use crate::Result;

/// One group produced by [`FeatureExtractor::group`].
#[derive(Debug, Clone)]
pub struct FeatureGroup {
    pub members: Vec<String>,
    /// Mean feature vector of the group, in original (unnormalized) units
    pub centroid: BTreeMap<String, f64>,
}

/// Extracts feature vectors and groups processes for reporting.
pub struct FeatureExtractor {
    repo: Arc<ProcessRepository>,
}

impl FeatureExtractor {
    pub fn new(repo: Arc<ProcessRepository>) -> Self {
        FeatureExtractor { repo }
    }

    /// The feature vector of one process trail. Keys are stable across
    /// processes, so vectors are directly comparable.
    pub fn extract(&self, trail: &ProcessTrail) -> BTreeMap<String, f64> {
        let now = Utc::now();
        let process = &trail.process;

        let duration = trail.total_duration_hours(now).max(0.0);
        let transitions = trail
            .entries
            .iter()
            .filter(|e| e.is_transition())
            .count();

        let mut unique_states: Vec<String> = trail.sequence();
        unique_states.sort();
        unique_states.dedup();

        let loop_count = {
            let sequence = trail.sequence();
            let mut seen = std::collections::HashSet::new();
            sequence.iter().filter(|s| !seen.insert(s.as_str())).count()
        };

        let sla_pressure = process
            .sla
            .as_ref()
            .and_then(|sla| sla.deadline)
            .map(|deadline| {
                let total = (deadline - process.created_at).num_seconds() as f64;
                if total <= 0.0 {
                    1.0
                } else {
                    let elapsed = (now - process.created_at).num_seconds() as f64;
                    (elapsed / total).max(0.0)
                }
            })
            .unwrap_or(0.0);

        BTreeMap::from([
            ("duration_hours".to_string(), duration),
            ("log_duration_hours".to_string(), (duration + 1.0).ln()),
            ("transition_count".to_string(), transitions as f64),
            (
                "unique_states_count".to_string(),
                unique_states.len() as f64,
            ),
            (
                "field_completeness".to_string(),
                process.field_completeness(),
            ),
            ("tag_count".to_string(), process.tags.len() as f64),
            (
                "created_hour_of_day".to_string(),
                process.created_at.hour() as f64,
            ),
            (
                "created_day_of_week".to_string(),
                process.created_at.weekday().num_days_from_monday() as f64,
            ),
            ("loop_count".to_string(), loop_count as f64),
            ("sla_pressure".to_string(), sla_pressure),
        ])
    }

    /// Feature vectors for every process in a kanban.
    pub async fn extract_all(
        &self,
        kanban_id: &str,
    ) -> Result<Vec<(String, BTreeMap<String, f64>)>> {
        let trails = load_trails(&self.repo, kanban_id).await?;
        Ok(trails
            .iter()
            .map(|t| (t.process.process_id.clone(), self.extract(t)))
            .collect())
    }

    /// Group a kanban's processes into at most `k` clusters by feature
    /// similarity. Deterministic: evenly spaced initial centroids over the
    /// id-sorted corpus, a fixed number of Lloyd iterations.
    pub async fn group(
        &self,
        kanban_id: &str,
        k: usize,
        iterations: usize,
    ) -> Result<Vec<FeatureGroup>> {
        let mut vectors = self.extract_all(kanban_id).await?;
        vectors.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(kmeans_group(&vectors, k, iterations))
    }
}

/// Lloyd's iterations over min-max normalized vectors.
fn kmeans_group(
    vectors: &[(String, BTreeMap<String, f64>)],
    k: usize,
    iterations: usize,
) -> Vec<FeatureGroup> {
    if vectors.is_empty() || k == 0 {
        return Vec::new();
    }
    let k = k.min(vectors.len());

    let keys: Vec<&String> = vectors[0].1.keys().collect();
    let dim = keys.len();

    // Min-max normalize each dimension to [0, 1]
    let mut mins = vec![f64::INFINITY; dim];
    let mut maxs = vec![f64::NEG_INFINITY; dim];
    let raw: Vec<Vec<f64>> = vectors
        .iter()
        .map(|(_, features)| keys.iter().map(|k| features[*k]).collect())
        .collect();
    for point in &raw {
        for (d, v) in point.iter().enumerate() {
            mins[d] = mins[d].min(*v);
            maxs[d] = maxs[d].max(*v);
        }
    }
    let normalized: Vec<Vec<f64>> = raw
        .iter()
        .map(|point| {
            point
                .iter()
                .enumerate()
                .map(|(d, v)| {
                    let range = maxs[d] - mins[d];
                    if range > 0.0 {
                        (v - mins[d]) / range
                    } else {
                        0.0
                    }
                })
                .collect()
        })
        .collect();

    // Evenly spaced initial centroids
    let mut centroids: Vec<Vec<f64>> = (0..k)
        .map(|i| normalized[i * normalized.len() / k].clone())
        .collect();
    let mut assignment = vec![0usize; normalized.len()];

    for _ in 0..iterations.max(1) {
        // Assign
        for (i, point) in normalized.iter().enumerate() {
            assignment[i] = centroids
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    squared_distance(point, a)
                        .partial_cmp(&squared_distance(point, b))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(idx, _)| idx)
                .unwrap_or(0);
        }

        // Recompute
        for (c, centroid) in centroids.iter_mut().enumerate() {
            let members: Vec<&Vec<f64>> = normalized
                .iter()
                .zip(&assignment)
                .filter(|(_, a)| **a == c)
                .map(|(p, _)| p)
                .collect();
            if members.is_empty() {
                continue;
            }
            for d in 0..dim {
                centroid[d] = members.iter().map(|p| p[d]).sum::<f64>() / members.len() as f64;
            }
        }
    }

    (0..k)
        .filter_map(|c| {
            let member_idx: Vec<usize> = assignment
                .iter()
                .enumerate()
                .filter(|(_, a)| **a == c)
                .map(|(i, _)| i)
                .collect();
            if member_idx.is_empty() {
                return None;
            }

            // Centroid reported in original units
            let centroid = keys
                .iter()
                .enumerate()
                .map(|(d, key)| {
                    let avg = member_idx.iter().map(|&i| raw[i][d]).sum::<f64>()
                        / member_idx.len() as f64;
                    ((*key).clone(), avg)
                })
                .collect();

            Some(FeatureGroup {
                members: member_idx
                    .iter()
                    .map(|&i| vectors[i].0.clone())
                    .collect(),
                centroid,
            })
        })
        .collect()
}

fn squared_distance(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum()
}
