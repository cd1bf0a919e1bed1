use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use tracing::info;

use crate::db::store::FaceStore;
use crate::error::Result;
use crate::models::face::FaceId;
use crate::pipeline::events::{EventBus, FaceEvent};
use crate::pipeline::scheduler::PipelineKind;
use crate::stats::Stats;

#[derive(Debug, Clone, Copy)]
pub struct ClusterSettings {
    /// Neighbourhood radius, inclusive.
    pub epsilon: f32,
    /// Neighbours needed (the point itself included) for a core point.
    pub min_cluster_size: usize,
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self { epsilon: 1.0, min_cluster_size: 2 }
    }
}

/// `None` when the dimensions differ; such embeddings are never neighbours.
pub fn euclidean_distance(a: &[f32], b: &[f32]) -> Option<f32> {
    if a.len() != b.len() {
        return None;
    }
    Some(a.iter().zip(b).map(|(x, y)| (x - y) * (x - y)).sum::<f32>().sqrt())
}

fn neighbour_lists(points: &[&[f32]], epsilon: f32) -> Vec<Vec<usize>> {
    (0..points.len())
        .into_par_iter()
        .map(|i| {
            points
                .iter()
                .enumerate()
                .filter(|(_, other)| matches!(euclidean_distance(points[i], other), Some(d) if d <= epsilon))
                .map(|(j, _)| j)
                .collect()
        })
        .collect()
}

/// DBSCAN over `points`. Returns groups of indices; noise is left out.
/// Every group is sorted and groups are ordered by their first index.
pub fn dbscan(points: &[&[f32]], settings: &ClusterSettings) -> Vec<Vec<usize>> {
    let min_pts = settings.min_cluster_size.max(1);
    let neighbours = neighbour_lists(points, settings.epsilon);
    let is_core: Vec<bool> = neighbours.iter().map(|n| n.len() >= min_pts).collect();

    const UNASSIGNED: usize = usize::MAX;
    let mut label = vec![UNASSIGNED; points.len()];
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for start in 0..points.len() {
        if label[start] != UNASSIGNED || !is_core[start] {
            continue;
        }
        let group_id = groups.len();
        let mut members = vec![start];
        label[start] = group_id;
        let mut frontier = vec![start];
        while let Some(p) = frontier.pop() {
            for &q in &neighbours[p] {
                if label[q] != UNASSIGNED {
                    continue;
                }
                label[q] = group_id;
                members.push(q);
                // border points join but do not extend the group
                if is_core[q] {
                    frontier.push(q);
                }
            }
        }
        members.sort_unstable();
        groups.push(members);
    }
    groups
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterOutcome {
    /// Fewer than two unlabeled faces; nothing to compare.
    NotEnoughFaces(usize),
    Groups(Vec<Vec<FaceId>>),
}

impl ClusterOutcome {
    pub fn groups(&self) -> &[Vec<FaceId>] {
        match self {
            ClusterOutcome::NotEnoughFaces(_) => &[],
            ClusterOutcome::Groups(groups) => groups,
        }
    }
}

/// Groups unlabeled faces that probably belong to the same person.
pub struct IdentityClusterer {
    store: Arc<dyn FaceStore>,
    events: EventBus,
    settings: ClusterSettings,
    stats: Option<Arc<Stats>>,
}

impl IdentityClusterer {
    pub fn new(store: Arc<dyn FaceStore>, events: EventBus, settings: ClusterSettings) -> Self {
        Self { store, events, settings, stats: None }
    }

    pub fn with_stats(mut self, stats: Arc<Stats>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn run(&self) -> Result<ClusterOutcome> {
        let started = Instant::now();
        let encodings = self.store.encodings_for_clustering()?;
        if encodings.len() < 2 {
            self.events.status(
                PipelineKind::Clustering,
                format!("Not enough unknown faces to group ({} found)", encodings.len()),
            );
            self.events.emit(FaceEvent::ClustersFound { groups: Vec::new() });
            return Ok(ClusterOutcome::NotEnoughFaces(encodings.len()));
        }

        let points: Vec<&[f32]> = encodings.iter().map(|(_, e)| e.as_slice()).collect();
        let mut groups: Vec<Vec<FaceId>> = dbscan(&points, &self.settings)
            .into_iter()
            .map(|members| {
                let mut ids: Vec<FaceId> = members.into_iter().map(|i| encodings[i].0).collect();
                ids.sort_unstable();
                ids
            })
            .collect();
        groups.sort_by_key(|g| g.first().copied());

        let grouped: usize = groups.iter().map(Vec::len).sum();
        info!(
            "Clustered {} faces into {} groups ({} left ungrouped) in {:?}",
            encodings.len(),
            groups.len(),
            encodings.len() - grouped,
            started.elapsed()
        );
        if let Some(stats) = &self.stats {
            stats.record_cluster_run(groups.len(), started.elapsed());
        }
        self.events.emit(FaceEvent::ClustersFound { groups: groups.clone() });
        Ok(ClusterOutcome::Groups(groups))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(points: &[Vec<f32>], epsilon: f32, min_cluster_size: usize) -> Vec<Vec<usize>> {
        let refs: Vec<&[f32]> = points.iter().map(|p| p.as_slice()).collect();
        dbscan(&refs, &ClusterSettings { epsilon, min_cluster_size })
    }

    #[test]
    fn distance_requires_equal_dimensions() {
        assert_eq!(euclidean_distance(&[0.0, 0.0], &[3.0, 4.0]), Some(5.0));
        assert_eq!(euclidean_distance(&[0.0], &[0.0, 0.0]), None);
    }

    #[test]
    fn chains_within_epsilon_share_a_group() {
        // 0-1 and 1-2 are within reach, 0-2 is not.
        let points = vec![vec![0.0], vec![0.9], vec![1.8], vec![10.0]];
        assert_eq!(run(&points, 1.0, 2), vec![vec![0, 1, 2]]);
    }

    #[test]
    fn epsilon_boundary_is_inclusive() {
        let points = vec![vec![0.0, 0.0], vec![3.0, 4.0]];
        assert_eq!(run(&points, 5.0, 2), vec![vec![0, 1]]);
        assert!(run(&points, 4.99, 2).is_empty());
    }

    #[test]
    fn border_points_do_not_bridge_groups() {
        let chain = vec![vec![0.0], vec![0.5], vec![1.0], vec![1.5], vec![2.0]];
        assert_eq!(run(&chain, 0.6, 3), vec![vec![0, 1, 2, 3, 4]]);

        // index 3 sits between two cores but has only three neighbours itself
        let points = vec![vec![-2.0], vec![-1.5], vec![-1.0], vec![0.0], vec![1.0], vec![1.5], vec![2.0]];
        assert_eq!(run(&points, 1.0, 4), vec![vec![0, 1, 2, 3], vec![4, 5, 6]]);
    }

    #[test]
    fn mixed_dimensions_never_group() {
        let points = vec![vec![0.0], vec![0.0, 0.0]];
        assert!(run(&points, 1.0, 2).is_empty());
    }

    #[test]
    fn min_size_one_keeps_singletons() {
        let points = vec![vec![0.0], vec![5.0]];
        assert_eq!(run(&points, 1.0, 1), vec![vec![0], vec![1]]);
    }
}
