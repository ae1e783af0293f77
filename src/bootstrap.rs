//! Unsupervised starting partition: k-means over aggregated track embeddings.
//!
//! The result is advisory. It never sets a label; the categorizer may use it
//! to spread its seed roots across clusters.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::Rng;
use thiserror::Error;

use crate::classifier::model::seeded_rng;
use crate::track::{TrackArena, TrackId};

#[derive(Error, Debug, PartialEq)]
pub enum BootstrapError {
    #[error("Number of clusters must be at least 1")]
    ZeroClusters,
    #[error("Cannot form {k} clusters from {tracks} tracks")]
    TooManyClusters { k: usize, tracks: usize },
    #[error("No tracks to cluster")]
    Empty,
}

#[derive(Debug, Clone)]
pub struct BootstrapResult {
    pub assignments: BTreeMap<TrackId, usize>,
    pub iterations: usize,
    /// Sum of squared distances to the assigned centroid.
    pub inertia: f64,
}

impl BootstrapResult {
    pub fn cluster_sizes(&self, k: usize) -> Vec<usize> {
        let mut sizes = vec![0; k];
        for &c in self.assignments.values() {
            sizes[c] += 1;
        }
        sizes
    }
}

/// Partition the arena's tracks into `k` clusters.
///
/// Vectors are L2-normalized so clusters follow the cosine geometry used for
/// similarity. Seeding is k-means++ from `seed`; Lloyd iterations stop when
/// assignments settle or after `max_iter`.
pub fn bootstrap(arena: &TrackArena, k: usize, seed: u64, max_iter: usize) -> Result<BootstrapResult, BootstrapError> {
    if k == 0 {
        return Err(BootstrapError::ZeroClusters);
    }
    if arena.is_empty() {
        return Err(BootstrapError::Empty);
    }
    if k > arena.len() {
        return Err(BootstrapError::TooManyClusters { k, tracks: arena.len() });
    }

    let points = unit_vectors(arena);
    let mut centroids = plus_plus_init(&points, k, seed);
    let mut assignments = vec![usize::MAX; points.nrows()];
    let mut iterations = 0;

    for _ in 0..max_iter.max(1) {
        iterations += 1;
        let mut changed = false;
        for (i, point) in points.rows().into_iter().enumerate() {
            let c = nearest_centroid(point, &centroids).0;
            if assignments[i] != c {
                assignments[i] = c;
                changed = true;
            }
        }
        if !changed {
            break;
        }

        for c in 0..k {
            let members: Vec<usize> = (0..points.nrows()).filter(|&i| assignments[i] == c).collect();
            // An empty cluster keeps its previous centroid
            if let Some(mean) = points.select(Axis(0), &members).mean_axis(Axis(0)) {
                centroids.row_mut(c).assign(&mean);
            }
        }
    }

    let inertia = points
        .rows()
        .into_iter()
        .map(|p| nearest_centroid(p, &centroids).1)
        .sum();

    log::info!("k-means: {} clusters, {} iterations, inertia {:.4}", k, iterations, inertia);

    Ok(BootstrapResult {
        assignments: arena.ids().zip(assignments).collect(),
        iterations,
        inertia,
    })
}

fn unit_vectors(arena: &TrackArena) -> Array2<f64> {
    let dim = arena.iter().map(|t| t.embedding.aggregated.len()).max().unwrap_or(0);
    let mut points = Array2::<f64>::zeros((arena.len(), dim));
    for (mut row, track) in points.rows_mut().into_iter().zip(arena.iter()) {
        let v: Array1<f64> = track.embedding.aggregated.mapv(f64::from);
        let norm = v.dot(&v).sqrt();
        if norm > 1e-10 && v.len() == dim {
            row.assign(&(v / norm));
        }
    }
    points
}

/// k-means++: the first centroid uniformly, then each next one with
/// probability proportional to its squared distance from the chosen ones.
fn plus_plus_init(points: &Array2<f64>, k: usize, seed: u64) -> Array2<f64> {
    let mut rng = seeded_rng(seed);
    let n = points.nrows();
    let mut centroids = Array2::<f64>::zeros((k, points.ncols()));

    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&points.row(first));

    for c in 1..k {
        let chosen = centroids.slice(ndarray::s![..c, ..]).to_owned();
        let weights: Vec<f64> = points
            .rows()
            .into_iter()
            .map(|p| nearest_centroid(p, &chosen).1)
            .collect();
        let total: f64 = weights.iter().sum();

        let pick = if total <= 0.0 {
            // Every point coincides with a centroid already
            rng.gen_range(0..n)
        } else {
            let mut target = rng.gen_range(0.0..total);
            let mut pick = n - 1;
            for (i, w) in weights.iter().enumerate() {
                if target < *w {
                    pick = i;
                    break;
                }
                target -= w;
            }
            pick
        };
        centroids.row_mut(c).assign(&points.row(pick));
    }
    centroids
}

/// (index, squared distance) of the closest centroid. Ties go to the lower index.
fn nearest_centroid(point: ArrayView1<f64>, centroids: &Array2<f64>) -> (usize, f64) {
    let mut best = (0, f64::INFINITY);
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d: f64 = point
            .iter()
            .zip(centroid.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum();
        if d < best.1 {
            best = (c, d);
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Embedding, Track};

    fn arena(vectors: &[[f32; 3]]) -> TrackArena {
        let mut arena = TrackArena::new();
        for (i, v) in vectors.iter().enumerate() {
            let collapsed = Array2::from_shape_vec((1, 3), v.to_vec()).unwrap();
            let embedding = Embedding::from_collapsed(collapsed).unwrap();
            arena
                .insert(Track::new(format!("k{i}"), format!("t{i}"), format!("/m/t{i}"), embedding))
                .unwrap();
        }
        arena
    }

    fn groups() -> TrackArena {
        arena(&[
            [1.0, 0.05, 0.0],
            [0.9, 0.0, 0.1],
            [1.1, 0.1, 0.0],
            [0.0, 0.1, 1.0],
            [0.1, 0.0, 0.9],
            [0.0, 0.05, 1.2],
        ])
    }

    #[test]
    fn test_separated_groups_are_recovered() {
        let result = bootstrap(&groups(), 2, 7, 50).unwrap();
        let labels: Vec<usize> = result.assignments.values().copied().collect();
        assert_eq!(labels[0], labels[1]);
        assert_eq!(labels[1], labels[2]);
        assert_eq!(labels[3], labels[4]);
        assert_eq!(labels[4], labels[5]);
        assert_ne!(labels[0], labels[3]);
        assert_eq!(result.cluster_sizes(2), vec![3, 3]);
        assert!(result.inertia < 0.1);
    }

    #[test]
    fn test_deterministic_for_seed() {
        let a = bootstrap(&groups(), 3, 11, 50).unwrap();
        let b = bootstrap(&groups(), 3, 11, 50).unwrap();
        assert_eq!(a.assignments, b.assignments);
        assert_eq!(a.inertia, b.inertia);
    }

    #[test]
    fn test_invalid_cluster_counts() {
        assert_eq!(bootstrap(&groups(), 0, 1, 10).unwrap_err(), BootstrapError::ZeroClusters);
        assert_eq!(
            bootstrap(&groups(), 7, 1, 10).unwrap_err(),
            BootstrapError::TooManyClusters { k: 7, tracks: 6 }
        );
        assert_eq!(bootstrap(&TrackArena::new(), 1, 1, 10).unwrap_err(), BootstrapError::Empty);
    }

    #[test]
    fn test_does_not_touch_labels() {
        let arena = groups();
        bootstrap(&arena, 2, 1, 10).unwrap();
        assert_eq!(arena.unlabeled().len(), 6);
    }

    #[test]
    fn test_one_cluster_per_track() {
        let result = bootstrap(&groups(), 6, 5, 20).unwrap();
        let mut sizes = result.cluster_sizes(6);
        sizes.sort();
        assert_eq!(sizes, vec![1; 6]);
        assert!(result.inertia.abs() < 1e-12);
    }
}
