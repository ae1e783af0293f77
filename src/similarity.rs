use std::collections::HashMap;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{Array2, ArrayView2, Axis, s};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::db::models::SimilarityCache;
use crate::db::{Database, DbError};
use crate::track::TrackArena;

#[derive(Error, Debug)]
pub enum SimilarityError {
    #[error("Cached similarity matrix covers '{key}', which is no longer in the library (run with --rebuild)")]
    StaleCache { key: String },
    #[error("Cached similarity matrix was built with {cached} aggregation, not {requested} (run with --rebuild)")]
    AggregationMismatch {
        cached: Aggregation,
        requested: Aggregation,
    },
    #[error("Cached similarity matrix is incomplete: no distance between '{a}' and '{b}'")]
    IncompleteCache { a: String, b: String },
    #[error("Embedding dimension mismatch: '{name}' has {got}, expected {expected}")]
    DimensionMismatch {
        name: String,
        expected: usize,
        got: usize,
    },
    #[error("Matrix shape {rows}x{cols} does not match {tracks} tracks")]
    Shape { rows: usize, cols: usize, tracks: usize },
    #[error("Unknown track: {0}")]
    UnknownTrack(String),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// How a pair's block of row-to-row distances is reduced to one value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Mean,
    Median,
}

impl Aggregation {
    fn reduce(self, block: ArrayView2<f64>) -> f64 {
        match self {
            Aggregation::Mean => block.mean().unwrap_or(f64::NAN),
            Aggregation::Median => {
                let mut values: Vec<f64> = block.iter().copied().collect();
                if values.is_empty() {
                    return f64::NAN;
                }
                values.sort_by(f64::total_cmp);
                let mid = values.len() / 2;
                if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) / 2.0
                } else {
                    values[mid]
                }
            }
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Aggregation::Mean => "mean",
            Aggregation::Median => "median",
        })
    }
}

impl FromStr for Aggregation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mean" => Ok(Aggregation::Mean),
            "median" => Ok(Aggregation::Median),
            other => Err(format!("unknown aggregation '{other}' (expected mean or median)")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Neighbor {
    pub name: String,
    pub key: String,
    pub distance: f64,
}

/// Symmetric track × track cosine-distance matrix with a `NaN` diagonal.
/// Positions follow `keys`; names and keys both resolve to a position.
#[derive(Debug, Clone)]
pub struct SimilarityMatrix {
    aggregation: Aggregation,
    keys: Vec<String>,
    names: Vec<String>,
    index: HashMap<String, usize>,
    by_name: HashMap<String, usize>,
    distances: Array2<f64>,
}

impl SimilarityMatrix {
    pub fn empty() -> Self {
        Self {
            aggregation: Aggregation::default(),
            keys: Vec::new(),
            names: Vec::new(),
            index: HashMap::new(),
            by_name: HashMap::new(),
            distances: Array2::zeros((0, 0)),
        }
    }

    pub fn from_parts(keys: Vec<String>, names: Vec<String>, distances: Array2<f64>) -> Result<Self, SimilarityError> {
        let n = keys.len();
        if names.len() != n || distances.dim() != (n, n) {
            return Err(SimilarityError::Shape {
                rows: distances.nrows(),
                cols: distances.ncols(),
                tracks: n,
            });
        }
        let index = keys.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
        let by_name = names.iter().enumerate().map(|(i, k)| (k.clone(), i)).collect();
        Ok(Self {
            aggregation: Aggregation::default(),
            keys,
            names,
            index,
            by_name,
            distances,
        })
    }

    /// Rebuild a stored matrix. Every off-diagonal pair must be present.
    pub fn from_cache(cache: SimilarityCache) -> Result<Self, SimilarityError> {
        let matrix = Self::from_parts(cache.keys, cache.names, cache.distances)?.with_aggregation(cache.aggregation);
        for ((i, j), d) in matrix.distances.indexed_iter() {
            if i < j && d.is_nan() {
                return Err(SimilarityError::IncompleteCache {
                    a: matrix.names[i].clone(),
                    b: matrix.names[j].clone(),
                });
            }
        }
        Ok(matrix)
    }

    /// Tag the matrix with the reduction its distances were built with.
    pub fn with_aggregation(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }

    pub fn aggregation(&self) -> Aggregation {
        self.aggregation
    }

    /// Fails when a non-empty `self` was reduced differently from `requested`.
    pub fn check_aggregation(&self, requested: Aggregation) -> Result<(), SimilarityError> {
        if !self.is_empty() && self.aggregation != requested {
            return Err(SimilarityError::AggregationMismatch {
                cached: self.aggregation,
                requested,
            });
        }
        Ok(())
    }

    /// Full computation over every track in the arena.
    pub fn compute(arena: &TrackArena, aggregation: Aggregation) -> Result<Self, SimilarityError> {
        Self::merge(&Self::empty(), arena, aggregation)
    }

    /// Extend `cached` to cover every track in `arena`.
    ///
    /// The row-level distance matrix always spans all tracks, but only pairs
    /// involving a track missing from `cached` are reduced; the rest are
    /// copied. A cached key absent from the arena is a `StaleCache` error, and
    /// a cache reduced with another aggregation is an `AggregationMismatch`.
    pub fn merge(cached: &SimilarityMatrix, arena: &TrackArena, aggregation: Aggregation) -> Result<Self, SimilarityError> {
        cached.check_aggregation(aggregation)?;
        for key in &cached.keys {
            if arena.id_of_key(key).is_none() {
                return Err(SimilarityError::StaleCache { key: key.clone() });
            }
        }

        let n = arena.len();
        let keys: Vec<String> = arena.iter().map(|t| t.key.clone()).collect();
        let names: Vec<String> = arena.iter().map(|t| t.name.clone()).collect();
        let old_pos: Vec<Option<usize>> = keys.iter().map(|k| cached.index.get(k).copied()).collect();
        let new_count = old_pos.iter().filter(|p| p.is_none()).count();

        let mut distances = Array2::from_elem((n, n), f64::NAN);

        if new_count > 0 {
            let (rows, ranges) = stack_rows(arena)?;
            let row_distances = cosine_distances(&rows);

            let pairs: Vec<(usize, usize)> = (0..n)
                .flat_map(|i| (i + 1..n).map(move |j| (i, j)))
                .filter(|&(i, j)| old_pos[i].is_none() || old_pos[j].is_none())
                .collect();

            log::info!(
                "Reducing {} track pairs ({} new tracks, {} rows, {})",
                pairs.len(),
                new_count,
                rows.nrows(),
                aggregation
            );

            let pb = ProgressBar::new(pairs.len() as u64);
            pb.set_style(
                ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} pairs ({eta})")
                    .unwrap()
                    .progress_chars("#>-"),
            );

            let reduced: Vec<(usize, usize, f64)> = pairs
                .par_iter()
                .map(|&(i, j)| {
                    let block = row_distances.slice(s![ranges[i].clone(), ranges[j].clone()]);
                    let d = aggregation.reduce(block);
                    pb.inc(1);
                    (i, j, d)
                })
                .collect();
            pb.finish_and_clear();

            for (i, j, d) in reduced {
                distances[[i, j]] = d;
                distances[[j, i]] = d;
            }
        }

        for i in 0..n {
            for j in i + 1..n {
                if let (Some(a), Some(b)) = (old_pos[i], old_pos[j]) {
                    let d = cached.distances[[a, b]];
                    distances[[i, j]] = d;
                    distances[[j, i]] = d;
                }
            }
        }

        Ok(Self::from_parts(keys, names, distances)?.with_aggregation(aggregation))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn keys(&self) -> &[String] {
        &self.keys
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn covers(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn distances(&self) -> &Array2<f64> {
        &self.distances
    }

    /// Distance between two tracks by name; `None` if either is unknown or a == b.
    pub fn distance(&self, a: &str, b: &str) -> Option<f64> {
        let i = *self.by_name.get(a)?;
        let j = *self.by_name.get(b)?;
        let d = self.distances[[i, j]];
        (!d.is_nan()).then_some(d)
    }

    /// The `n` closest tracks to `name`, ascending by distance, ties by name.
    pub fn nearest(&self, name: &str, n: usize) -> Result<Vec<Neighbor>, SimilarityError> {
        let i = *self
            .by_name
            .get(name)
            .ok_or_else(|| SimilarityError::UnknownTrack(name.to_string()))?;

        let mut candidates: Vec<(f64, usize)> = self
            .distances
            .row(i)
            .iter()
            .enumerate()
            .filter(|&(j, d)| j != i && !d.is_nan())
            .map(|(j, &d)| (d, j))
            .collect();
        candidates.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| self.names[a.1].cmp(&self.names[b.1])));

        Ok(candidates
            .into_iter()
            .take(n)
            .map(|(distance, j)| Neighbor {
                name: self.names[j].clone(),
                key: self.keys[j].clone(),
                distance,
            })
            .collect())
    }

    /// Copy of the matrix with one track's row and column removed.
    pub fn without(&self, key: &str) -> Self {
        let Some(&drop) = self.index.get(key) else {
            return self.clone();
        };
        let keep: Vec<usize> = (0..self.len()).filter(|&i| i != drop).collect();
        let distances = self.distances.select(Axis(0), &keep).select(Axis(1), &keep);
        let keys = keep.iter().map(|&i| self.keys[i].clone()).collect();
        let names = keep.iter().map(|&i| self.names[i].clone()).collect();
        // Shapes come from `keep`, so this cannot fail
        Self::from_parts(keys, names, distances)
            .map(|m| m.with_aggregation(self.aggregation))
            .unwrap_or_else(|_| Self::empty())
    }

    /// Upper-triangle entries as (key a, key b, distance).
    pub fn pairs(&self) -> impl Iterator<Item = (&str, &str, f64)> {
        let n = self.len();
        (0..n).flat_map(move |i| {
            (i + 1..n).map(move |j| (self.keys[i].as_str(), self.keys[j].as_str(), self.distances[[i, j]]))
        })
    }
}

/// Stack every track's collapsed rows (as f64) and record each track's row range.
fn stack_rows(arena: &TrackArena) -> Result<(Array2<f64>, Vec<Range<usize>>), SimilarityError> {
    let dim = arena.iter().next().map(|t| t.embedding.dim()).unwrap_or(0);
    let total: usize = arena.iter().map(|t| t.embedding.collapsed.nrows()).sum();

    let mut rows = Array2::<f64>::zeros((total, dim));
    let mut ranges = Vec::with_capacity(arena.len());
    let mut start = 0;
    for track in arena.iter() {
        let collapsed = &track.embedding.collapsed;
        if collapsed.ncols() != dim {
            return Err(SimilarityError::DimensionMismatch {
                name: track.name.clone(),
                expected: dim,
                got: collapsed.ncols(),
            });
        }
        let end = start + collapsed.nrows();
        rows.slice_mut(s![start..end, ..]).assign(&collapsed.mapv(f64::from));
        ranges.push(start..end);
        start = end;
    }
    Ok((rows, ranges))
}

/// `1 - cos` between every pair of rows. A zero row is at distance 1 from everything.
fn cosine_distances(rows: &Array2<f64>) -> Array2<f64> {
    let mut unit = rows.clone();
    for mut row in unit.rows_mut() {
        let norm = row.dot(&row).sqrt();
        if norm > 1e-10 {
            row /= norm;
        } else {
            row.fill(0.0);
        }
    }
    unit.dot(&unit.t()).mapv(|sim| 1.0 - sim)
}

#[derive(Debug)]
pub struct SimilarityResult {
    pub tracks: usize,
    pub new_tracks: usize,
    pub pairs: usize,
    /// Tracks left out because their embedding failed.
    pub excluded: Vec<String>,
}

/// Bring the stored matrix up to date with every successfully analyzed track.
pub fn update_similarity(
    db: &Database,
    aggregation: Aggregation,
    rebuild: bool,
    jobs: usize,
) -> Result<SimilarityResult, SimilarityError> {
    let arena = db.build_arena()?;
    let excluded = db.failed_tracks()?;

    let cached = match db.load_similarity()? {
        Some(cache) if !rebuild => SimilarityMatrix::from_cache(cache)?,
        _ => SimilarityMatrix::empty(),
    };
    cached.check_aggregation(aggregation)?;
    let new_tracks = arena.iter().filter(|t| !cached.covers(&t.key)).count();

    if new_tracks == 0 && cached.len() == arena.len() {
        log::info!("Similarity matrix already covers all {} tracks", arena.len());
        return Ok(SimilarityResult {
            tracks: arena.len(),
            new_tracks: 0,
            pairs: 0,
            excluded,
        });
    }

    let pool = rayon::ThreadPoolBuilder::new().num_threads(jobs).build()?;
    let matrix = pool.install(|| SimilarityMatrix::merge(&cached, &arena, aggregation))?;

    let pairs = db.store_similarity(&matrix)?;
    Ok(SimilarityResult {
        tracks: matrix.len(),
        new_tracks,
        pairs,
        excluded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::track::{Embedding, Track};
    use ndarray::array;

    fn arena(tracks: &[(&str, Array2<f32>)]) -> TrackArena {
        let mut arena = TrackArena::new();
        for (name, collapsed) in tracks {
            let embedding = Embedding::from_collapsed(collapsed.clone()).unwrap();
            arena
                .insert(Track::new(format!("k-{name}"), *name, format!("/m/{name}"), embedding))
                .unwrap();
        }
        arena
    }

    fn sample() -> Vec<(&'static str, Array2<f32>)> {
        vec![
            ("A", array![[1.0, 0.0, 0.0], [0.9, 0.1, 0.0]]),
            ("B", array![[0.0, 1.0, 0.0]]),
            ("C", array![[0.5, 0.5, 0.1], [0.2, 0.7, 0.3], [0.1, 0.1, 0.9]]),
            ("D", array![[0.3, 0.0, 0.8], [0.0, 0.2, 0.6]]),
        ]
    }

    #[test]
    fn test_cosine_identical_orthogonal_opposite() {
        let rows = array![[1.0, 2.0, 3.0], [1.0, 2.0, 3.0], [-1.0, -2.0, -3.0], [-2.0, 1.0, 0.0]];
        let d = cosine_distances(&rows);
        assert!(d[[0, 1]].abs() < 1e-10);
        assert!((d[[0, 2]] - 2.0).abs() < 1e-10);
        assert!((d[[0, 3]] - 1.0).abs() < 1e-10);
    }

    #[test]
    fn test_zero_row_is_distance_one() {
        let rows = array![[0.0, 0.0], [1.0, 0.0]];
        let d = cosine_distances(&rows);
        assert!((d[[0, 1]] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_matrix_is_symmetric_with_nan_diagonal() {
        let m = SimilarityMatrix::compute(&arena(&sample()), Aggregation::Mean).unwrap();
        assert_eq!(m.len(), 4);
        let d = m.distances();
        for i in 0..4 {
            assert!(d[[i, i]].is_nan());
            for j in 0..4 {
                if i != j {
                    assert_eq!(d[[i, j]], d[[j, i]]);
                    assert!((0.0..=1.0).contains(&d[[i, j]]));
                }
            }
        }
    }

    #[test]
    fn test_identical_and_orthogonal_tracks() {
        let tracks = vec![
            ("x", array![[1.0, 0.0]]),
            ("y", array![[2.0, 0.0]]),
            ("z", array![[0.0, 3.0]]),
        ];
        let m = SimilarityMatrix::compute(&arena(&tracks), Aggregation::Mean).unwrap();
        assert!(m.distance("x", "y").unwrap().abs() < 1e-12);
        assert!((m.distance("x", "z").unwrap() - 1.0).abs() < 1e-12);
        assert_eq!(m.distance("x", "x"), None);
        assert_eq!(m.distance("x", "nope"), None);
    }

    #[test]
    fn test_incremental_merge_matches_full_computation() {
        let all = sample();
        for aggregation in [Aggregation::Mean, Aggregation::Median] {
            let full = SimilarityMatrix::compute(&arena(&all), aggregation).unwrap();
            let first = SimilarityMatrix::compute(&arena(&all[..3]), aggregation).unwrap();
            let merged = SimilarityMatrix::merge(&first, &arena(&all), aggregation).unwrap();

            assert_eq!(merged.keys(), full.keys());
            for (a, b, d) in full.pairs() {
                let i = merged.index[a];
                let j = merged.index[b];
                assert!((merged.distances[[i, j]] - d).abs() < 1e-12, "{a}-{b}");
            }
        }
    }

    #[test]
    fn test_merge_copies_cached_pairs() {
        let all = sample();
        let mut first = SimilarityMatrix::compute(&arena(&all[..2]), Aggregation::Mean).unwrap();
        // A cached value that a recomputation would never produce
        first.distances[[0, 1]] = 0.42;
        first.distances[[1, 0]] = 0.42;
        let merged = SimilarityMatrix::merge(&first, &arena(&all), Aggregation::Mean).unwrap();
        assert_eq!(merged.distance("A", "B"), Some(0.42));
    }

    #[test]
    fn test_merge_rejects_stale_cache() {
        let all = sample();
        let cached = SimilarityMatrix::compute(&arena(&all), Aggregation::Mean).unwrap();
        let err = SimilarityMatrix::merge(&cached, &arena(&all[..3]), Aggregation::Mean).unwrap_err();
        assert!(matches!(err, SimilarityError::StaleCache { ref key } if key == "k-D"));
    }

    #[test]
    fn test_dimension_mismatch() {
        let tracks = vec![("x", array![[1.0, 0.0]]), ("y", array![[1.0, 0.0, 0.0]])];
        let err = SimilarityMatrix::compute(&arena(&tracks), Aggregation::Mean).unwrap_err();
        assert!(matches!(err, SimilarityError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_median_differs_from_mean() {
        let block = array![[0.0, 0.1], [0.2, 0.9]];
        assert!((Aggregation::Mean.reduce(block.view()) - 0.3).abs() < 1e-12);
        assert!((Aggregation::Median.reduce(block.view()) - 0.15).abs() < 1e-12);
        let odd = array![[0.5, 0.1, 0.9]];
        assert_eq!(Aggregation::Median.reduce(odd.view()), 0.5);
    }

    #[test]
    fn test_nearest_orders_by_distance_then_name() {
        let tracks = vec![
            ("seed", array![[1.0, 0.0]]),
            ("b-same", array![[1.0, 0.0]]),
            ("a-same", array![[2.0, 0.0]]),
            ("far", array![[0.0, 1.0]]),
            ("mid", array![[1.0, 1.0]]),
        ];
        let m = SimilarityMatrix::compute(&arena(&tracks), Aggregation::Mean).unwrap();
        let names: Vec<String> = m.nearest("seed", 10).unwrap().into_iter().map(|n| n.name).collect();
        assert_eq!(names, vec!["a-same", "b-same", "mid", "far"]);

        assert_eq!(m.nearest("seed", 2).unwrap().len(), 2);
        assert!(matches!(m.nearest("ghost", 2), Err(SimilarityError::UnknownTrack(_))));
    }

    #[test]
    fn test_without_prunes_row_and_column() {
        let m = SimilarityMatrix::compute(&arena(&sample()), Aggregation::Mean).unwrap();
        let pruned = m.without("k-B");
        assert_eq!(pruned.len(), 3);
        assert!(!pruned.covers("k-B"));
        assert_eq!(pruned.distance("A", "C"), m.distance("A", "C"));
        assert_eq!(pruned.distance("C", "D"), m.distance("C", "D"));
        assert_eq!(m.without("missing").len(), 4);
    }

    #[test]
    fn test_from_cache_rejects_missing_pairs() {
        let cache = SimilarityCache {
            aggregation: Aggregation::Mean,
            keys: vec!["a".into(), "b".into()],
            names: vec!["a".into(), "b".into()],
            distances: Array2::from_elem((2, 2), f64::NAN),
        };
        assert!(matches!(
            SimilarityMatrix::from_cache(cache),
            Err(SimilarityError::IncompleteCache { .. })
        ));
    }

    #[test]
    fn test_aggregation_parsing() {
        assert_eq!("Median".parse::<Aggregation>().unwrap(), Aggregation::Median);
        assert_eq!("mean".parse::<Aggregation>().unwrap(), Aggregation::Mean);
        assert!("mode".parse::<Aggregation>().is_err());
        assert_eq!(Aggregation::default(), Aggregation::Mean);
    }

    #[test]
    fn test_merge_rejects_other_aggregation() {
        let all = sample();
        let cached = SimilarityMatrix::compute(&arena(&all[..3]), Aggregation::Mean).unwrap();
        assert_eq!(cached.aggregation(), Aggregation::Mean);
        let err = SimilarityMatrix::merge(&cached, &arena(&all), Aggregation::Median).unwrap_err();
        assert!(matches!(
            err,
            SimilarityError::AggregationMismatch {
                cached: Aggregation::Mean,
                requested: Aggregation::Median
            }
        ));

        // An empty cache takes whatever is requested
        let fresh = SimilarityMatrix::merge(&SimilarityMatrix::empty(), &arena(&all), Aggregation::Median).unwrap();
        assert_eq!(fresh.aggregation(), Aggregation::Median);
        assert_eq!(fresh.without("k-A").aggregation(), Aggregation::Median);
    }

    fn stored_library() -> (Database, Vec<i64>) {
        use crate::db::models::NewTrack;

        let db = Database::open_in_memory().unwrap();
        let mut ids = Vec::new();
        for (name, collapsed) in sample() {
            let id = db
                .upsert_track(&NewTrack {
                    file_path: format!("/m/{name}.mp3"),
                    track_key: format!("k-{name}"),
                    name: name.to_string(),
                    category: None,
                    file_size: 1,
                    file_modified: "0".into(),
                    format: "mp3".into(),
                })
                .unwrap();
            db.store_embedding(id, &collapsed, 100).unwrap();
            ids.push(id);
        }
        (db, ids)
    }

    #[test]
    fn test_update_refuses_to_mix_aggregations() {
        let (db, ids) = stored_library();
        update_similarity(&db, Aggregation::Mean, false, 2).unwrap();

        // Re-embed C so only its pairs need reducing
        db.invalidate_track(ids[2]).unwrap();
        db.store_embedding(ids[2], &sample()[2].1, 100).unwrap();

        let err = update_similarity(&db, Aggregation::Median, false, 2).unwrap_err();
        assert!(matches!(err, SimilarityError::AggregationMismatch { .. }));

        update_similarity(&db, Aggregation::Median, true, 2).unwrap();
        let stored = SimilarityMatrix::from_cache(db.load_similarity().unwrap().unwrap()).unwrap();
        assert_eq!(stored.aggregation(), Aggregation::Median);

        let full = SimilarityMatrix::compute(&db.build_arena().unwrap(), Aggregation::Median).unwrap();
        for (a, b, d) in full.pairs() {
            let (i, j) = (stored.index[a], stored.index[b]);
            assert!((stored.distances[[i, j]] - d).abs() < 1e-12, "{a}-{b}");
        }

        // Nothing new to reduce, but the mode still has to match
        let err = update_similarity(&db, Aggregation::Mean, false, 2).unwrap_err();
        assert!(matches!(
            err,
            SimilarityError::AggregationMismatch {
                cached: Aggregation::Median,
                requested: Aggregation::Mean
            }
        ));
        assert_eq!(update_similarity(&db, Aggregation::Median, false, 2).unwrap().pairs, 0);
    }
}
