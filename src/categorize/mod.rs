pub mod learner;
pub mod state;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use thiserror::Error;

use crate::analyzer::pool::extract_all;
use crate::analyzer::{ExtractError, ExtractSettings, FeatureExtractor};
use crate::classifier::{ClassifierError, TrainParams};
use crate::db::models::LabelRow;
use crate::db::{Database, DbError};
use crate::track::{ArenaError, Embedding, Track, TrackArena, TrackId};

pub use learner::{ActiveLearner, LoopOutcome, RoundReport};
pub use state::{LabelState, LabelStatus, TransitionError};

#[derive(Error, Debug)]
pub enum RoundError {
    #[error("Training failed: {0}")]
    Train(#[from] ClassifierError),
    #[error("Label transition failed: {0}")]
    Transition(#[from] TransitionError),
    #[error("No frame embeddings in memory for '{0}'")]
    MissingFrames(String),
    #[error("Categorized track '{0}' has no encoded category")]
    MissingLabel(String),
    #[error("Oracle has no category for '{0}'")]
    OracleUnavailable(String),
}

#[derive(Error, Debug)]
pub enum CategorizeError {
    #[error("Escalation size must be at least 1")]
    InvalidEscalationSize,
    #[error("No categorized tracks found; organize the library as <root>/<category>/<file>")]
    NoCategories,
    #[error("No analyzed tracks to categorize")]
    NoTracks,
    #[error("Seeding roots failed: {0}")]
    Seed(#[source] RoundError),
    #[error("Round {round} failed: {source}")]
    Round {
        round: usize,
        #[source]
        source: RoundError,
    },
    #[error("Round {round} did not shrink the unlabeled set ({remaining} left)")]
    Stalled { round: usize, remaining: usize },
    #[error("Track arena error: {0}")]
    Arena(#[from] ArenaError),
    #[error("Database error: {0}")]
    Db(#[from] DbError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

#[derive(Debug, Clone)]
pub struct LoopParams {
    /// Minimum confidence for promoting a prediction.
    pub threshold: f64,
    /// Least-confident tracks handed to the oracle per round.
    pub escalation_size: usize,
    /// Roots seeded per category before the first round.
    pub num_roots: usize,
    pub seed: u64,
    pub train: TrainParams,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            threshold: 0.6,
            escalation_size: 10,
            num_roots: 5,
            seed: 42,
            train: TrainParams::default(),
        }
    }
}

/// Supplies ground truth for escalated tracks.
pub trait Oracle {
    fn true_category(&self, track: &Track) -> Option<String>;
}

/// Answers from labels the library already carries (`<root>/<category>/<file>`).
#[derive(Debug, Clone, Copy, Default)]
pub struct DatasetOracle;

impl Oracle for DatasetOracle {
    fn true_category(&self, track: &Track) -> Option<String> {
        track.true_category.clone()
    }
}

pub struct CategorizeResult {
    pub outcome: LoopOutcome,
    pub tracks: usize,
    /// Analyzed tracks skipped for lacking a known category.
    pub uncategorized: usize,
    /// Tracks whose frames could not be re-extracted.
    pub failed: usize,
}

/// Categorize every analyzed track in the library and persist the labels.
///
/// Collapsed embeddings come from the cache; the classifier's frame-level
/// input is re-extracted (segment-limited) since raw frames are never stored.
pub fn categorize_library<E, F>(
    db: &Database,
    params: LoopParams,
    settings: ExtractSettings,
    partition: Option<&BTreeMap<String, usize>>,
    jobs: usize,
    init: F,
) -> Result<CategorizeResult, CategorizeError>
where
    E: FeatureExtractor + Send,
    F: Fn() -> Result<E, ExtractError> + Sync,
{
    let stored = db.load_embeddings()?;
    let (labeled, unknown): (Vec<_>, Vec<_>) = stored.into_iter().partition(|s| s.category.is_some());
    for s in &unknown {
        log::warn!("Skipping {}: no category directory", s.name);
    }
    if labeled.is_empty() {
        return Err(CategorizeError::NoTracks);
    }

    log::info!("Extracting frames for {} tracks", labeled.len());
    let paths: Vec<PathBuf> = labeled.iter().map(|s| PathBuf::from(&s.file_path)).collect();
    let mut frames: HashMap<PathBuf, Embedding> = HashMap::with_capacity(paths.len());
    let mut failed = 0;
    for outcome in extract_all(paths, jobs, settings, init)? {
        match outcome.result {
            Ok(embedding) => {
                frames.insert(outcome.path, embedding);
            }
            Err(e) => {
                log::warn!("Excluding {}: {}", outcome.path.display(), e);
                failed += 1;
            }
        }
    }

    let mut arena = TrackArena::new();
    let mut db_ids: Vec<i64> = Vec::with_capacity(labeled.len());
    for s in labeled {
        let Some(extracted) = frames.remove(&PathBuf::from(&s.file_path)) else {
            continue;
        };
        let Some(mut embedding) = Embedding::from_collapsed(s.collapsed) else {
            continue;
        };
        embedding.frames = extracted.frames;
        let mut track = Track::new(s.track_key, s.name, s.file_path, embedding);
        track.true_category = s.category;
        arena.insert(track)?;
        db_ids.push(s.track_id);
    }
    if arena.is_empty() {
        return Err(CategorizeError::NoTracks);
    }

    let clusters: Option<BTreeMap<TrackId, usize>> = partition.map(|p| {
        arena
            .iter()
            .filter_map(|t| p.get(&t.key).map(|&c| (t.id, c)))
            .collect()
    });

    let tracks = arena.len();
    let mut learner = ActiveLearner::from_oracle(arena, params, DatasetOracle)?;
    learner.seed_roots(clusters.as_ref())?;
    let outcome = learner.run()?;

    let arena = learner.arena();
    let rows: Vec<LabelRow> = arena
        .iter()
        .map(|t| LabelRow::from_state(db_ids[t.id.index()], &t.name, arena.label(t.id)))
        .collect();
    db.store_labels(&rows)?;

    Ok(CategorizeResult {
        outcome,
        tracks,
        uncategorized: unknown.len(),
        failed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::NewTrack;
    use ndarray::Array2;
    use std::path::Path;

    /// Tracks under a "rock" directory embed along one axis, "jazz" along another.
    struct DirectionExtractor;

    impl FeatureExtractor for DirectionExtractor {
        fn embed(&self, path: &Path) -> Result<Array2<f32>, ExtractError> {
            let axis = if path.to_string_lossy().contains("/rock/") { 0 } else { 2 };
            Ok(Array2::from_shape_fn((12, 4), |(r, c)| {
                let jitter = (r % 3) as f32 * 0.05;
                if c == axis { 2.0 + jitter } else { jitter }
            }))
        }
    }

    fn add(db: &Database, path: &str, category: Option<&str>) {
        db.upsert_track(&NewTrack {
            file_path: path.to_string(),
            track_key: crate::scanner::path_key(Path::new(path)),
            name: Path::new(path).file_name().unwrap().to_string_lossy().to_string(),
            category: category.map(String::from),
            file_size: 1,
            file_modified: "0".to_string(),
            format: "mp3".to_string(),
        })
        .unwrap();
    }

    #[test]
    fn test_categorize_library_persists_labels() {
        let db = Database::open_in_memory().unwrap();
        add(&db, "/lib/rock/r1.mp3", Some("rock"));
        add(&db, "/lib/rock/r2.mp3", Some("rock"));
        add(&db, "/lib/jazz/j1.mp3", Some("jazz"));
        add(&db, "/lib/jazz/j2.mp3", Some("jazz"));
        add(&db, "/lib/loose.mp3", None);
        crate::analyzer::analyze_tracks(&db, false, 2, 4, || Ok(DirectionExtractor)).unwrap();

        let params = LoopParams {
            escalation_size: 1,
            num_roots: 1,
            seed: 3,
            train: TrainParams {
                learning_rate: 0.05,
                l2: 0.0,
                epochs: 200,
                patience: 200,
                validation_split: 0.0,
                ..TrainParams::default()
            },
            ..LoopParams::default()
        };
        let settings = ExtractSettings { group_size: 4, keep_frames: Some(250) };
        let result = categorize_library(&db, params, settings, None, 2, || Ok(DirectionExtractor)).unwrap();

        assert_eq!(result.tracks, 4);
        assert_eq!(result.uncategorized, 1);
        assert_eq!(result.failed, 0);

        let labels = db.load_labels().unwrap();
        assert_eq!(labels.len(), 4);
        for row in &labels {
            let expected = if row.name.starts_with('r') { "rock" } else { "jazz" };
            assert_eq!(row.category.as_deref(), Some(expected), "{}", row.name);
            assert!(row.status == "root" || row.status == "confident");
        }
    }

    #[test]
    fn test_categorize_library_without_tracks() {
        let db = Database::open_in_memory().unwrap();
        let settings = ExtractSettings { group_size: 4, keep_frames: Some(10) };
        let err = categorize_library(&db, LoopParams::default(), settings, None, 1, || Ok(DirectionExtractor))
            .err()
            .unwrap();
        assert!(matches!(err, CategorizeError::NoTracks));
    }
}
