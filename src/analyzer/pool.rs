use std::path::{Path, PathBuf};
use std::sync::Mutex;

use indicatif::{ProgressBar, ProgressStyle};
use rayon::prelude::*;

use super::{ExtractError, ExtractSettings, FeatureExtractor, embed_track};
use crate::track::Embedding;

/// Result of extracting one track, tagged with the path it came from.
pub struct ExtractionOutcome {
    pub path: PathBuf,
    pub result: Result<Embedding, ExtractError>,
}

/// A sized rayon pool where every worker thread owns one extractor.
///
/// Extractors are built once per thread when the pool starts (loading the
/// model is the expensive part) and reused for every track that thread picks up.
pub struct ExtractionPool<E> {
    pool: rayon::ThreadPool,
    // Indexed by rayon thread index; a failed init keeps its message
    extractors: Vec<Mutex<Result<E, String>>>,
}

impl<E: FeatureExtractor + Send> ExtractionPool<E> {
    pub fn new<F>(workers: usize, init: F) -> Result<Self, rayon::ThreadPoolBuildError>
    where
        F: Fn() -> Result<E, ExtractError> + Sync,
    {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers.max(1))
            .build()?;

        let extractors = pool
            .broadcast(|ctx| {
                init().map_err(|e| {
                    log::error!("Worker {} failed to initialize: {}", ctx.index(), e);
                    e.to_string()
                })
            })
            .into_iter()
            .map(Mutex::new)
            .collect();

        Ok(Self { pool, extractors })
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Extract `paths` in parallel. Outcomes come back in input order, one per
    /// path; a failing track yields an `Err` outcome and never stops the batch.
    pub fn extract(
        &self,
        paths: &[PathBuf],
        settings: ExtractSettings,
        pb: &ProgressBar,
    ) -> Vec<ExtractionOutcome> {
        self.pool.install(|| {
            paths
                .par_iter()
                .map(|path| {
                    let result = self.extract_one(path, settings);
                    if let Err(e) = &result {
                        log::warn!("Extraction failed for {}: {}", path.display(), e);
                    }
                    pb.inc(1);
                    ExtractionOutcome {
                        path: path.clone(),
                        result,
                    }
                })
                .collect()
        })
    }

    fn extract_one(&self, path: &Path, settings: ExtractSettings) -> Result<Embedding, ExtractError> {
        let slot = rayon::current_thread_index()
            .and_then(|i| self.extractors.get(i))
            .ok_or_else(|| ExtractError::WorkerInit("not running on an extraction worker".into()))?;
        // Only this thread ever locks its own slot
        let extractor = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match &*extractor {
            Ok(ex) => embed_track(ex, path, settings),
            Err(e) => Err(ExtractError::WorkerInit(e.clone())),
        }
    }
}

pub fn progress_bar(total: usize) -> ProgressBar {
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::with_template(
            "{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
        )
        .unwrap()
        .progress_chars("#>-"),
    );
    pb
}

/// Extract embeddings for `paths` on a fresh pool of `workers` threads.
pub fn extract_all<E, F>(
    paths: Vec<PathBuf>,
    workers: usize,
    settings: ExtractSettings,
    init: F,
) -> Result<Vec<ExtractionOutcome>, rayon::ThreadPoolBuildError>
where
    E: FeatureExtractor + Send,
    F: Fn() -> Result<E, ExtractError> + Sync,
{
    if paths.is_empty() {
        return Ok(Vec::new());
    }
    let pool = ExtractionPool::new(workers.clamp(1, paths.len()), init)?;

    let pb = progress_bar(paths.len());
    let outcomes = pool.extract(&paths, settings, &pb);
    let failed = outcomes.iter().filter(|o| o.result.is_err()).count();
    pb.finish_with_message(format!(
        "Done: {} extracted, {} failed",
        outcomes.len() - failed,
        failed
    ));

    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;
    use std::collections::HashSet;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeExtractor;

    impl FeatureExtractor for FakeExtractor {
        fn embed(&self, path: &Path) -> Result<Array2<f32>, ExtractError> {
            let name = path.file_stem().and_then(|s| s.to_str()).unwrap_or("");
            if name.starts_with("bad") {
                return Err(ExtractError::NoFrames);
            }
            let seed = name.len() as f32;
            Ok(Array2::from_shape_fn((5, 3), |(r, c)| seed + (r * 3 + c) as f32))
        }
    }

    fn settings() -> ExtractSettings {
        ExtractSettings { group_size: 2, keep_frames: None }
    }

    #[test]
    fn test_every_path_reported_once() {
        let paths: Vec<PathBuf> = (0..25)
            .map(|i| {
                if i % 7 == 0 {
                    PathBuf::from(format!("/music/bad{i}.mp3"))
                } else {
                    PathBuf::from(format!("/music/track{i}.mp3"))
                }
            })
            .collect();

        let outcomes = extract_all(paths.clone(), 4, settings(), || Ok(FakeExtractor)).unwrap();
        assert_eq!(outcomes.len(), paths.len());

        let seen: HashSet<PathBuf> = outcomes.iter().map(|o| o.path.clone()).collect();
        assert_eq!(seen.len(), paths.len());

        for o in &outcomes {
            let bad = o.path.to_string_lossy().contains("bad");
            assert_eq!(o.result.is_err(), bad, "{}", o.path.display());
            if let Ok(emb) = &o.result {
                assert_eq!(emb.collapsed.nrows(), 3);
                assert!(emb.frames.is_none());
            }
        }
    }

    #[test]
    fn test_init_runs_once_per_worker() {
        let inits = AtomicUsize::new(0);
        let paths: Vec<PathBuf> = (0..40).map(|i| PathBuf::from(format!("/m/t{i}.wav"))).collect();
        let outcomes = extract_all(paths, 3, settings(), || {
            inits.fetch_add(1, Ordering::SeqCst);
            Ok(FakeExtractor)
        })
        .unwrap();
        assert_eq!(outcomes.len(), 40);
        assert_eq!(inits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_failed_init_fails_tracks_not_batch() {
        let paths: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("/m/t{i}.wav"))).collect();
        let outcomes = extract_all(paths, 2, settings(), || {
            Err::<FakeExtractor, _>(ExtractError::WorkerInit("model missing".into()))
        })
        .unwrap();
        assert_eq!(outcomes.len(), 5);
        assert!(outcomes.iter().all(|o| matches!(o.result, Err(ExtractError::WorkerInit(_)))));
    }

    #[test]
    fn test_keep_frames_limits_rows() {
        let paths = vec![PathBuf::from("/m/song.wav")];
        let settings = ExtractSettings { group_size: 2, keep_frames: Some(3) };
        let outcomes = extract_all(paths, 1, settings, || Ok(FakeExtractor)).unwrap();
        let emb = outcomes[0].result.as_ref().unwrap();
        assert_eq!(emb.frames.as_ref().unwrap().nrows(), 3);
        // Collapse still sees every frame
        assert_eq!(emb.collapsed.nrows(), 3);
    }

    #[test]
    fn test_outcomes_follow_input_order() {
        let paths: Vec<PathBuf> = (0..30).map(|i| PathBuf::from(format!("/m/{i:02}.wav"))).collect();
        let outcomes = extract_all(paths.clone(), 4, settings(), || Ok(FakeExtractor)).unwrap();
        let returned: Vec<PathBuf> = outcomes.into_iter().map(|o| o.path).collect();
        assert_eq!(returned, paths);
    }

    #[test]
    fn test_pool_reused_across_batches() {
        let inits = AtomicUsize::new(0);
        let pool = ExtractionPool::new(2, || {
            inits.fetch_add(1, Ordering::SeqCst);
            Ok(FakeExtractor)
        })
        .unwrap();
        assert_eq!(pool.workers(), 2);

        let pb = ProgressBar::hidden();
        for batch in 0..3 {
            let paths: Vec<PathBuf> = (0..6).map(|i| PathBuf::from(format!("/m/b{batch}t{i}.wav"))).collect();
            let outcomes = pool.extract(&paths, settings(), &pb);
            assert_eq!(outcomes.len(), 6);
            assert!(outcomes.iter().all(|o| o.result.is_ok()));
        }
        assert_eq!(inits.load(Ordering::SeqCst), 2);
        assert_eq!(pb.position(), 18);
    }

    #[test]
    fn test_empty_input() {
        let outcomes = extract_all(Vec::new(), 4, settings(), || Ok(FakeExtractor)).unwrap();
        assert!(outcomes.is_empty());
    }
}
