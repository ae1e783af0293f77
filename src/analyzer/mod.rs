pub mod collapse;
pub mod decode;
pub mod pool;
pub mod spectral;

use crate::db::Database;
use crate::track::Embedding;
use collapse::CollapseError;
use decode::{AudioSource, DecodeError};
use ndarray::Array2;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Waveform is empty")]
    EmptyWaveform,
    #[error("Model inference failed: {0}")]
    Inference(String),
}

#[derive(Error, Debug)]
pub enum ExtractError {
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("Embedding model error: {0}")]
    Model(#[from] ModelError),
    #[error("Collapse error: {0}")]
    Collapse(#[from] CollapseError),
    #[error("Embedding model produced no frames")]
    NoFrames,
    #[error("Extraction worker could not start: {0}")]
    WorkerInit(String),
}

#[derive(Error, Debug)]
pub enum AnalyzeError {
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("Thread pool error: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),
}

/// Opaque embedding model: normalized mono 16 kHz waveform in, frames × D out.
/// Must be deterministic for a fixed input.
pub trait EmbeddingModel {
    fn dim(&self) -> usize;
    fn embed(&self, waveform: &[f32]) -> Result<Array2<f32>, ModelError>;
}

/// Turns one track's file into its frame-embedding matrix.
pub trait FeatureExtractor {
    fn embed(&self, path: &Path) -> Result<Array2<f32>, ExtractError>;
}

/// A `FeatureExtractor` that decodes audio with `S` and embeds it with `M`.
pub struct ModelExtractor<S, M> {
    source: S,
    model: M,
}

impl<S: AudioSource, M: EmbeddingModel> ModelExtractor<S, M> {
    pub fn new(source: S, model: M) -> Self {
        Self { source, model }
    }
}

impl<S: AudioSource, M: EmbeddingModel> FeatureExtractor for ModelExtractor<S, M> {
    fn embed(&self, path: &Path) -> Result<Array2<f32>, ExtractError> {
        let mut waveform = self.source.load(path)?;
        decode::normalize(&mut waveform);
        Ok(self.model.embed(&waveform)?)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExtractSettings {
    /// Frames averaged per collapsed row.
    pub group_size: usize,
    /// Keep up to this many raw frames in memory (classifier input). `None` drops them.
    pub keep_frames: Option<usize>,
}

/// Embed one track and reduce it to its collapsed/aggregated form.
pub fn embed_track<E: FeatureExtractor + ?Sized>(
    extractor: &E,
    path: &Path,
    settings: ExtractSettings,
) -> Result<Embedding, ExtractError> {
    let frames = extractor.embed(path)?;
    if frames.nrows() == 0 {
        return Err(ExtractError::NoFrames);
    }
    Embedding::from_frames(frames, settings.group_size, settings.keep_frames)
}

pub struct AnalyzeResult {
    pub analyzed: u64,
    pub failed: u64,
}

/// Embed every track that lacks a cached embedding (or all tracks with `force`)
/// and store the collapsed matrices. Failed tracks are recorded as such and
/// excluded from similarity and categorization until re-analyzed.
///
/// Tracks are extracted in chunks of `jobs * 2`; each chunk is written before
/// the next starts, so an interrupted run keeps what it finished.
pub fn analyze_tracks<E, F>(
    db: &Database,
    force: bool,
    jobs: usize,
    group_size: usize,
    init: F,
) -> Result<AnalyzeResult, AnalyzeError>
where
    E: FeatureExtractor + Send,
    F: Fn() -> Result<E, ExtractError> + Sync,
{
    let tracks = if force {
        // Stored distances may no longer match the re-extracted embeddings
        db.clear_similarity()?;
        db.get_all_tracks()?
    } else {
        db.get_unembedded_tracks()?
    };

    if tracks.is_empty() {
        log::info!("No tracks to analyze");
        return Ok(AnalyzeResult { analyzed: 0, failed: 0 });
    }

    let jobs = jobs.clamp(1, tracks.len());
    log::info!("Analyzing {} tracks with {} workers", tracks.len(), jobs);

    let pool = pool::ExtractionPool::new(jobs, init)?;
    let pb = pool::progress_bar(tracks.len());
    let settings = ExtractSettings { group_size, keep_frames: None };

    let mut analyzed = 0u64;
    let mut failed = 0u64;

    for chunk in tracks.chunks(jobs * 2) {
        let paths: Vec<PathBuf> = chunk.iter().map(|t| PathBuf::from(&t.file_path)).collect();
        let outcomes = pool.extract(&paths, settings, &pb);

        // Outcomes are in input order
        let tx = db.conn.unchecked_transaction().map_err(crate::db::DbError::from)?;
        for (track, outcome) in chunk.iter().zip(outcomes) {
            match outcome.result {
                Ok(embedding) => {
                    db.store_embedding(track.id, &embedding.collapsed, group_size)?;
                    analyzed += 1;
                }
                Err(e) => {
                    db.store_extraction_failure(track.id, &e.to_string())?;
                    failed += 1;
                }
            }
        }
        tx.commit().map_err(crate::db::DbError::from)?;

        pb.set_message(format!("{} stored, {} failed", analyzed, failed));
    }

    pb.finish_with_message(format!("Done: {} analyzed, {} failed", analyzed, failed));

    Ok(AnalyzeResult { analyzed, failed })
}
