pub mod confidence;
pub mod encoder;
pub mod model;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis, concatenate};
use thiserror::Error;

pub use encoder::CategoryEncoder;
pub use model::{FitReport, Mlp, TrainParams};

#[derive(Error, Debug)]
pub enum ClassifierError {
    #[error("No categories to train on")]
    NoCategories,
    #[error("Unknown category: {0}")]
    UnknownCategory(String),
    #[error("No labeled training examples")]
    NoExamples,
    #[error("Category '{0}' has no training examples")]
    MissingCategory(String),
    #[error("Target has {got} entries, encoder has {expected} categories")]
    TargetWidth { expected: usize, got: usize },
    #[error("Embedding dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },
    #[error("Cannot predict from an empty frame matrix")]
    EmptyInput,
}

/// One labeled track: every frame row becomes a training row with `target`.
pub struct Example<'a> {
    pub frames: ArrayView2<'a, f32>,
    pub target: ArrayView1<'a, f32>,
}

/// What was trained, and on how much.
#[derive(Debug, Clone)]
pub struct ClassifierState {
    pub round: usize,
    /// Number of frame rows trained on.
    pub training_size: usize,
    pub fit: FitReport,
}

#[derive(Debug, Clone)]
pub struct Prediction {
    /// Per-frame probabilities averaged over the track.
    pub probabilities: Array1<f32>,
    pub category_index: usize,
    pub category: String,
    pub confidence: f64,
}

#[derive(Debug, Clone)]
pub struct Classifier {
    encoder: CategoryEncoder,
    model: Mlp,
    state: ClassifierState,
}

impl Classifier {
    /// Train a fresh model on frame rows of `examples`.
    ///
    /// Every category in `encoder` needs at least one example; a degenerate
    /// labeled set is an error rather than a silently skewed model.
    pub fn train(
        encoder: CategoryEncoder,
        examples: &[Example<'_>],
        params: &TrainParams,
        round: usize,
    ) -> Result<Self, ClassifierError> {
        let (x, y) = training_matrix(&encoder, examples)?;

        let mut rng = model::seeded_rng(params.seed.wrapping_add(round as u64));
        let mut mlp = Mlp::new(x.ncols(), params.hidden_units.max(1), encoder.len(), &mut rng);
        let fit = mlp.fit(x.view(), y.view(), params, &mut rng);

        log::info!(
            "Round {}: trained on {} rows from {} tracks ({} epochs, best loss {:.4})",
            round,
            x.nrows(),
            examples.len(),
            fit.epochs_run,
            fit.best_loss
        );

        Ok(Self {
            encoder,
            model: mlp,
            state: ClassifierState {
                round,
                training_size: x.nrows(),
                fit,
            },
        })
    }

    /// Predict a track's category from its frames: per-row probabilities are
    /// averaged and the arg-max wins (ties go to the first category).
    pub fn predict(&self, frames: ArrayView2<f32>) -> Result<Prediction, ClassifierError> {
        if frames.nrows() == 0 {
            return Err(ClassifierError::EmptyInput);
        }
        if frames.ncols() != self.model.inputs() {
            return Err(ClassifierError::DimensionMismatch {
                expected: self.model.inputs(),
                got: frames.ncols(),
            });
        }

        let probabilities = self
            .model
            .predict_proba(frames)
            .mean_axis(Axis(0))
            .ok_or(ClassifierError::EmptyInput)?;

        let category_index = probabilities
            .iter()
            .enumerate()
            .fold((0, f32::NEG_INFINITY), |best, (i, &p)| if p > best.1 { (i, p) } else { best })
            .0;
        let category = self
            .encoder
            .decode(category_index)
            .ok_or(ClassifierError::NoCategories)?
            .to_string();
        let confidence = confidence::confidence(&probabilities.to_vec());

        Ok(Prediction {
            probabilities,
            category_index,
            category,
            confidence,
        })
    }

    pub fn encoder(&self) -> &CategoryEncoder {
        &self.encoder
    }

    pub fn state(&self) -> &ClassifierState {
        &self.state
    }
}

/// Stack example frames into (rows × D, rows × N) training matrices.
fn training_matrix(
    encoder: &CategoryEncoder,
    examples: &[Example<'_>],
) -> Result<(Array2<f32>, Array2<f32>), ClassifierError> {
    let first = examples.first().ok_or(ClassifierError::NoExamples)?;
    let dims = first.frames.ncols();
    let mut per_category = vec![0usize; encoder.len()];

    for ex in examples {
        if ex.frames.ncols() != dims {
            return Err(ClassifierError::DimensionMismatch {
                expected: dims,
                got: ex.frames.ncols(),
            });
        }
        if ex.target.len() != encoder.len() {
            return Err(ClassifierError::TargetWidth {
                expected: encoder.len(),
                got: ex.target.len(),
            });
        }
        if ex.frames.nrows() == 0 {
            continue;
        }
        if let Some((idx, _)) = ex
            .target
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
        {
            per_category[idx] += ex.frames.nrows();
        }
    }

    if per_category.iter().all(|&n| n == 0) {
        return Err(ClassifierError::NoExamples);
    }
    if let Some(idx) = per_category.iter().position(|&n| n == 0) {
        let name = encoder.decode(idx).unwrap_or("?").to_string();
        return Err(ClassifierError::MissingCategory(name));
    }

    let xs: Vec<ArrayView2<f32>> = examples.iter().map(|e| e.frames).collect();
    let x = concatenate(Axis(0), &xs).map_err(|_| ClassifierError::NoExamples)?;

    let mut y = Array2::<f32>::zeros((x.nrows(), encoder.len()));
    let mut row = 0;
    for ex in examples {
        for _ in 0..ex.frames.nrows() {
            y.row_mut(row).assign(&ex.target);
            row += 1;
        }
    }

    Ok((x, y))
}
