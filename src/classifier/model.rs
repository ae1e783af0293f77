//! Two-layer perceptron (`D -> hidden (ReLU) -> N (softmax)`) trained with
//! Adam on L2-regularized categorical cross-entropy.

use std::time::{Duration, Instant};

use ndarray::{Array, Array1, Array2, ArrayView2, Axis, Dimension, Zip};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

const ADAM_BETA1: f32 = 0.9;
const ADAM_BETA2: f32 = 0.999;
const ADAM_EPSILON: f32 = 1e-7;

#[derive(Debug, Clone)]
pub struct TrainParams {
    pub hidden_units: usize,
    pub learning_rate: f32,
    /// L2 penalty applied to both weight matrices.
    pub l2: f32,
    pub batch_size: usize,
    pub epochs: usize,
    /// Epochs without validation-loss improvement before stopping.
    pub patience: usize,
    /// Fraction of rows held out for early stopping. 0 monitors training loss.
    pub validation_split: f32,
    pub max_training_time: Duration,
    pub seed: u64,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            hidden_units: 16,
            learning_rate: 0.01,
            l2: 0.01,
            batch_size: 256,
            epochs: 100,
            patience: 5,
            validation_split: 0.1,
            max_training_time: Duration::from_secs(120),
            seed: 42,
        }
    }
}

/// Summary of one `fit` run.
#[derive(Debug, Clone)]
pub struct FitReport {
    pub epochs_run: usize,
    pub best_loss: f32,
    pub stopped_early: bool,
}

#[derive(Debug, Clone)]
pub struct Mlp {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

struct Gradients {
    w1: Array2<f32>,
    b1: Array1<f32>,
    w2: Array2<f32>,
    b2: Array1<f32>,
}

struct Moments {
    m: Gradients,
    v: Gradients,
    step: i32,
}

impl Gradients {
    fn zeros_like(model: &Mlp) -> Self {
        Self {
            w1: Array2::zeros(model.w1.raw_dim()),
            b1: Array1::zeros(model.b1.raw_dim()),
            w2: Array2::zeros(model.w2.raw_dim()),
            b2: Array1::zeros(model.b2.raw_dim()),
        }
    }
}

impl Mlp {
    /// Glorot-uniform weights, zero biases.
    pub fn new(inputs: usize, hidden: usize, outputs: usize, rng: &mut StdRng) -> Self {
        let mut glorot = |fan_in: usize, fan_out: usize| {
            let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
            Array2::from_shape_fn((fan_in, fan_out), |_| rng.gen_range(-limit..limit))
        };
        let w1 = glorot(inputs, hidden);
        let w2 = glorot(hidden, outputs);
        Self {
            w1,
            b1: Array1::zeros(hidden),
            w2,
            b2: Array1::zeros(outputs),
        }
    }

    pub fn inputs(&self) -> usize {
        self.w1.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.w2.ncols()
    }

    /// Row-wise class probabilities.
    pub fn predict_proba(&self, x: ArrayView2<f32>) -> Array2<f32> {
        let (_, _, probs) = self.forward(x);
        probs
    }

    /// Returns (pre-activation hidden, hidden, probabilities).
    fn forward(&self, x: ArrayView2<f32>) -> (Array2<f32>, Array2<f32>, Array2<f32>) {
        let z1 = x.dot(&self.w1) + &self.b1;
        let h = z1.mapv(|v| v.max(0.0));
        let mut probs = h.dot(&self.w2) + &self.b2;
        softmax_rows(&mut probs);
        (z1, h, probs)
    }

    fn penalty(&self, l2: f32) -> f32 {
        l2 * (self.w1.mapv(|w| w * w).sum() + self.w2.mapv(|w| w * w).sum())
    }

    /// Mean cross-entropy plus the L2 penalty.
    pub fn loss(&self, x: ArrayView2<f32>, y: ArrayView2<f32>, l2: f32) -> f32 {
        if x.nrows() == 0 {
            return 0.0;
        }
        let probs = self.predict_proba(x);
        cross_entropy(&probs, y) + self.penalty(l2)
    }

    fn gradients(&self, x: ArrayView2<f32>, y: ArrayView2<f32>, l2: f32) -> Gradients {
        let batch = x.nrows().max(1) as f32;
        let (z1, h, probs) = self.forward(x);

        let dz2 = (&probs - &y) / batch;
        let w2 = h.t().dot(&dz2) + &self.w2 * (2.0 * l2);
        let b2 = dz2.sum_axis(Axis(0));

        let mut dz1 = dz2.dot(&self.w2.t());
        Zip::from(&mut dz1).and(&z1).for_each(|d, &z| {
            if z <= 0.0 {
                *d = 0.0;
            }
        });
        let w1 = x.t().dot(&dz1) + &self.w1 * (2.0 * l2);
        let b1 = dz1.sum_axis(Axis(0));

        Gradients { w1, b1, w2, b2 }
    }

    fn apply(&mut self, grads: &Gradients, moments: &mut Moments, lr: f32) {
        moments.step += 1;
        let t = moments.step;
        adam_update(&mut self.w1, &grads.w1, &mut moments.m.w1, &mut moments.v.w1, lr, t);
        adam_update(&mut self.b1, &grads.b1, &mut moments.m.b1, &mut moments.v.b1, lr, t);
        adam_update(&mut self.w2, &grads.w2, &mut moments.m.w2, &mut moments.v.w2, lr, t);
        adam_update(&mut self.b2, &grads.b2, &mut moments.m.b2, &mut moments.v.b2, lr, t);
    }

    /// Train on rows of `x` with one-hot targets `y`.
    ///
    /// Holds out `validation_split` of the (shuffled) rows and stops once the
    /// validation loss has not improved for `patience` epochs or the wall-clock
    /// limit passes. The best weights seen are restored.
    pub fn fit(&mut self, x: ArrayView2<f32>, y: ArrayView2<f32>, params: &TrainParams, rng: &mut StdRng) -> FitReport {
        let rows = x.nrows();
        let mut order: Vec<usize> = (0..rows).collect();
        order.shuffle(rng);

        let n_val = ((rows as f32) * params.validation_split.clamp(0.0, 0.5)).floor() as usize;
        let (train_idx, val_idx) = order.split_at(rows - n_val);
        let mut train_idx = train_idx.to_vec();

        let x_val = x.select(Axis(0), val_idx);
        let y_val = y.select(Axis(0), val_idx);

        let mut moments = Moments {
            m: Gradients::zeros_like(self),
            v: Gradients::zeros_like(self),
            step: 0,
        };

        let batch_size = params.batch_size.max(1);
        let started = Instant::now();
        let mut best = self.clone();
        let mut best_loss = f32::INFINITY;
        let mut wait = 0usize;
        let mut epochs_run = 0usize;
        let mut stopped_early = false;

        for epoch in 0..params.epochs {
            train_idx.shuffle(rng);
            for batch in train_idx.chunks(batch_size) {
                let xb = x.select(Axis(0), batch);
                let yb = y.select(Axis(0), batch);
                let grads = self.gradients(xb.view(), yb.view(), params.l2);
                self.apply(&grads, &mut moments, params.learning_rate);
            }
            epochs_run = epoch + 1;

            let monitored = if n_val > 0 {
                self.loss(x_val.view(), y_val.view(), params.l2)
            } else {
                let xt = x.select(Axis(0), &train_idx);
                let yt = y.select(Axis(0), &train_idx);
                self.loss(xt.view(), yt.view(), params.l2)
            };

            if monitored < best_loss {
                best_loss = monitored;
                best = self.clone();
                wait = 0;
            } else {
                wait += 1;
                if wait >= params.patience.max(1) {
                    log::debug!("Early stopping after {} epochs (best loss {:.4})", epochs_run, best_loss);
                    stopped_early = true;
                    break;
                }
            }

            if started.elapsed() > params.max_training_time {
                log::info!(
                    "Ending training early: maximum training time ({:?}) reached",
                    params.max_training_time
                );
                stopped_early = true;
                break;
            }
        }

        if best_loss.is_finite() {
            *self = best;
        }

        FitReport { epochs_run, best_loss, stopped_early }
    }
}

pub(crate) fn seeded_rng(seed: u64) -> StdRng {
    StdRng::seed_from_u64(seed)
}

fn softmax_rows(logits: &mut Array2<f32>) {
    for mut row in logits.rows_mut() {
        let max = row.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
        row.mapv_inplace(|v| (v - max).exp());
        let sum = row.sum();
        if sum > 0.0 {
            row /= sum;
        }
    }
}

fn cross_entropy(probs: &Array2<f32>, y: ArrayView2<f32>) -> f32 {
    let rows = probs.nrows().max(1) as f32;
    let total: f32 = Zip::from(probs)
        .and(&y)
        .fold(0.0, |acc, &p, &t| if t > 0.0 { acc - t * p.max(1e-12).ln() } else { acc });
    total / rows
}

fn adam_update<D: Dimension>(
    param: &mut Array<f32, D>,
    grad: &Array<f32, D>,
    m: &mut Array<f32, D>,
    v: &mut Array<f32, D>,
    lr: f32,
    step: i32,
) {
    let bias1 = 1.0 - ADAM_BETA1.powi(step);
    let bias2 = 1.0 - ADAM_BETA2.powi(step);
    Zip::from(param).and(grad).and(m).and(v).for_each(|p, &g, m, v| {
        *m = ADAM_BETA1 * *m + (1.0 - ADAM_BETA1) * g;
        *v = ADAM_BETA2 * *v + (1.0 - ADAM_BETA2) * g * g;
        let m_hat = *m / bias1;
        let v_hat = *v / bias2;
        *p -= lr * m_hat / (v_hat.sqrt() + ADAM_EPSILON);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;

    fn two_blobs() -> (Array2<f32>, Array2<f32>) {
        let n = 40;
        let x = Array2::from_shape_fn((n, 3), |(r, c)| {
            let jitter = (r % 5) as f32 * 0.05;
            match (r < n / 2, c) {
                (true, 0) => 1.0 + jitter,
                (false, 2) => 1.0 + jitter,
                _ => jitter,
            }
        });
        let y = Array2::from_shape_fn((n, 2), |(r, c)| if (r < n / 2) == (c == 0) { 1.0 } else { 0.0 });
        (x, y)
    }

    #[test]
    fn test_softmax_rows_sum_to_one() {
        let mut logits = array![[1.0, 2.0, 3.0], [1000.0, 1000.0, 0.0]];
        softmax_rows(&mut logits);
        for row in logits.rows() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        assert!((logits[[1, 0]] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_fit_reduces_loss_and_separates() {
        let (x, y) = two_blobs();
        let mut rng = seeded_rng(7);
        let mut model = Mlp::new(3, 16, 2, &mut rng);
        let before = model.loss(x.view(), y.view(), 0.0);

        let params = TrainParams {
            learning_rate: 0.05,
            l2: 0.0,
            epochs: 200,
            patience: 50,
            validation_split: 0.0,
            ..TrainParams::default()
        };
        let report = model.fit(x.view(), y.view(), &params, &mut rng);
        let after = model.loss(x.view(), y.view(), 0.0);

        assert!(report.epochs_run > 0);
        assert!(after < before);
        let probs = model.predict_proba(x.view());
        assert!(probs[[0, 0]] > 0.9);
        assert!(probs[[39, 1]] > 0.9);
    }

    #[test]
    fn test_fit_is_deterministic_for_seed() {
        let (x, y) = two_blobs();
        let params = TrainParams { epochs: 5, ..TrainParams::default() };

        let run = || {
            let mut rng = seeded_rng(3);
            let mut model = Mlp::new(3, 8, 2, &mut rng);
            model.fit(x.view(), y.view(), &params, &mut rng);
            model.predict_proba(x.view())
        };
        assert_eq!(run(), run());
    }

    #[test]
    fn test_gradient_matches_finite_difference() {
        let (x, y) = two_blobs();
        let mut rng = seeded_rng(11);
        let model = Mlp::new(3, 4, 2, &mut rng);
        let grads = model.gradients(x.view(), y.view(), 0.01);

        let eps = 1e-3;
        let mut plus = model.clone();
        plus.w2[[1, 0]] += eps;
        let mut minus = model.clone();
        minus.w2[[1, 0]] -= eps;
        let numeric = (plus.loss(x.view(), y.view(), 0.01) - minus.loss(x.view(), y.view(), 0.01)) / (2.0 * eps);
        assert!((numeric - grads.w2[[1, 0]]).abs() < 1e-2, "{numeric} vs {}", grads.w2[[1, 0]]);
    }
}
