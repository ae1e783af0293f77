//! Default embedding model: log-compressed energies in log-spaced frequency
//! bands, computed over overlapping Hann-windowed frames.
//!
//! Frame geometry follows the common audio-event embedders (0.96 s windows,
//! 0.48 s hop at 16 kHz, 125–7500 Hz) so that collapse group sizes tuned for
//! those models carry over. Outputs are non-negative, which keeps cosine
//! distances in [0, 1].

use std::sync::Arc;

use ndarray::Array2;
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

use super::{EmbeddingModel, ModelError};
use crate::SAMPLE_RATE;

pub const WINDOW_SAMPLES: usize = 15_360;
pub const HOP_SAMPLES: usize = 7_680;
pub const DEFAULT_BANDS: usize = 64;

const MIN_FREQ_HZ: f32 = 125.0;
const MAX_FREQ_HZ: f32 = 7_500.0;

pub struct SpectralEmbedder {
    fft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    /// Half-open FFT bin range per band.
    bands: Vec<(usize, usize)>,
}

impl SpectralEmbedder {
    pub fn new(num_bands: usize) -> Self {
        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(WINDOW_SAMPLES);

        let window = (0..WINDOW_SAMPLES)
            .map(|i| {
                let phase = 2.0 * std::f32::consts::PI * i as f32 / WINDOW_SAMPLES as f32;
                0.5 - 0.5 * phase.cos()
            })
            .collect();

        Self {
            fft,
            window,
            bands: band_bins(num_bands.max(1)),
        }
    }

    fn frame_embedding(&self, frame: &[f32], scratch: &mut Vec<Complex<f32>>, out: &mut [f32]) {
        scratch.clear();
        scratch.extend(
            (0..WINDOW_SAMPLES)
                .map(|i| Complex::new(frame.get(i).copied().unwrap_or(0.0) * self.window[i], 0.0)),
        );
        self.fft.process(scratch);

        for (b, &(lo, hi)) in self.bands.iter().enumerate() {
            let power: f32 = scratch[lo..hi].iter().map(|c| c.norm_sqr()).sum::<f32>()
                / (hi - lo) as f32
                / WINDOW_SAMPLES as f32;
            out[b] = power.ln_1p();
        }
    }
}

impl Default for SpectralEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_BANDS)
    }
}

impl EmbeddingModel for SpectralEmbedder {
    fn dim(&self) -> usize {
        self.bands.len()
    }

    fn embed(&self, waveform: &[f32]) -> Result<Array2<f32>, ModelError> {
        if waveform.is_empty() {
            return Err(ModelError::EmptyWaveform);
        }

        let frames = frame_count(waveform.len());
        let mut out = Array2::<f32>::zeros((frames, self.dim()));
        let mut scratch = Vec::with_capacity(WINDOW_SAMPLES);

        for f in 0..frames {
            let start = f * HOP_SAMPLES;
            let end = (start + WINDOW_SAMPLES).min(waveform.len());
            let mut row = out.row_mut(f);
            let row = row
                .as_slice_mut()
                .ok_or_else(|| ModelError::Inference("non-contiguous output row".into()))?;
            self.frame_embedding(&waveform[start..end], &mut scratch, row);
        }

        Ok(out)
    }
}

/// Number of frames for a waveform of `len` samples. Waveforms shorter than
/// one window still produce a single zero-padded frame.
pub fn frame_count(len: usize) -> usize {
    if len == 0 {
        0
    } else if len <= WINDOW_SAMPLES {
        1
    } else {
        1 + (len - WINDOW_SAMPLES) / HOP_SAMPLES
    }
}

fn band_bins(num_bands: usize) -> Vec<(usize, usize)> {
    let bin_hz = SAMPLE_RATE as f32 / WINDOW_SAMPLES as f32;
    let ratio = MAX_FREQ_HZ / MIN_FREQ_HZ;
    let edge = |i: usize| MIN_FREQ_HZ * ratio.powf(i as f32 / num_bands as f32);

    (0..num_bands)
        .map(|b| {
            let lo = (edge(b) / bin_hz).floor() as usize;
            let hi = ((edge(b + 1) / bin_hz).floor() as usize).max(lo + 1);
            (lo, hi)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f32, seconds: f32) -> Vec<f32> {
        let n = (seconds * SAMPLE_RATE as f32) as usize;
        (0..n)
            .map(|i| (2.0 * std::f32::consts::PI * freq * i as f32 / SAMPLE_RATE as f32).sin())
            .collect()
    }

    #[test]
    fn test_frame_count() {
        assert_eq!(frame_count(0), 0);
        assert_eq!(frame_count(100), 1);
        assert_eq!(frame_count(WINDOW_SAMPLES), 1);
        assert_eq!(frame_count(WINDOW_SAMPLES + HOP_SAMPLES), 2);
        assert_eq!(frame_count(WINDOW_SAMPLES + HOP_SAMPLES - 1), 1);
    }

    #[test]
    fn test_band_bins_are_ordered_and_non_empty() {
        let bands = band_bins(DEFAULT_BANDS);
        assert_eq!(bands.len(), DEFAULT_BANDS);
        for (lo, hi) in &bands {
            assert!(hi > lo);
            assert!(*hi <= WINDOW_SAMPLES / 2);
        }
        for pair in bands.windows(2) {
            assert!(pair[1].0 >= pair[0].0);
        }
    }

    #[test]
    fn test_embed_shape_and_non_negative() {
        let model = SpectralEmbedder::default();
        let wave = sine(440.0, 3.0);
        let emb = model.embed(&wave).unwrap();
        assert_eq!(emb.ncols(), DEFAULT_BANDS);
        assert_eq!(emb.nrows(), frame_count(wave.len()));
        assert!(emb.iter().all(|v| *v >= 0.0 && v.is_finite()));
    }

    #[test]
    fn test_embed_is_deterministic() {
        let model = SpectralEmbedder::default();
        let wave = sine(1000.0, 2.0);
        assert_eq!(model.embed(&wave).unwrap(), model.embed(&wave).unwrap());
    }

    #[test]
    fn test_sine_energy_lands_in_matching_band() {
        let model = SpectralEmbedder::default();
        let emb = model.embed(&sine(1000.0, 1.0)).unwrap();
        let row = emb.row(0);
        let loudest = row
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();

        let bin = (1000.0 / (SAMPLE_RATE as f32 / WINDOW_SAMPLES as f32)) as usize;
        let (lo, hi) = band_bins(DEFAULT_BANDS)[loudest];
        assert!(lo <= bin + 1 && bin <= hi + 1, "1 kHz landed in band {lo}..{hi}");
    }

    #[test]
    fn test_silence_embeds_to_zero() {
        let model = SpectralEmbedder::default();
        let emb = model.embed(&vec![0.0; 20_000]).unwrap();
        assert!(emb.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_empty_waveform_fails() {
        let model = SpectralEmbedder::default();
        assert!(matches!(model.embed(&[]), Err(ModelError::EmptyWaveform)));
    }
}
