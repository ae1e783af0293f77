use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

use crate::SAMPLE_RATE;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("ffmpeg not found at {0}")]
    FfmpegNotFound(String),
    #[error("ffmpeg decode error: {0}")]
    Ffmpeg(String),
    #[error("No audio decoded from {0}")]
    Empty(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Source of decoded waveforms: mono, 16 kHz, `f32` samples.
pub trait AudioSource {
    fn load(&self, path: &Path) -> Result<Vec<f32>, DecodeError>;
}

/// Decodes any format ffmpeg understands by piping raw `f32le` samples
/// from an ffmpeg subprocess.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    pub ffmpeg: PathBuf,
    /// Seconds skipped at the start of the track (intros are rarely representative).
    pub offset_secs: f64,
    /// Maximum seconds of audio decoded.
    pub duration_secs: f64,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            ffmpeg: PathBuf::from("ffmpeg"),
            offset_secs: 30.0,
            duration_secs: 120.0,
        }
    }
}

impl FfmpegSource {
    fn decode_segment(&self, path: &Path, offset_secs: f64) -> Result<Vec<f32>, DecodeError> {
        let output = Command::new(&self.ffmpeg)
            .args(["-v", "error", "-nostdin", "-ss"])
            .arg(format!("{offset_secs:.3}"))
            .arg("-t")
            .arg(format!("{:.3}", self.duration_secs))
            .arg("-i")
            .arg(path)
            .args(["-f", "f32le", "-ac", "1", "-ar"])
            .arg(SAMPLE_RATE.to_string())
            .arg("-")
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    DecodeError::FfmpegNotFound(self.ffmpeg.display().to_string())
                }
                _ => DecodeError::Io(e),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DecodeError::Ffmpeg(stderr.trim().to_string()));
        }

        Ok(samples_from_le_bytes(&output.stdout))
    }
}

impl AudioSource for FfmpegSource {
    fn load(&self, path: &Path) -> Result<Vec<f32>, DecodeError> {
        let mut samples = self.decode_segment(path, self.offset_secs)?;

        // Short tracks: the offset can lie past the end of the file
        if samples.is_empty() && self.offset_secs > 0.0 {
            log::info!(
                "Offset exceeds length of {}, decoding from the start instead",
                path.display()
            );
            samples = self.decode_segment(path, 0.0)?;
        }

        if samples.is_empty() {
            return Err(DecodeError::Empty(path.display().to_string()));
        }
        Ok(samples)
    }
}

/// Convert raw little-endian `f32` bytes to samples. A trailing partial sample is dropped.
pub fn samples_from_le_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// Scale samples into [-1, 1] by the peak absolute amplitude.
/// A silent waveform (peak 0) is left unchanged.
pub fn normalize(samples: &mut [f32]) {
    let peak = samples.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
    let peak = if peak == 0.0 { 1.0 } else { peak };
    for s in samples.iter_mut() {
        *s /= peak;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_scales_to_unit_peak() {
        let mut samples = vec![0.25, -0.5, 0.1];
        normalize(&mut samples);
        assert!((samples[0] - 0.5).abs() < 1e-6);
        assert!((samples[1] + 1.0).abs() < 1e-6);
        assert!((samples[2] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_normalize_silence_is_untouched() {
        let mut samples = vec![0.0; 16];
        normalize(&mut samples);
        assert!(samples.iter().all(|s| *s == 0.0));
    }

    #[test]
    fn test_samples_from_le_bytes() {
        let mut bytes = Vec::new();
        for v in [0.5_f32, -1.0, 0.25] {
            bytes.extend_from_slice(&v.to_le_bytes());
        }
        bytes.push(0xff); // partial trailing sample
        assert_eq!(samples_from_le_bytes(&bytes), vec![0.5, -1.0, 0.25]);
    }

    #[test]
    fn test_missing_ffmpeg_binary() {
        let source = FfmpegSource {
            ffmpeg: PathBuf::from("/nonexistent/ffmpeg-binary"),
            ..FfmpegSource::default()
        };
        let err = source.load(Path::new("/tmp/whatever.mp3")).unwrap_err();
        assert!(matches!(err, DecodeError::FfmpegNotFound(_)));
    }
}
