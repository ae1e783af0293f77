use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use serde::Deserialize;

use crate::analyzer::ExtractSettings;
use crate::analyzer::decode::FfmpegSource;
use crate::categorize::LoopParams;
use crate::classifier::TrainParams;
use crate::similarity::Aggregation;

/// Application configuration loaded from TOML config file.
/// Every field has a default; the config file is optional.
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Library roots (used when `scan` has no CLI args).
    pub library: Vec<PathBuf>,
    /// Custom database path (overrides the per-library XDG default).
    pub db_path: Option<PathBuf>,
    /// Number of parallel workers. 0 = auto-detect (cores / 2, min 1).
    pub workers: usize,
    pub extraction: ExtractionConfig,
    pub similarity: SimilarityConfig,
    pub categorize: CategorizeConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ExtractionConfig {
    /// Frames averaged into one collapsed row.
    pub group_size: usize,
    /// Seconds skipped at the start of each track.
    pub offset_secs: f64,
    /// Seconds of audio decoded per track.
    pub duration_secs: f64,
    /// Raw frames kept per track for classifier training.
    pub max_frames: usize,
    pub ffmpeg: PathBuf,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            group_size: 100,
            offset_secs: 30.0,
            duration_secs: 120.0,
            max_frames: 250,
            ffmpeg: PathBuf::from("ffmpeg"),
        }
    }
}

impl ExtractionConfig {
    pub fn source(&self) -> FfmpegSource {
        FfmpegSource {
            ffmpeg: self.ffmpeg.clone(),
            offset_secs: self.offset_secs,
            duration_secs: self.duration_secs,
        }
    }

    /// Settings for re-extracting classifier frames.
    pub fn frame_settings(&self) -> ExtractSettings {
        ExtractSettings {
            group_size: self.group_size,
            keep_frames: Some(self.max_frames),
        }
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct SimilarityConfig {
    pub aggregation: Aggregation,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct CategorizeConfig {
    pub threshold: f64,
    pub escalation_size: usize,
    pub num_roots: usize,
    pub seed: u64,
    pub hidden_units: usize,
    pub learning_rate: f32,
    pub l2: f32,
    pub batch_size: usize,
    pub epochs: usize,
    pub patience: usize,
    pub max_training_secs: u64,
}

impl Default for CategorizeConfig {
    fn default() -> Self {
        let loop_params = LoopParams::default();
        let train = TrainParams::default();
        Self {
            threshold: loop_params.threshold,
            escalation_size: loop_params.escalation_size,
            num_roots: loop_params.num_roots,
            seed: loop_params.seed,
            hidden_units: train.hidden_units,
            learning_rate: train.learning_rate,
            l2: train.l2,
            batch_size: train.batch_size,
            epochs: train.epochs,
            patience: train.patience,
            max_training_secs: train.max_training_time.as_secs(),
        }
    }
}

impl CategorizeConfig {
    pub fn loop_params(&self) -> LoopParams {
        LoopParams {
            threshold: self.threshold,
            escalation_size: self.escalation_size,
            num_roots: self.num_roots,
            seed: self.seed,
            train: TrainParams {
                hidden_units: self.hidden_units,
                learning_rate: self.learning_rate,
                l2: self.l2,
                batch_size: self.batch_size,
                epochs: self.epochs,
                patience: self.patience,
                max_training_time: Duration::from_secs(self.max_training_secs),
                seed: self.seed,
                ..TrainParams::default()
            },
        }
    }
}

impl AppConfig {
    /// Load config from `~/.config/selecta/config.toml`.
    /// Returns default config if file doesn't exist.
    /// Logs a warning if the file exists but can't be parsed.
    pub fn load() -> Self {
        let config_path = Self::config_path();
        match config_path {
            Some(path) if path.exists() => {
                match std::fs::read_to_string(&path) {
                    Ok(contents) => {
                        match Self::parse(&contents) {
                            Ok(config) => {
                                log::info!("Loaded config from {}", path.display());
                                config
                            }
                            Err(e) => {
                                log::warn!(
                                    "Failed to parse {}: {}. Using defaults.",
                                    path.display(),
                                    e
                                );
                                Self::default()
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!(
                            "Failed to read {}: {}. Using defaults.",
                            path.display(),
                            e
                        );
                        Self::default()
                    }
                }
            }
            _ => {
                log::debug!("No config file found, using defaults");
                Self::default()
            }
        }
    }

    pub fn parse(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    /// Resolve worker count: 0 → auto-detect (cores / 2, min 1).
    pub fn resolve_workers(&self) -> usize {
        if self.workers > 0 {
            self.workers
        } else {
            let cores = std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(2);
            (cores / 2).max(1)
        }
    }

    /// Get the config file path.
    fn config_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", crate::APP_NAME)
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }
}

/// Resolve the default database path in the XDG data directory: one file
/// per library, named by the library key.
pub fn default_db_path(library_key: &str) -> PathBuf {
    let file = format!("library-{}.db", library_key);
    if let Some(dirs) = ProjectDirs::from("", "", crate::APP_NAME) {
        let data_dir = dirs.data_dir();
        std::fs::create_dir_all(data_dir).ok();
        data_dir.join(file)
    } else {
        // Fallback: current directory
        PathBuf::from(file)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = AppConfig::parse("").unwrap();
        assert!(config.library.is_empty());
        assert_eq!(config.workers, 0);
        assert_eq!(config.extraction.group_size, 100);
        assert_eq!(config.extraction.max_frames, 250);
        assert_eq!(config.similarity.aggregation, Aggregation::Mean);
        assert_eq!(config.categorize.threshold, 0.6);
        assert_eq!(config.categorize.escalation_size, 10);
        assert_eq!(config.categorize.num_roots, 5);
    }

    #[test]
    fn test_partial_sections() {
        let config = AppConfig::parse(
            r#"
            library = ["/music/sorted"]
            workers = 3

            [similarity]
            aggregation = "median"

            [categorize]
            threshold = 0.8
            epochs = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.library, vec![PathBuf::from("/music/sorted")]);
        assert_eq!(config.resolve_workers(), 3);
        assert_eq!(config.similarity.aggregation, Aggregation::Median);

        let params = config.categorize.loop_params();
        assert_eq!(params.threshold, 0.8);
        assert_eq!(params.escalation_size, 10);
        assert_eq!(params.train.epochs, 20);
        assert_eq!(params.train.hidden_units, 16);
        assert_eq!(params.train.seed, params.seed);
    }

    #[test]
    fn test_extraction_conversions() {
        let config = AppConfig::parse("[extraction]\noffset_secs = 0.0\nmax_frames = 40\n").unwrap();
        let source = config.extraction.source();
        assert_eq!(source.offset_secs, 0.0);
        assert_eq!(source.duration_secs, 120.0);
        let settings = config.extraction.frame_settings();
        assert_eq!(settings.keep_frames, Some(40));
        assert_eq!(settings.group_size, 100);
    }

    #[test]
    fn test_auto_workers() {
        let config = AppConfig::default();
        assert!(config.resolve_workers() >= 1);
    }

    #[test]
    fn test_bad_value_is_an_error() {
        assert!(AppConfig::parse("[similarity]\naggregation = \"mode\"\n").is_err());
    }
}
