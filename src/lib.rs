pub mod analyzer;
pub mod bootstrap;
pub mod categorize;
pub mod classifier;
pub mod config;
pub mod db;
pub mod playlist;
pub mod scanner;
pub mod similarity;
pub mod track;

/// Audio file extensions we support (anything ffmpeg decodes; these are the ones we look for)
pub const SUPPORTED_EXTENSIONS: &[&str] = &[
    "mp3", "flac", "ogg", "wav",
    "aif", "aiff",
    "m4a", "aac", "opus", "wv",
];

/// Application name for XDG paths
pub const APP_NAME: &str = "selecta";

/// Sample rate every waveform is decoded to before embedding.
pub const SAMPLE_RATE: u32 = 16_000;
