use ndarray::Array2;
use serde::Serialize;

use crate::categorize::state::LabelState;
use crate::similarity::Aggregation;

/// Data for inserting or updating a track (scan phase).
pub struct NewTrack {
    pub file_path: String,
    /// Stable identity: hash of the absolute path.
    pub track_key: String,
    /// Display name, unique within the library.
    pub name: String,
    pub category: Option<String>,
    pub file_size: i64,
    pub file_modified: String,
    pub format: String,
}

/// A track row read from the database.
#[derive(Debug, Clone)]
pub struct TrackRow {
    pub id: i64,
    pub track_key: String,
    pub file_path: String,
    pub name: String,
    pub category: Option<String>,
}

/// A successfully analyzed track with its decoded collapsed embedding.
#[derive(Debug, Clone)]
pub struct StoredEmbedding {
    pub track_id: i64,
    pub track_key: String,
    pub name: String,
    pub file_path: String,
    pub category: Option<String>,
    pub collapsed: Array2<f32>,
}

/// Stored similarity matrix in position order, both halves filled.
pub struct SimilarityCache {
    pub aggregation: Aggregation,
    pub keys: Vec<String>,
    pub names: Vec<String>,
    pub distances: Array2<f64>,
}

/// Persisted outcome of categorization for one track.
#[derive(Debug, Clone, Serialize)]
pub struct LabelRow {
    pub track_id: i64,
    pub name: String,
    pub status: String,
    pub category: Option<String>,
    pub predicted_category: Option<String>,
    pub confidence: Option<f64>,
}

impl LabelRow {
    pub fn from_state(track_id: i64, name: &str, state: &LabelState) -> Self {
        Self {
            track_id,
            name: name.to_string(),
            status: state.status.as_str().to_string(),
            category: state.category.clone(),
            predicted_category: state.predicted_category.clone(),
            confidence: state.confidence,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistRow {
    pub id: i64,
    pub name: String,
    pub root: Option<String>,
    pub track_count: i64,
    pub created_at: String,
}

/// One playlist entry, in order.
#[derive(Debug, Clone, Serialize)]
pub struct PlaylistEntry {
    pub position: i64,
    pub name: String,
    pub file_path: String,
    pub distance: Option<f64>,
}

pub struct LibraryStats {
    pub total_tracks: i64,
    pub embedded_tracks: i64,
    pub failed_tracks: i64,
    pub similarity_tracks: i64,
    pub labeled_tracks: i64,
    pub playlists: i64,
    pub formats: Vec<(String, i64)>,
    pub categories: Vec<(String, i64)>,
}
