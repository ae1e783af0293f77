//! Playlists: a root track followed by its closest neighbors.

use serde::Serialize;
use thiserror::Error;

use crate::db::Database;
use crate::db::models::PlaylistEntry;
use crate::similarity::{SimilarityError, SimilarityMatrix};

#[derive(Error, Debug)]
pub enum PlaylistError {
    #[error("Playlist size must be at least 1")]
    ZeroSize,
    #[error("Playlist '{0}' already exists")]
    Exists(String),
    #[error("Playlist '{0}' not found")]
    NotFound(String),
    #[error("No similarity matrix yet; run `selecta similarity` first")]
    NoMatrix,
    #[error("Similarity error: {0}")]
    Similarity(#[from] SimilarityError),
    #[error("Database error: {0}")]
    Db(#[from] crate::db::DbError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize)]
pub struct PlaylistTrack {
    pub name: String,
    /// Distance from the root; `None` for the root itself.
    pub distance: Option<f64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Playlist {
    pub name: String,
    pub tracks: Vec<PlaylistTrack>,
}

impl Playlist {
    pub fn root(&self) -> Option<&str> {
        self.tracks.first().map(|t| t.name.as_str())
    }
}

/// `root` and its `size - 1` nearest tracks. Shorter when the library is smaller.
pub fn generate(matrix: &SimilarityMatrix, name: &str, root: &str, size: usize) -> Result<Playlist, PlaylistError> {
    if size == 0 {
        return Err(PlaylistError::ZeroSize);
    }
    let neighbors = matrix.nearest(root, size - 1)?;

    let mut tracks = Vec::with_capacity(neighbors.len() + 1);
    tracks.push(PlaylistTrack {
        name: root.to_string(),
        distance: None,
    });
    tracks.extend(neighbors.into_iter().map(|n| PlaylistTrack {
        name: n.name,
        distance: Some(n.distance),
    }));

    Ok(Playlist {
        name: name.to_string(),
        tracks,
    })
}

/// Generate a playlist from the stored matrix and persist it.
pub fn create(db: &Database, name: &str, root: &str, size: usize) -> Result<Playlist, PlaylistError> {
    if db.playlist_entries(name)?.is_some() {
        return Err(PlaylistError::Exists(name.to_string()));
    }
    let cache = db.load_similarity()?.ok_or(PlaylistError::NoMatrix)?;
    let matrix = SimilarityMatrix::from_cache(cache)?;

    let playlist = generate(&matrix, name, root, size)?;
    let entries: Vec<(String, Option<f64>)> = playlist
        .tracks
        .iter()
        .map(|t| (t.name.clone(), t.distance))
        .collect();
    db.create_playlist(name, &entries)?;

    log::info!("Created playlist '{}' with {} tracks", name, playlist.tracks.len());
    Ok(playlist)
}

#[derive(Serialize)]
struct Export<'a> {
    name: &'a str,
    tracks: &'a [PlaylistEntry],
}

/// The stored playlist as pretty-printed JSON.
pub fn export_json(db: &Database, name: &str) -> Result<String, PlaylistError> {
    let entries = db
        .playlist_entries(name)?
        .ok_or_else(|| PlaylistError::NotFound(name.to_string()))?;
    Ok(serde_json::to_string_pretty(&Export { name, tracks: &entries })?)
}
