//! Track arena: immutable per-track snapshots indexed by dense `TrackId`,
//! with the mutable label state kept in a parallel record.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use ndarray::{Array1, Array2, Axis, s};
use thiserror::Error;

use crate::analyzer::ExtractError;
use crate::analyzer::collapse::collapse;
use crate::categorize::state::LabelState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TrackId(pub u32);

impl TrackId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Embeddings derived from a track's audio.
#[derive(Debug, Clone)]
pub struct Embedding {
    /// Group-averaged frames (G × D), the persisted summary.
    pub collapsed: Array2<f32>,
    /// Mean of the collapsed rows (D).
    pub aggregated: Array1<f32>,
    /// Raw frames, held only while categorizing. Never persisted.
    pub frames: Option<Array2<f32>>,
}

impl Embedding {
    /// Collapse raw frames, keeping the first `keep_frames` rows in memory if requested.
    pub fn from_frames(
        frames: Array2<f32>,
        group_size: usize,
        keep_frames: Option<usize>,
    ) -> Result<Self, ExtractError> {
        let collapsed = collapse(&frames, group_size)?;
        let aggregated = collapsed.mean_axis(Axis(0)).ok_or(ExtractError::NoFrames)?;
        let frames = keep_frames.map(|limit| {
            let rows = frames.nrows().min(limit);
            frames.slice(s![..rows, ..]).to_owned()
        });
        Ok(Self { collapsed, aggregated, frames })
    }

    /// Rebuild from a cached collapsed matrix. `None` for an empty matrix.
    pub fn from_collapsed(collapsed: Array2<f32>) -> Option<Self> {
        let aggregated = collapsed.mean_axis(Axis(0))?;
        Some(Self { collapsed, aggregated, frames: None })
    }

    pub fn dim(&self) -> usize {
        self.collapsed.ncols()
    }
}

#[derive(Debug, Clone)]
pub struct Track {
    pub id: TrackId,
    /// Stable identity across runs (hash of the absolute path).
    pub key: String,
    pub name: String,
    pub path: PathBuf,
    pub embedding: Embedding,
    /// Known category, when the library provides one (oracle labels).
    pub true_category: Option<String>,
}

impl Track {
    pub fn new(key: impl Into<String>, name: impl Into<String>, path: impl Into<PathBuf>, embedding: Embedding) -> Self {
        Self {
            id: TrackId(0),
            key: key.into(),
            name: name.into(),
            path: path.into(),
            embedding,
            true_category: None,
        }
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.true_category = Some(category.into());
        self
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ArenaError {
    #[error("Duplicate track name: {0}")]
    DuplicateName(String),
    #[error("Duplicate track key: {0}")]
    DuplicateKey(String),
    #[error("Track arena is full ({0} tracks)")]
    Full(usize),
}

/// The id the track at position `len` would get.
fn next_id(len: usize) -> Result<TrackId, ArenaError> {
    u32::try_from(len).map(TrackId).map_err(|_| ArenaError::Full(len))
}

#[derive(Debug, Default)]
pub struct TrackArena {
    tracks: Vec<Track>,
    labels: Vec<LabelState>,
    by_name: HashMap<String, TrackId>,
    by_key: HashMap<String, TrackId>,
}

impl TrackArena {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track, assigning it the next `TrackId`. Its label starts uncategorized.
    pub fn insert(&mut self, mut track: Track) -> Result<TrackId, ArenaError> {
        if self.by_name.contains_key(&track.name) {
            return Err(ArenaError::DuplicateName(track.name));
        }
        if self.by_key.contains_key(&track.key) {
            return Err(ArenaError::DuplicateKey(track.key));
        }

        let id = next_id(self.tracks.len())?;
        track.id = id;
        self.by_name.insert(track.name.clone(), id);
        self.by_key.insert(track.key.clone(), id);
        self.tracks.push(track);
        self.labels.push(LabelState::default());
        Ok(id)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, id: TrackId) -> &Track {
        &self.tracks[id.index()]
    }

    pub fn id_of(&self, name: &str) -> Option<TrackId> {
        self.by_name.get(name).copied()
    }

    pub fn id_of_key(&self, key: &str) -> Option<TrackId> {
        self.by_key.get(key).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = TrackId> + use<> {
        (0..self.tracks.len() as u32).map(TrackId)
    }

    pub fn label(&self, id: TrackId) -> &LabelState {
        &self.labels[id.index()]
    }

    pub fn set_label(&mut self, id: TrackId, state: LabelState) {
        self.labels[id.index()] = state;
    }

    /// Tracks usable as training signal (roots and confident promotions).
    pub fn labeled(&self) -> Vec<TrackId> {
        self.ids().filter(|id| self.label(*id).is_categorized()).collect()
    }

    pub fn unlabeled(&self) -> Vec<TrackId> {
        self.ids().filter(|id| !self.label(*id).is_categorized()).collect()
    }
}
